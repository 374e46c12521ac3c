use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TlsBackend {
    Rustls,
    NativeTls,
}

impl Default for TlsBackend {
    fn default() -> Self {
        Self::Rustls
    }
}

/// ittscope 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 上游 API 基地址
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,

    /// 样本数据库路径
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Admin API 密钥（可选，未配置时指纹查询 API 不鉴权）
    #[serde(default)]
    pub admin_api_key: Option<String>,

    /// UI 侧选择的模型，用于与请求里的模型做一致性对比（可选）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_selected_model: Option<String>,

    /// 被拦截的模型列表，命中后直接 403
    #[serde(default)]
    pub blocked_models: Vec<String>,

    /// 强制所有请求开启扩展思考
    #[serde(default)]
    pub force_thinking: bool,

    /// 强制思考预算；0 表示强制关闭思考
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_thinking_budget: Option<i64>,

    /// 强制开启交错思考
    #[serde(default)]
    pub force_interleaved: bool,

    /// 响应出现谄媚模式时，向下一个请求注入提醒
    #[serde(default)]
    pub whisper_enabled: bool,

    /// 未完成流的回收时限（秒）
    #[serde(default = "default_capture_ttl_secs")]
    pub capture_ttl_secs: u64,

    /// HTTP 代理地址（可选）
    /// 支持格式: http://host:port, https://host:port, socks5://host:port
    #[serde(default)]
    pub proxy_url: Option<String>,

    #[serde(default = "default_tls_backend")]
    pub tls_backend: TlsBackend,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_upstream_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_db_path() -> String {
    "fingerprint.db".to_string()
}

fn default_capture_ttl_secs() -> u64 {
    600
}

fn default_tls_backend() -> TlsBackend {
    TlsBackend::Rustls
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream_base_url: default_upstream_base_url(),
            db_path: default_db_path(),
            admin_api_key: None,
            user_selected_model: None,
            blocked_models: Vec::new(),
            force_thinking: false,
            force_thinking_budget: None,
            force_interleaved: false,
            whisper_enabled: false,
            capture_ttl_secs: default_capture_ttl_secs(),
            proxy_url: None,
            tls_backend: default_tls_backend(),
            config_path: None,
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// 获取配置文件路径（如果有）
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 将当前配置写回原始配置文件
    pub fn save(&self) -> anyhow::Result<()> {
        let path = self
            .config_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("配置文件路径未知，无法保存配置"))?;

        let content = serde_json::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .with_context(|| format!("写入配置文件失败: {}", path.display()))?;
        Ok(())
    }
}
