//! 指纹样本数据模型
//!
//! 一条完成的流式调用产出一行 Sample,落库后不再修改,是历史事实
//! 记录;聚合表全部由 Sample 重放得出。

use serde::{Deserialize, Serialize};

/// 完整指纹样本
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// 落库前为 0,由存储层分配
    #[serde(default)]
    pub id: i64,
    pub timestamp: String,
    pub session_id: String,

    // 模型身份
    pub model_requested: String,
    pub model_response: String,
    pub model_match: bool,
    pub model_ui_selected: String,
    pub ui_api_mismatch: bool,
    pub is_subagent: bool,
    pub subagent_type: Option<String>,

    // 思考阶段
    pub thinking_enabled: bool,
    pub thinking_budget_requested: i64,
    pub thinking_budget_tier: String,
    pub thinking_chunk_count: i64,
    pub thinking_tokens_used: i64,
    pub thinking_utilization: f64,
    pub thinking_duration_ms: f64,
    pub thinking_itt_mean_ms: f64,
    pub thinking_itt_std_ms: f64,

    // 文本阶段
    pub text_chunk_count: i64,
    pub text_duration_ms: f64,
    pub text_itt_mean_ms: f64,
    pub text_itt_std_ms: f64,

    // token 与缓存
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_efficiency: f64,

    // 整条流时序
    pub ttft_ms: f64,
    pub total_time_ms: f64,
    pub itt_mean_ms: f64,
    pub itt_std_ms: f64,
    pub itt_min_ms: f64,
    pub itt_max_ms: f64,
    pub itt_p50_ms: f64,
    pub itt_p90_ms: f64,
    pub itt_p99_ms: f64,
    pub variance_coef: f64,
    pub tokens_per_sec: f64,
    pub num_chunks: i64,

    // 分类输出
    pub classified_backend: String,
    pub confidence: f64,
    pub location: String,
    /// 各打分维度的依据,JSON 字符串数组
    pub backend_evidence: String,
    pub speculative_decoding: bool,
    pub speculative_type: Option<String>,

    // 基础设施元数据
    pub request_id: String,
    pub stop_reason: String,
    pub envoy_time_ms: f64,
    pub cf_ray: String,
    pub cf_edge_location: String,

    // 限速快照
    pub rl_5h_utilization: f64,
    pub rl_5h_reset: i64,
    pub rl_5h_status: String,
    pub rl_7d_utilization: f64,
    pub rl_7d_reset: i64,
    pub rl_7d_status: String,
    pub rl_overall_status: String,
    pub rl_binding_window: String,
    pub rl_fallback_pct: f64,
    pub rl_overage_status: String,
}
