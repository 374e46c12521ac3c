//! ittscope 入口：serve 启动采样代理，status 打印最新指纹

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use ittscope_rs::fingerprint::{EngineSettings, FingerprintEngine};
use ittscope_rs::model::Config;
use ittscope_rs::proxy::{self, AppState};
use ittscope_rs::telemetry::{ModelStatsRow, Sample, TelemetryService, create_telemetry_router};

#[derive(Parser)]
#[command(name = "ittscope", version, about = "Anthropic Messages API 指纹采样代理")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value_t = Config::default_config_path().to_string())]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// 启动采样代理（默认）
    Serve,
    /// 打印最新样本与各模型基线
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config =
        Config::load(&cli.config).with_context(|| format!("加载配置失败: {}", cli.config))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Status => status(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let engine = Arc::new(FingerprintEngine::new(EngineSettings {
        user_selected_model: config.user_selected_model.clone().unwrap_or_default(),
        blocked_models: config.blocked_models.clone(),
        force_thinking: config.force_thinking,
        force_thinking_budget: config.force_thinking_budget,
        force_interleaved: config.force_interleaved,
        whisper_enabled: config.whisper_enabled,
        capture_ttl_ms: config.capture_ttl_secs as f64 * 1000.0,
    }));
    let telemetry = Arc::new(TelemetryService::new(&config.db_path)?);
    let client = proxy::build_client(config.proxy_url.as_deref(), config.tls_backend)?;

    // 定期回收客户端断开后遗留的捕获
    let sweep_engine = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let swept = sweep_engine.sweep_stale();
            if swept > 0 {
                tracing::warn!("清理了 {} 个过期捕获", swept);
            }
        }
    });

    let api = create_telemetry_router(config.admin_api_key.clone(), telemetry.clone()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let app = proxy::create_proxy_router(AppState {
        engine: engine.clone(),
        telemetry,
        client,
        upstream_base_url: config.upstream_base_url.clone(),
    })
    .nest("/api/fingerprint", api);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", addr))?;

    info!("ittscope 采样代理启动: http://{}", addr);
    info!("上游: {}", config.upstream_base_url);
    info!("样本库: {}", config.db_path);
    info!("会话: {}", engine.session_id());

    axum::serve(listener, app).await?;
    Ok(())
}

async fn status(config: Config) -> anyhow::Result<()> {
    let telemetry = TelemetryService::new(&config.db_path)?;
    let Some(sample) = telemetry.latest().await? else {
        println!("还没有任何样本");
        return Ok(());
    };
    let models = telemetry.model_stats().await?;

    println!("{}", render_status_line(&sample, &models));
    if !models.is_empty() {
        println!("模型基线:");
        for row in &models {
            println!(
                "  {:<28} 样本 {:>4}  ITT {:.1}+/-{:.1}ms  {:.1} tok/s  Trn {:.0}% / TPU {:.0}% / GPU {:.0}%",
                row.model,
                row.samples_count,
                row.itt_mean_baseline,
                row.itt_std_baseline,
                row.tps_baseline,
                row.trainium_pct,
                row.tpu_pct,
                row.gpu_pct
            );
        }
    }
    Ok(())
}

/// 单行状态：模型状态 | 后端 | ITT | 思考档位 | 缓存 | token 流量 | 边缘节点 | 配额
fn render_status_line(sample: &Sample, models: &[ModelStatsRow]) -> String {
    let mut parts = Vec::new();

    let effective_model = if sample.model_response.is_empty() {
        &sample.model_requested
    } else {
        &sample.model_response
    };
    let model_short = short_model(effective_model);
    if sample.is_subagent {
        parts.push(format!(
            "SUB:{}->{}",
            short_model(&sample.model_requested),
            model_short
        ));
    } else {
        parts.push(format!("DIRECT:{}", model_short));
    }

    let backend_abbrev = match sample.classified_backend.as_str() {
        "trainium" => "Trn",
        "tpu" => "TPU",
        "gpu" => "GPU",
        _ => "?",
    };
    parts.push(format!("{}{:.0}%", backend_abbrev, sample.confidence));

    if sample.itt_mean_ms > 0.0 {
        let mut itt = format!("ITT:{:.0}+/-{:.0}", sample.itt_mean_ms, sample.itt_std_ms);
        if sample.thinking_itt_mean_ms > 0.0 || sample.text_itt_mean_ms > 0.0 {
            itt.push_str(&format!(
                " Thk{:.0}/Txt{:.0}",
                sample.thinking_itt_mean_ms, sample.text_itt_mean_ms
            ));
        }
        parts.push(itt);
    }

    let budget = sample.thinking_budget_requested;
    let tier_code = if budget >= 20_000 {
        "[R]"
    } else if budget >= 8_000 {
        "[O]"
    } else if budget >= 1024 {
        "[Y]"
    } else {
        "[-]"
    };
    let budget_k = if budget >= 1000 {
        format!("{}k", budget / 1000)
    } else {
        budget.to_string()
    };
    parts.push(format!(
        "{}{}@{:.0}%",
        tier_code, budget_k, sample.thinking_utilization
    ));

    let model_avg = models
        .iter()
        .find(|m| m.model == *effective_model)
        .map(|m| m.cache_efficiency_avg)
        .unwrap_or(0.0);
    parts.push(format!("C:{:.0}/{:.0}avg", sample.cache_efficiency, model_avg));

    if sample.input_tokens > 0 || sample.output_tokens > 0 {
        parts.push(format!(
            "{}->{}",
            fmt_tokens(sample.input_tokens),
            fmt_tokens(sample.output_tokens)
        ));
    }

    if !sample.cf_edge_location.is_empty() {
        parts.push(sample.cf_edge_location.clone());
    }

    if sample.rl_5h_utilization > 0.0 {
        let bind = if sample.rl_binding_window.contains("five") {
            "5h"
        } else if sample.rl_binding_window.contains("seven") {
            "7d"
        } else {
            "?"
        };
        parts.push(format!(
            "Quota 5h:{:.1}% 7d:{:.1}% Bind:{}",
            sample.rl_5h_utilization * 100.0,
            sample.rl_7d_utilization * 100.0,
            bind
        ));
    }

    parts.join(" | ")
}

fn fmt_tokens(n: i64) -> String {
    if n >= 1000 {
        format!("{:.1}k", n as f64 / 1000.0)
    } else {
        n.to_string()
    }
}

/// 模型短名：Op4.5、So3.7、Ha3.5,识别不了的保留前 8 个字符
fn short_model(model: &str) -> String {
    let lower = model.to_lowercase();
    let abbrev = if lower.contains("opus") {
        "Op"
    } else if lower.contains("sonnet") {
        "So"
    } else if lower.contains("haiku") {
        "Ha"
    } else {
        return model.chars().take(8).collect();
    };
    let version = if model.contains("4-5") || model.contains("4.5") {
        "4.5"
    } else if model.contains("4-1") || model.contains("4.1") {
        "4.1"
    } else if model.contains("4-0") || model.contains("4.0") {
        "4"
    } else if model.contains("3-7") || model.contains("3.7") {
        "3.7"
    } else if model.contains("3-5") || model.contains("3.5") {
        "3.5"
    } else {
        ""
    };
    format!("{}{}", abbrev, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_tokens() {
        assert_eq!(fmt_tokens(999), "999");
        assert_eq!(fmt_tokens(1000), "1.0k");
        assert_eq!(fmt_tokens(45_300), "45.3k");
    }

    #[test]
    fn test_short_model() {
        assert_eq!(short_model("claude-opus-4-5-20260115"), "Op4.5");
        assert_eq!(short_model("claude-sonnet-3-7"), "So3.7");
        assert_eq!(short_model("claude-haiku-3-5-20241022"), "Ha3.5");
        assert_eq!(short_model("gpt-4o-mini"), "gpt-4o-m");
    }

    #[test]
    fn test_render_status_line_direct() {
        let sample = Sample {
            model_requested: "claude-opus-4-5".to_string(),
            model_response: "claude-opus-4-5".to_string(),
            classified_backend: "trainium".to_string(),
            confidence: 74.3,
            itt_mean_ms: 44.0,
            itt_std_ms: 3.0,
            thinking_itt_mean_ms: 45.0,
            text_itt_mean_ms: 40.0,
            thinking_budget_requested: 8_000,
            thinking_utilization: 15.0,
            cache_efficiency: 80.0,
            input_tokens: 1000,
            output_tokens: 35,
            cf_edge_location: "NRT".to_string(),
            rl_5h_utilization: 0.37,
            rl_7d_utilization: 0.12,
            rl_binding_window: "five_hour".to_string(),
            ..Sample::default()
        };
        let line = render_status_line(&sample, &[]);
        assert_eq!(
            line,
            "DIRECT:Op4.5 | Trn74% | ITT:44+/-3 Thk45/Txt40 | [O]8k@15% | C:80/0avg | 1.0k->35 | NRT | Quota 5h:37.0% 7d:12.0% Bind:5h"
        );
    }

    #[test]
    fn test_render_status_line_subagent() {
        let sample = Sample {
            model_requested: "claude-opus-4-5".to_string(),
            model_response: "claude-haiku-3-5".to_string(),
            is_subagent: true,
            classified_backend: "gpu".to_string(),
            confidence: 61.0,
            ..Sample::default()
        };
        let line = render_status_line(&sample, &[]);
        assert!(line.starts_with("SUB:Op4.5->Ha3.5 | GPU61%"));
        // 没有 ITT 数据时该段整体省略
        assert!(!line.contains("ITT:"));
    }
}
