//! 采集引擎:请求/响应生命周期回调与样本组装
//!
//! 引擎持有单调时钟原点、连接注册表与会话状态,代理层在四个时机
//! 调用它:请求到达、响应头返回、流式分块到达、响应结束。所有
//! 时间戳都是相对时钟原点的毫秒数,与系统时钟调整无关。

use std::time::Instant;

use http::HeaderMap;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::capture::{CaptureKey, CaptureRegistry, StreamingCapture};
use super::classify::classify_backend;
use super::event::process_event;
use super::speculative::detect_speculative;
use super::stats::{IttStats, positive_deltas, round_dp};
use crate::telemetry::model::Sample;
use crate::whisper::SycophancyMonitor;

/// interleaved thinking 的 beta 特性名,随预算上限一起注入
const INTERLEAVED_BETA_FEATURE: &str = "interleaved-thinking-2025-05-14";

/// interleaved 模式下思考预算的上限值
const INTERLEAVED_BUDGET: i64 = 200_000;

/// 引擎行为开关,启动时从配置读入后不再变化
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    /// 用户在界面上选择的模型,用于检测客户端静默换模型
    pub user_selected_model: String,
    /// 命中任一子串的请求模型直接拒绝
    pub blocked_models: Vec<String>,
    /// 强制开启思考模式
    pub force_thinking: bool,
    /// 强制调整思考预算;Some(0) 表示强制关闭思考
    pub force_thinking_budget: Option<i64>,
    /// 注入 interleaved beta 头并把预算抬到上限
    pub force_interleaved: bool,
    /// 谄媚检测与提醒注入
    pub whisper_enabled: bool,
    /// 遗留捕获的回收阈值(毫秒)
    pub capture_ttl_ms: f64,
}

/// 请求回调的裁决结果
#[derive(Debug)]
pub enum RequestDecision {
    /// 放行转发
    Forward {
        key: CaptureKey,
        /// 请求体被改写时为新字节,未改写为 None(原样转发)
        body: Option<Vec<u8>>,
        /// 需要覆盖写回的 anthropic-beta 头
        beta_header: Option<String>,
    },
    /// 模型命中封禁规则,调用方应返回 403 与此错误体
    Block { body: String },
}

/// 指纹采集引擎,进程内单例
pub struct FingerprintEngine {
    settings: EngineSettings,
    registry: CaptureRegistry,
    session_id: String,
    /// 单调时钟原点,全部毫秒时间戳的参照系
    epoch: Instant,
    /// 会话主模型:第一条 opus 请求的模型名,用于识别子代理
    primary_model: Mutex<Option<String>>,
    monitor: SycophancyMonitor,
}

impl FingerprintEngine {
    pub fn new(settings: EngineSettings) -> Self {
        let session_id = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        Self {
            registry: CaptureRegistry::new(settings.capture_ttl_ms),
            settings,
            session_id,
            epoch: Instant::now(),
            primary_model: Mutex::new(None),
            monitor: SycophancyMonitor::new(),
        }
    }

    /// 当前单调时钟毫秒
    pub fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn active_captures(&self) -> usize {
        self.registry.len()
    }

    /// 回收客户端断开后遗留的捕获,返回回收数量
    pub fn sweep_stale(&self) -> usize {
        self.registry.sweep(self.now_ms())
    }

    /// 请求回调:解析请求体、执行封禁/强制策略、登记捕获
    ///
    /// 请求体解析失败不阻断转发,模型名记为 unknown 继续计时。
    pub fn on_request(&self, body: &[u8], existing_beta: Option<&str>) -> RequestDecision {
        let mut capture = StreamingCapture {
            start_time_ms: self.now_ms(),
            model_requested: "unknown".to_string(),
            model_ui_selected: self.settings.user_selected_model.clone(),
            ..StreamingCapture::default()
        };

        let mut parsed: Option<Value> = match serde_json::from_slice(body) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("请求体解析失败,按未知模型继续计时: {err}");
                None
            }
        };
        let mut modified = false;
        let mut beta_header = None;
        let mut original_budget = 0i64;

        if let Some(root) = parsed.as_mut().and_then(Value::as_object_mut) {
            capture.model_requested = root
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();

            let model_lower = capture.model_requested.to_ascii_lowercase();
            if let Some(rule) = self
                .settings
                .blocked_models
                .iter()
                .find(|rule| !rule.is_empty() && model_lower.contains(&rule.to_ascii_lowercase()))
            {
                error!("模型 {} 命中封禁规则 {rule},拒绝转发", capture.model_requested);
                let body = json!({
                    "error": {
                        "type": "blocked",
                        "message": format!(
                            "model {} is blocked by proxy policy",
                            capture.model_requested
                        ),
                    }
                })
                .to_string();
                return RequestDecision::Block { body };
            }

            // 客户端静默换模型:界面选择与实际请求的系别不一致
            if !self.settings.user_selected_model.is_empty()
                && self.settings.user_selected_model != "unknown"
                && let (Some(ui), Some(api)) = (
                    model_family(&self.settings.user_selected_model),
                    model_family(&capture.model_requested),
                )
                && ui != api
            {
                capture.ui_api_mismatch = true;
                warn!(
                    "界面选择 {} 但客户端实际请求 {}",
                    self.settings.user_selected_model, capture.model_requested
                );
            }

            if let Some(thinking) = root.get("thinking")
                && thinking.get("type").and_then(Value::as_str) == Some("enabled")
            {
                capture.thinking_enabled = true;
                capture.thinking_budget = thinking
                    .get("budget_tokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                original_budget = capture.thinking_budget;
            }

            let force_budget = self.settings.force_thinking_budget;
            if self.settings.force_thinking || force_budget.is_some() {
                if !root.contains_key("thinking") {
                    root.insert("thinking".to_string(), json!({}));
                }

                if self.settings.force_thinking {
                    if let Some(thinking) = root.get_mut("thinking").and_then(Value::as_object_mut)
                    {
                        thinking.insert("type".to_string(), json!("enabled"));
                    }
                    capture.thinking_enabled = true;
                    warn!("强制模式: 开启思考");
                }

                match force_budget {
                    Some(0) => {
                        root.insert("thinking".to_string(), json!({"type": "disabled"}));
                        capture.thinking_enabled = false;
                        capture.thinking_budget = 0;
                        warn!("强制模式: 关闭思考");
                    }
                    Some(budget) => {
                        if let Some(thinking) =
                            root.get_mut("thinking").and_then(Value::as_object_mut)
                        {
                            thinking.insert("type".to_string(), json!("enabled"));
                            thinking.insert("budget_tokens".to_string(), json!(budget));
                        }
                        capture.thinking_enabled = true;
                        capture.thinking_budget = budget;
                        warn!("强制模式: 思考预算 {original_budget} 调整为 {budget}");
                    }
                    None => {}
                }

                if self.settings.force_interleaved {
                    if let Some(header) = merge_beta_feature(existing_beta, INTERLEAVED_BETA_FEATURE)
                    {
                        beta_header = Some(header);
                        warn!("强制模式: 注入 {INTERLEAVED_BETA_FEATURE} beta 头");
                    }
                    if let Some(thinking) = root.get_mut("thinking").and_then(Value::as_object_mut)
                    {
                        thinking.insert("budget_tokens".to_string(), json!(INTERLEAVED_BUDGET));
                    }
                    capture.thinking_budget = INTERLEAVED_BUDGET;
                    warn!("强制模式: 思考预算提升至 {INTERLEAVED_BUDGET}");
                }

                modified = true;
            }

            // 上一条响应检出谄媚信号时,把提醒追加进本次请求的 system
            if self.settings.whisper_enabled
                && let Some(whisper) = self.monitor.take_whisper()
            {
                append_system_text(root, &whisper);
                info!("注入节制提醒,累计检出 {} 次", self.monitor.detection_count());
                modified = true;
            }
        }

        if capture.model_requested.to_ascii_lowercase().contains("opus") {
            let mut primary = self.primary_model.lock();
            if primary.is_none() {
                *primary = Some(capture.model_requested.clone());
            }
        }

        let tier_str = if capture.thinking_enabled {
            format!(
                " [{}:{}]",
                tier_display(thinking_tier(capture.thinking_budget)),
                capture.thinking_budget
            )
        } else {
            String::new()
        };
        let force_str = if modified { " [改写]" } else { "" };
        info!("请求 {}{tier_str}{force_str}", capture.model_requested);

        let body_out = match (&parsed, modified) {
            (Some(value), true) => serde_json::to_vec(value).ok(),
            _ => None,
        };
        let key = self.registry.begin(capture);
        RequestDecision::Forward {
            key,
            body: body_out,
            beta_header,
        }
    }

    /// 响应头回调:判定是否事件流并采集基础设施元数据
    ///
    /// 返回 true 表示上游声明了 text/event-stream,调用方应安装分块
    /// 观察;非流式响应只标记,不采集头部。
    pub fn on_response_headers(&self, key: CaptureKey, headers: &HeaderMap) -> bool {
        let streaming = header_str(headers, "content-type").contains("text/event-stream");
        self.registry
            .with(key, |capture| {
                capture.streaming_response = streaming;
                if !streaming {
                    return false;
                }

                let request_id = header_str(headers, "request-id");
                capture.request_id = if request_id.is_empty() {
                    header_str(headers, "x-request-id")
                } else {
                    request_id
                }
                .to_string();
                capture.envoy_time_ms = header_f64(headers, "x-envoy-upstream-service-time");
                capture.cf_ray = header_str(headers, "cf-ray").to_string();
                capture.cf_edge_location = capture
                    .cf_ray
                    .rsplit('-')
                    .next()
                    .unwrap_or("")
                    .to_string();

                let rl = &mut capture.rate_limit;
                rl.five_hour_utilization =
                    header_f64(headers, "anthropic-ratelimit-unified-5h-utilization");
                rl.five_hour_reset = header_i64(headers, "anthropic-ratelimit-unified-5h-reset");
                rl.five_hour_status =
                    header_str(headers, "anthropic-ratelimit-unified-5h-status").to_string();
                rl.seven_day_utilization =
                    header_f64(headers, "anthropic-ratelimit-unified-7d-utilization");
                rl.seven_day_reset = header_i64(headers, "anthropic-ratelimit-unified-7d-reset");
                rl.seven_day_status =
                    header_str(headers, "anthropic-ratelimit-unified-7d-status").to_string();
                rl.overall_status =
                    header_str(headers, "anthropic-ratelimit-unified-status").to_string();
                rl.binding_window =
                    header_str(headers, "anthropic-ratelimit-unified-representative-claim")
                        .to_string();
                rl.fallback_pct =
                    header_f64(headers, "anthropic-ratelimit-unified-fallback-percentage");
                rl.overage_status =
                    header_str(headers, "anthropic-ratelimit-unified-overage-status").to_string();
                if rl.five_hour_utilization > 0.0 {
                    info!(
                        "限速快照: 5h={:.1}% 7d={:.1}% 状态={} 计费窗口={}",
                        rl.five_hour_utilization * 100.0,
                        rl.seven_day_utilization * 100.0,
                        rl.overall_status,
                        rl.binding_window
                    );
                }
                true
            })
            .unwrap_or(false)
    }

    /// 流式分块回调:记录到达时刻并重组其中的完整事件
    pub fn on_stream_chunk(&self, key: CaptureKey, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let now = self.now_ms();
        self.registry.with(key, |capture| {
            if capture.first_chunk_ms == 0.0 {
                capture.first_chunk_ms = now;
            }
            capture.last_chunk_ms = now;
            let events = capture.sse.feed(chunk);
            for event in &events {
                process_event(capture, event, now);
            }
        });
    }

    /// 终端回调:取出捕获、补齐缓冲区尾部、组装样本
    ///
    /// 返回 None 表示该连接不产出样本(非流式响应或没有计时数据)。
    pub fn on_response_complete(&self, key: CaptureKey) -> Option<Sample> {
        let capture = self.registry.take(key)?;
        self.assemble_sample(capture, self.now_ms())
    }

    fn assemble_sample(&self, mut capture: StreamingCapture, end_ms: f64) -> Option<Sample> {
        // 缓冲区里可能剩一个没有终结符的事件块
        let tail = capture.sse.finish();
        for event in &tail {
            process_event(&mut capture, event, end_ms);
        }

        if capture.first_chunk_ms == 0.0 {
            if capture.streaming_response {
                warn!(
                    "丢弃样本: 事件流没有产生任何计时数据 (chunks={})",
                    capture.chunks.len()
                );
            } else {
                debug!("丢弃样本: 非流式响应 (chunks={})", capture.chunks.len());
            }
            return None;
        }

        if capture.model_response.is_empty() {
            capture.model_response = capture.model_requested.clone();
        }

        let total_time_ms = end_ms - capture.start_time_ms;
        let ttft_ms = capture.first_chunk_ms - capture.start_time_ms;

        let all_itts = positive_deltas(&capture.chunk_timestamps());
        let thinking_itts = positive_deltas(&capture.thinking_timestamps());
        let text_itts = positive_deltas(&capture.text_timestamps());

        let itt = IttStats::from_deltas(&all_itts);
        let thinking_itt = IttStats::from_deltas(&thinking_itts);
        let text_itt = IttStats::from_deltas(&text_itts);

        let thinking_duration_ms = phase_duration(&capture.thinking_timestamps());
        let text_duration_ms = phase_duration(&capture.text_timestamps());

        let gen_time_s = (capture.last_chunk_ms - capture.first_chunk_ms) / 1000.0;
        let tps = if gen_time_s > 0.0 {
            capture.output_tokens as f64 / gen_time_s
        } else {
            0.0
        };

        let classification = classify_backend(&itt, tps);
        let speculative = detect_speculative(&all_itts);

        let model_match = capture
            .model_requested
            .eq_ignore_ascii_case(&capture.model_response);
        let mut is_subagent = false;
        let mut subagent_type = None;
        if let Some(primary) = self.primary_model.lock().as_deref()
            && !capture.model_response.eq_ignore_ascii_case(primary)
        {
            is_subagent = true;
            let lower = capture.model_response.to_ascii_lowercase();
            subagent_type = Some(
                if lower.contains("haiku") {
                    "haiku"
                } else if lower.contains("sonnet") {
                    "sonnet"
                } else {
                    "other"
                }
                .to_string(),
            );
        }

        // cache_read 可以超过 input_tokens(缓存上下文),封顶 100
        let cache_efficiency = if capture.input_tokens > 0 {
            (capture.cache_read_tokens as f64 / capture.input_tokens as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        let mut thinking_tokens_used = 0;
        let mut thinking_utilization = 0.0;
        if capture.thinking_enabled && capture.thinking_budget > 0 && capture.output_tokens > 0 {
            // API 报告的 output_tokens 含思考 token,按它算利用率
            thinking_tokens_used = capture.output_tokens;
            thinking_utilization =
                thinking_tokens_used as f64 / capture.thinking_budget as f64 * 100.0;
        }

        if self.settings.whisper_enabled
            && let Some(result) = self.monitor.observe(&capture.text_content)
        {
            info!(
                "检出谄媚信号 {:?},分数 {:.2},等级 {}",
                result.signals,
                result.score,
                result.level.as_str()
            );
        }

        let thinking_budget_tier = if capture.thinking_enabled {
            thinking_tier(capture.thinking_budget).to_string()
        } else {
            "none".to_string()
        };
        let sample = Sample {
            id: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            session_id: self.session_id.clone(),
            model_requested: capture.model_requested.clone(),
            model_response: capture.model_response.clone(),
            model_match,
            model_ui_selected: capture.model_ui_selected.clone(),
            ui_api_mismatch: capture.ui_api_mismatch,
            is_subagent,
            subagent_type,
            thinking_enabled: capture.thinking_enabled || capture.has_thinking,
            thinking_budget_requested: capture.thinking_budget,
            thinking_budget_tier,
            thinking_chunk_count: capture.thinking_chunks.len() as i64,
            thinking_tokens_used,
            thinking_utilization: round_dp(thinking_utilization, 1),
            thinking_duration_ms: round_dp(thinking_duration_ms, 1),
            thinking_itt_mean_ms: thinking_itt.mean,
            thinking_itt_std_ms: thinking_itt.std,
            text_chunk_count: capture.text_chunks.len() as i64,
            text_duration_ms: round_dp(text_duration_ms, 1),
            text_itt_mean_ms: text_itt.mean,
            text_itt_std_ms: text_itt.std,
            input_tokens: capture.input_tokens,
            output_tokens: capture.output_tokens,
            cache_creation_tokens: capture.cache_creation_tokens,
            cache_read_tokens: capture.cache_read_tokens,
            cache_efficiency: round_dp(cache_efficiency, 1),
            ttft_ms: round_dp(ttft_ms, 1),
            total_time_ms: round_dp(total_time_ms, 1),
            itt_mean_ms: itt.mean,
            itt_std_ms: itt.std,
            itt_min_ms: itt.min,
            itt_max_ms: itt.max,
            itt_p50_ms: itt.p50,
            itt_p90_ms: itt.p90,
            itt_p99_ms: itt.p99,
            variance_coef: itt.variance_coef,
            tokens_per_sec: round_dp(tps, 1),
            num_chunks: capture.chunks.len() as i64,
            classified_backend: classification.backend.clone(),
            confidence: classification.confidence,
            location: classification.location.clone(),
            backend_evidence: serde_json::to_string(&classification.evidence)
                .unwrap_or_default(),
            speculative_decoding: speculative.is_some(),
            speculative_type: speculative.map(|p| p.as_str().to_string()),
            request_id: capture.request_id.clone(),
            stop_reason: capture.stop_reason.clone(),
            envoy_time_ms: capture.envoy_time_ms,
            cf_ray: capture.cf_ray.clone(),
            cf_edge_location: capture.cf_edge_location.clone(),
            rl_5h_utilization: capture.rate_limit.five_hour_utilization,
            rl_5h_reset: capture.rate_limit.five_hour_reset,
            rl_5h_status: capture.rate_limit.five_hour_status.clone(),
            rl_7d_utilization: capture.rate_limit.seven_day_utilization,
            rl_7d_reset: capture.rate_limit.seven_day_reset,
            rl_7d_status: capture.rate_limit.seven_day_status.clone(),
            rl_overall_status: capture.rate_limit.overall_status.clone(),
            rl_binding_window: capture.rate_limit.binding_window.clone(),
            rl_fallback_pct: capture.rate_limit.fallback_pct,
            rl_overage_status: capture.rate_limit.overage_status.clone(),
        };

        let state = if model_match {
            "DIRECT"
        } else if is_subagent {
            "SUB"
        } else {
            "ROUTED"
        };
        let think_str = if sample.thinking_enabled {
            format!(" {}", tier_display(&sample.thinking_budget_tier))
        } else {
            String::new()
        };
        let mut itt_str = format!("ITT:{:.0}±{:.0}ms", itt.mean, itt.std);
        if thinking_itt.mean > 0.0 || text_itt.mean > 0.0 {
            itt_str.push_str(&format!(
                " (思考:{:.0}/文本:{:.0})",
                thinking_itt.mean, text_itt.mean
            ));
        }
        let backend_tag: String = classification
            .backend
            .chars()
            .take(3)
            .collect::<String>()
            .to_uppercase();
        info!(
            "{state} {}{think_str} | {backend_tag} {:.0}% | {itt_str} | {:.0}tok/s | 输入:{} 输出:{} 缓存:{:.0}%",
            capture.model_response,
            classification.confidence,
            tps,
            capture.input_tokens,
            capture.output_tokens,
            cache_efficiency
        );

        Some(sample)
    }
}

/// 思考预算分档
pub fn thinking_tier(budget: i64) -> &'static str {
    if budget >= 20_000 {
        "ultra"
    } else if budget >= 8_000 {
        "enhanced"
    } else if budget >= 1024 {
        "basic"
    } else {
        "none"
    }
}

fn tier_display(tier: &str) -> &'static str {
    match tier {
        "ultra" => "ULTRATHINK",
        "enhanced" => "ENHANCED",
        "basic" => "BASIC",
        _ => "DISABLED",
    }
}

/// opus/sonnet/haiku 系别归一,识别不出返回 None
fn model_family(model: &str) -> Option<&'static str> {
    let lower = model.to_ascii_lowercase();
    if lower.contains("opus") {
        Some("opus")
    } else if lower.contains("sonnet") {
        Some("sonnet")
    } else if lower.contains("haiku") {
        Some("haiku")
    } else {
        None
    }
}

/// 把特性合并进逗号分隔的 beta 头;已存在时返回 None(无需写回)
fn merge_beta_feature(existing: Option<&str>, feature: &str) -> Option<String> {
    let mut features: Vec<&str> = existing
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if features.iter().any(|f| *f == feature) {
        return None;
    }
    features.push(feature);
    Some(features.join(","))
}

/// 把提醒文本追加进请求的 system 字段,兼容字符串与块数组两种形态
fn append_system_text(root: &mut serde_json::Map<String, Value>, text: &str) {
    match root.get_mut("system") {
        Some(Value::String(existing)) => {
            existing.push_str("\n\n");
            existing.push_str(text);
        }
        Some(Value::Array(blocks)) => {
            blocks.push(json!({"type": "text", "text": text}));
        }
        _ => {
            root.insert("system".to_string(), Value::String(text.to_string()));
        }
    }
}

/// 阶段持续时间:排序副本的末尾减开头,单块为 0
fn phase_duration(timestamps: &[f64]) -> f64 {
    if timestamps.is_empty() {
        return 0.0;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted[sorted.len() - 1] - sorted[0]
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn header_f64(headers: &HeaderMap, name: &str) -> f64 {
    header_str(headers, name).trim().parse().unwrap_or(0.0)
}

fn header_i64(headers: &HeaderMap, name: &str) -> i64 {
    header_str(headers, name).trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::capture::ChunkTiming;
    use http::HeaderValue;

    fn engine_with(settings: EngineSettings) -> FingerprintEngine {
        FingerprintEngine::new(EngineSettings {
            capture_ttl_ms: 600_000.0,
            ..settings
        })
    }

    fn timing(ms: f64) -> ChunkTiming {
        ChunkTiming {
            timestamp_ms: ms,
            event_type: "content_block_delta".to_string(),
        }
    }

    /// 构造一条有完整时间轴的捕获:思考 25 块(45ms 间隔)接文本
    /// 10 块(40ms 间隔)
    fn two_phase_capture() -> StreamingCapture {
        let mut capture = StreamingCapture {
            model_requested: "claude-opus-4-5".to_string(),
            model_response: "claude-opus-4-5".to_string(),
            thinking_enabled: true,
            thinking_budget: 8_000,
            has_thinking: true,
            streaming_response: true,
            start_time_ms: 0.0,
            first_chunk_ms: 100.0,
            input_tokens: 1000,
            output_tokens: 35,
            cache_read_tokens: 800,
            ..StreamingCapture::default()
        };
        let mut at = 100.0;
        for _ in 0..25 {
            capture.thinking_chunks.push(timing(at));
            capture.chunks.push(timing(at));
            at += 45.0;
        }
        at -= 45.0; // 最后一个思考块的时刻
        for _ in 0..10 {
            at += 40.0;
            capture.text_chunks.push(timing(at));
            capture.chunks.push(timing(at));
        }
        capture.last_chunk_ms = at;
        capture
    }

    /// 两阶段流的指标:阶段统计互相独立,全局均值落在两者之间
    #[test]
    fn test_two_phase_sample_metrics() {
        let engine = engine_with(EngineSettings::default());
        let sample = engine
            .assemble_sample(two_phase_capture(), 1700.0)
            .expect("sample");

        assert_eq!(sample.thinking_itt_mean_ms, 45.0);
        assert_eq!(sample.text_itt_mean_ms, 40.0);
        assert!(sample.itt_mean_ms > 40.0 && sample.itt_mean_ms < 45.0);
        assert_eq!(sample.ttft_ms, 100.0);
        assert_eq!(sample.total_time_ms, 1700.0);
        assert_eq!(sample.thinking_duration_ms, 1080.0);
        assert_eq!(sample.text_duration_ms, 360.0);
        assert_eq!(sample.num_chunks, 35);
        assert_eq!(sample.thinking_chunk_count, 25);
        assert_eq!(sample.text_chunk_count, 10);
        // 35 token / 1.48s
        assert_eq!(sample.tokens_per_sec, 23.6);
        assert_eq!(sample.cache_efficiency, 80.0);
        // utilization 35/8000,tier 按预算分档
        assert_eq!(sample.thinking_utilization, 0.4);
        assert_eq!(sample.thinking_budget_tier, "enhanced");
        assert!(sample.model_match);
        assert!(!sample.is_subagent);
        // 低方差 + 43ms 均值 + 23tok/s 的组合落在 TPU 档
        assert_eq!(sample.classified_backend, "tpu");
        assert!(sample.confidence > 50.0);
        assert!(sample.backend_evidence.contains("itt"));
    }

    /// 没有任何计时数据的连接不产出样本
    #[test]
    fn test_no_timing_data_is_skipped() {
        let engine = engine_with(EngineSettings::default());
        let non_streaming = StreamingCapture {
            start_time_ms: 10.0,
            streaming_response: false,
            ..StreamingCapture::default()
        };
        assert!(engine.assemble_sample(non_streaming, 500.0).is_none());

        let streaming_but_empty = StreamingCapture {
            start_time_ms: 10.0,
            streaming_response: true,
            ..StreamingCapture::default()
        };
        assert!(engine.assemble_sample(streaming_but_empty, 500.0).is_none());
    }

    /// 终端回调要把缓冲区里未终结的事件补进统计
    #[test]
    fn test_trailing_event_flushed_at_completion() {
        let engine = engine_with(EngineSettings::default());
        let mut capture = StreamingCapture {
            streaming_response: true,
            start_time_ms: 0.0,
            first_chunk_ms: 100.0,
            last_chunk_ms: 150.0,
            ..StreamingCapture::default()
        };
        capture.chunks.push(timing(100.0));
        capture.chunks.push(timing(150.0));
        // 没有终结符的最后一个事件
        let events = capture.sse.feed(b"data: {\"type\":\"message_stop\"}");
        assert!(events.is_empty());

        let sample = engine.assemble_sample(capture, 200.0).expect("sample");
        assert_eq!(sample.num_chunks, 3);
    }

    /// 第一条 opus 请求定为主模型,其他模型的响应记为子代理
    #[test]
    fn test_subagent_detection() {
        let engine = engine_with(EngineSettings::default());
        let body = serde_json::to_vec(&json!({"model": "claude-opus-4-5"})).unwrap();
        let decision = engine.on_request(&body, None);
        assert!(matches!(decision, RequestDecision::Forward { .. }));

        let mut capture = StreamingCapture {
            model_requested: "claude-haiku-3-5".to_string(),
            model_response: "claude-haiku-3-5".to_string(),
            streaming_response: true,
            start_time_ms: 0.0,
            first_chunk_ms: 100.0,
            last_chunk_ms: 150.0,
            ..StreamingCapture::default()
        };
        capture.chunks.push(timing(100.0));
        capture.chunks.push(timing(150.0));

        let sample = engine.assemble_sample(capture, 200.0).expect("sample");
        assert!(sample.is_subagent);
        assert_eq!(sample.subagent_type.as_deref(), Some("haiku"));
        assert!(sample.model_match);
    }

    #[test]
    fn test_blocked_model_rejected() {
        let engine = engine_with(EngineSettings {
            blocked_models: vec!["haiku".to_string()],
            ..EngineSettings::default()
        });
        let body = serde_json::to_vec(&json!({"model": "claude-haiku-3-5"})).unwrap();
        match engine.on_request(&body, None) {
            RequestDecision::Block { body } => {
                assert!(body.contains("blocked"));
                assert!(body.contains("claude-haiku-3-5"));
            }
            other => panic!("expected block, got {other:?}"),
        }
        // 被拒绝的请求不登记捕获
        assert_eq!(engine.active_captures(), 0);
    }

    /// 界面选择与实际请求的系别不一致要被标记
    #[test]
    fn test_ui_api_mismatch_flagged() {
        let engine = engine_with(EngineSettings {
            user_selected_model: "claude-opus-4-5".to_string(),
            ..EngineSettings::default()
        });
        let body = serde_json::to_vec(&json!({"model": "claude-sonnet-4-5"})).unwrap();
        let RequestDecision::Forward { key, .. } = engine.on_request(&body, None) else {
            panic!("expected forward");
        };
        let mismatch = engine.registry.with(key, |c| c.ui_api_mismatch).unwrap();
        assert!(mismatch);
    }

    /// 强制思考 + 预算改写要落进转发的请求体
    #[test]
    fn test_force_thinking_rewrites_body() {
        let engine = engine_with(EngineSettings {
            force_thinking: true,
            force_thinking_budget: Some(32_000),
            ..EngineSettings::default()
        });
        let body = serde_json::to_vec(&json!({"model": "claude-opus-4-5"})).unwrap();
        let RequestDecision::Forward { key, body, .. } = engine.on_request(&body, None) else {
            panic!("expected forward");
        };
        let rewritten: Value = serde_json::from_slice(&body.expect("rewritten body")).unwrap();
        assert_eq!(rewritten["thinking"]["type"], "enabled");
        assert_eq!(rewritten["thinking"]["budget_tokens"], 32_000);
        let budget = engine.registry.with(key, |c| c.thinking_budget).unwrap();
        assert_eq!(budget, 32_000);
    }

    /// 预算 0 表示强制关闭思考,原有配置被覆盖
    #[test]
    fn test_force_budget_zero_disables_thinking() {
        let engine = engine_with(EngineSettings {
            force_thinking_budget: Some(0),
            ..EngineSettings::default()
        });
        let body = serde_json::to_vec(&json!({
            "model": "claude-opus-4-5",
            "thinking": {"type": "enabled", "budget_tokens": 5000},
        }))
        .unwrap();
        let RequestDecision::Forward { key, body, .. } = engine.on_request(&body, None) else {
            panic!("expected forward");
        };
        let rewritten: Value = serde_json::from_slice(&body.expect("rewritten body")).unwrap();
        assert_eq!(rewritten["thinking"], json!({"type": "disabled"}));
        let enabled = engine.registry.with(key, |c| c.thinking_enabled).unwrap();
        assert!(!enabled);
    }

    /// interleaved 模式合并 beta 头并抬高预算;特性已存在时不重复写
    #[test]
    fn test_force_interleaved_merges_beta_header() {
        let engine = engine_with(EngineSettings {
            force_thinking: true,
            force_interleaved: true,
            ..EngineSettings::default()
        });
        let body = serde_json::to_vec(&json!({"model": "claude-opus-4-5"})).unwrap();

        let RequestDecision::Forward { beta_header, body: rewritten, .. } =
            engine.on_request(&body, Some("context-1m-2025-08-07")) else {
            panic!("expected forward");
        };
        assert_eq!(
            beta_header.as_deref(),
            Some("context-1m-2025-08-07,interleaved-thinking-2025-05-14")
        );
        let rewritten: Value = serde_json::from_slice(&rewritten.expect("body")).unwrap();
        assert_eq!(rewritten["thinking"]["budget_tokens"], 200_000);

        let RequestDecision::Forward { beta_header, .. } =
            engine.on_request(&body, Some("interleaved-thinking-2025-05-14")) else {
            panic!("expected forward");
        };
        assert!(beta_header.is_none());
    }

    /// 请求体不是 JSON 时照常登记捕获,模型名记 unknown
    #[test]
    fn test_unparseable_body_still_tracked() {
        let engine = engine_with(EngineSettings::default());
        let RequestDecision::Forward { key, body, .. } =
            engine.on_request(b"not json", None) else {
            panic!("expected forward");
        };
        assert!(body.is_none());
        let model = engine.registry.with(key, |c| c.model_requested.clone()).unwrap();
        assert_eq!(model, "unknown");
    }

    /// 响应头回调:只有事件流才采集元数据并返回 true
    #[test]
    fn test_response_headers_streaming_gate() {
        let engine = engine_with(EngineSettings::default());
        let body = serde_json::to_vec(&json!({"model": "claude-opus-4-5"})).unwrap();
        let RequestDecision::Forward { key, .. } = engine.on_request(&body, None) else {
            panic!("expected forward");
        };

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        assert!(!engine.on_response_headers(key, &headers));

        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("text/event-stream; charset=utf-8"),
        );
        headers.insert("request-id", HeaderValue::from_static("req_abc123"));
        headers.insert("x-envoy-upstream-service-time", HeaderValue::from_static("842"));
        headers.insert("cf-ray", HeaderValue::from_static("8c1de7f3bd2a09e1-NRT"));
        headers.insert(
            "anthropic-ratelimit-unified-5h-utilization",
            HeaderValue::from_static("0.37"),
        );
        headers.insert(
            "anthropic-ratelimit-unified-representative-claim",
            HeaderValue::from_static("five_hour"),
        );
        assert!(engine.on_response_headers(key, &headers));

        engine
            .registry
            .with(key, |c| {
                assert!(c.streaming_response);
                assert_eq!(c.request_id, "req_abc123");
                assert_eq!(c.envoy_time_ms, 842.0);
                assert_eq!(c.cf_edge_location, "NRT");
                assert_eq!(c.rate_limit.five_hour_utilization, 0.37);
                assert_eq!(c.rate_limit.binding_window, "five_hour");
            })
            .unwrap();
    }

    /// 分块回调端到端:计时、重组、阶段归属一气呵成
    #[test]
    fn test_stream_chunk_updates_capture() {
        let engine = engine_with(EngineSettings::default());
        let body = serde_json::to_vec(&json!({"model": "claude-opus-4-5"})).unwrap();
        let RequestDecision::Forward { key, .. } = engine.on_request(&body, None) else {
            panic!("expected forward");
        };

        engine.on_stream_chunk(key, b"");
        engine.registry.with(key, |c| assert_eq!(c.first_chunk_ms, 0.0)).unwrap();

        engine.on_stream_chunk(
            key,
            b"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
        );
        engine
            .registry
            .with(key, |c| {
                assert!(c.first_chunk_ms > 0.0);
                assert_eq!(c.text_chunks.len(), 1);
                assert_eq!(c.text_content, "hi");
            })
            .unwrap();
    }

    /// 检出谄媚后,下一条请求的 system 被追加提醒,且只注入一次
    #[test]
    fn test_whisper_injected_into_next_request() {
        let engine = engine_with(EngineSettings {
            whisper_enabled: true,
            ..EngineSettings::default()
        });
        let mut capture = StreamingCapture {
            streaming_response: true,
            start_time_ms: 0.0,
            first_chunk_ms: 100.0,
            last_chunk_ms: 150.0,
            text_content: "You're absolutely right! Fixed!".to_string(),
            ..StreamingCapture::default()
        };
        capture.chunks.push(timing(100.0));
        capture.chunks.push(timing(150.0));
        engine.assemble_sample(capture, 200.0).expect("sample");

        let body = serde_json::to_vec(&json!({
            "model": "claude-opus-4-5",
            "system": [{"type": "text", "text": "base"}],
        }))
        .unwrap();
        let RequestDecision::Forward { body: rewritten, .. } = engine.on_request(&body, None)
        else {
            panic!("expected forward");
        };
        let rewritten: Value = serde_json::from_slice(&rewritten.expect("body")).unwrap();
        let blocks = rewritten["system"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[1]["text"].as_str().unwrap().contains("memento-mori"));

        // 提醒取走即清空
        let RequestDecision::Forward { body: again, .. } = engine.on_request(&body, None) else {
            panic!("expected forward");
        };
        assert!(again.is_none());
    }

    #[test]
    fn test_thinking_tier_boundaries() {
        assert_eq!(thinking_tier(0), "none");
        assert_eq!(thinking_tier(1023), "none");
        assert_eq!(thinking_tier(1024), "basic");
        assert_eq!(thinking_tier(8000), "enhanced");
        assert_eq!(thinking_tier(19_999), "enhanced");
        assert_eq!(thinking_tier(20_000), "ultra");
    }
}
