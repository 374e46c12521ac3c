//! SSE 事件模型与阶段跟踪
//!
//! 事件集是封闭但会演进的外部 API:解码采用防御式取值,字段缺失
//! 一律落默认值,未知 type 归入 Other 并保留原始字符串。

use serde_json::Value;

use super::capture::{ChunkTiming, Phase, StreamingCapture};

/// content_block_delta 携带的增量片段,delta 自身的标签决定归属阶段
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaFragment {
    Thinking(String),
    Text(String),
    /// 其他 delta 子类型(input_json_delta / signature_delta 等),只计入全局时序
    Other(String),
}

/// Anthropic 流式事件联合
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        model: String,
        input_tokens: i64,
        cache_creation_tokens: i64,
        cache_read_tokens: i64,
    },
    ContentBlockStart {
        block_type: String,
    },
    ContentBlockDelta {
        fragment: DeltaFragment,
    },
    MessageDelta {
        output_tokens: i64,
        stop_reason: String,
    },
    MessageStop,
    Ping,
    /// 未识别类型:不提取字段,但仍参与全局 ITT 统计
    Other {
        event_type: String,
    },
}

impl StreamEvent {
    /// 解析一行 data JSON;失败作为 Err 返回,由调用方计数丢弃
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(payload)?;
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "message_start" => {
                let message = value.get("message");
                let usage = message.and_then(|m| m.get("usage"));
                let count = |key: &str| {
                    usage.and_then(|u| u.get(key)).and_then(Value::as_i64).unwrap_or(0)
                };
                Self::MessageStart {
                    model: message
                        .and_then(|m| m.get("model"))
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    input_tokens: count("input_tokens"),
                    cache_creation_tokens: count("cache_creation_input_tokens"),
                    cache_read_tokens: count("cache_read_input_tokens"),
                }
            }
            "content_block_start" => Self::ContentBlockStart {
                block_type: value
                    .get("content_block")
                    .and_then(|b| b.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            },
            "content_block_delta" => {
                let delta = value.get("delta");
                let text_of = |key: &str| {
                    delta
                        .and_then(|d| d.get(key))
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string()
                };
                let delta_type = delta
                    .and_then(|d| d.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let fragment = match delta_type {
                    "thinking_delta" => DeltaFragment::Thinking(text_of("thinking")),
                    "text_delta" => DeltaFragment::Text(text_of("text")),
                    other => DeltaFragment::Other(other.to_string()),
                };
                Self::ContentBlockDelta { fragment }
            }
            "message_delta" => Self::MessageDelta {
                output_tokens: value
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
                stop_reason: value
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            },
            "message_stop" => Self::MessageStop,
            "ping" => Self::Ping,
            other => Self::Other {
                event_type: other.to_string(),
            },
        }
    }

    /// 写入时序记录的类型标签
    pub fn type_label(&self) -> &str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentBlockStart { .. } => "content_block_start",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStop => "message_stop",
            Self::Ping => "ping",
            Self::Other { event_type } => event_type,
        }
    }
}

/// 将一个已解析事件应用到捕获状态
///
/// 任何类型的事件都会在全局 chunks 里追加一条时序记录,全局 ITT
/// 统计定义在全部送达事件上,不只是内容增量。
pub fn process_event(capture: &mut StreamingCapture, event: &StreamEvent, now_ms: f64) {
    let timing = ChunkTiming {
        timestamp_ms: now_ms,
        event_type: event.type_label().to_string(),
    };

    match event {
        StreamEvent::MessageStart {
            model,
            input_tokens,
            cache_creation_tokens,
            cache_read_tokens,
        } => {
            capture.model_response = model.clone();
            capture.input_tokens = *input_tokens;
            capture.cache_creation_tokens = *cache_creation_tokens;
            capture.cache_read_tokens = *cache_read_tokens;
            tracing::debug!(
                "message_start: model={} input_tokens={}",
                capture.model_response,
                capture.input_tokens
            );
        }
        StreamEvent::ContentBlockStart { block_type } => match block_type.as_str() {
            "thinking" => {
                capture.current_phase = Phase::Thinking;
                capture.has_thinking = true;
            }
            "text" => capture.current_phase = Phase::Text,
            _ => {}
        },
        StreamEvent::ContentBlockDelta { fragment } => match fragment {
            // delta 自身的标签是阶段归属的权威,block_start 设下的阶段
            // 不一定对每个 delta 都成立
            DeltaFragment::Thinking(text) => {
                capture.current_phase = Phase::Thinking;
                capture.thinking_chunks.push(timing.clone());
                if !text.is_empty() {
                    capture.thinking_content.push_str(text);
                }
            }
            DeltaFragment::Text(text) => {
                capture.current_phase = Phase::Text;
                capture.text_chunks.push(timing.clone());
                if !text.is_empty() {
                    capture.text_content.push_str(text);
                }
            }
            DeltaFragment::Other(_) => {}
        },
        StreamEvent::MessageDelta {
            output_tokens,
            stop_reason,
        } => {
            // API 汇报的最终值覆盖此前的估计
            capture.output_tokens = *output_tokens;
            capture.stop_reason = stop_reason.clone();
        }
        StreamEvent::MessageStop | StreamEvent::Ping | StreamEvent::Other { .. } => {}
    }

    capture.chunks.push(timing);
}
