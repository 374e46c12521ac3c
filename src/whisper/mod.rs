//! 谄媚检测与提醒注入
//!
//! 对代理转发的每条完整响应文本做规则打分,检出后在下一次请求的
//! system 块末尾追加一段提醒文案,促使模型保持验证习惯。

pub mod analyzer;
pub mod patterns;

pub use analyzer::{DetectionResult, SycophancyMonitor, WhisperLevel, analyze_response, whisper_text};
