//! 流式响应的时序指纹采集
//!
//! 从事件流的到达时刻推断服务端硬件特征:SSE 重组、事件归类、
//! token 间隔统计、后端分类与投机解码检测,最终组装成一条样本。

pub mod capture;
pub mod classify;
pub mod collector;
pub mod event;
pub mod speculative;
pub mod sse;
pub mod stats;

pub use capture::{CaptureKey, CaptureRegistry, ChunkTiming, Phase, RateLimitSnapshot, StreamingCapture};
pub use classify::{Classification, classify_backend};
pub use collector::{EngineSettings, FingerprintEngine, RequestDecision, thinking_tier};
pub use event::{DeltaFragment, StreamEvent, process_event};
pub use speculative::{SpeculativePattern, detect_speculative};
pub use sse::SseReassembler;
pub use stats::{IttStats, positive_deltas, round_dp};
