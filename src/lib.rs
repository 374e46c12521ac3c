//! ittscope: Anthropic Messages API 指纹采样代理
//!
//! 在客户端与上游之间做透明转发，旁路测量流式响应的分块到达时序，
//! 据此对推理后端做指纹分类，样本落库后供状态行与仪表盘查询。

pub mod common;
pub mod fingerprint;
pub mod model;
pub mod proxy;
pub mod telemetry;
pub mod whisper;
