//! 代理转发模块
//!
//! 承接 Anthropic Messages API 流量，在不改变响应语义的前提下旁路采样

mod client;
mod handlers;
mod stream;

pub use client::build_client;
pub use handlers::{AppState, create_proxy_router};
