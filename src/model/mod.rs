//! 应用配置模型

pub mod config;

pub use config::Config;
