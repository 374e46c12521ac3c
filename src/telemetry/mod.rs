//! 指纹样本遥测模块
//!
//! 提供样本持久化、基线/会话聚合和查询 API

pub mod model;
pub mod store;
mod handlers;
mod router;
mod types;

pub use model::Sample;
pub use router::create_telemetry_router;
pub use store::TelemetryService;
pub use types::{ModelStatsRow, OverviewStats, SampleListResponse, SampleQuery, SessionStatsRow};
