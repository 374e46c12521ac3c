//! 指纹样本 API 请求/响应类型

use serde::{Deserialize, Serialize};

use super::model::Sample;

/// 查询过滤器
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub backend: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// 分页响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleListResponse {
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub samples: Vec<Sample>,
}

/// 总览统计
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewStats {
    pub total_samples: u64,
    pub session_count: u64,
    pub mismatch_count: u64,
    pub subagent_count: u64,
    pub speculative_count: u64,
    pub avg_itt_mean_ms: f64,
    pub avg_tokens_per_sec: f64,
    pub backends: Vec<BackendShare>,
}

/// 某个后端在全部样本中的占比
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendShare {
    pub backend: String,
    pub count: u64,
    pub pct: f64,
}

/// 模型基线,对应 model_stats 表一行
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatsRow {
    pub model: String,
    pub samples_count: i64,
    pub itt_mean_baseline: f64,
    pub itt_std_baseline: f64,
    pub tps_baseline: f64,
    pub ttft_baseline: f64,
    pub trainium_count: i64,
    pub tpu_count: i64,
    pub gpu_count: i64,
    pub trainium_pct: f64,
    pub tpu_pct: f64,
    pub gpu_pct: f64,
    pub cache_efficiency_avg: f64,
    pub cache_efficiency_min: f64,
    pub cache_efficiency_max: f64,
    pub thinking_utilization_avg: f64,
    pub last_updated: String,
}

/// 会话汇总,对应 session_stats 表一行
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatsRow {
    pub session_id: String,
    pub start_time: String,
    pub end_time: String,
    pub sample_count: i64,
    pub picker_model: String,
    pub direct_count: i64,
    pub subagent_count: i64,
    pub haiku_count: i64,
    pub sonnet_count: i64,
    pub itt_mean_start: f64,
    pub itt_mean_end: f64,
    pub itt_trend_pct: f64,
    pub itt_trend_direction: String,
    pub trainium_count: i64,
    pub gpu_count: i64,
    pub tpu_count: i64,
    pub backend_switches: i64,
    pub cache_efficiency_avg: f64,
    pub last_updated: String,
}
