//! 单连接捕获状态与连接注册表
//!
//! 注册表归属于单个引擎实例,按连接键索引,带 TTL 清扫兜底:
//! 客户端中途断开时终端回调不会触发,遗留条目靠清扫回收。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::sse::SseReassembler;

/// 连接键,由注册表分配,进程内唯一
pub type CaptureKey = u64;

/// 单个流事件的到达记录
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkTiming {
    /// 引擎单调时钟毫秒
    pub timestamp_ms: f64,
    /// 事件声明的 type 字符串,未识别类型原样保留
    pub event_type: String,
}

/// 响应当前所处阶段,由 content_block_start / delta 标签驱动
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Thinking,
    Text,
}

/// anthropic-ratelimit-unified-* 响应头快照
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitSnapshot {
    pub five_hour_utilization: f64,
    pub five_hour_reset: i64,
    pub five_hour_status: String,
    pub seven_day_utilization: f64,
    pub seven_day_reset: i64,
    pub seven_day_status: String,
    pub overall_status: String,
    pub binding_window: String,
    pub fallback_pct: f64,
    pub overage_status: String,
}

/// 一次进行中请求的全部捕获状态
///
/// chunks / thinking_chunks / text_chunks 只追加,从不原地重排,
/// 统计引擎在排序副本上工作。
#[derive(Debug, Clone, Default)]
pub struct StreamingCapture {
    // 请求侧
    pub model_requested: String,
    pub model_ui_selected: String,
    pub ui_api_mismatch: bool,
    pub thinking_enabled: bool,
    pub thinking_budget: i64,

    // 时间轴(引擎单调时钟毫秒,0 表示尚未发生)
    pub start_time_ms: f64,
    pub first_chunk_ms: f64,
    pub last_chunk_ms: f64,

    // 流式累积
    pub sse: SseReassembler,
    pub chunks: Vec<ChunkTiming>,
    pub thinking_chunks: Vec<ChunkTiming>,
    pub text_chunks: Vec<ChunkTiming>,
    pub current_phase: Phase,
    pub has_thinking: bool,
    pub thinking_content: String,
    pub text_content: String,

    // 响应侧,随事件到达增量填充
    pub model_response: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub stop_reason: String,
    /// 上游是否声明了 text/event-stream,跳过样本时用于区分原因
    pub streaming_response: bool,

    // 基础设施元数据(响应头)
    pub request_id: String,
    pub envoy_time_ms: f64,
    pub cf_ray: String,
    pub cf_edge_location: String,
    pub rate_limit: RateLimitSnapshot,
}

impl StreamingCapture {
    /// 全局时序时间戳(追加顺序)
    pub fn chunk_timestamps(&self) -> Vec<f64> {
        self.chunks.iter().map(|c| c.timestamp_ms).collect()
    }

    pub fn thinking_timestamps(&self) -> Vec<f64> {
        self.thinking_chunks.iter().map(|c| c.timestamp_ms).collect()
    }

    pub fn text_timestamps(&self) -> Vec<f64> {
        self.text_chunks.iter().map(|c| c.timestamp_ms).collect()
    }
}

/// 按连接键索引的捕获注册表
pub struct CaptureRegistry {
    captures: Mutex<HashMap<CaptureKey, StreamingCapture>>,
    next_key: AtomicU64,
    ttl_ms: f64,
}

impl CaptureRegistry {
    pub fn new(ttl_ms: f64) -> Self {
        Self {
            captures: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            ttl_ms,
        }
    }

    /// 登记一个新捕获,返回连接键
    pub fn begin(&self, capture: StreamingCapture) -> CaptureKey {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.captures.lock().insert(key, capture);
        key
    }

    /// 在锁内对指定捕获执行一次修改;捕获不存在时返回 None
    pub fn with<R>(&self, key: CaptureKey, f: impl FnOnce(&mut StreamingCapture) -> R) -> Option<R> {
        self.captures.lock().get_mut(&key).map(f)
    }

    /// 取出并移除捕获(终端回调独占使用,第二次调用得到 None)
    pub fn take(&self, key: CaptureKey) -> Option<StreamingCapture> {
        self.captures.lock().remove(&key)
    }

    /// 清除开始时间早于 TTL 的遗留捕获,返回清除数量
    pub fn sweep(&self, now_ms: f64) -> usize {
        let mut map = self.captures.lock();
        let before = map.len();
        map.retain(|_, c| now_ms - c.start_time_ms < self.ttl_ms);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.captures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.captures.lock().is_empty()
    }
}
