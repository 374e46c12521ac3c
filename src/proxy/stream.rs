//! 响应流旁路采样
//!
//! TapStream 包装上游字节流:每个分块先喂给采集引擎再原样下发,
//! 流结束(或被客户端提前挂断)时结算样本并提交落库。

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

use crate::fingerprint::{CaptureKey, FingerprintEngine};
use crate::telemetry::TelemetryService;

pub struct TapStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    key: CaptureKey,
    engine: Arc<FingerprintEngine>,
    telemetry: Arc<TelemetryService>,
    finalized: bool,
}

impl TapStream {
    pub fn new(
        inner: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
        key: CaptureKey,
        engine: Arc<FingerprintEngine>,
        telemetry: Arc<TelemetryService>,
    ) -> Self {
        Self {
            inner: Box::pin(inner),
            key,
            engine,
            telemetry,
            finalized: false,
        }
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        if let Some(sample) = self.engine.on_response_complete(self.key) {
            self.telemetry.submit(sample);
        }
    }
}

impl Stream for TapStream {
    type Item = reqwest::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.engine.on_stream_chunk(this.key, &chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!("上游流读取失败: {}", e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finalize();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// 客户端挂断时 axum 直接丢弃 Body,此时也要结算已有分块
impl Drop for TapStream {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    use crate::fingerprint::EngineSettings;
    use crate::telemetry::SampleQuery;

    fn sse_frame(data: &str) -> Bytes {
        Bytes::from(format!("data: {}\n\n", data))
    }

    /// 分块透传不变形,流结束后样本进入存储
    #[tokio::test]
    async fn test_tap_stream_passes_chunks_and_records_sample() {
        let engine = Arc::new(FingerprintEngine::new(EngineSettings {
            capture_ttl_ms: 600_000.0,
            ..EngineSettings::default()
        }));
        let telemetry = Arc::new(TelemetryService::new(":memory:").unwrap());

        let body = serde_json::json!({"model": "claude-opus-4-5", "stream": true});
        let decision = engine.on_request(&serde_json::to_vec(&body).unwrap(), None);
        let key = match decision {
            crate::fingerprint::RequestDecision::Forward { key, .. } => key,
            other => panic!("unexpected decision: {:?}", other),
        };

        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", "text/event-stream".parse().unwrap());
        assert!(engine.on_response_headers(key, &headers));

        let frames = vec![
            sse_frame(
                r#"{"type":"message_start","message":{"model":"claude-opus-4-5","usage":{"input_tokens":10,"output_tokens":1}}}"#,
            ),
            sse_frame(r#"{"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#),
            sse_frame(
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hello"}}"#,
            ),
            sse_frame(
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
            ),
            sse_frame(r#"{"type":"message_stop"}"#),
        ];
        let upstream = futures::stream::iter(
            frames
                .clone()
                .into_iter()
                .map(Ok::<Bytes, reqwest::Error>),
        );

        let mut tap = TapStream::new(upstream, key, engine.clone(), telemetry.clone());
        let mut passed = Vec::new();
        while let Some(item) = tap.next().await {
            passed.push(item.unwrap());
        }
        assert_eq!(passed, frames);
        assert_eq!(engine.active_captures(), 0);

        // 后台落库是异步的,轮询等它完成
        let mut total = 0;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            total = telemetry.query(SampleQuery::default()).await.unwrap().total;
            if total == 1 {
                break;
            }
        }
        assert_eq!(total, 1);

        let sample = telemetry.latest().await.unwrap().unwrap();
        assert_eq!(sample.model_response, "claude-opus-4-5");
        assert_eq!(sample.output_tokens, 5);
        assert_eq!(sample.stop_reason, "end_turn");
        assert_eq!(sample.num_chunks, 5);
    }

    /// 客户端提前挂断:Drop 路径也要结算,且只结算一次
    #[tokio::test]
    async fn test_tap_stream_finalizes_on_drop() {
        let engine = Arc::new(FingerprintEngine::new(EngineSettings {
            capture_ttl_ms: 600_000.0,
            ..EngineSettings::default()
        }));
        let telemetry = Arc::new(TelemetryService::new(":memory:").unwrap());

        let body = serde_json::json!({"model": "claude-opus-4-5", "stream": true});
        let key = match engine.on_request(&serde_json::to_vec(&body).unwrap(), None) {
            crate::fingerprint::RequestDecision::Forward { key, .. } => key,
            other => panic!("unexpected decision: {:?}", other),
        };

        let never_ending = futures::stream::iter(
            vec![sse_frame(r#"{"type":"message_stop"}"#)]
                .into_iter()
                .map(Ok::<Bytes, reqwest::Error>),
        )
        .chain(futures::stream::pending());

        let mut tap = TapStream::new(never_ending, key, engine.clone(), telemetry.clone());
        let first = tap.next().await;
        assert!(first.is_some());
        drop(tap);

        // 只有一个分块,结算走丢弃分支,但捕获必须被移出登记表
        assert_eq!(engine.active_captures(), 0);
    }
}
