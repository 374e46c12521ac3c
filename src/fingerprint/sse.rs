//! SSE 帧重组器
//!
//! 线上流量按任意字节边界切块送达,事件终止符(空行)可能正好跨在
//! 两个块之间,JSON 也可能被拦腰截断。重组器把块累积进缓冲,只在
//! 取到完整事件块后才尝试解析 data 行。

use super::event::StreamEvent;

const DATA_PREFIX: &str = "data: ";
const EVENT_TERMINATOR: &str = "\n\n";

/// 增量 SSE 解析器,持有未终止的残余缓冲
#[derive(Debug, Clone, Default)]
pub struct SseReassembler {
    buffer: String,
    discarded: u64,
}

impl SseReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 送入一个原始字节块,返回其中全部完整事件
    ///
    /// 每次调用做有界工作:只消费缓冲中已终止的部分,残余留给下个块。
    /// 无法解码的字节按 UTF-8 宽容替换处理,损坏的 data 行计数后丢弃,
    /// 不会中断后续事件。
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        // 一个块可能携带多个完整事件,循环取空直到没有终止符
        while let Some(pos) = self.buffer.find(EVENT_TERMINATOR) {
            let block: String = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + EVENT_TERMINATOR.len());
            self.parse_block(&block, &mut events);
        }
        events
    }

    /// 流结束:对残余缓冲做最后一次解析
    ///
    /// 最后一个事件可能在连接关闭前没带终止符。
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        if !rest.is_empty() {
            self.parse_block(&rest, &mut events);
        }
        events
    }

    fn parse_block(&mut self, block: &str, out: &mut Vec<StreamEvent>) {
        for line in block.split('\n') {
            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };
            match StreamEvent::from_json(payload) {
                Ok(event) => out.push(event),
                Err(_) => self.discarded += 1,
            }
        }
    }

    /// 至今丢弃的损坏 data 行数
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// 当前残余缓冲的字节数
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::event::DeltaFragment;

    const STREAM: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-opus-4\",\"usage\":{\"input_tokens\":10}}}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n",
        "\n",
        "event: ping\n",
        "data: {\"type\":\"ping\"}\n",
        "\n",
    );

    fn feed_all(parser: &mut SseReassembler, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = parser.feed(bytes);
        events.extend(parser.finish());
        events
    }

    /// 任意字节偏移处切分,解析结果必须与整块送入一致
    #[test]
    fn test_arbitrary_split_offsets_equivalent() {
        let bytes = STREAM.as_bytes();
        let mut whole = SseReassembler::new();
        let expected = feed_all(&mut whole, bytes);
        assert_eq!(expected.len(), 3);

        for split in 1..bytes.len() {
            let mut parser = SseReassembler::new();
            let mut events = parser.feed(&bytes[..split]);
            events.extend(parser.feed(&bytes[split..]));
            events.extend(parser.finish());
            assert_eq!(events, expected, "split at byte {}", split);
        }
    }

    /// 一个块带多个完整事件时必须全部取出
    #[test]
    fn test_multiple_events_in_one_chunk() {
        let mut parser = SseReassembler::new();
        let events = parser.feed(STREAM.as_bytes());
        assert_eq!(events.len(), 3);
        assert_eq!(parser.pending_bytes(), 0);
    }

    /// 空块是无操作
    #[test]
    fn test_empty_chunk_is_noop() {
        let mut parser = SseReassembler::new();
        assert!(parser.feed(b"").is_empty());
        assert_eq!(parser.pending_bytes(), 0);
    }

    /// 没有终止符时只累积缓冲,不吐事件
    #[test]
    fn test_incomplete_event_stays_buffered() {
        let mut parser = SseReassembler::new();
        let events = parser.feed(b"data: {\"type\":\"ping\"}");
        assert!(events.is_empty());
        assert!(parser.pending_bytes() > 0);
    }

    /// JSON 被拦腰截断跨两个块:终止符到齐后恰好产出一个事件
    #[test]
    fn test_split_mid_json_yields_single_event() {
        let mut parser = SseReassembler::new();
        let first = parser.feed(b"data: {\"type\":\"message_start\",\"message\":{\"mo");
        assert!(first.is_empty());
        let second = parser.feed(b"del\":\"claude-opus-4\"}}\n\n");
        assert_eq!(second.len(), 1);
        assert!(matches!(second[0], StreamEvent::MessageStart { .. }));
        assert_eq!(parser.discarded(), 0);
    }

    /// 终止符本身跨块(第一块以 \n 结尾,第二块以 \n 开头)
    #[test]
    fn test_terminator_split_across_chunks() {
        let mut parser = SseReassembler::new();
        assert!(parser.feed(b"data: {\"type\":\"ping\"}\n").is_empty());
        let events = parser.feed(b"\ndata: {\"type\":\"message_stop\"}\n\n");
        assert_eq!(events, vec![StreamEvent::Ping, StreamEvent::MessageStop]);
    }

    /// 损坏的 data 行被静默丢弃,不影响随后的合法事件
    #[test]
    fn test_malformed_line_discarded_silently() {
        let mut parser = SseReassembler::new();
        let events = parser.feed(
            b"data: {broken json!!\n\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"ok\"}}\n\n",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            StreamEvent::ContentBlockDelta {
                fragment: DeltaFragment::Text("ok".to_string())
            }
        );
        assert_eq!(parser.discarded(), 1);
    }

    /// 流结束时残余事件没有终止符也要解析出来
    #[test]
    fn test_finish_flushes_unterminated_tail() {
        let mut parser = SseReassembler::new();
        assert!(parser.feed(b"data: {\"type\":\"message_stop\"}").is_empty());
        let events = parser.finish();
        assert_eq!(events, vec![StreamEvent::MessageStop]);
        assert_eq!(parser.pending_bytes(), 0);
        // finish 后缓冲已清空,再次 finish 不产出
        assert!(parser.finish().is_empty());
    }

    /// 非 data 行(event:/注释/空行)不产生事件
    #[test]
    fn test_non_data_lines_ignored() {
        let mut parser = SseReassembler::new();
        let events = parser.feed(b"event: ping\n: keep-alive comment\nretry: 3000\n\n");
        assert!(events.is_empty());
        assert_eq!(parser.discarded(), 0);
    }
}
