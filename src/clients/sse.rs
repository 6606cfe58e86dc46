//! Incremental Server-Sent-Events framing.
//!
//! Network chunks arrive at arbitrary boundaries; frames are only complete
//! at a blank line (`\n\n`). The buffer accumulates bytes and hands back
//! whole event blocks as they materialize.

/// Accumulates raw bytes and yields complete SSE event blocks.
#[derive(Debug, Default)]
pub struct SseBuffer {
    pending: String,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a network chunk (lossy UTF-8).
    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Pop the next complete event block, if one has fully arrived.
    pub fn next_event_block(&mut self) -> Option<String> {
        let boundary = self.pending.find("\n\n")?;
        let rest = self.pending.split_off(boundary + 2);
        Some(std::mem::replace(&mut self.pending, rest))
    }
}

/// Extract the `data:` payload lines from one event block.
pub fn data_lines(event_block: &str) -> Vec<&str> {
    event_block
        .lines()
        .filter_map(|line| {
            line.strip_prefix("data:")
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_frames_only() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"data: first\n\npar");

        assert_eq!(buffer.next_event_block().as_deref(), Some("data: first\n\n"));
        assert!(buffer.next_event_block().is_none());

        buffer.push_chunk(b"tial\n\n");
        assert_eq!(buffer.next_event_block().as_deref(), Some("partial\n\n"));
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"data: a\n\ndata: b\n\n");

        assert_eq!(buffer.next_event_block().as_deref(), Some("data: a\n\n"));
        assert_eq!(buffer.next_event_block().as_deref(), Some("data: b\n\n"));
        assert!(buffer.next_event_block().is_none());
    }

    #[test]
    fn test_data_lines_ignores_other_fields() {
        let block = "event: message\ndata: one\n: comment\ndata: two\n\n";
        assert_eq!(data_lines(block), vec!["one", "two"]);
    }

    #[test]
    fn test_data_lines_without_space() {
        assert_eq!(data_lines("data:compact\n\n"), vec!["compact"]);
    }
}
