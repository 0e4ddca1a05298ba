use crate::transport::RawChunk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf) {
            let frame_bytes = self.buf[..idx].to_vec();
            self.buf.drain(..idx + delim_len);
            if let Some(frame) = parse_sse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes a final frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buf);
        parse_sse_frame(&rest)
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_sse_frame(bytes: &[u8]) -> Option<SseFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

/// Maps an SSE frame to a chunk. `[DONE]` and empty frames map to nothing.
pub(crate) fn frame_to_chunk(frame: SseFrame) -> Option<RawChunk> {
    let trimmed = frame.data.trim();
    if trimmed.is_empty() || trimmed == "[DONE]" {
        return None;
    }
    if trimmed.starts_with('{')
        && let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(trimmed)
    {
        return Some(RawChunk::Json(value));
    }
    Some(RawChunk::Text(frame.data))
}

/// Decodes UTF-8 across network reads, holding back a split multi-byte
/// sequence until its remaining bytes arrive.
#[derive(Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Flushes bytes left over at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sse_decoder_handles_partial_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push_chunk(b"event: message\ndata: {\"data\":\"[{\\\"ti");
        assert!(frames.is_empty());
        let frames = decoder.push_chunk(b"tle\\\":1}]\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(
            frame_to_chunk(frames[0].clone()),
            Some(RawChunk::Json(json!({"data": "[{\"title\":1}]"})))
        );
    }

    #[test]
    fn sse_decoder_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b"data: tail").is_empty());
        let frame = decoder.finish().expect("frame");
        assert_eq!(frame.data, "tail");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn done_and_blank_frames_are_dropped() {
        let done = SseFrame {
            event: None,
            data: "[DONE]".into(),
        };
        assert_eq!(frame_to_chunk(done), None);
        let text = SseFrame {
            event: None,
            data: "[{\"title\":\"a\"}".into(),
        };
        assert_eq!(frame_to_chunk(text), Some(RawChunk::from("[{\"title\":\"a\"}")));
    }

    #[test]
    fn utf8_decoder_carries_split_sequences() {
        let bytes = "héllo".as_bytes();
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push_chunk(&bytes[..2]), "h");
        assert_eq!(decoder.push_chunk(&bytes[2..]), "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn utf8_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push_chunk(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(decoder.push_chunk(b"\xe2\x82"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
