use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::warn;

/// One decoded event from an in-flight assistant response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Complete(serde_json::Value),
    Error(StreamFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFailure {
    /// The assistant backend reported an error record.
    Assistant(String),
    /// The transport failed mid-stream.
    Transport(String),
    /// The transport closed without a terminal record.
    UnexpectedEndOfStream,
}

impl std::fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamFailure::Assistant(detail) => write!(f, "assistant error: {detail}"),
            StreamFailure::Transport(detail) => write!(f, "transport error: {detail}"),
            StreamFailure::UnexpectedEndOfStream => {
                write!(f, "stream ended without a terminal record")
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecordPayload {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    event: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

const RECORD_SEPARATOR: &[u8] = b"\n\n";
const DATA_PREFIX: &str = "data:";

/// Incremental decoder for the assistant response transport: records
/// separated by a blank line, each prefixed `data:` with a JSON payload.
///
/// Chunks may arrive with arbitrary boundaries (including mid-record and
/// mid-character), so the buffer is kept as raw bytes and only complete
/// records are parsed.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a `Complete` or `Error` event has been emitted; later
    /// chunks are dropped.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Append a chunk and drain every complete record from the buffer.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = find_separator(&self.pending) {
            let record: Vec<u8> = self.pending.drain(..pos + RECORD_SEPARATOR.len()).collect();
            let record = &record[..pos];
            match self.decode_record(record) {
                Some(event) => {
                    let terminal = !matches!(event, StreamEvent::Token(_));
                    events.push(event);
                    if terminal {
                        self.finished = true;
                        self.pending.clear();
                        break;
                    }
                }
                None => continue,
            }
        }
        events
    }

    /// Signal end of transport. A stream that ends without a terminal
    /// record is an error the caller must surface.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(StreamEvent::Error(StreamFailure::UnexpectedEndOfStream))
    }

    /// Parse one complete record. Malformed records are logged and skipped
    /// so a single bad frame never aborts the stream.
    fn decode_record(&self, record: &[u8]) -> Option<StreamEvent> {
        let text = match std::str::from_utf8(record) {
            Ok(t) => t.trim(),
            Err(e) => {
                warn!(target: "stream", "Skipping non-UTF8 record: {e}");
                return None;
            }
        };
        if text.is_empty() {
            return None;
        }
        let Some(body) = text.strip_prefix(DATA_PREFIX) else {
            warn!(target: "stream", "Skipping record without data prefix: {text:?}");
            return None;
        };
        let payload: RecordPayload = match serde_json::from_str(body.trim()) {
            Ok(p) => p,
            Err(e) => {
                warn!(target: "stream", "Skipping malformed record: {e}");
                return None;
            }
        };
        if let Some(token) = payload.token {
            return Some(StreamEvent::Token(token));
        }
        if let Some(event) = payload.event {
            return Some(StreamEvent::Complete(event));
        }
        if let Some(error) = payload.error {
            let detail = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Some(StreamEvent::Error(StreamFailure::Assistant(detail)));
        }
        warn!(target: "stream", "Skipping record with no known field: {text:?}");
        None
    }
}

/// Adapt a raw byte stream (e.g. `reqwest::Response::bytes_stream`) into a
/// lazy, finite, non-restartable sequence of decoded events. Dropping the
/// returned stream cancels decoding; a cancelled stream never yields
/// `Complete`.
pub fn decode_byte_stream<S, B, E>(body: S) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    async_stream::stream! {
        let mut decoder = StreamDecoder::new();
        futures_util::pin_mut!(body);
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.push_chunk(bytes.as_ref()) {
                        let terminal = !matches!(event, StreamEvent::Token(_));
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                }
                Err(e) => {
                    yield StreamEvent::Error(StreamFailure::Transport(e.to_string()));
                    return;
                }
            }
        }
        if let Some(event) = decoder.finish() {
            yield event;
        }
    }
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(RECORD_SEPARATOR.len())
        .position(|w| w == RECORD_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    const VALID_INPUT: &str = concat!(
        "data: {\"token\": \"Hel\"}\n\n",
        "data: {\"token\": \"lo\"}\n\n",
        "data: {\"token\": \" there\"}\n\n",
        "data: {\"event\": \"done\"}\n\n",
    );

    fn decode_all(decoder: &mut StreamDecoder, input: &[u8]) -> Vec<StreamEvent> {
        let mut events = decoder.push_chunk(input);
        if let Some(evt) = decoder.finish() {
            events.push(evt);
        }
        events
    }

    fn tokens_of(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_unsplit_input_decodes_fully() {
        let mut decoder = StreamDecoder::new();
        let events = decode_all(&mut decoder, VALID_INPUT.as_bytes());
        assert_eq!(tokens_of(&events), vec!["Hel", "lo", " there"]);
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Complete(serde_json::json!("done")))
        );
    }

    #[test]
    fn test_any_chunk_partition_matches_unsplit_decode() {
        let mut reference = StreamDecoder::new();
        let expected = decode_all(&mut reference, VALID_INPUT.as_bytes());

        let bytes = VALID_INPUT.as_bytes();
        // Every single split point, including mid-field and mid-separator.
        for split in 1..bytes.len() {
            let mut decoder = StreamDecoder::new();
            let mut events = decoder.push_chunk(&bytes[..split]);
            events.extend(decoder.push_chunk(&bytes[split..]));
            if let Some(evt) = decoder.finish() {
                events.push(evt);
            }
            assert_eq!(events, expected, "split at byte {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time_decode() {
        let mut decoder = StreamDecoder::new();
        let mut events = Vec::new();
        for b in VALID_INPUT.as_bytes() {
            events.extend(decoder.push_chunk(&[*b]));
        }
        assert_eq!(tokens_of(&events), vec!["Hel", "lo", " there"]);
        assert!(decoder.is_finished());
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_multibyte_token_split_mid_character() {
        let input = "data: {\"token\": \"héllo\"}\n\ndata: {\"event\": \"done\"}\n\n";
        let bytes = input.as_bytes();
        // Split inside the two-byte 'é'.
        let split = input.find('é').unwrap() + 1;
        let mut decoder = StreamDecoder::new();
        let mut events = decoder.push_chunk(&bytes[..split]);
        events.extend(decoder.push_chunk(&bytes[split..]));
        assert_eq!(tokens_of(&events), vec!["héllo"]);
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let input = concat!(
            "data: {\"token\": \"a\"}\n\n",
            "data: {not json at all\n\n",
            "data: {\"token\": \"b\"}\n\n",
            "data: {\"event\": \"done\"}\n\n",
        );
        let mut decoder = StreamDecoder::new();
        let events = decode_all(&mut decoder, input.as_bytes());
        assert_eq!(tokens_of(&events), vec!["a", "b"]);
        assert!(matches!(events.last(), Some(StreamEvent::Complete(_))));
    }

    #[test]
    fn test_record_without_prefix_is_skipped() {
        let input = "noise\n\ndata: {\"token\": \"a\"}\n\ndata: {\"event\": \"done\"}\n\n";
        let mut decoder = StreamDecoder::new();
        let events = decode_all(&mut decoder, input.as_bytes());
        assert_eq!(tokens_of(&events), vec!["a"]);
    }

    #[test]
    fn test_complete_is_emitted_at_most_once() {
        let input = concat!(
            "data: {\"event\": \"done\"}\n\n",
            "data: {\"event\": \"done\"}\n\n",
            "data: {\"token\": \"late\"}\n\n",
        );
        let mut decoder = StreamDecoder::new();
        let events = decoder.push_chunk(input.as_bytes());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Complete(_)));
        // Defensive cutoff: later chunks produce nothing.
        assert!(decoder.push_chunk(b"data: {\"token\": \"x\"}\n\n").is_empty());
    }

    #[test]
    fn test_error_record_terminates_stream() {
        let input = concat!(
            "data: {\"token\": \"a\"}\n\n",
            "data: {\"error\": \"quota exceeded\"}\n\n",
            "data: {\"token\": \"b\"}\n\n",
        );
        let mut decoder = StreamDecoder::new();
        let events = decoder.push_chunk(input.as_bytes());
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            StreamEvent::Error(StreamFailure::Assistant("quota exceeded".into()))
        );
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_transport_close_without_terminal_is_error() {
        let mut decoder = StreamDecoder::new();
        let mut events = decoder.push_chunk(b"data: {\"token\": \"a\"}\n\n");
        events.extend(decoder.finish());
        assert_eq!(tokens_of(&events), vec!["a"]);
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Error(StreamFailure::UnexpectedEndOfStream))
        );
    }

    #[tokio::test]
    async fn test_decode_byte_stream_happy_path() {
        let chunks: Vec<Result<&[u8], std::io::Error>> = vec![
            Ok(b"data: {\"tok"),
            Ok(b"en\": \"Hi\"}\n\ndata: {\"event\""),
            Ok(b": \"done\"}\n\n"),
        ];
        let events: Vec<StreamEvent> = decode_byte_stream(stream::iter(chunks)).collect().await;
        assert_eq!(tokens_of(&events), vec!["Hi"]);
        assert!(matches!(events.last(), Some(StreamEvent::Complete(_))));
    }

    #[tokio::test]
    async fn test_decode_byte_stream_transport_error() {
        let chunks: Vec<Result<&[u8], std::io::Error>> = vec![
            Ok(b"data: {\"token\": \"Hi\"}\n\n"),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            )),
        ];
        let events: Vec<StreamEvent> = decode_byte_stream(stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            StreamEvent::Error(StreamFailure::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_decode_byte_stream_unexpected_end() {
        let chunks: Vec<Result<&[u8], std::io::Error>> =
            vec![Ok(b"data: {\"token\": \"Hi\"}\n\n")];
        let events: Vec<StreamEvent> = decode_byte_stream(stream::iter(chunks)).collect().await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Error(StreamFailure::UnexpectedEndOfStream))
        );
    }
}
