/// Bounded capture of a child's stdout/stderr.
///
/// Runaway tools (hashcat status spam, `strings` on a 4 GiB image) must not
/// grow the parent's memory without limit, so each stream keeps at most
/// `limit` bytes and only counts the rest.
use crate::events::{EventBus, JobEvent, OutputStream};
use serde::{Serialize, Serializer};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 8 * 1024;

/// Output captured from one stream of a finished job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    /// The first `limit` bytes the stream produced.
    #[serde(rename = "text", serialize_with = "serialize_lossy")]
    pub bytes: Vec<u8>,
    /// Everything the stream produced, including dropped bytes.
    pub total_bytes: u64,
    pub truncated: bool,
}

fn serialize_lossy<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

impl CapturedOutput {
    /// Lossy UTF-8 view of the kept bytes.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Append-only buffer that stops storing once `limit` is reached.
#[derive(Debug)]
pub struct BoundedBuffer {
    limit: usize,
    data: Vec<u8>,
    total: u64,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            data: Vec::new(),
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
    }

    pub fn snapshot(&self) -> CapturedOutput {
        CapturedOutput {
            bytes: self.data.clone(),
            total_bytes: self.total,
            truncated: self.total > self.data.len() as u64,
        }
    }
}

pub(crate) type SharedBuffer = Arc<Mutex<BoundedBuffer>>;

pub(crate) fn shared_buffer(limit: usize) -> SharedBuffer {
    Arc::new(Mutex::new(BoundedBuffer::new(limit)))
}

pub(crate) fn snapshot(buffer: &SharedBuffer) -> CapturedOutput {
    buffer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .snapshot()
}

/// Drain `reader` into `buffer` until EOF, forwarding every chunk to the bus.
pub(crate) fn pump<R>(
    mut reader: R,
    job: String,
    stream: OutputStream,
    buffer: SharedBuffer,
    events: EventBus,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(job = %job, ?stream, error = %e, "output pipe read failed");
                    break;
                }
            };
            buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(&chunk[..n]);
            events.publish(JobEvent::Output {
                name: job.clone(),
                stream,
                text: String::from_utf8_lossy(&chunk[..n]).into_owned(),
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_keeps_everything_under_limit() {
        let mut buf = BoundedBuffer::new(16);
        buf.push(b"flag{");
        buf.push(b"abc}");
        let out = buf.snapshot();
        assert_eq!(out.text(), "flag{abc}");
        assert_eq!(out.total_bytes, 9);
        assert!(!out.truncated);
    }

    #[test]
    fn test_buffer_truncates_and_keeps_counting() {
        let mut buf = BoundedBuffer::new(4);
        buf.push(b"ABCDEF");
        buf.push(b"GH");
        let out = buf.snapshot();
        assert_eq!(out.bytes, b"ABCD");
        assert_eq!(out.total_bytes, 8);
        assert!(out.truncated);
    }

    #[test]
    fn test_zero_limit_stores_nothing() {
        let mut buf = BoundedBuffer::new(0);
        buf.push(b"x");
        let out = buf.snapshot();
        assert!(out.bytes.is_empty());
        assert!(out.truncated);
    }

    #[test]
    fn test_json_carries_text_and_counts() {
        let mut buf = BoundedBuffer::new(5);
        buf.push(b"flag{truncated}");
        let json = serde_json::to_value(buf.snapshot()).unwrap();
        assert_eq!(json["text"], "flag{");
        assert_eq!(json["total_bytes"], 15);
        assert_eq!(json["truncated"], true);
    }

    #[tokio::test]
    async fn test_pump_reads_to_eof_and_publishes() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let buffer = shared_buffer(1024);

        let reader: &'static [u8] = b"hello from a tool";
        pump(
            reader,
            "job".to_string(),
            OutputStream::Stdout,
            buffer.clone(),
            bus.clone(),
        )
        .await
        .unwrap();

        assert_eq!(snapshot(&buffer).text(), "hello from a tool");
        match rx.recv().await.unwrap() {
            JobEvent::Output { name, stream, text } => {
                assert_eq!(name, "job");
                assert_eq!(stream, OutputStream::Stdout);
                assert_eq!(text, "hello from a tool");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
