/// Bounded output capture for container streams.
///
/// Each stream is pumped on its own thread. Bytes within the limit are captured
/// and forwarded to the result channel as they arrive; bytes past the limit are
/// still drained so the container never blocks on a full pipe.
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex, MutexGuard};

const CHUNK_SIZE: usize = 4096;

/// Output limits configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLimits {
    /// Per-stream stdout limit (bytes)
    pub stdout_limit: usize,
    /// Per-stream stderr limit (bytes)
    pub stderr_limit: usize,
    /// How long to wait for pipes to close after the process exited (milliseconds)
    pub collection_timeout_ms: u64,
}

impl Default for OutputLimits {
    fn default() -> Self {
        OutputLimits {
            stdout_limit: 8 * 1024 * 1024, // 8 MB stdout
            stderr_limit: 2 * 1024 * 1024, // 2 MB stderr
            collection_timeout_ms: 5000,
        }
    }
}

/// Bytes captured from one stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedStream {
    pub data: Vec<u8>,
    /// Limit was hit and later bytes were dropped
    pub truncated: bool,
    /// Read failed before EOF
    pub read_error: Option<String>,
}

impl CapturedStream {
    pub fn into_text(self) -> String {
        match String::from_utf8(self.data) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }
}

/// Capture buffer shared between a pump thread and the supervisor.
///
/// The supervisor can take what has arrived so far even when the pump never
/// reaches EOF.
#[derive(Debug, Clone, Default)]
pub struct SharedCapture(Arc<Mutex<CapturedStream>>);

impl SharedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CapturedStream> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the bytes captured so far
    pub fn snapshot(&self) -> CapturedStream {
        self.lock().clone()
    }
}

/// Read `stream` to EOF into `capture`, keeping at most `limit` bytes.
///
/// `on_chunk` sees exactly the bytes that are captured, in order.
pub fn pump_into<R, F>(mut stream: R, limit: usize, capture: &SharedCapture, mut on_chunk: F)
where
    R: Read,
    F: FnMut(&[u8]),
{
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut kept = 0usize;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let keep = n.min(limit.saturating_sub(kept));
                if keep > 0 {
                    capture.lock().data.extend_from_slice(&chunk[..keep]);
                    kept += keep;
                    on_chunk(&chunk[..keep]);
                }
                if keep < n {
                    capture.lock().truncated = true;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // A closed pipe mid-read is how a killed container ends its output.
                if e.kind() != ErrorKind::BrokenPipe {
                    capture.lock().read_error = Some(e.to_string());
                }
                break;
            }
        }
    }
}

/// [`pump_into`] with a private buffer, returning the finished capture.
pub fn pump_stream<R, F>(stream: R, limit: usize, on_chunk: F) -> CapturedStream
where
    R: Read,
    F: FnMut(&[u8]),
{
    let capture = SharedCapture::new();
    pump_into(stream, limit, &capture, on_chunk);
    capture.snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_output_limits_default() {
        let limits = OutputLimits::default();
        assert_eq!(limits.stdout_limit, 8 * 1024 * 1024);
        assert_eq!(limits.stderr_limit, 2 * 1024 * 1024);
        assert_eq!(limits.collection_timeout_ms, 5000);
    }

    #[test]
    fn small_stream_is_captured_completely() {
        let mut forwarded = Vec::new();
        let captured = pump_stream(Cursor::new(b"hi\n".to_vec()), 1024, |c| {
            forwarded.extend_from_slice(c)
        });
        assert_eq!(captured.data, b"hi\n");
        assert!(!captured.truncated);
        assert_eq!(forwarded, b"hi\n");
    }

    #[test]
    fn stream_past_limit_is_truncated_and_drained() {
        let payload = vec![b'x'; 3 * CHUNK_SIZE + 17];
        let cursor = Cursor::new(payload);
        let mut forwarded = 0usize;
        let captured = pump_stream(cursor, 5000, |c| forwarded += c.len());
        assert_eq!(captured.data.len(), 5000);
        assert!(captured.truncated);
        assert_eq!(forwarded, 5000);
    }

    #[test]
    fn zero_limit_captures_nothing() {
        let captured = pump_stream(Cursor::new(b"abc".to_vec()), 0, |_| {
            panic!("nothing should be forwarded")
        });
        assert!(captured.data.is_empty());
        assert!(captured.truncated);
    }

    #[test]
    fn shared_capture_exposes_bytes_before_eof() {
        struct StallAfterFirstRead(bool);
        impl Read for StallAfterFirstRead {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0 {
                    return Err(std::io::Error::new(ErrorKind::Other, "stalled"));
                }
                self.0 = true;
                buf[..6].copy_from_slice(b"early\n");
                Ok(6)
            }
        }

        let capture = SharedCapture::new();
        pump_into(StallAfterFirstRead(false), 1024, &capture, |_| {});
        let seen = capture.snapshot();
        assert_eq!(seen.data, b"early\n");
        assert_eq!(seen.read_error.as_deref(), Some("stalled"));
    }

    #[test]
    fn invalid_utf8_is_replaced_lossily() {
        let captured = CapturedStream {
            data: vec![b'o', b'k', 0xff],
            ..CapturedStream::default()
        };
        assert_eq!(captured.into_text(), "ok\u{fffd}");
    }
}
