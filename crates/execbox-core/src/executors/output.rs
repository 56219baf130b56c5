use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Buffer filled by a reader task and read back by the runner, even if the
/// reader never sees EOF.
pub(crate) type SharedOutput = Arc<Mutex<OutputBuffer>>;

/// Byte buffer that keeps at most `limit` bytes and remembers whether it dropped any.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if data.len() > room {
            self.bytes.extend_from_slice(&data[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(data);
        }
    }

    pub(crate) fn shared(limit: usize) -> SharedOutput {
        Arc::new(Mutex::new(Self::new(limit)))
    }

    pub(crate) fn text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(&format!("\n[output truncated at {} bytes]\n", self.limit));
        }
        text
    }

    /// Drain a pipe to EOF into `buffer`, keeping only what fits.
    pub(crate) async fn drain<R: AsyncRead + Unpin>(mut reader: R, buffer: SharedOutput) {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    lock(&buffer).push(&chunk[..n]);
                }
                Err(e) => {
                    log::debug!("Stopped reading sandbox output: {}", e);
                    break;
                }
            }
        }
    }
}

/// Lock a shared buffer; a poisoned lock still yields the bytes read so far.
pub(crate) fn lock(buffer: &SharedOutput) -> std::sync::MutexGuard<'_, OutputBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}
