//! NUL-delimited framing used by `--remote-debugging-pipe`.

/// Accumulates raw pipe bytes and yields complete messages without their terminator.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_capacity(64 * 1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            scanned: 0,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete frame. Empty frames between consecutive terminators are skipped.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(rel) = self.buf[self.scanned..].iter().position(|b| *b == 0) else {
                self.scanned = self.buf.len();
                return None;
            };
            let idx = self.scanned + rel;
            let mut frame: Vec<u8> = self.buf.drain(..=idx).collect();
            frame.pop();
            self.scanned = 0;
            if !frame.is_empty() {
                return Some(frame);
            }
        }
    }

    /// Bytes received after the last terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Append `payload` and the terminator to `out`.
pub fn encode_frame(out: &mut Vec<u8>, payload: &[u8]) {
    out.reserve(payload.len() + 1);
    out.extend_from_slice(payload);
    out.push(0);
}
