use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads newline terminated lines out of a raw byte stream.
///
/// Bytes are buffered until a `\n` shows up; whatever follows the terminator
/// stays in the buffer for the next call.
pub struct LineReader<R> {
    reader: R,
    buffer: BytesMut,
    // bytes already scanned for a terminator on previous calls
    scanned: usize,
    max_line_len: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum LineError {
    #[error("{0}")]
    Io(#[from] tokio::io::Error),

    #[error("line exceeded {0} bytes without a terminator")]
    TooLong(usize),
}

impl<R> LineReader<R>
where
    R: Unpin,
    R: AsyncRead,
{
    pub fn new(reader: R, max_line_len: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::new(),
            scanned: 0,
            max_line_len,
        }
    }

    /// Returns the next complete line, including its terminator.
    ///
    /// Returns `None` once the peer has closed the stream; buffered bytes
    /// that never received a terminator are dropped at that point.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>, LineError> {
        loop {
            // check if a terminator arrived
            for idx in self.scanned..self.buffer.len() {
                if self.buffer[idx] == b'\n' {
                    // emit the line and remove it from the buffer
                    let line = self.buffer[..=idx].to_vec();
                    self.buffer.advance(idx + 1);
                    self.scanned = 0;
                    return Ok(Some(line));
                }
            }

            // everything buffered so far has been checked
            self.scanned = self.buffer.len();
            if self.scanned > self.max_line_len {
                return Err(LineError::TooLong(self.max_line_len));
            }

            // read some new data into the buffer
            let rcount = self.reader.read_buf(&mut self.buffer).await?;
            if rcount == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!("dropping {} unterminated bytes at eof", self.buffer.len());
                }
                return Ok(None);
            }
        }
    }
}
