use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::watch,
};

use crate::protocol::{LineError, LineReader};

/// A single accepted client stream, together with its private line buffer.
pub struct Connection<S> {
    id: u64,
    reader: LineReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("{0}")]
    Read(#[from] LineError),

    #[error("{0}")]
    Write(#[from] tokio::io::Error),
}

impl<S> Connection<S>
where
    S: Unpin,
    S: AsyncRead,
    S: AsyncWrite,
{
    pub fn new(id: u64, stream: S, max_line_len: usize) -> Self {
        let (reader, writer) = tokio::io::split(stream);

        Self {
            id,
            reader: LineReader::new(reader, max_line_len),
            writer,
        }
    }

    /// Echoes every completed line back to the peer, in arrival order, until
    /// the peer closes the stream, an I/O error occurs, or the shutdown
    /// controller force-closes the connection.
    pub async fn serve(mut self, mut forced: watch::Receiver<bool>) -> Result<(), ConnectionError> {
        let id = self.id;

        loop {
            // one read-frame-write cycle; a line is written back in full
            // before the next one is taken
            let cycle = async {
                let Some(line) = self.reader.next_line().await? else {
                    return Ok::<bool, ConnectionError>(false);
                };

                self.writer.write_all(&line).await?;
                self.writer.flush().await?;

                Ok(true)
            };

            tokio::select! {
                // the drain window has expired, the server is closing us
                _ = forced.wait_for(|forced| *forced) => {
                    tracing::debug!(id, "connection force-closed on shutdown");
                    return Ok(());
                }
                keep_serving = cycle => if !keep_serving? {
                    // the peer hung up, normal termination
                    return Ok(());
                },
            }
        }
    }
}
