//! Byte-stream channels carrying length-prefixed CBOR frames.

use std::collections::VecDeque;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Channel, EnvelopeSink, EnvelopeSource};
use crate::codec::{frame_encode, FrameDecoder};
use crate::error::{WdbError, WdbResult};
use crate::messages::Envelope;

/// Buffer size for `tokio::io::duplex` pipes (64 KiB).
const DUPLEX_BUFFER: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

struct FramedSink<W> {
    writer: W,
}

impl<W> EnvelopeSink for FramedSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn send<'a>(&'a mut self, envelope: &'a Envelope) -> BoxFuture<'a, WdbResult<()>> {
        Box::pin(async move {
            let frame = frame_encode(envelope)?;
            self.writer
                .write_all(&frame)
                .await
                .map_err(|e| WdbError::Transport(format!("write failed: {e}")))?;
            self.writer
                .flush()
                .await
                .map_err(|e| WdbError::Transport(format!("flush failed: {e}")))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, WdbResult<()>> {
        Box::pin(async move {
            self.writer.shutdown().await?;
            Ok(())
        })
    }
}

struct FramedSource<R> {
    reader: R,
    decoder: FrameDecoder,
    ready: VecDeque<Envelope>,
    buf: Vec<u8>,
}

impl<R> EnvelopeSource for FramedSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn recv(&mut self) -> BoxFuture<'_, WdbResult<Option<Envelope>>> {
        Box::pin(async move {
            loop {
                if let Some(envelope) = self.ready.pop_front() {
                    return Ok(Some(envelope));
                }

                let n = self.reader.read(&mut self.buf).await?;
                if n == 0 {
                    if self.decoder.pending() > 0 {
                        return Err(WdbError::Transport(format!(
                            "stream ended inside a frame ({} bytes buffered)",
                            self.decoder.pending()
                        )));
                    }
                    return Ok(None);
                }

                let decoded: Vec<Envelope> = self.decoder.feed(&self.buf[..n])?;
                self.ready.extend(decoded);
            }
        })
    }
}

/// Build a channel from a reader/writer pair (e.g. a child's stdout/stdin).
pub fn framed<R, W>(reader: R, writer: W) -> Channel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    Channel::new(
        Box::new(FramedSink { writer }),
        Box::new(FramedSource {
            reader,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            buf: vec![0u8; READ_CHUNK],
        }),
    )
}

/// Two framed channel ends connected through an in-memory byte pipe.
pub fn duplex_pair() -> (Channel, Channel) {
    let (a, b) = tokio::io::duplex(DUPLEX_BUFFER);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (framed(a_read, a_write), framed(b_read, b_write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;

    fn toggle(id: u32, enable: bool) -> Envelope {
        Envelope::Request(Request {
            request_id: id,
            payload: RequestPayload::ToggleUpdateStream(ToggleUpdateStreamPayload {
                database_id: 9,
                enable,
            }),
        })
    }

    #[tokio::test]
    async fn carries_envelopes_in_order() {
        let (mut a, mut b) = duplex_pair();
        for id in 0..10 {
            a.send(&toggle(id, id % 2 == 0)).await.unwrap();
        }
        for id in 0..10 {
            assert_eq!(b.recv().await.unwrap(), Some(toggle(id, id % 2 == 0)));
        }
    }

    #[tokio::test]
    async fn dropped_peer_ends_stream() {
        let (a, mut b) = duplex_pair();
        drop(a);
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_frame_is_a_transport_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut channel = framed(server, tokio::io::sink());

        let frame = frame_encode(&toggle(1, true)).unwrap();
        client.write_all(&frame[..frame.len() - 1]).await.unwrap();
        drop(client);

        assert!(matches!(channel.recv().await, Err(WdbError::Transport(_))));
    }
}
