use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::net::{TcpStream, UdpSocket};
use tracing::trace;

/// This is an abstraction for the byte stream (or datagram flow) underneath a channel,
///  introduced to facilitate mocking the I/O part away for testing.
///
/// Both operations take `&self` and must be cancel safe: the channel pumps race them against
///  state-change notifications in `select!` loops. Encryption, if any, happens below this seam.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportStream: Send + Sync + 'static {
    /// Read the next chunk of up to `max_len` bytes. An empty chunk signals a clean end of
    ///  stream; anything the peer sent is returned as soon as it is available, without waiting
    ///  for `max_len` bytes.
    async fn read_chunk(&self, max_len: usize) -> anyhow::Result<Bytes>;

    /// Write a prefix of `buf`, returning how many bytes the transport accepted. This may be
    ///  less than `buf.len()` - the caller is responsible for retrying the remainder.
    async fn write_chunk(&self, buf: &[u8]) -> anyhow::Result<usize>;
}

#[async_trait]
impl TransportStream for TcpStream {
    async fn read_chunk(&self, max_len: usize) -> anyhow::Result<Bytes> {
        let mut buf = vec![0u8; max_len];
        loop {
            self.readable().await.context("waiting for transport to become readable")?;

            // readable() can yield spuriously, so WouldBlock just means 'wait again'
            match self.try_read(&mut buf) {
                Ok(n) => {
                    trace!("read {} bytes from TCP transport", n);
                    buf.truncate(n);
                    return Ok(Bytes::from(buf));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn write_chunk(&self, buf: &[u8]) -> anyhow::Result<usize> {
        loop {
            self.writable().await.context("waiting for transport to become writable")?;

            match self.try_write(buf) {
                Ok(n) => {
                    trace!("wrote {} of {} bytes to TCP transport", n, buf.len());
                    return Ok(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Datagram transport for the unreliable channel roles. The socket must be connected to the
///  peer; one chunk is one datagram, and loss or reordering is visible to the consumer - this
///  layer adds no retransmission.
#[async_trait]
impl TransportStream for UdpSocket {
    async fn read_chunk(&self, max_len: usize) -> anyhow::Result<Bytes> {
        let mut buf = vec![0u8; max_len];
        let n = self.recv(&mut buf).await?;
        trace!("received datagram of {} bytes", n);
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write_chunk(&self, buf: &[u8]) -> anyhow::Result<usize> {
        // datagrams are all-or-nothing, there is no partial acceptance
        let n = self.send(buf).await?;
        trace!("sent datagram of {} bytes", n);
        Ok(n)
    }
}
