//! Byte channels with per-direction timeouts.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Any bidirectional async byte stream a transport can hand back.
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelIo for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelAccess {
    Read,
    #[default]
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelSharing {
    #[default]
    Exclusive,
    Shared,
}

/// How a channel should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub access: ChannelAccess,
    pub sharing: ChannelSharing,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

/// An open channel. Dropping it releases the underlying handle.
pub struct Channel {
    io: Box<dyn ChannelIo>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(io: impl ChannelIo + 'static, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self::from_boxed(Box::new(io), read_timeout, write_timeout)
    }

    /// For transports whose platform layer already hands back a boxed stream.
    pub fn from_boxed(io: Box<dyn ChannelIo>, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self { io, read_timeout, write_timeout }
    }

    pub fn read_timeout(&self) -> Duration { self.read_timeout }
    pub fn write_timeout(&self) -> Duration { self.write_timeout }

    /// Reads at most `buf.len()` bytes; `Ok(0)` means end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match timeout(self.read_timeout, self.io.read(buf)).await {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "channel read timed out")),
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match timeout(self.write_timeout, self.io.write_all(data)).await {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "channel write timed out")),
        }
    }

    /// Protocol-level close, bounded by the write timeout.
    pub async fn shutdown(mut self) -> io::Result<()> {
        match timeout(self.write_timeout, self.io.shutdown()).await {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "channel close timed out")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn reads_what_the_peer_writes() {
        let (local, mut remote) = duplex(64);
        let mut ch = Channel::new(local, Duration::from_secs(1), Duration::from_secs(1));
        remote.write_all(b"$GPGGA").await.unwrap();
        let mut buf = [0u8; 16];
        let n = ch.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$GPGGA");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (local, _remote) = duplex(64);
        let mut ch = Channel::new(local, Duration::from_millis(200), Duration::from_secs(1));
        let mut buf = [0u8; 16];
        let err = ch.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
