use crate::error::{ErrorType, NetworkError, NetworkResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The maximum frame size allowed on a TCP session, tightened/loosened at phase boundaries
/// (spec.md §4.1). Checked against the length header *before* the payload buffer is allocated,
/// so an oversized frame never causes an allocation of its claimed size.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameLimit {
    PreAuth,
    PreTlsSetup,
    PostTlsSetup,
    PostAuth,
}

impl FrameLimit {
    #[inline]
    pub fn max_bytes(self) -> u32 {
        match self {
            FrameLimit::PreAuth => 64,
            FrameLimit::PreTlsSetup => 4 * 1024,
            FrameLimit::PostTlsSetup => 16 * 1024,
            FrameLimit::PostAuth => 32 * 1024,
        }
    }
}

/// Length-prefixed (`u32`, network byte order) message framing over any async byte stream.
/// A single instance is reused across the lifetime of a TCP session; the stream underneath
/// is swapped out for a TLS-wrapped one in place once the handshake completes (see
/// `reflector-net::tls`).
pub struct FramedTransport<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedTransport<S> {
    #[inline]
    pub fn new(stream: S) -> Self {
        FramedTransport { stream }
    }

    #[inline]
    pub fn into_inner(self) -> S {
        self.stream
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Reads one length-prefixed frame, rejecting it without allocating a payload buffer if
    /// the declared length exceeds `limit`.
    pub async fn read_frame(&mut self, limit: FrameLimit) -> NetworkResult<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| map_eof(e))?;
        let len = u32::from_be_bytes(len_buf);

        if len > limit.max_bytes() {
            return Err(NetworkError::Fatal(ErrorType::FrameTooLarge));
        }

        let mut payload = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| map_eof(e))?;

        Ok(payload)
    }

    /// Writes one length-prefixed frame. A short write anywhere in the sequence is treated as
    /// fatal — per spec.md §4.1 a partial write must trigger disconnect, never a retry of the
    /// remaining bytes, since state between caller and peer would otherwise diverge.
    pub async fn write_frame(&mut self, payload: &[u8]) -> NetworkResult<()> {
        if payload.len() > u32::MAX as usize {
            return Err(NetworkError::Fatal(ErrorType::FrameTooLarge));
        }

        let len = (payload.len() as u32).to_be_bytes();
        self.stream.write_all(&len).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[inline]
fn map_eof(err: std::io::Error) -> NetworkError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        NetworkError::Fatal(ErrorType::Truncated)
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn roundtrip_frame() {
        let (client, server) = duplex(4096);
        let mut client = FramedTransport::new(client);
        let mut server = FramedTransport::new(server);

        client.write_frame(b"hello").await.unwrap();
        let got = server.read_frame(FrameLimit::PostAuth).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn oversize_pre_auth_frame_rejected() {
        let (client, server) = duplex(4096);
        let mut client = FramedTransport::new(client);
        let mut server = FramedTransport::new(server);

        let payload = vec![0u8; 65];
        client.write_frame(&payload).await.unwrap();

        let err = server.read_frame(FrameLimit::PreAuth).await.unwrap_err();
        assert!(matches!(err, NetworkError::Fatal(ErrorType::FrameTooLarge)));
    }

    #[tokio::test]
    async fn exact_limit_frame_accepted() {
        let (client, server) = duplex(4096);
        let mut client = FramedTransport::new(client);
        let mut server = FramedTransport::new(server);

        let payload = vec![7u8; 64];
        client.write_frame(&payload).await.unwrap();

        let got = server.read_frame(FrameLimit::PreAuth).await.unwrap();
        assert_eq!(got.len(), 64);
    }
}
