use crate::error::{ProbeError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;

/// How a read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The prompt marker was found.
    Complete,
    /// The deadline passed before the marker arrived.
    TimedOut,
    /// The peer closed the stream before the marker arrived.
    Eof,
}

/// Text received for one request, with the trailing prompt marker removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub text: String,
    pub status: FrameStatus,
}

impl Frame {
    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: FrameStatus::Complete,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == FrameStatus::Complete
    }
}

/// A line-oriented, prompt-framed connection to the remote interpreter.
#[async_trait]
pub trait LineTransport: Send {
    /// Write `line` followed by a newline.
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Accumulate input until the prompt marker or `timeout`.
    ///
    /// Timeouts and EOF are reported through [`FrameStatus`]; only socket
    /// failures are errors. A response that turns up after its own read
    /// timed out is dropped, never returned for a later request.
    async fn read_until_marker(&mut self, timeout: Duration) -> Result<Frame>;

    /// Release the connection. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// TCP implementation of [`LineTransport`].
pub struct TcpSession {
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
    marker: Vec<u8>,
    peer: String,
    /// A line was sent and its response has not been framed yet.
    awaiting: bool,
    /// Responses to timed-out requests that may still arrive.
    owed: usize,
}

impl TcpSession {
    /// Connect to `host:port`, bounded by `connect_timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        marker: &str,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let peer = format!("{host}:{port}");
        debug!("Connecting to {}", peer);

        let stream = match timeout(connect_timeout, TcpStream::connect(peer.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProbeError::transport(format!("connecting to {peer}"), e)),
            Err(_) => return Err(ProbeError::ConnectTimeout { addr: peer }),
        };
        // Requests are one short line each; don't let Nagle batch them.
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: Some(stream),
            buffer: Vec::with_capacity(READ_CHUNK),
            marker: marker.as_bytes().to_vec(),
            peer,
            awaiting: false,
            owed: 0,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(|| {
            ProbeError::transport(
                "using a closed session",
                std::io::Error::from(std::io::ErrorKind::NotConnected),
            )
        })
    }

    /// Split off everything before the last marker currently buffered.
    fn take_framed(&mut self) -> Option<String> {
        let last = rfind_subslice(&self.buffer, &self.marker)?;
        let rest = self.buffer.split_off(last + self.marker.len());
        self.buffer.truncate(last);
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer = rest;
        Some(text)
    }

    fn take_partial(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        text
    }

    /// Drop buffered responses that belong to earlier timed-out requests.
    ///
    /// Returns true once nothing is owed, so the buffer holds only the
    /// current response.
    fn discard_owed(&mut self) -> bool {
        while self.owed > 0 {
            let Some(first) = find_subslice(&self.buffer, &self.marker) else {
                return false;
            };
            let stale: Vec<u8> = self.buffer.drain(..first + self.marker.len()).collect();
            self.owed -= 1;
            debug!(
                "Discarded late response from {}: {:?}",
                self.peer,
                String::from_utf8_lossy(&stale[..first])
            );
        }
        true
    }

    fn take_current(&mut self) -> Option<String> {
        if self.discard_owed() {
            self.take_framed()
        } else {
            None
        }
    }

    fn finish(&mut self, status: FrameStatus) -> Frame {
        let partial = self.take_partial();
        // While an earlier response is outstanding, buffered bytes may be its tail.
        let text = if self.owed > 0 { String::new() } else { partial };
        if status == FrameStatus::TimedOut && self.awaiting {
            self.owed += 1;
        }
        self.awaiting = false;
        Frame { text, status }
    }
}

#[async_trait]
impl LineTransport for TcpSession {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        trace!("> {}", line);
        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');

        let stream = self.stream_mut()?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| ProbeError::transport(format!("sending {line:?}"), e))?;
        self.awaiting = true;
        Ok(())
    }

    async fn read_until_marker(&mut self, wait: Duration) -> Result<Frame> {
        if let Some(text) = self.take_current() {
            self.awaiting = false;
            return Ok(Frame::complete(text));
        }

        let deadline = Instant::now() + wait;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(self.finish(FrameStatus::TimedOut));
            }

            let stream = self.stream_mut()?;
            let read = timeout(remaining, stream.read(&mut chunk)).await;
            match read {
                Err(_) => return Ok(self.finish(FrameStatus::TimedOut)),
                Ok(Ok(0)) => {
                    debug!("Peer {} closed the stream", self.peer);
                    return Ok(self.finish(FrameStatus::Eof));
                }
                Ok(Ok(n)) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    if let Some(text) = self.take_current() {
                        trace!("< {:?}", text);
                        self.awaiting = false;
                        return Ok(Frame::complete(text));
                    }
                }
                Ok(Err(e)) => {
                    return Err(ProbeError::transport("reading a response", e));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!("Closing session to {}", self.peer);
            // The peer may already be gone; shutdown failures don't matter here.
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    const PROMPT: &str = ">>> ";

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn connect(port: u16) -> TcpSession {
        TcpSession::connect("127.0.0.1", port, PROMPT, Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[test]
    fn test_rfind_subslice() {
        assert_eq!(rfind_subslice(b"a>>> b>>> ", b">>> "), Some(6));
        assert_eq!(rfind_subslice(b"abc", b">>> "), None);
        assert_eq!(rfind_subslice(b"abc", b""), None);
        assert_eq!(find_subslice(b"a>>> b>>> ", b">>> "), Some(1));
    }

    #[tokio::test]
    async fn test_reads_text_before_last_marker() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"welcome\n>>> ").await.unwrap();
            let mut line = [0u8; 16];
            let n = sock.read(&mut line).await.unwrap();
            assert_eq!(&line[..n], b"bb\n");
            // Marker split across writes
            sock.write_all(b"110\n>>").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            sock.write_all(b"> ").await.unwrap();
        });

        let mut session = connect(port).await;
        let banner = session
            .read_until_marker(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(banner, Frame::complete("welcome\n"));

        session.send_line("bb").await.unwrap();
        let frame = session
            .read_until_marker(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(frame, Frame::complete("110\n"));

        session.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_returns_partial_text() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"partial").await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
        });

        let mut session = connect(port).await;
        let frame = session
            .read_until_marker(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(frame.status, FrameStatus::TimedOut);
        assert_eq!(frame.text, "partial");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_reply_is_dropped() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = sock.into_split();
            let mut lines = tokio::io::BufReader::new(read_half).lines();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "first");
            tokio::time::sleep(Duration::from_millis(200)).await;
            write_half.write_all(b"stop breaking").await.unwrap();
            write_half.write_all(b" things\n>>> ").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "second");
            write_half.write_all(b"2\n>>> ").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "third");
            write_half.write_all(b"3\n>>> ").await.unwrap();
        });

        let mut session = connect(port).await;
        session.send_line("first").await.unwrap();
        let frame = session
            .read_until_marker(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(frame.status, FrameStatus::TimedOut);

        session.send_line("second").await.unwrap();
        let frame = session
            .read_until_marker(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(frame, Frame::complete("2\n"));

        session.send_line("third").await.unwrap();
        let frame = session
            .read_until_marker(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(frame, Frame::complete("3\n"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_banner_owes_nothing() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = sock.into_split();
            let mut lines = tokio::io::BufReader::new(read_half).lines();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "b");
            write_half.write_all(b"1\n>>> ").await.unwrap();
        });

        let mut session = connect(port).await;
        let banner = session
            .read_until_marker(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(banner.status, FrameStatus::TimedOut);

        session.send_line("b").await.unwrap();
        let frame = session
            .read_until_marker(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(frame, Frame::complete("1\n"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_is_not_an_error() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"bye").await.unwrap();
        });

        let mut session = connect(port).await;
        server.await.unwrap();
        let frame = session
            .read_until_marker(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(frame.status, FrameStatus::Eof);
        assert_eq!(frame.text, "bye");
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let (listener, port) = listener().await;
        drop(listener);

        let result =
            TcpSession::connect("127.0.0.1", port, PROMPT, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ProbeError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let _ = listener.accept().await.unwrap();
        });

        let mut session = connect(port).await;
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(session.send_line("b").await.is_err());
        server.await.unwrap();
    }
}
