use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{FrameError, Result, TuyaError};
use crate::protocol::frame::{self, Message};

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_factor: f64,
    /// Wait before the first retry.
    pub min_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            backoff_factor: 1.5,
            min_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// The wait before each retry, in order. Never shrinks.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let min = self.min_backoff;
        let factor = self.backoff_factor.max(1.0);
        (0..self.max_retries).map(move |n| min.mul_f64(factor.powi(n as i32)))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delays = self.delays();
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            let Some(delay) = delays.next() else {
                warn!("Giving up after {} attempts: {}", attempt, err);
                return Err(err);
            };

            warn!("Attempt {} failed: {}. Retrying in {:?}", attempt, err, delay);
            tokio::select! {
                _ = cancel.cancelled() => return Err(TuyaError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Delivers one frame per call over a fresh TCP connection and returns the
/// decoded reply, retrying transient failures.
///
/// Connect and response phases have separate timeouts; a connect timeout is
/// reported as [`TuyaError::ConnectTimeout`], never as a response timeout.
#[derive(Debug, Clone)]
pub struct RetryingTransport {
    port: u16,
    connect_timeout: Duration,
    retry: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            port: config.port,
            connect_timeout: config.connect_timeout,
            retry: config.retry,
        }
    }

    /// Send `frame` to the device at `ip` and decode its reply.
    ///
    /// Fails with [`TuyaError::MissingAddress`] before any I/O if `ip` is
    /// absent or blank. Frame decode errors are returned at once without
    /// consuming the retry budget.
    pub async fn send(
        &self,
        ip: Option<&str>,
        frame: &[u8],
        response_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let ip = match ip.map(str::trim) {
            Some(ip) if !ip.is_empty() => ip,
            _ => return Err(TuyaError::MissingAddress),
        };

        let reply = self
            .retry
            .run(cancel, move |attempt| {
                self.attempt(ip, frame, response_timeout, cancel, attempt)
            })
            .await?;

        let message = frame::decode_reply(&reply)?;
        debug!(
            "Decoded reply from {}: command=0x{:02x} return_code={:?}",
            ip, message.command, message.return_code
        );
        Ok(message)
    }

    /// One connect, write, await cycle. The socket is dropped on every exit path.
    async fn attempt(
        &self,
        ip: &str,
        frame: &[u8],
        response_timeout: Duration,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<Vec<u8>> {
        let addr = format!("{}:{}", ip, self.port);
        debug!("Attempt {}: connecting to {}", attempt, addr);

        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(TuyaError::Cancelled),
            r = bounded_connect(TcpStream::connect((ip, self.port)), &addr, self.connect_timeout) => r?,
        };

        if let Err(source) = stream.write_all(frame).await {
            return Err(TuyaError::Connection { addr, source });
        }
        debug!("Sent {} bytes to {}", frame.len(), addr);

        let received = tokio::select! {
            _ = cancel.cancelled() => return Err(TuyaError::Cancelled),
            r = timeout(response_timeout, read_frame(&mut stream)) => r,
        };
        match received {
            Ok(Ok(buf)) => {
                debug!("Received {} bytes from {}", buf.len(), addr);
                Ok(buf)
            }
            Ok(Err(ReadError::Io(source))) => Err(TuyaError::Connection { addr, source }),
            Ok(Err(ReadError::Frame(e))) => Err(TuyaError::Frame(e)),
            Err(_) => Err(TuyaError::ResponseTimeout {
                addr,
                timeout: response_timeout,
            }),
        }
    }
}

/// Apply the connect timeout. An elapsed timer is a [`TuyaError::ConnectTimeout`],
/// a failed connect a [`TuyaError::Connection`]; both are retryable.
async fn bounded_connect<S, F>(connect: F, addr: &str, limit: Duration) -> Result<S>
where
    F: Future<Output = std::io::Result<S>>,
{
    match timeout(limit, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(TuyaError::Connection {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(TuyaError::ConnectTimeout {
            addr: addr.to_string(),
            timeout: limit,
        }),
    }
}

enum ReadError {
    Io(std::io::Error),
    Frame(FrameError),
}

/// Read until a whole frame is buffered. A bad prefix or an out-of-range
/// length fails as soon as the header shows it. A peer that closes early
/// yields whatever arrived, which the decoder then rejects.
async fn read_frame<R>(stream: &mut R) -> std::result::Result<Vec<u8>, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    loop {
        if let Some(len) = frame::frame_len(&buf).map_err(ReadError::Frame)? {
            if buf.len() >= len {
                return Ok(buf);
            }
        }
        let read = stream.read_buf(&mut buf).await.map_err(ReadError::Io)?;
        if read == 0 {
            if buf.is_empty() {
                return Err(ReadError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            return Ok(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::net::TcpListener;

    use crate::protocol::frame::{CommandType, Payload};

    fn refused() -> TuyaError {
        TuyaError::Connection {
            addr: "10.0.0.9:6668".into(),
            source: std::io::ErrorKind::ConnectionRefused.into(),
        }
    }

    fn config(port: u16, retries: u32) -> ClientConfig {
        ClientConfig {
            port,
            connect_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_retries: retries,
                backoff_factor: 1.5,
                min_backoff: Duration::from_millis(10),
            },
        }
    }

    #[test]
    fn test_default_delays() {
        let delays: Vec<Duration> = RetryPolicy::default().delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10_000),
                Duration::from_millis(15_000),
                Duration::from_millis(22_500),
                Duration::from_millis(33_750),
            ]
        );
    }

    #[test]
    fn test_delays_never_shrink() {
        let policy = RetryPolicy {
            max_retries: 6,
            backoff_factor: 0.5,
            min_backoff: Duration::from_secs(2),
        };
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays.len(), 6);
        assert!(delays.iter().all(|d| *d >= policy.min_backoff));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_five_attempts() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<()> = policy
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(refused()) }
            })
            .await;

        assert!(matches!(result, Err(TuyaError::Connection { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let total: Duration = policy.delays().sum();
        assert!(started.elapsed() >= total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_returns_at_once() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::default()
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TuyaError::UnexpectedResponse("garbage".into())) }
            })
            .await;

        assert!(matches!(result, Err(TuyaError::UnexpectedResponse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let result = RetryPolicy::default()
            .run(&CancellationToken::new(), |attempt| async move {
                if attempt < 3 { Err(refused()) } else { Ok(attempt) }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let result: Result<()> = RetryPolicy::default()
            .run(&cancel, |_| {
                trigger.cancel();
                async { Err(refused()) }
            })
            .await;
        assert!(matches!(result, Err(TuyaError::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_address_fails_fast() {
        let transport = RetryingTransport::new(&ClientConfig::default());
        let frame = frame::encode(b"{}", CommandType::Query);
        let cancel = CancellationToken::new();

        for ip in [None, Some(""), Some("   ")] {
            let result = transport
                .send(ip, &frame, Duration::from_secs(10), &cancel)
                .await;
            assert!(matches!(result, Err(TuyaError::MissingAddress)));
        }
    }

    #[tokio::test]
    async fn test_response_timeout_is_not_connect_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicU32::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });

        let transport = RetryingTransport::new(&config(port, 0));
        let frame = frame::encode(b"{}", CommandType::Query);
        let result = transport
            .send(
                Some("127.0.0.1"),
                &frame,
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(TuyaError::ResponseTimeout { .. })));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_connection_is_retried_then_surfaced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = RetryingTransport::new(&config(port, 2));
        let frame = frame::encode(b"{}", CommandType::Query);
        let result = transport
            .send(
                Some("127.0.0.1"),
                &frame,
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(TuyaError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_reply_is_decoded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let reply = frame::encode(br#"{"dps":{"1":true}}"#, CommandType::Query);
            // Split the reply to exercise reassembly.
            socket.write_all(&reply[..10]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(&reply[10..]).await.unwrap();
        });

        let transport = RetryingTransport::new(&config(port, 0));
        let frame = frame::encode(b"{}", CommandType::Query);
        let message = transport
            .send(
                Some("127.0.0.1"),
                &frame,
                Duration::from_secs(2),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(message.command_type(), Some(CommandType::Query));
        assert!(matches!(message.payload, Payload::Json(_)));
    }

    #[tokio::test]
    async fn test_corrupt_reply_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicU32::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let mut reply = frame::encode(br#"{"dps":{}}"#, CommandType::Query).to_vec();
                reply[frame::HEADER_SIZE] ^= 0xff;
                let _ = socket.write_all(&reply).await;
            }
        });

        let transport = RetryingTransport::new(&config(port, 3));
        let frame = frame::encode(b"{}", CommandType::Query);
        let result = transport
            .send(
                Some("127.0.0.1"),
                &frame,
                Duration::from_secs(2),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(TuyaError::Frame(crate::error::FrameError::ChecksumMismatch { .. }))
        ));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bad_header_fails_without_waiting_or_retrying() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicU32::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let mut junk = vec![0u8; 24];
                junk[0..4].copy_from_slice(&0xdead_beefu32.to_be_bytes());
                junk[12..16].copy_from_slice(&0x7fff_ffffu32.to_be_bytes());
                let _ = socket.write_all(&junk).await;
                held.push(socket);
            }
        });

        let transport = RetryingTransport::new(&config(port, 2));
        let frame = frame::encode(b"{}", CommandType::Query);
        let result = transport
            .send(
                Some("127.0.0.1"),
                &frame,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(TuyaError::Frame(FrameError::InvalidPrefix(0xdead_beef)))
        ));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let mut header = frame::encode(b"", CommandType::Query)[..frame::HEADER_SIZE].to_vec();
        header[12..16].copy_from_slice(&0x7fff_ffffu32.to_be_bytes());
        let (mut device, mut client) = tokio::io::duplex(64);
        device.write_all(&header).await.unwrap();

        let result = read_frame(&mut client).await;
        assert!(matches!(
            result,
            Err(ReadError::Frame(FrameError::InvalidLength(0x7fff_ffff)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connect_is_connect_timeout() {
        let limit = Duration::from_secs(1);
        let result: Result<()> = bounded_connect(
            std::future::pending::<std::io::Result<()>>(),
            "10.255.255.1:6668",
            limit,
        )
        .await;

        match result {
            Err(e @ TuyaError::ConnectTimeout { .. }) => assert!(e.is_retryable()),
            other => panic!("expected connect timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_retried() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff_factor: 1.5,
            min_backoff: Duration::from_millis(10),
        };
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                bounded_connect(
                    std::future::pending::<std::io::Result<()>>(),
                    "10.255.255.1:6668",
                    Duration::from_secs(1),
                )
            })
            .await;

        assert!(matches!(result, Err(TuyaError::ConnectTimeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
