//! Async transport implementation using tokio
//!
//! This module provides the TCP connection to one Folding@home client: the
//! welcome/auth handshake, timeout-bounded line reads and serialized writes.
//!
//! Reads and writes are guarded by separate locks so a stalled write never
//! holds up the reader. A read that fails or times out drops the read half of
//! the socket, so bytes that arrive late can never surface in a later read.

use crate::transport::{ControlError, MAX_AUTHENTICATION_MESSAGE_COUNT, Result};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Terminal control sequence the server prefixes its welcome banner with
const CLEAR_SCREEN: &str = "\x1b[H\x1b[2J";

/// Longest line accepted from the server, terminator included
const MAX_LINE_LENGTH: u64 = 1024 * 1024;

/// Upper bound for the final flush/shutdown in `cleanup`
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

/// One TCP session to one command server.
///
/// A connection is used once: after it drops to `Disconnected` it cannot be
/// connected again, and a fresh `Connection` is needed per attempt.
pub struct Connection {
    address: String,
    port: u16,
    password: Option<String>,
    read_timeout: StdMutex<Duration>,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state: StdMutex<ConnectionState>,
    authenticated: AtomicBool,
    used: AtomicBool,
    closed: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("state", &self.state())
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a disconnected connection
    pub fn new(address: impl Into<String>, port: u16, password: Option<String>, read_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            port,
            password,
            read_timeout: StdMutex::new(read_timeout),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            state: StdMutex::new(ConnectionState::Disconnected),
            authenticated: AtomicBool::new(false),
            used: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// Open the socket, consume the welcome banner and authenticate if a password is set
    pub async fn connect(&self) -> Result<()> {
        if self.used.swap(true, Ordering::SeqCst) || self.closed.is_cancelled() {
            return Err(ControlError::ConnectionFailed(
                "connection objects cannot be reused, create a new one".to_string(),
            ));
        }

        self.set_state(ConnectionState::Connecting);
        debug!(address = %self.address, port = self.port, "Opening connection");

        let stream = match TcpStream::connect((self.address.as_str(), self.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ControlError::ConnectionFailed(format!(
                    "Failed to connect to {}:{}: {}",
                    self.address, self.port, e
                )));
            }
        };

        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(BufReader::new(reader));
        *self.writer.lock().await = Some(writer);

        let authenticated = match self.handshake().await {
            Ok(authenticated) => authenticated,
            Err(e) => {
                self.cleanup().await;
                return Err(e);
            }
        };

        self.set_state(ConnectionState::Connected);
        self.authenticated.store(authenticated, Ordering::SeqCst);
        info!(
            address = %self.address,
            port = self.port,
            authenticated,
            "Connected to command server"
        );
        Ok(())
    }

    async fn handshake(&self) -> Result<bool> {
        let welcome = self.read_line(ConnectionState::Connecting).await?;
        let welcome = welcome.strip_prefix(CLEAR_SCREEN).unwrap_or(&welcome).trim();
        debug!(welcome, "Received welcome message");

        let Some(password) = &self.password else {
            return Ok(false);
        };

        self.set_state(ConnectionState::Authenticating);
        self.write_str(&format!("auth {}\n", password), ConnectionState::Authenticating)
            .await?;
        self.wait_for_auth_response().await?;
        Ok(true)
    }

    async fn wait_for_auth_response(&self) -> Result<()> {
        for _ in 0..MAX_AUTHENTICATION_MESSAGE_COUNT {
            let response = self.read_line(ConnectionState::Authenticating).await?;
            if response.contains("OK") {
                debug!(response = response.trim_end(), "Authentication response");
                return Ok(());
            }
            if response.contains("FAILED") {
                debug!(response = response.trim_end(), "Authentication response");
                return Err(ControlError::AuthenticationFailed(
                    "Password is incorrect.".to_string(),
                ));
            }
        }

        error!(
            "Did not receive a valid authentication response in the last {} messages",
            MAX_AUTHENTICATION_MESSAGE_COUNT
        );
        Err(ControlError::AuthenticationFailed(
            "Did not receive a valid authentication response.".to_string(),
        ))
    }

    /// Read the next newline-terminated line, bounded by the read timeout
    pub async fn read(&self) -> Result<String> {
        self.read_line(ConnectionState::Connected).await
    }

    /// Write a message and flush it
    pub async fn send(&self, message: &str) -> Result<()> {
        self.write_str(message, ConnectionState::Connected).await
    }

    async fn read_line(&self, expected: ConnectionState) -> Result<String> {
        let mut guard = self.reader.lock().await;
        if self.state() != expected {
            return Err(ControlError::NotConnected);
        }
        let Some(reader) = guard.as_mut() else {
            return Err(ControlError::NotConnected);
        };

        let timeout = self.read_timeout();
        let outcome = tokio::select! {
            _ = self.closed.cancelled() => {
                Err(ControlError::ConnectionFailed("connection closed".to_string()))
            }
            outcome = read_line_within(reader, timeout) => outcome,
        };

        if let Err(e) = &outcome {
            // A partially consumed line may sit in the buffer; never read from it again
            guard.take();
            drop(guard);
            warn!(address = %self.address, port = self.port, error = %e, "Read failed, disconnecting");
            self.mark_disconnected();
        }
        outcome
    }

    async fn write_str(&self, message: &str, expected: ConnectionState) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if self.state() != expected {
            return Err(ControlError::NotConnected);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(ControlError::NotConnected);
        };

        let write = async {
            writer.write_all(message.as_bytes()).await?;
            writer.flush().await
        };
        let outcome = tokio::select! {
            _ = self.closed.cancelled() => {
                Err(ControlError::ConnectionFailed("connection closed".to_string()))
            }
            result = write => result.map_err(|e| ControlError::ConnectionFailed(format!("Write failed: {}", e))),
        };

        if let Err(e) = &outcome {
            guard.take();
            drop(guard);
            warn!(address = %self.address, port = self.port, error = %e, "Write failed, disconnecting");
            self.mark_disconnected();
        }
        outcome
    }

    /// Close the socket and abort in-flight reads and writes. Never fails; safe to call twice.
    pub async fn cleanup(&self) {
        self.closed.cancel();
        self.mark_disconnected();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let close = async {
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
            };
            let _ = tokio::time::timeout(CLEANUP_TIMEOUT, close).await;
        }
        self.reader.lock().await.take();
        debug!(address = %self.address, port = self.port, "Connection cleaned up");
    }

    fn mark_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.authenticated.store(false, Ordering::SeqCst);
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Authenticated implies connected
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst) && self.is_connected()
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
            .lock()
            .map(|t| *t)
            .unwrap_or_default()
    }

    /// Change the timeout applied to subsequent reads
    pub fn set_read_timeout(&self, timeout: Duration) {
        if let Ok(mut current) = self.read_timeout.lock() {
            *current = timeout;
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

async fn read_line_within(reader: &mut BufReader<OwnedReadHalf>, timeout: Duration) -> Result<String> {
    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(MAX_LINE_LENGTH);
    let result = tokio::time::timeout(timeout, limited.read_until(b'\n', &mut line)).await;
    match result {
        Err(_) => Err(ControlError::ConnectionFailed(format!(
            "No data received within {:.1}s",
            timeout.as_secs_f32()
        ))),
        Ok(Err(e)) => Err(ControlError::ConnectionFailed(format!("Read failed: {}", e))),
        Ok(Ok(0)) => Err(ControlError::ConnectionFailed(
            "Incomplete stream: connection closed by peer".to_string(),
        )),
        Ok(Ok(n)) if n as u64 >= MAX_LINE_LENGTH && !line.ends_with(b"\n") => {
            Err(ControlError::ConnectionFailed(format!(
                "Line exceeds {} bytes",
                MAX_LINE_LENGTH
            )))
        }
        Ok(Ok(_)) if !line.ends_with(b"\n") => Err(ControlError::ConnectionFailed(
            "Incomplete stream: connection closed mid-line".to_string(),
        )),
        Ok(Ok(_)) => Ok(String::from_utf8_lossy(&line).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const WELCOME: &[u8] = b"\x1b[H\x1b[2JWelcome to the Folding@home Client command server.\n";

    async fn serve<F, Fut>(handler: F) -> u16
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                handler(stream).await;
            }
        });
        port
    }

    async fn read_peer_line(stream: &mut TcpStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while stream.read_exact(&mut byte).await.is_ok() {
            line.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        String::from_utf8(line).unwrap()
    }

    fn connection(port: u16, password: Option<&str>) -> Connection {
        Connection::new(
            "127.0.0.1",
            port,
            password.map(str::to_string),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_connect_without_password() {
        let port = serve(|mut stream| async move {
            stream.write_all(WELCOME).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let conn = connection(port, None);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.connect().await.unwrap();

        assert!(conn.is_connected());
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_auth_succeeded() {
        let port = serve(|mut stream| async move {
            stream.write_all(WELCOME).await.unwrap();
            assert_eq!(read_peer_line(&mut stream).await, "auth test\n");
            stream.write_all(b"> \nOK\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let conn = connection(port, Some("test"));
        conn.connect().await.unwrap();

        assert!(conn.is_connected());
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_auth_failed() {
        let port = serve(|mut stream| async move {
            stream.write_all(WELCOME).await.unwrap();
            let _ = read_peer_line(&mut stream).await;
            stream.write_all(b"FAILED\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let conn = connection(port, Some("wrong"));
        let err = conn.connect().await.unwrap_err();

        assert!(matches!(err, ControlError::AuthenticationFailed(_)));
        assert!(!conn.is_connected());
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_auth_without_valid_response() {
        let port = serve(|mut stream| async move {
            stream.write_all(WELCOME).await.unwrap();
            let _ = read_peer_line(&mut stream).await;
            for _ in 0..MAX_AUTHENTICATION_MESSAGE_COUNT {
                stream.write_all(b"> \n").await.unwrap();
            }
            stream.write_all(b"OK\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let conn = connection(port, Some("test"));
        let err = conn.connect().await.unwrap_err();

        assert!(matches!(err, ControlError::AuthenticationFailed(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let conn = connection(port, None);
        let err = conn.connect().await.unwrap_err();

        assert!(err.is_connection_failure());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_read_and_send_require_connection() {
        let conn = connection(1, None);
        assert!(matches!(conn.read().await, Err(ControlError::NotConnected)));
        assert!(matches!(conn.send("pause\n").await, Err(ControlError::NotConnected)));
    }

    #[tokio::test]
    async fn test_read_lines_in_order() {
        let port = serve(|mut stream| async move {
            stream.write_all(WELCOME).await.unwrap();
            stream.write_all(b"first\nsecond\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let conn = connection(port, None);
        conn.connect().await.unwrap();

        assert_eq!(conn.read().await.unwrap(), "first\n");
        assert_eq!(conn.read().await.unwrap(), "second\n");
    }

    #[tokio::test]
    async fn test_read_timeout_disconnects() {
        let port = serve(|mut stream| async move {
            stream.write_all(WELCOME).await.unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
            let _ = stream.write_all(b"late\n").await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let conn = connection(port, None);
        conn.connect().await.unwrap();
        conn.set_read_timeout(Duration::from_millis(100));

        let err = conn.read().await.unwrap_err();
        assert!(err.is_connection_failure());
        assert!(!conn.is_connected());

        // The late line must not surface through this connection
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(conn.read().await, Err(ControlError::NotConnected)));
    }

    #[tokio::test]
    async fn test_eof_mid_line() {
        let port = serve(|mut stream| async move {
            stream.write_all(WELCOME).await.unwrap();
            stream.write_all(b"{\"partial\":").await.unwrap();
        })
        .await;

        let conn = connection(port, None);
        conn.connect().await.unwrap();

        let err = conn.read().await.unwrap_err();
        assert!(err.is_connection_failure());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_reads_take_one_line_each() {
        let port = serve(|mut stream| async move {
            stream.write_all(WELCOME).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            stream.write_all(b"a\nb\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let conn = Arc::new(connection(port, None));
        conn.connect().await.unwrap();

        let reads: Vec<_> = (0..2)
            .map(|_| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.read().await })
            })
            .collect();

        let mut lines = Vec::new();
        for read in reads {
            lines.push(read.await.unwrap().unwrap());
        }
        lines.sort();
        assert_eq!(lines, vec!["a\n", "b\n"]);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let port = serve(move |stream| async move {
            let (reader, mut writer) = stream.into_split();
            writer.write_all(WELCOME).await.unwrap();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(line);
            }
        })
        .await;

        let conn = Arc::new(connection(port, None));
        conn.connect().await.unwrap();

        let messages = [
            format!("{}\n", "a".repeat(64 * 1024)),
            format!("{}\n", "b".repeat(64 * 1024)),
        ];
        let sends: Vec<_> = messages
            .iter()
            .cloned()
            .map(|message| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.send(&message).await })
            })
            .collect();
        for send in sends {
            send.await.unwrap().unwrap();
        }

        let mut received = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        received.sort();
        assert_eq!(received[0], messages[0].trim_end());
        assert_eq!(received[1], messages[1].trim_end());
    }

    #[tokio::test]
    async fn test_overlong_line_disconnects() {
        let port = serve(|mut stream| async move {
            stream.write_all(WELCOME).await.unwrap();
            let flood = vec![b'x'; MAX_LINE_LENGTH as usize + 16];
            let _ = stream.write_all(&flood).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let conn = connection(port, None);
        conn.connect().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), conn.read())
            .await
            .expect("overlong line waited for the read timeout")
            .unwrap_err();
        assert!(err.is_connection_failure());
        assert!(err.to_string().contains("exceeds"));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_write_not_blocked_by_pending_read() {
        let port = serve(|mut stream| async move {
            stream.write_all(WELCOME).await.unwrap();
            let command = read_peer_line(&mut stream).await;
            stream.write_all(format!("echo {}", command).as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let conn = Arc::new(connection(port, None));
        conn.connect().await.unwrap();

        let reader = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.read().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_millis(500), conn.send("pause\n"))
            .await
            .expect("send blocked behind read")
            .unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), "echo pause\n");
    }

    #[tokio::test]
    async fn test_cleanup_aborts_pending_read() {
        let port = serve(|mut stream| async move {
            stream.write_all(WELCOME).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let conn = Arc::new(connection(port, None));
        conn.connect().await.unwrap();

        let reader = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.read().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_millis(500), conn.cleanup())
            .await
            .expect("cleanup waited for the read timeout");
        assert!(reader.await.unwrap().unwrap_err().is_connection_failure());
        assert!(!conn.is_connected());

        // Idempotent, and the connection is never resurrected
        conn.cleanup().await;
        assert!(conn.connect().await.unwrap_err().is_connection_failure());
    }
}
