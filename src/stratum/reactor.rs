//! Connection reactor
//!
//! Accepts sockets, frames newline-delimited requests and hands each
//! complete line to a [`ConnectionHandler`]. Every connection gets a reader
//! task (one request in flight at a time) and a writer task draining the
//! session's outbound queue. A connection that stays silent for
//! `max_expirations` consecutive idle timeouts is dropped.

use super::session::Session;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

const READ_CHUNK: usize = 4096;

/// Socket-level limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorConfig {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    /// Consecutive idle timeouts before disconnecting
    pub max_expirations: u32,
    /// Longest accepted request line
    pub max_line_bytes: usize,
    /// Outbound lines buffered per connection
    pub outbound_queue: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            idle_timeout: Duration::from_secs(300),
            max_expirations: 2,
            max_line_bytes: 16 * 1024,
            outbound_queue: 256,
        }
    }
}

/// What the reactor drives for each connection
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Create and register the session for a new connection
    fn on_connect(&self, peer: SocketAddr, outbound: mpsc::Sender<String>) -> Result<Arc<Session>>;

    /// Handle one complete request line
    async fn on_line(&self, session: &Arc<Session>, line: &str);

    /// The connection is gone; release the session
    fn on_disconnect(&self, session: &Arc<Session>);
}

/// Receive buffer that yields complete lines
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    max_line_bytes: usize,
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_line_bytes,
        }
    }

    /// Space for the next socket read
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        self.buf.reserve(READ_CHUNK);
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes of a partial line still waiting for its newline
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete non-empty line, without its terminator
    ///
    /// Errors when a line is not UTF-8 or grows past the limit.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            let newline = match self.buf.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => {
                    if self.buf.len() > self.max_line_bytes {
                        return Err(Error::protocol(format!(
                            "line exceeds {} bytes",
                            self.max_line_bytes
                        )));
                    }
                    return Ok(None);
                }
            };
            if newline > self.max_line_bytes {
                return Err(Error::protocol(format!(
                    "line exceeds {} bytes",
                    self.max_line_bytes
                )));
            }

            let raw = self.buf.split_to(newline + 1);
            let line = std::str::from_utf8(&raw[..newline])
                .map_err(|_| Error::protocol("line is not valid UTF-8"))?
                .trim();
            if !line.is_empty() {
                return Ok(Some(line.to_string()));
            }
        }
    }
}

/// Accept loop plus per-connection tasks
#[derive(Debug)]
pub struct Reactor {
    config: ReactorConfig,
    live: Arc<AtomicUsize>,
}

/// Decrements the live-connection count when a connection task ends
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Self {
        Self {
            config,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Serve `listener` until `shutdown` fires
    pub async fn run<H: ConnectionHandler>(
        &self,
        listener: TcpListener,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Stratum listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stratum listener stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };

                    if self.live.load(Ordering::Relaxed) >= self.config.max_connections {
                        warn!(%peer, "Connection limit reached, dropping");
                        continue;
                    }
                    self.live.fetch_add(1, Ordering::Relaxed);
                    let guard = LiveGuard(self.live.clone());

                    let config = self.config;
                    let handler = handler.clone();
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        let _guard = guard;
                        serve_connection(stream, peer, config, handler, shutdown).await;
                    });
                }
            }
        }
    }
}

async fn serve_connection<H: ConnectionHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    config: ReactorConfig,
    handler: Arc<H>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, "Could not set TCP_NODELAY: {}", e);
    }
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(config.outbound_queue.max(1));

    // The session exists before any request is read
    let session = match handler.on_connect(peer, tx) {
        Ok(session) => session,
        Err(e) => {
            warn!(%peer, "Rejecting connection: {}", e);
            return;
        }
    };

    let span = info_span!("connection", %peer, session = %session.id());
    async move {
        debug!("Connected");
        let writer_task = tokio::spawn(
            write_loop(writer, rx, session.closed()).in_current_span(),
        );

        read_loop(reader, &session, &config, handler.as_ref(), &shutdown).await;

        session.close();
        handler.on_disconnect(&session);
        let _ = writer_task.await;
        debug!("Disconnected");
    }
    .instrument(span)
    .await;
}

async fn read_loop<H: ConnectionHandler>(
    mut reader: OwnedReadHalf,
    session: &Arc<Session>,
    config: &ReactorConfig,
    handler: &H,
    shutdown: &CancellationToken,
) {
    let mut buffer = LineBuffer::new(config.max_line_bytes);
    let closed = session.closed();
    let mut expirations = 0u32;

    loop {
        let read = tokio::select! {
            _ = closed.cancelled() => return,
            _ = shutdown.cancelled() => return,
            read = tokio::time::timeout(config.idle_timeout, reader.read_buf(buffer.buffer_mut())) => read,
        };

        match read {
            Err(_) => {
                expirations += 1;
                if expirations >= config.max_expirations {
                    info!(expirations, "Idle connection expired");
                    return;
                }
            }
            Ok(Ok(0)) => {
                debug!("Peer closed the connection");
                return;
            }
            Ok(Ok(_)) => {
                expirations = 0;
                loop {
                    match buffer.next_line() {
                        Ok(Some(line)) => handler.on_line(session, &line).await,
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Dropping connection: {}", e);
                            return;
                        }
                    }
                    if closed.is_cancelled() {
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                debug!("Read error: {}", e);
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<String>,
    closed: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
            _ = closed.cancelled() => break,
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("Write error: {}", e);
            closed.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::extranonce::SessionFactory;
    use parking_lot::Mutex;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test]
    fn test_line_buffer_framing() {
        let mut buffer = LineBuffer::new(64);
        buffer.extend(b"{\"a\":1}\n\r\n{\"b\"");
        assert_eq!(buffer.next_line().unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(buffer.next_line().unwrap(), None);
        assert_eq!(buffer.pending(), 4);

        buffer.extend(b":2}\r\n");
        assert_eq!(buffer.next_line().unwrap().as_deref(), Some("{\"b\":2}"));
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_line_buffer_limits() {
        let mut buffer = LineBuffer::new(8);
        buffer.extend(b"0123456789");
        assert!(buffer.next_line().is_err());

        let mut buffer = LineBuffer::new(8);
        buffer.extend(b"\xff\xfe\n");
        assert!(buffer.next_line().is_err());
    }

    /// Echoes every line back and records lifecycle events
    struct Echo {
        factory: SessionFactory,
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConnectionHandler for Echo {
        fn on_connect(
            &self,
            peer: SocketAddr,
            outbound: mpsc::Sender<String>,
        ) -> Result<Arc<Session>> {
            self.events.lock().push("connect".into());
            Ok(Arc::new(self.factory.create(peer, outbound, 0)))
        }

        async fn on_line(&self, session: &Arc<Session>, line: &str) {
            session.send(format!("{}\n", line.to_uppercase()));
        }

        fn on_disconnect(&self, _session: &Arc<Session>) {
            self.events.lock().push("disconnect".into());
        }
    }

    async fn start(config: ReactorConfig) -> (SocketAddr, Arc<Echo>, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(Echo {
            factory: SessionFactory::starting_at(0, 1.0, 16),
            events: Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();
        let reactor = Reactor::new(config);
        let (h, s) = (handler.clone(), shutdown.clone());
        tokio::spawn(async move { reactor.run(listener, h, s).await });
        (addr, handler, shutdown)
    }

    #[tokio::test]
    async fn test_lines_are_dispatched_in_order() {
        let (addr, handler, shutdown) = start(ReactorConfig::default()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"one\ntw").await.unwrap();
        write.flush().await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "ONE");
        write.write_all(b"o\nthree\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "TWO");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "THREE");

        drop(write);
        assert!(lines.next_line().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*handler.events.lock(), vec!["connect", "disconnect"]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_idle_connection_expires() {
        let config = ReactorConfig {
            idle_timeout: Duration::from_millis(50),
            max_expirations: 2,
            ..ReactorConfig::default()
        };
        let (addr, handler, shutdown) = start(config).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(stream).lines();

        let closed = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("server should close an idle connection");
        assert!(closed.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handler.events.lock().contains(&"disconnect".to_string()));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = ReactorConfig {
            max_connections: 1,
            ..ReactorConfig::default()
        };
        let (addr, handler, shutdown) = start(config).await;

        let first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(second).lines();
        let dropped = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap();
        assert!(dropped.map(|l| l.is_none()).unwrap_or(true));
        assert_eq!(handler.events.lock().len(), 1);
        drop(first);
        shutdown.cancel();
    }
}
