//! TCP accept loop and per-connection tasks.
//!
//! Each connection gets a reader task (this module) and a writer task fed
//! by a bounded queue. Responses and the unsolicited `release_requested`
//! push share that queue, so lines never interleave mid-write. A client that
//! stops reading fills the queue and the reader task stops reading it in
//! turn.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use granite_config::ServerConfig;
use granite_core::{DataManager, DownloadListener, FundamentalsCache, FundamentalsSource, MarketState};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::ServerError;
use crate::arbitration::{Arbiter, ConnId, Ownership};
use crate::handlers::{handle_line, reconnect};
use crate::lines::{BoundedLines, Line};
use crate::protocol::{ErrorReply, error_line};

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub freshness_window_ms: u64,
    pub max_line_bytes: usize,
    /// `None` keeps idle connections open forever.
    pub idle_timeout: Option<Duration>,
    pub outbox_depth: usize,
}

impl From<&ServerConfig> for ServerSettings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            freshness_window_ms: cfg.freshness_window_ms,
            max_line_bytes: cfg.max_line_bytes,
            idle_timeout: (cfg.idle_timeout_secs > 0).then(|| Duration::from_secs(cfg.idle_timeout_secs)),
            outbox_depth: cfg.outbox_depth.max(1),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Everything the request handlers read from or call into.
#[derive(Clone)]
pub struct Services {
    pub state: Arc<MarketState>,
    pub manager: Arc<dyn DataManager>,
    pub fundamentals: Arc<FundamentalsCache>,
    pub fundamentals_source: Option<Arc<dyn FundamentalsSource>>,
}

pub(crate) struct Shared {
    pub(crate) services: Services,
    pub(crate) settings: ServerSettings,
    pub(crate) arbiter: Arbiter,
    /// Symbols with a fundamentals fetch in flight.
    pub(crate) refreshing: Mutex<HashSet<String>>,
    next_conn: AtomicU64,
}

impl Shared {
    pub(crate) fn new(services: Services, settings: ServerSettings) -> Self {
        Self {
            services,
            settings,
            arbiter: Arbiter::new(),
            refreshing: Mutex::new(HashSet::new()),
            next_conn: AtomicU64::new(1),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    pub async fn bind(addr: &str, services: Services, settings: ServerSettings) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self {
            listener,
            shared: Arc::new(Shared::new(services, settings)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// The handle does not keep the server's state alive. Once `run` has
    /// returned and the connections are gone its calls become no-ops.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Accept connections until `cancel` fires, then wait for every
    /// connection task to finish.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let addr = self.listener.local_addr()?;
        tracing::info!(%addr, "control plane listening");

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = self.shared.next_conn.fetch_add(1, Ordering::Relaxed);
                        let shared = Arc::clone(&self.shared);
                        let token = cancel.child_token();
                        tracker.spawn(serve_connection(shared, conn, stream, peer, token));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        tracker.close();
        tracing::info!(open = tracker.len(), "control plane stopping");
        tracker.wait().await;
        Ok(())
    }
}

async fn serve_connection(
    shared: Arc<Shared>,
    conn: ConnId,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    tracing::info!(conn, %peer, "client connected");
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(conn, error = %e, "set_nodelay failed");
    }
    let (rd, mut wr) = stream.into_split();

    let (outbox, mut queue) = mpsc::channel::<String>(shared.settings.outbox_depth);
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        while let Some(mut line) = queue.recv().await {
            line.push('\n');
            let written = tokio::select! {
                biased;
                res = wr.write_all(line.as_bytes()) => res,
                _ = writer_cancel.cancelled() => break,
            };
            if let Err(e) = written {
                tracing::debug!(conn, error = %e, "write failed");
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    let mut lines = BoundedLines::new(BufReader::new(rd), shared.settings.max_line_bytes);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = next_line(&mut lines, shared.settings.idle_timeout) => next,
        };
        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::info!(conn, error = %e, "closing connection");
                break;
            }
        };

        let reply = match line {
            Line::TooLong => {
                tracing::warn!(conn, limit = shared.settings.max_line_bytes, "line too long");
                error_line(&Value::Null, &ErrorReply::bad_request("Line too long"))
            }
            Line::Data(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => continue,
            Line::Data(bytes) => handle_line(&shared, conn, &outbox, &bytes),
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = outbox.send(reply) => sent,
        };
        if sent.is_err() {
            break;
        }
    }

    if shared.arbiter.disconnected(conn) {
        tracing::info!(conn, "IBKR owner disconnected; session back to the data manager");
        reconnect(&shared);
    }
    drop(outbox);
    let _ = writer.await;
    tracing::info!(conn, %peer, "client disconnected");
}

async fn next_line<R>(lines: &mut BoundedLines<R>, idle: Option<Duration>) -> std::io::Result<Option<Line>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match idle {
        None => lines.next_line().await,
        Some(limit) => match tokio::time::timeout(limit, lines.next_line()).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle timeout")),
        },
    }
}

/// Out-of-band access to a running server. Holds the server state weakly:
/// the data manager keeps this handle (through [`ArbitrationListener`]) while
/// the server keeps the data manager.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Weak<Shared>,
}

impl ServerHandle {
    /// The IBKR session dropped: push `release_requested` to the owner, if
    /// any, and free the session.
    pub fn notify_connection_lost(&self) -> Option<ConnId> {
        let Some(shared) = self.shared.upgrade() else {
            tracing::debug!("IBKR connection lost after server stopped");
            return None;
        };
        let owner = shared.arbiter.connection_lost();
        match owner {
            Some(conn) => tracing::warn!(conn, "IBKR connection lost; release requested"),
            None => tracing::debug!("IBKR connection lost with no owner"),
        }
        owner
    }

    pub fn ownership(&self) -> Ownership {
        self.shared
            .upgrade()
            .map_or(Ownership::Free, |shared| shared.arbiter.ownership())
    }

    /// Whether the server state is still alive.
    pub fn is_running(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

/// Forwards the data manager's connection-failure notice to the server.
pub struct ArbitrationListener {
    handle: ServerHandle,
}

impl ArbitrationListener {
    pub fn new(handle: ServerHandle) -> Self {
        Self { handle }
    }
}

impl DownloadListener for ArbitrationListener {
    fn on_ibkr_connection_failed(&self) {
        self.handle.notify_connection_lost();
    }
}
