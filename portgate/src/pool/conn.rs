//! Pool of TCP connections to the local HTTP listener.
//!
//! A connection is either borrowed by exactly one [`PooledConn`] or parked in
//! the idle list. Dropping a `PooledConn` hands the socket back through
//! `put`, which keeps it only if it is healthy, the pool is not full, and the
//! pool is still open.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};

pub type ConnFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;
pub type ConnFactory = Arc<dyn Fn() -> ConnFuture + Send + Sync>;

/// Factory dialing `addr` with a timeout and `TCP_NODELAY` set.
pub fn tcp_factory(addr: String, dial_timeout: Duration) -> ConnFactory {
    Arc::new(move || {
        let addr = addr.clone();
        Box::pin(async move {
            let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub gets: u64,
    pub reuses: u64,
    pub created: u64,
    pub closed: u64,
    pub exhausted: u64,
    pub health_check_failures: u64,
    /// Share of `get` calls served from the idle list.
    pub reuse_rate: f64,
    pub avg_wait_ms: f64,
}

struct IdleConn {
    stream: TcpStream,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConn>,
    /// Borrowed plus idle plus being dialed.
    total: usize,
}

enum Take {
    Idle(IdleConn),
    Create,
    Full,
}

struct Shared {
    label: String,
    config: PoolConfig,
    factory: ConnFactory,
    state: Mutex<PoolState>,
    available: Notify,
    closed: AtomicBool,
    shutdown: CancellationToken,

    gets: AtomicU64,
    reuses: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
    exhausted: AtomicU64,
    health_failures: AtomicU64,
    wait_nanos: AtomicU64,
}

/// Shared handle to the pool. Cloning is cheap.
#[derive(Clone)]
pub struct ConnPool {
    shared: Arc<Shared>,
}

impl ConnPool {
    /// Creates the pool and starts its health checker. Must be called inside
    /// a tokio runtime.
    pub fn new(label: impl Into<String>, config: PoolConfig, factory: ConnFactory) -> Result<Self> {
        if config.max_size == 0 {
            return Err(Error::Config("pool max_size must be positive".into()));
        }
        if config.min_size > config.max_size {
            return Err(Error::Config("pool min_size exceeds max_size".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("connection pool needs a runtime: {e}")))?;

        let shared = Arc::new(Shared {
            label: label.into(),
            config,
            factory,
            state: Mutex::default(),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            gets: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            health_failures: AtomicU64::new(0),
            wait_nanos: AtomicU64::new(0),
        });

        let interval = shared.config.health_check_interval;
        if !interval.is_zero() {
            runtime.spawn(health_checker(
                Arc::downgrade(&shared),
                interval,
                shared.shutdown.clone(),
            ));
        }
        Ok(Self { shared })
    }

    /// Borrows a connection: an idle one if any, else a new one while under
    /// `max_size`, else waits up to `max_wait_time` for one to come back.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<PooledConn> {
        let shared = &self.shared;
        let started = Instant::now();
        let deadline = started + shared.config.max_wait_time;
        shared.gets.fetch_add(1, Ordering::Relaxed);

        loop {
            if shared.closed.load(Ordering::Acquire) {
                return Err(Error::PoolClosed);
            }

            let notified = shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match shared.take() {
                Take::Idle(conn) => {
                    shared.reuses.fetch_add(1, Ordering::Relaxed);
                    shared.record_wait(started);
                    trace!("Reusing pooled connection to {} (uses: {})", shared.label, conn.use_count);
                    return Ok(PooledConn::new(conn, shared.clone()));
                }
                Take::Create => {
                    let dialed = tokio::select! {
                        _ = cancel.cancelled() => None,
                        dialed = (shared.factory)() => Some(dialed),
                    };
                    return match dialed {
                        Some(Ok(stream)) => {
                            shared.created.fetch_add(1, Ordering::Relaxed);
                            shared.record_wait(started);
                            let now = Instant::now();
                            let conn = IdleConn {
                                stream,
                                created_at: now,
                                last_used: now,
                                use_count: 0,
                            };
                            Ok(PooledConn::new(conn, shared.clone()))
                        }
                        Some(Err(source)) => {
                            shared.release_slot();
                            Err(Error::LocalDial {
                                addr: shared.label.clone(),
                                source,
                            })
                        }
                        None => {
                            shared.release_slot();
                            Err(Error::Cancelled)
                        }
                    };
                }
                Take::Full => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    shared.exhausted.fetch_add(1, Ordering::Relaxed);
                    shared.record_wait(started);
                    warn!("Connection pool for {} exhausted", shared.label);
                    return Err(Error::PoolExhausted);
                }
                _ = &mut notified => {}
            }
        }
    }

    /// Closes every idle connection and refuses further use. Idempotent.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.shutdown.cancel();

        let drained: Vec<IdleConn> = {
            let mut state = shared.lock();
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        shared
            .discarded
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        debug!("Closed connection pool for {} ({} idle)", shared.label, drained.len());
        drop(drained);
        shared.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> PoolMetrics {
        let shared = &self.shared;
        let (total, idle) = {
            let state = shared.lock();
            (state.total, state.idle.len())
        };
        let gets = shared.gets.load(Ordering::Relaxed);
        let reuses = shared.reuses.load(Ordering::Relaxed);
        let wait_nanos = shared.wait_nanos.load(Ordering::Relaxed);
        let (reuse_rate, avg_wait_ms) = if gets == 0 {
            (0.0, 0.0)
        } else {
            (
                reuses as f64 / gets as f64,
                wait_nanos as f64 / gets as f64 / 1_000_000.0,
            )
        };
        PoolMetrics {
            total,
            active: total.saturating_sub(idle),
            idle,
            gets,
            reuses,
            created: shared.created.load(Ordering::Relaxed),
            closed: shared.discarded.load(Ordering::Relaxed),
            exhausted: shared.exhausted.load(Ordering::Relaxed),
            health_check_failures: shared.health_failures.load(Ordering::Relaxed),
            reuse_rate,
            avg_wait_ms,
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_wait(&self, started: Instant) {
        let waited = started.elapsed().as_nanos() as u64;
        self.wait_nanos.fetch_add(waited, Ordering::Relaxed);
    }

    fn is_expired(&self, conn: &IdleConn) -> bool {
        let idle_timeout = self.config.idle_timeout;
        !idle_timeout.is_zero() && conn.last_used.elapsed() > idle_timeout
    }

    fn take(&self) -> Take {
        let mut evicted = Vec::new();
        let take = {
            let mut state = self.lock();
            let mut found = None;
            while let Some(conn) = state.idle.pop_back() {
                if self.is_expired(&conn) {
                    state.total -= 1;
                    evicted.push(conn);
                    continue;
                }
                if !is_healthy(&conn.stream) {
                    self.health_failures.fetch_add(1, Ordering::Relaxed);
                    state.total -= 1;
                    evicted.push(conn);
                    continue;
                }
                found = Some(conn);
                break;
            }
            match found {
                Some(conn) => Take::Idle(conn),
                None if state.total < self.config.max_size => {
                    state.total += 1;
                    Take::Create
                }
                None => Take::Full,
            }
        };
        self.discarded
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        take
    }

    fn release_slot(&self) {
        {
            let mut state = self.lock();
            state.total = state.total.saturating_sub(1);
        }
        self.available.notify_one();
    }

    fn put(&self, mut conn: IdleConn, reusable: bool) {
        let keep = reusable && !self.closed.load(Ordering::Acquire) && {
            let healthy = is_healthy(&conn.stream);
            if !healthy {
                self.health_failures.fetch_add(1, Ordering::Relaxed);
            }
            healthy
        };

        let rejected = {
            let mut state = self.lock();
            if keep && state.idle.len() < self.config.max_size {
                conn.last_used = Instant::now();
                conn.use_count += 1;
                state.idle.push_back(conn);
                None
            } else {
                state.total = state.total.saturating_sub(1);
                Some(conn)
            }
        };
        if let Some(conn) = rejected {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            trace!(
                "Discarding connection to {} after {} uses ({:?} old)",
                self.label,
                conn.use_count,
                conn.created_at.elapsed()
            );
        }
        self.available.notify_one();
    }

    fn park_fresh(&self, stream: TcpStream) {
        let now = Instant::now();
        let conn = IdleConn {
            stream,
            created_at: now,
            last_used: now,
            use_count: 0,
        };
        let rejected = {
            let mut state = self.lock();
            if self.closed.load(Ordering::Acquire) {
                state.total = state.total.saturating_sub(1);
                Some(conn)
            } else {
                state.idle.push_back(conn);
                None
            }
        };
        if rejected.is_some() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
        self.available.notify_one();
    }

    /// Evicts stale idle connections and tops the pool up to `min_size`.
    async fn maintain(&self) {
        let needed = {
            let mut state = self.lock();
            let before = state.idle.len();
            let mut failures = 0;
            state.idle.retain(|conn| {
                if self.is_expired(conn) {
                    return false;
                }
                let healthy = is_healthy(&conn.stream);
                if !healthy {
                    failures += 1;
                }
                healthy
            });
            let evicted = before - state.idle.len();
            state.total -= evicted;
            self.discarded.fetch_add(evicted as u64, Ordering::Relaxed);
            self.health_failures.fetch_add(failures, Ordering::Relaxed);
            if evicted > 0 {
                debug!("Evicted {} idle connections to {}", evicted, self.label);
            }

            let needed = self.config.min_size.saturating_sub(state.total);
            state.total += needed;
            needed
        };

        for _ in 0..needed {
            match (self.factory)().await {
                Ok(stream) => {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    self.park_fresh(stream);
                }
                Err(e) => {
                    debug!("Failed to pre-dial connection to {}: {}", self.label, e);
                    self.release_slot();
                }
            }
        }
    }
}

async fn health_checker(shared: Weak<Shared>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.maintain().await;
            }
        }
    }
}

/// A parked connection is healthy when a non-blocking peek would block:
/// no EOF, no error, and no unsolicited bytes from the server.
fn is_healthy(stream: &TcpStream) -> bool {
    let mut peeked = [MaybeUninit::<u8>::uninit(); 1];
    match SockRef::from(stream).peek(&mut peeked) {
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        Ok(_) => false,
    }
}

/// A connection borrowed from [`ConnPool`].
///
/// Shutting it down hands it back to the pool instead of closing the socket;
/// an I/O error or EOF marks it unusable so it is discarded on drop.
pub struct PooledConn {
    conn: Option<IdleConn>,
    pool: Arc<Shared>,
    reusable: bool,
}

impl PooledConn {
    fn new(conn: IdleConn, pool: Arc<Shared>) -> Self {
        Self {
            conn: Some(conn),
            pool,
            reusable: true,
        }
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.conn.as_ref().map(|c| &c.stream)
    }

    /// Marks the connection so it is closed instead of returned.
    pub fn discard(&mut self) {
        self.reusable = false;
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.conn
            .as_mut()
            .map(|c| &mut c.stream)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    fn track<T>(&mut self, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if let Poll::Ready(Err(_)) = &poll {
            self.reusable = false;
        }
        poll
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn, self.reusable);
        }
    }
}

impl AsyncRead for PooledConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = match this.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        };
        if let Poll::Ready(Ok(())) = &poll {
            if buf.filled().len() == before && buf.remaining() > 0 {
                this.reusable = false;
            }
        }
        this.track(poll)
    }
}

impl AsyncWrite for PooledConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = match this.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.track(poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = match this.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.track(poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
