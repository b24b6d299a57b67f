use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{is_retryable, ProtocolViolation, TransportError, ValidationError};
use super::session::{FrameSink, MetricSession};
use super::state::{ConnectionState, ConnectionStateMachine};
use super::{parse_host, DEFAULT_PICKLE_PORT};
use crate::health::HealthMetrics;

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// First retry delay; later retries double it, cycling every four attempts.
    pub backoff_base: Duration,
}

impl TransportConfig {
    /// Build from a `host[:port]` string, defaulting to the pickle port.
    pub fn from_address(address: &str, backoff_base: Duration) -> Result<Self, ValidationError> {
        let (host, port) = parse_host(address, DEFAULT_PICKLE_PORT)?;
        Ok(Self {
            host,
            port,
            backoff_base,
        })
    }
}

/// Retry delay for the given zero-based attempt: `base * 2^(attempt mod 4)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << (attempt % 4))
}

type FlushOutcome = Option<Result<usize, TransportError>>;

struct Connection {
    generation: u64,
    writer: OwnedWriteHalf,
}

struct DeferredFlush {
    handle: JoinHandle<()>,
    outcome: watch::Receiver<FlushOutcome>,
}

struct Inner {
    config: TransportConfig,
    state: parking_lot::Mutex<ConnectionStateMachine>,
    state_tx: watch::Sender<ConnectionState>,
    conn: tokio::sync::Mutex<Option<Connection>>,
    generation: AtomicU64,
    dial_lock: tokio::sync::Mutex<()>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    deferred: parking_lot::Mutex<Option<DeferredFlush>>,
    cancel: parking_lot::Mutex<CancellationToken>,
    health: Option<Arc<HealthMetrics>>,
}

impl Inner {
    fn current_state(&self) -> ConnectionState {
        self.state.lock().current()
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    fn transition_locked(
        &self,
        sm: &mut ConnectionStateMachine,
        to: ConnectionState,
    ) -> Result<(), ProtocolViolation> {
        sm.transition(to)?;
        self.state_tx.send_replace(to);

        if let Some(health) = &self.health {
            health
                .collector_connected
                .set(if to.is_connected() { 1.0 } else { 0.0 });
        }

        Ok(())
    }

    fn transition(&self, to: ConnectionState) -> Result<(), ProtocolViolation> {
        let mut sm = self.state.lock();
        self.transition_locked(&mut sm, to)
    }

    /// The collector closed its side: EofReceived, then ConnectionLost.
    fn on_eof(&self, generation: u64) {
        let mut sm = self.state.lock();
        if self.generation.load(Ordering::SeqCst) != generation || !sm.current().is_connected() {
            return;
        }

        let result = self
            .transition_locked(&mut sm, ConnectionState::EofReceived)
            .and_then(|()| self.transition_locked(&mut sm, ConnectionState::ConnectionLost));

        match result {
            Ok(()) => info!(host = %self.config.host, port = self.config.port, "collector closed the connection"),
            Err(e) => error!(error = %e, "connection state violation on eof"),
        }
    }

    /// Mark the connection of `generation` as lost. Stale generations are ignored.
    fn mark_lost(&self, generation: u64) {
        let mut sm = self.state.lock();
        if self.generation.load(Ordering::SeqCst) != generation || !sm.current().is_connected() {
            return;
        }

        match self.transition_locked(&mut sm, ConnectionState::ConnectionLost) {
            Ok(()) => warn!(host = %self.config.host, port = self.config.port, "connection to collector lost"),
            Err(e) => error!(error = %e, "connection state violation on loss"),
        }
    }
}

impl FrameSink for Inner {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(TransportError::NotConnected)?;

        if !self.current_state().is_connected() {
            return Err(TransportError::NotConnected);
        }

        let written = match conn.writer.write_all(&frame).await {
            Ok(()) => conn.writer.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            self.mark_lost(conn.generation);
            return Err(TransportError::io("writing frame", &e));
        }

        Ok(())
    }
}

/// Dial the collector unless already connected, retrying transient failures.
async fn establish(inner: &Arc<Inner>, cancel: &CancellationToken) -> Result<(), TransportError> {
    let _dial = inner.dial_lock.lock().await;

    if inner.current_state().is_connected() {
        return Ok(());
    }

    let host = inner.config.host.as_str();
    let port = inner.config.port;
    let mut attempt: u32 = 0;

    let stream = loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = TcpStream::connect((host, port)) => result,
        };

        if result.is_err() {
            if let Some(health) = &inner.health {
                health.dial_errors.inc();
            }
        }

        match result {
            Ok(stream) => break stream,
            Err(e) if is_retryable(e.kind()) => {
                let delay = backoff_delay(inner.config.backoff_base, attempt);
                warn!(
                    host,
                    port,
                    attempt = attempt + 1,
                    retry_in = ?delay,
                    error = %e,
                    "connecting to collector failed, retrying",
                );
                attempt = attempt.wrapping_add(1);

                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(TransportError::io("connecting to collector", &e)),
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "setting TCP_NODELAY failed");
    }

    let (reader, writer) = stream.into_split();
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

    *inner.conn.lock().await = Some(Connection { generation, writer });

    if let Err(e) = inner.transition(ConnectionState::Connected) {
        inner.conn.lock().await.take();
        return Err(e.into());
    }

    let watcher = tokio::spawn(watch_connection(
        Arc::downgrade(inner),
        reader,
        generation,
        cancel.clone(),
    ));
    if let Some(previous) = inner.watcher.lock().replace(watcher) {
        previous.abort();
    }

    info!(host, port, generation, "connected to collector");
    Ok(())
}

/// Reads the socket until EOF or error and reports what it sees.
async fn watch_connection(
    inner: Weak<Inner>,
    mut reader: OwnedReadHalf,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 1024];

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = reader.read(&mut buf) => result,
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };

        match result {
            Ok(0) => {
                inner.on_eof(generation);
                return;
            }
            Ok(n) => {
                if inner.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                debug!(bytes = n, "unexpected data from collector");
                if let Err(e) = inner.transition(ConnectionState::DataReceived) {
                    error!(error = %e, "connection state violation on read");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "reading from collector failed");
                inner.mark_lost(generation);
                return;
            }
        }
    }
}

/// Dial until connected or cancelled. Errors `establish` gives up on are
/// retried on the same backoff schedule.
async fn establish_persistent(
    inner: &Weak<Inner>,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    let mut attempt: u32 = 0;

    loop {
        let Some(strong) = inner.upgrade() else {
            return Err(TransportError::Cancelled);
        };

        let err = match establish(&strong, cancel).await {
            Ok(()) => return Ok(()),
            Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
            Err(e) => e,
        };

        let delay = backoff_delay(strong.config.backoff_base, attempt);
        error!(
            host = %strong.config.host,
            port = strong.config.port,
            attempt = attempt + 1,
            retry_in = ?delay,
            error = %err,
            "dialing collector failed, retrying",
        );
        drop(strong);
        attempt = attempt.wrapping_add(1);

        tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Waits for ConnectionLost and re-dials. Stops only on close.
async fn supervise(
    inner: Weak<Inner>,
    mut states: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
) {
    loop {
        let lost = tokio::select! {
            _ = cancel.cancelled() => return,
            lost = async {
                states
                    .wait_for(|s| *s == ConnectionState::ConnectionLost)
                    .await
                    .is_ok()
            } => lost,
        };
        if !lost {
            return;
        }

        if establish_persistent(&inner, &cancel).await.is_err() {
            return;
        }

        let Some(strong) = inner.upgrade() else {
            return;
        };
        if let Some(health) = &strong.health {
            health.reconnects.inc();
        }
    }
}

/// A [`MetricSession`] bound to a persistent collector connection.
///
/// Cheap to clone. Handles created with [`ReliableTransport::using`] share the
/// connection, the supervisor and the metric buffer.
#[derive(Clone)]
pub struct ReliableTransport {
    inner: Arc<Inner>,
    session: MetricSession,
}

impl std::fmt::Debug for ReliableTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableTransport")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .field("session", &self.session)
            .finish()
    }
}

impl ReliableTransport {
    pub fn new(
        config: TransportConfig,
        session: MetricSession,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::NotConnected);

        Self {
            inner: Arc::new(Inner {
                config,
                state: parking_lot::Mutex::new(ConnectionStateMachine::new()),
                state_tx,
                conn: tokio::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
                dial_lock: tokio::sync::Mutex::new(()),
                supervisor: parking_lot::Mutex::new(None),
                watcher: parking_lot::Mutex::new(None),
                deferred: parking_lot::Mutex::new(None),
                cancel: parking_lot::Mutex::new(CancellationToken::new()),
                health,
            }),
            session,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &MetricSession {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.current_state()
    }

    /// Watch connection-state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// A handle bound to a derived session over the same connection and buffer.
    pub fn using(&self, namespace: &str, join: bool) -> Result<Self, ValidationError> {
        Ok(Self {
            inner: Arc::clone(&self.inner),
            session: self.session.using(namespace, join)?,
        })
    }

    /// Connect and start the reconnect supervisor. Idempotent.
    ///
    /// Refused, reset and aborted connections are retried with backoff until
    /// they succeed or the transport is closed; other errors are returned.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let cancel = self.inner.cancel_token();
        establish(&self.inner, &cancel).await?;
        self.ensure_supervisor(cancel);
        Ok(())
    }

    /// Like [`connect`](Self::connect), but never gives up: every dial error
    /// is retried with backoff until connected or the transport is closed.
    pub async fn connect_persistent(&self) -> Result<(), TransportError> {
        let cancel = self.inner.cancel_token();
        establish_persistent(&Arc::downgrade(&self.inner), &cancel).await?;
        self.ensure_supervisor(cancel);
        Ok(())
    }

    fn ensure_supervisor(&self, cancel: CancellationToken) {
        let mut slot = self.inner.supervisor.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let states = self.inner.state_tx.subscribe();
        *slot = Some(tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            states,
            cancel,
        )));
    }

    /// Buffer a metric and flush if the session policy says so.
    pub async fn post(
        &self,
        name: &str,
        value: f64,
        timestamp: Option<f64>,
        namespace: Option<&str>,
    ) -> Result<usize, TransportError> {
        self.session.append(name, value, timestamp, namespace)?;

        if let Some(health) = &self.inner.health {
            health.metrics_posted.inc();
            health.buffered_metrics.set(self.session.len() as f64);
        }

        if self.session.flush_due() {
            self.flush(false).await
        } else {
            Ok(0)
        }
    }

    /// Send everything buffered.
    ///
    /// When connected the buffer is sent immediately. Otherwise a single
    /// deferred flush is scheduled for the next connection; with `blocking`
    /// the call waits for it and returns its count, without it returns 0.
    pub async fn flush(&self, blocking: bool) -> Result<usize, TransportError> {
        if self.session.is_empty() {
            return Ok(0);
        }

        if self.state().is_connected() {
            return self.send_now().await;
        }

        let mut outcome = self.schedule_deferred();
        if !blocking {
            debug!(
                buffered = self.session.len(),
                state = %self.state(),
                "not connected, flush deferred",
            );
            return Ok(0);
        }

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(done) => done.clone().unwrap_or(Err(TransportError::Cancelled)),
            Err(_) => Err(TransportError::Cancelled),
        };
        result
    }

    async fn send_now(&self) -> Result<usize, TransportError> {
        let result = self.session.flush(&*self.inner).await;

        if let Some(health) = &self.inner.health {
            match &result {
                Ok(count) => health.metrics_flushed.inc_by(*count as f64),
                Err(_) => health.flush_errors.inc(),
            }
            health.buffered_metrics.set(self.session.len() as f64);
        }

        if let Err(e) = &result {
            warn!(error = %e, buffered = self.session.len(), "flush failed, metrics requeued");
        }

        result
    }

    fn schedule_deferred(&self) -> watch::Receiver<FlushOutcome> {
        let mut slot = self.inner.deferred.lock();

        if let Some(pending) = slot.as_ref() {
            if !pending.handle.is_finished() && pending.outcome.borrow().is_none() {
                return pending.outcome.clone();
            }
        }

        let (tx, rx) = watch::channel(None);
        let cancel = self.inner.cancel_token();
        let mut states = self.inner.state_tx.subscribe();
        let this = self.clone();

        let handle = tokio::spawn(async move {
            let connected = tokio::select! {
                _ = cancel.cancelled() => false,
                connected = async {
                    states.wait_for(|s| s.is_connected()).await.is_ok()
                } => connected,
            };

            let result = if connected {
                this.send_now().await
            } else {
                Err(TransportError::Cancelled)
            };
            tx.send_replace(Some(result));
        });

        *slot = Some(DeferredFlush {
            handle,
            outcome: rx.clone(),
        });
        rx
    }

    /// Stop every background task, shut down the socket and reset to
    /// NotConnected. Buffered metrics are kept; `connect()` starts over.
    pub async fn close(&self) {
        let cancel = std::mem::replace(&mut *self.inner.cancel.lock(), CancellationToken::new());
        cancel.cancel();

        let supervisor = self.inner.supervisor.lock().take();
        let watcher = self.inner.watcher.lock().take();
        let deferred = self.inner.deferred.lock().take().map(|d| d.handle);
        for handle in [supervisor, watcher, deferred].into_iter().flatten() {
            handle.abort();
        }

        if let Some(mut conn) = self.inner.conn.lock().await.take() {
            if let Err(e) = conn.writer.shutdown().await {
                debug!(error = %e, "socket shutdown failed");
            }
        }

        self.inner.state.lock().reset();
        self.inner.state_tx.send_replace(ConnectionState::NotConnected);
        if let Some(health) = &self.inner.health {
            health.collector_connected.set(0.0);
        }

        info!(
            host = %self.inner.config.host,
            port = self.inner.config.port,
            buffered = self.session.len(),
            "transport closed",
        );
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::graphite::codec::{read_frame, MetricCodec, PickleCodec};
    use crate::graphite::session::FlushPolicy;
    use crate::graphite::Metric;

    async fn listener() -> (TcpListener, TransportConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let config = TransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            backoff_base: Duration::from_millis(10),
        };
        (listener, config)
    }

    async fn read_one_frame(stream: &mut TcpStream) -> Vec<Metric> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((payload, _)) = read_frame(&buf) {
                return PickleCodec.decode(payload).expect("decode");
            }
            let n = stream.read(&mut chunk).await.expect("read");
            assert!(n > 0, "collector connection closed before a full frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn transport(config: TransportConfig) -> ReliableTransport {
        let session = MetricSession::new("", FlushPolicy::manual()).expect("session");
        ReliableTransport::new(config, session, None)
    }

    #[test]
    fn test_backoff_sequence() {
        let base = Duration::from_secs(1);
        let delays: Vec<u64> = (0..6)
            .map(|attempt| backoff_delay(base, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 1, 2]);
    }

    /// A config for a local port with nothing listening on it.
    async fn refused(backoff_base: Duration) -> (std::net::SocketAddr, TransportConfig) {
        let (listener, mut config) = listener().await;
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        config.backoff_base = backoff_base;
        (addr, config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_backs_off_between_refused_dials() {
        let (addr, config) = refused(Duration::from_secs(1)).await;
        let transport = transport(config);
        let started = tokio::time::Instant::now();

        let dialer = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect().await.map(|()| started.elapsed()) })
        };

        // Refused at 0, 1, 3, 7 and 15 s. The next dial comes 1 s later.
        tokio::time::sleep_until(started + Duration::from_millis(15_500)).await;
        assert!(!dialer.is_finished());
        let listener = TcpListener::bind(addr).await.expect("rebind");

        let elapsed = dialer.await.expect("join").expect("connect");
        assert_eq!(elapsed.as_secs(), 16);
        assert_eq!(transport.state(), ConnectionState::Connected);
        let _peer = listener.accept().await.expect("accept");

        transport.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_connect_retries() {
        let (_addr, config) = refused(Duration::from_secs(1)).await;
        let transport = transport(config);

        let dialer = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect().await })
        };

        // Inside the 2 s wait after the second refusal.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(!dialer.is_finished());

        transport.close().await;
        let err = dialer.await.expect("join").expect_err("cancelled");
        assert!(matches!(err, TransportError::Cancelled));
        assert_eq!(transport.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_persistent_connect_retries_fatal_errors() {
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let config = TransportConfig {
            // Rejected by the resolver before any packet is sent.
            host: "collector\0invalid".to_string(),
            port: DEFAULT_PICKLE_PORT,
            backoff_base: Duration::from_millis(10),
        };
        let session = MetricSession::new("", FlushPolicy::manual()).expect("session");
        let transport = ReliableTransport::new(config, session, Some(Arc::clone(&health)));

        let err = transport.connect().await.expect_err("fatal");
        assert!(!matches!(err, TransportError::Cancelled));

        let dialer = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect_persistent().await })
        };

        // Retries at 0, 10, 30 and 70 ms.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!dialer.is_finished());
        assert!(health.dial_errors.get() >= 3.0);

        transport.close().await;
        let err = dialer.await.expect("join").expect_err("cancelled");
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[test]
    fn test_config_from_address() {
        let config =
            TransportConfig::from_address("collector", Duration::from_secs(1)).expect("valid");
        assert_eq!(config.port, DEFAULT_PICKLE_PORT);

        let config =
            TransportConfig::from_address("[::1]:2104", Duration::from_secs(1)).expect("valid");
        assert_eq!((config.host.as_str(), config.port), ("::1", 2104));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (listener, config) = listener().await;
        let transport = transport(config);

        let (a, b) = tokio::join!(transport.connect(), transport.connect());
        a.expect("connect");
        b.expect("connect");
        assert_eq!(transport.state(), ConnectionState::Connected);

        let _first = listener.accept().await.expect("accept");
        let second =
            tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(second.is_err(), "only one connection should be dialled");

        transport.close().await;
    }

    #[tokio::test]
    async fn test_flush_when_connected_sends_frame() {
        let (listener, config) = listener().await;
        let transport = transport(config);
        transport.connect().await.expect("connect");
        let (mut peer, _) = listener.accept().await.expect("accept");

        transport
            .post("key", 1.0, Some(123.0), None)
            .await
            .expect("post");
        assert_eq!(transport.flush(true).await.expect("flush"), 1);

        let received = read_one_frame(&mut peer).await;
        assert_eq!(
            received,
            vec![Metric {
                name: "key".to_string(),
                value: 1.0,
                timestamp: 123.0,
            }]
        );

        transport.close().await;
        assert_eq!(transport.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_blocking_flush_waits_for_connection() {
        let (listener, config) = listener().await;
        let transport = transport(config);

        transport
            .post("early", 2.0, Some(1.0), None)
            .await
            .expect("post");

        let flusher = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.flush(true).await })
        };
        tokio::task::yield_now().await;
        assert!(!flusher.is_finished());

        transport.connect().await.expect("connect");
        let (mut peer, _) = listener.accept().await.expect("accept");

        let sent = flusher.await.expect("join").expect("flush");
        assert_eq!(sent, 1);
        assert_eq!(read_one_frame(&mut peer).await[0].name, "early");

        transport.close().await;
    }

    #[tokio::test]
    async fn test_close_cancels_blocking_flush() {
        let (_listener, config) = listener().await;
        let transport = transport(config);
        transport
            .post("stuck", 1.0, Some(1.0), None)
            .await
            .expect("post");

        let flusher = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.flush(true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        transport.close().await;
        let err = flusher.await.expect("join").expect_err("cancelled");
        assert!(matches!(err, TransportError::Cancelled));
        assert_eq!(transport.session().len(), 1);
    }

    #[tokio::test]
    async fn test_eof_marks_connection_lost_then_reconnects() {
        let (listener, config) = listener().await;
        let transport = transport(config);
        let mut states = transport.subscribe_state();

        transport.connect().await.expect("connect");
        let (peer, _) = listener.accept().await.expect("accept");
        drop(peer);

        let (_peer, _) = listener.accept().await.expect("reconnect");
        states
            .wait_for(|s| s.is_connected())
            .await
            .expect("connected again");

        transport.close().await;
    }
}
