use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::codec::{self, MetricCodec, PickleCodec};
use super::error::{TransportError, ValidationError};
use super::{now_seconds, validate_metric, validate_namespace, Metric};

/// When a post should trigger a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush once this many metrics are buffered. `None` disables the check.
    pub queue_max: Option<NonZeroUsize>,
    /// Flush once this long has passed since the last flush. `None` disables the check.
    pub delay_max: Option<Duration>,
}

impl FlushPolicy {
    /// Never flush automatically; callers flush explicitly.
    pub const fn manual() -> Self {
        Self {
            queue_max: None,
            delay_max: None,
        }
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            queue_max: NonZeroUsize::new(100),
            delay_max: Some(Duration::from_secs(10)),
        }
    }
}

/// Destination for framed payloads.
pub trait FrameSink: Send + Sync {
    /// Deliver one complete frame (length prefix included).
    fn send_frame(
        &self,
        frame: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

struct BufferState {
    metrics: VecDeque<Metric>,
    last_flush: Option<Instant>,
}

struct SharedBuffer {
    state: Mutex<BufferState>,
    policy: FlushPolicy,
    codec: Arc<dyn MetricCodec>,
}

impl SharedBuffer {
    fn requeue_front(&self, snapshot: Vec<Metric>) {
        let mut state = self.state.lock();
        for metric in snapshot.into_iter().rev() {
            state.metrics.push_front(metric);
        }
    }
}

/// Puts an in-flight snapshot back at the buffer front unless disarmed.
///
/// Covers send errors as well as the flush future being dropped mid-send.
struct RequeueOnDrop<'a> {
    shared: &'a SharedBuffer,
    snapshot: Option<Vec<Metric>>,
}

impl RequeueOnDrop<'_> {
    fn metrics(&self) -> &[Metric] {
        self.snapshot.as_deref().unwrap_or_default()
    }

    fn disarm(mut self) {
        self.snapshot = None;
    }
}

impl Drop for RequeueOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            debug!(count = snapshot.len(), "requeueing unsent metrics");
            self.shared.requeue_front(snapshot);
        }
    }
}

/// Namespaced handle onto a shared metric buffer.
///
/// Flushing hands one framed payload to a [`FrameSink`]. Sessions derived
/// with [`MetricSession::using`] share the buffer, so every namespace goes
/// out in one FIFO stream.
#[derive(Clone)]
pub struct MetricSession {
    namespace: Arc<str>,
    shared: Arc<SharedBuffer>,
}

impl fmt::Debug for MetricSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSession")
            .field("namespace", &self.namespace)
            .field("policy", &self.shared.policy)
            .field("codec", &self.shared.codec.name())
            .field("buffered", &self.len())
            .finish()
    }
}

impl MetricSession {
    /// Create a session with the pickle codec.
    pub fn new(namespace: &str, policy: FlushPolicy) -> Result<Self, ValidationError> {
        Self::with_codec(namespace, policy, Arc::new(PickleCodec))
    }

    pub fn with_codec(
        namespace: &str,
        policy: FlushPolicy,
        codec: Arc<dyn MetricCodec>,
    ) -> Result<Self, ValidationError> {
        validate_namespace(namespace)?;

        Ok(Self {
            namespace: Arc::from(namespace),
            shared: Arc::new(SharedBuffer {
                state: Mutex::new(BufferState {
                    metrics: VecDeque::with_capacity(policy.queue_max.map_or(64, NonZeroUsize::get)),
                    last_flush: None,
                }),
                policy,
                codec,
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn policy(&self) -> FlushPolicy {
        self.shared.policy
    }

    /// Number of buffered, unsent metrics.
    pub fn len(&self) -> usize {
        self.shared.state.lock().metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().metrics.is_empty()
    }

    /// Copy of the buffered metrics, oldest first.
    pub fn pending(&self) -> Vec<Metric> {
        self.shared.state.lock().metrics.iter().cloned().collect()
    }

    /// Derive a session over the same buffer with another namespace.
    ///
    /// With `join` and a non-empty parent namespace the result is
    /// `parent.namespace`; otherwise `namespace` is used verbatim.
    pub fn using(&self, namespace: &str, join: bool) -> Result<Self, ValidationError> {
        validate_namespace(namespace)?;

        let joined = match (join, self.namespace.is_empty(), namespace.is_empty()) {
            (true, false, false) => format!("{}.{}", self.namespace, namespace),
            (true, false, true) => self.namespace.to_string(),
            _ => namespace.to_string(),
        };

        Ok(Self {
            namespace: Arc::from(joined),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Validate and buffer a metric without evaluating the flush policy.
    ///
    /// `namespace` overrides the session namespace verbatim; an empty override
    /// posts the bare name.
    pub fn append(
        &self,
        name: &str,
        value: f64,
        timestamp: Option<f64>,
        namespace: Option<&str>,
    ) -> Result<(), ValidationError> {
        validate_metric(name, value)?;

        let namespace = match namespace {
            Some(ns) => {
                validate_namespace(ns)?;
                ns
            }
            None => &self.namespace,
        };

        let name = if namespace.is_empty() {
            name.to_string()
        } else {
            format!("{namespace}.{name}")
        };

        let metric = Metric {
            name,
            value,
            timestamp: timestamp.unwrap_or_else(now_seconds),
        };

        self.shared.state.lock().metrics.push_back(metric);
        Ok(())
    }

    /// Whether the flush policy asks for a flush right now.
    pub fn flush_due(&self) -> bool {
        let policy = self.shared.policy;
        let state = self.shared.state.lock();

        let delay_due = policy.delay_max.is_some_and(|delay| {
            state
                .last_flush
                .map_or(true, |last| last.elapsed() >= delay)
        });
        let size_due = policy
            .queue_max
            .is_some_and(|max| state.metrics.len() >= max.get());

        delay_due || size_due
    }

    /// Buffer a metric and flush through `sink` if the policy says so.
    ///
    /// Returns the number of metrics sent, 0 when no flush happened.
    pub async fn post<S: FrameSink>(
        &self,
        sink: &S,
        name: &str,
        value: f64,
        timestamp: Option<f64>,
        namespace: Option<&str>,
    ) -> Result<usize, TransportError> {
        self.append(name, value, timestamp, namespace)?;

        if self.flush_due() {
            self.flush(sink).await
        } else {
            Ok(0)
        }
    }

    /// Send everything buffered as one frame.
    ///
    /// Metrics appended while the send is in flight stay queued for the next
    /// flush. On failure the snapshot goes back to the front of the buffer.
    pub async fn flush<S: FrameSink>(&self, sink: &S) -> Result<usize, TransportError> {
        let started = Instant::now();

        let snapshot: Vec<Metric> = {
            let mut state = self.shared.state.lock();
            if state.metrics.is_empty() {
                return Ok(0);
            }
            state.metrics.drain(..).collect()
        };

        let count = snapshot.len();
        let guard = RequeueOnDrop {
            shared: &self.shared,
            snapshot: Some(snapshot),
        };

        let payload = self.shared.codec.encode(guard.metrics())?;
        let frame = codec::frame(&payload)?;
        let bytes = frame.len();

        sink.send_frame(frame).await?;
        guard.disarm();

        self.shared.state.lock().last_flush = Some(started);

        debug!(
            count,
            bytes,
            namespace = %self.namespace,
            codec = self.shared.codec.name(),
            "flushed metrics",
        );

        Ok(count)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::graphite::codec::read_frame;

    /// In-memory sink that records frames and can be told to fail.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub frames: Mutex<Vec<Vec<u8>>>,
        pub fail: AtomicBool,
    }

    impl MemorySink {
        pub fn metrics(&self) -> Vec<Metric> {
            self.frames
                .lock()
                .iter()
                .flat_map(|frame| {
                    let (payload, used) = read_frame(frame).expect("complete frame");
                    assert_eq!(used, frame.len());
                    PickleCodec.decode(payload).expect("decode")
                })
                .collect()
        }
    }

    impl FrameSink for MemorySink {
        async fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Io {
                    op: "writing frame",
                    kind: std::io::ErrorKind::BrokenPipe,
                    message: "broken pipe".to_string(),
                });
            }
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    /// Appends another metric through a second handle while the send is in flight.
    struct AppendingSink {
        session: MetricSession,
        inner: MemorySink,
    }

    impl FrameSink for AppendingSink {
        async fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
            self.session
                .append("late", 9.0, Some(9.0), None)
                .expect("append during flush");
            tokio::task::yield_now().await;
            self.inner.send_frame(frame).await
        }
    }

    /// Never completes.
    struct StalledSink;

    impl FrameSink for StalledSink {
        async fn send_frame(&self, _frame: Vec<u8>) -> Result<(), TransportError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn manual_session(namespace: &str) -> MetricSession {
        MetricSession::new(namespace, FlushPolicy::manual()).expect("valid namespace")
    }

    #[tokio::test]
    async fn test_post_then_flush_delivers_exact_tuple() {
        let session = manual_session("");
        let sink = MemorySink::default();

        let sent = session
            .post(&sink, "key", 1.0, Some(123.0), None)
            .await
            .expect("post");
        assert_eq!(sent, 0);

        assert_eq!(session.flush(&sink).await.expect("flush"), 1);
        assert_eq!(
            sink.metrics(),
            vec![Metric {
                name: "key".to_string(),
                value: 1.0,
                timestamp: 123.0,
            }]
        );
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let session = manual_session("ns");
        let sink = MemorySink::default();

        assert_eq!(session.flush(&sink).await.expect("flush"), 0);
        assert!(sink.frames.lock().is_empty());
    }

    #[tokio::test]
    async fn test_namespace_prefix_and_override() {
        let session = manual_session("pf");
        let sink = MemorySink::default();

        session.append("a", 1.0, Some(1.0), None).expect("append");
        session
            .append("b", 2.0, Some(1.0), Some("other"))
            .expect("append");
        session.append("c", 3.0, Some(1.0), Some("")).expect("append");

        session.flush(&sink).await.expect("flush");
        let names: Vec<String> = sink.metrics().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["pf.a", "other.b", "c"]);
    }

    #[test]
    fn test_invalid_inputs_are_not_buffered() {
        let session = manual_session("ns");

        assert!(session.append("", 1.0, None, None).is_err());
        assert!(session.append("a b", 1.0, None, None).is_err());
        assert!(session.append("a", f64::NAN, None, None).is_err());
        assert!(session.append("a", 1.0, None, Some("bad ns")).is_err());
        assert!(session.is_empty());

        assert!(MetricSession::new("bad/ns", FlushPolicy::manual()).is_err());
    }

    #[test]
    fn test_using_joins_namespaces() {
        let root = manual_session("root");

        assert_eq!(root.using("pf", true).expect("valid").namespace(), "root.pf");
        assert_eq!(root.using("pf", false).expect("valid").namespace(), "pf");
        assert_eq!(root.using("", true).expect("valid").namespace(), "root");

        let bare = manual_session("");
        assert_eq!(bare.using("ping", true).expect("valid").namespace(), "ping");

        assert!(root.using("no spaces", true).is_err());
    }

    #[tokio::test]
    async fn test_derived_sessions_share_buffer_order() {
        let root = manual_session("");
        let pf = root.using("pf", true).expect("valid");
        let ping = root.using("ping", true).expect("valid");
        let sink = MemorySink::default();

        pf.append("a", 1.0, Some(1.0), None).expect("append");
        ping.append("b", 2.0, Some(2.0), None).expect("append");
        pf.append("c", 3.0, Some(3.0), None).expect("append");
        assert_eq!(root.len(), 3);

        assert_eq!(ping.flush(&sink).await.expect("flush"), 3);
        let names: Vec<String> = sink.metrics().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["pf.a", "ping.b", "pf.c"]);
    }

    #[tokio::test]
    async fn test_queue_max_triggers_exactly_one_flush() {
        let policy = FlushPolicy {
            queue_max: NonZeroUsize::new(5),
            delay_max: None,
        };
        let session = MetricSession::new("q", policy).expect("valid");
        let sink = MemorySink::default();

        let mut sent = Vec::new();
        for i in 0..5 {
            sent.push(
                session
                    .post(&sink, "m", f64::from(i), Some(1.0), None)
                    .await
                    .expect("post"),
            );
        }

        assert_eq!(sent, vec![0, 0, 0, 0, 5]);
        assert_eq!(sink.frames.lock().len(), 1);
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_delay_max_triggers_flush_after_wait() {
        let policy = FlushPolicy {
            queue_max: None,
            delay_max: Some(Duration::from_millis(50)),
        };
        let session = MetricSession::new("d", policy).expect("valid");
        let sink = MemorySink::default();

        // Never flushed yet, so the first post is due immediately.
        assert_eq!(
            session.post(&sink, "m", 1.0, None, None).await.expect("post"),
            1
        );
        assert_eq!(
            session.post(&sink, "m", 2.0, None, None).await.expect("post"),
            0
        );

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(
            session.post(&sink, "m", 3.0, None, None).await.expect("post"),
            2
        );
        assert_eq!(sink.frames.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_send_failure_requeues_at_front() {
        let session = manual_session("");
        let sink = MemorySink::default();

        session.append("a", 1.0, Some(1.0), None).expect("append");
        session.append("b", 2.0, Some(2.0), None).expect("append");

        sink.fail.store(true, Ordering::SeqCst);
        let err = session.flush(&sink).await.expect_err("send fails");
        assert!(matches!(err, TransportError::Io { .. }));

        session.append("c", 3.0, Some(3.0), None).expect("append");
        let names: Vec<String> = session.pending().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(session.flush(&sink).await.expect("flush"), 3);
        assert_eq!(sink.metrics().len(), 3);
    }

    #[tokio::test]
    async fn test_appends_during_flush_stay_queued() {
        let session = manual_session("");
        let sink = AppendingSink {
            session: session.clone(),
            inner: MemorySink::default(),
        };

        session.append("early", 1.0, Some(1.0), None).expect("append");

        assert_eq!(session.flush(&sink).await.expect("flush"), 1);
        let names: Vec<String> = session.pending().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["late"]);
        assert_eq!(sink.inner.metrics().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_flush_requeues_snapshot() {
        let session = manual_session("");
        session.append("a", 1.0, Some(1.0), None).expect("append");

        let result =
            tokio::time::timeout(Duration::from_millis(20), session.flush(&StalledSink)).await;
        assert!(result.is_err(), "flush should time out");

        let names: Vec<String> = session.pending().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a"]);
    }
}
