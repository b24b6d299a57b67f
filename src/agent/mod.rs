use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::graphite::{now_seconds, sanitize_segment, MetricSession, ReliableTransport};
use crate::health::HealthMetrics;
use crate::ifstats::{InterfaceSampler, ProcNetDevSampler};
use crate::pf::PfctlSource;
use crate::ping::{ExitAfterPolicy, IcmpResponse, LossSummary, PingEvent, Pinger};

/// How long `stop()` waits for the final flush.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Agent orchestrates all components: transport, pf poller, ping probes,
/// interface sampler and the health server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    sampler: Arc<dyn InterfaceSampler>,
    transport: Option<ReliableTransport>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            sampler: Arc::new(ProcNetDevSampler::default()),
            transport: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the interface sampler.
    pub fn with_sampler(mut self, sampler: Arc<dyn InterfaceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// The collector transport, once started.
    pub fn transport(&self) -> Option<&ReliableTransport> {
        self.transport.as_ref()
    }

    /// Resolves once the agent stops itself (time limit) or `stop()` is called.
    pub async fn finished(&self) {
        self.cancel.cancelled().await;
    }

    /// Start all components. Sources begin buffering immediately; the
    /// collector connection is established in the background.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server.
        if self.cfg.health.enabled {
            let addr = self
                .health
                .start()
                .await
                .context("starting health metrics server")?;
            info!(addr = %addr, "health metrics server started");
        }

        // 1. Create the root session and transport.
        let session = MetricSession::new(
            &self.cfg.graphite.namespace,
            self.cfg.graphite.flush_policy(),
        )
        .context("creating metric session")?;

        let transport = ReliableTransport::new(
            self.cfg.graphite.transport_config()?,
            session,
            Some(Arc::clone(&self.health)),
        );

        // 2. Connect in the background so a slow collector never blocks sources.
        {
            let transport = transport.clone();
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = transport.connect_persistent() => {
                        if let Err(e) = result {
                            debug!(error = %e, "collector dial abandoned");
                        }
                    }
                }
            }));
        }

        info!(
            host = %transport.config().host,
            port = transport.config().port,
            namespace = transport.session().namespace(),
            "collector transport configured",
        );

        // 3. Start sources.
        if self.cfg.pf.enabled {
            self.spawn_pf_poller(&transport)?;
        }
        if self.cfg.ping.enabled {
            self.spawn_ping_probes(&transport)?;
        }
        if self.cfg.ifstats.enabled {
            self.spawn_ifstats_sampler(&transport)?;
        }

        // 4. Arm the time limit.
        if let Some(limit) = self.cfg.time_limit {
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        info!(limit = ?limit, "time limit reached");
                        cancel.cancel();
                    }
                }
            }));
        }

        self.transport = Some(transport);

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "agent task panicked");
                }
            }
        }

        // Final flush, bounded so an unreachable collector cannot hang shutdown.
        if let Some(transport) = self.transport.take() {
            match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, transport.flush(true)).await {
                Ok(Ok(count)) => debug!(count, "final flush complete"),
                Ok(Err(e)) => warn!(error = %e, "final flush failed"),
                Err(_) => warn!(
                    buffered = transport.session().len(),
                    "final flush timed out, dropping buffered metrics",
                ),
            }
            transport.close().await;
        }

        // Stop health metrics server.
        self.health.stop();

        Ok(())
    }

    fn spawn_pf_poller(&mut self, transport: &ReliableTransport) -> Result<()> {
        let transport = transport
            .using(&self.cfg.pf.namespace, true)
            .context("deriving pf session")?;
        let source = PfctlSource::new(self.cfg.pf.command.clone());
        let leaves_only = self.cfg.pf.leaves_only;
        let poll_interval = self.cfg.pf.poll_interval;
        let health = Arc::clone(&self.health);
        let cancel = self.cancel.clone();

        info!(
            command = %source.command(),
            interval = ?poll_interval,
            leaves_only,
            "pf poller started",
        );

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        poll_pf(&source, &transport, leaves_only, &health).await;
                    }
                }
            }
        }));

        Ok(())
    }

    fn spawn_ping_probes(&mut self, transport: &ReliableTransport) -> Result<()> {
        let ping = transport
            .using(&self.cfg.ping.namespace, true)
            .context("deriving ping session")?;
        let pinger = Pinger::new(self.cfg.ping.program.clone()).with_args(&self.cfg.ping.args);
        let policy = self.cfg.ping.exit_policy();

        for target in &self.cfg.ping.targets {
            let transport = ping
                .using(&sanitize_segment(target), true)
                .with_context(|| format!("deriving session for ping target {target}"))?;

            let run = ProbeRun {
                pinger: pinger.clone(),
                target: target.clone(),
                policy: policy.clone(),
                restart_delay: self.cfg.ping.restart_delay,
                transport,
                health: Arc::clone(&self.health),
            };
            self.tasks.push(tokio::spawn(run.run(self.cancel.clone())));
        }

        info!(targets = ?self.cfg.ping.targets, "ping probes started");

        Ok(())
    }

    fn spawn_ifstats_sampler(&mut self, transport: &ReliableTransport) -> Result<()> {
        let transport = transport
            .using(&self.cfg.ifstats.namespace, true)
            .context("deriving ifstats session")?;
        let sampler = Arc::clone(&self.sampler);
        let interfaces = self.cfg.ifstats.interfaces.clone();
        let poll_interval = self.cfg.ifstats.poll_interval;
        let health = Arc::clone(&self.health);
        let cancel = self.cancel.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        sample_interfaces(sampler.as_ref(), &interfaces, &transport, &health).await;
                    }
                }
            }
        }));

        Ok(())
    }
}

/// Post `name` through `transport`, logging rather than propagating failures.
/// A failed flush leaves the metrics requeued for the next attempt.
async fn post_logged(transport: &ReliableTransport, name: &str, value: f64, timestamp: f64) {
    if let Err(e) = transport.post(name, value, Some(timestamp), None).await {
        warn!(metric = name, error = %e, "posting metric failed");
    }
}

async fn flush_logged(transport: &ReliableTransport) {
    if let Err(e) = transport.flush(false).await {
        warn!(error = %e, "flush failed");
    }
}

/// One pf poll: read, aggregate, post `<queue>.<metric>` for every queue.
async fn poll_pf(
    source: &PfctlSource,
    transport: &ReliableTransport,
    leaves_only: bool,
    health: &HealthMetrics,
) {
    let reading = match source.read().await {
        Ok(reading) => reading,
        Err(e) => {
            health.source_failures.with_label_values(&["pf"]).inc();
            warn!(error = %e, "pf poll failed");
            return;
        }
    };

    health.pf_polls.inc();
    health.pf_parse_errors.inc_by(reading.parse_errors as f64);

    let timestamp = now_seconds();
    let mut posted = 0usize;

    for queue in reading
        .queues
        .values()
        .filter(|q| !leaves_only || q.is_leaf())
    {
        let segment = sanitize_segment(&queue.name);
        for (metric, value) in &queue.metrics {
            post_logged(transport, &format!("{segment}.{metric}"), *value, timestamp).await;
            posted += 1;
        }
    }

    flush_logged(transport).await;

    debug!(queues = reading.queues.len(), posted, "pf poll complete");
}

/// One ifstats sample: post `<interface>.rx_bytes` and `<interface>.tx_bytes`.
async fn sample_interfaces(
    sampler: &dyn InterfaceSampler,
    interfaces: &[String],
    transport: &ReliableTransport,
    health: &HealthMetrics,
) {
    let samples = match sampler.sample(interfaces) {
        Ok(samples) => samples,
        Err(e) => {
            health.source_failures.with_label_values(&["ifstats"]).inc();
            warn!(error = %e, "interface sampling failed");
            return;
        }
    };

    for sample in &samples {
        let segment = sanitize_segment(&sample.name);
        post_logged(
            transport,
            &format!("{segment}.rx_bytes"),
            sample.rx_bytes as f64,
            sample.timestamp,
        )
        .await;
        post_logged(
            transport,
            &format!("{segment}.tx_bytes"),
            sample.tx_bytes as f64,
            sample.timestamp,
        )
        .await;
    }

    flush_logged(transport).await;
}

/// Repeated probe runs against one target.
struct ProbeRun {
    pinger: Pinger,
    target: String,
    policy: Option<ExitAfterPolicy>,
    restart_delay: Duration,
    transport: ReliableTransport,
    health: Arc<HealthMetrics>,
}

impl ProbeRun {
    async fn run(self, cancel: CancellationToken) {
        loop {
            if self.run_once(&cancel).await.is_break() {
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }
    }

    /// Drive one ping process to completion. Breaks when cancelled.
    async fn run_once(&self, cancel: &CancellationToken) -> std::ops::ControlFlow<()> {
        let mut probe = match self.pinger.probe(&self.target, self.policy.clone()) {
            Ok(probe) => probe,
            Err(e) => {
                self.source_failed(&e);
                return std::ops::ControlFlow::Continue(());
            }
        };

        let mut summary = LossSummary::default();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = probe.cancel().await {
                        debug!(target = %self.target, error = %e, "ping cancel failed");
                    }
                    flush_logged(&self.transport).await;
                    return std::ops::ControlFlow::Break(());
                }
                event = probe.next() => event,
            };

            match event {
                None => break,
                Some(Ok(PingEvent::Preamble(preamble))) => {
                    info!(target = %self.target, ip = %preamble.ip, "probing");
                }
                Some(Ok(PingEvent::Response(response))) => {
                    summary.record(&response);
                    self.record(&response).await;
                }
                Some(Err(e)) => self.source_failed(&e),
            }
        }

        flush_logged(&self.transport).await;
        debug!(
            target = %self.target,
            responses = summary.responses,
            lost = summary.lost,
            loss_percent = summary.loss_percent(),
            "ping run finished",
        );
        std::ops::ControlFlow::Continue(())
    }

    /// Post `lost` for every response and `time_ms` / `ttl` for replies.
    async fn record(&self, response: &IcmpResponse) {
        let timestamp = now_seconds();

        self.health
            .ping_responses
            .with_label_values(&[self.target.as_str()])
            .inc();

        if response.is_lost() {
            self.health.ping_lost.with_label_values(&[self.target.as_str()]).inc();
            post_logged(&self.transport, "lost", 1.0, timestamp).await;
            return;
        }

        post_logged(&self.transport, "lost", 0.0, timestamp).await;
        post_logged(&self.transport, "time_ms", response.time_ms, timestamp).await;
        post_logged(&self.transport, "ttl", f64::from(response.ttl), timestamp).await;
    }

    fn source_failed(&self, err: &dyn std::error::Error) {
        self.health.source_failures.with_label_values(&["ping"]).inc();
        warn!(target = %self.target, error = %err, "ping run failed");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::config::GraphiteConfig;
    use crate::graphite::codec::read_frame;
    use crate::graphite::{Metric, MetricCodec, PickleCodec};
    use crate::ifstats::Sample;

    const QUEUES: &str = "\
queue root on ext0 bandwidth 1Mb {a, b}
  [ pkts:          0  bytes:          0  dropped pkts:      0 bytes:      0 ]
queue  a on ext0 bandwidth 500Kb
  [ pkts:          5  bytes:        100  dropped pkts:      1 bytes:     10 ]
queue  b on ext0 bandwidth 500Kb
  [ pkts:          7  bytes:        300  dropped pkts:      0 bytes:      0 ]
";

    struct FixedSampler;

    impl InterfaceSampler for FixedSampler {
        fn sample(&self, _interfaces: &[String]) -> Result<Vec<Sample>> {
            Ok(vec![Sample {
                ordinal: 1,
                name: "em0".to_string(),
                rx_bytes: 10,
                tx_bytes: 20,
                timestamp: 1000.0,
            }])
        }
    }

    async fn collector() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        (listener, addr)
    }

    fn base_config(address: String) -> Config {
        let mut cfg = Config {
            graphite: GraphiteConfig {
                address,
                namespace: "fw".to_string(),
                queue_max: 0,
                delay_max: None,
                backoff_base: Duration::from_millis(10),
            },
            ..Default::default()
        };
        cfg.pf.enabled = false;
        cfg
    }

    async fn read_metrics_until(stream: &mut TcpStream, want: usize) -> Vec<Metric> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut metrics = Vec::new();

        while metrics.len() < want {
            while let Some((payload, used)) = read_frame(&buf) {
                metrics.extend(PickleCodec.decode(payload).expect("decode"));
                buf.drain(..used);
            }
            if metrics.len() >= want {
                break;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .expect("collector read timed out")
                .expect("read");
            assert!(n > 0, "agent closed the connection early");
            buf.extend_from_slice(&chunk[..n]);
        }
        metrics
    }

    #[tokio::test]
    async fn test_pf_poll_posts_namespaced_queue_metrics() {
        let (listener, address) = collector().await;
        let mut fixture = tempfile::NamedTempFile::new().expect("tempfile");
        fixture.write_all(QUEUES.as_bytes()).expect("write");

        let mut cfg = base_config(address);
        cfg.pf.enabled = true;
        cfg.pf.command = format!("cat {}", fixture.path().display());
        cfg.pf.poll_interval = Duration::from_secs(60);

        let mut agent = Agent::new(cfg).expect("agent");
        agent.start().await.expect("start");
        let (mut peer, _) = listener.accept().await.expect("accept");

        // Three queues with pkts, pkts_bytes, dropped_pkts, dropped_pkts_bytes.
        let metrics = read_metrics_until(&mut peer, 12).await;
        let root_pkts = metrics
            .iter()
            .find(|m| m.name == "fw.pf.root.pkts")
            .expect("root pkts");
        assert_eq!(root_pkts.value, 12.0);
        assert!(metrics.iter().any(|m| m.name == "fw.pf.a.dropped_pkts_bytes"));

        agent.stop().await.expect("stop");
        assert_eq!(agent.health().pf_polls.get(), 1.0);
    }

    #[tokio::test]
    async fn test_pf_leaves_only() {
        let (listener, address) = collector().await;
        let mut fixture = tempfile::NamedTempFile::new().expect("tempfile");
        fixture.write_all(QUEUES.as_bytes()).expect("write");

        let mut cfg = base_config(address);
        cfg.pf.enabled = true;
        cfg.pf.leaves_only = true;
        cfg.pf.command = format!("cat {}", fixture.path().display());
        cfg.pf.poll_interval = Duration::from_secs(60);

        let mut agent = Agent::new(cfg).expect("agent");
        agent.start().await.expect("start");
        let (mut peer, _) = listener.accept().await.expect("accept");

        let metrics = read_metrics_until(&mut peer, 8).await;
        assert!(metrics.iter().all(|m| !m.name.starts_with("fw.pf.root.")));

        agent.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_pf_failure_is_counted() {
        let (_listener, address) = collector().await;

        let mut cfg = base_config(address);
        cfg.pf.enabled = true;
        cfg.pf.command = "false".to_string();
        cfg.pf.poll_interval = Duration::from_secs(60);

        let mut agent = Agent::new(cfg).expect("agent");
        agent.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(300)).await;
        agent.stop().await.expect("stop");

        let failures = agent
            .health()
            .source_failures
            .with_label_values(&["pf"])
            .get();
        assert_eq!(failures, 1.0);
        assert_eq!(agent.health().pf_polls.get(), 0.0);
    }

    #[tokio::test]
    async fn test_ifstats_posts_counters() {
        let (listener, address) = collector().await;

        let mut cfg = base_config(address);
        cfg.ifstats.enabled = true;

        let mut agent = Agent::new(cfg)
            .expect("agent")
            .with_sampler(Arc::new(FixedSampler));
        agent.start().await.expect("start");
        let (mut peer, _) = listener.accept().await.expect("accept");

        let metrics = read_metrics_until(&mut peer, 2).await;
        assert_eq!(
            metrics,
            vec![
                Metric {
                    name: "fw.ifstats.em0.rx_bytes".to_string(),
                    value: 10.0,
                    timestamp: 1000.0,
                },
                Metric {
                    name: "fw.ifstats.em0.tx_bytes".to_string(),
                    value: 20.0,
                    timestamp: 1000.0,
                },
            ]
        );

        agent.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_ping_records_replies_and_losses() {
        let (listener, address) = collector().await;
        let script = "echo 'PING 10.0.0.1 (10.0.0.1): 56 data bytes'; \
                      echo '64 bytes from 10.0.0.1: icmp_seq=0 ttl=64 time=1.5 ms'; \
                      echo '64 bytes from 10.0.0.1: icmp_seq=2 ttl=64 time=2.5 ms'";

        let mut cfg = base_config(address);
        cfg.ping.enabled = true;
        cfg.ping.program = "sh".to_string();
        cfg.ping.args = vec!["-c".to_string(), script.to_string()];
        cfg.ping.targets = vec!["10.0.0.1".to_string()];
        cfg.ping.restart_delay = Duration::from_secs(60);

        let mut agent = Agent::new(cfg).expect("agent");
        agent.start().await.expect("start");
        let (mut peer, _) = listener.accept().await.expect("accept");

        // seq 0 reply (3), seq 1 lost (1), seq 2 reply (3).
        let metrics = read_metrics_until(&mut peer, 7).await;
        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "fw.ping.10_0_0_1.lost",
                "fw.ping.10_0_0_1.time_ms",
                "fw.ping.10_0_0_1.ttl",
                "fw.ping.10_0_0_1.lost",
                "fw.ping.10_0_0_1.lost",
                "fw.ping.10_0_0_1.time_ms",
                "fw.ping.10_0_0_1.ttl",
            ]
        );
        assert_eq!(metrics[3].value, 1.0);

        agent.stop().await.expect("stop");
        let lost = agent
            .health()
            .ping_lost
            .with_label_values(&["10.0.0.1"])
            .get();
        assert_eq!(lost, 1.0);
    }

    #[tokio::test]
    async fn test_time_limit_finishes_agent() {
        let (_listener, address) = collector().await;

        let mut cfg = base_config(address);
        cfg.ifstats.enabled = true;
        cfg.time_limit = Some(Duration::from_millis(50));

        let mut agent = Agent::new(cfg)
            .expect("agent")
            .with_sampler(Arc::new(FixedSampler));
        agent.start().await.expect("start");

        tokio::time::timeout(Duration::from_secs(5), agent.finished())
            .await
            .expect("time limit should stop the agent");
        agent.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_collector_dial_survives_fatal_errors() {
        // A NUL byte fails name resolution, which connect() does not retry.
        let cfg = base_config("collector\0invalid:2004".to_string());

        let mut agent = Agent::new(cfg).expect("agent");
        agent.start().await.expect("start");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(agent.health().dial_errors.get() >= 2.0);
        assert!(!agent.transport().expect("transport").state().is_connected());

        agent.stop().await.expect("stop");
    }
}
