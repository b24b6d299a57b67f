use std::collections::VecDeque;
use std::io;
use std::net::Ipv6Addr;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::parse::parse_line;
use super::policy::ExitAfterPolicy;
use super::{IcmpResponse, PingError, PingEvent};

/// How often a time-based exit policy is re-checked while ping is silent.
const POLICY_TICK: Duration = Duration::from_millis(100);

/// How long ping gets to exit after SIGINT before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// ping prints `icmp_seq` as a u16, so it wraps to 0 after 65535.
const SEQ_MODULUS: u64 = 1 << 16;

/// Sequence numbers this close to the last one are duplicates or late
/// replies. A wrap is only recognised when both ends fall inside it.
const SEQ_WINDOW: u64 = 1024;

/// Larger gaps are reported but not filled with lost responses.
const MAX_GAP_FILL: u64 = SEQ_MODULUS;

/// Spawns probes.
#[derive(Debug, Clone)]
pub struct Pinger {
    program: String,
    program_v6: String,
    args: Vec<String>,
}

impl Default for Pinger {
    fn default() -> Self {
        Self::new("ping")
    }
}

impl Pinger {
    /// Use `program` for every target. `ping` switches to `ping6` for IPv6 literals.
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let program_v6 = if program == "ping" {
            "ping6".to_string()
        } else {
            program.clone()
        };

        Self {
            program,
            program_v6,
            args: Vec::new(),
        }
    }

    /// Arguments placed before the target.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_v6_program(mut self, program: impl Into<String>) -> Self {
        self.program_v6 = program.into();
        self
    }

    fn program_for(&self, target: &str) -> &str {
        let bare = target.trim_start_matches('[').trim_end_matches(']');
        if bare.parse::<Ipv6Addr>().is_ok() {
            &self.program_v6
        } else {
            &self.program
        }
    }

    /// Start a probe against `target`. Runs until `policy` is satisfied or
    /// ping exits on its own.
    pub fn probe(
        &self,
        target: &str,
        policy: Option<ExitAfterPolicy>,
    ) -> Result<PingProbe, PingError> {
        let program = self.program_for(target);

        let mut child = Command::new(program)
            .args(&self.args)
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PingError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        let mut tick = tokio::time::interval(POLICY_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(target = %target, program, pid = child.id(), "ping started");

        Ok(PingProbe {
            target: target.to_string(),
            child,
            stdout,
            stderr,
            policy,
            started: Instant::now(),
            tick,
            responses: 0,
            last_seq: None,
            pending: VecDeque::new(),
            done: false,
        })
    }
}

/// Events of one running ping process.
///
/// Call [`PingProbe::next`] until it returns `None`. An abnormal exit is
/// reported as the final item, after every event already produced. Dropping
/// the probe kills the child; [`PingProbe::cancel`] stops it gracefully.
pub struct PingProbe {
    target: String,
    child: Child,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
    policy: Option<ExitAfterPolicy>,
    started: Instant,
    tick: Interval,
    responses: u64,
    last_seq: Option<u64>,
    pending: VecDeque<PingEvent>,
    done: bool,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

impl PingProbe {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Response events delivered so far, synthesized losses included.
    pub fn responses(&self) -> u64 {
        self.responses
    }

    pub async fn next(&mut self) -> Option<Result<PingEvent, PingError>> {
        loop {
            if self.done {
                return None;
            }

            if self.policy_satisfied() {
                // A packet count is exact; a time limit still hands out what was already read.
                if self.policy.as_ref().is_some_and(ExitAfterPolicy::has_time_limit) {
                    if let Some(event) = self.pending.pop_front() {
                        return Some(Ok(self.deliver(event)));
                    }
                }
                return self.finish(true).await;
            }

            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(self.deliver(event)));
            }

            if self.stdout.is_none() && self.stderr.is_none() {
                return self.finish(false).await;
            }

            let timed = self
                .policy
                .as_ref()
                .is_some_and(ExitAfterPolicy::has_time_limit);

            let (stream, read) = tokio::select! {
                line = next_line(&mut self.stdout) => (Stream::Stdout, line),
                line = next_line(&mut self.stderr) => (Stream::Stderr, line),
                _ = self.tick.tick(), if timed => continue,
            };

            match read {
                Ok(Some(line)) => self.ingest(&line, stream),
                Ok(None) => self.close_stream(stream),
                Err(e) => {
                    warn!(target = %self.target, stream = stream.as_str(), error = %e, "reading ping output failed");
                    self.close_stream(stream);
                }
            }
        }
    }

    /// Interrupt ping and wait for it to exit. Undelivered events are dropped.
    pub async fn cancel(&mut self) -> Result<(), PingError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        self.pending.clear();

        let status = self
            .terminate(true)
            .await
            .map_err(|source| PingError::Io {
                target: self.target.clone(),
                source,
            })?;

        debug!(target = %self.target, ?status, "ping cancelled");
        Ok(())
    }

    fn policy_satisfied(&self) -> bool {
        self.policy
            .as_ref()
            .is_some_and(|p| p.poll(self.started.elapsed(), self.responses))
    }

    fn deliver(&mut self, event: PingEvent) -> PingEvent {
        if matches!(event, PingEvent::Response(_)) {
            self.responses += 1;
        }
        event
    }

    fn close_stream(&mut self, stream: Stream) {
        match stream {
            Stream::Stdout => self.stdout = None,
            Stream::Stderr => self.stderr = None,
        }
    }

    fn ingest(&mut self, line: &str, stream: Stream) {
        let event = match parse_line(line) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!(target = %self.target, stream = stream.as_str(), error = %e, "skipping ping output");
                return;
            }
        };

        let response = match event {
            PingEvent::Preamble(mut preamble) => {
                preamble.host = self.target.clone();
                self.pending.push_back(PingEvent::Preamble(preamble));
                return;
            }
            PingEvent::Response(response) => response,
        };

        let seq = response.icmp_seq;
        if let Some(last) = self.last_seq {
            let wrapped = last >= SEQ_MODULUS - SEQ_WINDOW && last < SEQ_MODULUS && seq < SEQ_WINDOW;

            let distance = if seq > last {
                seq - last
            } else if wrapped {
                debug!(target = %self.target, last, icmp_seq = seq, "icmp_seq wrapped");
                seq + SEQ_MODULUS - last
            } else if last - seq <= SEQ_WINDOW {
                debug!(target = %self.target, icmp_seq = seq, "dropping duplicate response");
                return;
            } else {
                warn!(target = %self.target, last, icmp_seq = seq, "icmp_seq jumped backwards, restarting sequence");
                0
            };

            let missing = distance.saturating_sub(1);
            if missing > MAX_GAP_FILL {
                warn!(target = %self.target, last, icmp_seq = seq, missing, "icmp_seq gap too large to fill");
            } else if missing > 0 {
                debug!(target = %self.target, missing, "detected lost packets");
                for step in 1..distance {
                    let lost = if wrapped {
                        (last + step) % SEQ_MODULUS
                    } else {
                        last + step
                    };
                    self.pending
                        .push_back(PingEvent::Response(IcmpResponse::lost(lost)));
                }
            }
        }

        self.last_seq = Some(seq);
        self.pending.push_back(PingEvent::Response(response));
    }

    async fn finish(&mut self, requested: bool) -> Option<Result<PingEvent, PingError>> {
        self.done = true;
        self.pending.clear();

        match self.terminate(requested).await {
            Ok(status) if status.success() => {
                debug!(target = %self.target, responses = self.responses, "ping finished");
                None
            }
            Ok(status) => {
                warn!(target = %self.target, ?status, requested, "ping exited abnormally");
                Some(Err(PingError::AbnormalExit {
                    target: self.target.clone(),
                    code: status.code(),
                }))
            }
            Err(source) => Some(Err(PingError::Io {
                target: self.target.clone(),
                source,
            })),
        }
    }

    fn interrupt(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };

        #[cfg(unix)]
        {
            // SAFETY: `pid` is our own child and has not been reaped yet.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
            if rc != 0 {
                debug!(pid, error = %io::Error::last_os_error(), "sending SIGINT failed");
            }
        }

        #[cfg(not(unix))]
        if let Err(e) = self.child.start_kill() {
            debug!(pid, error = %e, "killing ping failed");
        }
    }

    /// Optionally interrupt, read output to EOF, then reap the child.
    async fn terminate(&mut self, interrupt: bool) -> io::Result<ExitStatus> {
        if interrupt {
            self.interrupt();
        }

        if tokio::time::timeout(TERMINATE_GRACE, self.drain())
            .await
            .is_err()
        {
            warn!(target = %self.target, "ping ignored SIGINT, killing it");
            if let Err(e) = self.child.start_kill() {
                debug!(error = %e, "killing ping failed");
            }
        }

        self.stdout = None;
        self.stderr = None;
        self.child.wait().await
    }

    async fn drain(&mut self) {
        while self.stdout.is_some() || self.stderr.is_some() {
            tokio::select! {
                line = next_line(&mut self.stdout) => {
                    if !matches!(line, Ok(Some(_))) {
                        self.stdout = None;
                    }
                }
                line = next_line(&mut self.stderr) => {
                    if !matches!(line, Ok(Some(_))) {
                        self.stderr = None;
                    }
                }
            }
        }
    }
}
