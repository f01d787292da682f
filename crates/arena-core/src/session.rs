//! Session loop.
//!
//! [`Session::run`] drives one training session through its phases:
//!
//! ```text
//! Initializing -> Running -> Draining -> Terminated
//! ```
//!
//! Initialization is all-or-nothing: the configuration is validated, the
//! map loaded, the visualization endpoint opened, the recorder opened and
//! the agents connected. A failure at any step releases what the earlier
//! steps acquired and ends the session without running a tick.
//!
//! Each tick collects agent inputs, advances the simulation exactly once,
//! takes its snapshot and hands it to the recorder and the publisher. The
//! termination triggers are then evaluated in a fixed order: maximum
//! duration, no live agents, external abort, game concluded. The first
//! one that holds ends the session.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use arena_types::{AgentIndex, SessionId, SessionPhase, SessionResult, Tick};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agents::{AgentConnectionManager, ManagerSettings};
use crate::clock::TickClock;
use crate::config::SessionConfig;
use crate::connector::{Connector, TcpConnector};
use crate::diagnostics::{CommTap, FileTap, NullTap};
use crate::operator::AbortSignal;
use crate::publisher::{FrameTransport, Publisher, PublisherStats};
use crate::recorder::{FileRecorder, NullRecorder, Recorder, RecordingInfo};
use crate::simulation::{BuiltinMaps, MapLoader, Progress, Simulation};
use crate::status::SessionStatus;

/// Reason given for an abort requested from outside the session.
pub const EXTERNAL_ABORT: &str = "external signal";

/// Collaborators a session needs besides its configuration.
pub struct SessionDeps {
    /// Builds the simulation for the configured map.
    pub maps: Arc<dyn MapLoader>,
    /// Opens streams to agent targets.
    pub connector: Arc<dyn Connector>,
    /// Carries snapshots to viewers.
    pub transport: Arc<dyn FrameTransport>,
    /// External abort request.
    pub abort: Arc<AbortSignal>,
    /// Live status, shared with the status endpoint.
    pub status: Arc<SessionStatus>,
}

impl SessionDeps {
    /// Built-in maps, TCP agents, and a fresh abort signal.
    pub fn new(status: Arc<SessionStatus>, transport: Arc<dyn FrameTransport>) -> Self {
        Self {
            maps: Arc::new(BuiltinMaps::new()),
            connector: Arc::new(TcpConnector),
            transport,
            abort: Arc::new(AbortSignal::new()),
            status,
        }
    }

    /// Use `maps` instead of the built-in maps.
    #[must_use]
    pub fn with_maps(mut self, maps: Arc<dyn MapLoader>) -> Self {
        self.maps = maps;
        self
    }

    /// Use `connector` instead of TCP.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Share an existing abort signal.
    #[must_use]
    pub fn with_abort(mut self, abort: Arc<AbortSignal>) -> Self {
        self.abort = abort;
        self
    }
}

/// Time spent in each part of the tick, summed over the session.
///
/// Only collected when profiling is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickTimings {
    /// Ticks measured.
    pub ticks: u64,
    /// Waiting for agent inputs.
    pub collect: Duration,
    /// Advancing the simulation and taking the snapshot.
    pub advance: Duration,
    /// Handing the snapshot to the recorder and the publisher.
    pub dispatch: Duration,
}

impl TickTimings {
    fn add(&mut self, collect: Duration, advance: Duration, dispatch: Duration) {
        self.ticks = self.ticks.saturating_add(1);
        self.collect = self.collect.saturating_add(collect);
        self.advance = self.advance.saturating_add(advance);
        self.dispatch = self.dispatch.saturating_add(dispatch);
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    /// Session identifier.
    pub session: SessionId,
    /// Terminal outcome.
    pub result: SessionResult,
    /// Ticks that ran to completion.
    pub ticks_completed: u64,
    /// Last completed tick.
    pub last_tick: Option<Tick>,
    /// Ticks that fired late.
    pub overruns: u64,
    /// Frames accepted by the recorder.
    pub frames_recorded: u64,
    /// Visualization delivery counters.
    pub publisher: PublisherStats,
    /// Per-phase timings, when profiling.
    pub timings: Option<TickTimings>,
    /// Wall time from start to termination.
    pub elapsed: Duration,
}

impl SessionReport {
    fn new(session: SessionId, profile: bool) -> Self {
        Self {
            session,
            result: SessionResult::CompletedNormally,
            ticks_completed: 0,
            last_tick: None,
            overruns: 0,
            frames_recorded: 0,
            publisher: PublisherStats::default(),
            timings: profile.then(TickTimings::default),
            elapsed: Duration::ZERO,
        }
    }
}

/// One training session.
pub struct Session {
    config: SessionConfig,
    deps: SessionDeps,
}

impl Session {
    /// Create a session. Nothing is opened until [`run`](Self::run).
    pub const fn new(config: SessionConfig, deps: SessionDeps) -> Self {
        Self { config, deps }
    }

    /// Run the session to completion.
    ///
    /// Never fails: every error ends the session with a [`SessionResult`]
    /// and every acquired resource is released before this returns.
    pub async fn run(self) -> SessionReport {
        let Self { config, deps } = self;
        let started = Instant::now();
        let session = deps.status.session();
        let mut report = SessionReport::new(session, config.profile);

        info!(
            session = %session,
            map = %config.map,
            tick_rate = config.tick_rate,
            agents = config.agents.len(),
            duration_secs = config.duration_secs,
            "Session initializing"
        );

        let result = match prepare(&config, &deps) {
            Err(result) => result,
            Ok(prepared) => {
                let mut run = SessionRun::new(&config, &deps, prepared, &mut report);
                let result = match run.open().await {
                    Ok(()) => run.tick_loop().await,
                    Err(result) => result,
                };
                run.drain(&result).await;
                result
            }
        };

        report.result = result.clone();
        report.elapsed = started.elapsed();
        deps.status.terminate(result).await;

        if report.result.is_success() {
            info!(
                result = %report.result,
                ticks = report.ticks_completed,
                overruns = report.overruns,
                frames_dropped = report.publisher.dropped,
                "Session terminated"
            );
        } else {
            warn!(
                result = %report.result,
                ticks = report.ticks_completed,
                "Session terminated"
            );
        }
        report
    }
}

/// State built before any external resource is touched.
struct Prepared {
    clock: TickClock,
    sim: Box<dyn Simulation>,
    tap: Arc<dyn CommTap>,
}

/// Validate the configuration, build the clock and the simulation, and
/// open the raw communication capture.
fn prepare(config: &SessionConfig, deps: &SessionDeps) -> Result<Prepared, SessionResult> {
    if let Err(e) = config.validate() {
        warn!(error = %e, "Configuration rejected");
        return Err(aborted(e.to_string()));
    }
    let clock = TickClock::new(config.tick_rate, config.max_duration())
        .map_err(|e| aborted(e.to_string()))?;
    let sim = deps
        .maps
        .load(&config.map, config.agents.len())
        .map_err(|e| {
            warn!(error = %e, "Map could not be loaded");
            aborted(format!("map: {e}"))
        })?;
    let tap = open_tap(config).map_err(|e| {
        warn!(error = %e, "Raw communication capture could not be opened");
        aborted(format!("raw communication capture: {e}"))
    })?;
    Ok(Prepared { clock, sim, tap })
}

fn open_tap(config: &SessionConfig) -> std::io::Result<Arc<dyn CommTap>> {
    if !config.dump_raw_comm {
        return Ok(Arc::new(NullTap));
    }
    let tap = match &config.dump_file {
        Some(path) => {
            info!(path = %path.display(), "Capturing raw agent communication");
            FileTap::create(path)?
        }
        None => FileTap::stderr(),
    };
    Ok(Arc::new(tap))
}

/// Resources of a session past preparation.
struct SessionRun<'a> {
    config: &'a SessionConfig,
    deps: &'a SessionDeps,
    report: &'a mut SessionReport,
    clock: TickClock,
    sim: Box<dyn Simulation>,
    tap: Arc<dyn CommTap>,
    recorder: Box<dyn Recorder>,
    manager: AgentConnectionManager,
    publisher: Option<Publisher>,
    transport_open: bool,
}

impl<'a> SessionRun<'a> {
    fn new(
        config: &'a SessionConfig,
        deps: &'a SessionDeps,
        prepared: Prepared,
        report: &'a mut SessionReport,
    ) -> Self {
        let Prepared { clock, sim, tap } = prepared;
        let manager = AgentConnectionManager::new(
            Arc::clone(&deps.connector),
            Arc::clone(&tap),
            ManagerSettings::from_config(config, deps.status.session()),
        );
        Self {
            config,
            deps,
            report,
            clock,
            sim,
            tap,
            recorder: Box::new(NullRecorder),
            manager,
            publisher: None,
            transport_open: false,
        }
    }

    /// Open the endpoint and the recorder, connect the agents, and start
    /// publishing.
    async fn open(&mut self) -> Result<(), SessionResult> {
        let listen_addr = self.config.listen_addr();
        self.deps
            .transport
            .open(&listen_addr)
            .await
            .map_err(|e| {
                warn!(error = %e, "Visualization endpoint could not be opened");
                aborted(e.to_string())
            })?;
        self.transport_open = true;
        info!(
            addr = %listen_addr,
            viewer = %self.config.viewer_url(),
            "Visualization endpoint open"
        );

        if let Some(path) = &self.config.record_file {
            let info = RecordingInfo {
                session: self.deps.status.session(),
                map: self.config.map.clone(),
                tick_rate: self.config.tick_rate,
            };
            let recorder = FileRecorder::open(path, &info, self.config.recorder_timeout())
                .map_err(|e| {
                    warn!(error = %e, "Recorder could not be opened");
                    aborted(format!("recorder: {e}"))
                })?;
            self.recorder = Box::new(recorder);
        }

        let summary = self.manager.connect_all(&self.config.agents).await;
        self.deps.status.set_agents(self.manager.views()).await;
        if !self.config.agents.is_empty() && summary.connected.is_empty() {
            warn!(configured = self.config.agents.len(), "No agent could be connected");
            return Err(self.agent_failure());
        }
        info!(
            connected = summary.connected.len(),
            failed = summary.failures.len(),
            "Agents connected"
        );

        self.publisher = Some(Publisher::start(
            Arc::clone(&self.deps.transport),
            self.config.publish_timeout(),
        ));
        Ok(())
    }

    /// Tick until a termination trigger holds.
    async fn tick_loop(&mut self) -> SessionResult {
        let status = Arc::clone(&self.deps.status);
        let abort = Arc::clone(&self.deps.abort);
        let input_timeout = self.config.input_timeout();
        let progress_every = u64::from(self.config.tick_rate).max(1);
        let quiet = self.config.quiet;

        status.set_phase(SessionPhase::Running).await;
        info!(
            interval_ms = self.clock.interval().as_millis(),
            input_timeout_ms = input_timeout.as_millis(),
            "Session running"
        );

        loop {
            let tick = tokio::select! {
                biased;
                () = abort.aborted() => {
                    info!("Abort requested while waiting for the next tick");
                    return aborted(EXTERNAL_ABORT.to_owned());
                }
                next = self.clock.next_tick() => match next {
                    Ok(tick) => tick,
                    Err(e) => return aborted(e.to_string()),
                },
            };

            // --- Collect ---
            let phase_start = Instant::now();
            let sim = &self.sim;
            let collected = self
                .manager
                .collect_inputs(tick, input_timeout, |agent| sim.observe(agent, tick))
                .await;
            let collect_time = phase_start.elapsed();

            // --- Advance ---
            let phase_start = Instant::now();
            let advanced = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.sim.advance(tick, &collected.inputs)
            }));
            let progress = match advanced {
                Ok(Ok(progress)) => progress,
                Ok(Err(e)) => {
                    warn!(tick = tick.value(), error = %e, "Simulation failed");
                    return aborted(format!("simulation: {e}"));
                }
                Err(_panic) => {
                    warn!(tick = tick.value(), "Simulation panicked");
                    return aborted(format!("simulation panicked at tick {tick}"));
                }
            };
            let snapshot = self.sim.snapshot(tick);
            let advance_time = phase_start.elapsed();

            // --- Dispatch ---
            let phase_start = Instant::now();
            if let Err(e) = self.recorder.record(&snapshot).await {
                warn!(tick = tick.value(), error = %e, "Recorder failed");
                return aborted(format!("recorder: {e}"));
            }
            if let Some(publisher) = self.publisher.as_mut() {
                publisher.publish(snapshot);
            }
            let dispatch_time = phase_start.elapsed();

            self.report.ticks_completed = self.report.ticks_completed.saturating_add(1);
            self.report.last_tick = Some(tick);
            self.report.overruns = self.clock.overruns();
            if let Some(timings) = self.report.timings.as_mut() {
                timings.add(collect_time, advance_time, dispatch_time);
            }
            status.record_tick(tick, self.manager.views()).await;

            debug!(
                tick = tick.value(),
                inputs = collected.inputs.len(),
                live = self.manager.live_count(),
                collect_us = collect_time.as_micros(),
                "Tick completed"
            );
            if !quiet && tick.value().checked_rem(progress_every) == Some(0) {
                info!(
                    tick = tick.value(),
                    live_agents = self.manager.live_count(),
                    overruns = self.clock.overruns(),
                    "Session progress"
                );
            }

            // --- Termination triggers, in precedence order ---
            if self.clock.deadline_reached() {
                info!(
                    tick = tick.value(),
                    elapsed_ms = self.clock.elapsed().as_millis(),
                    "Maximum duration reached"
                );
                return SessionResult::TimedOut;
            }
            if !self.config.agents.is_empty() && self.manager.live_count() == 0 {
                warn!(tick = tick.value(), "No agents remain connected");
                return self.agent_failure();
            }
            if abort.is_triggered() {
                info!(tick = tick.value(), "Abort requested");
                return aborted(EXTERNAL_ABORT.to_owned());
            }
            if let Progress::Concluded { summary } = progress {
                info!(tick = tick.value(), summary = %summary, "Game concluded");
                return SessionResult::CompletedNormally;
            }
        }
    }

    /// Release everything that was opened, bounded by the drain grace.
    async fn drain(&mut self, result: &SessionResult) {
        self.deps.status.set_phase(SessionPhase::Draining).await;
        let grace = self.config.drain_grace();
        debug!(result = %result, grace_ms = grace.as_millis(), "Draining session");

        match self.publisher.take() {
            Some(mut publisher) => {
                self.report.publisher = publisher.close(grace).await;
            }
            None if self.transport_open => {
                if tokio::time::timeout(grace, self.deps.transport.close()).await.is_err() {
                    warn!("Visualization endpoint did not close in time");
                }
            }
            None => {}
        }

        match tokio::time::timeout(grace, self.recorder.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Recorder did not close cleanly"),
            Err(_elapsed) => warn!(grace_ms = grace.as_millis(), "Recorder close timed out"),
        }
        self.report.frames_recorded = self.recorder.frames();

        self.manager.close(&result.to_string()).await;
        self.deps.status.set_agents(self.manager.views()).await;
        self.tap.finish().await;
    }

    fn agent_failure(&self) -> SessionResult {
        let (agent, reason) = self
            .manager
            .last_failure()
            .map_or((AgentIndex(0), "no agents connected".to_owned()), |(agent, reason)| {
                (agent, reason.to_owned())
            });
        SessionResult::AgentFailure { agent, reason }
    }
}

fn aborted(reason: String) -> SessionResult {
    SessionResult::Aborted { reason }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::publisher::NullTransport;

    fn deps(config: &SessionConfig) -> SessionDeps {
        let status = Arc::new(SessionStatus::new(SessionId::new(), &config.map, config.tick_rate));
        SessionDeps::new(status, Arc::new(NullTransport))
    }

    fn config(yaml: &str) -> SessionConfig {
        SessionConfig::parse(yaml).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn zero_tick_rate_aborts_before_running() {
        let config = config("host: 127.0.0.1\ntick_rate: 0\n");
        let deps = deps(&config);
        let status = Arc::clone(&deps.status);

        let report = Session::new(config, deps).run().await;
        assert!(matches!(
            report.result,
            SessionResult::Aborted { ref reason } if reason.contains("tick rate")
        ));
        assert_eq!(report.ticks_completed, 0);
        assert_eq!(status.phase().await, SessionPhase::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_host_aborts() {
        let config = config("tick_rate: 20\n");
        let deps = deps(&config);
        let report = Session::new(config, deps).run().await;
        assert!(matches!(
            report.result,
            SessionResult::Aborted { ref reason } if reason.contains("host")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn duration_bound_times_out() {
        let config = config("host: 127.0.0.1\ntick_rate: 10\nduration_secs: 1\nprofile: true\n");
        let deps = deps(&config);
        let report = Session::new(config, deps).run().await;
        assert_eq!(report.result, SessionResult::TimedOut);
        assert_eq!(report.ticks_completed, 10);
        assert_eq!(report.last_tick, Some(Tick(9)));
        assert_eq!(report.timings.unwrap().ticks, 10);
        assert_eq!(report.publisher.published, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_during_wait_ends_promptly() {
        let config = config("host: 127.0.0.1\ntick_rate: 1\n");
        let deps = deps(&config);
        let abort = Arc::clone(&deps.abort);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            abort.trigger("test");
        });
        let report = Session::new(config, deps).run().await;
        assert_eq!(
            report.result,
            SessionResult::Aborted {
                reason: EXTERNAL_ABORT.to_owned()
            }
        );
        assert_eq!(report.ticks_completed, 3);
        assert!(report.elapsed < Duration::from_secs(3));
    }

    #[test]
    fn timings_accumulate() {
        let mut timings = TickTimings::default();
        timings.add(Duration::from_millis(2), Duration::from_millis(1), Duration::ZERO);
        timings.add(Duration::from_millis(3), Duration::from_millis(1), Duration::ZERO);
        assert_eq!(timings.ticks, 2);
        assert_eq!(timings.collect, Duration::from_millis(5));
    }
}
