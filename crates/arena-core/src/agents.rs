//! Agent Connection Manager.
//!
//! Owns one handle per configured agent in an arena indexed by
//! [`AgentIndex`]. The session loop never holds a handle: it asks the
//! manager to collect inputs for a tick and reads [`AgentView`]s by index.
//!
//! # Exchange
//!
//! Each tick every live agent receives a `perception` line and is expected
//! to answer with an `input` line for the same tick before the per-agent
//! timeout. All agents are served concurrently, so one slow agent costs
//! the tick at most one timeout, not one timeout per agent.
//!
//! Anything short of a matching reply is a miss: a timeout, a closed
//! stream, or an unreadable line. Replies for earlier ticks are stale and
//! discarded. After `miss_limit` consecutive misses the agent is marked
//! [`AgentConnectionState::Failed`] and never collected from again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arena_types::{
    AgentConnectionState, AgentIndex, AgentInput, AgentMessage, AgentView, CommDirection,
    ServerMessage, SessionId, Tick, TickInputs,
};
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connector::{BoxedStream, Connector};
use crate::diagnostics::CommTap;

/// Bound on the best-effort goodbye sent to each agent at close.
const GOODBYE_TIMEOUT: Duration = Duration::from_millis(100);

/// Longest line accepted from an agent, terminator included.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Lines that may wait for an agent that has stopped reading.
const MAX_QUEUED_LINES: usize = 16;

/// Errors raised while connecting to or talking with an agent.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The target could not be reached.
    #[error("failed to connect to {target}: {source}")]
    Connect {
        /// The agent target.
        target: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Connecting and handshaking took longer than the connect timeout.
    #[error("timed out connecting to {target} after {after_ms} ms")]
    Timeout {
        /// The agent target.
        target: String,
        /// The timeout that elapsed.
        after_ms: u64,
    },

    /// The agent did not complete the welcome/hello handshake.
    #[error("handshake with {target} failed: {reason}")]
    Handshake {
        /// The agent target.
        target: String,
        /// What went wrong.
        reason: String,
    },

    /// The agent is not (or no longer) live.
    #[error("agent {agent} is not connected")]
    NotLive {
        /// The agent addressed.
        agent: AgentIndex,
    },

    /// A best-effort send failed.
    #[error("failed to send to agent {agent}: {reason}")]
    Send {
        /// The agent addressed.
        agent: AgentIndex,
        /// What went wrong.
        reason: String,
    },
}

/// Session facts the manager needs to greet agents and judge misses.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Session the agents join.
    pub session: SessionId,
    /// Map announced in the welcome message.
    pub map: String,
    /// Ticks per second announced in the welcome message.
    pub tick_rate: u32,
    /// Bound on connect plus handshake, per agent.
    pub connect_timeout: Duration,
    /// Consecutive misses after which an agent is failed.
    pub miss_limit: u32,
}

impl ManagerSettings {
    /// Settings for a session described by `config`.
    pub fn from_config(config: &SessionConfig, session: SessionId) -> Self {
        Self {
            session,
            map: config.map.clone(),
            tick_rate: config.tick_rate,
            connect_timeout: config.connect_timeout(),
            miss_limit: config.miss_limit,
        }
    }
}

/// Outcome of [`AgentConnectionManager::connect_all`].
#[derive(Debug, Default)]
pub struct ConnectSummary {
    /// Agents that completed the handshake.
    pub connected: Vec<AgentIndex>,
    /// Agents that could not be connected, with the reason.
    pub failures: Vec<(AgentIndex, ConnectionError)>,
}

/// Outcome of one tick of input collection.
#[derive(Debug, Default)]
pub struct CollectedInputs {
    /// One entry per agent that was live when collection started.
    pub inputs: TickInputs,
    /// Agents that crossed the miss limit during this tick.
    pub newly_failed: Vec<AgentIndex>,
}

/// Read and write halves of one agent stream.
///
/// Both directions survive a cancelled call: a timed-out read keeps its
/// partial line in `pending`, and a timed-out write keeps its partly
/// written line at the front of `outbox`, finished before anything else
/// goes out. Lines are never interleaved on the wire.
struct AgentLink {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: WriteHalf<BoxedStream>,
    /// Bytes of a line not yet terminated.
    pending: Vec<u8>,
    /// Lines accepted for sending, oldest first.
    outbox: VecDeque<Vec<u8>>,
    /// Bytes of the front line already written.
    written: usize,
}

impl AgentLink {
    fn new(stream: BoxedStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            pending: Vec::new(),
            outbox: VecDeque::new(),
            written: 0,
        }
    }

    /// Queue `message` as one line and write everything queued.
    async fn send(
        &mut self,
        agent: AgentIndex,
        message: &ServerMessage,
        tap: &dyn CommTap,
    ) -> std::io::Result<()> {
        if self.outbox.len() >= MAX_QUEUED_LINES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "agent stopped reading",
            ));
        }
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.outbox.push_back(line);
        self.write_queued(agent, tap).await
    }

    /// Write queued lines in order. Each line is captured once its last
    /// byte has been written.
    async fn write_queued(
        &mut self,
        agent: AgentIndex,
        tap: &dyn CommTap,
    ) -> std::io::Result<()> {
        while let Some(front) = self.outbox.front() {
            let rest = front.get(self.written..).unwrap_or_default();
            if rest.is_empty() {
                if let Some(line) = self.outbox.pop_front() {
                    tap.capture(agent, CommDirection::Sent, &line);
                }
                self.written = 0;
                continue;
            }
            let n = self.writer.write(rest).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
            self.written = self.written.saturating_add(n);
        }
        self.writer.flush().await
    }

    /// Read the next non-blank line, or `None` at end of stream.
    ///
    /// The returned line has its terminator stripped; the tap sees the
    /// exact bytes, blank lines included. A line longer than
    /// [`MAX_LINE_BYTES`] is an `InvalidData` error.
    async fn recv_line(
        &mut self,
        agent: AgentIndex,
        tap: &dyn CommTap,
    ) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }
            let (take, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(at) => (at.saturating_add(1), true),
                None => (available.len(), false),
            };
            if self.pending.len().saturating_add(take) > MAX_LINE_BYTES {
                self.pending.clear();
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "line exceeds maximum length",
                ));
            }
            self.pending
                .extend_from_slice(available.get(..take).unwrap_or_default());
            self.reader.consume(take);
            if !complete {
                continue;
            }

            let mut line = std::mem::take(&mut self.pending);
            tap.capture(agent, CommDirection::Received, &line);
            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "Agent stream shutdown failed");
        }
    }
}

/// One arena slot: the public view plus the link while it is open.
struct AgentSlot {
    target: String,
    view: AgentView,
    link: Option<AgentLink>,
}

impl AgentSlot {
    fn is_live(&self) -> bool {
        self.view.state.is_live()
    }
}

/// Why a tick exchange produced no input.
#[derive(Debug)]
enum Miss {
    TimedOut,
    Closed,
    Io(std::io::Error),
    Unreadable(String),
}

impl std::fmt::Display for Miss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut => write!(f, "no input before timeout"),
            Self::Closed => write!(f, "connection closed"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Unreadable(reason) => write!(f, "unreadable reply: {reason}"),
        }
    }
}

impl Miss {
    /// Whether the link can no longer be used.
    const fn breaks_link(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_))
    }
}

/// Owns every agent connection for one session.
pub struct AgentConnectionManager {
    slots: Vec<AgentSlot>,
    connector: Arc<dyn Connector>,
    tap: Arc<dyn CommTap>,
    settings: ManagerSettings,
    last_failure: Option<(AgentIndex, String)>,
    closed: bool,
}

impl std::fmt::Debug for AgentConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnectionManager")
            .field("agents", &self.slots.len())
            .field("live", &self.live_count())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl AgentConnectionManager {
    /// Create a manager with no agents.
    pub fn new(
        connector: Arc<dyn Connector>,
        tap: Arc<dyn CommTap>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            slots: Vec::new(),
            connector,
            tap,
            settings,
            last_failure: None,
            closed: false,
        }
    }

    /// Connect to every target concurrently and run the handshake.
    ///
    /// Targets receive consecutive indices in the order given. A failed
    /// target keeps its slot in state `Failed`.
    pub async fn connect_all(&mut self, targets: &[String]) -> ConnectSummary {
        let first = self.slots.len();
        for (offset, target) in targets.iter().enumerate() {
            let index = agent_index(first.saturating_add(offset));
            self.slots.push(AgentSlot {
                target: target.clone(),
                view: AgentView {
                    index,
                    label: target.clone(),
                    state: AgentConnectionState::Pending,
                    last_seen: None,
                    consecutive_misses: 0,
                },
                link: None,
            });
        }

        let connector = Arc::clone(&self.connector);
        let tap = Arc::clone(&self.tap);
        let settings = &self.settings;
        let attempts = self
            .slots
            .iter()
            .skip(first)
            .map(|slot| {
                let index = slot.view.index;
                let target = slot.target.clone();
                let connector = Arc::clone(&connector);
                let tap = Arc::clone(&tap);
                async move {
                    let outcome = tokio::time::timeout(
                        settings.connect_timeout,
                        handshake(connector.as_ref(), &target, index, settings, tap.as_ref()),
                    )
                    .await
                    .unwrap_or_else(|_elapsed| {
                        Err(ConnectionError::Timeout {
                            target: target.clone(),
                            after_ms: millis(settings.connect_timeout),
                        })
                    });
                    (index, outcome)
                }
            })
            .collect::<Vec<_>>();
        let outcomes = join_all(attempts).await;

        let mut summary = ConnectSummary::default();
        for (index, outcome) in outcomes {
            let Some(slot) = self.slots.get_mut(index.as_usize()) else {
                continue;
            };
            match outcome {
                Ok((link, name)) => {
                    info!(agent = %index, target = %slot.target, name = %name, "Agent connected");
                    slot.view.label = format!("{} ({name})", slot.target);
                    slot.view.state = AgentConnectionState::Connected;
                    slot.link = Some(link);
                    summary.connected.push(index);
                }
                Err(e) => {
                    warn!(
                        agent = %index,
                        target = %slot.target,
                        error = %e,
                        "Agent connection failed"
                    );
                    slot.view.state = AgentConnectionState::Failed;
                    self.last_failure = Some((index, e.to_string()));
                    summary.failures.push((index, e));
                }
            }
        }
        summary
    }

    /// Request and collect one input per live agent for `tick`.
    ///
    /// `observe` provides the observation sent to each agent. Every agent
    /// live at the start appears in the result, as
    /// [`AgentInput::Missing`] when no matching reply arrived in time.
    pub async fn collect_inputs<F>(
        &mut self,
        tick: Tick,
        per_agent_timeout: Duration,
        observe: F,
    ) -> CollectedInputs
    where
        F: Fn(AgentIndex) -> serde_json::Value,
    {
        let deadline = Instant::now()
            .checked_add(per_agent_timeout)
            .unwrap_or_else(Instant::now);
        let tap = Arc::clone(&self.tap);

        let exchanges = self
            .slots
            .iter_mut()
            .filter(|slot| slot.is_live())
            .map(|slot| {
                let index = slot.view.index;
                let observation = observe(index);
                let tap = Arc::clone(&tap);
                async move {
                    let result = match slot.link.as_mut() {
                        Some(link) => {
                            exchange(link, index, tick, observation, deadline, tap.as_ref()).await
                        }
                        None => Err(Miss::Closed),
                    };
                    (slot, result)
                }
            })
            .collect::<Vec<_>>();
        let results = join_all(exchanges).await;

        let miss_limit = self.settings.miss_limit;
        let mut collected = CollectedInputs::default();
        let mut failures = Vec::new();
        for (slot, result) in results {
            let index = slot.view.index;
            match result {
                Ok(payload) => {
                    slot.view.consecutive_misses = 0;
                    slot.view.last_seen = Some(tick);
                    slot.view.state = AgentConnectionState::Acknowledging;
                    collected.inputs.insert(index, AgentInput::Received(payload));
                }
                Err(miss) => {
                    if miss.breaks_link() && slot.link.is_some() {
                        debug!(
                            agent = %index,
                            tick = tick.value(),
                            reason = %miss,
                            "Agent link lost"
                        );
                        slot.link = None;
                    }
                    slot.view.consecutive_misses = slot.view.consecutive_misses.saturating_add(1);
                    debug!(
                        agent = %index,
                        tick = tick.value(),
                        misses = slot.view.consecutive_misses,
                        reason = %miss,
                        "Agent missed tick"
                    );
                    collected.inputs.insert(index, AgentInput::Missing);

                    if slot.view.consecutive_misses >= miss_limit {
                        let reason = format!(
                            "missed {} consecutive ticks (last: {miss})",
                            slot.view.consecutive_misses
                        );
                        warn!(
                            agent = %index,
                            tick = tick.value(),
                            reason = %reason,
                            "Agent failed"
                        );
                        slot.view.state = AgentConnectionState::Failed;
                        slot.link = None;
                        failures.push((index, reason));
                        collected.newly_failed.push(index);
                    }
                }
            }
        }
        if let Some(last) = failures.pop() {
            self.last_failure = Some(last);
        }

        let missing = collected.inputs.values().filter(|i| i.is_missing()).count();
        if missing > 0 {
            warn!(
                tick = tick.value(),
                responded = collected.inputs.len().saturating_sub(missing),
                missing,
                "Some agents did not respond in time"
            );
        }
        collected
    }

    /// Push an out-of-band payload to one agent.
    ///
    /// Best effort: a failure marks the agent `Failed`.
    pub async fn send(
        &mut self,
        agent: AgentIndex,
        payload: serde_json::Value,
    ) -> Result<(), ConnectionError> {
        let timeout = self.settings.connect_timeout;
        let tap = Arc::clone(&self.tap);
        let slot = self
            .slots
            .get_mut(agent.as_usize())
            .filter(|slot| slot.is_live())
            .ok_or(ConnectionError::NotLive { agent })?;
        let Some(link) = slot.link.as_mut() else {
            return Err(ConnectionError::NotLive { agent });
        };

        let message = ServerMessage::Notice { payload };
        let reason = match tokio::time::timeout(timeout, link.send(agent, &message, tap.as_ref()))
            .await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_elapsed) => format!("send timed out after {} ms", millis(timeout)),
        };

        warn!(agent = %agent, reason = %reason, "Agent send failed, marking failed");
        slot.view.state = AgentConnectionState::Failed;
        slot.link = None;
        self.last_failure = Some((agent, reason.clone()));
        Err(ConnectionError::Send { agent, reason })
    }

    /// Say goodbye to every live agent and close all links.
    ///
    /// Live agents become `Disconnected`. Calling this again does nothing.
    pub async fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;

        let tap = Arc::clone(&self.tap);
        let goodbye = ServerMessage::Goodbye {
            reason: reason.to_owned(),
        };
        let farewells = self
            .slots
            .iter_mut()
            .filter_map(|slot| {
                let index = slot.view.index;
                let live = slot.is_live();
                let mut link = slot.link.take()?;
                let tap = Arc::clone(&tap);
                let goodbye = &goodbye;
                Some(async move {
                    if live {
                        let sent = tokio::time::timeout(
                            GOODBYE_TIMEOUT,
                            link.send(index, goodbye, tap.as_ref()),
                        )
                        .await;
                        if !matches!(sent, Ok(Ok(()))) {
                            debug!(agent = %index, "Goodbye not delivered");
                        }
                    }
                    let _ = tokio::time::timeout(GOODBYE_TIMEOUT, link.shutdown()).await;
                })
            })
            .collect::<Vec<_>>();
        join_all(farewells).await;

        let mut disconnected = 0_usize;
        for slot in &mut self.slots {
            if slot.is_live() {
                slot.view.state = AgentConnectionState::Disconnected;
                disconnected = disconnected.saturating_add(1);
            }
        }
        info!(disconnected, reason, "Agent connections closed");
    }

    /// Number of agents still taking part in input collection.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_live()).count()
    }

    /// Number of agent slots, live or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no agents were ever added.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Read-only view of one agent.
    pub fn view(&self, agent: AgentIndex) -> Option<&AgentView> {
        self.slots.get(agent.as_usize()).map(|slot| &slot.view)
    }

    /// Views of every agent, in index order.
    pub fn views(&self) -> Vec<AgentView> {
        self.slots.iter().map(|slot| slot.view.clone()).collect()
    }

    /// The most recent agent failure and its reason.
    pub fn last_failure(&self) -> Option<(AgentIndex, &str)> {
        self.last_failure
            .as_ref()
            .map(|(agent, reason)| (*agent, reason.as_str()))
    }
}

impl Drop for AgentConnectionManager {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // No goodbye without a runtime to send it on; dropping the links
        // closes the streams.
        for slot in &mut self.slots {
            slot.link = None;
            if slot.is_live() {
                slot.view.state = AgentConnectionState::Disconnected;
            }
        }
        debug!("Agent connection manager dropped without close");
    }
}

/// Connect to `target` and exchange welcome/hello.
async fn handshake(
    connector: &dyn Connector,
    target: &str,
    index: AgentIndex,
    settings: &ManagerSettings,
    tap: &dyn CommTap,
) -> Result<(AgentLink, String), ConnectionError> {
    let handshake_err = |reason: String| ConnectionError::Handshake {
        target: target.to_owned(),
        reason,
    };

    let stream = connector
        .connect(target)
        .await
        .map_err(|source| ConnectionError::Connect {
            target: target.to_owned(),
            source,
        })?;
    let mut link = AgentLink::new(stream);

    let welcome = ServerMessage::Welcome {
        agent: index,
        session: settings.session,
        tick_rate: settings.tick_rate,
        map: settings.map.clone(),
    };
    link.send(index, &welcome, tap)
        .await
        .map_err(|e| handshake_err(format!("failed to send welcome: {e}")))?;

    let line = link
        .recv_line(index, tap)
        .await
        .map_err(|e| handshake_err(format!("failed to read hello: {e}")))?
        .ok_or_else(|| handshake_err("connection closed before hello".to_owned()))?;

    match serde_json::from_slice::<AgentMessage>(&line) {
        Ok(AgentMessage::Hello { name }) => Ok((link, name)),
        Ok(AgentMessage::Input { tick, .. }) => Err(handshake_err(format!(
            "expected hello, got input for tick {tick}"
        ))),
        Err(e) => Err(handshake_err(format!("unreadable hello: {e}"))),
    }
}

/// Send the perception for `tick` and wait for the matching input.
async fn exchange(
    link: &mut AgentLink,
    agent: AgentIndex,
    tick: Tick,
    observation: serde_json::Value,
    deadline: Instant,
    tap: &dyn CommTap,
) -> Result<serde_json::Value, Miss> {
    let perception = ServerMessage::Perception { tick, observation };
    match tokio::time::timeout_at(deadline, link.send(agent, &perception, tap)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(Miss::Io(e)),
        Err(_elapsed) => return Err(Miss::TimedOut),
    }

    loop {
        let line = match tokio::time::timeout_at(deadline, link.recv_line(agent, tap)).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return Err(Miss::Closed),
            Ok(Err(e)) => return Err(Miss::Io(e)),
            Err(_elapsed) => return Err(Miss::TimedOut),
        };

        match serde_json::from_slice::<AgentMessage>(&line) {
            Ok(AgentMessage::Input { tick: got, payload }) if got == tick => return Ok(payload),
            Ok(AgentMessage::Input { tick: got, .. }) if got < tick => {
                debug!(
                    agent = %agent,
                    tick = tick.value(),
                    stale = got.value(),
                    "Discarding stale input"
                );
            }
            Ok(AgentMessage::Input { tick: got, .. }) => {
                return Err(Miss::Unreadable(format!("input for future tick {got}")));
            }
            Ok(AgentMessage::Hello { .. }) => {
                debug!(agent = %agent, "Ignoring repeated hello");
            }
            Err(e) => return Err(Miss::Unreadable(e.to_string())),
        }
    }
}

fn agent_index(position: usize) -> AgentIndex {
    AgentIndex(u32::try_from(position).unwrap_or(u32::MAX))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use futures::FutureExt as _;
    use futures::future::BoxFuture;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream};

    use super::*;
    use crate::diagnostics::NullTap;

    /// Hands out pre-made duplex streams by target name.
    struct DuplexConnector {
        streams: Mutex<HashMap<String, DuplexStream>>,
    }

    impl Connector for DuplexConnector {
        fn connect<'a>(
            &'a self,
            target: &'a str,
        ) -> BoxFuture<'a, std::io::Result<BoxedStream>> {
            let stream = self.streams.lock().unwrap().remove(target);
            async move {
                stream.map(|s| Box::new(s) as BoxedStream).ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no such agent")
                })
            }
            .boxed()
        }
    }

    /// How a scripted agent behaves.
    #[derive(Clone, Copy)]
    enum Script {
        /// Answer every perception.
        Echo,
        /// Answer perceptions up to and including this tick, then hang up.
        HangUpAfter(u64),
        /// Complete the handshake, then never answer.
        Silent,
        /// Never say hello.
        NoHello,
        /// Answer every perception with a stale input first.
        StaleFirst,
    }

    async fn run_agent(stream: DuplexStream, script: Script) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();

        let Ok(Some(_welcome)) = lines.next_line().await else {
            return;
        };
        if matches!(script, Script::NoHello) {
            let _ = lines.next_line().await;
            return;
        }
        write.write_all(b"{\"type\":\"hello\",\"name\":\"bot\"}\n").await.unwrap();

        while let Ok(Some(line)) = lines.next_line().await {
            let msg: ServerMessage = serde_json::from_str(&line).unwrap();
            let ServerMessage::Perception { tick, .. } = msg else {
                continue;
            };
            match script {
                Script::Silent | Script::NoHello => {}
                Script::HangUpAfter(last) if tick.value() > last => return,
                Script::StaleFirst if tick.value() > 0 => {
                    let stale = format!(
                        "{{\"type\":\"input\",\"tick\":{},\"payload\":\"old\"}}\n",
                        tick.value().saturating_sub(1)
                    );
                    write.write_all(stale.as_bytes()).await.unwrap();
                    let fresh = format!(
                        "{{\"type\":\"input\",\"tick\":{},\"payload\":\"new\"}}\n",
                        tick.value()
                    );
                    write.write_all(fresh.as_bytes()).await.unwrap();
                }
                _ => {
                    let reply = format!(
                        "{{\"type\":\"input\",\"tick\":{},\"payload\":{{\"seen\":{}}}}}\n",
                        tick.value(),
                        tick.value()
                    );
                    if write.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            session: SessionId::new(),
            map: "hexagon".to_owned(),
            tick_rate: 10,
            connect_timeout: Duration::from_millis(500),
            miss_limit: 3,
        }
    }

    fn manager_with(scripts: &[(&str, Script)]) -> (AgentConnectionManager, Vec<String>) {
        let mut streams = HashMap::new();
        let mut targets = Vec::new();
        for (name, script) in scripts {
            let (ours, theirs) = tokio::io::duplex(4096);
            tokio::spawn(run_agent(theirs, *script));
            streams.insert((*name).to_owned(), ours);
            targets.push((*name).to_owned());
        }
        let connector = Arc::new(DuplexConnector {
            streams: Mutex::new(streams),
        });
        (
            AgentConnectionManager::new(connector, Arc::new(NullTap), settings()),
            targets,
        )
    }

    const TIMEOUT: Duration = Duration::from_millis(50);

    /// Keeps every captured line in order.
    #[derive(Default)]
    struct RecordingTap {
        lines: Mutex<Vec<(CommDirection, Vec<u8>)>>,
    }

    impl RecordingTap {
        fn lines(&self, direction: CommDirection) -> Vec<Vec<u8>> {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .filter(|(d, _)| *d == direction)
                .map(|(_, bytes)| bytes.clone())
                .collect()
        }
    }

    impl CommTap for RecordingTap {
        fn capture(&self, _agent: AgentIndex, direction: CommDirection, bytes: &[u8]) {
            self.lines.lock().unwrap().push((direction, bytes.to_vec()));
        }

        fn finish(&self) -> BoxFuture<'_, ()> {
            futures::future::ready(()).boxed()
        }
    }

    /// A manager with one agent, "a", on the far end of `stream`.
    fn manager_over(
        stream: DuplexStream,
        tap: Arc<dyn CommTap>,
    ) -> (AgentConnectionManager, Vec<String>) {
        let connector = Arc::new(DuplexConnector {
            streams: Mutex::new(HashMap::from([("a".to_owned(), stream)])),
        });
        (
            AgentConnectionManager::new(connector, tap, settings()),
            vec!["a".to_owned()],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_collects_inputs() {
        let (mut manager, targets) = manager_with(&[("a", Script::Echo), ("b", Script::Echo)]);
        let summary = manager.connect_all(&targets).await;
        assert_eq!(summary.connected.len(), 2);
        assert!(summary.failures.is_empty());
        assert_eq!(manager.live_count(), 2);

        let collected = manager
            .collect_inputs(Tick(0), TIMEOUT, |agent| json!({"you": agent}))
            .await;
        assert_eq!(collected.inputs.len(), 2);
        assert_eq!(
            collected.inputs[&AgentIndex(1)],
            AgentInput::Received(json!({"seen": 0}))
        );

        let view = manager.view(AgentIndex(0)).unwrap();
        assert_eq!(view.state, AgentConnectionState::Acknowledging);
        assert_eq!(view.last_seen, Some(Tick(0)));
        assert!(view.label.contains("bot"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_and_silent_handshakes_fail() {
        let (mut manager, mut targets) =
            manager_with(&[("ok", Script::Echo), ("mute", Script::NoHello)]);
        targets.push("missing".to_owned());

        let summary = manager.connect_all(&targets).await;
        assert_eq!(summary.connected, vec![AgentIndex(0)]);
        assert_eq!(summary.failures.len(), 2);
        assert!(summary
            .failures
            .iter()
            .any(|(i, e)| *i == AgentIndex(1) && matches!(e, ConnectionError::Timeout { .. })));
        assert!(summary
            .failures
            .iter()
            .any(|(i, e)| *i == AgentIndex(2) && matches!(e, ConnectionError::Connect { .. })));
        assert_eq!(
            manager.view(AgentIndex(2)).unwrap().state,
            AgentConnectionState::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn three_consecutive_misses_fail_the_agent() {
        let (mut manager, targets) =
            manager_with(&[("quiet", Script::Silent), ("ok", Script::Echo)]);
        manager.connect_all(&targets).await;

        for n in 0..2 {
            let collected = manager.collect_inputs(Tick(n), TIMEOUT, |_| json!({})).await;
            assert_eq!(collected.inputs[&AgentIndex(0)], AgentInput::Missing);
            assert!(collected.newly_failed.is_empty());
        }
        let collected = manager.collect_inputs(Tick(2), TIMEOUT, |_| json!({})).await;
        assert_eq!(collected.newly_failed, vec![AgentIndex(0)]);
        assert_eq!(
            manager.view(AgentIndex(0)).unwrap().state,
            AgentConnectionState::Failed
        );

        // Failed agents are excluded from later ticks.
        let collected = manager.collect_inputs(Tick(3), TIMEOUT, |_| json!({})).await;
        assert_eq!(collected.inputs.len(), 1);
        assert!(collected.inputs.contains_key(&AgentIndex(1)));
        assert_eq!(manager.last_failure().unwrap().0, AgentIndex(0));
    }

    #[tokio::test(start_paused = true)]
    async fn answering_resets_the_miss_count() {
        let (mut manager, targets) = manager_with(&[("a", Script::Echo)]);
        manager.connect_all(&targets).await;
        manager.slots[0].view.consecutive_misses = 2;

        manager.collect_inputs(Tick(0), TIMEOUT, |_| json!({})).await;
        assert_eq!(manager.view(AgentIndex(0)).unwrap().consecutive_misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hang_up_counts_as_misses_until_failed() {
        let (mut manager, targets) = manager_with(&[("a", Script::HangUpAfter(1))]);
        manager.connect_all(&targets).await;

        let mut failed_at = None;
        for n in 0..10 {
            let collected = manager.collect_inputs(Tick(n), TIMEOUT, |_| json!({})).await;
            if !collected.newly_failed.is_empty() {
                failed_at = Some(n);
                break;
            }
        }
        assert_eq!(failed_at, Some(4));
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_replies_are_discarded() {
        let (mut manager, targets) = manager_with(&[("a", Script::StaleFirst)]);
        manager.connect_all(&targets).await;

        manager.collect_inputs(Tick(0), TIMEOUT, |_| json!({})).await;
        let collected = manager.collect_inputs(Tick(1), TIMEOUT, |_| json!({})).await;
        assert_eq!(
            collected.inputs[&AgentIndex(0)],
            AgentInput::Received(json!("new"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_disconnects() {
        let (mut manager, targets) = manager_with(&[("a", Script::Echo), ("b", Script::Silent)]);
        manager.connect_all(&targets).await;

        manager.close("session over").await;
        manager.close("again").await;
        assert!(manager
            .views()
            .iter()
            .all(|v| v.state == AgentConnectionState::Disconnected));
        assert_eq!(manager.live_count(), 0);

        let err = manager.send(AgentIndex(0), json!({})).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotLive { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_live_agent_succeeds() {
        let (mut manager, targets) = manager_with(&[("a", Script::Echo)]);
        manager.connect_all(&targets).await;
        manager.send(AgentIndex(0), json!({"hint": 1})).await.unwrap();
        assert!(manager.send(AgentIndex(7), json!({})).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reader_receives_whole_lines() {
        let (ours, theirs) = tokio::io::duplex(64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let agent_seen = Arc::clone(&seen);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(theirs);
            let mut lines = BufReader::new(read).lines();
            let _welcome = lines.next_line().await;
            write
                .write_all(b"{\"type\":\"hello\",\"name\":\"slow\"}\n")
                .await
                .unwrap();
            // Stop reading for longer than one tick's timeout.
            tokio::time::sleep(Duration::from_millis(80)).await;
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(ServerMessage::Perception { tick, .. }) =
                    serde_json::from_str::<ServerMessage>(&line)
                else {
                    agent_seen.lock().unwrap().push(None);
                    return;
                };
                agent_seen.lock().unwrap().push(Some(tick.value()));
                let reply = format!(
                    "{{\"type\":\"input\",\"tick\":{},\"payload\":{}}}\n",
                    tick.value(),
                    tick.value()
                );
                if write.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        });
        let tap = Arc::new(RecordingTap::default());
        let (mut manager, targets) = manager_over(ours, Arc::clone(&tap) as Arc<dyn CommTap>);
        manager.connect_all(&targets).await;
        let pad = "x".repeat(100);

        let first = manager
            .collect_inputs(Tick(0), TIMEOUT, |_| json!({"pad": pad.as_str()}))
            .await;
        assert_eq!(first.inputs[&AgentIndex(0)], AgentInput::Missing);
        // The half-written perception is not captured yet.
        assert_eq!(tap.lines(CommDirection::Sent).len(), 1);

        let second = manager
            .collect_inputs(Tick(1), TIMEOUT, |_| json!({"pad": pad.as_str()}))
            .await;
        assert_eq!(second.inputs[&AgentIndex(0)], AgentInput::Received(json!(1)));
        assert_eq!(*seen.lock().unwrap(), vec![Some(0), Some(1)]);

        let sent = tap.lines(CommDirection::Sent);
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|line| {
            line.ends_with(b"\n") && serde_json::from_slice::<ServerMessage>(line).is_ok()
        }));
        assert_eq!(manager.view(AgentIndex(0)).unwrap().consecutive_misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_line_breaks_the_link() {
        let (ours, theirs) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(theirs);
            let mut lines = BufReader::new(read).lines();
            let _welcome = lines.next_line().await;
            write
                .write_all(b"{\"type\":\"hello\",\"name\":\"flood\"}\n")
                .await
                .unwrap();
            let flood = vec![b'x'; MAX_LINE_BYTES.saturating_mul(3)];
            let _ = write.write_all(&flood).await;
        });
        let (mut manager, targets) = manager_over(ours, Arc::new(NullTap));
        manager.connect_all(&targets).await;

        let collected = manager.collect_inputs(Tick(0), TIMEOUT, |_| json!({})).await;
        assert_eq!(collected.inputs[&AgentIndex(0)], AgentInput::Missing);
        assert!(manager.slots[0].link.is_none());
        assert_eq!(manager.view(AgentIndex(0)).unwrap().consecutive_misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_keeps_exact_bytes() {
        let (ours, theirs) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(theirs);
            let mut lines = BufReader::new(read).lines();
            let _welcome = lines.next_line().await;
            write
                .write_all(b"\r\n{\"type\":\"hello\",\"name\":\"crlf\"}\r\n")
                .await
                .unwrap();
            let _ = lines.next_line().await;
        });
        let tap = Arc::new(RecordingTap::default());
        let (mut manager, targets) = manager_over(ours, Arc::clone(&tap) as Arc<dyn CommTap>);

        let summary = manager.connect_all(&targets).await;
        assert_eq!(summary.connected, vec![AgentIndex(0)]);
        assert_eq!(
            tap.lines(CommDirection::Received),
            vec![
                b"\r\n".to_vec(),
                b"{\"type\":\"hello\",\"name\":\"crlf\"}\r\n".to_vec(),
            ]
        );
        let sent = tap.lines(CommDirection::Sent);
        assert!(sent[0].starts_with(b"{\"type\":\"welcome\""));
        assert!(sent[0].ends_with(b"}\n"));
    }
}
