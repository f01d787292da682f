//! One trainer session, from the agent's side.
//!
//! The trainer greets with `welcome`; the agent answers `hello`, then
//! replies to every `perception` with an `input` for the same tick until
//! the trainer says `goodbye` or hangs up. The agent never skips a tick:
//! whatever the observation, some input is always sent.

use arena_types::{AgentIndex, AgentMessage, ServerMessage, SessionId, Tick};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader};
use tracing::{debug, info};

use crate::config::BotConfig;
use crate::error::BotError;

/// Moves the reference agent picks from.
const ACTIONS: [&str; 5] = ["north", "south", "east", "west", "hold"];

/// What happened during one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Session the trainer announced.
    pub session: Option<SessionId>,
    /// Index the trainer assigned.
    pub agent: Option<AgentIndex>,
    /// Inputs sent.
    pub inputs_sent: u64,
    /// Last tick answered.
    pub last_tick: Option<Tick>,
    /// Reason given in the trainer's goodbye, if it sent one.
    pub goodbye: Option<String>,
}

/// Pick an input for a perception.
fn choose_input(tick: Tick, observation: &serde_json::Value) -> serde_json::Value {
    let pick = rand::random_range(0..ACTIONS.len());
    let action = ACTIONS.get(pick).copied().unwrap_or("hold");
    serde_json::json!({
        "action": action,
        "seen": observation.is_object(),
        "tick": tick,
    })
}

async fn send<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &AgentMessage,
) -> Result<(), BotError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Play one session over `stream`.
///
/// Returns when the trainer says goodbye or closes the connection.
pub async fn play<S>(stream: S, config: &BotConfig) -> Result<SessionSummary, BotError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let mut summary = SessionSummary::default();

    let first = lines
        .next_line()
        .await?
        .ok_or_else(|| BotError::Protocol("connection closed before welcome".to_owned()))?;
    let ServerMessage::Welcome {
        agent,
        session,
        tick_rate,
        map,
    } = serde_json::from_str::<ServerMessage>(&first)?
    else {
        return Err(BotError::Protocol(format!("expected welcome, got {first}")));
    };
    info!(%session, %agent, tick_rate, %map, "Joined session");
    summary.session = Some(session);
    summary.agent = Some(agent);

    send(
        &mut writer,
        &AgentMessage::Hello {
            name: config.name.clone(),
        },
    )
    .await?;

    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<ServerMessage>(&line)? {
            ServerMessage::Perception { tick, observation } => {
                if !config.delay.is_zero() {
                    tokio::time::sleep(config.delay).await;
                }
                let payload = choose_input(tick, &observation);
                send(&mut writer, &AgentMessage::Input { tick, payload }).await?;
                summary.inputs_sent = summary.inputs_sent.saturating_add(1);
                summary.last_tick = Some(tick);
            }
            ServerMessage::Notice { payload } => {
                debug!(%payload, "Notice");
            }
            ServerMessage::Goodbye { reason } => {
                info!(%reason, inputs = summary.inputs_sent, "Trainer said goodbye");
                summary.goodbye = Some(reason);
                return Ok(summary);
            }
            ServerMessage::Welcome { .. } => {
                return Err(BotError::Protocol("second welcome on one connection".to_owned()));
            }
        }
    }

    info!(inputs = summary.inputs_sent, "Trainer hung up");
    Ok(summary)
}
