//! HTTP handlers for the status page, session status and latest snapshot.

use std::fmt::Write as _;
use std::sync::Arc;

use arena_core::status::StatusView;
use axum::Json;
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};

use crate::error::ObserverError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET / -- status page
// ---------------------------------------------------------------------------

/// Minimal HTML page with the session summary and the viewer link.
pub async fn index(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let view = state.status.view().await;
    let tick = view
        .tick
        .map_or_else(|| String::from("-"), |tick| tick.to_string());
    let phase = format!("{:?}", view.phase);
    let map = escape_html(&view.map);
    let viewer = escape_html(&state.viewer_url);
    let live = view.agents.iter().filter(|agent| agent.state.is_live()).count();
    let total = view.agents.len();
    let viewers = state.viewer_count();
    let result = view.result.as_ref().map_or_else(String::new, |result| {
        format!(
            "<p>Result: <span class=\"status\">{}</span></p>",
            escape_html(&result.to_string())
        )
    });

    let mut agents = String::new();
    for agent in &view.agents {
        let _ = writeln!(
            agents,
            "        <li>{} {} -- {:?} (misses: {})</li>",
            agent.index,
            escape_html(&agent.label),
            agent.state,
            agent.consecutive_misses,
        );
    }

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Arena Trainer</title>
    <style>
        body {{
            background: #0d1117;
            color: #c9d1d9;
            font-family: 'Cascadia Code', 'Fira Code', 'Consolas', monospace;
            padding: 2rem;
            max-width: 800px;
            margin: 0 auto;
        }}
        h1 {{ color: #58a6ff; margin-bottom: 0.25rem; }}
        .subtitle {{ color: #8b949e; margin-top: 0; }}
        .metric {{
            display: inline-block;
            background: #161b22;
            border: 1px solid #30363d;
            border-radius: 6px;
            padding: 1rem 1.5rem;
            margin: 0.5rem 0.5rem 0.5rem 0;
            min-width: 120px;
        }}
        .metric .label {{ color: #8b949e; font-size: 0.85rem; }}
        .metric .value {{ color: #58a6ff; font-size: 1.5rem; font-weight: bold; }}
        a {{ color: #58a6ff; text-decoration: none; }}
        ul {{ list-style: none; padding: 0; }}
        li {{ padding: 0.3rem 0; }}
        .status {{ color: #3fb950; font-weight: bold; }}
    </style>
</head>
<body>
    <h1>Arena Trainer</h1>
    <p class="subtitle">Session {session} on map {map}</p>

    <p>Phase: <span class="status">{phase}</span></p>
    {result}

    <div>
        <div class="metric">
            <div class="label">Tick</div>
            <div class="value">{tick}</div>
        </div>
        <div class="metric">
            <div class="label">Tick rate</div>
            <div class="value">{tick_rate}</div>
        </div>
        <div class="metric">
            <div class="label">Agents live</div>
            <div class="value">{live}/{total}</div>
        </div>
        <div class="metric">
            <div class="label">Viewers</div>
            <div class="value">{viewers}</div>
        </div>
    </div>

    <h2>Agents</h2>
    <ul>
{agents}    </ul>

    <p>Viewer: <a href="{viewer}">{viewer}</a> (frames on <code>/ws/frames</code>)</p>
</body>
</html>"#,
        session = view.session,
        tick_rate = view.tick_rate,
    ))
}

// ---------------------------------------------------------------------------
// GET /api/status
// ---------------------------------------------------------------------------

/// Current session phase, tick, agents and result.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusView> {
    Json(state.status.view().await)
}

// ---------------------------------------------------------------------------
// GET /api/snapshot
// ---------------------------------------------------------------------------

/// The most recently published snapshot.
pub async fn snapshot(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ObserverError> {
    let frame = state
        .latest_frame()
        .await
        .ok_or_else(|| ObserverError::NotFound("no snapshot published yet".to_owned()))?;

    Ok(([(header::CONTENT_TYPE, "application/json")], frame.to_string()))
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(
            escape_html("<a href=\"x\">&</a>"),
            "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;"
        );
        assert_eq!(escape_html("hexagon"), "hexagon");
    }
}
