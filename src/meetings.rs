//! Meeting detection from host network state.
//!
//! `lsof -i 4UDP -r 5` emits a batch of active UDP connections every five
//! seconds, terminated by a `=======` sentinel line. Zoom meetings show up
//! as multiple connections to zoom.us; Google Meet as many Chrome
//! connections into 1e100.net. Rising and falling edges become
//! [`MeetingEvent`]s; Meet starts are enriched best-effort with the code
//! and title of the most recent meet.google.com visit in Chrome's history.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::OpenFlags;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// UDP connections to zoom.us at which Zoom counts as "in a meeting".
const ZOOM_THRESHOLD: usize = 2;
/// Chrome-to-1e100.net connections at which Meet counts as "in a meeting".
/// Baseline browsing sits around 6-7; an active Meet at 14+.
const MEET_THRESHOLD: usize = 10;

/// Batch terminator printed by `lsof -r`.
const BATCH_SENTINEL: &str = "=======";

/// The meeting platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingKind {
    Zoom,
    Meet,
}

impl std::fmt::Display for MeetingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeetingKind::Zoom => f.write_str("zoom"),
            MeetingKind::Meet => f.write_str("meet"),
        }
    }
}

/// Details of a meeting that just started.
#[derive(Debug, Clone, PartialEq)]
pub struct MeetingInfo {
    pub kind: MeetingKind,
    /// Meeting code, e.g. `abc-defg-hij` (Meet only, best effort).
    pub code: String,
    /// Meeting title from browser history (Meet only, best effort).
    pub title: String,
}

/// A rising or falling meeting edge.
#[derive(Debug, Clone, PartialEq)]
pub enum MeetingEvent {
    Started(MeetingInfo),
    Ended {
        kind: MeetingKind,
        duration: Duration,
    },
}

/// Watches UDP connection batches for meeting transitions.
pub struct MeetingDetector {
    events: mpsc::Sender<MeetingEvent>,
    zoom_in_meeting: bool,
    meet_in_meeting: bool,
    zoom_started: Option<Instant>,
    meet_started: Option<Instant>,
}

impl MeetingDetector {
    pub fn new(events: mpsc::Sender<MeetingEvent>) -> Self {
        Self {
            events,
            zoom_in_meeting: false,
            meet_in_meeting: false,
            zoom_started: None,
            meet_started: None,
        }
    }

    /// Poll until cancelled. The lsof child is killed on the way out.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut child = Command::new("lsof")
            .args(["-i", "4UDP", "-r", "5"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start lsof")?;

        let stdout = child.stdout.take().context("lsof stdout unavailable")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut batch: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Ok(());
                }
                line = lines.next_line() => {
                    match line.context("Failed reading lsof output")? {
                        Some(line) if line == BATCH_SENTINEL => {
                            for event in self.process_batch(&batch) {
                                let event = enrich_meet_start(event);
                                if self.events.send(event).await.is_err() {
                                    // Receiver gone: the session is over.
                                    let _ = child.kill().await;
                                    return Ok(());
                                }
                            }
                            batch.clear();
                        }
                        Some(line) => batch.push(line),
                        None => break,
                    }
                }
            }
        }

        let status = child.wait().await.context("Failed waiting for lsof")?;
        if !cancel.is_cancelled() && !status.success() {
            bail!("lsof exited: {status}");
        }
        Ok(())
    }

    /// Classify one batch of connection lines and return edge events.
    fn process_batch(&mut self, lines: &[String]) -> Vec<MeetingEvent> {
        let zoom_count = lines.iter().filter(|l| l.contains("zoom.us")).count();
        let meet_count = lines
            .iter()
            .filter(|l| l.contains("Google") && l.contains("1e100.net"))
            .count();

        let zoom_now = zoom_count >= ZOOM_THRESHOLD;
        let meet_now = meet_count >= MEET_THRESHOLD;

        let mut events = Vec::new();

        if zoom_now && !self.zoom_in_meeting {
            self.zoom_started = Some(Instant::now());
            events.push(MeetingEvent::Started(MeetingInfo {
                kind: MeetingKind::Zoom,
                code: String::new(),
                title: String::new(),
            }));
        } else if !zoom_now && self.zoom_in_meeting {
            events.push(MeetingEvent::Ended {
                kind: MeetingKind::Zoom,
                duration: self.zoom_started.take().map(|t| t.elapsed()).unwrap_or_default(),
            });
        }

        if meet_now && !self.meet_in_meeting {
            self.meet_started = Some(Instant::now());
            events.push(MeetingEvent::Started(MeetingInfo {
                kind: MeetingKind::Meet,
                code: String::new(),
                title: String::new(),
            }));
        } else if !meet_now && self.meet_in_meeting {
            events.push(MeetingEvent::Ended {
                kind: MeetingKind::Meet,
                duration: self.meet_started.take().map(|t| t.elapsed()).unwrap_or_default(),
            });
        }

        self.zoom_in_meeting = zoom_now;
        self.meet_in_meeting = meet_now;

        events
    }
}

/// Round a duration to the nearest whole minute, for the `(duration: Nm)`
/// suffix on meeting-end lines.
pub fn round_to_minutes(duration: Duration) -> u64 {
    (duration.as_secs_f64() / 60.0).round() as u64
}

/// Fill in code and title on a Meet start from Chrome's history.
fn enrich_meet_start(event: MeetingEvent) -> MeetingEvent {
    match event {
        MeetingEvent::Started(mut info) if info.kind == MeetingKind::Meet => {
            match meet_details_from_chrome() {
                Ok((code, title)) => {
                    info.code = code;
                    info.title = title;
                }
                Err(e) => debug!(error = %e, "could not read Meet details from Chrome"),
            }
            MeetingEvent::Started(info)
        }
        other => other,
    }
}

fn meet_details_from_chrome() -> Result<(String, String)> {
    let history = chrome_history_path().context("Chrome history not found")?;
    meet_details_from_history(&history)
}

/// Query a Chrome History database for the latest Meet visit. The database
/// is copied first since Chrome keeps the original locked.
fn meet_details_from_history(history: &std::path::Path) -> Result<(String, String)> {
    let copy = tempfile::NamedTempFile::new().context("Failed to create temp file")?;
    std::fs::copy(history, copy.path()).context("Failed to copy History db")?;

    let conn = rusqlite::Connection::open_with_flags(
        copy.path(),
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .context("Failed to open History db")?;

    let (url, page_title): (String, String) = conn
        .query_row(
            "SELECT url, title FROM urls \
             WHERE url LIKE '%meet.google.com/%-%-%' \
             ORDER BY last_visit_time DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .context("No Meet visit in history")?;

    Ok((extract_meet_code(&url), extract_meet_title(&page_title)))
}

fn chrome_history_path() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    [
        home.join("Library/Application Support/Google/Chrome/Default/History"),
        home.join(".config/google-chrome/Default/History"),
    ]
    .into_iter()
    .find(|p| p.exists())
}

static MEET_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"meet\.google\.com/([a-z]+-[a-z]+-[a-z]+)").unwrap());

fn extract_meet_code(url: &str) -> String {
    MEET_CODE_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn extract_meet_title(page_title: &str) -> String {
    page_title
        .strip_prefix("Meet - ")
        .unwrap_or(page_title)
        .to_string()
}

#[cfg(test)]
#[path = "meetings_test.rs"]
mod tests;
