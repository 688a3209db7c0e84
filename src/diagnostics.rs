//! Session state tracking and diagnostic dumps.
//!
//! The tracker accumulates counters and last-event times from every
//! component, detects the dead-air condition (audio flowing, VAD stepping,
//! no words coming back), and renders a human-readable report on demand.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

const AUDIO_BASELINE_ALPHA: f64 = 0.2;
const AUDIO_ACTIVE_FACTOR: f64 = 1.8;
const AUDIO_MIN_ACTIVE_RMS: f64 = 0.02;
const AUDIO_BASELINE_MIN: f64 = 0.01;
const AUDIO_ACTIVE_MIN_STREAK: u32 = 5;

/// Steps older than this mean the server stopped acknowledging audio, which
/// is a transport problem rather than dead air.
const STEP_FLOW_WINDOW: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    connected: bool,
    server_url: String,
    last_connect_at: Option<Instant>,

    last_server_err: Option<String>,
    last_recv_at: Option<Instant>,
    last_word_at: Option<Instant>,
    last_output_at: Option<Instant>,
    last_step_at: Option<Instant>,
    last_word: String,

    last_audio_active_at: Option<Instant>,
    last_audio_level: f64,
    audio_baseline: f64,
    audio_baseline_count: u64,
    audio_active_streak: u32,

    last_recv_err: Option<String>,
    last_recv_err_at: Option<Instant>,
    last_send_err: Option<String>,
    last_send_err_at: Option<Instant>,

    paused: bool,
    reconnecting: bool,
}

/// Thread-safe diagnostic state for one recording session.
pub struct Tracker {
    started_at: Instant,

    word_msgs: AtomicU64,
    step_msgs: AtomicU64,
    end_word_msgs: AtomicU64,
    ready_msgs: AtomicU64,
    error_msgs: AtomicU64,
    marker_msgs: AtomicU64,
    unknown_msgs: AtomicU64,
    empty_words: AtomicU64,
    chunks_sent: AtomicU64,
    chunks_dropped: AtomicU64,

    state: RwLock<State>,
    unknown_types: Mutex<HashMap<String, u64>>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            word_msgs: AtomicU64::new(0),
            step_msgs: AtomicU64::new(0),
            end_word_msgs: AtomicU64::new(0),
            ready_msgs: AtomicU64::new(0),
            error_msgs: AtomicU64::new(0),
            marker_msgs: AtomicU64::new(0),
            unknown_msgs: AtomicU64::new(0),
            empty_words: AtomicU64::new(0),
            chunks_sent: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
            state: RwLock::new(State::default()),
            unknown_types: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_connected(&self, connected: bool, server_url: &str) {
        let mut s = self.state.write().expect("tracker lock poisoned");
        s.connected = connected;
        s.server_url = server_url.to_string();
        if connected {
            s.last_connect_at = Some(Instant::now());
        }
    }

    pub fn record_word(&self, word: &str, output_produced: bool) {
        self.word_msgs.fetch_add(1, Ordering::Relaxed);
        if word.is_empty() {
            self.empty_words.fetch_add(1, Ordering::Relaxed);
        }

        let mut s = self.state.write().expect("tracker lock poisoned");
        let now = Instant::now();
        s.last_recv_at = Some(now);
        s.last_word = word.to_string();
        if output_produced {
            s.last_word_at = Some(now);
            s.last_output_at = Some(now);
            update_audio_baseline(&mut s);
        }
    }

    pub fn record_step(&self, end_of_turn: bool) {
        self.step_msgs.fetch_add(1, Ordering::Relaxed);
        let mut s = self.state.write().expect("tracker lock poisoned");
        let now = Instant::now();
        s.last_recv_at = Some(now);
        s.last_step_at = Some(now);
        if end_of_turn {
            s.last_output_at = Some(now);
        }
    }

    pub fn record_end_word(&self) {
        self.end_word_msgs.fetch_add(1, Ordering::Relaxed);
        self.touch_recv();
    }

    pub fn record_ready(&self) {
        self.ready_msgs.fetch_add(1, Ordering::Relaxed);
        self.touch_recv();
    }

    pub fn record_server_error(&self, message: &str) {
        self.error_msgs.fetch_add(1, Ordering::Relaxed);
        let mut s = self.state.write().expect("tracker lock poisoned");
        s.last_recv_at = Some(Instant::now());
        s.last_server_err = Some(message.to_string());
    }

    pub fn record_marker(&self) {
        self.marker_msgs.fetch_add(1, Ordering::Relaxed);
        self.touch_recv();
    }

    pub fn record_unknown(&self, msg_type: &str) {
        self.unknown_msgs.fetch_add(1, Ordering::Relaxed);
        self.touch_recv();

        let key = if msg_type.is_empty() {
            "(empty)".to_string()
        } else {
            msg_type.to_string()
        };
        *self
            .unknown_types
            .lock()
            .expect("tracker lock poisoned")
            .entry(key)
            .or_insert(0) += 1;
    }

    fn touch_recv(&self) {
        let mut s = self.state.write().expect("tracker lock poisoned");
        s.last_recv_at = Some(Instant::now());
    }

    pub fn record_recv_error(&self, err: &str) {
        let mut s = self.state.write().expect("tracker lock poisoned");
        s.last_recv_err = Some(err.to_string());
        s.last_recv_err_at = Some(Instant::now());
    }

    pub fn record_send_error(&self, err: &str) {
        let mut s = self.state.write().expect("tracker lock poisoned");
        s.last_send_err = Some(err.to_string());
        s.last_send_err_at = Some(Instant::now());
    }

    pub fn record_chunk_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Feed the RMS level of a captured frame. A frame is "active" when it
    /// clears the adaptive baseline; the active timestamp only moves after
    /// five consecutive active frames.
    pub fn record_audio_level(&self, level: f64) {
        let mut s = self.state.write().expect("tracker lock poisoned");
        s.last_audio_level = level;
        if level >= audio_active_threshold(&s) {
            s.audio_active_streak += 1;
            if s.audio_active_streak >= AUDIO_ACTIVE_MIN_STREAK {
                s.last_audio_active_at = Some(Instant::now());
            }
        } else {
            s.audio_active_streak = 0;
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.write().expect("tracker lock poisoned").paused = paused;
    }

    pub fn set_reconnecting(&self, reconnecting: bool) {
        self.state.write().expect("tracker lock poisoned").reconnecting = reconnecting;
    }

    /// Dead air: the microphone is hot and the server keeps stepping, but no
    /// word has produced output for longer than `threshold`.
    pub fn is_dead_air(&self, threshold: Duration) -> bool {
        if threshold.is_zero() {
            return false;
        }

        let s = self.state.read().expect("tracker lock poisoned");
        let now = Instant::now();

        match s.last_step_at {
            Some(at) if now.duration_since(at) <= STEP_FLOW_WINDOW => {}
            _ => return false,
        }

        match s.last_audio_active_at {
            Some(at) if now.duration_since(at) <= threshold => {}
            _ => return false,
        }

        if let Some(at) = s.last_word_at {
            if now.duration_since(at) <= threshold {
                return false;
            }
        } else {
            // Never produced a word: only call it dead air once the
            // connection has been up long enough to have had a chance.
            match s.last_connect_at {
                Some(at) if now.duration_since(at) > threshold => {}
                _ => return false,
            }
        }

        true
    }

    /// Clear audio/word timing after a reconnect so the fresh connection
    /// gets a full threshold before the watchdog can fire again.
    pub fn reset_dead_air_tracking(&self) {
        let mut s = self.state.write().expect("tracker lock poisoned");
        s.last_audio_active_at = None;
        s.last_audio_level = 0.0;
        s.last_step_at = None;
        s.last_word_at = None;
    }

    /// Write the diagnostic report to `path` (mode 0600).
    pub fn dump_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to open diagnostic file: {}", path.display()))?;
        file.write_all(self.format().as_bytes())
            .context("Failed to write diagnostic report")?;
        Ok(())
    }

    /// Render the full diagnostic report.
    pub fn format(&self) -> String {
        let s = self.state.read().expect("tracker lock poisoned");
        let now = Instant::now();
        let mut b = String::new();

        let ago = |at: Option<Instant>| -> String {
            match at {
                Some(t) => format!("{:.1?} ago", now.duration_since(t)),
                None => "NEVER".to_string(),
            }
        };

        let _ = writeln!(b, "=== LOCALSCRIBE DIAGNOSTIC DUMP ===");
        let _ = writeln!(b, "Timestamp: {}", chrono::Utc::now().to_rfc3339());
        let _ = writeln!(b, "Uptime: {:.1?}\n", now.duration_since(self.started_at));

        let _ = writeln!(b, "--- CONNECTION STATE ---");
        let _ = writeln!(b, "Server URL: {}", s.server_url);
        let _ = writeln!(b, "Connected: {}", s.connected);
        let _ = writeln!(b, "Connected at: {}", ago(s.last_connect_at));
        let _ = writeln!(b, "Paused: {}", s.paused);
        let _ = writeln!(b, "Reconnecting: {}\n", s.reconnecting);

        let _ = writeln!(b, "--- MESSAGE STATISTICS ---");
        let _ = writeln!(b, "Word messages: {}", self.word_msgs.load(Ordering::Relaxed));
        let _ = writeln!(b, "EndWord messages: {}", self.end_word_msgs.load(Ordering::Relaxed));
        let _ = writeln!(b, "Step messages: {}", self.step_msgs.load(Ordering::Relaxed));
        let _ = writeln!(b, "Ready messages: {}", self.ready_msgs.load(Ordering::Relaxed));
        let _ = writeln!(b, "Error messages: {}", self.error_msgs.load(Ordering::Relaxed));
        let _ = writeln!(b, "Marker messages: {}", self.marker_msgs.load(Ordering::Relaxed));
        let _ = writeln!(b, "Unknown messages: {}", self.unknown_msgs.load(Ordering::Relaxed));
        let _ = writeln!(b, "Empty words: {}", self.empty_words.load(Ordering::Relaxed));

        if let Some(err) = &s.last_server_err {
            let _ = writeln!(b, "Last server error: {err:?}");
        }

        {
            let unknown = self.unknown_types.lock().expect("tracker lock poisoned");
            if !unknown.is_empty() {
                let _ = writeln!(b, "Unknown message types breakdown:");
                let mut types: Vec<_> = unknown.iter().collect();
                types.sort();
                for (msg_type, count) in types {
                    let _ = writeln!(b, "  - {msg_type:?}: {count}");
                }
            }
        }
        b.push('\n');

        let _ = writeln!(b, "--- TIMING ANALYSIS ---");
        let _ = writeln!(b, "Last message received: {}", ago(s.last_recv_at));
        if s.last_recv_at.is_none()
            || s.last_recv_at.is_some_and(|t| now.duration_since(t) > STEP_FLOW_WINDOW)
        {
            let _ = writeln!(b, "  WARNING: no messages received in >5 seconds");
        }
        let _ = writeln!(b, "Last word output: {}", ago(s.last_word_at));
        let _ = writeln!(b, "Last any output: {}", ago(s.last_output_at));
        let _ = writeln!(b, "Last step message: {}", ago(s.last_step_at));
        let _ = writeln!(b, "Last audio activity: {}", ago(s.last_audio_active_at));
        let _ = writeln!(b, "Last audio level (RMS): {:.5}", s.last_audio_level);
        if s.audio_baseline_count > 0 {
            let _ = writeln!(
                b,
                "Audio baseline (RMS): {:.5} ({} samples)",
                s.audio_baseline, s.audio_baseline_count
            );
        } else {
            let _ = writeln!(b, "Audio baseline (RMS): UNSET");
        }
        let _ = writeln!(
            b,
            "Audio activity threshold (RMS): {:.5}",
            audio_active_threshold(&s)
        );
        let _ = writeln!(
            b,
            "Audio activity streak: {}/{}",
            s.audio_active_streak, AUDIO_ACTIVE_MIN_STREAK
        );
        if !s.last_word.is_empty() {
            let _ = writeln!(b, "Last word text: {:?}", s.last_word);
        }
        b.push('\n');

        let _ = writeln!(b, "--- AUDIO STATISTICS ---");
        let sent = self.chunks_sent.load(Ordering::Relaxed);
        let dropped = self.chunks_dropped.load(Ordering::Relaxed);
        let _ = writeln!(b, "Chunks sent: {sent}");
        let _ = writeln!(b, "Chunks dropped: {dropped}");
        if sent + dropped > 0 {
            let drop_rate = dropped as f64 / (sent + dropped) as f64 * 100.0;
            let _ = writeln!(b, "Drop rate: {drop_rate:.2}%");
            if drop_rate > 5.0 {
                let _ = writeln!(b, "  WARNING: high audio drop rate");
            }
        }
        b.push('\n');

        let _ = writeln!(b, "--- ERRORS ---");
        match &s.last_recv_err {
            Some(err) => {
                let _ = writeln!(b, "Last receive error: {err} ({})", ago(s.last_recv_err_at));
            }
            None => {
                let _ = writeln!(b, "Last receive error: none");
            }
        }
        match &s.last_send_err {
            Some(err) => {
                let _ = writeln!(b, "Last send error: {err} ({})", ago(s.last_send_err_at));
            }
            None => {
                let _ = writeln!(b, "Last send error: none");
            }
        }
        b.push('\n');

        let _ = writeln!(b, "--- PROCESS INFO ---");
        let _ = writeln!(b, "Threads: {}", thread_count());
        b.push('\n');

        let _ = writeln!(b, "--- CURRENT THREAD BACKTRACE (truncated) ---");
        let mut backtrace = std::backtrace::Backtrace::force_capture().to_string();
        if backtrace.len() > 16_000 {
            backtrace.truncate(16_000);
            backtrace.push_str("\n... (truncated)\n");
        }
        b.push_str(&backtrace);
        b.push('\n');

        let _ = writeln!(b, "--- DIAGNOSIS SUGGESTIONS ---");
        self.write_diagnosis(&mut b, &s, now);

        b
    }

    fn write_diagnosis(&self, b: &mut String, s: &State, now: Instant) {
        let mut issues: Vec<String> = Vec::new();

        let recv_stalled = s
            .last_recv_at
            .is_some_and(|t| now.duration_since(t) > STEP_FLOW_WINDOW);
        if recv_stalled && s.connected && !s.paused && !s.reconnecting {
            issues.push(
                "LIKELY CAUSE: receive loop stalled. The server may have stopped sending, \
                 or the WebSocket read is hung."
                    .to_string(),
            );
        }

        let word_count = self.word_msgs.load(Ordering::Relaxed);
        if word_count > 0 && s.last_word_at.is_none() {
            issues.push(
                "LIKELY CAUSE: word messages received but none produced output. Words may \
                 all be empty or filtered by the post-processor."
                    .to_string(),
            );
        }

        let empty_count = self.empty_words.load(Ordering::Relaxed);
        if word_count > 0 && empty_count as f64 / word_count as f64 > 0.9 {
            issues.push(
                "LIKELY CAUSE: >90% of word messages are empty. The server may be sending \
                 empty words."
                    .to_string(),
            );
        }

        let recv_fresh = s
            .last_recv_at
            .is_some_and(|t| now.duration_since(t) < Duration::from_secs(2));
        let output_stale = s
            .last_output_at
            .is_some_and(|t| now.duration_since(t) > Duration::from_secs(10));
        if recv_fresh && output_stale {
            issues.push(
                "LIKELY CAUSE: messages still arriving but no output. Check post-processor \
                 state or message dispatch."
                    .to_string(),
            );
        }

        let unknown = self.unknown_msgs.load(Ordering::Relaxed);
        if unknown > 0 {
            issues.push(format!(
                "NOTE: {unknown} unknown message type(s) received. These are ignored."
            ));
        }

        if issues.is_empty() {
            let _ = writeln!(b, "No obvious issues detected from metrics alone.");
        } else {
            for (i, issue) in issues.iter().enumerate() {
                let _ = writeln!(b, "{}. {}", i + 1, issue);
            }
        }
    }
}

/// EMA of RMS at the moments a word produced output, floored at 0.01.
fn update_audio_baseline(s: &mut State) {
    let mut level = s.last_audio_level;
    if level <= 0.0 {
        return;
    }
    if level < AUDIO_BASELINE_MIN {
        level = AUDIO_BASELINE_MIN;
    }
    if s.audio_baseline_count == 0 {
        s.audio_baseline = level;
        s.audio_baseline_count = 1;
        return;
    }
    s.audio_baseline = (1.0 - AUDIO_BASELINE_ALPHA) * s.audio_baseline + AUDIO_BASELINE_ALPHA * level;
    s.audio_baseline_count += 1;
}

fn audio_active_threshold(s: &State) -> f64 {
    if s.audio_baseline_count > 0 {
        (s.audio_baseline * AUDIO_ACTIVE_FACTOR).max(AUDIO_MIN_ACTIVE_RMS)
    } else {
        AUDIO_MIN_ACTIVE_RMS
    }
}

fn thread_count() -> String {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|l| l.starts_with("Threads:"))
                .map(|l| l.trim_start_matches("Threads:").trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
#[path = "diagnostics_test.rs"]
mod tests;
