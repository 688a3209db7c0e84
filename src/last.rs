//! The `last` subcommand: slice the transcript corpus by time window or by
//! meeting.
//!
//! Two line grammars are accepted. The current format localizes plain text
//! through `%% time:` heartbeat lines; the legacy format prefixed every
//! line with a timestamp and used `%%%`/`###` for metadata. Timestamps are
//! compared as naive local date-times; the timezone token is opaque.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration as ChronoDuration, Months, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::timestamp;

/// Files with a line longer than this are skipped.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Separator printed between meeting intervals.
const INTERVAL_SEPARATOR: &str = "======";

/// Supported window units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Meetings,
}

impl std::str::FromStr for Unit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "m" | "min" | "mins" | "minute" | "minutes" => Ok(Unit::Minutes),
            "h" | "hour" | "hours" => Ok(Unit::Hours),
            "d" | "day" | "days" => Ok(Unit::Days),
            "w" | "week" | "weeks" => Ok(Unit::Weeks),
            "mo" | "month" | "months" => Ok(Unit::Months),
            "meet" | "meeting" | "meetings" => Ok(Unit::Meetings),
            other => Err(anyhow!("unrecognized unit '{other}'")),
        }
    }
}

/// One parsed transcript line with its resolved timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub timestamp: NaiveDateTime,
    pub raw: String,
    pub is_metadata: bool,
    pub is_meeting_start: bool,
    pub is_meeting_end: bool,
    pub is_meeting_title: bool,
}

impl LogLine {
    fn plain(timestamp: NaiveDateTime, raw: String) -> Self {
        Self {
            timestamp,
            raw,
            is_metadata: false,
            is_meeting_start: false,
            is_meeting_end: false,
            is_meeting_title: false,
        }
    }
}

/// A contiguous run of lines between meeting markers.
#[derive(Debug, Clone, PartialEq)]
pub struct MeetingInterval {
    pub start_index: usize,
    pub end_index: usize,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
}

/// Options for one `last` invocation.
#[derive(Debug, Clone)]
pub struct Options {
    pub count: u32,
    pub unit: Unit,
    pub dir: Option<String>,
    pub keep_meta: bool,
    pub trim_date: bool,
    pub as_of: Option<String>,
}

// Legacy format: "2024/01/15 14:30:00 EST - transcript text".
static LEGACY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2}\s+[A-Z]{1,5})\s+(.*)$").unwrap()
});

// Current format heartbeat: "%% time: 2024/01/15 14:30:00 EST".
static HEARTBEAT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^%%\s*time:\s*(\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2}\s+[A-Z]{1,5})").unwrap()
});

static MEETING_START_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^%%\s*meeting started:").unwrap());
static MEETING_END_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^%%\s*meeting ended:").unwrap());
static MEETING_TITLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^%%\s*meeting title:").unwrap());

// Session start embedded in filenames like transcript_20240115_143000.txt.
static FILENAME_TS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{8})_(\d{6})").unwrap());

// Legacy per-line prefix removed by --trimdate.
static LEGACY_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9]{4}/[0-9]{2}/[0-9]{2}\s+[0-9]{2}:[0-9]{2}:[0-9]{2}\s+[A-Z]{1,5}\s*-\s*")
        .unwrap()
});

/// Execute the query, printing selected lines to `stdout`.
pub fn run(opts: &Options, stdout: &mut impl Write) -> Result<()> {
    let dir = resolve_directory(opts.dir.as_deref());

    let mut lines = read_all(&dir)?;
    if lines.is_empty() {
        return Ok(());
    }

    // Stable sort keeps file order for lines sharing a heartbeat.
    lines.sort_by_key(|l| l.timestamp);

    let (as_of, as_of_given) = match &opts.as_of {
        Some(text) => (parse_as_of(text)?, true),
        None => (timestamp::now_naive(), false),
    };

    match opts.unit {
        Unit::Meetings => {
            let before: Vec<LogLine> = lines
                .into_iter()
                .filter(|l| l.timestamp <= as_of)
                .collect();

            let intervals = find_meeting_intervals(&before);
            if intervals.is_empty() {
                warn!("no 'meeting started' lines found before asof; returning no data");
                return Ok(());
            }

            let n = opts.count as usize;
            let selected = if intervals.len() >= n {
                &intervals[intervals.len() - n..]
            } else {
                warn!(
                    found = intervals.len(),
                    requested = n,
                    "fewer meetings than requested"
                );
                &intervals[..]
            };

            print_meetings(stdout, &before, selected, opts.keep_meta, opts.trim_date)?;
        }
        unit => {
            let cutoff = window_start(as_of, opts.count, unit);
            let filtered = lines.iter().filter(|l| {
                if as_of_given {
                    l.timestamp >= cutoff && l.timestamp <= as_of
                } else {
                    l.timestamp >= cutoff
                }
            });

            for line in filtered {
                if !opts.keep_meta && line.is_metadata {
                    continue;
                }
                let raw = if opts.trim_date {
                    strip_legacy_prefix(&line.raw)
                } else {
                    line.raw.clone()
                };
                writeln!(stdout, "{raw}")?;
            }
        }
    }

    Ok(())
}

/// The beginning of an `N × unit` window ending at `base`.
fn window_start(base: NaiveDateTime, n: u32, unit: Unit) -> NaiveDateTime {
    let n = i64::from(n);
    match unit {
        Unit::Minutes => base - ChronoDuration::minutes(n),
        Unit::Hours => base - ChronoDuration::hours(n),
        Unit::Days => base - ChronoDuration::days(n),
        Unit::Weeks => base - ChronoDuration::days(7 * n),
        Unit::Months => base
            .checked_sub_months(Months::new(n as u32))
            .unwrap_or(base),
        Unit::Meetings => base,
    }
}

fn parse_as_of(text: &str) -> Result<NaiveDateTime> {
    timestamp::parse_stamp(text)
        .ok_or_else(|| anyhow!("failed to parse --asof '{text}' (expected 'YYYY/MM/DD HH:MM:SS TZ')"))
}

/// Transcript directory: explicit flag, then $TRANSCRIPTION_DIR, then
/// ~/.local/scribe, then the current directory.
pub fn resolve_directory(flag: Option<&str>) -> PathBuf {
    if let Some(dir) = flag {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(dir) = std::env::var("TRANSCRIPTION_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".local").join("scribe");
    }
    PathBuf::from(".")
}

fn gather_log_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".log") || name.ends_with(".txt") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn read_all(dir: &Path) -> Result<Vec<LogLine>> {
    let mut all = Vec::new();
    for path in gather_log_files(dir)? {
        match read_file(&path) {
            Ok(mut lines) => all.append(&mut lines),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping file");
            }
        }
    }
    Ok(all)
}

fn read_file(path: &Path) -> Result<Vec<LogLine>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    // Session start from the filename seeds the heartbeat for files whose
    // first plain lines precede any %% time: marker.
    let mut heartbeat: Option<NaiveDateTime> = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .and_then(|name| {
            let caps = FILENAME_TS_RE.captures(&name)?;
            NaiveDateTime::parse_from_str(
                &format!("{}_{}", &caps[1], &caps[2]),
                "%Y%m%d_%H%M%S",
            )
            .ok()
        });

    let mut lines = Vec::new();
    for raw in content.lines() {
        if raw.len() > MAX_LINE_BYTES {
            bail!("line exceeds {MAX_LINE_BYTES} bytes");
        }
        if raw.trim().is_empty() {
            continue;
        }
        if let Some(line) = parse_line(raw, &mut heartbeat) {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Parse one line in either grammar, tracking the running heartbeat.
fn parse_line(raw: &str, heartbeat: &mut Option<NaiveDateTime>) -> Option<LogLine> {
    // Legacy: every line starts with its own timestamp.
    if let Some(caps) = LEGACY_RE.captures(raw) {
        let ts = timestamp::parse_stamp(&caps[1])?;
        let rest = caps[2].trim();
        let mut line = LogLine::plain(ts, raw.to_string());
        if rest.starts_with("%%%") || rest.starts_with("###") {
            line.is_metadata = true;
        }
        if rest.contains("%%% meeting started") {
            line.is_meeting_start = true;
        }
        if rest.contains("%%% meeting ended") {
            line.is_meeting_end = true;
        }
        *heartbeat = Some(ts);
        return Some(line);
    }

    // Current-format heartbeat.
    if let Some(caps) = HEARTBEAT_RE.captures(raw) {
        let ts = timestamp::parse_stamp(&caps[1])?;
        *heartbeat = Some(ts);
        let mut line = LogLine::plain(ts, raw.to_string());
        line.is_metadata = true;
        return Some(line);
    }

    let inherited = heartbeat.unwrap_or(NaiveDateTime::MIN);

    if MEETING_START_RE.is_match(raw) {
        let mut line = LogLine::plain(inherited, raw.to_string());
        line.is_metadata = true;
        line.is_meeting_start = true;
        return Some(line);
    }
    if MEETING_END_RE.is_match(raw) {
        let mut line = LogLine::plain(inherited, raw.to_string());
        line.is_metadata = true;
        line.is_meeting_end = true;
        return Some(line);
    }
    if MEETING_TITLE_RE.is_match(raw) {
        let mut line = LogLine::plain(inherited, raw.to_string());
        line.is_metadata = true;
        line.is_meeting_title = true;
        return Some(line);
    }

    // Any other %% line is plain metadata.
    if raw.starts_with("%%") {
        let mut line = LogLine::plain(inherited, raw.to_string());
        line.is_metadata = true;
        return Some(line);
    }

    // Plain transcript text needs a heartbeat to be time-localized.
    heartbeat.map(|ts| LogLine::plain(ts, raw.to_string()))
}

/// Build meeting intervals in one pass. A start with an already-open
/// meeting closes the previous one at the preceding line; a dangling start
/// closes at the last line.
pub fn find_meeting_intervals(lines: &[LogLine]) -> Vec<MeetingInterval> {
    let mut intervals = Vec::new();
    let mut start_idx: Option<usize> = None;

    for (i, line) in lines.iter().enumerate() {
        if line.is_meeting_start {
            if let Some(start) = start_idx {
                intervals.push(MeetingInterval {
                    start_index: start,
                    end_index: i - 1,
                    start_time: lines[start].timestamp,
                    end_time: lines[i - 1].timestamp,
                });
            }
            start_idx = Some(i);
        } else if line.is_meeting_end {
            if let Some(start) = start_idx.take() {
                intervals.push(MeetingInterval {
                    start_index: start,
                    end_index: i,
                    start_time: lines[start].timestamp,
                    end_time: line.timestamp,
                });
            }
        }
    }

    if let Some(start) = start_idx {
        let last = lines.len() - 1;
        intervals.push(MeetingInterval {
            start_index: start,
            end_index: last,
            start_time: lines[start].timestamp,
            end_time: lines[last].timestamp,
        });
    }

    intervals
}

fn print_meetings(
    stdout: &mut impl Write,
    lines: &[LogLine],
    intervals: &[MeetingInterval],
    keep_meta: bool,
    trim_date: bool,
) -> Result<()> {
    for (idx, interval) in intervals.iter().enumerate() {
        for line in &lines[interval.start_index..=interval.end_index] {
            if !keep_meta
                && line.is_metadata
                && !(line.is_meeting_start || line.is_meeting_end || line.is_meeting_title)
            {
                continue;
            }
            let raw = if trim_date {
                strip_legacy_prefix(&line.raw)
            } else {
                line.raw.clone()
            };
            writeln!(stdout, "{raw}")?;
        }
        if idx < intervals.len() - 1 {
            writeln!(stdout, "{INTERVAL_SEPARATOR}")?;
        }
    }
    Ok(())
}

fn strip_legacy_prefix(raw: &str) -> String {
    LEGACY_PREFIX_RE.replace(raw, "").into_owned()
}

#[cfg(test)]
#[path = "last_test.rs"]
mod tests;
