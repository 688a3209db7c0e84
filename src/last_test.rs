use super::*;
use std::str::FromStr;
use tempfile::TempDir;

fn parse_with(heartbeat: &mut Option<NaiveDateTime>, raw: &str) -> Option<LogLine> {
    parse_line(raw, heartbeat)
}

fn ts(text: &str) -> NaiveDateTime {
    timestamp::parse_stamp(text).unwrap()
}

#[test]
fn unit_aliases_parse() {
    for alias in ["m", "min", "mins", "minute", "minutes"] {
        assert_eq!(Unit::from_str(alias).unwrap(), Unit::Minutes);
    }
    for alias in ["h", "hour", "hours"] {
        assert_eq!(Unit::from_str(alias).unwrap(), Unit::Hours);
    }
    for alias in ["d", "day", "days"] {
        assert_eq!(Unit::from_str(alias).unwrap(), Unit::Days);
    }
    for alias in ["w", "week", "weeks"] {
        assert_eq!(Unit::from_str(alias).unwrap(), Unit::Weeks);
    }
    for alias in ["mo", "month", "months"] {
        assert_eq!(Unit::from_str(alias).unwrap(), Unit::Months);
    }
    for alias in ["meet", "meeting", "meetings"] {
        assert_eq!(Unit::from_str(alias).unwrap(), Unit::Meetings);
    }
    assert!(Unit::from_str("fortnights").is_err());
}

#[test]
fn window_start_by_unit() {
    let base = ts("2024/03/15 12:00:00 UTC");
    assert_eq!(
        window_start(base, 20, Unit::Minutes),
        ts("2024/03/15 11:40:00 UTC")
    );
    assert_eq!(
        window_start(base, 3, Unit::Hours),
        ts("2024/03/15 09:00:00 UTC")
    );
    assert_eq!(
        window_start(base, 2, Unit::Days),
        ts("2024/03/13 12:00:00 UTC")
    );
    assert_eq!(
        window_start(base, 1, Unit::Weeks),
        ts("2024/03/08 12:00:00 UTC")
    );
    assert_eq!(
        window_start(base, 2, Unit::Months),
        ts("2024/01/15 12:00:00 UTC")
    );
}

#[test]
fn parse_legacy_line() {
    let mut hb = None;
    let line = parse_with(&mut hb, "2024/01/15 14:30:00 EST hello there").unwrap();
    assert_eq!(line.timestamp, ts("2024/01/15 14:30:00 EST"));
    assert!(!line.is_metadata);
    // Legacy timestamps also seed the running heartbeat.
    assert_eq!(hb, Some(ts("2024/01/15 14:30:00 EST")));
}

#[test]
fn parse_legacy_metadata_and_meeting_markers() {
    let mut hb = None;
    let line = parse_with(&mut hb, "2024/01/15 14:30:00 EST %%% meeting started zoom").unwrap();
    assert!(line.is_metadata);
    assert!(line.is_meeting_start);

    let line = parse_with(&mut hb, "2024/01/15 14:45:00 EST %%% meeting ended zoom").unwrap();
    assert!(line.is_metadata);
    assert!(line.is_meeting_end);

    let line = parse_with(&mut hb, "2024/01/15 14:50:00 EST ### flush").unwrap();
    assert!(line.is_metadata);
    assert!(!line.is_meeting_start);
}

#[test]
fn parse_heartbeat_sets_running_timestamp() {
    let mut hb = None;
    let line = parse_with(&mut hb, "%% time: 2024/01/15 14:30:00 EST").unwrap();
    assert!(line.is_metadata);
    assert_eq!(line.timestamp, ts("2024/01/15 14:30:00 EST"));

    let plain = parse_with(&mut hb, "spoken words here").unwrap();
    assert!(!plain.is_metadata);
    assert_eq!(plain.timestamp, ts("2024/01/15 14:30:00 EST"));
}

#[test]
fn plain_text_without_heartbeat_is_skipped() {
    let mut hb = None;
    assert!(parse_with(&mut hb, "orphan line").is_none());
}

#[test]
fn new_meeting_markers_inherit_heartbeat() {
    let mut hb = Some(ts("2024/01/15 14:30:00 EST"));

    let line = parse_with(&mut hb, "%% meeting started: 2024/01/15 14:31:00 EST zoom").unwrap();
    assert!(line.is_meeting_start);
    assert!(line.is_metadata);
    assert_eq!(line.timestamp, ts("2024/01/15 14:30:00 EST"));

    let line = parse_with(&mut hb, "%% meeting title: Standup").unwrap();
    assert!(line.is_meeting_title);
    assert!(line.is_metadata);

    let line =
        parse_with(&mut hb, "%% meeting ended: 2024/01/15 14:45:00 EST zoom (duration: 14m)")
            .unwrap();
    assert!(line.is_meeting_end);
}

#[test]
fn other_percent_lines_are_metadata() {
    let mut hb = Some(ts("2024/01/15 14:30:00 EST"));
    let line = parse_with(&mut hb, "%% weather: sunny 20C").unwrap();
    assert!(line.is_metadata);
    assert!(!line.is_meeting_start && !line.is_meeting_end && !line.is_meeting_title);
}

#[test]
fn intervals_from_matched_markers() {
    let lines = vec![
        plain_line("2024/01/01 10:00:00 UTC", "before"),
        marker_line("2024/01/01 10:01:00 UTC", true, false),
        plain_line("2024/01/01 10:02:00 UTC", "during"),
        marker_line("2024/01/01 10:30:00 UTC", false, true),
        plain_line("2024/01/01 10:31:00 UTC", "after"),
    ];

    let intervals = find_meeting_intervals(&lines);
    assert_eq!(intervals.len(), 1);
    assert_eq!(intervals[0].start_index, 1);
    assert_eq!(intervals[0].end_index, 3);
    assert_eq!(intervals[0].start_time, ts("2024/01/01 10:01:00 UTC"));
    assert_eq!(intervals[0].end_time, ts("2024/01/01 10:30:00 UTC"));
}

#[test]
fn dangling_start_closes_at_last_line() {
    let lines = vec![
        marker_line("2024/01/01 10:00:00 UTC", true, false),
        plain_line("2024/01/01 10:01:00 UTC", "still going"),
    ];

    let intervals = find_meeting_intervals(&lines);
    assert_eq!(intervals.len(), 1);
    assert_eq!(intervals[0].end_index, 1);
}

#[test]
fn second_start_closes_open_interval() {
    let lines = vec![
        marker_line("2024/01/01 10:00:00 UTC", true, false),
        plain_line("2024/01/01 10:01:00 UTC", "one"),
        marker_line("2024/01/01 11:00:00 UTC", true, false),
        marker_line("2024/01/01 11:30:00 UTC", false, true),
    ];

    let intervals = find_meeting_intervals(&lines);
    assert_eq!(intervals.len(), 2);
    assert_eq!((intervals[0].start_index, intervals[0].end_index), (0, 1));
    assert_eq!((intervals[1].start_index, intervals[1].end_index), (2, 3));
}

#[test]
fn dangling_end_is_ignored() {
    let lines = vec![
        plain_line("2024/01/01 10:00:00 UTC", "text"),
        marker_line("2024/01/01 10:01:00 UTC", false, true),
    ];
    assert!(find_meeting_intervals(&lines).is_empty());
}

#[test]
fn strip_legacy_prefix_removes_datestamp() {
    assert_eq!(
        strip_legacy_prefix("2024/01/15 14:30:00 EST - hello"),
        "hello"
    );
    assert_eq!(strip_legacy_prefix("no prefix here"), "no prefix here");
}

fn plain_line(stamp: &str, text: &str) -> LogLine {
    LogLine::plain(ts(stamp), text.to_string())
}

fn marker_line(stamp: &str, start: bool, end: bool) -> LogLine {
    let mut line = LogLine::plain(ts(stamp), if start { "%% meeting started: x" } else { "%% meeting ended: x" }.to_string());
    line.is_metadata = true;
    line.is_meeting_start = start;
    line.is_meeting_end = end;
    line
}

fn write_corpus(dir: &TempDir, name: &str, content: &str) {
    std::fs::write(dir.path().join(name), content).unwrap();
}

fn run_query(opts: &Options) -> String {
    let mut out = Vec::new();
    run(opts, &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

fn options(dir: &TempDir, count: u32, unit: Unit) -> Options {
    Options {
        count,
        unit,
        dir: Some(dir.path().to_string_lossy().into_owned()),
        keep_meta: false,
        trim_date: false,
        as_of: None,
    }
}

#[test]
fn time_window_with_asof_selects_closed_range() {
    let dir = TempDir::new().unwrap();
    write_corpus(
        &dir,
        "a.txt",
        "%% time: 2024/01/15 10:00:00 UTC\n\
         too early\n\
         %% time: 2024/01/15 11:30:00 UTC\n\
         in window\n\
         %% time: 2024/01/15 13:00:00 UTC\n\
         too late\n",
    );

    let mut opts = options(&dir, 1, Unit::Hours);
    opts.as_of = Some("2024/01/15 12:00:00 UTC".to_string());

    assert_eq!(run_query(&opts), "in window\n");
}

#[test]
fn keepmeta_retains_metadata_lines() {
    let dir = TempDir::new().unwrap();
    write_corpus(
        &dir,
        "a.txt",
        "%% time: 2024/01/15 11:30:00 UTC\n\
         words\n\
         %% note: something\n",
    );

    let mut opts = options(&dir, 1, Unit::Hours);
    opts.as_of = Some("2024/01/15 12:00:00 UTC".to_string());
    opts.keep_meta = true;

    assert_eq!(
        run_query(&opts),
        "%% time: 2024/01/15 11:30:00 UTC\nwords\n%% note: something\n"
    );
}

#[test]
fn files_sort_lexicographically_and_merge() {
    let dir = TempDir::new().unwrap();
    write_corpus(
        &dir,
        "b.txt",
        "%% time: 2024/01/15 11:10:00 UTC\nsecond file\n",
    );
    write_corpus(
        &dir,
        "a.txt",
        "%% time: 2024/01/15 11:05:00 UTC\nfirst file\n",
    );
    // Non-transcript extensions are ignored.
    write_corpus(&dir, "c.tmp", "%% time: 2024/01/15 11:15:00 UTC\nignored\n");

    let mut opts = options(&dir, 1, Unit::Hours);
    opts.as_of = Some("2024/01/15 12:00:00 UTC".to_string());

    assert_eq!(run_query(&opts), "first file\nsecond file\n");
}

#[test]
fn legacy_files_are_read_and_trimmed() {
    let dir = TempDir::new().unwrap();
    write_corpus(
        &dir,
        "old.log",
        "2024/01/15 11:00:00 UTC - legacy words\n\
         2024/01/15 11:01:00 UTC %%% flush marker\n",
    );

    let mut opts = options(&dir, 2, Unit::Hours);
    opts.as_of = Some("2024/01/15 12:00:00 UTC".to_string());
    opts.trim_date = true;

    assert_eq!(run_query(&opts), "legacy words\n");
}

#[test]
fn filename_seeds_heartbeat_for_untimed_lines() {
    let dir = TempDir::new().unwrap();
    write_corpus(
        &dir,
        "transcript_20240115_113000.txt",
        "words before any heartbeat\n",
    );

    let mut opts = options(&dir, 1, Unit::Hours);
    opts.as_of = Some("2024/01/15 12:00:00 UTC".to_string());

    assert_eq!(run_query(&opts), "words before any heartbeat\n");
}

#[test]
fn unparseable_file_is_skipped() {
    let dir = TempDir::new().unwrap();
    write_corpus(
        &dir,
        "good.txt",
        "%% time: 2024/01/15 11:30:00 UTC\nkept\n",
    );
    std::fs::write(dir.path().join("bad.txt"), [0xff, 0xfe, 0x00]).unwrap();

    let mut opts = options(&dir, 1, Unit::Hours);
    opts.as_of = Some("2024/01/15 12:00:00 UTC".to_string());

    assert_eq!(run_query(&opts), "kept\n");
}

#[test]
fn empty_directory_prints_nothing() {
    let dir = TempDir::new().unwrap();
    let opts = options(&dir, 1, Unit::Hours);
    assert_eq!(run_query(&opts), "");
}

#[test]
fn last_meeting_includes_markers_and_title_only_for_that_interval() {
    let dir = TempDir::new().unwrap();
    write_corpus(
        &dir,
        "day.txt",
        "%% time: 2024/01/15 09:00:00 UTC\n\
         morning words\n\
         %% meeting started: 2024/01/15 09:10:00 UTC zoom\n\
         zoom words\n\
         %% meeting ended: 2024/01/15 09:13:00 UTC zoom (duration: 3m)\n\
         %% time: 2024/01/15 10:00:00 UTC\n\
         between words\n\
         %% meeting started: 2024/01/15 10:10:00 UTC meet/abc-defg-hij\n\
         %% meeting title: Standup\n\
         meet words\n\
         %% meeting ended: 2024/01/15 10:25:00 UTC meet (duration: 15m)\n\
         %% time: 2024/01/15 11:00:00 UTC\n\
         after words\n",
    );

    let mut opts = options(&dir, 1, Unit::Meetings);
    opts.as_of = Some("2024/01/15 12:00:00 UTC".to_string());

    assert_eq!(
        run_query(&opts),
        "%% meeting started: 2024/01/15 10:10:00 UTC meet/abc-defg-hij\n\
         %% meeting title: Standup\n\
         meet words\n\
         %% meeting ended: 2024/01/15 10:25:00 UTC meet (duration: 15m)\n"
    );
}

#[test]
fn two_meetings_are_separated() {
    let dir = TempDir::new().unwrap();
    write_corpus(
        &dir,
        "day.txt",
        "%% time: 2024/01/15 09:00:00 UTC\n\
         %% meeting started: 2024/01/15 09:10:00 UTC zoom\n\
         first\n\
         %% meeting ended: 2024/01/15 09:13:00 UTC zoom (duration: 3m)\n\
         %% time: 2024/01/15 10:00:00 UTC\n\
         %% meeting started: 2024/01/15 10:10:00 UTC zoom\n\
         second\n\
         %% meeting ended: 2024/01/15 10:25:00 UTC zoom (duration: 15m)\n",
    );

    let mut opts = options(&dir, 2, Unit::Meetings);
    opts.as_of = Some("2024/01/15 12:00:00 UTC".to_string());

    let output = run_query(&opts);
    assert_eq!(output.matches("======").count(), 1);
    assert!(output.contains("first\n"));
    assert!(output.contains("second\n"));
    let sep_pos = output.find("======").unwrap();
    assert!(output.find("first").unwrap() < sep_pos);
    assert!(output.find("second").unwrap() > sep_pos);
}

#[test]
fn meetings_after_asof_are_excluded() {
    let dir = TempDir::new().unwrap();
    write_corpus(
        &dir,
        "day.txt",
        "%% time: 2024/01/15 09:00:00 UTC\n\
         %% meeting started: 2024/01/15 09:10:00 UTC zoom\n\
         early meeting\n\
         %% meeting ended: 2024/01/15 09:13:00 UTC zoom (duration: 3m)\n\
         %% time: 2024/01/15 15:00:00 UTC\n\
         %% meeting started: 2024/01/15 15:10:00 UTC zoom\n\
         late meeting\n\
         %% meeting ended: 2024/01/15 15:25:00 UTC zoom (duration: 15m)\n",
    );

    let mut opts = options(&dir, 1, Unit::Meetings);
    opts.as_of = Some("2024/01/15 12:00:00 UTC".to_string());

    let output = run_query(&opts);
    assert!(output.contains("early meeting"));
    assert!(!output.contains("late meeting"));
}

#[test]
fn no_asof_window_uses_current_time() {
    let dir = TempDir::new().unwrap();
    let recent = timestamp::now_naive() - ChronoDuration::minutes(5);
    let old = timestamp::now_naive() - ChronoDuration::hours(3);
    write_corpus(
        &dir,
        "live.txt",
        &format!(
            "%% time: {} UTC\nold words\n%% time: {} UTC\nrecent words\n",
            old.format(timestamp::STAMP_LAYOUT),
            recent.format(timestamp::STAMP_LAYOUT),
        ),
    );

    let opts = options(&dir, 1, Unit::Hours);
    assert_eq!(run_query(&opts), "recent words\n");
}
