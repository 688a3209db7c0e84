use super::*;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn creates_file_on_open() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");

    let w = FileWriter::new(&path).unwrap();
    w.close().unwrap();

    assert!(path.exists());
}

#[test]
fn appends_to_existing_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");
    std::fs::write(&path, "existing content\n").unwrap();

    let w = FileWriter::new(&path).unwrap();
    w.write("new content").unwrap();
    w.flush().unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content, "existing content\nnew content");
}

#[test]
fn sequential_writes_concatenate() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");

    let w = FileWriter::new(&path).unwrap();
    w.write("hello ").unwrap();
    w.write("world").unwrap();
    w.flush().unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world");
}

#[test]
fn flushes_when_size_threshold_reached() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");

    let w = FileWriter::with_options(
        &path,
        Options {
            flush_size: 10,
            flush_interval: Duration::from_secs(3600),
            reopen_on_flush: false,
        },
    )
    .unwrap();

    w.write("short").unwrap();
    assert_eq!(w.bytes_unflushed(), 5);

    // Crossing the threshold resets the unflushed counter.
    w.write("this is longer").unwrap();
    assert_eq!(w.bytes_unflushed(), 0);

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "shortthis is longer"
    );
}

#[test]
fn flushes_when_interval_elapsed() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");

    let w = FileWriter::with_options(
        &path,
        Options {
            flush_size: 1000,
            flush_interval: Duration::from_millis(50),
            reopen_on_flush: false,
        },
    )
    .unwrap();

    w.write("test content").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    w.write("more").unwrap();

    assert_eq!(w.bytes_unflushed(), 0);
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("test content"));
}

#[test]
fn reopen_on_flush_keeps_appending() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");

    let w = FileWriter::with_options(
        &path,
        Options {
            flush_size: 1,
            flush_interval: Duration::from_secs(3600),
            reopen_on_flush: true,
        },
    )
    .unwrap();

    w.write("first").unwrap();
    w.write(" second").unwrap();
    w.close().unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "first second");
}

#[test]
fn file_length_never_shrinks_across_flushes() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");

    let w = FileWriter::with_options(
        &path,
        Options {
            flush_size: 8,
            flush_interval: Duration::from_secs(3600),
            reopen_on_flush: true,
        },
    )
    .unwrap();

    let mut last_len = 0;
    for _ in 0..20 {
        w.write("0123456789").unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len >= last_len, "file shrank from {last_len} to {len}");
        last_len = len;
    }
}

#[test]
fn write_line_appends_newline() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");

    let w = FileWriter::new(&path).unwrap();
    w.write_line("line 1").unwrap();
    w.write_line("line 2").unwrap();
    w.flush().unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "line 1\nline 2\n");
}

#[test]
fn creates_missing_parent_directories() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("subdir").join("nested").join("test.txt");

    let w = FileWriter::new(&path).unwrap();
    w.write("test").unwrap();
    w.flush().unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "test");
}

#[test]
fn concurrent_writes_lose_nothing() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");

    let w = Arc::new(FileWriter::new(&path).unwrap());

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let w = w.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    w.write("x").unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    w.flush().unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap().len(), 1000);
}

#[test]
fn multi_writer_duplicates_to_stdout_sink() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");

    let sink = SharedSink::default();
    let file = FileWriter::new(&path).unwrap();
    let mw = MultiWriter::new(file, Some(Box::new(sink.clone())));

    mw.write("hello world").unwrap();
    mw.flush().unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world");
    assert_eq!(sink.contents(), "hello world");
}

#[test]
fn multi_writer_without_stdout_still_writes_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");

    let mw = MultiWriter::new(FileWriter::new(&path).unwrap(), None);
    mw.write("test").unwrap();
    mw.flush().unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "test");
}

#[test]
fn write_metadata_reaches_both_sinks() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.txt");

    let sink = SharedSink::default();
    let mw = MultiWriter::new(
        FileWriter::new(&path).unwrap(),
        Some(Box::new(sink.clone())),
    );

    mw.write_metadata("%% time: 2024/01/15 14:30:00 EST\n").unwrap();
    mw.flush().unwrap();

    let expected = "%% time: 2024/01/15 14:30:00 EST\n";
    assert_eq!(std::fs::read_to_string(&path).unwrap(), expected);
    assert_eq!(sink.contents(), expected);
}

/// A cloneable in-memory sink standing in for stdout.
#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
