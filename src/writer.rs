//! Transcript output: an append-only file writer with smart flushing,
//! multiplexed with stdout.
//!
//! The writer is the only component with write authority over the
//! transcript file. Flushes happen when enough bytes accumulate or enough
//! time passes, and optionally close/reopen the handle so file watchers
//! see the update.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Flushing behavior for [`FileWriter`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Flush once this many unflushed bytes accumulate.
    pub flush_size: usize,
    /// Flush once this long has passed since the previous flush.
    pub flush_interval: Duration,
    /// Close and reopen the file on flush to trigger filesystem-watch events.
    pub reopen_on_flush: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            flush_size: 200,
            flush_interval: Duration::from_secs(2),
            reopen_on_flush: true,
        }
    }
}

struct FileState {
    file: File,
    bytes_unflushed: usize,
    last_flush: Instant,
}

/// Append-only file writer with size/interval flushing.
pub struct FileWriter {
    path: PathBuf,
    opts: Options,
    state: Mutex<FileState>,
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("Failed to open transcript file: {}", path.display()))
}

impl FileWriter {
    /// Open (creating if needed) `path` for appending, with default options.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_options(path, Options::default())
    }

    /// Open `path` for appending with explicit flush options. Missing parent
    /// directories are created.
    pub fn with_options(path: impl Into<PathBuf>, opts: Options) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
            }
        }

        let file = open_append(&path)?;

        Ok(Self {
            path,
            opts,
            state: Mutex::new(FileState {
                file,
                bytes_unflushed: 0,
                last_flush: Instant::now(),
            }),
        })
    }

    /// Append `data` to the file, flushing if a threshold is reached.
    pub fn write(&self, data: &str) -> Result<()> {
        let mut state = self.state.lock().expect("writer lock poisoned");

        state
            .file
            .write_all(data.as_bytes())
            .context("Failed to write transcript data")?;
        state.bytes_unflushed += data.len();

        if state.bytes_unflushed >= self.opts.flush_size
            || state.last_flush.elapsed() >= self.opts.flush_interval
        {
            self.flush_state(&mut state)?;
        }

        Ok(())
    }

    /// Append `data` followed by a newline.
    pub fn write_line(&self, data: &str) -> Result<()> {
        self.write(&format!("{data}\n"))
    }

    /// Force a flush.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().expect("writer lock poisoned");
        self.flush_state(&mut state)
    }

    fn flush_state(&self, state: &mut FileState) -> Result<()> {
        state.file.sync_all().context("Failed to sync transcript file")?;

        if self.opts.reopen_on_flush {
            // Replacing the handle closes the old one, which is what makes
            // inotify/FSEvents watchers notice the append.
            state.file = open_append(&self.path)?;
        }

        state.bytes_unflushed = 0;
        state.last_flush = Instant::now();
        Ok(())
    }

    /// Final flush. The handle itself closes on drop.
    pub fn close(&self) -> Result<()> {
        let state = self.state.lock().expect("writer lock poisoned");
        state.file.sync_all().context("Failed to sync transcript file")
    }

    /// Unflushed byte count.
    pub fn bytes_unflushed(&self) -> usize {
        self.state.lock().expect("writer lock poisoned").bytes_unflushed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Sink for `%% ...` metadata lines. Metadata producers (heartbeat, meeting
/// detector, plugins) hold this and never touch the file directly.
pub trait MetadataWriter: Send + Sync {
    fn write_metadata(&self, data: &str) -> Result<()>;
}

/// Writes transcript output to both the file and stdout. stdout failures
/// are swallowed; only file errors propagate.
pub struct MultiWriter {
    file: FileWriter,
    stdout: Mutex<Option<Box<dyn Write + Send>>>,
}

impl MultiWriter {
    pub fn new(file: FileWriter, stdout: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            file,
            stdout: Mutex::new(stdout),
        }
    }

    /// Write transcript text to stdout and the file.
    pub fn write(&self, data: &str) -> Result<()> {
        {
            let mut stdout = self.stdout.lock().expect("stdout lock poisoned");
            if let Some(out) = stdout.as_mut() {
                let _ = out.write_all(data.as_bytes());
                let _ = out.flush();
            }
        }

        self.file.write(data)
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.file.close()
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl MetadataWriter for MultiWriter {
    fn write_metadata(&self, data: &str) -> Result<()> {
        debug_assert!(
            data.starts_with("%%"),
            "metadata lines must carry the %% prefix: {data:?}"
        );
        self.write(data)
    }
}

#[cfg(test)]
#[path = "writer_test.rs"]
mod tests;
