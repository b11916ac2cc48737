// Run logs - channel-named, human-readable log lines
//
// A run log is handed to the sampler and the trainer explicitly; there is no
// process-wide logger. Every line is also emitted as a tracing event.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Destination for one line per notable pipeline event
pub trait RunLog: Send + Sync {
    /// Channel name, e.g. `Train_20240101_120000`
    fn channel(&self) -> &str;

    /// Record one line
    fn log(&self, message: &str) -> Result<()>;
}

/// Emits lines as tracing events only
#[derive(Debug, Clone)]
pub struct TracingRunLog {
    channel: String,
}

impl TracingRunLog {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

impl RunLog for TracingRunLog {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn log(&self, message: &str) -> Result<()> {
        tracing::info!(channel = %self.channel, "{}", message);
        Ok(())
    }
}

/// Appends timestamped lines to `<dir>/<channel>.log`
pub struct FileRunLog {
    channel: String,
    path: PathBuf,
    // Serializes appends from the same process
    lock: Mutex<()>,
}

impl FileRunLog {
    pub fn new(dir: &Path, channel: impl Into<String>) -> Result<Self> {
        let channel = channel.into();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {:?}", dir))?;

        Ok(Self {
            path: dir.join(format!("{}.log", channel)),
            channel,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunLog for FileRunLog {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn log(&self, message: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open run log: {:?}", self.path))?;

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(file, "[{}] {}", timestamp, message)
            .with_context(|| format!("Failed to write run log: {:?}", self.path))?;

        tracing::info!(channel = %self.channel, "{}", message);
        Ok(())
    }
}
