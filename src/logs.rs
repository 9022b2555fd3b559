use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Mirrors process log lines into one file per day under `log_dir`.
///
/// Every write is best-effort: a full disk or a missing directory never
/// reaches the caller.
pub struct LogSink {
    log_dir: PathBuf,
    lock: Mutex<()>,
}

impl LogSink {
    pub fn new(log_dir: PathBuf) -> Self {
        std::fs::create_dir_all(&log_dir).ok();
        Self {
            log_dir,
            lock: Mutex::new(()),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn append(&self, level: &str, message: &str) {
        if let Err(e) = self.try_append(level, message) {
            log::debug!("[logs] dropped log line: {}", e);
        }
    }

    pub fn info(&self, message: &str) {
        self.append("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.append("WARN", message);
    }

    fn try_append(&self, level: &str, message: &str) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        std::fs::create_dir_all(&self.log_dir)?;
        let now = chrono::Utc::now();
        let file_name = format!("{}.log", now.format("%Y-%m-%d"));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join(file_name))?;
        writeln!(
            file,
            "{} [{}] {}",
            now.to_rfc3339(),
            level.to_ascii_uppercase(),
            message
        )
    }
}
