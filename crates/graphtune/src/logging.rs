//! Append-only phase logs.
//!
//! Every session keeps four free-form text logs (autoschedule / build /
//! evaluate / exec) plus a JSON feature log derived from the autoschedule
//! log path. An empty path turns the stream into a sink.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

const BANNER_RULE: &str =
    "######################################################################";

/// A shared append-only log stream.
#[derive(Clone)]
pub struct LogStream {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogStream {
    /// Opens `path` for appending; an empty path yields a sink.
    pub fn open(path: &str) -> Result<Self> {
        let writer: Box<dyn Write + Send> = if path.is_empty() {
            Box::new(io::sink())
        } else {
            Box::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(Path::new(path))?,
            )
        };
        Ok(LogStream {
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn sink() -> Self {
        LogStream {
            writer: Arc::new(Mutex::new(Box::new(io::sink()))),
        }
    }

    pub fn line(&self, message: impl AsRef<str>) {
        let mut writer = self.writer.lock().expect("log stream poisoned");
        let _ = writeln!(writer, "{}", message.as_ref());
        let _ = writer.flush();
    }

    /// Task-start banner: `[time= <epoch_ms>] New <phase> task.` plus rule.
    pub fn banner(&self, phase: &str) {
        let mut writer = self.writer.lock().expect("log stream poisoned");
        let _ = writeln!(
            writer,
            "[time= {}] New {} task.\n{}",
            epoch_millis(),
            phase,
            BANNER_RULE
        );
        let _ = writer.flush();
    }
}

pub fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// The JSON feature log lives next to the autoschedule log: stem plus
/// `_profile.txt`.
pub fn profile_log_path(autoschedule_log_file: &str) -> String {
    if autoschedule_log_file.is_empty() {
        return String::new();
    }
    let stem = autoschedule_log_file
        .split('.')
        .next()
        .unwrap_or(autoschedule_log_file);
    format!("{stem}_profile.txt")
}
