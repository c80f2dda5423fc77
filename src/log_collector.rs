//! Logging pipeline for compose runs.
//!
//! ```text
//! log::info!() / tool output
//!     |
//! [LogCollector] (log::Log, non-blocking)
//!     | (crossbeam unbounded channel)
//!     v
//! [writer thread] --> stderr
//!                 --> --log-file (optional, append)
//! ```
//!
//! The writer is a plain OS thread, so lines emitted from any tokio worker
//! reach it. [`LogCollector::wait_for_empty`] blocks until every line sent
//! before it has been written; the driver calls it before exiting.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Verbosity and destinations, shared by the logger and the build engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

impl LogSettings {
    pub fn level_filter(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        }
    }

    /// Level external tool output is echoed at.
    pub fn tool_output_level(&self) -> Level {
        if self.verbose {
            Level::Info
        } else {
            Level::Debug
        }
    }
}

enum LogMessage {
    Line(LogLine),
    /// Acknowledged once everything queued before it is written
    Flush(mpsc::Sender<()>),
}

/// A formatted log record on its way to the writer thread.
#[derive(Clone, Debug)]
pub struct LogLine {
    pub level: Level,
    pub message: String,
    pub timestamp: String,
}

impl LogLine {
    pub fn new(level: Level, message: String) -> Self {
        LogLine {
            level,
            message,
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        }
    }

    fn render(&self) -> String {
        format!("{} [{}] {}\n", self.timestamp, self.level, self.message)
    }
}

/// Channel-backed logger with a dedicated writer thread.
#[derive(Clone)]
pub struct LogCollector {
    tx: Sender<LogMessage>,
    level: LevelFilter,
}

impl LogCollector {
    /// Log to stderr, and to `settings.log_file` when set.
    pub fn new(settings: &LogSettings) -> Result<Self, String> {
        let file = match settings.log_file {
            Some(ref path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| format!("Failed to open log file {}: {}", path.display(), e))?,
            ),
            None => None,
        };
        Ok(Self::with_writer(
            settings.level_filter(),
            Box::new(std::io::stderr()),
            file,
        ))
    }

    pub fn with_writer(
        level: LevelFilter,
        mut console: Box<dyn Write + Send>,
        mut file: Option<File>,
    ) -> Self {
        let (tx, rx) = unbounded::<LogMessage>();

        std::thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                match msg {
                    LogMessage::Line(line) => {
                        let rendered = line.render();
                        let _ = console.write_all(rendered.as_bytes());
                        if let Some(ref mut f) = file {
                            let _ = f.write_all(rendered.as_bytes());
                        }
                    }
                    LogMessage::Flush(ack) => {
                        let _ = console.flush();
                        if let Some(ref mut f) = file {
                            let _ = f.flush();
                        }
                        let _ = ack.send(());
                    }
                }
            }
        });

        LogCollector { tx, level }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn log_line(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    /// Block until every previously sent line is written.
    pub fn wait_for_empty(&self) -> Result<(), String> {
        let (ack_tx, ack_rx) = mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(ack_tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        ack_rx
            .recv_timeout(FLUSH_TIMEOUT)
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }
}

impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.log_line(LogLine::new(record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {
        let _ = self.wait_for_empty();
    }
}

/// Install a [`LogCollector`] as the global `log` backend.
pub fn init_global_logger(settings: &LogSettings) -> Result<LogCollector, String> {
    let collector = LogCollector::new(settings)?;
    log::set_boxed_logger(Box::new(collector.clone()))
        .map_err(|e| format!("Failed to install logger: {}", e))?;
    log::set_max_level(collector.level());
    Ok(collector)
}
