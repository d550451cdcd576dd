use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};

// ---------------------------------------------------------------------------
// Log Level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Off = 5,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Off => "OFF",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "off" | "none" | "disabled" => Self::Off,
            _ => Self::Info,
        }
    }

    fn color_code(&self) -> &'static str {
        match self {
            Self::Trace => "\x1b[90m", // gray
            Self::Debug => "\x1b[36m", // cyan
            Self::Info => "\x1b[32m",  // green
            Self::Warn => "\x1b[33m",  // yellow
            Self::Error => "\x1b[31m", // red
            Self::Off => "",
        }
    }

    fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::Trace => log::LevelFilter::Trace,
            Self::Debug => log::LevelFilter::Debug,
            Self::Info => log::LevelFilter::Info,
            Self::Warn => log::LevelFilter::Warn,
            Self::Error => log::LevelFilter::Error,
            Self::Off => log::LevelFilter::Off,
        }
    }
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Self::Trace,
            log::Level::Debug => Self::Debug,
            log::Level::Info => Self::Info,
            log::Level::Warn => Self::Warn,
            log::Level::Error => Self::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Log Entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub target: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    fn format_line(&self, color: bool) -> String {
        // e.g. 2026-02-27T02:17:25.113520+00:00
        let ts = self.timestamp.format("%Y-%m-%dT%H:%M:%S%.6f+00:00");
        let target = self.target.as_deref().unwrap_or("-");
        if !color {
            return format!("{ts} {:<5} {target} {}", self.level.as_str(), self.message);
        }

        let reset = "\x1b[0m";
        let dim = "\x1b[2m";
        let level_color = self.level.color_code();
        format!(
            "{dim}{ts}{reset} {level_color}{:<5}{reset} {dim}{target}{reset} {}",
            self.level.as_str(),
            self.message,
        )
    }
}

// ---------------------------------------------------------------------------
// Log Config
// ---------------------------------------------------------------------------

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to output.
    pub level: LogLevel,
    /// Queue capacity.
    pub queue_size: usize,
    /// ANSI colors on stderr.
    pub color: bool,
    /// Target prefixes to skip (e.g. chatty dependencies).
    pub skip_targets: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            queue_size: 10_000,
            color: true,
            skip_targets: vec![
                "hyper".to_string(),
                "tungstenite".to_string(),
                "tokio_tungstenite".to_string(),
                "reqwest".to_string(),
            ],
        }
    }
}

impl LogConfig {
    pub fn with_level(level: &str) -> Self {
        Self {
            level: LogLevel::parse(level),
            ..Self::default()
        }
    }

    pub fn should_skip_target(&self, target: &str) -> bool {
        self.skip_targets.iter().any(|t| target.starts_with(t.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Log Queue (global singleton, re-initializable)
// ---------------------------------------------------------------------------

static LOG_QUEUE: RwLock<Option<LogQueueInner>> = RwLock::new(None);

struct LogQueueInner {
    sender: Sender<LogEntry>,
    config: Arc<RwLock<LogConfig>>,
    running: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

pub struct LogQueue;

impl LogQueue {
    /// Initialize (or re-initialize) the global log queue.
    pub fn init(config: LogConfig) -> std::io::Result<()> {
        Self::shutdown();

        let (sender, receiver) = bounded::<LogEntry>(config.queue_size.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let cfg = Arc::new(RwLock::new(config));

        let worker = {
            let cfg = cfg.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name("arcade-sync-logger".into())
                .spawn(move || log_consumer(receiver, cfg, running))?
        };
        *LOG_QUEUE.write() = Some(LogQueueInner {
            sender,
            config: cfg,
            running,
            worker,
        });
        Ok(())
    }

    /// Update log config at runtime.
    pub fn update_config(config: LogConfig) {
        log::set_max_level(config.level.to_filter());
        let guard = LOG_QUEUE.read();
        if let Some(ref inner) = *guard {
            *inner.config.write() = config;
        }
    }

    /// Stop the queue and wait until every queued line is written.
    pub fn shutdown() {
        let Some(inner) = LOG_QUEUE.write().take() else {
            return;
        };
        inner.running.store(false, Ordering::SeqCst);
        drop(inner.sender);
        let _ = inner.worker.join();
    }

    /// Get a copy of the current log config.
    pub fn config() -> Option<LogConfig> {
        let guard = LOG_QUEUE.read();
        guard.as_ref().map(|inner| inner.config.read().clone())
    }
}

/// Send a log entry to the queue (non-blocking, drops if full).
#[inline]
pub fn log_entry(entry: LogEntry) {
    let guard = LOG_QUEUE.read();
    if let Some(ref inner) = *guard {
        let cfg = inner.config.read();
        if entry.level < cfg.level {
            return;
        }
        if let Some(target) = entry.target.as_deref() {
            if cfg.should_skip_target(target) {
                return;
            }
        }
        drop(cfg);
        // Never block the caller: a full queue drops the line
        let _ = inner.sender.try_send(entry);
    }
}

/// Consumer thread: drains the queue and writes to stderr.
fn log_consumer(receiver: Receiver<LogEntry>, config: Arc<RwLock<LogConfig>>, running: Arc<AtomicBool>) {
    use std::io::Write;

    let stderr = std::io::stderr();

    while running.load(Ordering::SeqCst) {
        match receiver.recv_timeout(std::time::Duration::from_millis(100)) {
            Ok(entry) => {
                let cfg = config.read();
                if entry.level >= cfg.level {
                    let line = entry.format_line(cfg.color);
                    let mut handle = stderr.lock();
                    let _ = writeln!(handle, "{}", line);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    for entry in receiver.try_iter() {
        let cfg = config.read();
        if entry.level >= cfg.level {
            eprintln!("{}", entry.format_line(cfg.color));
        }
    }
}

// ---------------------------------------------------------------------------
// `log` facade backend
// ---------------------------------------------------------------------------

/// Routes `log::info!` and friends into the queue.
struct QueueLogger;

impl log::Log for QueueLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        let guard = LOG_QUEUE.read();
        guard.as_ref().is_some_and(|inner| {
            let cfg = inner.config.read();
            LogLevel::from(metadata.level()) >= cfg.level && !cfg.should_skip_target(metadata.target())
        })
    }

    fn log(&self, record: &log::Record<'_>) {
        log_entry(
            LogEntry::new(record.level().into(), record.args().to_string()).with_target(record.target()),
        );
    }

    fn flush(&self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("failed to start logger thread: {0}")]
    Thread(#[from] std::io::Error),
    #[error("a logger is already installed")]
    AlreadySet(#[from] log::SetLoggerError),
}

/// Start the queue and install it as the `log` backend.
pub fn init(config: LogConfig) -> Result<(), LogInitError> {
    let level = config.level.to_filter();
    LogQueue::init(config)?;
    log::set_boxed_logger(Box::new(QueueLogger))?;
    log::set_max_level(level);
    Ok(())
}
