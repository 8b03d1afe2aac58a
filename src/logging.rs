use crate::config::{LogFormat, LoggingConfig};
use crate::error::ProxyError;
use chrono::{DateTime, Local};
use hyper::{Method, Response, Uri};
use log::{Level, LevelFilter, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

/// Timestamp layout used inside request log lines.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn timestamp() -> String {
    format_timestamp(Local::now())
}

pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Destination for request and response records.
///
/// Handlers receive this as an injected capability instead of writing to the
/// process-wide logger, so tests can observe exactly what a request logged.
pub trait ProxyLog: Send + Sync {
    fn write(&self, level: Level, message: &str);
}

/// Forwards records to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeLog;

impl ProxyLog for FacadeLog {
    fn write(&self, level: Level, message: &str) {
        log::log!(target: "hop_proxy::access", level, "{}", message);
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<(Level, String)>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.iter().map(|(_, line)| line.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, line)| line.clone()).collect(),
        }
    }

    pub fn records(&self) -> Vec<(Level, String)> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.lines().iter().filter(|line| line.contains(needle)).count()
    }
}

impl ProxyLog for MemoryLog {
    fn write(&self, level: Level, message: &str) {
        let mut lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.push((level, message.to_string()));
    }
}

/// The parts of an outbound request worth logging.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: Method,
    pub uri: Uri,
    pub remote: SocketAddr,
}

impl RequestSummary {
    pub fn of<B>(req: &hyper::Request<B>, remote: SocketAddr) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            remote,
        }
    }
}

/// Logs an outbound request and, when present, the origin's response.
///
/// One line for the request, one for the status, then one per distinct header
/// name with all of its values.
pub fn log_exchange<B>(log: &dyn ProxyLog, req: &RequestSummary, resp: Option<&Response<B>>) {
    let stamp = timestamp();
    log.write(
        Level::Info,
        &format!("[{}] {} {} {}", stamp, req.method, req.uri, req.remote),
    );

    if let Some(resp) = resp {
        log.write(Level::Info, &format!("[{}] Response Status: {}", stamp, resp.status()));
        for name in resp.headers().keys() {
            let values: Vec<&str> = resp
                .headers()
                .get_all(name)
                .iter()
                .map(|v| v.to_str().unwrap_or("<binary>"))
                .collect();
            log.write(
                Level::Info,
                &format!("[{}] Response Header: {}: {}", stamp, name, values.join(", ")),
            );
        }
    }
}

/// `log::Log` implementation writing every record to the console and to an
/// append-only file.
///
/// All sinks share one lock so a record lands as a whole line on each of them,
/// in the same order everywhere.
pub struct DualSinkLogger {
    level: LevelFilter,
    format: LogFormat,
    sinks: Mutex<Vec<Box<dyn Write + Send>>>,
}

impl DualSinkLogger {
    pub fn new(level: LevelFilter, format: LogFormat, sinks: Vec<Box<dyn Write + Send>>) -> Self {
        Self {
            level,
            format,
            sinks: Mutex::new(sinks),
        }
    }

    /// Stdout plus `path`, which is created if missing and always appended to.
    pub fn open(path: &Path, level: LevelFilter, format: LogFormat) -> Result<Self, ProxyError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(
            level,
            format,
            vec![Box::new(std::io::stdout()), Box::new(file)],
        ))
    }

    pub fn from_config(config: &LoggingConfig) -> Result<Self, ProxyError> {
        Self::open(&config.file, config.level.to_filter(), config.format)
    }

    /// Installs this logger as the process-wide `log` backend.
    pub fn init(self) -> Result<(), ProxyError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    fn format_text(&self, record: &Record) -> String {
        format!(
            "{} [{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        let log_entry = json!({
            "timestamp": Local::now().to_rfc3339(),
            "level": record.level().to_string().to_lowercase(),
            "target": record.target(),
            "message": record.args().to_string(),
        });
        log_entry.to_string()
    }
}

impl log::Log for DualSinkLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut line = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };
        line.push('\n');

        let mut sinks = match self.sinks.lock() {
            Ok(sinks) => sinks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for sink in sinks.iter_mut() {
            let _ = sink.write_all(line.as_bytes());
            let _ = sink.flush();
        }
    }

    fn flush(&self) {
        if let Ok(mut sinks) = self.sinks.lock() {
            for sink in sinks.iter_mut() {
                let _ = sink.flush();
            }
        }
    }
}
