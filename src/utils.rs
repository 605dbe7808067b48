use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriter};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LoggingMethod};

/// Escape control and non-ASCII characters so client input cannot mangle a
/// log line.
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            '\t' => result.push_str("\\t"),
            '\x01'..='\x1f' | '\x7f' => {
                let _ = write!(result, "\\x{:02x}", c as u32);
            }
            _ if c.is_ascii() => result.push(c),
            _ => {
                let _ = write!(result, "\\u{{{:x}}}", c as u32);
            }
        }
    }
    result
}

struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Append-mode log file that can be reopened after rotation.
#[derive(Clone)]
pub struct LogFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl LogFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(open_append(path)?)),
        })
    }

    pub fn reopen(&self) -> io::Result<()> {
        let fresh = open_append(&self.path)?;
        *self.file.lock().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A writer for the subscriber that follows [`LogFile::reopen`].
    pub fn writer(&self) -> LogWriter {
        LogWriter(self.file.clone())
    }
}

/// Hands the subscriber whichever file is current.
#[derive(Clone)]
pub struct LogWriter(Arc<Mutex<File>>);

pub struct LogGuard<'a>(MutexGuard<'a, File>);

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogGuard(self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl io::Write for LogGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut *self.0, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut *self.0)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global tracing subscriber. Returns the log file, if logging
/// goes to one, so the caller can reopen it on SIGHUP.
pub fn init_logging(config: &Config) -> anyhow::Result<Option<LogFile>> {
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, log_file, ansi) = match (&config.logging_method, &config.log_file) {
        (LoggingMethod::File, Some(path)) => {
            let log_file = LogFile::open(path)?;
            (BoxMakeWriter::new(log_file.writer()), Some(log_file), false)
        }
        _ => (BoxMakeWriter::new(io::stderr), None, true),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTime)
        .with_writer(writer)
        .with_ansi(ansi)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))?;
    Ok(log_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_characters() {
        assert_eq!(safe_log_string("HELO a.com"), "HELO a.com");
        assert_eq!(safe_log_string("a\r\nb"), "a\\r\\nb");
        assert_eq!(safe_log_string("\0\x1b[31m"), "\\0\\x1b[31m");
        assert_eq!(safe_log_string("caf\u{e9}"), "caf\\u{e9}");
    }

    #[test]
    fn log_file_reopens_after_rotation() {
        let dir = std::env::temp_dir().join(format!("fakemtpd-log-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fakemtpd.log");
        let rotated = dir.join("fakemtpd.log.1");

        let log = LogFile::open(&path).unwrap();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(log.writer())
            .with_ansi(false)
            .without_time()
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("before rotation");
            std::fs::rename(&path, &rotated).unwrap();
            log.reopen().unwrap();
            tracing::info!("after rotation");
        });

        let current = std::fs::read_to_string(log.path()).unwrap();
        let old = std::fs::read_to_string(&rotated).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        assert!(old.contains("before rotation"));
        assert!(!old.contains("after rotation"));
        assert!(current.contains("after rotation"));
        assert!(!current.contains("before rotation"));
    }
}
