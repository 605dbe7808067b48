//! Daemon configuration
//!
//! Every parameter is declared once on [`Config`] with its default. Values
//! come from the defaults, then an optional YAML file, then the command line.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmtpVersion {
    #[serde(rename = "SMTP")]
    Smtp,
    #[serde(rename = "ESMTP")]
    Esmtp,
}

impl fmt::Display for SmtpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SmtpVersion::Smtp => "SMTP",
            SmtpVersion::Esmtp => "ESMTP",
        })
    }
}

impl FromStr for SmtpVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SMTP" => Ok(SmtpVersion::Smtp),
            "ESMTP" => Ok(SmtpVersion::Esmtp),
            other => Err(ConfigError::BadSmtpVersion(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMethod {
    Stderr,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub address: String,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Name announced in the greeting and replies.
    pub hostname: String,
    pub verbose: bool,
    /// Product name announced in the greeting.
    pub mtd: String,
    pub smtp_ver: SmtpVersion,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Inactivity timeout in seconds; 0 disables it.
    pub timeout: u64,
    pub daemonize: bool,
    pub pid_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub logging_method: LoggingMethod,
    /// Port for the control interface; disabled when unset.
    pub control_port: Option<u16>,
    pub control_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 25,
            address: "0.0.0.0".to_string(),
            user: None,
            group: None,
            hostname: system_hostname(),
            verbose: false,
            mtd: "FakeMTPD".to_string(),
            smtp_ver: SmtpVersion::Smtp,
            tls_cert: None,
            tls_key: None,
            timeout: 30,
            daemonize: false,
            pid_file: None,
            log_file: None,
            logging_method: LoggingMethod::Stderr,
            control_port: None,
            control_address: "127.0.0.1".to_string(),
        }
    }
}

impl Config {
    /// Load a YAML file. Keys it does not mention keep their defaults and
    /// unknown keys are ignored.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Check cross-field constraints. Configuring TLS implies ESMTP.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.pid_file.as_deref().is_some_and(|p| !p.is_absolute()) {
            return Err(ConfigError::NotAbsolute("PID file"));
        }
        if self.log_file.as_deref().is_some_and(|p| !p.is_absolute()) {
            return Err(ConfigError::NotAbsolute("log file"));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::UnpairedTls);
        }
        if self.tls_enabled() {
            self.smtp_ver = SmtpVersion::Esmtp;
        }
        if self.daemonize && self.pid_file.is_none() {
            return Err(ConfigError::DaemonWithoutPidFile);
        }
        if self.logging_method == LoggingMethod::File && self.log_file.is_none() {
            return Err(ConfigError::FileLoggingWithoutLogFile);
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub fn smtp_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn control_addr(&self) -> Option<String> {
        self.control_port
            .map(|port| format!("{}:{}", self.control_address, port))
    }
}

fn system_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes and gethostname
    // writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..end]) {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "localhost".to_string(),
    }
}
