//! Error types for configuration and statistics

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0} path must be absolute")]
    NotAbsolute(&'static str),

    #[error("cannot specify a certificate without a key, or vice versa")]
    UnpairedTls,

    #[error("cannot daemonize without a pid file")]
    DaemonWithoutPidFile,

    #[error("cannot use logging method 'file' without a log file")]
    FileLoggingWithoutLogFile,

    #[error("smtp_ver must be one of (SMTP, ESMTP), got '{0}'")]
    BadSmtpVersion(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StatsError {
    #[error("stat '{0}' cannot be incremented")]
    NotIncrementable(&'static str),

    #[error("stat '{0}' cannot be set")]
    NotSettable(&'static str),
}
