use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::stats::Stats;
use crate::tls;

/// Everything the sessions and the acceptor share, built once at startup.
pub struct Context {
    pub config: Config,
    pub stats: Stats,
    tls: Option<Arc<TlsAcceptor>>,
    stop: watch::Sender<bool>,
}

impl Context {
    /// Loads the TLS certificate when one is configured.
    pub fn new(config: Config) -> Result<Self> {
        let tls = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
            _ => None,
        };
        Ok(Self::with_tls(config, tls))
    }

    pub fn with_tls(config: Config, tls: Option<TlsAcceptor>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            stats: Stats::new(),
            tls: tls.map(Arc::new),
            stop,
        }
    }

    /// The STARTTLS acceptor, if TLS is configured.
    pub fn tls(&self) -> Option<&Arc<TlsAcceptor>> {
        self.tls.as_ref()
    }

    /// Ask the server to stop accepting and shut down.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}
