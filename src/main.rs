use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use structopt::StructOpt;
use tracing::{info, warn};

use fakemtpd::config::{Config, LoggingMethod, SmtpVersion};
use fakemtpd::context::Context;
use fakemtpd::daemon::{self, PidFile, Privileges};
use fakemtpd::server::Server;
use fakemtpd::utils::{init_logging, LogFile};

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "fakemtpd",
    about = "A fake SMTP daemon: greets, chats, and refuses every message"
)]
pub struct Opt {
    /// Path to a YAML configuration file (overridden by any conflicting args)
    #[structopt(short = "c", long = "config-path", parse(from_os_str))]
    pub config_path: Option<PathBuf>,

    /// Port to listen on (default: 25)
    #[structopt(short = "p", long = "port")]
    pub port: Option<u16>,

    /// Hostname to report as (default: system hostname)
    #[structopt(short = "H", long = "hostname")]
    pub hostname: Option<String>,

    /// Address to bind to (default: 0.0.0.0)
    #[structopt(short = "B", long = "bind")]
    pub address: Option<String>,

    /// Be more verbose
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Certificate to use for TLS
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// Key to use for TLS
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Print out a config file with all parameters
    #[structopt(long = "gen-config")]
    pub gen_config: bool,

    /// SMTP or ESMTP
    #[structopt(long = "smtp-ver")]
    pub smtp_ver: Option<SmtpVersion>,

    /// Daemonize (must also specify a pid file)
    #[structopt(short = "d", long = "daemonize")]
    pub daemonize: bool,

    /// PID file
    #[structopt(long = "pid-file", parse(from_os_str))]
    pub pid_file: Option<PathBuf>,

    /// File to write logs to (defaults to stderr)
    #[structopt(long = "log-file", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Port for the control interface (disabled by default)
    #[structopt(long = "control-port")]
    pub control_port: Option<u16>,
}

impl Opt {
    /// Layer whatever was given on the command line over `config`.
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(hostname) = &self.hostname {
            config.hostname = hostname.clone();
        }
        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if self.verbose {
            config.verbose = true;
        }
        if let Some(cert) = &self.tls_cert {
            config.tls_cert = Some(cert.clone());
        }
        if let Some(key) = &self.tls_key {
            config.tls_key = Some(key.clone());
        }
        if let Some(smtp_ver) = self.smtp_ver {
            config.smtp_ver = smtp_ver;
        }
        if self.daemonize {
            config.daemonize = true;
        }
        if let Some(pid_file) = &self.pid_file {
            config.pid_file = Some(pid_file.clone());
        }
        if let Some(log_file) = &self.log_file {
            config.log_file = Some(log_file.clone());
            config.logging_method = LoggingMethod::File;
        }
        if let Some(control_port) = self.control_port {
            config.control_port = Some(control_port);
        }
    }
}

fn main() {
    if let Err(e) = run(Opt::from_args()) {
        eprintln!("fakemtpd: {:#}", e);
        std::process::exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    let mut config = match &opt.config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    opt.apply(&mut config);
    config.validate()?;

    if opt.gen_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    let ctx = Arc::new(Context::new(config)?);
    let config = &ctx.config;
    let privileges = Privileges::resolve(config)?;

    // Fail on a held lock before doing anything visible.
    let mut pid_file = match &config.pid_file {
        Some(path) => Some(PidFile::lock(path)?),
        None => None,
    };

    // Bind before daemonizing so that the user sees any errors.
    let smtp = bind(&config.smtp_addr())?;
    let control = config.control_addr().map(|addr| bind(&addr)).transpose()?;

    if let Some(log_file) = &config.log_file {
        privileges.prepare_log_file(log_file)?;
    }

    if config.daemonize {
        // The daemonized child takes the lock over.
        pid_file = None;
        daemon::daemonize(config)?;
    } else {
        if let Some(pid_file) = pid_file.as_mut() {
            pid_file.write_pid()?;
        }
        privileges.apply()?;
    }

    let log_file = init_logging(config)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build the runtime")?;
    let outcome = runtime.block_on(serve(ctx.clone(), smtp, control, log_file));

    info!("Shutting down");
    match &pid_file {
        Some(pid_file) => daemon::remove_pid_file(pid_file.path()),
        None => {
            if let Some(path) = &ctx.config.pid_file {
                daemon::remove_pid_file(path);
            }
        }
    }
    outcome
}

fn bind(addr: &str) -> Result<std::net::TcpListener> {
    let listener =
        std::net::TcpListener::bind(addr).with_context(|| format!("Failed to bind to {}", addr))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

async fn serve(
    ctx: Arc<Context>,
    smtp: std::net::TcpListener,
    control: Option<std::net::TcpListener>,
    log_file: Option<LogFile>,
) -> Result<()> {
    let smtp = tokio::net::TcpListener::from_std(smtp)?;
    let control = control.map(tokio::net::TcpListener::from_std).transpose()?;

    let signals = tokio::spawn(handle_signals(ctx.clone(), log_file));
    let outcome = Server::new(ctx).run(smtp, control).await;
    signals.abort();
    outcome
}

#[cfg(unix)]
async fn handle_signals(ctx: Arc<Context>, log_file: Option<LogFile>) {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = (|| {
        Ok::<_, std::io::Error>((
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::hangup())?,
        ))
    })();
    let (mut int, mut term, mut hup) = match streams {
        Ok(streams) => streams,
        Err(e) => {
            warn!("could not install signal handlers: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = int.recv() => {
                info!("SIGINT received");
                ctx.stop();
            }
            _ = term.recv() => {
                info!("SIGTERM received");
                ctx.stop();
            }
            _ = hup.recv() => {
                if let Some(log_file) = &log_file {
                    info!("re-opening log files");
                    if let Err(e) = log_file.reopen() {
                        warn!("could not reopen {:?}: {}", log_file.path(), e);
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn handle_signals(ctx: Arc<Context>, _log_file: Option<LogFile>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received");
        ctx.stop();
    }
}
