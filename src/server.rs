//! The acceptor: turns accepted sockets into running connections.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnEvent, Connection};
use crate::context::Context;
use crate::control::ControlSession;
use crate::session::SmtpSession;
use crate::stats::Stat;

pub struct Server {
    ctx: Arc<Context>,
    active: Arc<AtomicU64>,
}

impl Server {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            active: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Serve until the context's stop hook fires. Open connections are
    /// aborted on the way out.
    pub async fn run(&self, smtp: TcpListener, control: Option<TcpListener>) -> Result<()> {
        info!("Bound on {}", smtp.local_addr()?);
        if let Some(control) = &control {
            info!("Control interface on {}", control.local_addr()?);
        }

        let mut stopped = self.ctx.stopped();
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                res = smtp.accept() => match res {
                    Ok((stream, peer)) => self.spawn_smtp(&mut tasks, stream, peer),
                    Err(e) => warn!("accept failed: {e}"),
                },
                res = accept_on(control.as_ref()) => match res {
                    Ok((stream, peer)) => self.spawn_control(&mut tasks, stream, peer),
                    Err(e) => warn!("control accept failed: {e}"),
                },
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = res {
                        error!("connection task failed: {e}");
                    }
                }
                _ = stopped.wait_for(|stop| *stop) => break,
            }
        }

        info!(open = tasks.len(), "stopping acceptor");
        tasks.shutdown().await;
        Ok(())
    }

    fn spawn_smtp(&self, tasks: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "smtp connection accepted");
        let mut conn = Connection::new(self.ctx.config.idle_timeout());
        SmtpSession::new(self.ctx.clone()).attach(&mut conn);

        let active = self.active.clone();
        let ctx = self.ctx.clone();
        conn.on(ConnEvent::Closed, move |_, _| {
            let now = active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            ctx.stats.set(Stat::ActiveSessions, now)?;
            Ok(())
        });
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(e) = self.ctx.stats.set(Stat::ActiveSessions, now) {
            warn!("{e}");
        }

        conn.connect(stream, peer);
        tasks.spawn(conn.run());
    }

    fn spawn_control(&self, tasks: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "control connection accepted");
        let mut conn = Connection::new(self.ctx.config.idle_timeout());
        ControlSession::new(self.ctx.clone()).attach(&mut conn);
        conn.connect(stream, peer);
        tasks.spawn(conn.run());
    }
}

// Never resolves without a listener.
async fn accept_on(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
