//! Operator interface on its own listener: `help`, `quit`, `shutdown` and
//! `stats`.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::{ConnEvent, Connection, Link};
use crate::context::Context;
use crate::stats::Stat;
use crate::utils::safe_log_string;

const HELP: &str = "\
fakemtpd control interface

lets you do all sorts of neat things to control fakemtpd

commands:
    help            prints this help
    quit            disconnect from the interface
    shutdown        shut down fakemtpd immediately
    stats           show statistics

";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Help,
    Quit,
    Shutdown,
    Stats,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        [
            ("help", Command::Help),
            ("quit", Command::Quit),
            ("shutdown", Command::Shutdown),
            ("stats", Command::Stats),
        ]
        .into_iter()
        .find(|(word, _)| {
            line.get(..word.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(word))
        })
        .map(|(_, command)| command)
    }
}

pub struct ControlSession {
    ctx: Arc<Context>,
}

impl ControlSession {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn attach(self, conn: &mut Connection) {
        let session = Arc::new(self);

        let s = session.clone();
        conn.on(ConnEvent::Connected, move |_, _| {
            s.ctx.stats.increment(Stat::LifetimeControlSessions)?;
            Ok(())
        });
        let s = session.clone();
        conn.on(ConnEvent::Data, move |link, line| s.handle_line(link, line));
        conn.on(ConnEvent::Timeout, move |link, _| {
            session.print_timeout(link);
            Ok(())
        });
    }

    pub fn handle_line(&self, link: &mut Link, raw: &[u8]) -> anyhow::Result<()> {
        let line = String::from_utf8_lossy(raw);
        match Command::parse(&line) {
            Some(Command::Help) => link.write(HELP),
            Some(Command::Quit) => link.close(),
            Some(Command::Shutdown) => {
                warn!(peer = %link.peer(), "shutting down via control socket");
                self.ctx.stop();
            }
            Some(Command::Stats) => {
                let mut json = serde_json::to_string(&self.ctx.stats.snapshot())?;
                json.push('\n');
                link.write(json);
            }
            None => debug!(
                peer = %link.peer(),
                "ignoring control input {}",
                safe_log_string(line.trim_end())
            ),
        }
        Ok(())
    }

    fn print_timeout(&self, link: &mut Link) {
        link.write_and_close("Timeout exceeded, good bye\n");
    }
}
