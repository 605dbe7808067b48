//! The SMTP side of a connection.
//!
//! Speaks enough SMTP to look like a real MTA and refuses every recipient.
//! The session never touches the socket: it subscribes to a [`Connection`]'s
//! events and answers through the [`Link`] each callback receives.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use tracing::debug;

use crate::connection::{ConnEvent, Connection, Link};
use crate::context::Context;
use crate::stats::Stat;
use crate::utils::safe_log_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SmtpState {
    Disconnected,
    Connected,
    Helo,
    MailFrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetingMode {
    Helo,
    Ehlo,
}

/// The transaction in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
}

pub struct SmtpSession {
    ctx: Arc<Context>,
    state: SmtpState,
    mode: GreetingMode,
    envelope: Envelope,
    remote: String,
    encrypted: bool,
    // RFC 3207: after the handshake the client greets again.
    regreet: bool,
}

impl SmtpSession {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            state: SmtpState::Disconnected,
            mode: GreetingMode::Helo,
            envelope: Envelope::default(),
            remote: String::new(),
            encrypted: false,
            regreet: false,
        }
    }

    /// Subscribe to `conn`'s events. The returned handle shares the session
    /// with those callbacks.
    pub fn attach(self, conn: &mut Connection) -> Arc<Mutex<SmtpSession>> {
        let session = Arc::new(Mutex::new(self));

        let s = session.clone();
        conn.prepend(ConnEvent::Connected, move |_, _| lock(&s)?.handle_connect());
        let s = session.clone();
        conn.on(ConnEvent::Connected, move |link, _| {
            lock(&s)?.print_banner(link);
            Ok(())
        });
        let s = session.clone();
        conn.on(ConnEvent::Data, move |link, line| lock(&s)?.handle_line(link, line));
        let s = session.clone();
        conn.on(ConnEvent::Timeout, move |link, _| {
            lock(&s)?.print_timeout(link);
            Ok(())
        });

        session
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    pub fn mode(&self) -> GreetingMode {
        self.mode
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Name the client gave in HELO/EHLO.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn handle_connect(&mut self) -> anyhow::Result<()> {
        self.state = SmtpState::Connected;
        self.ctx.stats.increment(Stat::LifetimeSessions)?;
        Ok(())
    }

    fn print_banner(&self, link: &mut Link) {
        let config = &self.ctx.config;
        self.reply(
            link,
            &format!("220 {} {} {}", config.hostname, config.smtp_ver, config.mtd),
        );
    }

    fn print_timeout(&self, link: &mut Link) {
        self.reply_and_close(
            link,
            &format!("421 4.4.2 {} Error: timeout exceeded", self.ctx.config.hostname),
        );
    }

    pub fn handle_line(&mut self, link: &mut Link, raw: &[u8]) -> anyhow::Result<()> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(['\r', '\n']);
        debug!(peer = %link.peer(), ">>> {}", safe_log_string(line));

        if link.is_encrypted() && !self.encrypted {
            self.encrypted = true;
            self.regreet = true;
            self.envelope = Envelope::default();
        }

        if self.handle_any_state(link, line) {
            return Ok(());
        }
        if self.state >= SmtpState::Helo && self.handle_after_helo(link, line) {
            return Ok(());
        }
        let handled = match self.state {
            // Some clients never say HELO; serve them anyway.
            SmtpState::Connected => {
                self.handle_connected(link, line) || self.handle_helo(link, line)
            }
            SmtpState::Helo => {
                (self.regreet && self.handle_connected(link, line)) || self.handle_helo(link, line)
            }
            SmtpState::MailFrom => self.handle_mail_from(link, line),
            SmtpState::Disconnected => false,
        };
        if !handled {
            self.reply(link, "503 5.5.1 Error: commands out of sync or unrecognized");
            self.state = self.fallback_state();
        }
        Ok(())
    }

    fn handle_any_state(&mut self, link: &mut Link, line: &str) -> bool {
        let (verb, _) = split_verb(line);
        if verb.eq_ignore_ascii_case("QUIT") {
            self.reply_and_close(link, "221 2.0.0 Bye");
        } else if verb.eq_ignore_ascii_case("RSET") {
            self.state = self.fallback_state();
            self.envelope = Envelope::default();
            self.reply(link, "250 2.0.0 Ok");
        } else if verb.eq_ignore_ascii_case("NOOP") {
            self.reply(link, "250 2.0.0 Ok");
        } else if verb.eq_ignore_ascii_case("HELP") {
            self.write_help(link);
        } else {
            return false;
        }
        true
    }

    fn handle_after_helo(&mut self, link: &mut Link, line: &str) -> bool {
        let (verb, _) = split_verb(line);
        if !verb.eq_ignore_ascii_case("STARTTLS") {
            return false;
        }
        if self.encrypted {
            self.reply(link, "554 5.5.1 Error: TLS already active");
            return true;
        }
        match (self.ctx.tls(), self.mode) {
            (Some(acceptor), GreetingMode::Ehlo) => {
                let acceptor = acceptor.clone();
                let ctx = self.ctx.clone();
                let reply = "220 2.0.0 Ready to start TLS";
                debug!(peer = %link.peer(), "<<< {}", reply);
                link.write_then(format!("{reply}\r\n"), true, move |link| {
                    link.start_tls(acceptor)?;
                    ctx.stats.increment(Stat::LifetimeTlsSessions)?;
                    Ok(())
                });
            }
            _ => self.reply(
                link,
                "502 5.5.1 STARTTLS not supported in RFC821 mode (meant to say EHLO?)",
            ),
        }
        true
    }

    fn handle_connected(&mut self, link: &mut Link, line: &str) -> bool {
        let (verb, arg) = split_verb(line);
        if arg.is_empty() {
            return false;
        }
        let hostname = &self.ctx.config.hostname;
        if verb.eq_ignore_ascii_case("HELO") {
            self.reply(link, &format!("250 {hostname}"));
            self.mode = GreetingMode::Helo;
        } else if verb.eq_ignore_ascii_case("EHLO") {
            if self.ctx.tls().is_some() && !self.encrypted {
                self.reply(link, &format!("250-{hostname}"));
                self.reply(link, "250 STARTTLS");
            } else {
                self.reply(link, &format!("250 {hostname}"));
            }
            self.mode = GreetingMode::Ehlo;
        } else {
            return false;
        }
        self.remote = arg.to_string();
        self.state = SmtpState::Helo;
        self.regreet = false;
        true
    }

    fn handle_helo(&mut self, link: &mut Link, line: &str) -> bool {
        let (verb, arg) = split_verb(line);
        if verb.eq_ignore_ascii_case("MAIL") {
            let Some(sender) = bracketed(arg, "FROM:") else {
                return false;
            };
            self.envelope = Envelope {
                mail_from: Some(sender.to_string()),
                rcpt_to: Vec::new(),
            };
            self.reply(link, "250 2.1.0 Ok");
            self.state = SmtpState::MailFrom;
        } else if verb.eq_ignore_ascii_case("VRFY") && !arg.is_empty() {
            self.reply(link, "502 5.5.1 VRFY command is disabled");
            self.state = self.fallback_state();
        } else if verb.eq_ignore_ascii_case("EXPN") {
            self.reply(link, "502 5.5.1 EXPN command is disabled");
            self.state = self.fallback_state();
        } else {
            return false;
        }
        true
    }

    fn handle_mail_from(&mut self, link: &mut Link, line: &str) -> bool {
        let (verb, arg) = split_verb(line);
        if verb.eq_ignore_ascii_case("RCPT") {
            let Some(recipient) = bracketed(arg, "TO:") else {
                return false;
            };
            self.envelope.rcpt_to.push(recipient.to_string());
            let sender = self.envelope.mail_from.as_deref().unwrap_or_default();
            self.reply(link, &format!("554 5.7.1 <{sender}>: Relay access denied"));
        } else if verb.eq_ignore_ascii_case("DATA") {
            self.reply(link, "502 5.5.1 DATA command is disabled");
        } else if verb.eq_ignore_ascii_case("MAIL") && bracketed(arg, "FROM:").is_some() {
            self.envelope = Envelope::default();
            self.reply(link, "503 5.5.1 Error: nested MAIL command");
        } else {
            return false;
        }
        self.state = SmtpState::Helo;
        true
    }

    fn write_help(&self, link: &mut Link) {
        let mut commands = vec![
            "HELO",
            "EHLO",
            "HELP",
            "NOOP",
            "QUIT",
            "MAIL FROM:<address>",
            "RCPT TO:<address>",
            "DATA",
            "VRFY",
            "EXPN",
            "RSET",
        ];
        if self.ctx.tls().is_some() {
            commands.push("STARTTLS");
        }
        for command in commands {
            self.reply(link, &format!("250-HELP {command}"));
        }
        self.reply(link, "250 HELP Ok");
    }

    /// Where a reset or an unrecognized command leaves us: never below HELO
    /// once greeted.
    fn fallback_state(&self) -> SmtpState {
        if self.state >= SmtpState::Helo {
            SmtpState::Helo
        } else {
            SmtpState::Connected
        }
    }

    fn reply(&self, link: &mut Link, text: &str) {
        debug!(peer = %link.peer(), "<<< {}", text);
        link.write(format!("{text}\r\n"));
    }

    fn reply_and_close(&self, link: &mut Link, text: &str) {
        debug!(peer = %link.peer(), "<<< {}", text);
        link.write_and_close(format!("{text}\r\n"));
    }
}

fn lock(session: &Mutex<SmtpSession>) -> anyhow::Result<MutexGuard<'_, SmtpSession>> {
    session
        .lock()
        .map_err(|_| anyhow!("smtp session state poisoned"))
}

/// Split off the command verb; the argument has leading whitespace removed.
fn split_verb(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(at) => (&line[..at], line[at..].trim_start()),
        None => (line, ""),
    }
}

/// `FROM:<addr>` / `TO: <addr>` → `addr`. The keyword is case-insensitive
/// and the address runs to the last `>`.
fn bracketed<'a>(arg: &'a str, keyword: &str) -> Option<&'a str> {
    let head = arg.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = arg[keyword.len()..].trim_start().strip_prefix('<')?;
    let address = &rest[..rest.rfind('>')?];
    (!address.is_empty()).then_some(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tls::acceptor_from_der;

    fn config() -> Config {
        Config {
            hostname: "mock_hostname".to_string(),
            ..Config::default()
        }
    }

    fn plain_ctx() -> Arc<Context> {
        Arc::new(Context::with_tls(config(), None))
    }

    fn tls_ctx() -> Arc<Context> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let acceptor = acceptor_from_der(
            vec![rustls::Certificate(cert.serialize_der().unwrap())],
            rustls::PrivateKey(cert.serialize_private_key_der()),
        )
        .unwrap();
        let mut config = config();
        config.smtp_ver = crate::config::SmtpVersion::Esmtp;
        Arc::new(Context::with_tls(config, Some(acceptor)))
    }

    fn connected(ctx: Arc<Context>) -> (SmtpSession, Link) {
        let mut session = SmtpSession::new(ctx);
        let mut link = Link::detached();
        session.handle_connect().unwrap();
        session.print_banner(&mut link);
        (session, link)
    }

    fn send(session: &mut SmtpSession, link: &mut Link, line: &str) -> String {
        session.handle_line(link, line.as_bytes()).unwrap();
        link.flush_detached()
    }

    #[test]
    fn greets_and_accepts_helo() {
        let ctx = plain_ctx();
        let (mut session, mut link) = connected(ctx.clone());
        assert_eq!(link.flush_detached(), "220 mock_hostname SMTP FakeMTPD\r\n");
        assert_eq!(session.state(), SmtpState::Connected);
        assert_eq!(ctx.stats.get(Stat::LifetimeSessions), 1);

        assert_eq!(
            send(&mut session, &mut link, "HELO a.com\r"),
            "250 mock_hostname\r\n"
        );
        assert_eq!(session.state(), SmtpState::Helo);
        assert_eq!(session.mode(), GreetingMode::Helo);
        assert_eq!(session.remote(), "a.com");
    }

    #[test]
    fn relay_is_always_denied() {
        let (mut session, mut link) = connected(plain_ctx());
        link.flush_detached();
        send(&mut session, &mut link, "HELO a.com\r");

        assert_eq!(
            send(&mut session, &mut link, "MAIL FROM:<a@b.com>\r"),
            "250 2.1.0 Ok\r\n"
        );
        assert_eq!(session.state(), SmtpState::MailFrom);
        assert_eq!(
            send(&mut session, &mut link, "RCPT TO:<c@d.com>\r"),
            "554 5.7.1 <a@b.com>: Relay access denied\r\n"
        );
        assert_eq!(session.state(), SmtpState::Helo);
        assert_eq!(session.envelope().rcpt_to, ["c@d.com"]);
    }

    #[test]
    fn rset_clears_the_transaction() {
        let (mut session, mut link) = connected(plain_ctx());
        link.flush_detached();
        send(&mut session, &mut link, "HELO a.com\r");
        send(&mut session, &mut link, "MAIL FROM:<a@b.com>\r");

        assert_eq!(send(&mut session, &mut link, "RSET\r"), "250 2.0.0 Ok\r\n");
        assert_eq!(session.state(), SmtpState::Helo);
        assert_eq!(session.envelope(), &Envelope::default());
    }

    #[test]
    fn rset_before_greeting_stays_connected() {
        let (mut session, mut link) = connected(plain_ctx());
        link.flush_detached();
        assert_eq!(send(&mut session, &mut link, "rset\r"), "250 2.0.0 Ok\r\n");
        assert_eq!(session.state(), SmtpState::Connected);
    }

    #[test]
    fn data_and_nested_mail_are_refused() {
        let (mut session, mut link) = connected(plain_ctx());
        link.flush_detached();
        send(&mut session, &mut link, "HELO a.com\r");
        send(&mut session, &mut link, "MAIL FROM:<a@b.com>\r");
        assert_eq!(
            send(&mut session, &mut link, "DATA\r"),
            "502 5.5.1 DATA command is disabled\r\n"
        );
        assert_eq!(session.state(), SmtpState::Helo);

        send(&mut session, &mut link, "MAIL FROM:<a@b.com>\r");
        assert_eq!(
            send(&mut session, &mut link, "mail from: <x@y.com>\r"),
            "503 5.5.1 Error: nested MAIL command\r\n"
        );
        assert_eq!(session.state(), SmtpState::Helo);
        assert_eq!(session.envelope(), &Envelope::default());
    }

    #[test]
    fn vrfy_and_expn_are_disabled() {
        let (mut session, mut link) = connected(plain_ctx());
        link.flush_detached();
        send(&mut session, &mut link, "HELO a.com\r");
        assert_eq!(
            send(&mut session, &mut link, "VRFY <root>\r"),
            "502 5.5.1 VRFY command is disabled\r\n"
        );
        assert_eq!(
            send(&mut session, &mut link, "EXPN staff\r"),
            "502 5.5.1 EXPN command is disabled\r\n"
        );
        assert_eq!(session.state(), SmtpState::Helo);
    }

    #[test]
    fn mail_without_helo_is_tolerated() {
        let (mut session, mut link) = connected(plain_ctx());
        link.flush_detached();
        assert_eq!(
            send(&mut session, &mut link, "MAIL FROM:<a@b.com>\r"),
            "250 2.1.0 Ok\r\n"
        );
        assert_eq!(session.state(), SmtpState::MailFrom);
    }

    #[test]
    fn unknown_or_malformed_commands_are_out_of_sync() {
        let (mut session, mut link) = connected(plain_ctx());
        link.flush_detached();
        assert_eq!(
            send(&mut session, &mut link, "BOGUS\r"),
            "503 5.5.1 Error: commands out of sync or unrecognized\r\n"
        );
        assert_eq!(session.state(), SmtpState::Connected);

        send(&mut session, &mut link, "HELO a.com\r");
        send(&mut session, &mut link, "MAIL FROM:<a@b.com>\r");
        assert_eq!(
            send(&mut session, &mut link, "RCPT TO:c@d.com\r"),
            "503 5.5.1 Error: commands out of sync or unrecognized\r\n"
        );
        assert_eq!(session.state(), SmtpState::Helo);
        assert_eq!(
            send(&mut session, &mut link, "MAIL FROM:<>\r"),
            "503 5.5.1 Error: commands out of sync or unrecognized\r\n"
        );
        assert_eq!(session.state(), SmtpState::Helo);
    }

    #[test]
    fn quit_closes_after_reply() {
        let (mut session, mut link) = connected(plain_ctx());
        link.flush_detached();
        session.handle_line(&mut link, b"QUIT\r").unwrap();
        assert!(!link.is_closing());
        assert_eq!(link.flush_detached(), "221 2.0.0 Bye\r\n");
        assert!(link.is_closing());
    }

    #[test]
    fn timeout_replies_and_closes() {
        let (session, mut link) = connected(plain_ctx());
        link.flush_detached();
        session.print_timeout(&mut link);
        assert_eq!(
            link.flush_detached(),
            "421 4.4.2 mock_hostname Error: timeout exceeded\r\n"
        );
        assert!(link.is_closing());
    }

    #[test]
    fn help_lists_commands() {
        let (mut session, mut link) = connected(plain_ctx());
        link.flush_detached();
        let help = send(&mut session, &mut link, "HELP\r");
        let lines: Vec<&str> = help.split_terminator("\r\n").collect();
        assert_eq!(lines.first(), Some(&"250-HELP HELO"));
        assert_eq!(lines.last(), Some(&"250 HELP Ok"));
        assert!(lines.contains(&"250-HELP MAIL FROM:<address>"));
        assert!(!lines.contains(&"250-HELP STARTTLS"));
        assert!(lines[..lines.len() - 1].iter().all(|l| l.starts_with("250-")));
    }

    #[test]
    fn ehlo_without_tls_is_a_single_line() {
        let (mut session, mut link) = connected(plain_ctx());
        link.flush_detached();
        assert_eq!(
            send(&mut session, &mut link, "EHLO a.com\r"),
            "250 mock_hostname\r\n"
        );
        assert_eq!(
            send(&mut session, &mut link, "STARTTLS\r"),
            "502 5.5.1 STARTTLS not supported in RFC821 mode (meant to say EHLO?)\r\n"
        );
    }

    #[test]
    fn starttls_requires_ehlo() {
        let (mut session, mut link) = connected(tls_ctx());
        link.flush_detached();
        send(&mut session, &mut link, "HELO a.com\r");
        assert_eq!(
            send(&mut session, &mut link, "STARTTLS\r"),
            "502 5.5.1 STARTTLS not supported in RFC821 mode (meant to say EHLO?)\r\n"
        );
        assert!(!link.upgrade_requested());
    }

    #[test]
    fn starttls_upgrade_then_already_active() {
        let ctx = tls_ctx();
        let (mut session, mut link) = connected(ctx.clone());
        assert_eq!(
            link.flush_detached(),
            "220 mock_hostname ESMTP FakeMTPD\r\n"
        );
        assert_eq!(
            send(&mut session, &mut link, "EHLO a.com\r"),
            "250-mock_hostname\r\n250 STARTTLS\r\n"
        );

        session.handle_line(&mut link, b"STARTTLS\r").unwrap();
        assert!(!link.upgrade_requested());
        assert_eq!(link.flush_detached(), "220 2.0.0 Ready to start TLS\r\n");
        assert!(link.upgrade_requested());
        assert_eq!(ctx.stats.get(Stat::LifetimeTlsSessions), 1);

        link.set_encrypted();
        assert_eq!(
            send(&mut session, &mut link, "STARTTLS\r"),
            "554 5.5.1 Error: TLS already active\r\n"
        );
        assert!(session.is_encrypted());

        // Clients greet again inside the tunnel; STARTTLS is no longer offered.
        assert_eq!(
            send(&mut session, &mut link, "EHLO a.com\r"),
            "250 mock_hostname\r\n"
        );
        assert_eq!(session.state(), SmtpState::Helo);
    }

    #[test]
    fn parses_bracketed_addresses() {
        assert_eq!(bracketed("FROM:<a@b.com>", "FROM:"), Some("a@b.com"));
        assert_eq!(bracketed("from: <a@b.com> SIZE=10", "FROM:"), Some("a@b.com"));
        assert_eq!(bracketed("FROM:a@b.com", "FROM:"), None);
        assert_eq!(bracketed("FROM:<a@b.com", "FROM:"), None);
        assert_eq!(bracketed("TO:<a@b.com>", "FROM:"), None);
        assert_eq!(bracketed("", "FROM:"), None);
        assert_eq!(split_verb("MAIL   FROM:<x>"), ("MAIL", "FROM:<x>"));
        assert_eq!(split_verb("NOOP"), ("NOOP", ""));
    }
}
