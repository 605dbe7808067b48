//! fakemtpd: an SMTP daemon that talks like a mail server and accepts
//! nothing.
//!
//! A [`connection::Connection`] turns a socket into line events, an
//! [`session::SmtpSession`] or [`control::ControlSession`] answers them, and
//! [`server::Server`] wires the two together for every accepted client.

pub mod config;
pub mod connection;
pub mod context;
pub mod control;
pub mod daemon;
pub mod error;
pub mod server;
pub mod session;
pub mod signals;
pub mod stats;
pub mod timer;
pub mod tls;
pub mod utils;

pub use config::Config;
pub use context::Context;
pub use server::Server;
