#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use fakemtpd::config::Config;
use fakemtpd::context::Context;
use fakemtpd::server::Server;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub struct Harness {
    pub smtp: SocketAddr,
    pub control: SocketAddr,
    pub ctx: Arc<Context>,
    pub server: JoinHandle<anyhow::Result<()>>,
}

pub fn test_config() -> Config {
    Config {
        hostname: "mock_hostname".to_string(),
        address: "127.0.0.1".to_string(),
        ..Config::default()
    }
}

pub async fn start(config: Config, tls: Option<TlsAcceptor>) -> Harness {
    let smtp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let smtp_addr = smtp.local_addr().unwrap();
    let control_addr = control.local_addr().unwrap();

    let ctx = Arc::new(Context::with_tls(config, tls));
    let server_ctx = ctx.clone();
    let server = tokio::spawn(async move {
        Server::new(server_ctx).run(smtp, Some(control)).await
    });

    Harness {
        smtp: smtp_addr,
        control: control_addr,
        ctx,
        server,
    }
}

/// A self-signed certificate for `localhost`: the server's acceptor and the
/// DER a client should trust.
pub fn self_signed() -> (TlsAcceptor, rustls::Certificate) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let der = rustls::Certificate(cert.serialize_der().unwrap());
    let acceptor = fakemtpd::tls::acceptor_from_der(
        vec![der.clone()],
        rustls::PrivateKey(cert.serialize_private_key_der()),
    )
    .unwrap();
    (acceptor, der)
}

pub struct Client<S> {
    pub stream: BufReader<S>,
}

impl Client<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Self {
        Client {
            stream: BufReader::new(TcpStream::connect(addr).await.unwrap()),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub fn wrap(stream: S) -> Self {
        Client {
            stream: BufReader::new(stream),
        }
    }

    pub async fn send(&mut self, line: &str) {
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\r\n").await.unwrap();
        stream.flush().await.unwrap();
    }

    /// One reply line including its terminator; empty at EOF.
    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.unwrap();
        line
    }

    pub async fn chat(&mut self, line: &str) -> String {
        self.send(line).await;
        self.line().await
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

/// Run the client side of the handshake after `220 Ready to start TLS`.
pub async fn upgrade(
    client: Client<TcpStream>,
    cert: &rustls::Certificate,
) -> Client<TlsStream<TcpStream>> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).unwrap();
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let name = rustls::ServerName::try_from("localhost").unwrap();
    let stream = connector.connect(name, client.into_inner()).await.unwrap();
    Client::wrap(stream)
}
