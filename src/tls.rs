use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

/// Build the STARTTLS acceptor from a PEM certificate chain and private key.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("Failed to open certificate: {:?}", cert_path))?;
    let cert_chain: Vec<Certificate> = certs(&mut BufReader::new(cert_file))
        .map_err(|_| anyhow!("Failed to parse certificate {:?}", cert_path))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(anyhow!("No certificate found in {:?}", cert_path));
    }

    let key = read_private_key(key_path)?;
    acceptor_from_der(cert_chain, key)
}

pub fn acceptor_from_der(cert_chain: Vec<Certificate>, key: PrivateKey) -> Result<TlsAcceptor> {
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| anyhow!("Failed to build TLS config: {}", e))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

// PKCS#8 first, then the older PKCS#1 "RSA PRIVATE KEY" form.
fn read_private_key(key_path: &Path) -> Result<PrivateKey> {
    let pem = std::fs::read(key_path)
        .with_context(|| format!("Failed to open private key: {:?}", key_path))?;

    let mut keys = pkcs8_private_keys(&mut pem.as_slice())
        .map_err(|_| anyhow!("Failed to parse private key {:?}", key_path))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut pem.as_slice())
            .map_err(|_| anyhow!("Failed to parse private key {:?}", key_path))?;
    }
    if keys.is_empty() {
        return Err(anyhow!("No private key found in {:?}", key_path));
    }
    Ok(PrivateKey(keys.remove(0)))
}
