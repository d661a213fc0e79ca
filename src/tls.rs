//! TLS acceptor construction from PEM files on disk

use crate::config::TlsCfg;
use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Load a certificate chain and private key into a ready acceptor.
///
/// # Errors
///
/// Returns [`Error::Tls`] if either file is unreadable, contains no
/// usable PEM material, or rustls rejects the pair.
pub fn load_acceptor(cfg: &TlsCfg) -> Result<TlsAcceptor> {
    let certs = load_certs(&cfg.certfile)?;
    let key = load_key(&cfg.keyfile)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("bad cert/key pair: {e}")))?;

    info!(
        "Loaded TLS certificate {} / key {}",
        cfg.certfile.display(),
        cfg.keyfile.display()
    );
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("cannot open certfile {}: {e}", path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::Tls(format!("bad certfile {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("cannot open keyfile {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("bad keyfile {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}
