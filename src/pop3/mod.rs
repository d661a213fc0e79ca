//! POP3 server
//!
//! A listener binds first (so tests and logs can see the ephemeral
//! port) and then accepts forever, one task per connection. TLS, when
//! configured, wraps the socket before the first protocol byte.
//!
//! Module layout mirrors the protocol split:
//! - `command` -- line lexer and reply formatters
//! - `session` -- the AUTH/TRANSACTION/UPDATE state machine

pub mod command;
pub mod session;

pub use session::{SharedState, UserRecord, build_user_table};

use crate::error::Result;
use session::SessionOpts;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// A bound POP3 listener.
pub struct PopServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    opts: SessionOpts,
}

impl PopServer {
    /// Bind a POP3 listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        addr: &str,
        mails_path: PathBuf,
        state: Arc<SharedState>,
        tls: Option<TlsAcceptor>,
        timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "POP3 listening on {} (tls: {})",
            listener.local_addr()?,
            tls.is_some()
        );
        Ok(Self {
            listener,
            tls,
            opts: SessionOpts {
                mails_path,
                state,
                timeout,
            },
        })
    }

    /// The bound local address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has gone away.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    ///
    /// # Errors
    ///
    /// Returns an error when accepting fails unrecoverably.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let tls = self.tls.clone();
            let opts = self.opts.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            session::run_connection(tls_stream, peer, opts).await;
                        }
                        Err(e) => {
                            warn!("TLS handshake with {} failed: {}", peer, e);
                        }
                    },
                    None => {
                        session::run_connection(stream, peer, opts).await;
                    }
                }
            });
        }
    }
}
