//! SMTP acceptors
//!
//! Three listener flavors share one engine loop and one delivery
//! handler:
//!
//! - plaintext: STARTTLS is not advertised;
//! - STARTTLS: the extension is advertised and `MAIL` is refused until
//!   the connection is upgraded (when `require_starttls` is set);
//! - implicit TLS: the handshake happens before the first byte.
//!
//! The RFC 5321 dialogue itself is `mailin`'s sans-IO state machine:
//! this module reads lines, feeds `Session::process`, and acts on the
//! returned [`mailin::Action`].

pub mod delivery;

pub use delivery::SmtpOpts;

use crate::error::Result;
use delivery::DeliveryHandler;
use mailin::{Action, Session, SessionBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Server name announced in the SMTP greeting.
const SERVER_NAME: &str = "solomail";

#[derive(Clone)]
enum Flavor {
    Plain,
    StartTls {
        acceptor: TlsAcceptor,
        require_starttls: bool,
    },
    ImplicitTls {
        acceptor: TlsAcceptor,
    },
}

/// A bound SMTP listener of one of the three flavors.
pub struct SmtpServer {
    listener: TcpListener,
    flavor: Flavor,
    opts: Arc<SmtpOpts>,
}

impl SmtpServer {
    /// Bind a plaintext SMTP listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind_plain(addr: &str, opts: Arc<SmtpOpts>) -> Result<Self> {
        Self::bind(addr, Flavor::Plain, opts, "plain").await
    }

    /// Bind a STARTTLS SMTP listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind_starttls(
        addr: &str,
        opts: Arc<SmtpOpts>,
        acceptor: TlsAcceptor,
        require_starttls: bool,
    ) -> Result<Self> {
        let flavor = Flavor::StartTls {
            acceptor,
            require_starttls,
        };
        Self::bind(addr, flavor, opts, "starttls").await
    }

    /// Bind an implicit-TLS SMTP listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind_implicit_tls(
        addr: &str,
        opts: Arc<SmtpOpts>,
        acceptor: TlsAcceptor,
    ) -> Result<Self> {
        Self::bind(addr, Flavor::ImplicitTls { acceptor }, opts, "implicit-tls").await
    }

    async fn bind(addr: &str, flavor: Flavor, opts: Arc<SmtpOpts>, label: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "SMTP ({}) listening on {} (smtputf8: {})",
            label,
            listener.local_addr()?,
            opts.smtputf8
        );
        Ok(Self {
            listener,
            flavor,
            opts,
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
            let flavor = self.flavor.clone();
            let opts = Arc::clone(&self.opts);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, flavor, opts).await {
                    debug!("SMTP connection with {} ended: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    flavor: Flavor,
    opts: Arc<SmtpOpts>,
) -> std::io::Result<()> {
    match flavor {
        Flavor::Plain => {
            let tls = Arc::new(AtomicBool::new(false));
            let handler = DeliveryHandler::new(opts, peer, "plain", tls, false);
            let mut session = SessionBuilder::new(SERVER_NAME).build(peer.ip(), handler);
            let mut io = BufReader::new(stream);
            send_response(&mut io, &session.greeting()).await?;
            engine_loop(&mut io, &mut session).await?;
            Ok(())
        }

        Flavor::ImplicitTls { acceptor } => {
            let tls_stream = acceptor.accept(stream).await?;
            let tls = Arc::new(AtomicBool::new(true));
            let handler = DeliveryHandler::new(opts, peer, "plain", tls, false);
            let mut session = SessionBuilder::new(SERVER_NAME).build(peer.ip(), handler);
            let mut io = BufReader::new(tls_stream);
            send_response(&mut io, &session.greeting()).await?;
            engine_loop(&mut io, &mut session).await?;
            Ok(())
        }

        Flavor::StartTls {
            acceptor,
            require_starttls,
        } => {
            let tls = Arc::new(AtomicBool::new(false));
            let handler =
                DeliveryHandler::new(opts, peer, "starttls", Arc::clone(&tls), require_starttls);
            let mut builder = SessionBuilder::new(SERVER_NAME);
            builder.enable_start_tls();
            let mut session = builder.build(peer.ip(), handler);

            // Phase 1: plaintext until the client asks to upgrade.
            let mut io = BufReader::new(stream);
            send_response(&mut io, &session.greeting()).await?;
            match engine_loop(&mut io, &mut session).await? {
                Engine::Closed => return Ok(()),
                Engine::UpgradeRequested => {}
            }

            // Phase 2: TLS handshake on the raw socket.
            let tls_stream = acceptor.accept(io.into_inner()).await?;
            session.tls_active();
            tls.store(true, Ordering::Relaxed);
            debug!("SMTP connection with {} upgraded to TLS", peer);

            // Phase 3: the same dialogue, now encrypted. A second
            // upgrade request is a protocol violation; drop the link.
            let mut io = BufReader::new(tls_stream);
            match engine_loop(&mut io, &mut session).await? {
                Engine::Closed => Ok(()),
                Engine::UpgradeRequested => {
                    warn!("SMTP peer {} requested a second TLS upgrade", peer);
                    Ok(())
                }
            }
        }
    }
}

enum Engine {
    Closed,
    UpgradeRequested,
}

/// Feed lines to the engine until it closes the connection or asks for
/// a TLS upgrade. DATA body lines travel through the same path.
async fn engine_loop<S>(
    io: &mut BufReader<S>,
    session: &mut Session<DeliveryHandler>,
) -> std::io::Result<Engine>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = Vec::with_capacity(1024);
    loop {
        line.clear();
        let n = io.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(Engine::Closed);
        }
        let response = session.process(&line);
        match response.action {
            Action::Reply => send_response(io, &response).await?,
            Action::NoReply => {}
            Action::UpgradeTls => {
                send_response(io, &response).await?;
                return Ok(Engine::UpgradeRequested);
            }
            Action::Close => {
                send_response(io, &response).await?;
                return Ok(Engine::Closed);
            }
        }
    }
}

async fn send_response<S>(io: &mut BufReader<S>, response: &mailin::Response) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    response.write_to(&mut buf)?;
    io.get_mut().write_all(&buf).await?;
    io.get_mut().flush().await
}
