//! Orchestrator: from a parsed [`Config`] to running listeners
//!
//! Compiles the router once, parses the user table, resolves each
//! listener's TLS material and host, and binds everything up front;
//! binding first means ephemeral ports are visible to callers (and
//! tests) before anything runs. All listeners then run together, and
//! the first to terminate takes the process down with it.

use crate::config::{Config, ServerCfg, TlsMode};
use crate::error::{Error, Result};
use crate::pop3::{PopServer, SharedState, build_user_table};
use crate::router::Router;
use crate::smtp::{SmtpOpts, SmtpServer};
use crate::tls;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Every listener the configuration asked for, bound and ready.
pub struct Servers {
    pub pop: Vec<PopServer>,
    pub smtp: Vec<SmtpServer>,
}

impl Servers {
    /// Compile shared state and bind all configured listeners.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid routing or user tables, unusable
    /// TLS material, a STARTTLS listener without TLS, or a bind
    /// failure.
    pub async fn bind(cfg: &Config) -> Result<Self> {
        let router = Arc::new(Router::compile(cfg)?);
        let state = Arc::new(SharedState::new(build_user_table(&cfg.users)?));

        let default_acceptor = match &cfg.default_tls {
            Some(tls_cfg) => {
                info!(
                    "Initializing default tls certfile={} keyfile={}",
                    tls_cfg.certfile.display(),
                    tls_cfg.keyfile.display()
                );
                Some(tls::load_acceptor(tls_cfg)?)
            }
            None => None,
        };

        let resolve_tls = |mode: &TlsMode| -> Result<Option<TlsAcceptor>> {
            match mode {
                TlsMode::Preset(preset) if preset == "default" => Ok(default_acceptor.clone()),
                TlsMode::Preset(preset) if preset == "disable" => Ok(None),
                TlsMode::Preset(preset) => {
                    Err(Error::Config(format!("unknown tls setting {preset:?}")))
                }
                TlsMode::Inline(tls_cfg) => Ok(Some(tls::load_acceptor(tls_cfg)?)),
            }
        };

        let mut pop = Vec::new();
        let mut smtp = Vec::new();

        for scfg in &cfg.servers {
            match scfg {
                ServerCfg::Pop {
                    host,
                    port,
                    tls,
                    timeout_seconds,
                } => {
                    let addr = format!("{}:{port}", cfg.resolve_host(host));
                    let server = PopServer::bind(
                        &addr,
                        cfg.mails_path.clone(),
                        Arc::clone(&state),
                        resolve_tls(tls)?,
                        Duration::from_secs(*timeout_seconds),
                    )
                    .await?;
                    pop.push(server);
                }

                ServerCfg::SmtpStarttls {
                    host,
                    port,
                    tls,
                    require_starttls,
                    smtputf8,
                } => {
                    let Some(acceptor) = resolve_tls(tls)? else {
                        return Err(Error::Config(
                            "smtp_starttls listener requires a TLS context".to_string(),
                        ));
                    };
                    let addr = format!("{}:{port}", cfg.resolve_host(host));
                    let opts = Arc::new(SmtpOpts {
                        mails_path: cfg.mails_path.clone(),
                        router: Arc::clone(&router),
                        smtputf8: *smtputf8,
                    });
                    let server =
                        SmtpServer::bind_starttls(&addr, opts, acceptor, *require_starttls).await?;
                    smtp.push(server);
                }

                ServerCfg::Smtp {
                    host,
                    port,
                    tls,
                    smtputf8,
                } => {
                    let addr = format!("{}:{port}", cfg.resolve_host(host));
                    let opts = Arc::new(SmtpOpts {
                        mails_path: cfg.mails_path.clone(),
                        router: Arc::clone(&router),
                        smtputf8: *smtputf8,
                    });
                    // With TLS the handshake wraps the socket before the
                    // first byte; without it this is the plain acceptor.
                    let server = match resolve_tls(tls)? {
                        Some(acceptor) => {
                            SmtpServer::bind_implicit_tls(&addr, opts, acceptor).await?
                        }
                        None => SmtpServer::bind_plain(&addr, opts).await?,
                    };
                    smtp.push(server);
                }
            }
        }

        Ok(Self { pop, smtp })
    }

    /// Run every listener until the first one terminates.
    ///
    /// # Errors
    ///
    /// Returns the error of the listener that terminated first, if it
    /// failed.
    pub async fn run(self) -> Result<()> {
        let mut listeners: Vec<BoxFuture<'static, Result<()>>> = Vec::new();
        for server in self.pop {
            listeners.push(Box::pin(server.run()));
        }
        for server in self.smtp {
            listeners.push(Box::pin(server.run()));
        }

        if listeners.is_empty() {
            warn!("Nothing to do!");
            return Ok(());
        }

        let (result, _, _) = futures::future::select_all(listeners).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pwhash;

    fn base_config(servers_json: &str) -> Config {
        let hash = pwhash::gen_pwhash("pw");
        Config::from_json(&format!(
            r#"{{
                "mails_path": "/tmp/solomail-test-mails",
                "default_host": "127.0.0.1",
                "users": [{{"username": "u", "password_hash": "{hash}", "mbox": "u_mails"}}],
                "boxes": [{{"name": "u_mails", "rules": [{{"match_name": "default_match_all"}}]}}],
                "servers": {servers_json}
            }}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn binds_listeners_on_ephemeral_ports() {
        let cfg = base_config(
            r#"[
                {"server_type": "pop", "port": 0, "tls": "disable"},
                {"server_type": "smtp", "port": 0, "tls": "disable"}
            ]"#,
        );
        let servers = Servers::bind(&cfg).await.unwrap();
        assert_eq!(servers.pop.len(), 1);
        assert_eq!(servers.smtp.len(), 1);
        assert_ne!(servers.pop[0].local_addr().unwrap().port(), 0);
        assert_ne!(servers.smtp[0].local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn starttls_without_tls_context_is_fatal() {
        let cfg = base_config(r#"[{"server_type": "smtp_starttls", "port": 0, "tls": "disable"}]"#);
        assert!(matches!(Servers::bind(&cfg).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn starttls_with_unset_default_tls_is_fatal() {
        let cfg = base_config(r#"[{"server_type": "smtp_starttls", "port": 0}]"#);
        assert!(Servers::bind(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn unknown_tls_preset_is_fatal() {
        let cfg = base_config(r#"[{"server_type": "pop", "port": 0, "tls": "maybe"}]"#);
        assert!(Servers::bind(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn empty_server_list_runs_to_completion() {
        let cfg = base_config("[]");
        let servers = Servers::bind(&cfg).await.unwrap();
        servers.run().await.unwrap();
    }
}
