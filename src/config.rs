//! Server configuration
//!
//! The whole deployment is described by one JSON document: where mail
//! lives on disk, the TLS material, the routing tables (`matches` +
//! `boxes`), the POP3 user table, and the set of listeners to run.
//! Listener entries are tagged by `server_type`, one enum variant per
//! listener flavor.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Reserved match name that accepts every address.
pub const DEFAULT_MATCH_ALL: &str = "default_match_all";

/// Reserved mailbox name meaning "matched, but do not deliver".
pub const DEFAULT_NULL_MBOX: &str = "default_null_mbox";

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mails_path: PathBuf,

    #[serde(default)]
    pub default_tls: Option<TlsCfg>,

    #[serde(default = "default_host")]
    pub default_host: String,

    #[serde(default)]
    pub logging: LogCfg,

    #[serde(default)]
    pub matches: Vec<MatchCfg>,

    #[serde(default)]
    pub boxes: Vec<MboxCfg>,

    #[serde(default)]
    pub users: Vec<UserCfg>,

    #[serde(default)]
    pub servers: Vec<ServerCfg>,
}

impl Config {
    /// Parse a configuration from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the document is not valid JSON or
    /// does not match the schema.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read and parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Resolve a listener host, mapping `"default"` to `default_host`.
    #[must_use]
    pub fn resolve_host<'a>(&'a self, host: &'a str) -> &'a str {
        if host == "default" { &self.default_host } else { host }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// TLS certificate/key pair on disk (PEM).
#[derive(Debug, Clone, Deserialize)]
pub struct TlsCfg {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
}

/// Logging sink and level.
#[derive(Debug, Clone, Deserialize)]
pub struct LogCfg {
    /// `"CONSOLE"` or a file path.
    #[serde(default = "default_logfile")]
    pub logfile: String,

    /// A `tracing` level or filter directive, e.g. `"INFO"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogCfg {
    fn default() -> Self {
        Self {
            logfile: default_logfile(),
            level: default_log_level(),
        }
    }
}

fn default_logfile() -> String {
    "CONSOLE".to_string()
}

fn default_log_level() -> String {
    "INFO".to_string()
}

/// Named address predicate: an exact set or a list of regexes.
///
/// Exactly one of `addrs` / `addr_rexs` must be non-empty; the router
/// rejects anything else at compile time.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchCfg {
    pub name: String,

    #[serde(default)]
    pub addrs: Vec<String>,

    #[serde(default)]
    pub addr_rexs: Vec<String>,
}

/// One step in a mailbox's rule chain.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleCfg {
    pub match_name: String,

    #[serde(default)]
    pub negate: bool,

    /// Do not process further rules once this one matches.
    #[serde(default)]
    pub stop_check: bool,
}

/// A mailbox and the ordered rules that route mail into it.
#[derive(Debug, Clone, Deserialize)]
pub struct MboxCfg {
    pub name: String,
    pub rules: Vec<RuleCfg>,
}

/// A POP3 user: credentials plus the Maildir directory they read.
#[derive(Debug, Clone, Deserialize)]
pub struct UserCfg {
    pub username: String,
    pub password_hash: String,
    pub mbox: String,
}

/// Per-listener TLS selection: the shared default context, disabled, or
/// an inline certificate/key pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TlsMode {
    Preset(String),
    Inline(TlsCfg),
}

impl Default for TlsMode {
    fn default() -> Self {
        Self::Preset("default".to_string())
    }
}

/// One listener, tagged by `server_type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "server_type", rename_all = "snake_case")]
pub enum ServerCfg {
    Pop {
        #[serde(default = "default_listen_host")]
        host: String,

        #[serde(default = "default_pop_port")]
        port: u16,

        #[serde(default)]
        tls: TlsMode,

        #[serde(default = "default_pop_timeout")]
        timeout_seconds: u64,
    },

    SmtpStarttls {
        #[serde(default = "default_listen_host")]
        host: String,

        #[serde(default = "default_smtp_port")]
        port: u16,

        #[serde(default)]
        tls: TlsMode,

        #[serde(default = "default_true")]
        require_starttls: bool,

        #[serde(default = "default_true")]
        smtputf8: bool,
    },

    Smtp {
        #[serde(default = "default_listen_host")]
        host: String,

        #[serde(default = "default_smtps_port")]
        port: u16,

        #[serde(default)]
        tls: TlsMode,

        #[serde(default = "default_true")]
        smtputf8: bool,
    },
}

fn default_listen_host() -> String {
    "default".to_string()
}

const fn default_pop_port() -> u16 {
    995
}

const fn default_smtp_port() -> u16 {
    25
}

const fn default_smtps_port() -> u16 {
    465
}

const fn default_pop_timeout() -> u64 {
    60
}

const fn default_true() -> bool {
    true
}
