#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Self-hosted personal mail server
//!
//! Accepts inbound mail over SMTP (plaintext, STARTTLS, or implicit
//! TLS), routes every recipient through a declarative address router,
//! and delivers locally into per-mailbox Maildir directories. Received
//! mail is served back over POP3 with per-user single-session locking
//! and persistent deletion tracking. No relaying, no IMAP.

pub mod config;
pub mod error;
pub mod maildir;
pub mod pop3;
pub mod pwhash;
pub mod router;
pub mod server;
pub mod smtp;
pub mod tls;

pub use config::Config;
pub use error::{Error, Result};
pub use router::Router;
pub use server::Servers;
