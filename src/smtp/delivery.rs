//! Delivery handler: from an accepted DATA body to Maildir files
//!
//! The handler buffers the message as the engine feeds it line by
//! line, then fans it out at end-of-data: route every envelope
//! recipient (lowercased), union the target mailboxes, stage the
//! message once, and give every target its own copy under `new/`.
//! Files reach `new/` by rename, so readers only ever see whole
//! messages.

use crate::config::DEFAULT_NULL_MBOX;
use crate::router::Router;
use mailin::response::{INTERNAL_ERROR, OK};
use mailin::{Handler, Response};
use std::collections::BTreeSet;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Settings shared by every SMTP connection of a listener.
#[derive(Debug)]
pub struct SmtpOpts {
    pub mails_path: PathBuf,
    pub router: Arc<Router>,
    /// Accepted for configuration parity; the engine takes UTF-8
    /// addresses either way.
    pub smtputf8: bool,
}

/// Per-connection `mailin` handler.
pub(crate) struct DeliveryHandler {
    opts: Arc<SmtpOpts>,
    peer: SocketAddr,
    /// `"plain"` or `"starttls"`, for the trace header.
    listener_type: &'static str,
    /// Set once the connection is under TLS (implicit or negotiated).
    tls: Arc<AtomicBool>,
    require_starttls: bool,
    rcpt_tos: Vec<String>,
    data: Vec<u8>,
}

impl DeliveryHandler {
    pub(crate) fn new(
        opts: Arc<SmtpOpts>,
        peer: SocketAddr,
        listener_type: &'static str,
        tls: Arc<AtomicBool>,
        require_starttls: bool,
    ) -> Self {
        Self {
            opts,
            peer,
            listener_type,
            tls,
            require_starttls,
            rcpt_tos: Vec::new(),
            data: Vec::new(),
        }
    }

    fn tls_active(&self) -> bool {
        self.tls.load(Ordering::Relaxed)
    }

    fn deliver(&self) -> std::io::Result<()> {
        let mut mboxes: BTreeSet<String> = BTreeSet::new();
        for addr in &self.rcpt_tos {
            for mbox in self.opts.router.get_mboxes(&addr.to_lowercase()) {
                if mbox != DEFAULT_NULL_MBOX {
                    mboxes.insert(mbox);
                }
            }
        }
        if mboxes.is_empty() {
            warn!(
                "dropping message from {}: no mailbox for {:?}",
                self.peer, self.rcpt_tos
            );
            return Ok(());
        }

        for mbox in &mboxes {
            ensure_maildir(&self.opts.mails_path.join(mbox))?;
        }

        // Stage the full message once, then hand every mailbox its own
        // copy; the final rename is what makes it visible to readers.
        let filename = format!("{}.eml", Uuid::new_v4());
        let staging = tempfile::tempdir()?;
        let staged = staging.path().join(&filename);
        {
            let trace = format!(
                "X-SSL: Type: {}, STARTTLS: {}\r\n",
                self.listener_type,
                self.tls_active()
            );
            let mut file = std::fs::File::create(&staged)?;
            file.write_all(trace.as_bytes())?;
            file.write_all(&self.data)?;
            file.flush()?;
        }

        for mbox in &mboxes {
            let mbox_dir = self.opts.mails_path.join(mbox);
            let tmp_path = mbox_dir.join("tmp").join(&filename);
            let new_path = mbox_dir.join("new").join(&filename);
            std::fs::copy(&staged, &tmp_path)?;
            std::fs::rename(&tmp_path, &new_path)?;
        }

        info!(
            "Saved mail at {} addrs: {}, mboxes: {}, peer: {}",
            filename,
            self.rcpt_tos.join(","),
            mboxes.iter().cloned().collect::<Vec<_>>().join(","),
            self.peer
        );
        Ok(())
    }
}

impl Handler for DeliveryHandler {
    fn helo(&mut self, _ip: IpAddr, _domain: &str) -> Response {
        OK
    }

    fn mail(&mut self, _ip: IpAddr, _domain: &str, _from: &str) -> Response {
        if self.require_starttls && !self.tls_active() {
            Response::custom(530, "Must issue a STARTTLS command first".to_string())
        } else {
            OK
        }
    }

    fn rcpt(&mut self, _to: &str) -> Response {
        // Every recipient is accepted; the router decides at delivery
        // time, and unroutable mail is dropped silently.
        OK
    }

    fn data_start(
        &mut self,
        _domain: &str,
        _from: &str,
        _is8bit: bool,
        to: &[String],
    ) -> Response {
        self.rcpt_tos = to.to_vec();
        self.data.clear();
        OK
    }

    fn data(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.data.extend_from_slice(buf);
        Ok(())
    }

    fn data_end(&mut self) -> Response {
        match self.deliver() {
            Ok(()) => OK,
            Err(e) => {
                error!("delivery failed: {}", e);
                INTERNAL_ERROR
            }
        }
    }
}

/// Create `{new,tmp,cur}` (mode 0755) under the mailbox directory.
fn ensure_maildir(mbox_dir: &Path) -> std::io::Result<()> {
    for sub in ["new", "tmp", "cur"] {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o755);
        }
        builder.create(mbox_dir.join(sub))?;
    }
    Ok(())
}
