//! POP3 session state machine
//!
//! One connection, one task, one pass through
//! `GREETED -> AUTH -> TRANSACTION -> UPDATE`. The command reader
//! yields a tagged outcome and every retry bound is an explicit
//! counter; there is no exception-driven control flow to reconstruct.
//!
//! Cross-session state is limited to [`SharedState`]: the immutable
//! user table, the logged-in set that enforces at most one concurrent
//! session per user, and the session-id counter. Login membership is
//! held by an RAII guard so that every exit path (QUIT, EOF, fatal
//! error, timeout cancellation) releases the user's slot.

use crate::config::UserCfg;
use crate::error::{Error, Result};
use crate::maildir::{self, MailList};
use crate::pop3::command::{self, ReadOutcome, Request, Verb};
use crate::pwhash::{self, PwInfo};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

/// Bad commands tolerated per read before the session is failed.
const INVALID_RETRIES: u32 = 3;

/// Authentication attempts tolerated before the session is failed.
const AUTH_RETRIES: u32 = 3;

/// Credentials and mailbox for one user.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub pwinfo: PwInfo,
    pub mbox: String,
}

/// Parse the configured user table into `username -> record`.
///
/// # Errors
///
/// Returns [`Error::Config`] on duplicate usernames and
/// [`Error::PwHash`] on an unparsable stored hash.
pub fn build_user_table(users: &[UserCfg]) -> Result<HashMap<String, UserRecord>> {
    let mut table = HashMap::new();
    for user in users {
        let pwinfo = pwhash::parse_hash(&user.password_hash)?;
        let record = UserRecord {
            pwinfo,
            mbox: user.mbox.clone(),
        };
        if table.insert(user.username.clone(), record).is_some() {
            return Err(Error::Config(format!(
                "duplicate username {:?}",
                user.username
            )));
        }
    }
    Ok(table)
}

/// State shared by every POP3 session in the process.
#[derive(Debug)]
pub struct SharedState {
    users: HashMap<String, UserRecord>,
    logged_in: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl SharedState {
    #[must_use]
    pub fn new(users: HashMap<String, UserRecord>) -> Self {
        Self {
            users,
            logged_in: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn user(&self, username: &str) -> Option<&UserRecord> {
        self.users.get(username)
    }

    /// Claim the single session slot for `username`.
    fn try_login(self: &Arc<Self>, username: &str) -> Option<LoginGuard> {
        let mut set = self
            .logged_in
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if set.insert(username.to_string()) {
            Some(LoginGuard {
                state: Arc::clone(self),
                username: username.to_string(),
            })
        } else {
            None
        }
    }
}

/// Holds a user's logged-in slot; dropping it releases the slot.
struct LoginGuard {
    state: Arc<SharedState>,
    username: String,
}

/// A successful authentication: who, their mailbox, and the held slot.
struct Login {
    username: String,
    record: UserRecord,
    /// Kept for its `Drop`; releasing it reopens the user's slot.
    guard: LoginGuard,
}

impl Drop for LoginGuard {
    fn drop(&mut self) {
        self.state
            .logged_in
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.username);
    }
}

/// Why a session ended before reaching a clean UPDATE.
#[derive(Debug)]
enum SessionEnd {
    /// Client sent QUIT outside the transaction; `+OK Bye` already sent.
    Quit,
    /// Peer closed the connection.
    Disconnected,
    /// Reply already written; just close.
    Quiet,
    /// Unrecoverable client fault; answer `-ERR Something went wrong`.
    Fatal(String),
    Io(std::io::Error),
}

impl From<std::io::Error> for SessionEnd {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

type SessionResult<T> = std::result::Result<T, SessionEnd>;

/// Everything a POP3 listener hands to its connection tasks.
#[derive(Debug, Clone)]
pub(crate) struct SessionOpts {
    pub mails_path: PathBuf,
    pub state: Arc<SharedState>,
    pub timeout: Duration,
}

/// Run one accepted (and possibly TLS-wrapped) connection to completion.
pub(crate) async fn run_connection<S>(stream: S, peer: SocketAddr, opts: SessionOpts)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let sid = opts.state.next_session_id();
    let mut io = BufReader::new(stream);
    debug!("session {}: started for {}", sid, peer);

    match tokio::time::timeout(opts.timeout, session(&mut io, peer, sid, &opts)).await {
        Err(_) => {
            warn!("session {}: timed out after {:?}", sid, opts.timeout);
        }
        Ok(Ok(())) => {
            debug!("session {}: finished", sid);
        }
        Ok(Err(SessionEnd::Quit)) => {
            debug!("session {}: client quit", sid);
        }
        Ok(Err(SessionEnd::Disconnected)) => {
            debug!("session {}: client disconnected", sid);
        }
        Ok(Err(SessionEnd::Quiet)) => {
            debug!("session {}: closed after error reply", sid);
        }
        Ok(Err(SessionEnd::Fatal(reason))) => {
            warn!("session {}: client error: {}", sid, reason);
            let _ = send(&mut io, &command::err("Something went wrong")).await;
        }
        Ok(Err(SessionEnd::Io(e))) => {
            error!("session {}: io error: {}", sid, e);
        }
    }
}

async fn session<S>(
    io: &mut BufReader<S>,
    peer: SocketAddr,
    sid: u64,
    opts: &SessionOpts,
) -> SessionResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send(io, &command::ok("Server Ready")).await?;

    let login = auth_stage(io, sid, &opts.state).await?;
    info!(
        "session {}: user {} logged in from {}",
        sid, login.username, peer
    );

    let result = transaction_stage(io, sid, opts, &login.username, &login.record).await;
    drop(login.guard);
    result
}

// ── AUTH ───────────────────────────────────────────────────────────

async fn auth_stage<S>(
    io: &mut BufReader<S>,
    sid: u64,
    state: &Arc<SharedState>,
) -> SessionResult<Login>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut failures = 0;
    while failures < AUTH_RETRIES {
        let req = next_req(io).await?;
        match req.verb {
            Verb::Capa => {
                let mut reply = command::ok("Following are supported");
                reply.extend(command::msg("USER"));
                reply.extend(command::end());
                send(io, &reply).await?;
            }
            Verb::User => match check_credentials(io, state, req.arg()).await? {
                Ok(login) => {
                    send(io, &command::ok("Login successful")).await?;
                    return Ok(login);
                }
                Err(reason) => {
                    debug!("session {}: auth failed: {}", sid, reason);
                    send(io, &command::err(&format!("Auth Failed: {reason}"))).await?;
                    failures += 1;
                }
            },
            _ => {
                return Err(SessionEnd::Fatal(format!(
                    "{} not allowed before authentication",
                    req.verb
                )));
            }
        }
    }
    Err(SessionEnd::Fatal("Failed to authenticate".to_string()))
}

/// One USER/PASS exchange. The outer result is session control flow;
/// the inner one distinguishes success from a retriable auth failure.
async fn check_credentials<S>(
    io: &mut BufReader<S>,
    state: &Arc<SharedState>,
    username: &str,
) -> SessionResult<std::result::Result<Login, &'static str>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if username.is_empty() {
        return Ok(Err("Invalid user pass"));
    }
    send(io, &command::ok("Welcome")).await?;

    let req = next_req(io).await?;
    if req.verb != Verb::Pass {
        return Err(SessionEnd::Fatal(format!(
            "expected PASS after USER, got {}",
            req.verb
        )));
    }

    let Some(record) = state.user(username) else {
        return Ok(Err("Invalid user pass"));
    };
    if !pwhash::check_pass(req.arg(), &record.pwinfo) {
        return Ok(Err("Invalid user pass"));
    }
    let record = record.clone();
    let Some(guard) = state.try_login(username) else {
        return Ok(Err("Already logged in"));
    };
    Ok(Ok(Login {
        username: username.to_string(),
        record,
        guard,
    }))
}

// ── TRANSACTION / UPDATE ───────────────────────────────────────────

async fn transaction_stage<S>(
    io: &mut BufReader<S>,
    sid: u64,
    opts: &SessionOpts,
    username: &str,
    record: &UserRecord,
) -> SessionResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mbox_dir = opts.mails_path.join(&record.mbox);
    let deleted_path = mbox_dir.join(username);

    let already_deleted = maildir::read_deleted_file(&deleted_path)?;
    let entries = match maildir::scan_new(&mbox_dir.join("new")) {
        Ok(entries) => entries
            .into_iter()
            .filter(|e| !already_deleted.contains(&e.uid))
            .collect(),
        // A mailbox that never received mail has no Maildir yet.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let mut mails = MailList::new(entries);
    debug!("session {}: {} visible messages", sid, mails.stat().0);

    loop {
        let req = match next_req(io).await {
            Ok(req) => req,
            Err(SessionEnd::Quit) => {
                // UPDATE: only a clean QUIT commits session deletions.
                return persist_deletions(sid, &deleted_path, &mails);
            }
            Err(e) => return Err(e),
        };
        debug!("session {}: request {:?}", sid, req);

        match req.verb {
            Verb::Capa => {
                let mut reply = command::ok("CAPA follows");
                reply.extend(command::msg("UIDL"));
                reply.extend(command::end());
                send(io, &reply).await?;
            }
            Verb::Stat => {
                let (count, size) = mails.stat();
                send(io, &command::ok(&format!("{count} {size}"))).await?;
            }
            Verb::List => {
                let reply = listing(&req, &mails, |e| e.size.to_string());
                send(io, &reply).await?;
            }
            Verb::Uidl => {
                let reply = listing(&req, &mails, |e| e.uid.clone());
                send(io, &reply).await?;
            }
            Verb::Retr => {
                retr(io, &mut mails, &req).await?;
            }
            Verb::Dele => {
                let deleted = req
                    .arg()
                    .parse::<usize>()
                    .is_ok_and(|nid| mails.delete(nid));
                if deleted {
                    send(io, &command::ok("Deleted")).await?;
                } else {
                    send(io, &command::err("Not found")).await?;
                }
            }
            Verb::Rset => {
                mails.reset();
                send(io, &command::ok("Reset")).await?;
            }
            Verb::Noop => {
                send(io, &command::ok("Hmm")).await?;
            }
            Verb::User | Verb::Pass | Verb::Quit => {
                send(io, &command::err("Not implemented")).await?;
                return Err(SessionEnd::Quiet);
            }
        }
    }
}

/// `LIST`/`UIDL`: without an argument a multi-line listing of live
/// entries, with one a single scan line or `-ERR Not found`.
fn listing(
    req: &Request,
    mails: &MailList,
    field: impl Fn(&maildir::MailEntry) -> String,
) -> Vec<u8> {
    match req.arg1.as_deref() {
        None => {
            let mut reply = command::ok("Mails follow");
            for entry in mails.get_all() {
                reply.extend(command::msg(&format!("{} {}", entry.nid, field(entry))));
            }
            reply.extend(command::end());
            reply
        }
        Some(arg) => match arg.parse::<usize>().ok().and_then(|nid| mails.get(nid)) {
            Some(entry) => command::ok(&format!("{} {}", entry.nid, field(entry))),
            None => command::err("Not found"),
        },
    }
}

async fn retr<S>(io: &mut BufReader<S>, mails: &mut MailList, req: &Request) -> SessionResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(entry) = req.arg().parse::<usize>().ok().and_then(|nid| mails.get(nid)) else {
        send(io, &command::err("Not found")).await?;
        return Ok(());
    };

    let nid = entry.nid;
    let contents = tokio::fs::read(&entry.path).await?;

    let mut reply = command::ok("Contents follow");
    reply.extend(contents);
    reply.extend(command::end());
    send(io, &reply).await?;

    // A successful RETR also marks the message deleted, so a plain
    // fetch loop drains the mailbox. TODO: add a config flag to
    // decouple RETR from DELE for clients that re-fetch mail.
    mails.delete(nid);
    Ok(())
}

fn persist_deletions(
    sid: u64,
    deleted_path: &std::path::Path,
    mails: &MailList,
) -> SessionResult<()> {
    let deleted = mails.deleted_uids();
    if deleted.is_empty() {
        return Ok(());
    }
    let mut all = maildir::read_deleted_file(deleted_path)?;
    all.extend(deleted.iter().cloned());
    maildir::write_deleted_file(deleted_path, &all)?;
    info!(
        "session {}: persisted {} deletions to {}",
        sid,
        deleted.len(),
        deleted_path.display()
    );
    Ok(())
}

// ── Wire helpers ───────────────────────────────────────────────────

/// Read commands until one parses, the client quits, or the bad-line
/// budget is exhausted. `QUIT` is answered (`+OK Bye`) here so every
/// stage gets the same farewell behavior.
async fn next_req<S>(io: &mut BufReader<S>) -> SessionResult<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for _ in 0..INVALID_RETRIES {
        let mut line = Vec::new();
        let n = io.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(SessionEnd::Disconnected);
        }
        match command::parse_line(&line) {
            ReadOutcome::Request(req) => return Ok(req),
            ReadOutcome::Quit => {
                send(io, &command::ok("Bye")).await?;
                return Err(SessionEnd::Quit);
            }
            ReadOutcome::BadCommand => {
                send(io, &command::err("Bad command")).await?;
            }
            ReadOutcome::BadClient => {
                return Err(SessionEnd::Fatal("invalid line ending".to_string()));
            }
            ReadOutcome::Disconnected => {
                return Err(SessionEnd::Disconnected);
            }
        }
    }
    Err(SessionEnd::Fatal(format!(
        "Bad command {INVALID_RETRIES} times"
    )))
}

/// Write and flush, so each reply is on the wire before the next read.
async fn send<S>(io: &mut BufReader<S>, data: &[u8]) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.get_mut().write_all(data).await?;
    io.get_mut().flush().await
}
