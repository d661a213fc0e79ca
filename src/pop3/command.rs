//! POP3 command lexing and reply formatting
//!
//! One CRLF-terminated line per command. The lexer produces a tagged
//! [`ReadOutcome`] instead of raising: the session loop dispatches on
//! the tag and keeps its retry counters explicit.

use std::fmt;

/// The POP3 verbs this server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    User,
    Pass,
    Capa,
    Quit,
    Stat,
    List,
    Uidl,
    Retr,
    Dele,
    Rset,
    Noop,
}

impl Verb {
    /// Recognize a verb token. Matching is case-sensitive.
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "USER" => Some(Self::User),
            "PASS" => Some(Self::Pass),
            "CAPA" => Some(Self::Capa),
            "QUIT" => Some(Self::Quit),
            "STAT" => Some(Self::Stat),
            "LIST" => Some(Self::List),
            "UIDL" => Some(Self::Uidl),
            "RETR" => Some(Self::Retr),
            "DELE" => Some(Self::Dele),
            "RSET" => Some(Self::Rset),
            "NOOP" => Some(Self::Noop),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = match self {
            Self::User => "USER",
            Self::Pass => "PASS",
            Self::Capa => "CAPA",
            Self::Quit => "QUIT",
            Self::Stat => "STAT",
            Self::List => "LIST",
            Self::Uidl => "UIDL",
            Self::Retr => "RETR",
            Self::Dele => "DELE",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
        };
        f.write_str(v)
    }
}

/// A parsed request: the verb and its first argument, if any.
///
/// No verb we accept consumes more than one argument; extra tokens on
/// the line are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: Verb,
    pub arg1: Option<String>,
}

impl Request {
    /// The argument, or `""` when none was given.
    #[must_use]
    pub fn arg(&self) -> &str {
        self.arg1.as_deref().unwrap_or("")
    }
}

/// What one read off the wire produced.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A well-formed request.
    Request(Request),
    /// `QUIT`, from any state.
    Quit,
    /// Peer closed the connection.
    Disconnected,
    /// Empty line or unrecognized verb; recoverable, bounded retries.
    BadCommand,
    /// Line without CRLF termination or undecodable bytes; fatal.
    BadClient,
}

/// Lex one raw line (including its terminator) into a [`ReadOutcome`].
#[must_use]
pub fn parse_line(raw: &[u8]) -> ReadOutcome {
    let Ok(line) = std::str::from_utf8(raw) else {
        return ReadOutcome::BadClient;
    };
    let Some(line) = line.strip_suffix("\r\n") else {
        return ReadOutcome::BadClient;
    };

    let mut tokens = line.split_whitespace();
    let Some(verb_str) = tokens.next() else {
        return ReadOutcome::BadCommand;
    };
    let Some(verb) = Verb::from_token(verb_str) else {
        return ReadOutcome::BadCommand;
    };
    if verb == Verb::Quit {
        return ReadOutcome::Quit;
    }

    ReadOutcome::Request(Request {
        verb,
        arg1: tokens.next().map(ToString::to_string),
    })
}

// ── Reply formatting ───────────────────────────────────────────────

/// `+OK <text>\r\n`
#[must_use]
pub fn ok(text: &str) -> Vec<u8> {
    format!("+OK {text}\r\n").into_bytes()
}

/// `-ERR <text>\r\n`
#[must_use]
pub fn err(text: &str) -> Vec<u8> {
    format!("-ERR {text}\r\n").into_bytes()
}

/// `<text>\r\n`
#[must_use]
pub fn msg(text: &str) -> Vec<u8> {
    format!("{text}\r\n").into_bytes()
}

/// The multi-line terminator `.\r\n`.
#[must_use]
pub fn end() -> Vec<u8> {
    b".\r\n".to_vec()
}
