//! Address-to-mailbox routing
//!
//! Named match predicates combine into per-mailbox rule chains. The
//! router compiles the whole table once at startup into a flat ordered
//! list of checkers; evaluation walks that list per recipient address,
//! yielding mailbox names until a `stop_check` rule fires.

use crate::config::{Config, DEFAULT_MATCH_ALL, DEFAULT_NULL_MBOX, MatchCfg};
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A compiled address predicate.
#[derive(Debug, Clone)]
enum Predicate {
    /// Exact membership in a set of addresses.
    Exact(Arc<HashSet<String>>),
    /// Any of the regexes matches at the start of the address.
    Rex(Arc<Vec<Regex>>),
    /// Matches every address (`default_match_all`).
    True,
}

impl Predicate {
    fn accepts(&self, addr: &str) -> bool {
        match self {
            Self::Exact(addrs) => addrs.contains(addr),
            Self::Rex(rexs) => rexs.iter().any(|r| r.is_match(addr)),
            Self::True => true,
        }
    }
}

/// One compiled routing step: `(mailbox, predicate, stop_check)`.
#[derive(Debug, Clone)]
struct Checker {
    mbox: String,
    predicate: Predicate,
    negate: bool,
    stop_check: bool,
}

impl Checker {
    fn accepts(&self, addr: &str) -> bool {
        self.predicate.accepts(addr) != self.negate
    }
}

/// The compiled routing table. Construct once with [`Router::compile`],
/// share by reference; evaluation is pure.
#[derive(Debug, Clone)]
pub struct Router {
    checkers: Vec<Checker>,
}

impl Router {
    /// Compile the `matches` and `boxes` sections of a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a match sets both or neither of
    /// `addrs`/`addr_rexs`, a regex fails to compile, or a rule
    /// references an unknown match name.
    pub fn compile(cfg: &Config) -> Result<Self> {
        let mut predicates: HashMap<String, Predicate> = HashMap::new();
        for m in &cfg.matches {
            predicates.insert(m.name.clone(), compile_match(m)?);
        }
        predicates.insert(DEFAULT_MATCH_ALL.to_string(), Predicate::True);

        let mut checkers = Vec::new();
        for mbox in &cfg.boxes {
            for rule in &mbox.rules {
                let predicate = predicates.get(&rule.match_name).ok_or_else(|| {
                    Error::Config(format!(
                        "mailbox {:?} references unknown match {:?}",
                        mbox.name, rule.match_name
                    ))
                })?;
                checkers.push(Checker {
                    mbox: mbox.name.clone(),
                    predicate: predicate.clone(),
                    negate: rule.negate,
                    stop_check: rule.stop_check,
                });
            }
        }

        Ok(Self { checkers })
    }

    /// Mailboxes that `addr` routes to, in rule order.
    ///
    /// Duplicates are preserved (callers dedup); an address no rule
    /// accepts yields an empty list; `default_null_mbox` matches are
    /// consumed for their `stop_check` effect but never yielded.
    #[must_use]
    pub fn get_mboxes(&self, addr: &str) -> Vec<String> {
        let mut out = Vec::new();
        for checker in &self.checkers {
            if checker.accepts(addr) {
                if checker.mbox != DEFAULT_NULL_MBOX {
                    out.push(checker.mbox.clone());
                }
                if checker.stop_check {
                    break;
                }
            }
        }
        out
    }
}

fn compile_match(m: &MatchCfg) -> Result<Predicate> {
    match (m.addrs.is_empty(), m.addr_rexs.is_empty()) {
        (false, false) => Err(Error::Config(format!(
            "match {:?}: both addrs and addr_rexs are set",
            m.name
        ))),
        (true, true) => Err(Error::Config(format!(
            "match {:?}: neither addrs nor addr_rexs is set",
            m.name
        ))),
        (false, true) => Ok(Predicate::Exact(Arc::new(
            m.addrs.iter().cloned().collect(),
        ))),
        (true, false) => {
            let mut rexs = Vec::with_capacity(m.addr_rexs.len());
            for rex in &m.addr_rexs {
                // Anchor at the start: a pattern matches like a prefix,
                // not anywhere in the address.
                let compiled = Regex::new(&format!("^(?:{rex})")).map_err(|e| {
                    Error::Config(format!("match {:?}: bad regex {rex:?}: {e}", m.name))
                })?;
                rexs.push(compiled);
            }
            Ok(Predicate::Rex(Arc::new(rexs)))
        }
    }
}
