//! Query Router
//!
//! Pure domain logic deciding whether a statement may be served by the local
//! replica or must go to the server. No I/O happens here; callers gather the
//! replica and session state and act on the returned route.

use crate::domain::entities::{FeedState, ReplicaSnapshot, TransactionState};
use crate::domain::value_objects::{FreshnessPolicy, StatementKind};
use std::time::SystemTime;

/// Where a statement is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Replica,
    Remote(RemoteReason),
}

/// Why a statement was sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteReason {
    /// Write, schema change or transaction control
    NotARead,
    InTransaction,
    NoReplica,
    FeedNotStreaming(FeedState),
    /// Replica has not applied the writes this session already observed
    ReadYourWrites,
    TooStale,
    TooFarBehind,
    /// Replica was chosen but the local read failed
    ReplicaFailed,
}

impl std::fmt::Display for RemoteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteReason::NotARead => write!(f, "not a read"),
            RemoteReason::InTransaction => write!(f, "transaction open"),
            RemoteReason::NoReplica => write!(f, "no replica"),
            RemoteReason::FeedNotStreaming(state) => write!(f, "feed {}", state),
            RemoteReason::ReadYourWrites => write!(f, "replica behind session"),
            RemoteReason::TooStale => write!(f, "replica too stale"),
            RemoteReason::TooFarBehind => write!(f, "replica lag too high"),
            RemoteReason::ReplicaFailed => write!(f, "replica read failed"),
        }
    }
}

/// Replica state visible to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub feed_state: FeedState,
    pub snapshot: ReplicaSnapshot,
    /// Highest end sequence the feed has delivered
    pub head_sequence: u64,
}

/// Transaction-control commands handled by the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionCommand {
    Begin,
    Commit,
    Rollback,
}

/// Query router.
pub struct Router;

impl Router {
    /// Classify a SQL statement by its leading keyword.
    ///
    /// Unrecognized statements are treated as writes.
    pub fn classify(sql: &str) -> StatementKind {
        let body = strip_leading(sql);
        let keyword = first_keyword(body);

        match keyword.as_str() {
            "SELECT" | "VALUES" | "EXPLAIN" => StatementKind::Read,
            // PRAGMA name = value changes state; PRAGMA name / name(arg) reads it
            "PRAGMA" if body.contains('=') => StatementKind::Write,
            "PRAGMA" => StatementKind::Read,
            "WITH" if modifies_data(body) => StatementKind::Write,
            "WITH" => StatementKind::Read,
            "CREATE" | "DROP" | "ALTER" | "REINDEX" | "VACUUM" | "ANALYZE" => {
                StatementKind::SchemaChange
            }
            "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
                StatementKind::TransactionControl
            }
            _ => StatementKind::Write,
        }
    }

    /// Map BEGIN/COMMIT/END/ROLLBACK text to a session command.
    ///
    /// `ROLLBACK TO`, `SAVEPOINT` and `RELEASE` return None and are forwarded
    /// as ordinary statements.
    pub fn transaction_command(sql: &str) -> Option<TransactionCommand> {
        let body = strip_leading(sql);
        let mut words = body
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .map(|w| w.to_ascii_uppercase());

        match words.next()?.as_str() {
            "BEGIN" => Some(TransactionCommand::Begin),
            "COMMIT" | "END" => Some(TransactionCommand::Commit),
            "ROLLBACK" => {
                let rest: Vec<String> = words.collect();
                if rest.iter().any(|w| w == "TO") {
                    None
                } else {
                    Some(TransactionCommand::Rollback)
                }
            }
            _ => None,
        }
    }

    /// Decide where a statement runs.
    ///
    /// # Arguments
    /// * `kind` - Statement classification
    /// * `transaction` - Session transaction state
    /// * `replica` - Replica state for the session's catalog, if one exists
    /// * `session_txseq` - Highest server sequence this session has observed
    /// * `policy` - Freshness tolerance
    /// * `now` - Current wall-clock time
    pub fn route(
        kind: StatementKind,
        transaction: TransactionState,
        replica: Option<&ReplicaStatus>,
        session_txseq: u64,
        policy: &FreshnessPolicy,
        now: SystemTime,
    ) -> Route {
        if kind != StatementKind::Read {
            return Route::Remote(RemoteReason::NotARead);
        }
        if transaction.is_open() {
            return Route::Remote(RemoteReason::InTransaction);
        }

        let replica = match replica {
            Some(r) => r,
            None => return Route::Remote(RemoteReason::NoReplica),
        };

        if replica.feed_state != FeedState::Streaming {
            return Route::Remote(RemoteReason::FeedNotStreaming(replica.feed_state));
        }

        let applied = replica.snapshot.sequence;
        if applied < session_txseq {
            return Route::Remote(RemoteReason::ReadYourWrites);
        }

        if let Some(max) = policy.max_staleness {
            match replica.snapshot.staleness(now) {
                Some(age) if age <= max => {}
                _ => return Route::Remote(RemoteReason::TooStale),
            }
        }

        if let Some(max_lag) = policy.max_sequence_lag {
            let head = replica.head_sequence.max(session_txseq);
            if head.saturating_sub(applied) > max_lag {
                return Route::Remote(RemoteReason::TooFarBehind);
            }
        }

        Route::Replica
    }
}

/// Skip whitespace, comments and opening parentheses.
fn strip_leading(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(line) = trimmed.strip_prefix("--") {
            rest = line.find('\n').map(|i| &line[i + 1..]).unwrap_or("");
        } else if let Some(block) = trimmed.strip_prefix("/*") {
            rest = block.find("*/").map(|i| &block[i + 2..]).unwrap_or("");
        } else {
            return trimmed;
        }
    }
}

fn first_keyword(body: &str) -> String {
    body.chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Whether a CTE statement contains a data-modifying keyword.
fn modifies_data(body: &str) -> bool {
    body.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|word| {
            matches!(
                word.to_ascii_uppercase().as_str(),
                "INSERT" | "UPDATE" | "DELETE" | "REPLACE"
            )
        })
}
