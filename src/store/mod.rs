//! Coordination-store interface.
//!
//! The runtime persists everything — election markers, the guardian
//! context, per-operation records — through [`StateStore`], an abstract
//! hierarchical KV with ephemeral and sequenced nodes, one-shot child
//! watchers, and session-state listeners. Production deployments back it
//! with a coordination service; this crate ships two reference drivers:
//!
//! * [`MemoryStore`] — in-process tree for tests and single-replica use.
//! * [`FileStore`] — filesystem-backed driver that emulates ephemerality
//!   with TTL refresh (refresh interval < TTL/3; expired nodes are swept
//!   on read).
//!
//! Paths are slash-delimited strings rooted at `/`.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

/// Errors from coordination-store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// The addressed node does not exist.
    ///
    /// Callers may recover from this by treating the node as absent.
    #[error("no node at {path}")]
    #[diagnostic(code(wardmill::store::no_node))]
    NoNode { path: String },

    /// Creation failed because the node already exists.
    #[error("node already exists at {path}")]
    #[diagnostic(code(wardmill::store::node_exists))]
    NodeExists { path: String },

    /// Driver-level I/O failure.
    #[error("store i/o error at {path}: {message}")]
    #[diagnostic(code(wardmill::store::io))]
    Io { path: String, message: String },

    /// The driver gave up waiting on the backing service.
    #[error("store timeout at {path}")]
    #[diagnostic(code(wardmill::store::timeout))]
    Timeout { path: String },

    /// The backing service reported a server-side fault.
    ///
    /// Escalates to the session watcher, which re-runs the election.
    #[error("store server error: {message}")]
    #[diagnostic(code(wardmill::store::server))]
    Server { message: String },
}

/// What changed on a watched path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchKind {
    Created,
    Deleted,
    Changed,
    Child,
    None,
}

/// Connection state of the store session at event time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    Suspended,
    Lost,
}

/// Event delivered to a one-shot child watcher.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub status: SessionStatus,
    pub path: String,
}

impl WatchEvent {
    #[must_use]
    pub fn new(kind: WatchKind, status: SessionStatus, path: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            path: path.into(),
        }
    }
}

/// One-shot watcher invoked on the next change to a watched path.
///
/// Watchers are delivered synchronously by the drivers and must be
/// lightweight; forward the event into a channel for real work.
pub type ChildWatcher = Box<dyn FnOnce(WatchEvent) + Send + 'static>;

/// Listener invoked on session-state transitions.
pub type SessionListener = Box<dyn Fn(SessionStatus) + Send + Sync + 'static>;

/// Abstract hierarchical KV with ephemeral and sequenced nodes.
///
/// Ephemeral nodes disappear when the creating session ends. Drivers
/// without native ephemerality emulate it: the creator refreshes the node
/// every [`PERSIST_INTERVAL`](crate::config::PERSIST_INTERVAL) and readers
/// drop nodes untouched for [`PERSIST_TIMEOUT`](crate::config::PERSIST_TIMEOUT).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the data blob at `path`. Fails with [`StoreError::NoNode`]
    /// when absent.
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Overwrite the data blob at an existing `path`.
    async fn put(&self, path: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Create a node and return its actual path.
    ///
    /// With `sequence`, a zero-padded monotonically increasing integer —
    /// unique among siblings sharing the requested prefix — is appended
    /// to the requested path. With `make_path`, missing intermediate
    /// nodes are created non-ephemerally. Without `sequence`, creating an
    /// existing node fails with [`StoreError::NodeExists`].
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        ephemeral: bool,
        sequence: bool,
        make_path: bool,
    ) -> Result<String, StoreError>;

    /// Remove a node; with `recursive`, its whole subtree.
    async fn delete(&self, path: &str, recursive: bool) -> Result<(), StoreError>;

    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// List immediate child names (not full paths) of `path`.
    ///
    /// When `watcher` is given it fires once on the next child-set
    /// change, data change, or existence change on `path`.
    async fn children(
        &self,
        path: &str,
        watcher: Option<ChildWatcher>,
    ) -> Result<Vec<String>, StoreError>;

    /// Register a listener for session-state transitions.
    fn add_session_listener(&self, listener: SessionListener);

    /// Tear down the session; ephemeral nodes owned by it become eligible
    /// for removal.
    async fn disconnect(&self) -> Result<(), StoreError>;
}

/// Width of the zero-padded sequence suffix appended to sequenced nodes.
pub(crate) const SEQUENCE_WIDTH: usize = 9;

pub(crate) fn format_sequence(path: &str, sequence: u64) -> String {
    format!("{path}{sequence:0width$}", width = SEQUENCE_WIDTH)
}

pub(crate) fn parent_of(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        Some("/")
    } else {
        Some(&path[..idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_suffix_is_zero_padded() {
        assert_eq!(format_sequence("/g/alive_clients/a#", 7), "/g/alive_clients/a#000000007");
    }

    #[test]
    fn parent_resolution() {
        assert_eq!(parent_of("/g/context"), Some("/g"));
        assert_eq!(parent_of("/g"), Some("/"));
        assert_eq!(parent_of("nope"), None);
    }
}
