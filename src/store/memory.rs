//! In-process reference driver for [`StateStore`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use super::{
    format_sequence, parent_of, ChildWatcher, SessionListener, SessionStatus, StateStore,
    StoreError, WatchEvent, WatchKind,
};

#[derive(Clone, Debug, Default)]
struct NodeRecord {
    data: Vec<u8>,
    ephemeral: bool,
}

#[derive(Default)]
struct Inner {
    /// Path → record. Ordered so traversal and child listing are stable.
    nodes: BTreeMap<String, NodeRecord>,
    /// One-shot watchers keyed by watched path.
    watchers: FxHashMap<String, Vec<ChildWatcher>>,
    /// High-water sequence number per requested prefix.
    sequences: FxHashMap<String, u64>,
    listeners: Vec<SessionListener>,
}

/// Volatile in-process store.
///
/// Fast and non-durable; suitable for tests and single-replica guardians.
/// Watchers fire synchronously inside the mutating call, so they must be
/// lightweight (forward into a channel). The [`expire_session`]
/// (MemoryStore::expire_session) test hook simulates a session loss:
/// ephemeral nodes vanish and session listeners observe `Lost` followed
/// by `Connected`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate session expiry: drop all ephemeral nodes, notify session
    /// listeners with `Lost` then `Connected`, and fire the affected
    /// child watchers.
    pub fn expire_session(&self) {
        let fired = {
            let mut inner = self.lock();
            let doomed: Vec<String> = inner
                .nodes
                .iter()
                .filter(|(_, record)| record.ephemeral)
                .map(|(path, _)| path.clone())
                .collect();
            let mut fired = Vec::new();
            for path in doomed {
                inner.nodes.remove(&path);
                if let Some(parent) = parent_of(&path) {
                    fired.extend(take_watchers(&mut inner, parent, WatchKind::Child));
                }
            }
            fired
        };
        {
            let inner = self.lock();
            for listener in &inner.listeners {
                listener(SessionStatus::Lost);
            }
        }
        for (watcher, event) in fired {
            watcher(event);
        }
        let inner = self.lock();
        for listener in &inner.listeners {
            listener(SessionStatus::Connected);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned store mutex means a watcher panicked; propagating the
        // panic to every later caller would mask the original failure.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn take_watchers(
    inner: &mut Inner,
    path: &str,
    kind: WatchKind,
) -> Vec<(ChildWatcher, WatchEvent)> {
    match inner.watchers.remove(path) {
        Some(watchers) => watchers
            .into_iter()
            .map(|w| {
                (
                    w,
                    WatchEvent::new(kind, SessionStatus::Connected, path.to_string()),
                )
            })
            .collect(),
        None => Vec::new(),
    }
}

fn child_names(inner: &Inner, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    };
    inner
        .nodes
        .range(prefix.clone()..)
        .take_while(|(p, _)| p.starts_with(&prefix))
        .filter_map(|(p, _)| {
            let rest = &p[prefix.len()..];
            if rest.is_empty() || rest.contains('/') {
                None
            } else {
                Some(rest.to_string())
            }
        })
        .collect()
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let inner = self.lock();
        inner
            .nodes
            .get(path)
            .map(|record| record.data.clone())
            .ok_or_else(|| StoreError::NoNode { path: path.into() })
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let fired = {
            let mut inner = self.lock();
            let record = inner
                .nodes
                .get_mut(path)
                .ok_or_else(|| StoreError::NoNode { path: path.into() })?;
            record.data = data.to_vec();
            take_watchers(&mut inner, path, WatchKind::Changed)
        };
        for (watcher, event) in fired {
            watcher(event);
        }
        Ok(())
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        ephemeral: bool,
        sequence: bool,
        make_path: bool,
    ) -> Result<String, StoreError> {
        let (actual, fired) = {
            let mut inner = self.lock();
            let parent = parent_of(path).ok_or_else(|| StoreError::Io {
                path: path.into(),
                message: "path must be absolute".into(),
            })?;
            if parent != "/" && !inner.nodes.contains_key(parent) {
                if make_path {
                    let mut ancestor = String::new();
                    for part in parent.split('/').filter(|p| !p.is_empty()) {
                        ancestor.push('/');
                        ancestor.push_str(part);
                        inner
                            .nodes
                            .entry(ancestor.clone())
                            .or_insert_with(NodeRecord::default);
                    }
                } else {
                    return Err(StoreError::NoNode {
                        path: parent.into(),
                    });
                }
            }
            let actual = if sequence {
                let next = inner.sequences.entry(path.to_string()).or_insert(0);
                let actual = format_sequence(path, *next);
                *next += 1;
                actual
            } else {
                if inner.nodes.contains_key(path) {
                    return Err(StoreError::NodeExists { path: path.into() });
                }
                path.to_string()
            };
            inner.nodes.insert(
                actual.clone(),
                NodeRecord {
                    data: data.to_vec(),
                    ephemeral,
                },
            );
            let fired = take_watchers(&mut inner, parent, WatchKind::Child);
            (actual, fired)
        };
        for (watcher, event) in fired {
            watcher(event);
        }
        Ok(actual)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<(), StoreError> {
        let fired = {
            let mut inner = self.lock();
            if !inner.nodes.contains_key(path) {
                return Err(StoreError::NoNode { path: path.into() });
            }
            if recursive {
                let prefix = format!("{path}/");
                let subtree: Vec<String> = inner
                    .nodes
                    .range(prefix.clone()..)
                    .take_while(|(p, _)| p.starts_with(&prefix))
                    .map(|(p, _)| p.clone())
                    .collect();
                for descendant in subtree {
                    inner.nodes.remove(&descendant);
                }
            } else if !child_names(&inner, path).is_empty() {
                return Err(StoreError::Io {
                    path: path.into(),
                    message: "node has children".into(),
                });
            }
            inner.nodes.remove(path);
            let mut fired = take_watchers(&mut inner, path, WatchKind::Deleted);
            if let Some(parent) = parent_of(path) {
                fired.extend(take_watchers(&mut inner, parent, WatchKind::Child));
            }
            fired
        };
        for (watcher, event) in fired {
            watcher(event);
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.lock().nodes.contains_key(path))
    }

    async fn children(
        &self,
        path: &str,
        watcher: Option<ChildWatcher>,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        if path != "/" && !inner.nodes.contains_key(path) {
            return Err(StoreError::NoNode { path: path.into() });
        }
        let names = child_names(&inner, path);
        if let Some(watcher) = watcher {
            inner
                .watchers
                .entry(path.to_string())
                .or_default()
                .push(watcher);
        }
        Ok(names)
    }

    fn add_session_listener(&self, listener: SessionListener) {
        self.lock().listeners.push(listener);
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.watchers.clear();
        inner.listeners.clear();
        let ephemerals: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, r)| r.ephemeral)
            .map(|(p, _)| p.clone())
            .collect();
        for path in ephemerals {
            inner.nodes.remove(&path);
        }
        Ok(())
    }
}
