//! Filesystem-backed reference driver for [`StateStore`].
//!
//! Persistent nodes are directories (payload in a `.data` file inside);
//! ephemeral nodes are plain files. The filesystem has no sessions, so
//! ephemerality is emulated: a background task re-touches every ephemeral
//! node this store created each refresh interval, and readers sweep any
//! node whose last-touched time is older than the timeout. Keep the
//! refresh interval below a third of the timeout.
//!
//! Sequence numbers are tracked in a `.sequence` file next to the
//! siblings so they stay monotonic across process restarts.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::task::JoinHandle;

use super::{
    format_sequence, parent_of, ChildWatcher, SessionListener, SessionStatus, StateStore,
    StoreError, WatchEvent, WatchKind, SEQUENCE_WIDTH,
};
use crate::config::{GuardianConfig, PERSIST_INTERVAL, PERSIST_TIMEOUT, STATE_SERVICE_HOSTS};

const DATA_FILE: &str = ".data";
const SEQUENCE_FILE: &str = ".sequence";

#[derive(Clone, Debug, PartialEq, Eq, Default)]
struct PathState {
    exists: bool,
    data: Option<Vec<u8>>,
    children: BTreeSet<String>,
}

struct WatchSlot {
    watchers: Vec<ChildWatcher>,
    last: PathState,
}

#[derive(Default)]
struct Shared {
    /// Ephemeral store paths this session keeps alive.
    touch: Mutex<FxHashSet<String>>,
    watches: Mutex<FxHashMap<String, WatchSlot>>,
    /// Guards sequence allocation within this process.
    sequence_lock: Mutex<()>,
}

/// TTL-emulating filesystem store.
pub struct FileStore {
    base: PathBuf,
    timeout: Duration,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileStore {
    /// Open a store rooted at `base`, spawning the refresher/poller task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        base: impl Into<PathBuf>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let base = base.into();
        std::fs::create_dir_all(&base).map_err(|e| StoreError::Io {
            path: base.display().to_string(),
            message: e.to_string(),
        })?;
        let shared = Arc::new(Shared::default());
        let store = Self {
            base: base.clone(),
            timeout,
            shared: shared.clone(),
            task: Mutex::new(None),
        };
        let handle = tokio::spawn(refresher_loop(base, shared, interval, timeout));
        *store.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(store)
    }

    /// Open a store using `STATE_SERVICE_HOSTS` as the base directory and
    /// the `PERSIST_INTERVAL` / `PERSIST_TIMEOUT` tuning keys.
    pub fn from_config(config: &GuardianConfig) -> Result<Self, StoreError> {
        let base = config
            .get(STATE_SERVICE_HOSTS)
            .map_err(|e| StoreError::Io {
                path: String::new(),
                message: e.to_string(),
            })?
            .to_string();
        let interval = config
            .duration_secs(PERSIST_INTERVAL, 0.4)
            .unwrap_or(Duration::from_millis(400));
        let timeout = config
            .duration_secs(PERSIST_TIMEOUT, 3.0)
            .unwrap_or(Duration::from_secs(3));
        Self::open(base, interval, timeout)
    }

    fn os_path(&self, path: &str) -> PathBuf {
        self.base.join(path.trim_start_matches('/'))
    }

    fn io_err(path: &str, error: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.into(),
            message: error.to_string(),
        }
    }

    fn expired(&self, file: &Path) -> bool {
        match file.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified
                .elapsed()
                .map(|age| age > self.timeout)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Delete an expired ephemeral file and forget its bookkeeping.
    fn sweep(&self, path: &str, file: &Path) {
        let _ = std::fs::remove_file(file);
        if let Ok(mut touch) = self.shared.touch.lock() {
            touch.remove(path);
        }
        tracing::debug!(path, "swept expired ephemeral node");
    }

    fn alloc_sequence(&self, path: &str) -> Result<String, StoreError> {
        let _guard = self
            .shared
            .sequence_lock
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let os = self.os_path(path);
        let dir = os.parent().ok_or_else(|| StoreError::Io {
            path: path.into(),
            message: "path has no parent".into(),
        })?;
        let basename = os
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let seq_file = dir.join(SEQUENCE_FILE);
        let mut max: i64 = std::fs::read_to_string(&seq_file)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(-1);
        // Also scan siblings so a deleted .sequence file never reissues ids.
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(suffix) = name.strip_prefix(&basename) {
                    if suffix.len() == SEQUENCE_WIDTH {
                        if let Ok(n) = suffix.parse::<i64>() {
                            max = max.max(n);
                        }
                    }
                }
            }
        }
        let next = (max + 1) as u64;
        std::fs::write(&seq_file, next.to_string()).map_err(|e| Self::io_err(path, e))?;
        Ok(format_sequence(path, next))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let os = self.os_path(path);
        if os.is_dir() {
            match std::fs::read(os.join(DATA_FILE)) {
                Ok(data) => Ok(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
                Err(e) => Err(Self::io_err(path, e)),
            }
        } else if os.is_file() {
            if self.expired(&os) {
                self.sweep(path, &os);
                return Err(StoreError::NoNode { path: path.into() });
            }
            std::fs::read(&os).map_err(|e| Self::io_err(path, e))
        } else {
            Err(StoreError::NoNode { path: path.into() })
        }
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let os = self.os_path(path);
        let target = if os.is_dir() {
            os.join(DATA_FILE)
        } else if os.is_file() {
            os
        } else {
            return Err(StoreError::NoNode { path: path.into() });
        };
        std::fs::write(target, data).map_err(|e| Self::io_err(path, e))
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        ephemeral: bool,
        sequence: bool,
        make_path: bool,
    ) -> Result<String, StoreError> {
        let parent = parent_of(path).ok_or_else(|| StoreError::Io {
            path: path.into(),
            message: "path must be absolute".into(),
        })?;
        let parent_os = self.os_path(parent);
        if !parent_os.is_dir() {
            if make_path {
                std::fs::create_dir_all(&parent_os).map_err(|e| Self::io_err(path, e))?;
            } else {
                return Err(StoreError::NoNode {
                    path: parent.into(),
                });
            }
        }
        if ephemeral {
            let actual = if sequence {
                self.alloc_sequence(path)?
            } else {
                if self.os_path(path).exists() {
                    return Err(StoreError::NodeExists { path: path.into() });
                }
                path.to_string()
            };
            std::fs::write(self.os_path(&actual), data).map_err(|e| Self::io_err(&actual, e))?;
            if let Ok(mut touch) = self.shared.touch.lock() {
                touch.insert(actual.clone());
            }
            Ok(actual)
        } else {
            let os = self.os_path(path);
            if os.exists() {
                return Err(StoreError::NodeExists { path: path.into() });
            }
            std::fs::create_dir_all(&os).map_err(|e| Self::io_err(path, e))?;
            std::fs::write(os.join(DATA_FILE), data).map_err(|e| Self::io_err(path, e))?;
            Ok(path.to_string())
        }
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<(), StoreError> {
        let os = self.os_path(path);
        if os.is_dir() {
            let has_children = std::fs::read_dir(&os)
                .map_err(|e| Self::io_err(path, e))?
                .flatten()
                .any(|e| {
                    let name = e.file_name();
                    name != DATA_FILE && name != SEQUENCE_FILE
                });
            if has_children && !recursive {
                return Err(StoreError::Io {
                    path: path.into(),
                    message: "node has children".into(),
                });
            }
            std::fs::remove_dir_all(&os).map_err(|e| Self::io_err(path, e))?;
        } else if os.is_file() {
            std::fs::remove_file(&os).map_err(|e| Self::io_err(path, e))?;
        } else {
            return Err(StoreError::NoNode { path: path.into() });
        }
        if let Ok(mut touch) = self.shared.touch.lock() {
            touch.retain(|p| !p.starts_with(path));
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let os = self.os_path(path);
        if os.is_file() && self.expired(&os) {
            self.sweep(path, &os);
            return Ok(false);
        }
        Ok(os.exists())
    }

    async fn children(
        &self,
        path: &str,
        watcher: Option<ChildWatcher>,
    ) -> Result<Vec<String>, StoreError> {
        let os = self.os_path(path);
        if !os.is_dir() {
            return Err(StoreError::NoNode { path: path.into() });
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&os)
            .map_err(|e| Self::io_err(path, e))?
            .flatten()
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == DATA_FILE || name == SEQUENCE_FILE {
                continue;
            }
            let child_os = entry.path();
            if child_os.is_file() && self.expired(&child_os) {
                let child_path = format!("{}/{name}", path.trim_end_matches('/'));
                self.sweep(&child_path, &child_os);
                continue;
            }
            names.push(name);
        }
        names.sort();
        if let Some(watcher) = watcher {
            let state = read_state(&self.base, path, self.timeout);
            let mut watches = self
                .shared
                .watches
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            watches
                .entry(path.to_string())
                .or_insert_with(|| WatchSlot {
                    watchers: Vec::new(),
                    last: state,
                })
                .watchers
                .push(watcher);
        }
        Ok(names)
    }

    fn add_session_listener(&self, _listener: SessionListener) {
        // The filesystem has no session to lose.
        tracing::debug!("file store has no session state; listener ignored");
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
        if let Ok(mut touch) = self.shared.touch.lock() {
            touch.clear();
        }
        if let Ok(mut watches) = self.shared.watches.lock() {
            watches.clear();
        }
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

fn read_state(base: &Path, path: &str, timeout: Duration) -> PathState {
    let os = base.join(path.trim_start_matches('/'));
    if !os.exists() {
        return PathState::default();
    }
    let data = if os.is_dir() {
        std::fs::read(os.join(DATA_FILE)).ok()
    } else {
        std::fs::read(&os).ok()
    };
    let mut children = BTreeSet::new();
    if os.is_dir() {
        if let Ok(entries) = std::fs::read_dir(&os) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == DATA_FILE || name == SEQUENCE_FILE {
                    continue;
                }
                let child = entry.path();
                let stale = child.is_file()
                    && child
                        .metadata()
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|m| m.elapsed().ok())
                        .map(|age| age > timeout)
                        .unwrap_or(false);
                if !stale {
                    children.insert(name);
                }
            }
        }
    }
    PathState {
        exists: true,
        data,
        children,
    }
}

async fn refresher_loop(
    base: PathBuf,
    shared: Arc<Shared>,
    interval: Duration,
    timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;

        // Keep this session's ephemeral nodes fresh.
        let touched: Vec<String> = match shared.touch.lock() {
            Ok(touch) => touch.iter().cloned().collect(),
            Err(_) => continue,
        };
        for path in touched {
            let os = base.join(path.trim_start_matches('/'));
            let refreshed = std::fs::OpenOptions::new()
                .write(true)
                .open(&os)
                .and_then(|f| f.set_modified(SystemTime::now()));
            if refreshed.is_err() {
                if let Ok(mut touch) = shared.touch.lock() {
                    touch.remove(&path);
                }
            }
        }

        // Fire one-shot watchers whose paths changed.
        let watched: Vec<String> = match shared.watches.lock() {
            Ok(watches) => watches.keys().cloned().collect(),
            Err(_) => continue,
        };
        for path in watched {
            let state = read_state(&base, &path, timeout);
            let fired = {
                let mut watches = match shared.watches.lock() {
                    Ok(w) => w,
                    Err(_) => continue,
                };
                let Some(slot) = watches.get_mut(&path) else {
                    continue;
                };
                if slot.last == state {
                    continue;
                }
                let kind = if slot.last.exists != state.exists {
                    if state.exists {
                        WatchKind::Created
                    } else {
                        WatchKind::Deleted
                    }
                } else if slot.last.data != state.data {
                    WatchKind::Changed
                } else {
                    WatchKind::Child
                };
                let slot = watches.remove(&path).expect("slot present");
                (slot.watchers, kind)
            };
            let (watchers, kind) = fired;
            for watcher in watchers {
                watcher(WatchEvent::new(kind, SessionStatus::Connected, path.clone()));
            }
        }
    }
}
