//! Coordination service contract and an in-process implementation.
//!
//! The registry only needs a hierarchical namespace with ephemeral nodes
//! and child watches. [`InMemoryCoordinator`] provides that inside one
//! process: every [`CoordinatorSession`] owns the ephemeral nodes it
//! creates, and expiring the session removes them the way a crashed client
//! loses its ephemeral nodes in a real ensemble.

use crate::{CoordResult, CoordinationError};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use pilot_config::{log_registry_debug, log_registry_warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the creating session expires.
    Ephemeral,
}

/// Change to the children of a watched node. Carries the full child path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    NodeCreated(String),
    NodeDeleted(String),
}

impl WatchEvent {
    pub fn path(&self) -> &str {
        match self {
            WatchEvent::NodeCreated(path) | WatchEvent::NodeDeleted(path) => path,
        }
    }

    /// Last path segment.
    pub fn node_name(&self) -> &str {
        let path = self.path();
        path.rsplit_once('/').map_or(path, |(_, name)| name)
    }
}

pub type WatchCallback = Box<dyn Fn(WatchEvent) + Send + Sync>;

/// The operations the registry relies on.
pub trait CoordinationService: Send + Sync {
    fn create(&self, path: &str, mode: CreateMode) -> CoordResult<()>;

    /// Fails with [`CoordinationError::NotEmpty`] if the node has children.
    fn delete(&self, path: &str) -> CoordResult<()>;

    fn exists(&self, path: &str) -> CoordResult<bool>;

    /// Child names (not paths), sorted.
    fn get_children(&self, path: &str) -> CoordResult<Vec<String>>;

    /// Persistent watch on the direct children of `path`. Callbacks run on
    /// the service's callback thread, never on the caller's.
    fn watch_children(&self, path: &str, callback: WatchCallback) -> CoordResult<()>;

    /// Create `path` and any missing ancestors as persistent nodes.
    fn create_recursive(&self, path: &str) -> CoordResult<()> {
        validate(path)?;
        let mut prefix = String::new();
        for segment in path.split('/').skip(1) {
            prefix.push('/');
            prefix.push_str(segment);
            match self.create(&prefix, CreateMode::Persistent) {
                Ok(()) | Err(CoordinationError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete `path` and everything below it. A missing node is not an error.
    fn delete_recursive(&self, path: &str) -> CoordResult<()> {
        let children = match self.get_children(path) {
            Ok(children) => children,
            Err(CoordinationError::NoNode(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        for child in children {
            self.delete_recursive(&join(path, &child))?;
        }
        match self.delete(path) {
            Ok(()) | Err(CoordinationError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

fn validate(path: &str) -> CoordResult<()> {
    let well_formed = path.starts_with('/')
        && (path == "/" || (!path.ends_with('/') && !path.contains("//")));
    if well_formed {
        Ok(())
    } else {
        Err(CoordinationError::InvalidPath(path.to_string()))
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

#[derive(Debug)]
struct Node {
    /// Owning session for ephemeral nodes
    owner: Option<u64>,
}

type Dispatch = (Arc<WatchCallback>, WatchEvent);

struct Inner {
    nodes: Mutex<BTreeMap<String, Node>>,
    watches: Mutex<Vec<(String, Arc<WatchCallback>)>>,
    available: AtomicBool,
    next_session: AtomicU64,
    events: Sender<Dispatch>,
}

impl Inner {
    fn check_available(&self) -> CoordResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CoordinationError::Unavailable("service not reachable".into()))
        }
    }

    fn notify(&self, event: WatchEvent) {
        let parent = parent_of(event.path());
        for (watched, callback) in self.watches.lock().iter() {
            if watched == parent {
                let _ = self.events.send((Arc::clone(callback), event.clone()));
            }
        }
    }

    fn has_children(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
        let prefix = join(path, "");
        nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }

    fn create(&self, session: u64, path: &str, mode: CreateMode) -> CoordResult<()> {
        self.check_available()?;
        validate(path)?;
        if path == "/" {
            return Err(CoordinationError::NodeExists(path.into()));
        }
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.into()));
        }
        let parent = parent_of(path);
        if parent != "/" && !nodes.contains_key(parent) {
            return Err(CoordinationError::NoNode(parent.into()));
        }
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(session),
        };
        nodes.insert(path.to_string(), Node { owner });
        self.notify(WatchEvent::NodeCreated(path.to_string()));
        Ok(())
    }

    fn delete(&self, path: &str) -> CoordResult<()> {
        self.check_available()?;
        validate(path)?;
        let mut nodes = self.nodes.lock();
        if !nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.into()));
        }
        if Self::has_children(&nodes, path) {
            return Err(CoordinationError::NotEmpty(path.into()));
        }
        nodes.remove(path);
        self.notify(WatchEvent::NodeDeleted(path.to_string()));
        Ok(())
    }

    fn exists(&self, path: &str) -> CoordResult<bool> {
        self.check_available()?;
        validate(path)?;
        Ok(path == "/" || self.nodes.lock().contains_key(path))
    }

    fn get_children(&self, path: &str) -> CoordResult<Vec<String>> {
        self.check_available()?;
        validate(path)?;
        let nodes = self.nodes.lock();
        if path != "/" && !nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.into()));
        }
        let prefix = join(path, "");
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }

    fn watch_children(&self, path: &str, callback: WatchCallback) -> CoordResult<()> {
        self.check_available()?;
        validate(path)?;
        self.watches
            .lock()
            .push((path.to_string(), Arc::new(callback)));
        Ok(())
    }

    /// Drop every ephemeral node owned by `session`. Children go first so
    /// watchers see deletions bottom-up.
    fn expire(&self, session: u64) {
        let mut nodes = self.nodes.lock();
        let owned: Vec<String> = nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned.into_iter().rev() {
            nodes.remove(&path);
            self.notify(WatchEvent::NodeDeleted(path));
        }
    }
}

/// In-process coordination service. Cloning shares the same namespace.
///
/// Operations issued directly on the coordinator run in its own
/// long-lived session; use [`InMemoryCoordinator::session`] for a client
/// whose ephemeral nodes can be expired independently.
#[derive(Clone)]
pub struct InMemoryCoordinator {
    inner: Arc<Inner>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        let (events, rx) = unbounded::<Dispatch>();
        let spawned = thread::Builder::new()
            .name("coord-callbacks".into())
            .spawn(move || {
                for (callback, event) in rx {
                    log_registry_debug!("Dispatching watch event", event = ?event);
                    callback(event);
                }
            });
        if let Err(e) = spawned {
            log_registry_warn!(
                "Watch callback thread failed to start, watches will not fire",
                error = %e
            );
        }
        Self {
            inner: Arc::new(Inner {
                nodes: Mutex::new(BTreeMap::new()),
                watches: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
                next_session: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// A new client session.
    pub fn session(&self) -> CoordinatorSession {
        CoordinatorSession {
            inner: Arc::clone(&self.inner),
            id: self.inner.next_session.fetch_add(1, Ordering::Relaxed),
            expired: AtomicBool::new(false),
        }
    }

    /// Simulate the service becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    /// Number of nodes, excluding the root.
    pub fn node_count(&self) -> usize {
        self.inner.nodes.lock().len()
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCoordinator")
            .field("nodes", &self.node_count())
            .field("available", &self.is_available())
            .finish()
    }
}

const COORDINATOR_SESSION: u64 = 0;

impl CoordinationService for InMemoryCoordinator {
    fn create(&self, path: &str, mode: CreateMode) -> CoordResult<()> {
        self.inner.create(COORDINATOR_SESSION, path, mode)
    }

    fn delete(&self, path: &str) -> CoordResult<()> {
        self.inner.delete(path)
    }

    fn exists(&self, path: &str) -> CoordResult<bool> {
        self.inner.exists(path)
    }

    fn get_children(&self, path: &str) -> CoordResult<Vec<String>> {
        self.inner.get_children(path)
    }

    fn watch_children(&self, path: &str, callback: WatchCallback) -> CoordResult<()> {
        self.inner.watch_children(path, callback)
    }
}

/// One client's connection to an [`InMemoryCoordinator`].
pub struct CoordinatorSession {
    inner: Arc<Inner>,
    id: u64,
    expired: AtomicBool,
}

impl CoordinatorSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// End the session: its ephemeral nodes disappear and every later call
    /// fails as unavailable.
    pub fn expire(&self) {
        if !self.expired.swap(true, Ordering::AcqRel) {
            self.inner.expire(self.id);
        }
    }

    fn check_live(&self) -> CoordResult<()> {
        if self.expired.load(Ordering::Acquire) {
            Err(CoordinationError::Unavailable(format!("session {} expired", self.id)))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CoordinatorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorSession")
            .field("id", &self.id)
            .field("expired", &self.expired.load(Ordering::Relaxed))
            .finish()
    }
}

impl CoordinationService for CoordinatorSession {
    fn create(&self, path: &str, mode: CreateMode) -> CoordResult<()> {
        self.check_live()?;
        self.inner.create(self.id, path, mode)
    }

    fn delete(&self, path: &str) -> CoordResult<()> {
        self.check_live()?;
        self.inner.delete(path)
    }

    fn exists(&self, path: &str) -> CoordResult<bool> {
        self.check_live()?;
        self.inner.exists(path)
    }

    fn get_children(&self, path: &str) -> CoordResult<Vec<String>> {
        self.check_live()?;
        self.inner.get_children(path)
    }

    fn watch_children(&self, path: &str, callback: WatchCallback) -> CoordResult<()> {
        self.check_live()?;
        self.inner.watch_children(path, callback)
    }
}
