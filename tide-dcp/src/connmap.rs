//! Registry of DCP connections: lookup by name and cookie, dead-connection reaping, and
//! pending-notification dispatch.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use hashbrown::{HashMap, HashSet};
use tracing::{debug, info};

use tide_common::error::DcpResult;
use tide_common::ids::Cookie;
use tide_proto::message::OpenFlags;
use tide_storage::bucket::KvBucket;

use crate::consumer::DcpConsumer;
use crate::producer::DcpProducer;

/// Host callback surface handed to the registry at construction.
///
/// The registry never reaches into the front-end through globals; waking a parked connection
/// goes through this capability.
pub trait CookieHost: Send + Sync {
    /// Wakes the front-end thread parked on `cookie`.
    fn notify_io_complete(&self, cookie: Cookie, status: DcpResult<()>);
}

/// Host that drops notifications (embedding without a front-end).
#[derive(Debug, Default)]
pub struct NullCookieHost;

impl CookieHost for NullCookieHost {
    fn notify_io_complete(&self, _cookie: Cookie, _status: DcpResult<()>) {}
}

/// One registered connection.
#[derive(Debug, Clone)]
pub enum ConnHandle {
    /// Producer (or notifier) connection.
    Producer(Arc<DcpProducer>),
    /// Consumer connection.
    Consumer(Arc<DcpConsumer>),
}

impl ConnHandle {
    /// Connection name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Producer(producer) => producer.name(),
            Self::Consumer(consumer) => consumer.name(),
        }
    }

    /// Transport cookie.
    #[must_use]
    pub fn cookie(&self) -> Cookie {
        match self {
            Self::Producer(producer) => producer.cookie(),
            Self::Consumer(consumer) => consumer.cookie(),
        }
    }

    /// Whether the front-end has parked this connection.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        match self {
            Self::Producer(producer) => producer.is_paused(),
            Self::Consumer(consumer) => consumer.is_paused(),
        }
    }

    /// Flags the connection for teardown.
    pub fn flag_disconnect(&self) {
        match self {
            Self::Producer(producer) => producer.flag_disconnect(),
            Self::Consumer(consumer) => consumer.flag_disconnect(),
        }
    }

    /// Whether the connection has been flagged for teardown.
    #[must_use]
    pub fn do_disconnect(&self) -> bool {
        match self {
            Self::Producer(producer) => producer.do_disconnect(),
            Self::Consumer(consumer) => consumer.do_disconnect(),
        }
    }

    /// Tears down every stream owned by the connection.
    pub fn close_all_streams(&self) {
        match self {
            Self::Producer(producer) => producer.close_all_streams(),
            Self::Consumer(consumer) => consumer.close_all_streams(),
        }
    }

    /// Emits connection stats through the visitor.
    pub fn add_stats(&self, visitor: &mut dyn FnMut(&str, String)) {
        match self {
            Self::Producer(producer) => producer.add_stats(visitor),
            Self::Consumer(consumer) => consumer.add_stats(visitor),
        }
    }
}

#[derive(Debug, Default)]
struct ConnStore {
    by_cookie: HashMap<Cookie, ConnHandle>,
    by_name: HashMap<String, Cookie>,
}

/// Registry owning every DCP connection for one bucket.
#[derive(Clone)]
pub struct DcpConnMap {
    inner: Arc<ConnMapInner>,
}

struct ConnMapInner {
    bucket: Arc<KvBucket>,
    host: Arc<dyn CookieHost>,
    store: RwLock<ConnStore>,
    dead: Mutex<Vec<ConnHandle>>,
    pending_notifications: Mutex<HashSet<Cookie>>,
}

impl std::fmt::Debug for DcpConnMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpConnMap")
            .field("connections", &self.connection_count())
            .field("dead", &self.dead_connections_count())
            .finish_non_exhaustive()
    }
}

impl DcpConnMap {
    /// Creates the registry for one bucket with an injected host surface.
    #[must_use]
    pub fn new(bucket: Arc<KvBucket>, host: Arc<dyn CookieHost>) -> Self {
        Self {
            inner: Arc::new(ConnMapInner {
                bucket,
                host,
                store: RwLock::new(ConnStore::default()),
                dead: Mutex::new(Vec::new()),
                pending_notifications: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn store_read(&self) -> std::sync::RwLockReadGuard<'_, ConnStore> {
        self.inner
            .store
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn store_write(&self) -> std::sync::RwLockWriteGuard<'_, ConnStore> {
        self.inner
            .store
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn dead_guard(&self) -> MutexGuard<'_, Vec<ConnHandle>> {
        self.inner
            .dead
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn pending_guard(&self) -> MutexGuard<'_, HashSet<Cookie>> {
        self.inner
            .pending_notifications
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Supersedes any connection already holding `name`, and rejects a duplicate cookie.
    ///
    /// Returns `None` when `cookie` is already in use; the prior owner is flagged for
    /// disconnect either way.
    fn admit(&self, store: &mut ConnStore, cookie: Cookie, name: &str) -> bool {
        if let Some(existing_cookie) = store.by_name.get(name).copied() {
            if let Some(existing) = store.by_cookie.get(&existing_cookie) {
                debug!(name, "superseding connection with duplicate name");
                existing.flag_disconnect();
            }
        }
        if let Some(existing) = store.by_cookie.get(&cookie) {
            debug!(cookie, "rejecting connection with duplicate cookie");
            existing.flag_disconnect();
            return false;
        }
        true
    }

    /// Opens a producer (or notifier) connection.
    #[must_use]
    pub fn new_producer(
        &self,
        cookie: Cookie,
        name: &str,
        flags: OpenFlags,
    ) -> Option<Arc<DcpProducer>> {
        let mut store = self.store_write();
        if !self.admit(&mut store, cookie, name) {
            return None;
        }
        let producer = Arc::new(DcpProducer::new(
            Arc::clone(&self.inner.bucket),
            cookie,
            name.to_owned(),
            flags,
        ));
        store
            .by_cookie
            .insert(cookie, ConnHandle::Producer(Arc::clone(&producer)));
        store.by_name.insert(name.to_owned(), cookie);
        info!(name, cookie, "producer connection opened");
        Some(producer)
    }

    /// Opens a consumer connection.
    #[must_use]
    pub fn new_consumer(&self, cookie: Cookie, name: &str) -> Option<Arc<DcpConsumer>> {
        let mut store = self.store_write();
        if !self.admit(&mut store, cookie, name) {
            return None;
        }
        let consumer = Arc::new(DcpConsumer::new(
            Arc::clone(&self.inner.bucket),
            cookie,
            name.to_owned(),
        ));
        store
            .by_cookie
            .insert(cookie, ConnHandle::Consumer(Arc::clone(&consumer)));
        store.by_name.insert(name.to_owned(), cookie);
        info!(name, cookie, "consumer connection opened");
        Some(consumer)
    }

    /// Finds the connection currently holding `name`.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<ConnHandle> {
        let store = self.store_read();
        let cookie = store.by_name.get(name)?;
        store.by_cookie.get(cookie).cloned()
    }

    /// Finds the connection owned by `cookie`.
    #[must_use]
    pub fn find_by_cookie(&self, cookie: Cookie) -> Option<ConnHandle> {
        self.store_read().by_cookie.get(&cookie).cloned()
    }

    /// Number of registered (non-dead) connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.store_read().by_cookie.len()
    }

    /// Number of connections awaiting reaping.
    #[must_use]
    pub fn dead_connections_count(&self) -> usize {
        self.dead_guard().len()
    }

    /// Moves a connection to the dead list; resources are released by `manage_connections`.
    pub fn disconnect(&self, cookie: Cookie) {
        let handle = {
            let mut store = self.store_write();
            let Some(handle) = store.by_cookie.remove(&cookie) else {
                return;
            };
            if store.by_name.get(handle.name()).copied() == Some(cookie) {
                let _ = store.by_name.remove(handle.name());
            }
            handle
        };
        handle.flag_disconnect();
        info!(cookie, name = handle.name(), "connection moved to dead list");
        self.dead_guard().push(handle);
    }

    /// Reaps the dead list: tears down streams and releases the connections.
    ///
    /// Returns the number of connections reaped.
    pub fn manage_connections(&self) -> usize {
        let dead = {
            let mut guard = self.dead_guard();
            std::mem::take(&mut *guard)
        };
        let reaped = dead.len();
        for handle in dead {
            handle.close_all_streams();
            let _ = self.pending_guard().remove(&handle.cookie());
        }
        reaped
    }

    /// Flags every connection, wakes each waiting front-end at least once, and reaps.
    pub fn shutdown_all_connections(&self) {
        let handles = {
            let store = self.store_read();
            store.by_cookie.values().cloned().collect::<Vec<_>>()
        };
        for handle in &handles {
            handle.flag_disconnect();
            self.inner
                .host
                .notify_io_complete(handle.cookie(), Ok(()));
        }

        {
            let mut store = self.store_write();
            store.by_name.clear();
            let mut dead = self.dead_guard();
            dead.extend(store.by_cookie.drain().map(|(_, handle)| handle));
        }
        let _ = self.manage_connections();
    }

    /// Adds a connection to the pending-notification set.
    pub fn add_connection_to_pending(&self, cookie: Cookie) {
        let _ = self.pending_guard().insert(cookie);
    }

    /// Notifies pending paused connections; unpaused entries leave the set silently.
    ///
    /// Callbacks run outside the set's lock, so a connection re-added mid-pass is picked up on
    /// the next pass.
    pub fn process_pending_notifications(&self) {
        let batch = {
            let mut pending = self.pending_guard();
            std::mem::take(&mut *pending)
        };
        for cookie in batch {
            let Some(handle) = self.find_by_cookie(cookie) else {
                continue;
            };
            if handle.is_paused() {
                self.inner.host.notify_io_complete(cookie, Ok(()));
            }
        }
    }

    /// Emits per-connection stats for every registered connection.
    pub fn add_stats(&self, visitor: &mut dyn FnMut(&str, String)) {
        let handles = {
            let store = self.store_read();
            store.by_cookie.values().cloned().collect::<Vec<_>>()
        };
        for handle in handles {
            handle.add_stats(visitor);
        }
    }
}
