//! Per-address cache of cheap client handles.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;

/// Caches one client per address, building missing ones with a factory.
///
/// Unlike [`ConnSet`](crate::ConnSet) there are no leases or eviction: entries live until
/// [`release`](Self::release) is called. The factory runs outside the lock, so concurrent misses
/// may build several clients; the first one stored wins and the others are dropped.
pub struct ClientCache<T> {
    factory: Arc<dyn Fn(&str) -> T + Send + Sync>,
    clients: RwLock<HashMap<String, T>>,
}

impl<T: Clone> ClientCache<T> {
    /// Creates an empty cache.
    pub fn new(factory: impl Fn(&str) -> T + Send + Sync + 'static) -> Self {
        Self { factory: Arc::new(factory), clients: RwLock::new(HashMap::new()) }
    }

    /// Returns the client for `addr`, building it on a miss.
    pub fn get(&self, addr: &str) -> T {
        if let Some(client) = self.clients.read().get(addr) {
            return client.clone();
        }

        let client = (self.factory)(addr);
        self.clients.write().entry(addr.to_string()).or_insert(client).clone()
    }

    /// Forgets the client for `addr`.
    pub fn release(&self, addr: &str) {
        self.clients.write().remove(addr);
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

impl<T> fmt::Debug for ClientCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCache").field("len", &self.clients.read().len()).finish()
    }
}
