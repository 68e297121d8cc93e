//! Pool-owned codec registry and query cache.
//!
//! Both caches are shared by every connection of a pool and are reset together
//! when the connect arguments change.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Default number of entries kept by the query cache.
pub const DEFAULT_QUERY_CACHE_SIZE: usize = 1000;

/// Result format requested for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    #[default]
    Native,
    Json,
    None,
}

/// Capability bits a query needs on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Capabilities(u64);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const MODIFICATIONS: Capabilities = Capabilities(1 << 0);
    pub const SESSION_CONFIG: Capabilities = Capabilities(1 << 1);
    pub const TRANSACTION: Capabilities = Capabilities(1 << 2);
    pub const DDL: Capabilities = Capabilities(1 << 3);

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    /// A query with no capabilities is read-only and safe to retry.
    pub fn is_read_only(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self::Output {
        Capabilities(self.0 | rhs.0)
    }
}

/// Key of a cached query description.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub query: String,
    pub output: OutputFormat,
    pub expect_one: bool,
}

impl QueryKey {
    pub fn new(query: impl Into<String>, output: OutputFormat, expect_one: bool) -> Self {
        Self {
            query: query.into(),
            output,
            expect_one,
        }
    }
}

/// Cached description of a parsed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryInfo {
    pub capabilities: Capabilities,
    pub output_type: Option<Uuid>,
}

/// Description of a server type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub id: Uuid,
    pub name: String,
}

/// Type descriptors keyed by type id.
#[derive(Debug, Default)]
pub struct CodecsRegistry {
    descriptors: RwLock<HashMap<Uuid, Arc<TypeDescriptor>>>,
}

impl CodecsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<TypeDescriptor>> {
        self.descriptors.read().get(id).cloned()
    }

    /// Register a descriptor, returning the one already present for the id if any.
    pub fn get_or_insert(&self, descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
        if let Some(existing) = self.get(&descriptor.id) {
            return existing;
        }
        let mut descriptors = self.descriptors.write();
        descriptors
            .entry(descriptor.id)
            .or_insert_with(|| Arc::new(descriptor))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.descriptors.write().clear();
    }
}

struct LruEntry {
    info: QueryInfo,
    last_used: u64,
}

struct LruState {
    entries: HashMap<QueryKey, LruEntry>,
    tick: u64,
}

/// Bounded LRU map from query key to query description.
pub struct QueryCache {
    capacity: usize,
    state: Mutex<LruState>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                tick: 0,
            }),
        }
    }

    pub fn get(&self, key: &QueryKey) -> Option<QueryInfo> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let entry = state.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.info.clone())
    }

    pub fn insert(&self, key: QueryKey, info: QueryInfo) {
        let mut state = self.state.lock();
        state.tick += 1;
        let last_used = state.tick;
        state.entries.insert(key, LruEntry { info, last_used });

        if state.entries.len() > self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                state.entries.remove(&oldest);
            }
        }
    }

    pub fn capabilities(&self, key: &QueryKey) -> Option<Capabilities> {
        self.get(key).map(|info| info.capabilities)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.tick = 0;
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_CACHE_SIZE)
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Cheaply clonable handle to a pool's caches.
#[derive(Debug, Clone, Default)]
pub struct QueryCacheHandle {
    pub codecs: Arc<CodecsRegistry>,
    pub queries: Arc<QueryCache>,
}

impl QueryCacheHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.codecs.clear();
        self.queries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(capabilities: Capabilities) -> QueryInfo {
        QueryInfo {
            capabilities,
            output_type: None,
        }
    }

    #[test]
    fn test_capabilities_read_only() {
        assert!(Capabilities::NONE.is_read_only());
        assert!(!Capabilities::MODIFICATIONS.is_read_only());
        let both = Capabilities::MODIFICATIONS | Capabilities::DDL;
        assert!(both.contains(Capabilities::DDL));
        assert!(!both.contains(Capabilities::TRANSACTION));
    }

    #[test]
    fn test_query_cache_evicts_least_recently_used() {
        let cache = QueryCache::new(2);
        let a = QueryKey::new("get a", OutputFormat::Json, false);
        let b = QueryKey::new("get b", OutputFormat::Json, false);
        let c = QueryKey::new("get c", OutputFormat::Json, false);

        cache.insert(a.clone(), info(Capabilities::NONE));
        cache.insert(b.clone(), info(Capabilities::NONE));
        // touch a so b becomes the oldest
        assert!(cache.get(&a).is_some());
        cache.insert(c.clone(), info(Capabilities::MODIFICATIONS));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&b).is_none());
        assert_eq!(cache.capabilities(&c), Some(Capabilities::MODIFICATIONS));
    }

    #[test]
    fn test_query_key_distinguishes_output_format() {
        let cache = QueryCache::default();
        cache.insert(
            QueryKey::new("get a", OutputFormat::Json, false),
            info(Capabilities::NONE),
        );
        assert!(
            cache
                .get(&QueryKey::new("get a", OutputFormat::Native, false))
                .is_none()
        );
    }

    #[test]
    fn test_codecs_registry_keeps_first_descriptor() {
        let registry = CodecsRegistry::new();
        let id = Uuid::from_u128(0x105);
        let first = registry.get_or_insert(TypeDescriptor {
            id,
            name: "std::int64".to_string(),
        });
        let second = registry.get_or_insert(TypeDescriptor {
            id,
            name: "other".to_string(),
        });
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handle_clear_resets_both_caches() {
        let handle = QueryCacheHandle::new();
        handle.queries.insert(
            QueryKey::new("get a", OutputFormat::Json, false),
            info(Capabilities::NONE),
        );
        handle.codecs.get_or_insert(TypeDescriptor {
            id: Uuid::new_v4(),
            name: "std::str".to_string(),
        });
        handle.clear();
        assert!(handle.queries.is_empty());
        assert!(handle.codecs.is_empty());
    }
}
