//! Local cache contract and the in-memory implementation.

use crate::entity::{is_temporary_id, Entity};
use crate::error::DataStoreResult;
use crate::query::Query;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A local, queryable store of one collection's entities keyed by id.
///
/// Each call is atomic on its own. Callers must not assume a compound
/// read-modify-write across two calls is atomic.
pub trait Cache: Send + Sync {
    /// Name of the cached collection.
    fn collection(&self) -> &str;

    /// Finds an entity by id.
    fn find_by_id(&self, id: &str) -> DataStoreResult<Option<Entity>>;

    /// Finds the entities matching a query.
    fn find(&self, query: &Query) -> DataStoreResult<Vec<Entity>>;

    /// Counts the entities matching a query.
    fn count(&self, query: &Query) -> DataStoreResult<usize>;

    /// Returns true if the cache holds no entity.
    fn is_empty(&self) -> DataStoreResult<bool>;

    /// Inserts or replaces an entity.
    fn save(&self, entity: Entity) -> DataStoreResult<()>;

    /// Inserts or replaces several entities.
    fn save_all(&self, entities: Vec<Entity>) -> DataStoreResult<()> {
        for entity in entities {
            self.save(entity)?;
        }
        Ok(())
    }

    /// Removes an entity; returns the number of entities removed.
    fn remove(&self, entity: &Entity) -> DataStoreResult<usize>;

    /// Removes the entities matching a query; returns how many were removed.
    fn remove_by_query(&self, query: &Query) -> DataStoreResult<usize>;

    /// Removes every entity.
    fn clear(&self) -> DataStoreResult<()>;

    /// Builds the `{id -> last-modified time}` index of a query's scope.
    ///
    /// Skip, limit, sort and projection are ignored. Entities with a
    /// temporary id are left out: the server has never seen them, so no
    /// server index can account for them. Entities without a timestamp are
    /// indexed with an empty one, which any server time is newer than.
    fn id_lmt_index(&self, query: &Query) -> DataStoreResult<HashMap<String, String>> {
        let entities = self.find(&query.scope())?;
        Ok(entities
            .into_iter()
            .filter_map(|entity| {
                let id = entity.id()?;
                if is_temporary_id(id) {
                    return None;
                }
                let lmt = entity.last_modified_time().unwrap_or_default();
                Some((id.to_string(), lmt.to_string()))
            })
            .collect())
    }
}

/// Hands out one cache per collection.
pub trait CacheManager: Send + Sync {
    /// Returns the cache of a collection, creating it if needed.
    fn cache(&self, collection: &str) -> Arc<dyn Cache>;

    /// Empties every cache.
    fn clear_all(&self) -> DataStoreResult<()>;
}

/// An in-memory cache.
#[derive(Debug)]
pub struct MemoryCache {
    collection: String,
    entities: RwLock<BTreeMap<String, Entity>>,
}

impl MemoryCache {
    /// Creates an empty cache for a collection.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            entities: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the number of cached entities.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Returns every cached id in order.
    pub fn ids(&self) -> Vec<String> {
        self.entities.read().keys().cloned().collect()
    }
}

impl Cache for MemoryCache {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn find_by_id(&self, id: &str) -> DataStoreResult<Option<Entity>> {
        Ok(self.entities.read().get(id).cloned())
    }

    fn find(&self, query: &Query) -> DataStoreResult<Vec<Entity>> {
        let entities = self.entities.read();
        Ok(query.apply(entities.values().cloned()))
    }

    fn count(&self, query: &Query) -> DataStoreResult<usize> {
        let entities = self.entities.read();
        let matching = entities.values().filter(|e| query.matches(e)).count();
        let skipped = matching.saturating_sub(query.skip.unwrap_or(0));
        Ok(query.limit.map_or(skipped, |limit| skipped.min(limit)))
    }

    fn is_empty(&self) -> DataStoreResult<bool> {
        Ok(self.entities.read().is_empty())
    }

    fn save(&self, entity: Entity) -> DataStoreResult<()> {
        if let Some(id) = entity.id() {
            let id = id.to_string();
            self.entities.write().insert(id, entity);
        }
        Ok(())
    }

    fn save_all(&self, entities: Vec<Entity>) -> DataStoreResult<()> {
        let mut cached = self.entities.write();
        for entity in entities {
            if let Some(id) = entity.id() {
                cached.insert(id.to_string(), entity);
            }
        }
        Ok(())
    }

    fn remove(&self, entity: &Entity) -> DataStoreResult<usize> {
        let Some(id) = entity.id() else {
            return Ok(0);
        };
        Ok(usize::from(self.entities.write().remove(id).is_some()))
    }

    fn remove_by_query(&self, query: &Query) -> DataStoreResult<usize> {
        let mut entities = self.entities.write();
        let doomed: Vec<String> = query
            .apply(entities.values().cloned())
            .into_iter()
            .filter_map(|e| e.id().map(str::to_string))
            .collect();
        for id in &doomed {
            entities.remove(id);
        }
        Ok(doomed.len())
    }

    fn clear(&self) -> DataStoreResult<()> {
        self.entities.write().clear();
        Ok(())
    }
}

/// Hands out [`MemoryCache`]s.
#[derive(Debug, Default)]
pub struct MemoryCacheManager {
    caches: Mutex<HashMap<String, Arc<MemoryCache>>>,
}

impl MemoryCacheManager {
    /// Creates a manager with no caches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the concrete cache of a collection.
    pub fn memory_cache(&self, collection: &str) -> Arc<MemoryCache> {
        let mut caches = self.caches.lock();
        Arc::clone(
            caches
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(MemoryCache::new(collection))),
        )
    }
}

impl CacheManager for MemoryCacheManager {
    fn cache(&self, collection: &str) -> Arc<dyn Cache> {
        self.memory_cache(collection)
    }

    fn clear_all(&self) -> DataStoreResult<()> {
        for cache in self.caches.lock().values() {
            cache.clear()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::new_temporary_id;
    use crate::query::Filter;
    use serde_json::json;

    fn entity(id: &str, lmt: Option<&str>, age: i64) -> Entity {
        let mut value = json!({"_id": id, "age": age});
        if let Some(lmt) = lmt {
            value["_kmd"] = json!({"lmt": lmt});
        }
        Entity::from_value(value).unwrap()
    }

    #[test]
    fn save_find_remove() {
        let cache = MemoryCache::new("people");
        assert!(cache.is_empty().unwrap());

        cache.save(entity("a", None, 1)).unwrap();
        cache.save(entity("b", None, 2)).unwrap();
        cache.save(entity("a", None, 3)).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.find_by_id("a").unwrap().unwrap().get("age"), Some(&json!(3)));
        assert_eq!(cache.count(&Query::filtered(Filter::gt("age", 2))).unwrap(), 1);

        assert_eq!(cache.remove(&Entity::with_id("a")).unwrap(), 1);
        assert_eq!(cache.remove(&Entity::with_id("a")).unwrap(), 0);
        assert_eq!(cache.remove_by_query(&Query::new()).unwrap(), 1);
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn entities_without_id_are_ignored() {
        let cache = MemoryCache::new("people");
        cache.save(Entity::new()).unwrap();
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn count_honours_paging() {
        let cache = MemoryCache::new("people");
        cache
            .save_all((0..10).map(|i| entity(&format!("id{i}"), None, i)).collect())
            .unwrap();
        assert_eq!(cache.count(&Query::new().with_skip(7)).unwrap(), 3);
        assert_eq!(cache.count(&Query::new().with_limit(4)).unwrap(), 4);
    }

    #[test]
    fn index_skips_temporary_ids_and_paging() {
        let cache = MemoryCache::new("people");
        cache.save(entity("a", Some("2016-01-01T00:00:00Z"), 1)).unwrap();
        cache.save(entity("b", None, 2)).unwrap();
        cache.save(entity(&new_temporary_id(), None, 3)).unwrap();

        let index = cache.id_lmt_index(&Query::new().with_limit(1)).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index["a"], "2016-01-01T00:00:00Z");
        assert_eq!(index["b"], "");
    }

    #[test]
    fn manager_shares_caches() {
        let manager = MemoryCacheManager::new();
        manager.cache("people").save(entity("a", None, 1)).unwrap();
        assert_eq!(manager.memory_cache("people").len(), 1);
        assert!(manager.cache("books").is_empty().unwrap());

        manager.clear_all().unwrap();
        assert!(manager.cache("people").is_empty().unwrap());
    }
}
