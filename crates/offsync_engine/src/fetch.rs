//! Read pipeline: auto-pagination, delta-set fetches and full-sync.
//!
//! A fetch whose query denotes the whole collection (or a pull without skip
//! or limit) is a *full sync*: cached records in the query's scope that the
//! server no longer returns are removed. A query with skip or limit only
//! sees a page of its scope, so it never removes anything. Auto-paginated
//! and chunked fetches defer the removal until every window or chunk has
//! completed, so a record is only removed once the union of all responses
//! is known.

use crate::network::Network;
use crate::reconcile::{index_records, DeltaSet};
use crate::request::{CompositeRequest, Request};
use crate::response;
use futures::future::try_join_all;
use offsync_core::{Cache, DataStoreResult, Entity, Query, ID_KEY, LMT_PATH};
use std::collections::HashSet;
use std::sync::Arc;

/// Fetch options of one read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchMode {
    /// Fetch only changed records when the cache is not empty.
    pub delta_set: bool,
    /// Split large result sets into parallel windows.
    pub auto_pagination: bool,
    /// The read is a pull: stale cached records are always removed.
    pub pull: bool,
}

/// Fetches the records of one collection into its cache.
pub struct FetchPipeline {
    network: Arc<Network>,
    collection: String,
    cache: Option<Arc<dyn Cache>>,
    page_size: usize,
    max_ids_per_query: usize,
}

impl FetchPipeline {
    /// Creates a pipeline.
    pub fn new(
        network: Arc<Network>,
        collection: impl Into<String>,
        cache: Option<Arc<dyn Cache>>,
        page_size: usize,
        max_ids_per_query: usize,
    ) -> Self {
        Self {
            network,
            collection: collection.into(),
            cache,
            page_size: page_size.max(1),
            max_ids_per_query: max_ids_per_query.max(1),
        }
    }

    /// Fetches the records matching a query.
    ///
    /// Delta-set fetches return the cache's view of the query after the
    /// cache was brought up to date; other fetches return the server
    /// records in server order.
    ///
    /// # Errors
    ///
    /// Returns the first failing sub-request's error. Sibling sub-requests
    /// of a paged or chunked fetch are cancelled on failure.
    pub async fn fetch(
        &self,
        query: &Query,
        mode: FetchMode,
        parent: &Arc<CompositeRequest>,
    ) -> DataStoreResult<Vec<Entity>> {
        let full_sync = (mode.pull || query.is_unconstrained()) && !query.is_paged();

        if mode.auto_pagination {
            let total = self.count(query, parent).await?;
            let start = query.skip.unwrap_or(0);
            let end = query
                .limit
                .map_or(total, |limit| total.min(start.saturating_add(limit)));
            if end.saturating_sub(start) > self.page_size {
                return self.fetch_pages(query, start, end, full_sync, parent).await;
            }
        }

        let use_delta = mode.delta_set
            && match &self.cache {
                Some(cache) => !cache.is_empty()?,
                None => false,
            };
        if use_delta {
            self.fetch_delta(query, full_sync, parent).await
        } else {
            self.fetch_records(query, full_sync, parent).await
        }
    }

    /// Counts the server records matching a query's filter.
    ///
    /// # Errors
    ///
    /// Returns the network or classification error.
    pub async fn count(&self, query: &Query, parent: &CompositeRequest) -> DataStoreResult<usize> {
        let spec = self.network.factory().count(&self.collection, query);
        let count = response::parse_count(&self.network.send(spec, parent).await?)?;
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }

    /// Fetches the given ids in chunks and caches them.
    ///
    /// # Errors
    ///
    /// Returns the first failing chunk's error; the other chunks are
    /// cancelled.
    pub async fn fetch_ids(
        &self,
        ids: &[String],
        parent: &Arc<CompositeRequest>,
    ) -> DataStoreResult<Vec<Entity>> {
        if ids.len() <= self.max_ids_per_query {
            return self
                .fetch_records(&Query::ids_in(ids.iter().cloned()), false, parent)
                .await;
        }

        let child = parent.child();
        tracing::debug!(
            collection = %self.collection,
            ids = ids.len(),
            chunks = ids.len().div_ceil(self.max_ids_per_query),
            "fetching ids in chunks"
        );
        let chunks = ids.chunks(self.max_ids_per_query).map(|chunk| {
            let query = Query::ids_in(chunk.iter().cloned());
            let child = &child;
            async move { self.fetch_records(&query, false, child).await }
        });
        match try_join_all(chunks).await {
            Ok(batches) => Ok(batches.into_iter().flatten().collect()),
            Err(err) => {
                child.cancel();
                Err(err)
            }
        }
    }

    async fn fetch_pages(
        &self,
        query: &Query,
        start: usize,
        end: usize,
        full_sync: bool,
        parent: &Arc<CompositeRequest>,
    ) -> DataStoreResult<Vec<Entity>> {
        let child = parent.child();
        let windows: Vec<Query> = (start..end)
            .step_by(self.page_size)
            .map(|offset| {
                query
                    .clone()
                    .with_skip(offset)
                    .with_limit(self.page_size.min(end - offset))
            })
            .collect();
        tracing::debug!(
            collection = %self.collection,
            records = end - start,
            windows = windows.len(),
            "auto-paginating fetch"
        );

        let pages = windows.iter().map(|window| {
            let child = &child;
            async move { self.fetch_records(window, false, child).await }
        });
        let entities: Vec<Entity> = match try_join_all(pages).await {
            Ok(pages) => pages.into_iter().flatten().collect(),
            Err(err) => {
                child.cancel();
                return Err(err);
            }
        };

        if full_sync {
            self.remove_stale(query, entities.iter().filter_map(Entity::id))?;
        }
        Ok(entities)
    }

    async fn fetch_delta(
        &self,
        query: &Query,
        full_sync: bool,
        parent: &Arc<CompositeRequest>,
    ) -> DataStoreResult<Vec<Entity>> {
        let Some(cache) = &self.cache else {
            return self.fetch_records(query, full_sync, parent).await;
        };

        let ids_query = query.clone().with_fields([ID_KEY, LMT_PATH]);
        let spec = self.network.factory().find(&self.collection, &ids_query);
        let records = response::parse_records(&self.network.send(spec, parent).await?)?;
        let server = index_records(&records);
        if server.len() != records.len() {
            tracing::debug!(
                collection = %self.collection,
                records = records.len(),
                indexed = server.len(),
                "records without timestamps, fetching in full"
            );
            return self.fetch_records(query, full_sync, parent).await;
        }

        let local = cache.id_lmt_index(query)?;
        let delta = DeltaSet::compute(&server, &local);
        tracing::debug!(
            collection = %self.collection,
            created = delta.created.len(),
            updated = delta.updated.len(),
            deleted = delta.deleted.len(),
            "computed delta set"
        );

        let changed = delta.union();
        if changed.is_empty() {
            return cache.find(query);
        }

        let confirmed: HashSet<String> = self
            .fetch_ids(&changed, parent)
            .await?
            .iter()
            .filter_map(|entity| entity.id().map(str::to_string))
            .collect();

        if full_sync {
            let doomed: Vec<String> = delta
                .deleted
                .iter()
                .filter(|id| !confirmed.contains(*id))
                .cloned()
                .collect();
            if !doomed.is_empty() {
                let removed = cache.remove_by_query(&Query::ids_in(doomed))?;
                tracing::debug!(collection = %self.collection, removed, "removed deleted records");
            }
        }

        cache.find(query)
    }

    async fn fetch_records(
        &self,
        query: &Query,
        remove_stale: bool,
        parent: &CompositeRequest,
    ) -> DataStoreResult<Vec<Entity>> {
        let spec = self.network.factory().find(&self.collection, query);
        let records = response::parse_records(&self.network.send(spec, parent).await?)?;
        let entities = records
            .into_iter()
            .map(Entity::from_server_record)
            .collect::<DataStoreResult<Vec<_>>>()?;

        if let Some(cache) = &self.cache {
            if remove_stale {
                self.remove_stale(query, entities.iter().filter_map(Entity::id))?;
            }
            cache.save_all(entities.clone())?;
        }
        Ok(entities)
    }

    fn remove_stale<'a>(
        &self,
        query: &Query,
        present: impl IntoIterator<Item = &'a str>,
    ) -> DataStoreResult<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        let present: HashSet<&str> = present.into_iter().collect();
        let stale: Vec<String> = cache
            .id_lmt_index(query)?
            .into_keys()
            .filter(|id| !present.contains(id.as_str()))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let removed = cache.remove_by_query(&Query::ids_in(stale))?;
        tracing::debug!(collection = %self.collection, removed, "removed records missing on the server");
        Ok(removed)
    }
}

impl std::fmt::Debug for FetchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchPipeline")
            .field("collection", &self.collection)
            .field("page_size", &self.page_size)
            .field("max_ids_per_query", &self.max_ids_per_query)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::RequestFactory;
    use crate::transport::MockTransport;
    use offsync_core::{DataStoreError, Filter, MemoryCache};
    use serde_json::json;
    use std::time::Duration;

    const LMT: &str = "2016-01-01T00:00:00.000Z";
    const NEWER: &str = "2016-02-01T00:00:00.000Z";

    fn record(id: &str, lmt: &str) -> serde_json::Value {
        json!({"_id": id, "_kmd": {"lmt": lmt}, "n": id})
    }

    fn setup() -> (Arc<MockTransport>, Arc<MemoryCache>, FetchPipeline) {
        let transport = Arc::new(MockTransport::new());
        let cache = Arc::new(MemoryCache::new("items"));
        let network = Arc::new(Network::new(
            Arc::clone(&transport) as Arc<dyn crate::Transport>,
            RequestFactory::new("kid"),
            Duration::from_secs(5),
        ));
        let pipeline = FetchPipeline::new(
            network,
            "items",
            Some(Arc::clone(&cache) as Arc<dyn Cache>),
            10,
            2,
        );
        (transport, cache, pipeline)
    }

    fn seed(cache: &MemoryCache, ids: &[&str]) {
        for id in ids {
            cache
                .save(Entity::from_value(record(id, LMT)).unwrap())
                .unwrap();
        }
    }

    #[tokio::test]
    async fn full_fetch_removes_stale_records() {
        let (transport, cache, pipeline) = setup();
        seed(&cache, &["a", "b", "c"]);
        transport.push_json(200, json!([record("a", LMT), record("c", LMT), record("d", LMT)]));

        let parent = CompositeRequest::new();
        let entities = pipeline
            .fetch(&Query::new(), FetchMode::default(), &parent)
            .await
            .unwrap();

        assert_eq!(entities.len(), 3);
        assert_eq!(cache.ids(), vec!["a", "c", "d"]);
    }

    #[tokio::test]
    async fn paged_pull_keeps_records_outside_the_page() {
        let (transport, cache, pipeline) = setup();
        seed(&cache, &["a", "b", "c"]);
        transport.push_json(200, json!([record("a", LMT)]));

        let parent = CompositeRequest::new();
        let mode = FetchMode {
            pull: true,
            ..FetchMode::default()
        };
        let query = Query::new().with_limit(1);
        let page = pipeline.fetch(&query, mode, &parent).await.unwrap();

        assert_eq!(page.len(), 1);
        assert_eq!(cache.ids(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn filtered_fetch_keeps_other_records() {
        let (transport, cache, pipeline) = setup();
        seed(&cache, &["a", "b"]);
        transport.push_json(200, json!([record("a", LMT)]));

        let parent = CompositeRequest::new();
        let query = Query::filtered(Filter::eq("n", "a"));
        pipeline.fetch(&query, FetchMode::default(), &parent).await.unwrap();

        assert_eq!(cache.ids(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn record_without_id_fails_the_fetch() {
        let (transport, cache, pipeline) = setup();
        transport.push_json(200, json!([record("a", LMT), {"n": "x"}]));

        let parent = CompositeRequest::new();
        let result = pipeline.fetch(&Query::new(), FetchMode::default(), &parent).await;
        assert!(matches!(result, Err(DataStoreError::ObjectIdMissing)));
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn delta_with_nothing_changed_reads_the_cache() {
        let (transport, cache, pipeline) = setup();
        seed(&cache, &["a", "b"]);
        transport.push_json(200, json!([record("a", LMT), record("b", LMT)]));

        let parent = CompositeRequest::new();
        let mode = FetchMode {
            delta_set: true,
            ..FetchMode::default()
        };
        let entities = pipeline.fetch(&Query::new(), mode, &parent).await.unwrap();

        assert_eq!(entities.len(), 2);
        assert_eq!(transport.request_count(), 1);
        assert_eq!(
            transport.requests()[0].param("fields"),
            Some("_id,_kmd.lmt")
        );
    }

    #[tokio::test]
    async fn delta_fetches_changes_and_removes_deleted() {
        let (transport, cache, pipeline) = setup();
        seed(&cache, &["a", "b", "c"]);
        transport.push_json(200, json!([record("a", NEWER), record("b", LMT)]));
        transport.push_json(200, json!([record("a", NEWER)]));

        let parent = CompositeRequest::new();
        let mode = FetchMode {
            delta_set: true,
            ..FetchMode::default()
        };
        let entities = pipeline.fetch(&Query::new(), mode, &parent).await.unwrap();

        assert_eq!(entities.len(), 2);
        assert_eq!(cache.ids(), vec!["a", "b"]);
        let refreshed = cache.find_by_id("a").unwrap().unwrap();
        assert_eq!(refreshed.last_modified_time(), Some(NEWER));

        let requests = transport.requests();
        let ids = requests[1].param("query").unwrap();
        assert_eq!(ids, r#"{"_id":{"$in":["a","c"]}}"#);
    }

    #[tokio::test]
    async fn delta_falls_back_when_timestamps_are_missing() {
        let (transport, cache, pipeline) = setup();
        seed(&cache, &["a"]);
        transport.push_json(200, json!([record("a", LMT), {"_id": "b"}]));
        transport.push_json(200, json!([record("a", LMT), record("b", LMT)]));

        let parent = CompositeRequest::new();
        let mode = FetchMode {
            delta_set: true,
            ..FetchMode::default()
        };
        pipeline.fetch(&Query::new(), mode, &parent).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].param("fields"), None);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn delta_on_empty_cache_fetches_in_full() {
        let (transport, cache, pipeline) = setup();
        transport.push_json(200, json!([record("a", LMT)]));

        let parent = CompositeRequest::new();
        let mode = FetchMode {
            delta_set: true,
            ..FetchMode::default()
        };
        pipeline.fetch(&Query::new(), mode, &parent).await.unwrap();

        assert_eq!(transport.requests()[0].param("fields"), None);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn small_result_skips_pagination() {
        let (transport, cache, pipeline) = setup();
        transport.push_json(200, json!({"count": 3}));
        transport.push_json(200, json!([record("a", LMT)]));

        let parent = CompositeRequest::new();
        let mode = FetchMode {
            auto_pagination: true,
            ..FetchMode::default()
        };
        pipeline.fetch(&Query::new(), mode, &parent).await.unwrap();

        let requests = transport.requests();
        assert!(requests[0].path.ends_with("/_count"));
        assert_eq!(requests[1].param("skip"), None);
        assert_eq!(cache.len(), 1);
    }
}
