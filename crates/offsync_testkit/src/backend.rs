//! An in-memory backend that answers requests the way the data service does.
//!
//! The backend evaluates filters, sort, skip/limit and field projection with
//! the same `Query` semantics the cache uses, stamps `_kmd.lmt` on every
//! write from a logical clock, and can be scripted to fail or slow down
//! chosen requests.

use crate::fixtures::timestamp;
use async_trait::async_trait;
use offsync_core::{
    DataStoreError, DataStoreResult, Entity, HttpMethod, Metadata, Query, RequestSpec,
};
use offsync_engine::{HttpResponse, Transport};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Selects requests for scripted failures and latency.
#[derive(Debug, Clone, Default)]
pub struct RequestMatcher {
    method: Option<HttpMethod>,
    path_contains: Option<String>,
    params: Vec<(String, String)>,
}

impl RequestMatcher {
    /// Matches every request.
    pub fn any() -> Self {
        Self::default()
    }

    /// Restricts the matcher to one method.
    #[must_use]
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    /// Restricts the matcher to paths containing `fragment`.
    #[must_use]
    pub fn path_contains(mut self, fragment: impl Into<String>) -> Self {
        self.path_contains = Some(fragment.into());
        self
    }

    /// Restricts the matcher to requests carrying a parameter value.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Returns true if the request matches.
    pub fn matches(&self, request: &RequestSpec) -> bool {
        self.method.map_or(true, |method| method == request.method)
            && self
                .path_contains
                .as_deref()
                .map_or(true, |fragment| request.path.contains(fragment))
            && self
                .params
                .iter()
                .all(|(name, value)| request.param(name) == Some(value.as_str()))
    }
}

enum Rule {
    Fail {
        matcher: RequestMatcher,
        outcome: DataStoreResult<HttpResponse>,
        remaining: usize,
    },
    Delay {
        matcher: RequestMatcher,
        delay: Duration,
    },
}

enum Target<'a> {
    Collection(&'a str),
    Count(&'a str),
    Entity(&'a str, &'a str),
}

/// An in-memory data service implementing [`Transport`].
pub struct MemoryBackend {
    app_key: String,
    collections: Mutex<HashMap<String, Vec<Entity>>>,
    rules: Mutex<Vec<Rule>>,
    latency: Mutex<Duration>,
    requests: Mutex<Vec<RequestSpec>>,
    clock: AtomicU64,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts a request as in flight until dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryBackend {
    /// Creates an empty backend serving one application.
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            collections: Mutex::new(HashMap::new()),
            rules: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
            requests: Mutex::new(Vec::new()),
            clock: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Returns the application key.
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// Stores records exactly as given, assigning ids to records without one.
    pub fn seed(&self, collection: &str, records: impl IntoIterator<Item = Entity>) {
        let mut collections = self.collections.lock();
        let stored = collections.entry(collection.to_string()).or_default();
        for mut record in records {
            if record.id().is_none() {
                record.set_id(self.assign_id());
            }
            upsert(stored, record);
        }
    }

    /// Stores a record the way a client write would: stamped with a fresh
    /// last-modified time.
    pub fn insert(&self, collection: &str, record: Entity) -> Entity {
        let stamped = self.stamp(record, None);
        let mut collections = self.collections.lock();
        upsert(
            collections.entry(collection.to_string()).or_default(),
            stamped.clone(),
        );
        stamped
    }

    /// Advances the last-modified time of a stored record.
    pub fn touch(&self, collection: &str, id: &str) -> bool {
        let Some(record) = self.get(collection, id) else {
            return false;
        };
        self.insert(collection, record);
        true
    }

    /// Deletes a stored record.
    pub fn delete(&self, collection: &str, id: &str) -> bool {
        let mut collections = self.collections.lock();
        let Some(stored) = collections.get_mut(collection) else {
            return false;
        };
        let before = stored.len();
        stored.retain(|record| record.id() != Some(id));
        stored.len() < before
    }

    /// Returns a stored record.
    pub fn get(&self, collection: &str, id: &str) -> Option<Entity> {
        self.collections
            .lock()
            .get(collection)?
            .iter()
            .find(|record| record.id() == Some(id))
            .cloned()
    }

    /// Returns the stored records of a collection in insertion order.
    pub fn records(&self, collection: &str) -> Vec<Entity> {
        self.collections
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the number of stored records of a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections.lock().get(collection).map_or(0, Vec::len)
    }

    /// Returns true if the collection holds no records.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Answers the next `times` matching requests with `response`.
    pub fn fail(&self, matcher: RequestMatcher, response: HttpResponse, times: usize) {
        self.rules.lock().push(Rule::Fail {
            matcher,
            outcome: Ok(response),
            remaining: times,
        });
    }

    /// Fails the next `times` matching requests at the transport level.
    pub fn fail_with(&self, matcher: RequestMatcher, error: DataStoreError, times: usize) {
        self.rules.lock().push(Rule::Fail {
            matcher,
            outcome: Err(error),
            remaining: times,
        });
    }

    /// Answers the next matching request with a service error body.
    pub fn fail_once(&self, matcher: RequestMatcher, status: u16, error: &str) {
        let body = json!({"error": error, "debug": "", "description": error});
        self.fail(matcher, HttpResponse::json(status, &body), 1);
    }

    /// Delays every matching request.
    pub fn delay(&self, matcher: RequestMatcher, delay: Duration) {
        self.rules.lock().push(Rule::Delay { matcher, delay });
    }

    /// Delays every request.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Returns the largest number of requests that were in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<RequestSpec> {
        self.requests.lock().clone()
    }

    /// Returns the requests received so far that match.
    pub fn requests_matching(&self, matcher: &RequestMatcher) -> Vec<RequestSpec> {
        self.requests
            .lock()
            .iter()
            .filter(|request| matcher.matches(request))
            .cloned()
            .collect()
    }

    /// Returns the number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Forgets the recorded requests.
    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    fn assign_id(&self) -> String {
        format!("srv{:06}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn stamp(&self, mut record: Entity, created: Option<String>) -> Entity {
        if record.id().is_none() {
            record.set_id(self.assign_id());
        }
        let now = timestamp(self.clock.fetch_add(1, Ordering::SeqCst) + 1);
        let metadata = Metadata {
            last_modified_time: Some(now.clone()),
            entity_creation_time: Some(created.unwrap_or(now)),
        };
        // Metadata always serializes to an object.
        let _ = record.set_metadata(&metadata);
        record
    }

    /// Returns the total delay and the scripted outcome for a request.
    fn plan(&self, request: &RequestSpec) -> (Duration, Option<DataStoreResult<HttpResponse>>) {
        let mut delay = *self.latency.lock();
        let mut scripted = None;
        for rule in self.rules.lock().iter_mut() {
            match rule {
                Rule::Delay {
                    matcher,
                    delay: extra,
                } if matcher.matches(request) => delay += *extra,
                Rule::Fail {
                    matcher,
                    outcome,
                    remaining,
                } if scripted.is_none() && *remaining > 0 && matcher.matches(request) => {
                    *remaining -= 1;
                    scripted = Some(outcome.clone());
                }
                _ => {}
            }
        }
        (delay, scripted)
    }

    fn target<'a>(&self, path: &'a str) -> Option<Target<'a>> {
        let rest = path
            .strip_prefix("/appdata/")?
            .strip_prefix(self.app_key.as_str())?
            .strip_prefix('/')?;
        let (collection, tail) = rest.split_once('/')?;
        Some(match tail {
            "" => Target::Collection(collection),
            "_count" => Target::Count(collection),
            id => Target::Entity(collection, id),
        })
    }

    fn handle(&self, request: &RequestSpec) -> HttpResponse {
        let Some(target) = self.target(&request.path) else {
            return error_response(404, "AppNotFound");
        };
        let query = match Query::from_params(&request.params) {
            Ok(query) => query,
            Err(err) => return error_response(400, &format!("InvalidQuerySyntax: {err}")),
        };

        match (request.method, target) {
            (HttpMethod::Get, Target::Collection(collection)) => {
                let found = query.apply(self.records(collection));
                let body: Vec<Value> = found.iter().map(Entity::to_value).collect();
                HttpResponse::json(200, &Value::Array(body))
            }
            (HttpMethod::Get, Target::Count(collection)) => {
                let count = self
                    .records(collection)
                    .iter()
                    .filter(|record| query.matches(record))
                    .count();
                HttpResponse::json(200, &json!({ "count": count }))
            }
            (HttpMethod::Get, Target::Entity(collection, id)) => match self.get(collection, id) {
                Some(record) => HttpResponse::json(200, &record.to_value()),
                None => error_response(404, "EntityNotFound"),
            },
            (HttpMethod::Post, Target::Collection(collection)) => {
                match body_entity(request, None) {
                    Ok(record) => HttpResponse::json(201, &self.insert(collection, record).to_value()),
                    Err(response) => response,
                }
            }
            (HttpMethod::Put, Target::Entity(collection, id)) => {
                match body_entity(request, Some(id)) {
                    Ok(record) => {
                        let created = self
                            .get(collection, id)
                            .and_then(|existing| existing.entity_creation_time().map(str::to_string));
                        let stamped = self.stamp(record, created);
                        let mut collections = self.collections.lock();
                        upsert(
                            collections.entry(collection.to_string()).or_default(),
                            stamped.clone(),
                        );
                        HttpResponse::json(200, &stamped.to_value())
                    }
                    Err(response) => response,
                }
            }
            (HttpMethod::Delete, Target::Entity(collection, id)) => {
                let count = u64::from(self.delete(collection, id));
                HttpResponse::json(200, &json!({ "count": count }))
            }
            (HttpMethod::Delete, Target::Collection(collection)) => {
                let mut collections = self.collections.lock();
                let stored = collections.entry(collection.to_string()).or_default();
                let before = stored.len();
                stored.retain(|record| !query.matches(record));
                HttpResponse::json(200, &json!({ "count": before - stored.len() }))
            }
            _ => error_response(405, "MethodNotAllowed"),
        }
    }
}

#[async_trait]
impl Transport for MemoryBackend {
    async fn execute(&self, request: &RequestSpec) -> DataStoreResult<HttpResponse> {
        self.requests.lock().push(request.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);
        let (delay, scripted) = self.plan(request);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match scripted {
            Some(outcome) => outcome,
            None => Ok(self.handle(request)),
        }
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("app_key", &self.app_key)
            .field("requests", &self.request_count())
            .finish()
    }
}

fn upsert(stored: &mut Vec<Entity>, record: Entity) {
    match stored.iter_mut().find(|existing| existing.id() == record.id()) {
        Some(existing) => *existing = record,
        None => stored.push(record),
    }
}

fn body_entity(request: &RequestSpec, id: Option<&str>) -> Result<Entity, HttpResponse> {
    let body = request.body.clone().unwrap_or_else(|| json!({}));
    let mut record = Entity::from_value(body).map_err(|_| error_response(400, "BadRequest"))?;
    if let Some(id) = id {
        record.set_id(id);
    }
    Ok(record)
}

fn error_response(status: u16, error: &str) -> HttpResponse {
    HttpResponse::json(
        status,
        &json!({"error": error, "debug": "", "description": error}),
    )
}
