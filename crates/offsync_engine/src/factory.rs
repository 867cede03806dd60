//! Builds the request specs of every collection endpoint.

use offsync_core::{is_temporary_id, Entity, HttpMethod, Query, RequestSpec, ID_KEY};

/// Builds request specs for one application.
#[derive(Debug, Clone)]
pub struct RequestFactory {
    app_key: String,
}

impl RequestFactory {
    /// Creates a factory for an application key.
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
        }
    }

    /// Returns the path of a collection, with a trailing slash.
    pub fn collection_path(&self, collection: &str) -> String {
        format!("/appdata/{}/{}/", self.app_key, collection)
    }

    /// Returns the path of one entity.
    pub fn entity_path(&self, collection: &str, id: &str) -> String {
        format!("{}{}", self.collection_path(collection), id)
    }

    /// `GET` the records matching a query.
    pub fn find(&self, collection: &str, query: &Query) -> RequestSpec {
        RequestSpec::new(HttpMethod::Get, self.collection_path(collection))
            .with_params(query.to_params())
    }

    /// `GET` one record.
    pub fn find_by_id(&self, collection: &str, id: &str) -> RequestSpec {
        RequestSpec::new(HttpMethod::Get, self.entity_path(collection, id))
    }

    /// `GET` the number of records matching a query's filter.
    pub fn count(&self, collection: &str, query: &Query) -> RequestSpec {
        RequestSpec::new(
            HttpMethod::Get,
            format!("{}_count", self.collection_path(collection)),
        )
        .with_params(query.scope().to_params())
    }

    /// `POST` a new record or `PUT` an existing one.
    ///
    /// Entities without an id, or with a temporary one, are created; the
    /// temporary id is stripped from the body so the server assigns one.
    pub fn save(&self, collection: &str, entity: &Entity) -> RequestSpec {
        match entity.id() {
            Some(id) if !is_temporary_id(id) => {
                RequestSpec::new(HttpMethod::Put, self.entity_path(collection, id))
                    .with_body(entity.to_value())
            }
            _ => {
                let mut body = entity.clone();
                body.remove(ID_KEY);
                RequestSpec::new(HttpMethod::Post, self.collection_path(collection))
                    .with_body(body.to_value())
            }
        }
    }

    /// `DELETE` one record.
    pub fn remove_by_id(&self, collection: &str, id: &str) -> RequestSpec {
        RequestSpec::new(HttpMethod::Delete, self.entity_path(collection, id))
    }

    /// `DELETE` the records matching a query's filter.
    pub fn remove(&self, collection: &str, query: &Query) -> RequestSpec {
        RequestSpec::new(HttpMethod::Delete, self.collection_path(collection))
            .with_params(query.scope().to_params())
    }
}
