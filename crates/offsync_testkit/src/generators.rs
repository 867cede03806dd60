//! Property-based test generators using proptest.
//!
//! Provides strategies for ids, timestamps, id→timestamp indices and
//! queries over generated records.

use crate::fixtures::timestamp;
use offsync_core::{Entity, Filter, Query};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;

/// Strategy for server ids drawn from a small alphabet, so indices overlap.
pub fn id_strategy() -> impl Strategy<Value = String> {
    (0u32..64).prop_map(|n| format!("id{n:02}"))
}

/// Strategy for service timestamps within a few ticks of each other.
pub fn timestamp_strategy() -> impl Strategy<Value = String> {
    (0u64..8).prop_map(timestamp)
}

/// Strategy for id→last-modified-time indices of up to `max_len` entries.
pub fn index_strategy(max_len: usize) -> impl Strategy<Value = HashMap<String, String>> {
    prop::collection::hash_map(id_strategy(), timestamp_strategy(), 0..=max_len)
}

/// Strategy for a server index and a local index over overlapping ids.
pub fn index_pair_strategy(
    max_len: usize,
) -> impl Strategy<Value = (HashMap<String, String>, HashMap<String, String>)> {
    (index_strategy(max_len), index_strategy(max_len))
}

/// Strategy for records with an id, a timestamp, a `rank` and a `genre`.
pub fn entity_strategy() -> impl Strategy<Value = Entity> {
    (id_strategy(), timestamp_strategy(), 0i64..100, 0usize..3).prop_map(
        |(id, lmt, rank, genre)| {
            Entity::from_map(
                json!({
                    "_id": id,
                    "rank": rank,
                    "genre": GENRES[genre],
                    "_kmd": {"lmt": lmt}
                })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            )
        },
    )
}

const GENRES: [&str; 3] = ["fiction", "history", "poetry"];

/// Strategy for filters over the fields of [`entity_strategy`] records.
pub fn filter_strategy() -> impl Strategy<Value = Filter> {
    let leaf = prop_oneof![
        (0i64..100).prop_map(|rank| Filter::gt("rank", rank)),
        (0i64..100).prop_map(|rank| Filter::lte("rank", rank)),
        (0usize..3).prop_map(|genre| Filter::eq("genre", GENRES[genre])),
        (0usize..3).prop_map(|genre| Filter::ne("genre", GENRES[genre])),
        Just(Filter::Exists("rank".to_string(), true)),
    ];
    leaf.prop_recursive(2, 8, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..3).prop_map(Filter::And),
            prop::collection::vec(inner.clone(), 1..3).prop_map(Filter::Or),
            inner.prop_map(|filter| Filter::Not(Box::new(filter))),
        ]
    })
}

/// Strategy for queries with an optional filter and optional paging.
pub fn query_strategy() -> impl Strategy<Value = Query> {
    (
        prop::option::of(filter_strategy()),
        prop::option::of(0usize..10),
        prop::option::of(1usize..10),
    )
        .prop_map(|(filter, skip, limit)| {
            let mut query = Query::new();
            query.filter = filter;
            query.skip = skip;
            query.limit = limit;
            query
        })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
