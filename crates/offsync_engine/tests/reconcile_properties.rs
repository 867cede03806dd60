//! Properties of the delta-set reconciler and of query encoding.

use offsync_engine::{index_records, DeltaSet, Query};
use offsync_testkit::prelude::*;
use proptest::prelude::*;

proptest! {
    #![proptest_config(PropTestConfig::default().to_proptest_config())]

    #[test]
    fn delta_partitions_the_id_space((server, local) in index_pair_strategy(24)) {
        let delta = DeltaSet::compute(&server, &local);

        for id in &delta.created {
            prop_assert!(server.contains_key(id) && !local.contains_key(id));
        }
        for id in &delta.deleted {
            prop_assert!(local.contains_key(id) && !server.contains_key(id));
        }
        for id in &delta.updated {
            prop_assert!(server[id] > local[id]);
        }
        prop_assert!(delta.created.is_disjoint(&delta.updated));
        prop_assert!(delta.created.is_disjoint(&delta.deleted));
        prop_assert!(delta.updated.is_disjoint(&delta.deleted));

        // A shared id is updated exactly when the server copy is newer.
        for (id, lmt) in &server {
            if let Some(cached) = local.get(id) {
                prop_assert_eq!(delta.updated.contains(id), lmt > cached);
            }
        }
    }

    #[test]
    fn identical_indices_have_no_delta(index in index_strategy(24)) {
        prop_assert!(DeltaSet::compute(&index, &index).is_empty());
    }

    #[test]
    fn records_index_by_id(entities in prop::collection::vec(entity_strategy(), 0..16)) {
        let records: Vec<_> = entities.iter().map(|entity| entity.to_value()).collect();
        let index = index_records(&records);
        for entity in &entities {
            let id = entity.id().unwrap();
            prop_assert!(index.contains_key(id));
        }
    }

    #[test]
    fn query_params_decode_to_the_same_matches(
        query in query_strategy(),
        entities in prop::collection::vec(entity_strategy(), 0..16),
    ) {
        let decoded = Query::from_params(&query.to_params()).unwrap();
        prop_assert_eq!(
            ids_of(&decoded.apply(entities.clone())),
            ids_of(&query.apply(entities))
        );
    }
}
