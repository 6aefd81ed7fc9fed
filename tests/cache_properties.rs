//! Property tests over random interleavings of cache writes and mutations.

use futures::poll;
use optimist::cache::{CacheKey, CacheStore, MutationNotices, MutationOptions, QueryCache};
use optimist::cache_key;
use optimist::remote::RemoteError;
use proptest::prelude::*;
use tokio::sync::oneshot;

#[derive(Debug, Clone)]
enum StoreOp {
    Set(u32),
    Delete,
    Clear,
    Fetch(u32),
    Stale,
}

fn store_op_strategy() -> impl Strategy<Value = StoreOp> {
    prop_oneof![
        4 => any::<u32>().prop_map(StoreOp::Set),
        1 => Just(StoreOp::Delete),
        1 => Just(StoreOp::Clear),
        2 => any::<u32>().prop_map(StoreOp::Fetch),
        1 => Just(StoreOp::Stale),
    ]
}

fn observed_version(store: &CacheStore<u32>, key: &CacheKey) -> Option<u64> {
    store.get(key).map(|entry| entry.version)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("test runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every write observed on a key carries a strictly larger version than
    /// any write observed before it, deletes and clears included.
    #[test]
    fn prop_versions_never_repeat(ops in prop::collection::vec(store_op_strategy(), 1..64)) {
        let store = CacheStore::new();
        let key = cache_key!["team", "t-1"];
        let mut highest = 0u64;

        for op in ops {
            match op {
                StoreOp::Set(value) => {
                    let version = store.set(&key, value);
                    prop_assert!(version > highest);
                    highest = version;
                }
                StoreOp::Delete => {
                    store.delete(&key);
                }
                StoreOp::Clear => store.clear(),
                StoreOp::Fetch(value) => {
                    let ticket = store.begin_fetch(&key);
                    if let optimist::cache::FetchOutcome::Written(version) =
                        store.complete_fetch(&ticket, value)
                    {
                        prop_assert!(version > highest);
                        highest = version;
                    }
                }
                StoreOp::Stale => {
                    store.mark_stale(&key);
                }
            }
            if let Some(version) = observed_version(&store, &key) {
                prop_assert!(version >= highest);
            }
        }
    }

    /// However a batch of overlapping mutations resolves, the pending count
    /// returns to zero and the ledger empties.
    #[test]
    fn prop_pending_returns_to_baseline(outcomes in prop::collection::vec(any::<bool>(), 1..8)) {
        let rt = runtime();
        rt.block_on(async {
            let cache = QueryCache::<u32>::default();
            let controller = cache.controller();
            let key = cache_key!["schedule", "s-1"];
            cache.store().set(&key, 0);

            let mut senders = Vec::new();
            let mut pending = Vec::new();
            for (index, _) in outcomes.iter().enumerate() {
                let (tx, rx) = oneshot::channel::<Result<u32, RemoteError>>();
                senders.push(tx);
                pending.push(Box::pin(controller.mutate(
                    key.clone(),
                    index as u32 + 1,
                    move |_| async move {
                        rx.await.unwrap_or_else(|_| Err(RemoteError::network("closed")))
                    },
                    |value, _| Ok(*value),
                    MutationOptions::new().notices(MutationNotices::none()),
                )));
            }
            for future in pending.iter_mut() {
                assert!(poll!(future).is_pending());
            }
            assert_eq!(
                cache.store().get(&key).map(|entry| entry.pending_mutations),
                Some(outcomes.len() as u32)
            );

            for ((tx, succeed), future) in senders.into_iter().zip(&outcomes).zip(pending) {
                let reply = if *succeed {
                    Ok(7)
                } else {
                    Err(RemoteError::from_status(500, "down"))
                };
                let _ = tx.send(reply);
                let _ = future.await;
            }

            let entry = cache.store().get(&key).expect("entry");
            assert_eq!(entry.pending_mutations, 0);
            assert!(entry.stale);
            assert_eq!(controller.in_flight_count(), 0);
        });
    }
}
