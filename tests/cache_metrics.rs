use std::collections::HashSet;
use std::pin::pin;

use futures::poll;
use metrics_util::debugging::DebuggingRecorder;
use optimist::cache::{CacheConfig, MutationNotices, MutationOptions, QueryCache};
use optimist::cache_key;
use optimist::remote::RemoteError;
use tokio::sync::oneshot;

fn quiet() -> MutationOptions {
    MutationOptions::new().notices(MutationNotices::none())
}

fn replace(vars: &String, _cached: Option<&String>) -> Result<String, RemoteError> {
    Ok(vars.clone())
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let cache = QueryCache::<String>::new(CacheConfig {
        refetch_queue_limit: 1,
        ..Default::default()
    });
    let controller = cache.controller();
    let key = cache_key!["team", "t-1"];
    cache.store().set(&key, "A".to_string());

    // Commit + remote write latency
    controller
        .mutate(
            key.clone(),
            "B".to_string(),
            |v| async move { Ok::<_, RemoteError>(v) },
            replace,
            quiet(),
        )
        .await
        .expect("committed");

    // Rollback
    let _ = controller
        .mutate(
            key.clone(),
            "C".to_string(),
            |_| async { Err::<String, _>(RemoteError::network("offline")) },
            replace,
            quiet(),
        )
        .await;

    // Skipped rollback: an older mutation fails after a newer commit
    let (fail, rx) = oneshot::channel::<Result<String, RemoteError>>();
    let mut older = pin!(controller.mutate(
        key.clone(),
        "D".to_string(),
        move |_| async move { rx.await.unwrap_or_else(|_| Err(RemoteError::network("closed"))) },
        replace,
        quiet(),
    ));
    assert!(poll!(&mut older).is_pending());
    controller
        .mutate(
            key.clone(),
            "E".to_string(),
            |v| async move { Ok::<_, RemoteError>(v) },
            replace,
            quiet(),
        )
        .await
        .expect("committed");
    fail.send(Err(RemoteError::network("offline")))
        .expect("older mutation waiting");
    let _ = older.await;

    // Transform failure
    let _ = controller
        .mutate(
            key.clone(),
            "F".to_string(),
            |v| async move { Ok::<_, RemoteError>(v) },
            |_, _| Err(RemoteError::validation("rejected")),
            quiet(),
        )
        .await;

    // Abandoned mutation
    {
        let (_keep, rx) = oneshot::channel::<Result<String, RemoteError>>();
        let mut abandoned = pin!(controller.mutate(
            key.clone(),
            "G".to_string(),
            move |_| async move { rx.await.unwrap_or_else(|_| Err(RemoteError::network("closed"))) },
            replace,
            quiet(),
        ));
        assert!(poll!(&mut abandoned).is_pending());
    }

    // Reads, queue overflow and refetch consumption
    let _ = cache.queries().read(&cache_key!["missing"]);
    let _ = cache.queries().read(&key);
    let _ = cache
        .queries()
        .consume_refetches(|_| async { Ok::<_, RemoteError>("server".to_string()) })
        .await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "optimist_mutation_committed_total",
        "optimist_mutation_rolled_back_total",
        "optimist_mutation_rollback_skipped_total",
        "optimist_mutation_transform_failed_total",
        "optimist_mutation_abandoned_total",
        "optimist_remote_write_ms",
        "optimist_cache_read_total",
        "optimist_refetch_queue_len",
        "optimist_refetch_dropped_total",
        "optimist_refetch_batch_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
