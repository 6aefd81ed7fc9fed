//! Replays mutation scenarios against an in-memory fake remote.
//!
//! Each scenario gets its own cache and server so the timelines stay
//! independent. The cache timeline is logged through a store subscription.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{Instrument, info, info_span};

use crate::cache::{
    CacheConfig, CacheKey, MutationError, MutationOptions, QueryCache, RetryPolicy,
    RollbackOutcome, Subscription,
};
use crate::config::{Scenario, Settings};
use crate::dashboard::{self, keys};
use crate::remote::{RemoteError, RemoteErrorKind};

/// How the fake remote answers a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Accept,
    Reject(u16),
}

/// Authoritative server state with artificial latency.
pub struct FakeRemote {
    latency: Duration,
    records: Mutex<HashMap<CacheKey, Value>>,
}

impl FakeRemote {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub async fn seed(&self, key: &CacheKey, value: Value) {
        self.records.lock().await.insert(key.clone(), value);
    }

    pub async fn fetch(&self, key: &CacheKey) -> Result<Value, RemoteError> {
        tokio::time::sleep(self.latency).await;
        self.records
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| RemoteError::from_status(404, format!("no record for {key}")))
    }

    /// Apply `change` to the server copy of `key` after `delay_factor`
    /// latency periods, unless told to reject.
    pub async fn write<F>(
        &self,
        key: &CacheKey,
        outcome: RemoteOutcome,
        delay_factor: u32,
        change: &F,
    ) -> Result<Value, RemoteError>
    where
        F: Fn(Option<&Value>) -> Result<Value, RemoteError>,
    {
        tokio::time::sleep(self.latency * delay_factor).await;
        match outcome {
            RemoteOutcome::Reject(status) => Err(RemoteError::from_status(
                status,
                "rejected by fake remote",
            )),
            RemoteOutcome::Accept => {
                let mut records = self.records.lock().await;
                let next = change(records.get(key))?;
                records.insert(key.clone(), next.clone());
                Ok(next)
            }
        }
    }
}

/// Final cache state of one replayed scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub cache_key: String,
    pub outcomes: Vec<String>,
    pub data: Option<Value>,
    pub version: u64,
    pub refetched: usize,
}

struct DemoContext {
    cache: QueryCache<Value>,
    remote: Arc<FakeRemote>,
    mutation_retry: RetryPolicy,
}

impl DemoContext {
    fn new(settings: &Settings) -> Self {
        Self {
            cache: QueryCache::new(CacheConfig::from(settings)),
            remote: Arc::new(FakeRemote::new(settings.demo.latency)),
            mutation_retry: settings.retry.mutation_policy(),
        }
    }

    /// Seed the server and load the value into the cache through a fetch.
    async fn prime(&self, key: &CacheKey, value: Value) -> Result<(), RemoteError> {
        self.remote.seed(key, value).await;
        self.cache
            .queries()
            .fetch_with_retry(key, || self.remote.fetch(key))
            .await
            .map(|_| ())
    }

    fn watch(&self, key: &CacheKey) -> Subscription {
        let store = Arc::downgrade(self.cache.store());
        self.cache.store().subscribe(key.clone(), move |key| {
            let Some(entry) = store.upgrade().and_then(|store| store.get(key)) else {
                info!(cache_key = %key, "Cache entry removed");
                return;
            };
            info!(
                cache_key = %key,
                version = entry.version,
                pending = entry.pending_mutations,
                data = %entry.data.unwrap_or(serde_json::Value::Null),
                "Cache changed"
            );
        })
    }

    async fn remote_write<F>(
        &self,
        key: &CacheKey,
        outcome: RemoteOutcome,
        delay_factor: u32,
        change: F,
    ) -> Result<Value, RemoteError>
    where
        F: Fn(Option<&Value>) -> Result<Value, RemoteError>,
    {
        self.mutation_retry
            .run(|_| self.remote.write(key, outcome, delay_factor, &change))
            .await
    }

    async fn report(&self, scenario: Scenario, key: &CacheKey, outcomes: Vec<String>) -> ScenarioReport {
        let remote = Arc::clone(&self.remote);
        let refetch = self
            .cache
            .queries()
            .consume_refetches(move |key| {
                let remote = Arc::clone(&remote);
                async move { remote.fetch(&key).await }
            })
            .await;
        let entry = self.cache.store().get(key);

        ScenarioReport {
            scenario: scenario.to_string(),
            cache_key: key.to_string(),
            outcomes,
            data: entry.as_ref().and_then(|entry| entry.data.clone()),
            version: entry.map_or(0, |entry| entry.version),
            refetched: refetch.written,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Race => "race",
            Self::ListRemoval => "list-removal",
            Self::All => "all",
        })
    }
}

/// Replay `scenario` (or every scenario for [`Scenario::All`]).
pub async fn run(scenario: Scenario, settings: &Settings) -> Result<Vec<ScenarioReport>, RemoteError> {
    let scenarios = match scenario {
        Scenario::All => vec![
            Scenario::Success,
            Scenario::Failure,
            Scenario::Race,
            Scenario::ListRemoval,
        ],
        single => vec![single],
    };

    let mut reports = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        let span = info_span!("scenario", name = %scenario);
        let report = run_one(scenario, settings).instrument(span).await?;
        reports.push(report);
    }
    Ok(reports)
}

async fn run_one(scenario: Scenario, settings: &Settings) -> Result<ScenarioReport, RemoteError> {
    let ctx = DemoContext::new(settings);
    match scenario {
        Scenario::Success => single_update(&ctx, scenario, RemoteOutcome::Accept).await,
        Scenario::Failure => single_update(&ctx, scenario, RemoteOutcome::Reject(503)).await,
        Scenario::Race => race(&ctx).await,
        Scenario::ListRemoval => list_removal(&ctx).await,
        Scenario::All => Err(RemoteError::new(
            RemoteErrorKind::Unknown,
            "`all` is expanded before dispatch",
        )),
    }
}

async fn single_update(
    ctx: &DemoContext,
    scenario: Scenario,
    outcome: RemoteOutcome,
) -> Result<ScenarioReport, RemoteError> {
    let key = keys::cloud_account("acc-1");
    ctx.prime(&key, json!({"id": "acc-1", "name": "Production", "organization_id": "org-1"}))
        .await?;
    let _watch = ctx.watch(&key);

    let patch = json!({"name": "Production (renamed)"});
    let server_patch = patch.clone();
    let result = ctx
        .cache
        .controller()
        .mutate(
            key.clone(),
            patch,
            |_patch| {
                ctx.remote_write(&key, outcome, 1, move |current| {
                    dashboard::merge_patch(&server_patch, current)
                })
            },
            |patch, cached| dashboard::merge_patch(patch, cached),
            MutationOptions::new().invalidate(keys::cloud_accounts("org-1")),
        )
        .await;

    Ok(ctx.report(scenario, &key, vec![describe("update", &result)]).await)
}

/// A fails after B commits; A's rollback must not clobber B.
async fn race(ctx: &DemoContext) -> Result<ScenarioReport, RemoteError> {
    let key = keys::team("t-1");
    ctx.prime(&key, json!({"id": "t-1", "name": "Platform"})).await?;
    let _watch = ctx.watch(&key);
    let controller = ctx.cache.controller();

    let first = controller.mutate(
        key.clone(),
        json!({"name": "Platform A"}),
        |patch| {
            ctx.remote_write(&key, RemoteOutcome::Reject(500), 2, move |current| {
                dashboard::merge_patch(&patch, current)
            })
        },
        |patch, cached| dashboard::merge_patch(patch, cached),
        MutationOptions::new(),
    );
    let second = controller.mutate(
        key.clone(),
        json!({"name": "Platform B"}),
        |patch| {
            ctx.remote_write(&key, RemoteOutcome::Accept, 1, move |current| {
                dashboard::merge_patch(&patch, current)
            })
        },
        |patch, cached| dashboard::merge_patch(patch, cached),
        MutationOptions::new(),
    );
    let (first, second) = tokio::join!(first, second);

    Ok(ctx
        .report(
            Scenario::Race,
            &key,
            vec![describe("A", &first), describe("B", &second)],
        )
        .await)
}

/// Remove `acc2` from the account list: once accepted, once rejected.
async fn list_removal(ctx: &DemoContext) -> Result<ScenarioReport, RemoteError> {
    let key = keys::cloud_accounts("org-1");
    ctx.prime(&key, json!([{"id": "acc1"}, {"id": "acc2"}])).await?;
    let _watch = ctx.watch(&key);

    let mut outcomes = Vec::new();
    for outcome in [RemoteOutcome::Reject(503), RemoteOutcome::Accept] {
        let result = ctx
            .cache
            .controller()
            .mutate(
                key.clone(),
                "acc2".to_string(),
                |id| {
                    ctx.remote_write(&key, outcome, 1, move |current| {
                        dashboard::remove_by_id(&id, current)
                    })
                },
                |id, cached| dashboard::remove_by_id(id, cached),
                MutationOptions::new(),
            )
            .await;
        outcomes.push(describe("remove acc2", &result));
    }

    Ok(ctx.report(Scenario::ListRemoval, &key, outcomes).await)
}

fn describe<E: fmt::Display>(label: &str, result: &Result<Value, MutationError<E>>) -> String {
    match result {
        Ok(_) => format!("{label}: committed"),
        Err(MutationError::Transform(err)) => format!("{label}: transform failed ({err})"),
        Err(MutationError::RemoteWrite { rollback, .. }) => match rollback {
            RollbackOutcome::Restored { version } => {
                format!("{label}: rolled back (restored at v{version})")
            }
            RollbackOutcome::SkippedStale {
                applied_version,
                current_version,
            } => format!(
                "{label}: rollback skipped (applied v{applied_version}, current v{current_version})"
            ),
        },
    }
}
