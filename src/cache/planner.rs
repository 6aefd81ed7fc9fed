//! Refetch plan generation.
//!
//! Merges a batch of refetch requests so each key is fetched once.

use std::collections::{HashMap, HashSet};
use std::fmt;

use uuid::Uuid;

use super::keys::CacheKey;
use super::refetch::{Epoch, RefetchReason, RefetchRequest};

/// One key to refetch, with every reason it was requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRefetch {
    pub key: CacheKey,
    /// Latest epoch among the merged requests.
    pub epoch: Epoch,
    pub reasons: Vec<RefetchReason>,
}

/// Deduplicated refetch work, ordered by first appearance.
#[derive(Debug, Default)]
pub struct RefetchPlan {
    pub refetches: Vec<PlannedRefetch>,
}

impl fmt::Display for RefetchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefetchPlan {{ keys: {} }}", self.refetches.len())
    }
}

impl RefetchPlan {
    /// Merge requests into a plan.
    ///
    /// - Deduplicates by request ID
    /// - Groups by key, keeping the latest epoch
    /// - Collects distinct reasons per key
    pub fn from_requests(requests: Vec<RefetchRequest>) -> Self {
        let mut seen_ids: HashSet<Uuid> = HashSet::new();
        let mut index: HashMap<CacheKey, usize> = HashMap::new();
        let mut refetches: Vec<PlannedRefetch> = Vec::new();

        for request in requests.into_iter().filter(|r| seen_ids.insert(r.id)) {
            match index.get(&request.key) {
                Some(&slot) => {
                    let planned = &mut refetches[slot];
                    planned.epoch = planned.epoch.max(request.epoch);
                    if !planned.reasons.contains(&request.reason) {
                        planned.reasons.push(request.reason);
                    }
                }
                None => {
                    index.insert(request.key.clone(), refetches.len());
                    refetches.push(PlannedRefetch {
                        key: request.key,
                        epoch: request.epoch,
                        reasons: vec![request.reason],
                    });
                }
            }
        }

        Self { refetches }
    }

    pub fn is_empty(&self) -> bool {
        self.refetches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.refetches.len()
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::cache_key;

    fn request(key: CacheKey, epoch: Epoch, reason: RefetchReason) -> RefetchRequest {
        RefetchRequest {
            id: Uuid::new_v4(),
            epoch,
            key,
            reason,
            requested_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn empty_requests_produce_empty_plan() {
        let plan = RefetchPlan::from_requests(vec![]);
        assert!(plan.is_empty());
    }

    #[test]
    fn merges_requests_for_same_key() {
        let key = cache_key!["cloud-accounts", "org-1"];
        let plan = RefetchPlan::from_requests(vec![
            request(key.clone(), 1, RefetchReason::Settled),
            request(cache_key!["team", "t-1"], 2, RefetchReason::StaleRead),
            request(key.clone(), 3, RefetchReason::Invalidated),
            request(key.clone(), 4, RefetchReason::Settled),
        ]);

        assert_eq!(plan.len(), 2);
        let first = &plan.refetches[0];
        assert_eq!(first.key, key);
        assert_eq!(first.epoch, 4);
        assert_eq!(
            first.reasons,
            vec![RefetchReason::Settled, RefetchReason::Invalidated]
        );
    }

    #[test]
    fn deduplicates_by_request_id() {
        let req = request(cache_key!["a"], 1, RefetchReason::Settled);
        let plan = RefetchPlan::from_requests(vec![req.clone(), req]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.refetches[0].reasons.len(), 1);
    }

    #[test]
    fn display_reports_key_count() {
        let plan = RefetchPlan::from_requests(vec![request(
            cache_key!["a"],
            1,
            RefetchReason::Missing,
        )]);
        assert_eq!(plan.to_string(), "RefetchPlan { keys: 1 }");
    }
}
