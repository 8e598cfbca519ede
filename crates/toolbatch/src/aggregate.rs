//! Fan-in of group results into an index-aligned outcome array.

use futures::future::join_all;
use tracing::error;

use crate::batch::Outcome;
use crate::grouper::Grouping;
use crate::lanes::GroupTask;

/// A dispatched tool group awaiting collection.
#[derive(Debug)]
pub struct PendingGroup {
    pub slug: String,
    /// Original indices, in the group's local order.
    pub indices: Vec<usize>,
    pub task: GroupTask,
}

/// Collects outcomes into slots addressed by original index.
#[derive(Debug)]
pub struct ResultAggregator {
    slots: Vec<Option<Outcome>>,
    trace_id: String,
}

impl ResultAggregator {
    pub fn new(len: usize, trace_id: impl Into<String>) -> Self {
        Self {
            slots: vec![None; len],
            trace_id: trace_id.into(),
        }
    }

    /// Record the outcomes that never reach a handler.
    pub fn record_grouping_failures(&mut self, grouping: &Grouping) {
        for &idx in &grouping.undetected {
            self.set(idx, Outcome::no_tool(&self.trace_id));
        }
        for &idx in &grouping.failed {
            let failure = Outcome::error("tool detection failed for this action", &self.trace_id);
            self.set(idx, failure);
        }
    }

    /// Scatter a group's local outcomes back to their original indices.
    pub fn scatter(&mut self, slug: &str, indices: &[usize], outcomes: Vec<Outcome>) {
        if outcomes.len() != indices.len() {
            let msg = format!(
                "tool group returned {} results for {} actions",
                outcomes.len(),
                indices.len()
            );
            self.fail_group(slug, indices, &msg);
            return;
        }
        for (&idx, outcome) in indices.iter().zip(outcomes) {
            self.set(idx, outcome);
        }
    }

    /// Give every index of a group the same `{error, tool, trace_id}` failure.
    pub fn fail_group(&mut self, slug: &str, indices: &[usize], message: &str) {
        error!("[{}] Tool {slug} execution failed: {message}", self.trace_id);
        let failure = Outcome::group_error(message, slug, &self.trace_id);
        for &idx in indices {
            self.set(idx, failure.clone());
        }
    }

    /// Await every group concurrently and scatter the results.
    pub async fn collect(&mut self, pending: Vec<PendingGroup>) {
        let waits = pending.into_iter().map(|group| async move {
            let result = group.task.wait().await;
            (group.slug, group.indices, result)
        });
        for (slug, indices, result) in join_all(waits).await {
            match result {
                Ok(outcomes) => self.scatter(&slug, &indices, outcomes),
                Err(e) => self.fail_group(&slug, &indices, &e),
            }
        }
    }

    /// Fill any unset slot, stamp the trace ID, and return the array.
    pub fn finish(self) -> Vec<Outcome> {
        let trace_id = self.trace_id;
        self.slots
            .into_iter()
            .map(|slot| {
                let mut outcome =
                    slot.unwrap_or_else(|| Outcome::error("action was not scheduled", &trace_id));
                outcome.stamp_trace_id(&trace_id);
                outcome
            })
            .collect()
    }

    fn set(&mut self, idx: usize, outcome: Outcome) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = Some(outcome);
        }
    }
}

/// The same failure for every index of a batch that failed as a whole.
pub fn broadcast_failure(len: usize, message: &str, trace_id: &str) -> Vec<Outcome> {
    let failure = Outcome::error(format!("Batch processing failed: {message}"), trace_id);
    vec![failure; len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scatter_restores_original_order() {
        let mut agg = ResultAggregator::new(4, "tr");
        agg.scatter("b", &[1, 3], vec![Outcome::value(json!("b1")), Outcome::value(json!("b3"))]);
        agg.scatter("a", &[0, 2], vec![Outcome::value(json!("a0")), Outcome::value(json!("a2"))]);
        let obs: Vec<_> = agg.finish().into_iter().map(|o| o.observation).collect();
        assert_eq!(obs, vec![json!("a0"), json!("b1"), json!("a2"), json!("b3")]);
    }

    #[test]
    fn length_mismatch_fails_group() {
        let mut agg = ResultAggregator::new(2, "tr");
        agg.scatter("a", &[0, 1], vec![Outcome::value(json!(1))]);
        let out = agg.finish();
        assert!(out.iter().all(|o| !o.valid && o.done));
        assert_eq!(out[0].observation["tool"], "a");
    }

    #[test]
    fn unset_slots_are_failures() {
        let agg = ResultAggregator::new(1, "tr");
        let out = agg.finish();
        assert_eq!(out[0].observation["error"], "action was not scheduled");
        assert_eq!(out[0].observation["trace_id"], "tr");
    }

    #[test]
    fn grouping_failures_never_reach_handlers() {
        let grouping = Grouping {
            undetected: vec![0],
            failed: vec![1],
            ..Default::default()
        };
        let mut agg = ResultAggregator::new(2, "tr");
        agg.record_grouping_failures(&grouping);
        let out = agg.finish();
        assert_eq!(out[0].observation["invalid_reason"], "no tool specified");
        assert!(out[0].done && !out[0].valid);
        assert!(out[1].observation["error"].as_str().unwrap().contains("detection failed"));
    }

    #[tokio::test]
    async fn failed_group_task_is_broadened() {
        let handle = tokio::spawn(async { Err::<Vec<Outcome>, _>("worker died".to_string()) });
        let mut agg = ResultAggregator::new(3, "tr");
        agg.collect(vec![
            PendingGroup {
                slug: "x.fail".into(),
                indices: vec![0, 2],
                task: GroupTask::Running(handle),
            },
            PendingGroup {
                slug: "x.ok".into(),
                indices: vec![1],
                task: GroupTask::Ready(vec![Outcome::value(json!({"ok": true}))]),
            },
        ])
        .await;
        let out = agg.finish();
        assert_eq!(out[0].observation["error"], "worker died");
        assert_eq!(out[0].observation["tool"], "x.fail");
        assert_eq!(out[2].observation["tool"], "x.fail");
        assert!(out[1].valid);
        assert_eq!(out[1].observation["trace_id"], "tr");
    }

    #[test]
    fn broadcast_covers_every_index() {
        let out = broadcast_failure(3, "boom", "tr");
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].observation["error"], "Batch processing failed: boom");
    }
}
