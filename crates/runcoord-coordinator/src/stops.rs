//! Cooperative stop directives, delivered to the owning runner on its poll.

use std::collections::HashMap;

use runcoord_core::{RunId, RunnerId};
use serde::Serialize;
use tokio::sync::Mutex;

/// A pending request for a runner to stop one of its runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopCommand {
    pub run_id: RunId,
    pub runner_id: RunnerId,
    pub requested_at: i64,
    pub acknowledged: bool,
}

/// Per-run stop commands. Not persisted.
#[derive(Default)]
pub struct StopChannel {
    commands: Mutex<HashMap<RunId, StopCommand>>,
}

impl StopChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stop for `run_id`. Returns `false` if one is already queued.
    pub async fn enqueue(&self, run_id: RunId, runner_id: &str, now: i64) -> bool {
        let mut commands = self.commands.lock().await;
        if commands.contains_key(&run_id) {
            return false;
        }
        commands.insert(
            run_id,
            StopCommand {
                run_id,
                runner_id: runner_id.to_string(),
                requested_at: now,
                acknowledged: false,
            },
        );
        true
    }

    /// Unacknowledged commands for runs owned by `runner_id`, oldest first.
    /// Returned commands are marked acknowledged.
    pub async fn take_for_runner(&self, runner_id: &str) -> Vec<StopCommand> {
        let mut commands = self.commands.lock().await;
        let mut taken: Vec<StopCommand> = commands
            .values_mut()
            .filter(|cmd| cmd.runner_id == runner_id && !cmd.acknowledged)
            .map(|cmd| {
                cmd.acknowledged = true;
                cmd.clone()
            })
            .collect();
        taken.sort_by_key(|cmd| (cmd.requested_at, cmd.run_id));
        taken
    }

    /// Drop the command for a run that reached a terminal state.
    pub async fn discard(&self, run_id: RunId) -> Option<StopCommand> {
        self.commands.lock().await.remove(&run_id)
    }

    pub async fn get(&self, run_id: RunId) -> Option<StopCommand> {
        self.commands.lock().await.get(&run_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let stops = StopChannel::new();
        let run_id = Uuid::now_v7();
        assert!(stops.enqueue(run_id, "r-1", 1).await);
        assert!(!stops.enqueue(run_id, "r-1", 2).await);
        assert_eq!(stops.get(run_id).await.unwrap().requested_at, 1);
    }

    #[tokio::test]
    async fn delivered_once_to_the_owner() {
        let stops = StopChannel::new();
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        stops.enqueue(second, "r-1", 20).await;
        stops.enqueue(first, "r-1", 10).await;
        stops.enqueue(Uuid::now_v7(), "r-2", 5).await;

        assert!(stops.take_for_runner("r-3").await.is_empty());

        let taken = stops.take_for_runner("r-1").await;
        assert_eq!(
            taken.iter().map(|c| c.run_id).collect::<Vec<_>>(),
            vec![first, second]
        );
        assert!(taken.iter().all(|c| c.acknowledged));
        assert!(stops.take_for_runner("r-1").await.is_empty());

        // Acknowledged commands still block a second enqueue.
        assert!(!stops.enqueue(first, "r-1", 30).await);
    }

    #[tokio::test]
    async fn discard_removes_unobserved_command() {
        let stops = StopChannel::new();
        let run_id = Uuid::now_v7();
        stops.enqueue(run_id, "r-1", 1).await;

        let discarded = stops.discard(run_id).await.unwrap();
        assert!(!discarded.acknowledged);
        assert!(stops.take_for_runner("r-1").await.is_empty());
        assert!(stops.discard(run_id).await.is_none());
    }
}
