//! Process-local runner registry with heartbeat liveness.

use std::{collections::HashMap, time::Duration};

use runcoord_core::RunnerId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Registry error.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Runner {0} is not registered; register first")]
    NotRegistered(RunnerId),
    #[error("Runner {runner_id} is registered from {registered_host}, not {host}")]
    HostMismatch {
        runner_id: RunnerId,
        registered_host: String,
        host: String,
    },
}

/// Where a registered runner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    /// Deregistered by someone else; told to shut down on its next poll.
    Retiring { requested_at: i64 },
}

/// Heartbeat-derived liveness annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Stale,
}

/// Who asked for a runner to be removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    #[serde(rename = "self")]
    SelfInitiated,
    #[default]
    External,
}

/// A registered runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerEntry {
    pub runner_id: RunnerId,
    pub host: String,
    pub capabilities: Vec<String>,
    pub registered_at: i64,
    pub last_heartbeat_at: i64,
    pub lifecycle: Lifecycle,
    /// Set once the stale transition has been logged.
    #[serde(skip)]
    stale_reported: bool,
}

impl RunnerEntry {
    #[must_use]
    pub const fn is_retiring(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Retiring { .. })
    }
}

/// Registry snapshot of one runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerView {
    #[serde(flatten)]
    pub entry: RunnerEntry,
    pub liveness: Liveness,
    pub heartbeat_age_ms: i64,
}

/// Result of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    New,
    Refreshed,
    /// Replaced a stale entry registered from another host.
    TookOver,
}

/// Result of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// The runner was past the liveness timeout before this beat.
    pub was_stale: bool,
    pub retiring: bool,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Tracks known runners. All methods take `now` in epoch milliseconds.
pub struct RunnerRegistry {
    heartbeat_timeout_ms: i64,
    runners: RwLock<HashMap<RunnerId, RunnerEntry>>,
}

impl RunnerRegistry {
    #[must_use]
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout_ms: millis(heartbeat_timeout),
            runners: RwLock::new(HashMap::new()),
        }
    }

    const fn liveness_at(&self, last_heartbeat_at: i64, now: i64) -> Liveness {
        if now - last_heartbeat_at < self.heartbeat_timeout_ms {
            Liveness::Alive
        } else {
            Liveness::Stale
        }
    }

    /// Register or refresh a runner.
    ///
    /// # Errors
    /// Returns `HostMismatch` if a live runner with this id is registered
    /// from a different host.
    pub async fn register(
        &self,
        runner_id: &str,
        host: &str,
        capabilities: Vec<String>,
        now: i64,
    ) -> Result<(RunnerEntry, Registration), RegistryError> {
        let mut runners = self.runners.write().await;

        let registration = match runners.get(runner_id) {
            None => Registration::New,
            Some(existing) if existing.host == host => Registration::Refreshed,
            Some(existing) => {
                if self.liveness_at(existing.last_heartbeat_at, now) == Liveness::Alive {
                    return Err(RegistryError::HostMismatch {
                        runner_id: runner_id.to_string(),
                        registered_host: existing.host.clone(),
                        host: host.to_string(),
                    });
                }
                Registration::TookOver
            }
        };

        let registered_at = match (registration, runners.get(runner_id)) {
            (Registration::Refreshed, Some(existing)) => existing.registered_at,
            _ => now,
        };
        // Re-registering never cancels an operator's retirement request.
        let lifecycle = runners
            .get(runner_id)
            .map_or(Lifecycle::Active, |existing| existing.lifecycle);
        let entry = RunnerEntry {
            runner_id: runner_id.to_string(),
            host: host.to_string(),
            capabilities,
            registered_at,
            last_heartbeat_at: now,
            lifecycle,
            stale_reported: false,
        };
        runners.insert(entry.runner_id.clone(), entry.clone());

        Ok((entry, registration))
    }

    /// Record a heartbeat.
    ///
    /// # Errors
    /// Returns `NotRegistered` for unknown runners.
    pub async fn heartbeat(&self, runner_id: &str, now: i64) -> Result<Heartbeat, RegistryError> {
        let mut runners = self.runners.write().await;
        let entry = runners
            .get_mut(runner_id)
            .ok_or_else(|| RegistryError::NotRegistered(runner_id.to_string()))?;

        let was_stale = self.liveness_at(entry.last_heartbeat_at, now) == Liveness::Stale;
        entry.last_heartbeat_at = now;
        entry.stale_reported = false;

        Ok(Heartbeat {
            was_stale,
            retiring: entry.is_retiring(),
        })
    }

    /// Heartbeat if registered; unregistered runners get `None`.
    pub async fn touch(&self, runner_id: &str, now: i64) -> Option<RunnerEntry> {
        let mut runners = self.runners.write().await;
        runners.get_mut(runner_id).map(|entry| {
            entry.last_heartbeat_at = now;
            entry.stale_reported = false;
            entry.clone()
        })
    }

    pub async fn get(&self, runner_id: &str) -> Option<RunnerEntry> {
        self.runners.read().await.get(runner_id).cloned()
    }

    /// All runners with liveness, sorted by id.
    pub async fn list(&self, now: i64) -> Vec<RunnerView> {
        let runners = self.runners.read().await;
        let mut views: Vec<RunnerView> = runners
            .values()
            .map(|entry| RunnerView {
                entry: entry.clone(),
                liveness: self.liveness_at(entry.last_heartbeat_at, now),
                heartbeat_age_ms: now - entry.last_heartbeat_at,
            })
            .collect();
        views.sort_by(|a, b| a.entry.runner_id.cmp(&b.entry.runner_id));
        views
    }

    /// Remove a runner. Returns whether it was registered.
    pub async fn remove(&self, runner_id: &str) -> bool {
        self.runners.write().await.remove(runner_id).is_some()
    }

    /// Mark a runner for external retirement. Returns `false` if it was
    /// already retiring.
    ///
    /// # Errors
    /// Returns `NotRegistered` for unknown runners.
    pub async fn retire(&self, runner_id: &str, now: i64) -> Result<bool, RegistryError> {
        let mut runners = self.runners.write().await;
        let entry = runners
            .get_mut(runner_id)
            .ok_or_else(|| RegistryError::NotRegistered(runner_id.to_string()))?;
        if entry.is_retiring() {
            return Ok(false);
        }
        entry.lifecycle = Lifecycle::Retiring { requested_at: now };
        Ok(true)
    }

    /// Drop retiring runners whose grace period has elapsed.
    pub async fn sweep_retired(&self, grace: Duration, now: i64) -> Vec<RunnerId> {
        let grace = millis(grace);
        let mut runners = self.runners.write().await;
        let expired: Vec<RunnerId> = runners
            .values()
            .filter(|entry| match entry.lifecycle {
                Lifecycle::Retiring { requested_at } => now - requested_at >= grace,
                Lifecycle::Active => false,
            })
            .map(|entry| entry.runner_id.clone())
            .collect();
        for runner_id in &expired {
            runners.remove(runner_id);
        }
        expired
    }

    /// Runners that turned stale since the last call.
    pub async fn newly_stale(&self, now: i64) -> Vec<RunnerEntry> {
        let mut runners = self.runners.write().await;
        runners
            .values_mut()
            .filter(|entry| {
                !entry.stale_reported
                    && self.liveness_at(entry.last_heartbeat_at, now) == Liveness::Stale
            })
            .map(|entry| {
                entry.stale_reported = true;
                entry.clone()
            })
            .collect()
    }

    /// Heartbeat age of a runner, if registered.
    pub async fn heartbeat_age(&self, runner_id: &str, now: i64) -> Option<i64> {
        self.runners
            .read()
            .await
            .get(runner_id)
            .map(|entry| now - entry.last_heartbeat_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RunnerRegistry {
        RunnerRegistry::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = registry();
        let (_, first) = registry
            .register("r-1", "host-a", vec!["gpu".into()], 1_000)
            .await
            .unwrap();
        assert_eq!(first, Registration::New);

        let (entry, second) = registry
            .register("r-1", "host-a", vec!["gpu".into(), "linux".into()], 2_000)
            .await
            .unwrap();
        assert_eq!(second, Registration::Refreshed);
        assert_eq!(entry.registered_at, 1_000);
        assert_eq!(entry.last_heartbeat_at, 2_000);
        assert_eq!(entry.capabilities.len(), 2);
        assert_eq!(registry.list(2_000).await.len(), 1);
    }

    #[tokio::test]
    async fn re_registering_keeps_retirement() {
        let registry = registry();
        registry.register("r-1", "host-a", vec![], 1_000).await.unwrap();
        assert!(registry.retire("r-1", 2_000).await.unwrap());

        let (entry, registration) = registry
            .register("r-1", "host-a", vec![], 3_000)
            .await
            .unwrap();
        assert_eq!(registration, Registration::Refreshed);
        assert_eq!(entry.lifecycle, Lifecycle::Retiring { requested_at: 2_000 });

        let grace = Duration::from_secs(60);
        assert_eq!(registry.sweep_retired(grace, 62_000).await, vec!["r-1".to_string()]);
    }

    #[tokio::test]
    async fn host_mismatch_only_while_alive() {
        let registry = registry();
        registry.register("r-1", "host-a", vec![], 0).await.unwrap();

        let err = registry
            .register("r-1", "host-b", vec![], 10_000)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::HostMismatch { .. }));

        let (entry, registration) = registry
            .register("r-1", "host-b", vec![], 40_000)
            .await
            .unwrap();
        assert_eq!(registration, Registration::TookOver);
        assert_eq!(entry.host, "host-b");
    }

    #[tokio::test]
    async fn silent_runner_turns_stale() {
        let registry = registry();
        registry.register("r-1", "host-a", vec![], 0).await.unwrap();

        let views = registry.list(29_999).await;
        assert_eq!(views[0].liveness, Liveness::Alive);
        let views = registry.list(30_000).await;
        assert_eq!(views[0].liveness, Liveness::Stale);
        assert_eq!(views[0].heartbeat_age_ms, 30_000);

        let stale = registry.newly_stale(30_000).await;
        assert_eq!(stale.len(), 1);
        assert!(registry.newly_stale(31_000).await.is_empty(), "reported once");

        let beat = registry.heartbeat("r-1", 31_000).await.unwrap();
        assert!(beat.was_stale);
        assert_eq!(registry.list(31_000).await[0].liveness, Liveness::Alive);
    }

    #[tokio::test]
    async fn heartbeat_requires_registration() {
        let err = registry().heartbeat("ghost", 0).await.unwrap_err();
        assert_eq!(err, RegistryError::NotRegistered("ghost".into()));
        assert!(registry().touch("ghost", 0).await.is_none());
    }

    #[tokio::test]
    async fn retirement_and_grace_sweep() {
        let registry = registry();
        registry.register("r-1", "host-a", vec![], 0).await.unwrap();
        registry.register("r-2", "host-a", vec![], 0).await.unwrap();

        assert!(registry.retire("r-1", 1_000).await.unwrap());
        assert!(!registry.retire("r-1", 2_000).await.unwrap());
        assert!(registry.get("r-1").await.unwrap().is_retiring());

        let grace = Duration::from_secs(60);
        assert!(registry.sweep_retired(grace, 60_999).await.is_empty());
        assert_eq!(registry.sweep_retired(grace, 61_000).await, vec!["r-1".to_string()]);
        assert!(registry.get("r-1").await.is_none());
        assert!(registry.get("r-2").await.is_some());

        assert!(registry.remove("r-2").await);
        assert!(!registry.remove("r-2").await);
    }

    #[test]
    fn initiator_wire_names() {
        assert_eq!(
            serde_json::to_string(&Initiator::SelfInitiated).unwrap(),
            "\"self\""
        );
        assert_eq!(
            serde_json::from_str::<Initiator>("\"external\"").unwrap(),
            Initiator::External
        );
    }
}
