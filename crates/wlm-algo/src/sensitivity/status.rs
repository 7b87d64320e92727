//! Process-wide matrix build status.
//!
//! One [`BuildCoordinator`] is shared by everything that can ask about the
//! build. The build loop is its only mutator; readers always get a snapshot
//! copy, never a live reference. There is deliberately no abort signal: an
//! in-progress build runs to completion, and `generate(force=true)` only
//! takes effect once the state has left `InProgress`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Lifecycle of the sensitivity matrix build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    NotStarted,
    InProgress,
    Completed,
    Error,
}

/// Live progress of a running build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildProgress {
    pub processed: usize,
    pub total: usize,
    /// `round(100 · processed / total)`
    pub percentage: u32,
}

impl BuildProgress {
    pub fn new(processed: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            (100.0 * processed as f64 / total as f64).round() as u32
        };
        Self {
            processed,
            total,
            percentage,
        }
    }
}

/// Shape of a finished matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixStats {
    pub candidates: usize,
    pub sensors: usize,
    pub total_entries: usize,
    pub generated_at: DateTime<Utc>,
}

/// Snapshot handed to status callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixBuildStatus {
    pub state: BuildState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<BuildProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<MatrixStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MatrixBuildStatus {
    fn not_started() -> Self {
        Self {
            state: BuildState::NotStarted,
            progress: None,
            stats: None,
            error: None,
        }
    }
}

/// Shared handle on the build status.
#[derive(Clone, Default)]
pub struct BuildCoordinator {
    inner: Arc<RwLock<Option<MatrixBuildStatus>>>,
}

impl BuildCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current status.
    pub async fn snapshot(&self) -> MatrixBuildStatus {
        self.inner
            .read()
            .await
            .clone()
            .unwrap_or_else(MatrixBuildStatus::not_started)
    }

    /// Atomically claim the build. Returns false when one is already
    /// running, leaving the existing status untouched.
    pub(crate) async fn try_begin(&self, total: usize) -> bool {
        let mut guard = self.inner.write().await;
        if matches!(
            guard.as_ref().map(|s| s.state),
            Some(BuildState::InProgress)
        ) {
            return false;
        }
        *guard = Some(MatrixBuildStatus {
            state: BuildState::InProgress,
            progress: Some(BuildProgress::new(0, total)),
            stats: None,
            error: None,
        });
        true
    }

    pub(crate) async fn record_progress(&self, processed: usize, total: usize) {
        let mut guard = self.inner.write().await;
        if let Some(status) = guard.as_mut() {
            status.progress = Some(BuildProgress::new(processed, total));
        }
    }

    pub(crate) async fn complete(&self, stats: MatrixStats) {
        let mut guard = self.inner.write().await;
        let progress = guard.as_ref().and_then(|s| s.progress.clone());
        *guard = Some(MatrixBuildStatus {
            state: BuildState::Completed,
            progress,
            stats: Some(stats),
            error: None,
        });
    }

    pub(crate) async fn fail(&self, error: String) {
        let mut guard = self.inner.write().await;
        let progress = guard.as_ref().and_then(|s| s.progress.clone());
        *guard = Some(MatrixBuildStatus {
            state: BuildState::Error,
            progress,
            stats: None,
            error: Some(error),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let coordinator = BuildCoordinator::new();
        let status = coordinator.snapshot().await;
        assert_eq!(status.state, BuildState::NotStarted);
        assert!(status.progress.is_none());
    }

    #[tokio::test]
    async fn test_begin_is_exclusive() {
        let coordinator = BuildCoordinator::new();
        assert!(coordinator.try_begin(10).await);
        assert!(!coordinator.try_begin(10).await);

        coordinator
            .complete(MatrixStats {
                candidates: 10,
                sensors: 3,
                total_entries: 30,
                generated_at: Utc::now(),
            })
            .await;
        // Finished builds can be superseded
        assert!(coordinator.try_begin(5).await);
    }

    #[tokio::test]
    async fn test_progress_rounding() {
        let coordinator = BuildCoordinator::new();
        coordinator.try_begin(3).await;
        coordinator.record_progress(1, 3).await;
        let status = coordinator.snapshot().await;
        assert_eq!(status.progress.unwrap().percentage, 33);

        coordinator.record_progress(2, 3).await;
        let status = coordinator.snapshot().await;
        assert_eq!(status.progress.unwrap().percentage, 67);
    }

    #[tokio::test]
    async fn test_failure_keeps_progress() {
        let coordinator = BuildCoordinator::new();
        coordinator.try_begin(4).await;
        coordinator.record_progress(2, 4).await;
        coordinator.fail("baseline solve failed".into()).await;

        let status = coordinator.snapshot().await;
        assert_eq!(status.state, BuildState::Error);
        assert_eq!(status.error.as_deref(), Some("baseline solve failed"));
        assert_eq!(status.progress.unwrap().processed, 2);
    }
}
