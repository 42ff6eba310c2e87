//! Sync run records.
//!
//! Every triggered operation produces a [`SyncRun`]. Each instance keeps a
//! bounded history of them, newest first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{ErrorKind, SyncError};
use crate::reconcile::Conflict;

/// Operation a run performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    BankSync,
    BudgetSync,
    AkahuBankSync,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::BankSync => "bank_sync",
            ServiceKind::BudgetSync => "budget_sync",
            ServiceKind::AkahuBankSync => "akahu_bank_sync",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// Some accounts failed, the others were committed
    PartiallyFailed,
    Failed,
    Cancelled,
}

/// Per-account result of a transaction sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountReport {
    pub account_id: String,
    pub name: String,
    pub fetched: usize,
    pub pages: usize,
    pub inserted: usize,
    pub unchanged: usize,
    pub conflicts: Vec<Conflict>,
    /// Pages skipped because they predate the cursor
    pub stopped_early: bool,
}

/// An account that could not be synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFailure {
    pub account_id: String,
    pub name: String,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Record of one triggered operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: String,
    pub instance_id: String,
    pub service: ServiceKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    /// Attempts made, including the first
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub accounts: Vec<AccountReport>,
    pub failures: Vec<AccountFailure>,
}

impl SyncRun {
    pub fn start(instance_id: impl Into<String>, service: ServiceKind) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.into(),
            service,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            attempts: 0,
            error_kind: None,
            error_message: None,
            accounts: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Settle the run from its account results.
    pub fn succeed(mut self) -> Self {
        self.outcome = Some(if self.failures.is_empty() {
            RunOutcome::Succeeded
        } else {
            RunOutcome::PartiallyFailed
        });
        if let Some(first) = self.failures.first() {
            self.error_kind = Some(first.error_kind);
            self.error_message = Some(first.message.clone());
        }
        self.finished_at = Some(Utc::now());
        self
    }

    /// Settle the run as failed or cancelled.
    pub fn fail(mut self, error: &SyncError) -> Self {
        self.outcome = Some(match error {
            SyncError::Cancelled => RunOutcome::Cancelled,
            _ => RunOutcome::Failed,
        });
        self.error_kind = Some(error.kind());
        self.error_message = Some(error.to_string());
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }

    pub fn inserted(&self) -> usize {
        self.accounts.iter().map(|a| a.inserted).sum()
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Some(RunOutcome::Succeeded)
    }
}

/// Bounded run history (newest first).
#[derive(Clone)]
pub struct RunHistory {
    runs: Arc<RwLock<VecDeque<SyncRun>>>,
    max_entries: usize,
}

impl RunHistory {
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            runs: Arc::new(RwLock::new(VecDeque::new())),
            max_entries: max_entries.max(1),
        }
    }

    pub async fn record(&self, run: SyncRun) {
        let mut runs = self.runs.write().await;
        runs.push_front(run);

        // Prune if over limit
        while runs.len() > self.max_entries {
            runs.pop_back();
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<SyncRun> {
        let runs = self.runs.read().await;
        runs.iter().take(limit).cloned().collect()
    }

    pub async fn last(&self) -> Option<SyncRun> {
        self.runs.read().await.front().cloned()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes() {
        let ok = SyncRun::start("i", ServiceKind::BankSync).succeed();
        assert_eq!(ok.outcome, Some(RunOutcome::Succeeded));
        assert!(ok.error_kind.is_none());

        let mut partial = SyncRun::start("i", ServiceKind::BankSync);
        partial.failures.push(AccountFailure {
            account_id: "a".into(),
            name: "Checking".into(),
            error_kind: ErrorKind::FailedToConnect,
            message: "reset".into(),
        });
        let partial = partial.succeed();
        assert_eq!(partial.outcome, Some(RunOutcome::PartiallyFailed));
        assert_eq!(partial.error_kind, Some(ErrorKind::FailedToConnect));

        let cancelled = SyncRun::start("i", ServiceKind::BudgetSync).fail(&SyncError::Cancelled);
        assert_eq!(cancelled.outcome, Some(RunOutcome::Cancelled));

        let failed = SyncRun::start("i", ServiceKind::BudgetSync).fail(&SyncError::File("x".into()));
        assert_eq!(failed.outcome, Some(RunOutcome::Failed));
        assert_eq!(failed.error_kind, Some(ErrorKind::FailedFile));
        assert!(failed.duration_ms().is_some());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let history = RunHistory::with_max_entries(3);
        for _ in 0..5 {
            history.record(SyncRun::start("i", ServiceKind::BankSync).succeed()).await;
        }
        history
            .record(SyncRun::start("i", ServiceKind::BudgetSync).succeed())
            .await;

        assert_eq!(history.len().await, 3);
        assert_eq!(history.last().await.unwrap().service, ServiceKind::BudgetSync);
        let services: Vec<_> = history.recent(10).await.iter().map(|r| r.service).collect();
        assert_eq!(
            services,
            vec![ServiceKind::BudgetSync, ServiceKind::BankSync, ServiceKind::BankSync]
        );
    }

    #[test]
    fn test_empty_history() {
        let history = RunHistory::with_max_entries(0);
        tokio_test::block_on(async {
            assert!(history.last().await.is_none());
            history.record(SyncRun::start("i", ServiceKind::BankSync).succeed()).await;
            history.record(SyncRun::start("i", ServiceKind::BankSync).succeed()).await;
            assert_eq!(history.len().await, 1);
        });
    }

    #[test]
    fn test_run_serializes_with_vocabulary_keys() {
        let run = SyncRun::start("i", ServiceKind::AkahuBankSync).fail(&SyncError::Connect("x".into()));
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["service"], "akahu_bank_sync");
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["error_kind"], "failed_to_connect");
    }
}
