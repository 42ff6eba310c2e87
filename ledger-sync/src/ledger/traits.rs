//! Core trait for ledger service clients.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::sync::Arc;

use crate::context::CredentialContext;
use crate::error::Result;
use crate::model::{
    BudgetSnapshot, CommitAck, ExternalTransaction, LedgerAccount, LedgerCategory,
    LedgerTransaction, NewTransaction,
};

/// Session details returned when a budget file is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Stable id of the opened file, used as the sensor source id
    pub file_id: String,
}

/// Authenticated access to one budget file on the ledger service.
///
/// Implementations classify failures: a missing file is `File`, rejected
/// credentials or an undecryptable file is `Unknown`, transport failures are
/// `Connect` or `Cert`.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Open (or re-validate) the session and confirm the file is accessible.
    async fn open_session(&self) -> Result<SessionInfo>;

    /// All accounts of the file.
    async fn list_accounts(&self) -> Result<Vec<LedgerAccount>>;

    /// All budget categories.
    async fn list_categories(&self) -> Result<Vec<LedgerCategory>>;

    /// Transactions of an account dated on or after `since`.
    async fn transactions(&self, account_id: &str, since: NaiveDate) -> Result<Vec<LedgerTransaction>>;

    /// Recorded transactions of an account whose `imported_id` is one of
    /// `imported_ids`, at any date.
    async fn find_imported(&self, account_id: &str, imported_ids: &[String]) -> Result<Vec<LedgerTransaction>> {
        let wanted: HashSet<&str> = imported_ids.iter().map(String::as_str).collect();
        Ok(self
            .transactions(account_id, NaiveDate::default())
            .await?
            .into_iter()
            .filter(|tx| tx.imported_id.as_deref().is_some_and(|id| wanted.contains(id)))
            .collect())
    }

    /// Budgeted amounts per category and month plus current balances.
    async fn budget_snapshot(&self) -> Result<BudgetSnapshot>;

    /// Record a batch of transactions on one account.
    ///
    /// All-or-nothing: on error nothing was recorded. The service matches
    /// `imported_id` against existing transactions, so resubmitting the same
    /// batch never duplicates.
    async fn import_transactions(&self, account_id: &str, batch: &[NewTransaction]) -> Result<CommitAck>;

    /// Set the budgeted amount of a category for a month (`YYYYMM`).
    async fn set_budget_amount(&self, month: &str, category_id: &str, amount: i64) -> Result<()>;

    /// Create an on-budget account.
    async fn create_account(&self, name: &str) -> Result<LedgerAccount>;

    /// Fetch transactions from the bank linked to `account` through the
    /// service's own bank-sync capability.
    async fn bank_transactions(
        &self,
        account: &LedgerAccount,
        since: NaiveDate,
    ) -> Result<Vec<ExternalTransaction>>;
}

/// Builds a ledger client for a validated context.
pub trait LedgerConnector: Send + Sync {
    fn connect(&self, context: Arc<CredentialContext>) -> Arc<dyn LedgerClient>;
}

impl<F> LedgerConnector for F
where
    F: Fn(Arc<CredentialContext>) -> Arc<dyn LedgerClient> + Send + Sync,
{
    fn connect(&self, context: Arc<CredentialContext>) -> Arc<dyn LedgerClient> {
        self(context)
    }
}

/// Find an account by case-insensitive name, creating it when missing.
pub async fn get_or_create_account(ledger: &dyn LedgerClient, name: &str) -> Result<LedgerAccount> {
    let accounts = ledger.list_accounts().await?;
    if let Some(existing) = accounts
        .into_iter()
        .find(|a| !a.closed && a.name.eq_ignore_ascii_case(name))
    {
        return Ok(existing);
    }
    tracing::info!(account = name, "Creating ledger account");
    ledger.create_account(name).await
}
