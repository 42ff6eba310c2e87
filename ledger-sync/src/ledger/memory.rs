//! In-memory ledger for testing.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::traits::{LedgerClient, SessionInfo};
use crate::error::{Result, SyncError};
use crate::model::{
    BudgetAmount, BudgetSnapshot, CategoryBudget, CommitAck, ExternalTransaction, LedgerAccount,
    LedgerCategory, LedgerTransaction, NewTransaction,
};

#[derive(Default)]
struct State {
    accounts: Vec<LedgerAccount>,
    categories: Vec<LedgerCategory>,
    transactions: Vec<LedgerTransaction>,
    budget: BudgetSnapshot,
    bank_feeds: HashMap<String, Vec<ExternalTransaction>>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// Budget file held in memory.
///
/// Imports are all-or-nothing and dedup by `imported_id` per account, like
/// the real service. Failures can be injected for commits and reads.
pub struct MemoryLedger {
    file_id: String,
    state: Mutex<State>,
    missing_file: AtomicBool,
    commit_failures: Mutex<VecDeque<SyncError>>,
    read_failures: Mutex<VecDeque<SyncError>>,
    import_delay: Mutex<Option<Duration>>,
    session_calls: AtomicU32,
    commit_calls: AtomicU32,
}

impl MemoryLedger {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            state: Mutex::new(State::default()),
            missing_file: AtomicBool::new(false),
            commit_failures: Mutex::new(VecDeque::new()),
            read_failures: Mutex::new(VecDeque::new()),
            import_delay: Mutex::new(None),
            session_calls: AtomicU32::new(0),
            commit_calls: AtomicU32::new(0),
        }
    }

    /// Make `open_session` report the file as missing.
    pub fn with_missing_file(self) -> Self {
        self.missing_file.store(true, Ordering::SeqCst);
        self
    }

    /// Sleep before each import is applied.
    pub fn with_import_delay(self, delay: Duration) -> Self {
        if let Ok(mut slot) = self.import_delay.lock() {
            *slot = Some(delay);
        }
        self
    }

    pub fn add_account(&self, account: LedgerAccount) {
        self.lock().accounts.push(account);
    }

    pub fn add_category(&self, id: &str, name: &str, group_name: &str) {
        self.lock().categories.push(LedgerCategory {
            id: id.to_string(),
            name: name.to_string(),
            group_name: Some(group_name.to_string()),
        });
    }

    /// Record budgeted amounts and the current balance of a category.
    pub fn add_budget(&self, category_id: &str, name: &str, amounts: &[(&str, Option<i64>)], balance: i64) {
        let mut amounts: Vec<BudgetAmount> = amounts
            .iter()
            .map(|(month, amount)| BudgetAmount {
                month: month.to_string(),
                amount: *amount,
            })
            .collect();
        amounts.sort_by(|a, b| a.month.cmp(&b.month));
        self.lock().budget.categories.push(CategoryBudget {
            category_id: category_id.to_string(),
            name: name.to_string(),
            amounts,
            balance,
        });
    }

    /// Transactions the linked bank reports for an account.
    pub fn set_bank_feed(&self, account_id: &str, transactions: Vec<ExternalTransaction>) {
        self.lock().bank_feeds.insert(account_id.to_string(), transactions);
    }

    /// Fail the next `count` commits with `error`.
    pub fn fail_next_commits(&self, count: usize, error: SyncError) {
        if let Ok(mut queue) = self.commit_failures.lock() {
            queue.extend(std::iter::repeat(error).take(count));
        }
    }

    /// Fail the next `count` read calls with `error`.
    pub fn fail_next_reads(&self, count: usize, error: SyncError) {
        if let Ok(mut queue) = self.read_failures.lock() {
            queue.extend(std::iter::repeat(error).take(count));
        }
    }

    /// Recorded transactions of an account, in insertion order.
    pub fn transactions_for(&self, account_id: &str) -> Vec<LedgerTransaction> {
        self.lock()
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn accounts(&self) -> Vec<LedgerAccount> {
        self.lock().accounts.clone()
    }

    pub fn commit_count(&self) -> u32 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> u32 {
        self.session_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn injected(queue: &Mutex<VecDeque<SyncError>>) -> Result<()> {
        match queue.lock().ok().and_then(|mut q| q.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn check_read(&self) -> Result<()> {
        Self::injected(&self.read_failures)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn open_session(&self) -> Result<SessionInfo> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        if self.missing_file.load(Ordering::SeqCst) {
            return Err(SyncError::File(format!("Budget file {} not found", self.file_id)));
        }
        Ok(SessionInfo {
            file_id: self.file_id.clone(),
        })
    }

    async fn list_accounts(&self) -> Result<Vec<LedgerAccount>> {
        self.check_read()?;
        let state = self.lock();
        let mut accounts = state.accounts.clone();
        for account in &mut accounts {
            account.balance = state
                .transactions
                .iter()
                .filter(|t| t.account_id == account.id)
                .map(|t| t.amount)
                .sum::<i64>()
                + account.balance;
        }
        Ok(accounts)
    }

    async fn list_categories(&self) -> Result<Vec<LedgerCategory>> {
        self.check_read()?;
        Ok(self.lock().categories.clone())
    }

    async fn transactions(&self, account_id: &str, since: NaiveDate) -> Result<Vec<LedgerTransaction>> {
        self.check_read()?;
        Ok(self
            .lock()
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id && t.date >= since)
            .cloned()
            .collect())
    }

    async fn budget_snapshot(&self) -> Result<BudgetSnapshot> {
        self.check_read()?;
        Ok(self.lock().budget.clone())
    }

    async fn import_transactions(&self, account_id: &str, batch: &[NewTransaction]) -> Result<CommitAck> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.import_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Self::injected(&self.commit_failures)?;

        let mut state = self.lock();
        if !state.accounts.iter().any(|a| a.id == account_id) {
            return Err(SyncError::NotFound(format!("account {}", account_id)));
        }

        let mut ack = CommitAck::default();
        for tx in batch {
            let existing = state
                .transactions
                .iter()
                .find(|t| t.account_id == account_id && t.imported_id.as_deref() == Some(tx.imported_id.as_str()))
                .map(|t| t.id.clone());
            match existing {
                Some(id) => ack.updated.push(id),
                None => {
                    let id = state.next_id("tx");
                    state.transactions.push(LedgerTransaction {
                        id: id.clone(),
                        account_id: account_id.to_string(),
                        imported_id: Some(tx.imported_id.clone()),
                        amount: tx.amount,
                        date: tx.date,
                        payee: tx.payee.clone(),
                        notes: tx.notes.clone(),
                        category_id: tx.category_id.clone(),
                        cleared: tx.cleared,
                    });
                    ack.added.push(id);
                }
            }
        }
        Ok(ack)
    }

    async fn set_budget_amount(&self, month: &str, category_id: &str, amount: i64) -> Result<()> {
        let mut state = self.lock();
        let category = state
            .budget
            .categories
            .iter_mut()
            .find(|c| c.category_id == category_id)
            .ok_or_else(|| SyncError::NotFound(format!("category {}", category_id)))?;
        match category.amounts.iter_mut().find(|a| a.month == month) {
            Some(entry) => entry.amount = Some(amount),
            None => {
                category.amounts.push(BudgetAmount {
                    month: month.to_string(),
                    amount: Some(amount),
                });
                category.amounts.sort_by(|a, b| a.month.cmp(&b.month));
            }
        }
        Ok(())
    }

    async fn create_account(&self, name: &str) -> Result<LedgerAccount> {
        let mut state = self.lock();
        let id = state.next_id("acct");
        let account = LedgerAccount::new(id, name);
        state.accounts.push(account.clone());
        Ok(account)
    }

    async fn bank_transactions(
        &self,
        account: &LedgerAccount,
        since: NaiveDate,
    ) -> Result<Vec<ExternalTransaction>> {
        self.check_read()?;
        Ok(self
            .lock()
            .bank_feeds
            .get(&account.id)
            .map(|rows| rows.iter().filter(|t| t.date >= since).cloned().collect())
            .unwrap_or_default())
    }
}
