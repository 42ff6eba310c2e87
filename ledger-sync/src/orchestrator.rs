//! Sync orchestrator.
//!
//! Owns the configured instances and runs their operations. Each instance
//! admits one run at a time; a trigger that arrives while a run is active is
//! rejected with [`SyncError::AlreadyRunning`]. Runs across instances share a
//! bounded worker pool.
//!
//! A run retries transient failures with exponential backoff, bounds every
//! ledger call with the request timeout and can be cancelled. Cursors only
//! move after the ledger acknowledged every batch of an account.

use futures::future::join_all;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::{InstanceConfig, SyncSettings};
use crate::context::CredentialContext;
use crate::cursor::CursorStore;
use crate::error::{Result, SyncError};
use crate::feed::{AkahuFeed, AkahuOptions, BankFeed, LinkedBankFeed};
use crate::ledger::{LedgerClient, LedgerConnector};
use crate::model::{Account, LedgerCategory};
use crate::reconcile::{page_is_stale, ReconciliationEngine};
use crate::run::{AccountFailure, AccountReport, RunHistory, RunOutcome, ServiceKind, SyncRun};
use crate::sensor::SensorSnapshot;

/// Operation to run on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Linked-bank sync through the ledger service
    BankSync,
    /// Refresh the budget file and sensors
    BudgetSync,
    /// Direct Akahu sync
    AkahuBankSync(AkahuOptions),
}

impl SyncRequest {
    pub fn service(&self) -> ServiceKind {
        match self {
            SyncRequest::BankSync => ServiceKind::BankSync,
            SyncRequest::BudgetSync => ServiceKind::BudgetSync,
            SyncRequest::AkahuBankSync(_) => ServiceKind::AkahuBankSync,
        }
    }
}

/// Observable state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Idle,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
}

/// Status of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub title: String,
    pub source_id: String,
    pub tls: &'static str,
    pub akahu: bool,
    pub state: InstanceState,
    pub last_run: Option<SyncRun>,
}

/// A configured ledger connection.
pub struct Instance {
    context: Arc<CredentialContext>,
    ledger: Arc<dyn LedgerClient>,
    source_id: String,
    run_lock: Mutex<()>,
    last_outcome: RwLock<Option<RunOutcome>>,
    history: RunHistory,
    sensors: RwLock<SensorSnapshot>,
    cancel: watch::Sender<u64>,
}

impl Instance {
    fn new(context: Arc<CredentialContext>, ledger: Arc<dyn LedgerClient>, source_id: String, history: usize) -> Self {
        let (cancel, _) = watch::channel(0);
        Self {
            context,
            ledger,
            source_id,
            run_lock: Mutex::new(()),
            last_outcome: RwLock::new(None),
            history: RunHistory::with_max_entries(history),
            sensors: RwLock::new(SensorSnapshot::default()),
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        self.context.instance_id()
    }

    pub fn context(&self) -> &Arc<CredentialContext> {
        &self.context
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    async fn state(&self) -> InstanceState {
        if self.is_running() {
            return InstanceState::Running;
        }
        match *self.last_outcome.read().await {
            Some(RunOutcome::Succeeded) => InstanceState::Succeeded,
            Some(RunOutcome::PartiallyFailed) => InstanceState::PartiallyFailed,
            Some(RunOutcome::Failed) => InstanceState::Failed,
            Some(RunOutcome::Cancelled) | None => InstanceState::Idle,
        }
    }

    fn cancel(&self) {
        self.cancel.send_modify(|generation| *generation += 1);
    }
}

/// Marks an instance as running until dropped.
struct RunGuard<'a> {
    _lock: MutexGuard<'a, ()>,
}

impl<'a> RunGuard<'a> {
    fn acquire(instance: &'a Instance) -> Result<Self> {
        let lock = instance
            .run_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning(instance.id().to_string()))?;
        Ok(Self { _lock: lock })
    }
}

/// Bound a call with the request timeout.
async fn bounded<T>(timeout: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| SyncError::Connect(format!("No response within {:?}", timeout)))?
}

/// Errors that end a run instead of failing a single account.
fn aborts_run(error: &SyncError) -> bool {
    matches!(
        error,
        SyncError::Cert(_) | SyncError::File(_) | SyncError::ReauthRequired(_) | SyncError::Cancelled
    )
}

/// Runs sync operations for every configured instance.
pub struct SyncOrchestrator {
    settings: SyncSettings,
    instances: DashMap<String, Arc<Instance>>,
    cursors: Arc<dyn CursorStore>,
    connector: Arc<dyn LedgerConnector>,
    workers: Semaphore,
}

impl SyncOrchestrator {
    pub fn new(settings: SyncSettings, cursors: Arc<dyn CursorStore>, connector: Arc<dyn LedgerConnector>) -> Self {
        let workers = Semaphore::new(settings.max_concurrent_runs.max(1));
        Self {
            settings,
            instances: DashMap::new(),
            cursors,
            connector,
            workers,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Validate a setup and register the instance.
    ///
    /// An endpoint and file pair that is already registered is rejected
    /// before any network access.
    pub async fn add_instance(&self, config: &InstanceConfig) -> Result<String> {
        let instance_id = CredentialContext::instance_id_for(&config.endpoint, &config.file);
        if self.instances.contains_key(&instance_id) {
            return Err(SyncError::AlreadyConfigured(instance_id));
        }
        let context = CredentialContext::validate(config, &self.settings).await?;
        self.attach(context).await
    }

    /// Register an instance from an already validated context.
    pub async fn attach(&self, context: Arc<CredentialContext>) -> Result<String> {
        let instance_id = context.instance_id().to_string();
        if self.instances.contains_key(&instance_id) {
            return Err(SyncError::AlreadyConfigured(instance_id));
        }

        let ledger = self.connector.connect(Arc::clone(&context));
        let session = bounded(self.settings.request_timeout(), ledger.open_session()).await?;

        let instance = Arc::new(Instance::new(
            context,
            ledger,
            session.file_id,
            self.settings.run_history,
        ));

        match self.instances.entry(instance_id.clone()) {
            Entry::Occupied(_) => return Err(SyncError::AlreadyConfigured(instance_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&instance));
            }
        }

        info!(
            instance_id = %instance_id,
            title = %instance.context.title(),
            source_id = %instance.source_id,
            "Instance configured"
        );

        if let Err(e) = self.refresh_sensors(&instance).await {
            warn!(instance_id = %instance_id, error = %e, "Initial sensor refresh failed");
        }
        Ok(instance_id)
    }

    /// Remove an instance, cancelling its run and forgetting its cursors.
    ///
    /// Cursors are cleared once the cancelled run has settled.
    pub async fn remove_instance(&self, instance_id: &str) -> Result<()> {
        let (_, instance) = self
            .instances
            .remove(instance_id)
            .ok_or_else(|| SyncError::NotFound(instance_id.to_string()))?;
        instance.cancel();
        let _idle = instance.run_lock.lock().await;
        self.cursors.clear(instance_id).await?;
        info!(instance_id, "Instance removed");
        Ok(())
    }

    /// Cancel the active run of an instance, if any.
    pub fn cancel(&self, instance_id: &str) -> Result<()> {
        let instance = self.instance(instance_id)?;
        if instance.is_running() {
            info!(instance_id, "Cancelling run");
            instance.cancel();
        }
        Ok(())
    }

    pub fn instance(&self, instance_id: &str) -> Result<Arc<Instance>> {
        self.instances
            .get(instance_id)
            .map(|i| Arc::clone(i.value()))
            .ok_or_else(|| SyncError::NotFound(instance_id.to_string()))
    }

    /// Registered instance ids, sorted.
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub async fn status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let instance = self.instance(instance_id)?;
        Ok(InstanceStatus {
            instance_id: instance.id().to_string(),
            title: instance.context.title(),
            source_id: instance.source_id.clone(),
            tls: instance.context.tls_kind(),
            akahu: instance.context.akahu().is_some(),
            state: instance.state().await,
            last_run: instance.history.last().await,
        })
    }

    pub async fn history(&self, instance_id: &str, limit: usize) -> Result<Vec<SyncRun>> {
        Ok(self.instance(instance_id)?.history.recent(limit).await)
    }

    pub async fn sensors(&self, instance_id: &str) -> Result<SensorSnapshot> {
        Ok(self.instance(instance_id)?.sensors.read().await.clone())
    }

    pub async fn bank_sync(&self, instance_id: &str) -> Result<SyncRun> {
        self.run(instance_id, SyncRequest::BankSync).await
    }

    pub async fn budget_sync(&self, instance_id: &str) -> Result<SyncRun> {
        self.run(instance_id, SyncRequest::BudgetSync).await
    }

    pub async fn akahu_bank_sync(&self, instance_id: &str, options: AkahuOptions) -> Result<SyncRun> {
        self.run(instance_id, SyncRequest::AkahuBankSync(options)).await
    }

    /// Run an operation to completion.
    ///
    /// Rejections (`NotFound`, `AlreadyRunning`) are errors; a run that
    /// started always comes back as a settled [`SyncRun`], failed or not.
    pub async fn run(&self, instance_id: &str, request: SyncRequest) -> Result<SyncRun> {
        let instance = self.instance(instance_id)?;
        let _guard = RunGuard::acquire(&instance)?;
        let mut cancel = instance.cancel.subscribe();
        // Removed between lookup and subscription
        if !self.instances.contains_key(instance_id) {
            return Err(SyncError::NotFound(instance_id.to_string()));
        }

        let _permit = tokio::select! {
            permit = self.workers.acquire() => {
                permit.map_err(|_| SyncError::Unknown("Worker pool closed".to_string()))?
            }
            _ = cancel.changed() => return Err(SyncError::Cancelled),
        };

        let service = request.service();
        info!(instance_id, service = %service, "Sync run started");
        let mut run = SyncRun::start(instance_id, service);

        let result = tokio::select! {
            result = self.attempts(&instance, request, &mut run) => result,
            _ = cancel.changed() => Err(SyncError::Cancelled),
        };

        let run = match result {
            Ok(()) => run.succeed(),
            Err(e) => run.fail(&e),
        };

        match run.outcome {
            Some(RunOutcome::Succeeded) => info!(
                instance_id,
                service = %service,
                attempts = run.attempts,
                inserted = run.inserted(),
                duration_ms = run.duration_ms().unwrap_or_default(),
                "Sync run succeeded"
            ),
            Some(RunOutcome::PartiallyFailed) => warn!(
                instance_id,
                service = %service,
                failed_accounts = run.failures.len(),
                "Sync run partially failed"
            ),
            _ => error!(
                instance_id,
                service = %service,
                attempts = run.attempts,
                error_kind = ?run.error_kind,
                error = run.error_message.as_deref().unwrap_or_default(),
                "Sync run failed"
            ),
        }

        *instance.last_outcome.write().await = run.outcome;
        instance.history.record(run.clone()).await;
        Ok(run)
    }

    async fn attempts(&self, instance: &Instance, request: SyncRequest, run: &mut SyncRun) -> Result<()> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut previous: Option<SyncError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.settings.backoff_delay(attempt - 1);
                debug!(instance_id = %instance.id(), attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep(delay).await;
            }

            run.attempts = attempt;
            run.accounts.clear();
            run.failures.clear();

            let error = match self.execute(instance, request, run).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            let retryable = error.is_retryable();
            let error = match previous.take() {
                Some(earlier) => earlier.narrow(error),
                None => error,
            };
            if !retryable || attempt == max_attempts {
                return Err(error);
            }
            warn!(
                instance_id = %instance.id(),
                attempt,
                error_kind = %error.kind(),
                error = %error,
                "Sync attempt failed, retrying"
            );
            previous = Some(error);
        }

        Err(previous.unwrap_or_else(|| SyncError::Unknown("No attempt made".to_string())))
    }

    async fn execute(&self, instance: &Instance, request: SyncRequest, run: &mut SyncRun) -> Result<()> {
        match request {
            SyncRequest::BudgetSync => {
                bounded(self.settings.request_timeout(), instance.ledger.open_session()).await?;
                self.refresh_sensors(instance).await?;
                Ok(())
            }
            SyncRequest::BankSync => {
                let feed = LinkedBankFeed::new(
                    Arc::clone(&instance.ledger),
                    self.settings.initial_lookback_days,
                    self.settings.cursor_overlap_days,
                );
                let engine = ReconciliationEngine::new().with_cleared(true);
                self.sync_feed(instance, &feed, &engine, run).await?;
                self.refresh_after_sync(instance).await;
                Ok(())
            }
            SyncRequest::AkahuBankSync(options) => {
                let credentials = instance.context.akahu().cloned().ok_or_else(|| {
                    SyncError::ReauthRequired("Akahu credentials are not configured".to_string())
                })?;
                let feed = AkahuFeed::new(credentials, options, &self.settings)?;
                let engine = ReconciliationEngine::new()
                    .with_category_mapping(options.sync_categories)
                    .with_cleared(false);
                self.sync_feed(instance, &feed, &engine, run).await?;
                self.refresh_after_sync(instance).await;
                Ok(())
            }
        }
    }

    async fn sync_feed(
        &self,
        instance: &Instance,
        feed: &dyn BankFeed,
        engine: &ReconciliationEngine,
        run: &mut SyncRun,
    ) -> Result<()> {
        let accounts = feed.discover(instance.ledger.as_ref()).await?;
        let categories = bounded(self.settings.request_timeout(), instance.ledger.list_categories()).await?;
        debug!(
            instance_id = %instance.id(),
            feed = feed.kind().as_str(),
            accounts = accounts.len(),
            "Syncing accounts"
        );

        let mut errors = Vec::new();
        for account in &accounts {
            match self.sync_account(instance, feed, engine, account, &categories).await {
                Ok(report) => run.accounts.push(report),
                Err(e) if aborts_run(&e) => return Err(e),
                Err(e) => {
                    warn!(
                        instance_id = %instance.id(),
                        account = %account.name,
                        error_kind = %e.kind(),
                        error = %e,
                        "Account sync failed"
                    );
                    run.failures.push(AccountFailure {
                        account_id: account.ledger_account_id.clone().unwrap_or_default(),
                        name: account.name.clone(),
                        error_kind: e.kind(),
                        message: e.to_string(),
                    });
                    errors.push(e);
                }
            }
        }

        // Every account failed: the run failed as a whole.
        if run.accounts.is_empty() && !errors.is_empty() {
            return Err(errors
                .into_iter()
                .reduce(SyncError::narrow)
                .unwrap_or_else(|| SyncError::Unknown("Account sync failed".to_string())));
        }
        Ok(())
    }

    async fn sync_account(
        &self,
        instance: &Instance,
        feed: &dyn BankFeed,
        engine: &ReconciliationEngine,
        account: &Account,
        categories: &[LedgerCategory],
    ) -> Result<AccountReport> {
        let timeout = self.settings.request_timeout();
        let ledger_id = account
            .ledger_account_id
            .clone()
            .ok_or_else(|| SyncError::NotFound(format!("ledger account for {}", account.name)))?;
        let cursor = self.cursors.get(instance.id(), &ledger_id).await?;

        let mut report = AccountReport {
            account_id: ledger_id.clone(),
            name: account.name.clone(),
            ..Default::default()
        };

        let mut fetched = Vec::new();
        {
            let mut pages = feed.fetch(account, cursor.as_ref());
            loop {
                let page = match tokio::time::timeout(timeout, pages.next()).await {
                    Ok(Some(page)) => page?,
                    Ok(None) => break,
                    Err(_) => {
                        return Err(SyncError::Connect(format!("No page within {:?}", timeout)))
                    }
                };
                report.pages += 1;
                if feed.stops_at_cursor() && page_is_stale(&page, cursor.as_ref()) {
                    report.stopped_early = true;
                    break;
                }
                fetched.extend(page);
            }
        }
        report.fetched = fetched.len();

        let Some(since) = fetched.iter().map(|tx| tx.date).min() else {
            debug!(account = %account.name, "No transactions fetched");
            return Ok(report);
        };

        let mut recorded = bounded(timeout, instance.ledger.transactions(&ledger_id, since)).await?;
        let mut write_set = engine.reconcile(&fetched, &recorded, categories);

        // A provider id may be recorded under a date before the fetched window.
        let staged = write_set.staged_provider_ids(&ledger_id);
        if !staged.is_empty() {
            let known: HashSet<String> = recorded.iter().map(|tx| tx.id.clone()).collect();
            let earlier: Vec<_> = bounded(timeout, instance.ledger.find_imported(&ledger_id, &staged))
                .await?
                .into_iter()
                .filter(|tx| !known.contains(&tx.id))
                .collect();
            if !earlier.is_empty() {
                debug!(account = %account.name, matched = earlier.len(), "Matched transactions recorded before the window");
                recorded.extend(earlier);
                write_set = engine.reconcile(&fetched, &recorded, categories);
            }
        }

        report.unchanged = write_set.unchanged;
        report.conflicts = write_set.conflicts.clone();

        for conflict in &write_set.conflicts {
            warn!(
                account = %account.name,
                ledger_id = %conflict.ledger_id,
                changes = conflict.changes.len(),
                "Feed disagrees with recorded transaction"
            );
        }

        let inserts: Vec<_> = write_set.inserts_for(&ledger_id).cloned().collect();
        for batch in inserts.chunks(self.settings.batch_size.max(1)) {
            let ack = bounded(timeout, instance.ledger.import_transactions(&ledger_id, batch)).await?;
            report.inserted += ack.added.len();
            if !ack.updated.is_empty() {
                warn!(
                    account = %account.name,
                    updated = ack.updated.len(),
                    "Ledger matched staged transactions to existing ones"
                );
            }
        }

        if let Some(candidate) = write_set.cursor_candidates.get(&ledger_id) {
            let cursor = self
                .cursors
                .advance(instance.id(), &ledger_id, candidate.clone())
                .await?;
            debug!(account = %account.name, cursor_date = %cursor.date, "Cursor advanced");
        }

        info!(
            instance_id = %instance.id(),
            account = %account.name,
            fetched = report.fetched,
            pages = report.pages,
            inserted = report.inserted,
            conflicts = report.conflicts.len(),
            "Account synced"
        );
        Ok(report)
    }

    async fn refresh_after_sync(&self, instance: &Instance) {
        if let Err(e) = self.refresh_sensors(instance).await {
            warn!(instance_id = %instance.id(), error = %e, "Sensor refresh after sync failed");
        }
    }

    async fn refresh_sensors(&self, instance: &Instance) -> Result<SensorSnapshot> {
        let timeout = self.settings.request_timeout();
        let accounts = bounded(timeout, instance.ledger.list_accounts()).await?;
        let budget = bounded(timeout, instance.ledger.budget_snapshot()).await?;
        let snapshot = SensorSnapshot::build(
            &instance.source_id,
            instance.context.prefix(),
            instance.context.unit(),
            &accounts,
            &budget,
        );
        *instance.sensors.write().await = snapshot.clone();
        Ok(snapshot)
    }

    /// Set the budgeted amount of a category (by name) for a month `YYYYMM`.
    pub async fn set_budget_amount(&self, instance_id: &str, month: &str, category: &str, amount: i64) -> Result<()> {
        let instance = self.instance(instance_id)?;
        let _guard = RunGuard::acquire(&instance)?;
        let timeout = self.settings.request_timeout();

        let categories = bounded(timeout, instance.ledger.list_categories()).await?;
        let target = categories
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(category))
            .ok_or_else(|| SyncError::NotFound(format!("category {}", category)))?;
        bounded(timeout, instance.ledger.set_budget_amount(month, &target.id, amount)).await?;
        info!(instance_id, month, category = %target.name, "Budget amount updated");

        self.refresh_sensors(&instance).await?;
        Ok(())
    }

    /// Run `budget_sync` on every instance concurrently.
    pub async fn run_scheduled(&self) -> Vec<(String, Result<SyncRun>)> {
        let ids = self.instance_ids();
        let runs = join_all(ids.iter().map(|id| self.budget_sync(id))).await;
        let results: Vec<_> = ids.into_iter().zip(runs).collect();
        for (id, result) in &results {
            if let Err(SyncError::AlreadyRunning(_)) = result {
                debug!(instance_id = %id, "Skipping scheduled refresh, run in progress");
            }
        }
        results
    }

    /// Spawn the periodic `budget_sync` loop.
    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.settings.scan_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately; setup already refreshed
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!(instances = orchestrator.instances.len(), "Scheduled budget refresh");
                orchestrator.run_scheduled().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::MemoryCursorStore;
    use crate::error::ErrorKind;
    use crate::ledger::MemoryLedger;
    use crate::model::{BankLink, ExternalTransaction, LedgerAccount};
    use crate::reconcile::FieldChange;
    use chrono::{Days, Local, NaiveDate};

    fn settings() -> SyncSettings {
        SyncSettings {
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            ..Default::default()
        }
    }

    fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    fn days_ago(n: u64) -> NaiveDate {
        today().checked_sub_days(Days::new(n)).unwrap()
    }

    fn linked_ledger() -> Arc<MemoryLedger> {
        let ledger = Arc::new(MemoryLedger::new("file-1"));
        let mut account = LedgerAccount::new("a1", "Checking");
        account.bank_link = Some(BankLink {
            sync_source: "goCardless".into(),
            bank_account_id: "bank-1".into(),
        });
        ledger.add_account(account);
        ledger.set_bank_feed(
            "a1",
            vec![
                tx("t1", -1_250, days_ago(2), "Bakery"),
                tx("t2", -4_000, days_ago(1), "Fuel"),
            ],
        );
        ledger
    }

    fn tx(id: &str, amount: i64, date: NaiveDate, desc: &str) -> ExternalTransaction {
        ExternalTransaction {
            account_id: "a1".into(),
            provider_id: Some(id.into()),
            amount,
            date,
            description: desc.into(),
            notes: None,
            category: None,
        }
    }

    async fn orchestrator_with(
        ledger: Arc<MemoryLedger>,
        settings: SyncSettings,
    ) -> (Arc<SyncOrchestrator>, Arc<MemoryCursorStore>, String) {
        let cursors = Arc::new(MemoryCursorStore::new());
        let shared = Arc::clone(&ledger);
        let connector = move |_ctx: Arc<CredentialContext>| -> Arc<dyn LedgerClient> { shared.clone() };
        let orchestrator = Arc::new(SyncOrchestrator::new(
            settings.clone(),
            cursors.clone(),
            Arc::new(connector),
        ));
        let config = InstanceConfig::new("http://ledger.local:5006", "pw", "household");
        let context = Arc::new(CredentialContext::build(&config, &settings).unwrap());
        let id = orchestrator.attach(context).await.unwrap();
        (orchestrator, cursors, id)
    }

    #[tokio::test]
    async fn test_bank_sync_is_idempotent() {
        let ledger = linked_ledger();
        let (orchestrator, cursors, id) = orchestrator_with(ledger.clone(), settings()).await;

        let first = orchestrator.bank_sync(&id).await.unwrap();
        assert_eq!(first.outcome, Some(RunOutcome::Succeeded));
        assert_eq!(first.inserted(), 2);

        let second = orchestrator.bank_sync(&id).await.unwrap();
        assert_eq!(second.outcome, Some(RunOutcome::Succeeded));
        assert_eq!(second.inserted(), 0);
        assert_eq!(ledger.transactions_for("a1").len(), 2);

        let cursor = cursors.get(&id, "a1").await.unwrap().unwrap();
        assert_eq!(cursor.date, days_ago(1));
        assert_eq!(
            orchestrator.status(&id).await.unwrap().state,
            InstanceState::Succeeded
        );
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_cursor() {
        let ledger = linked_ledger();
        let mut settings = settings();
        settings.max_attempts = 1;
        let (orchestrator, cursors, id) = orchestrator_with(ledger.clone(), settings).await;
        ledger.fail_next_commits(1, SyncError::Connect("connection reset".into()));

        let run = orchestrator.bank_sync(&id).await.unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Failed));
        assert_eq!(run.error_kind, Some(ErrorKind::FailedToConnect));
        assert!(cursors.get(&id, "a1").await.unwrap().is_none());
        assert!(ledger.transactions_for("a1").is_empty());

        let retry = orchestrator.bank_sync(&id).await.unwrap();
        assert_eq!(retry.outcome, Some(RunOutcome::Succeeded));
        assert_eq!(ledger.transactions_for("a1").len(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let ledger = linked_ledger();
        let (orchestrator, _, id) = orchestrator_with(ledger.clone(), settings()).await;
        ledger.fail_next_commits(2, SyncError::Unknown("server busy".into()));

        let run = orchestrator.bank_sync(&id).await.unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
        assert_eq!(run.attempts, 3);
        assert_eq!(ledger.transactions_for("a1").len(), 2);
    }

    #[tokio::test]
    async fn test_file_error_is_not_retried() {
        let ledger = linked_ledger();
        let (orchestrator, _, id) = orchestrator_with(ledger.clone(), settings()).await;
        ledger.fail_next_reads(5, SyncError::File("file removed".into()));

        let run = orchestrator.bank_sync(&id).await.unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Failed));
        assert_eq!(run.attempts, 1);
        assert_eq!(run.error_kind, Some(ErrorKind::FailedFile));
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_rejected() {
        let ledger = Arc::new(
            MemoryLedger::new("file-1").with_import_delay(Duration::from_millis(300)),
        );
        let mut account = LedgerAccount::new("a1", "Checking");
        account.bank_link = Some(BankLink {
            sync_source: "simpleFin".into(),
            bank_account_id: "bank-1".into(),
        });
        ledger.add_account(account);
        ledger.set_bank_feed("a1", vec![tx("t1", -100, days_ago(1), "Coffee")]);
        let (orchestrator, _, id) = orchestrator_with(ledger.clone(), settings()).await;

        let background = {
            let orchestrator = Arc::clone(&orchestrator);
            let id = id.clone();
            tokio::spawn(async move { orchestrator.bank_sync(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(orchestrator.status(&id).await.unwrap().state, InstanceState::Running);
        let rejected = orchestrator.budget_sync(&id).await;
        assert!(matches!(rejected, Err(SyncError::AlreadyRunning(_))));

        let finished = background.await.unwrap().unwrap();
        assert_eq!(finished.outcome, Some(RunOutcome::Succeeded));
        assert!(orchestrator.budget_sync(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_settles_run_as_cancelled() {
        let ledger = Arc::new(
            MemoryLedger::new("file-1").with_import_delay(Duration::from_millis(500)),
        );
        let mut account = LedgerAccount::new("a1", "Checking");
        account.bank_link = Some(BankLink {
            sync_source: "goCardless".into(),
            bank_account_id: "bank-1".into(),
        });
        ledger.add_account(account);
        ledger.set_bank_feed("a1", vec![tx("t1", -100, days_ago(1), "Coffee")]);
        let (orchestrator, cursors, id) = orchestrator_with(ledger.clone(), settings()).await;

        let background = {
            let orchestrator = Arc::clone(&orchestrator);
            let id = id.clone();
            tokio::spawn(async move { orchestrator.bank_sync(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.cancel(&id).unwrap();

        let run = background.await.unwrap().unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Cancelled));
        assert!(cursors.get(&id, "a1").await.unwrap().is_none());
        assert_eq!(orchestrator.status(&id).await.unwrap().state, InstanceState::Idle);
    }

    #[tokio::test]
    async fn test_already_configured_before_network() {
        let ledger = linked_ledger();
        let (orchestrator, _, _) = orchestrator_with(ledger.clone(), settings()).await;

        // Same endpoint and file in another case; the endpoint is unreachable.
        let duplicate = InstanceConfig::new("http://LEDGER.local:5006", "pw", "Household");
        let err = orchestrator.add_instance(&duplicate).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyConfigured);
        assert_eq!(ledger.session_count(), 1);
    }

    #[tokio::test]
    async fn test_budget_sync_refreshes_sensors() {
        let ledger = linked_ledger();
        let (orchestrator, _, id) = orchestrator_with(ledger.clone(), settings()).await;
        ledger.add_budget("c1", "Food", &[("200001", Some(10_000))], 500);

        let run = orchestrator.budget_sync(&id).await.unwrap();
        assert!(run.is_success());

        let sensors = orchestrator.sensors(&id).await.unwrap();
        assert_eq!(sensors.source_id, "file-1");
        let food = sensors.budget("Food").unwrap();
        assert_eq!(food.state_minor(today()), 10_500);
        assert!(sensors.account("Checking").is_some());
    }

    #[tokio::test]
    async fn test_set_budget_amount_by_category_name() {
        let ledger = linked_ledger();
        ledger.add_category("c1", "Food", "Living");
        ledger.add_budget("c1", "Food", &[], 0);
        let (orchestrator, _, id) = orchestrator_with(ledger.clone(), settings()).await;

        orchestrator.set_budget_amount(&id, "200001", "food", 2_500).await.unwrap();
        let sensors = orchestrator.sensors(&id).await.unwrap();
        assert_eq!(sensors.budget("Food").unwrap().amounts[0].amount, Some(2_500));

        let missing = orchestrator.set_budget_amount(&id, "200001", "Travel", 1).await;
        assert!(matches!(missing, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_instance_clears_cursors() {
        let ledger = linked_ledger();
        let (orchestrator, cursors, id) = orchestrator_with(ledger.clone(), settings()).await;
        orchestrator.bank_sync(&id).await.unwrap();
        assert!(!cursors.all(&id).await.unwrap().is_empty());

        orchestrator.remove_instance(&id).await.unwrap();
        assert!(cursors.all(&id).await.unwrap().is_empty());
        assert!(matches!(orchestrator.bank_sync(&id).await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_instance_waits_for_active_run() {
        let ledger = Arc::new(
            MemoryLedger::new("file-1").with_import_delay(Duration::from_millis(300)),
        );
        let mut account = LedgerAccount::new("a1", "Checking");
        account.bank_link = Some(BankLink {
            sync_source: "simpleFin".into(),
            bank_account_id: "bank-1".into(),
        });
        ledger.add_account(account);
        ledger.set_bank_feed("a1", vec![tx("t1", -100, days_ago(3), "Coffee")]);
        let (orchestrator, cursors, id) = orchestrator_with(ledger.clone(), settings()).await;
        orchestrator.bank_sync(&id).await.unwrap();
        assert!(!cursors.all(&id).await.unwrap().is_empty());

        ledger.set_bank_feed(
            "a1",
            vec![
                tx("t1", -100, days_ago(3), "Coffee"),
                tx("t2", -900, days_ago(1), "Books"),
            ],
        );
        let background = {
            let orchestrator = Arc::clone(&orchestrator);
            let id = id.clone();
            tokio::spawn(async move { orchestrator.bank_sync(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        orchestrator.remove_instance(&id).await.unwrap();
        assert!(cursors.all(&id).await.unwrap().is_empty());

        let settled = background.await.unwrap().unwrap();
        assert_eq!(settled.outcome, Some(RunOutcome::Cancelled));
        assert!(cursors.all(&id).await.unwrap().is_empty());
        assert!(orchestrator.instance_ids().is_empty());
    }

    #[tokio::test]
    async fn test_moved_transaction_is_a_conflict() {
        let ledger = linked_ledger();
        ledger.set_bank_feed(
            "a1",
            vec![
                tx("t1", -1_250, days_ago(10), "Bakery"),
                tx("t2", -4_000, days_ago(1), "Fuel"),
            ],
        );
        let (orchestrator, _, id) = orchestrator_with(ledger.clone(), settings()).await;
        assert_eq!(orchestrator.bank_sync(&id).await.unwrap().inserted(), 2);

        // The bank re-dates t1 into the overlap window and changes its amount
        ledger.set_bank_feed(
            "a1",
            vec![
                tx("t1", -1_500, days_ago(2), "Bakery"),
                tx("t2", -4_000, days_ago(1), "Fuel"),
            ],
        );
        let run = orchestrator.bank_sync(&id).await.unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
        assert_eq!(run.inserted(), 0);

        let report = &run.accounts[0];
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(
            report.conflicts[0].changes,
            vec![
                FieldChange::Amount { ledger: -1_250, external: -1_500 },
                FieldChange::Date { ledger: days_ago(10), external: days_ago(2) },
            ]
        );

        let recorded = ledger.transactions_for("a1");
        assert_eq!(recorded.len(), 2);
        let t1 = recorded
            .iter()
            .find(|t| t.imported_id.as_deref() == Some("t1"))
            .unwrap();
        assert_eq!((t1.amount, t1.date), (-1_250, days_ago(10)));
    }

    #[tokio::test]
    async fn test_akahu_sync_without_credentials_fails() {
        let ledger = linked_ledger();
        let (orchestrator, _, id) = orchestrator_with(ledger.clone(), settings()).await;

        let run = orchestrator
            .akahu_bank_sync(&id, AkahuOptions::default())
            .await
            .unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Failed));
        assert_eq!(run.attempts, 1);
    }
}
