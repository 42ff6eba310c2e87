//! Ledger Sync - bank feed synchronization for self-hosted budget ledgers
//!
//! Keeps a budget file on a ledger service in step with the user's banks:
//! - Linked-bank sync through the ledger service's own aggregation
//! - Direct Akahu sync with a day window or full history
//! - Budget refresh feeding account and category sensors
//!
//! Repeated runs never duplicate transactions, a failed commit never moves a
//! cursor, and transient network failures are retried with backoff.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           SyncOrchestrator              │
//! │  (per-instance runs, retry, schedule)   │
//! └───────┬─────────────┬───────────────┬───┘
//!         │             │               │
//!         ▼             ▼               ▼
//! ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//! │  BankFeed   │ │ Reconcile   │ │ CursorStore │
//! │ (linked /   │ │ (dedup,     │ │ (memory /   │
//! │  Akahu)     │ │  write-set) │ │  file)      │
//! └──────┬──────┘ └─────────────┘ └─────────────┘
//!        │
//!        ▼
//! ┌─────────────┐      ┌───────────────────┐
//! │LedgerClient │◄─────│ CredentialContext │
//! │ (HTTP/mem)  │      │ (TLS, secrets)    │
//! └─────────────┘      └───────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod cursor;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod reconcile;
pub mod run;
pub mod sensor;

// Re-export main types for convenience
pub use config::{InstanceConfig, LedgerSyncConfig, Secret, SyncDays, SyncSettings};
pub use context::{CredentialContext, TlsMode};
pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use error::{ErrorKind, Result, SyncError};
pub use feed::{AkahuFeed, AkahuOptions, BankFeed, FeedKind, LinkedBankFeed};
pub use ledger::{HttpConnector, HttpLedgerClient, LedgerClient, LedgerConnector, MemoryLedger};
pub use model::*;
pub use orchestrator::{InstanceState, InstanceStatus, SyncOrchestrator, SyncRequest};
pub use reconcile::{DedupKey, ReconciliationEngine, WriteSet};
pub use run::{RunOutcome, ServiceKind, SyncRun};
pub use sensor::{AccountSensor, BudgetSensor, SensorSnapshot};
