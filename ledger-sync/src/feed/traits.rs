//! Core trait for bank feeds.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ledger::LedgerClient;
use crate::model::{Account, ExternalTransaction, SyncCursor};

/// A lazily fetched page of transactions.
pub type PageStream<'a> = BoxStream<'a, Result<Vec<ExternalTransaction>>>;

/// Feed variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// The ledger service's own bank aggregation
    LinkedBank,
    /// Direct Akahu API
    Akahu,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::LinkedBank => "linked_bank",
            FeedKind::Akahu => "akahu",
        }
    }
}

/// Source of external transactions.
#[async_trait]
pub trait BankFeed: Send + Sync {
    fn kind(&self) -> FeedKind;

    /// Accounts this feed reports, bound to ledger accounts.
    async fn discover(&self, ledger: &dyn LedgerClient) -> Result<Vec<Account>>;

    /// Pages of transactions of `account`, newest data first where the
    /// provider orders it so. `since` is the account's cursor, if any.
    fn fetch<'a>(&'a self, account: &'a Account, since: Option<&'a SyncCursor>) -> PageStream<'a>;

    /// Whether consumption may stop at the first page entirely older than
    /// the cursor.
    fn stops_at_cursor(&self) -> bool {
        false
    }
}
