//! Linked-bank feed backed by the ledger service's own bank sync.

use async_trait::async_trait;
use chrono::{Days, Local, NaiveDate};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::debug;

use super::traits::{BankFeed, FeedKind, PageStream};
use crate::error::{Result, SyncError};
use crate::ledger::LedgerClient;
use crate::model::{Account, LedgerAccount, SyncCursor};

/// Feed over every open ledger account that has a bank link.
pub struct LinkedBankFeed {
    ledger: Arc<dyn LedgerClient>,
    lookback_days: u32,
    overlap_days: u32,
}

impl LinkedBankFeed {
    pub fn new(ledger: Arc<dyn LedgerClient>, lookback_days: u32, overlap_days: u32) -> Self {
        Self {
            ledger,
            lookback_days,
            overlap_days,
        }
    }

    /// First date to request: the cursor date minus the overlap, or the
    /// initial lookback when there is no cursor.
    pub fn since_date(&self, cursor: Option<&SyncCursor>, today: NaiveDate) -> NaiveDate {
        match cursor {
            Some(cursor) => cursor
                .date
                .checked_sub_days(Days::new(u64::from(self.overlap_days)))
                .unwrap_or(cursor.date),
            None => today
                .checked_sub_days(Days::new(u64::from(self.lookback_days)))
                .unwrap_or(today),
        }
    }
}

#[async_trait]
impl BankFeed for LinkedBankFeed {
    fn kind(&self) -> FeedKind {
        FeedKind::LinkedBank
    }

    async fn discover(&self, ledger: &dyn LedgerClient) -> Result<Vec<Account>> {
        let accounts = ledger.list_accounts().await?;
        Ok(accounts
            .into_iter()
            .filter(|a| !a.closed && a.bank_link.is_some())
            .map(|a| Account {
                external_id: a
                    .bank_link
                    .as_ref()
                    .map(|l| l.bank_account_id.clone())
                    .unwrap_or_default(),
                name: a.name,
                currency: None,
                ledger_account_id: Some(a.id),
                bank_link: a.bank_link,
            })
            .collect())
    }

    fn fetch<'a>(&'a self, account: &'a Account, since: Option<&'a SyncCursor>) -> PageStream<'a> {
        stream::once(async move {
            let ledger_id = account.ledger_account_id.clone().ok_or_else(|| {
                SyncError::NotFound(format!("ledger account for {}", account.name))
            })?;
            let since = self.since_date(since, Local::now().date_naive());
            debug!(account = %account.name, %since, "Fetching linked-bank transactions");

            let mut target = LedgerAccount::new(ledger_id, account.name.clone());
            target.bank_link = account.bank_link.clone();
            self.ledger.bank_transactions(&target, since).await
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::model::{BankLink, ExternalTransaction};
    use futures::TryStreamExt;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn linked(id: &str, name: &str) -> LedgerAccount {
        let mut account = LedgerAccount::new(id, name);
        account.bank_link = Some(BankLink {
            sync_source: "goCardless".to_string(),
            bank_account_id: format!("bank-{}", id),
        });
        account
    }

    #[test]
    fn test_since_date() {
        let feed = LinkedBankFeed::new(Arc::new(MemoryLedger::default()), 90, 3);
        let today = date(2024, 4, 1);
        assert_eq!(feed.since_date(None, today), date(2024, 1, 2));

        let cursor = SyncCursor {
            date: date(2024, 3, 20),
            provider_id: None,
        };
        assert_eq!(feed.since_date(Some(&cursor), today), date(2024, 3, 17));
    }

    #[tokio::test]
    async fn test_discover_only_linked_open_accounts() {
        let ledger = Arc::new(MemoryLedger::default());
        ledger.add_account(linked("a1", "Checking"));
        ledger.add_account(LedgerAccount::new("a2", "Cash"));
        let mut closed = linked("a3", "Old card");
        closed.closed = true;
        ledger.add_account(closed);

        let feed = LinkedBankFeed::new(ledger.clone(), 90, 3);
        let accounts = feed.discover(ledger.as_ref()).await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].external_id, "bank-a1");
        assert_eq!(accounts[0].ledger_account_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_fetch_yields_one_page() {
        let ledger = Arc::new(MemoryLedger::default());
        ledger.add_account(linked("a1", "Checking"));
        let today = Local::now().date_naive();
        ledger.set_bank_feed(
            "a1",
            vec![ExternalTransaction {
                account_id: "a1".into(),
                provider_id: Some("t1".into()),
                amount: -250,
                date: today,
                description: "Coffee".into(),
                notes: None,
                category: None,
            }],
        );

        let feed = LinkedBankFeed::new(ledger.clone(), 90, 3);
        let accounts = feed.discover(ledger.as_ref()).await.unwrap();
        let pages: Vec<_> = feed.fetch(&accounts[0], None).try_collect().await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0][0].provider_id.as_deref(), Some("t1"));
    }
}
