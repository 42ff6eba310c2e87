//! Akahu feed.
//!
//! Lists the user's Akahu accounts, binds each to a ledger account of the
//! same name (created when missing) and pages through its transactions by
//! following `cursor.next`.

use async_trait::async_trait;
use chrono::{DateTime, Local, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::traits::{BankFeed, FeedKind, PageStream};
use crate::config::{SyncDays, SyncSettings};
use crate::context::AkahuCredentials;
use crate::error::{Result, SyncError};
use crate::ledger::{get_or_create_account, LedgerClient};
use crate::model::{float_to_minor_units, Account, ExternalTransaction, SyncCursor};

/// Options of an Akahu sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AkahuOptions {
    pub sync_days: SyncDays,
    /// Map Akahu category groups onto ledger categories
    pub sync_categories: bool,
    /// Stop paging at the first page entirely older than the cursor
    pub incremental: bool,
}

/// Feed reading the Akahu API directly.
pub struct AkahuFeed {
    client: Client,
    base_url: String,
    credentials: AkahuCredentials,
    options: AkahuOptions,
    /// Fixed at construction so every account shares one window
    window_start: Option<DateTime<Utc>>,
}

impl AkahuFeed {
    pub fn new(credentials: AkahuCredentials, options: AkahuOptions, settings: &SyncSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.request_timeout())
            .user_agent(concat!("ledger-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Unknown(format!("Failed to build Akahu client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.akahu_base_url.trim_end_matches('/').to_string(),
            credentials,
            options,
            window_start: options.sync_days.start(Utc::now()),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let response = self
            .client
            .get(&url)
            .header("accept", "application/json")
            .header("authorization", self.credentials.auth_token.expose())
            .header("X-Akahu-Id", &self.credentials.app_id)
            .query(query)
            .send()
            .await
            .map_err(|e| SyncError::from_reqwest(&e))?;

        let status = response.status();
        debug!(path, status = %status, "Akahu response");
        match status {
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| SyncError::Unknown(format!("Malformed Akahu response: {}", e))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::ReauthRequired(
                "Akahu rejected the app or user token".to_string(),
            )),
            StatusCode::NOT_FOUND => Err(SyncError::NotFound(format!("Akahu {}", path))),
            StatusCode::TOO_MANY_REQUESTS => {
                Err(SyncError::Connect("Akahu rate limit reached".to_string()))
            }
            s if s.is_server_error() => Err(SyncError::Connect(format!("Akahu returned {}", s))),
            s => Err(SyncError::Unknown(format!("Akahu returned {}", s))),
        }
    }

    fn page_query(&self, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(start) = self.window_start {
            query.push(("start", start.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        query
    }
}

enum PageState {
    First,
    Next(String),
    Done,
}

#[async_trait]
impl BankFeed for AkahuFeed {
    fn kind(&self) -> FeedKind {
        FeedKind::Akahu
    }

    async fn discover(&self, ledger: &dyn LedgerClient) -> Result<Vec<Account>> {
        let page: AkahuPage<AkahuAccountWire> = self.get("accounts", &[]).await?;

        let mut accounts = Vec::with_capacity(page.items.len());
        for item in page.items {
            let ledger_account = get_or_create_account(ledger, &item.name).await?;
            accounts.push(Account {
                external_id: item.id,
                name: item.name,
                currency: item.balance.and_then(|b| b.currency),
                ledger_account_id: Some(ledger_account.id),
                bank_link: None,
            });
        }
        info!(accounts = accounts.len(), sync_days = %self.options.sync_days, "Discovered Akahu accounts");
        Ok(accounts)
    }

    fn fetch<'a>(&'a self, account: &'a Account, _since: Option<&'a SyncCursor>) -> PageStream<'a> {
        stream::try_unfold(PageState::First, move |state| async move {
            let cursor = match state {
                PageState::Done => return Ok(None),
                PageState::First => None,
                PageState::Next(cursor) => Some(cursor),
            };
            let ledger_id = account.ledger_account_id.as_deref().ok_or_else(|| {
                SyncError::NotFound(format!("ledger account for {}", account.name))
            })?;

            let path = format!("accounts/{}/transactions", account.external_id);
            let page: AkahuPage<AkahuTransactionWire> =
                self.get(&path, &self.page_query(cursor.as_deref())).await?;

            let next = match page.cursor.and_then(|c| c.next) {
                Some(next) if !next.is_empty() && !next.eq_ignore_ascii_case("none") => {
                    PageState::Next(next)
                }
                _ => PageState::Done,
            };

            let mut transactions = Vec::with_capacity(page.items.len());
            for item in page.items {
                match item.into_model(ledger_id, self.options.sync_categories) {
                    Some(tx) => transactions.push(tx),
                    None => warn!(account = %account.name, "Skipping Akahu transaction with unreadable date"),
                }
            }
            Ok(Some((transactions, next)))
        })
        .boxed()
    }

    fn stops_at_cursor(&self) -> bool {
        self.options.incremental
    }
}

/// Description with a trailing run of three or more digits removed.
pub fn clean_description(raw: &str) -> String {
    let trimmed = raw.trim_end();
    let digits = trimmed
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits >= 3 {
        trimmed[..trimmed.len() - digits].trim().to_string()
    } else {
        raw.trim().to_string()
    }
}

/// Metadata value kept for notes; links and provider boilerplate are dropped.
fn note_value(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let lower = text.to_lowercase();
    if lower.contains("cdn.") || lower.contains("akahu") {
        String::new()
    } else {
        text
    }
}

fn summarize(fields: Option<&Map<String, Value>>) -> Option<String> {
    let fields = fields?;
    let values: Vec<String> = fields
        .iter()
        .filter(|(key, _)| key.as_str() != "_id")
        .map(|(_, value)| note_value(value))
        .filter(|value| !value.is_empty())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join("  "))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct AkahuPage<T> {
    #[serde(default)]
    items: Vec<T>,
    #[serde(default)]
    cursor: Option<AkahuCursor>,
}

#[derive(Debug, Deserialize)]
struct AkahuCursor {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AkahuAccountWire {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    #[serde(default)]
    balance: Option<AkahuBalanceWire>,
}

#[derive(Debug, Deserialize)]
struct AkahuBalanceWire {
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AkahuTransactionWire {
    #[serde(rename = "_id")]
    id: String,
    date: String,
    #[serde(default)]
    description: String,
    amount: f64,
    #[serde(default)]
    merchant: Option<Map<String, Value>>,
    #[serde(default)]
    meta: Option<Map<String, Value>>,
    #[serde(default)]
    category: Option<AkahuCategoryWire>,
}

#[derive(Debug, Deserialize)]
struct AkahuCategoryWire {
    name: String,
    #[serde(default)]
    groups: Map<String, Value>,
}

impl AkahuTransactionWire {
    fn into_model(self, account_id: &str, sync_categories: bool) -> Option<ExternalTransaction> {
        let date = DateTime::parse_from_rfc3339(&self.date)
            .ok()?
            .with_timezone(&Local)
            .date_naive();

        let (category_name, category_group) = match (&self.category, sync_categories) {
            (Some(category), true) => (
                Some(category.name.clone()),
                category
                    .groups
                    .values()
                    .find_map(|g| g.get("name").and_then(Value::as_str))
                    .map(str::to_string),
            ),
            _ => (None, None),
        };

        let mut notes = String::new();
        for part in [summarize(self.meta.as_ref()), summarize(self.merchant.as_ref()), category_name]
            .into_iter()
            .flatten()
        {
            notes.push_str(&part);
            notes.push(' ');
        }
        notes.push_str(&self.description);

        Some(ExternalTransaction {
            account_id: account_id.to_string(),
            provider_id: Some(self.id),
            amount: float_to_minor_units(self.amount),
            date,
            description: clean_description(&self.description),
            notes: Some(notes),
            category: category_group,
        })
    }
}
