//! HTTP ledger client.
//!
//! Talks to the ledger service over JSON:
//!
//! - `POST /account/login` exchanges the server password for a session token
//! - `/v1/budgets/{file}/...` exposes accounts, categories, transactions and
//!   monthly budgets of one file; the token travels in `x-actual-token`, the
//!   file passphrase in `budget-encryption-password`
//! - `POST /{source}/transactions` is the server's own bank-sync capability
//!   (`gocardless`, `simplefin`)
//!
//! Sessions expire after the configured timeout and are re-established on
//! the next call.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::traits::{LedgerClient, LedgerConnector, SessionInfo};
use crate::config::Secret;
use crate::context::CredentialContext;
use crate::error::{Result, SyncError};
use crate::model::{
    parse_minor_units, BankLink, BudgetAmount, BudgetSnapshot, CategoryBudget, CommitAck,
    ExternalTransaction, LedgerAccount, LedgerCategory, LedgerTransaction, NewTransaction,
};

const TOKEN_HEADER: &str = "x-actual-token";
const PASSPHRASE_HEADER: &str = "budget-encryption-password";

struct Session {
    token: Secret,
    started_at: Instant,
}

/// Ledger client speaking the service's HTTP API.
pub struct HttpLedgerClient {
    context: Arc<CredentialContext>,
    session_timeout: Duration,
    session: RwLock<Option<Session>>,
    /// Serializes logins
    connecting: Mutex<()>,
}

impl HttpLedgerClient {
    pub fn new(context: Arc<CredentialContext>, session_timeout: Duration) -> Self {
        Self {
            context,
            session_timeout,
            session: RwLock::new(None),
            connecting: Mutex::new(()),
        }
    }

    fn budget_path(&self, path: &str) -> String {
        format!("v1/budgets/{}/{}", self.context.file(), path.trim_start_matches('/'))
    }

    /// Current token, logging in when there is none or it has expired.
    async fn token(&self) -> Result<Secret> {
        {
            let session = self.session.read().await;
            if let Some(s) = session.as_ref() {
                if s.started_at.elapsed() < self.session_timeout {
                    return Ok(s.token.clone());
                }
            }
        }

        let _lock = self.connecting.lock().await;

        // Double-check after acquiring lock
        {
            let session = self.session.read().await;
            if let Some(s) = session.as_ref() {
                if s.started_at.elapsed() < self.session_timeout {
                    return Ok(s.token.clone());
                }
            }
        }

        let token = self.login().await?;
        let mut session = self.session.write().await;
        *session = Some(Session {
            token: token.clone(),
            started_at: Instant::now(),
        });
        Ok(token)
    }

    async fn login(&self) -> Result<Secret> {
        debug!(instance_id = %self.context.instance_id(), "Logging in to ledger service");

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct LoginRequest<'a> {
            login_method: &'a str,
            password: &'a str,
        }

        #[derive(Deserialize)]
        struct LoginData {
            token: Option<Secret>,
        }

        let response = self
            .context
            .client()
            .post(self.context.url("account/login"))
            .json(&LoginRequest {
                login_method: "password",
                password: self.context.password().expose(),
            })
            .send()
            .await
            .map_err(|e| SyncError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "", "login", false));
        }

        let body: Envelope<LoginData> = response
            .json()
            .await
            .map_err(|e| SyncError::Unknown(format!("Malformed login response: {}", e)))?;

        match body.data.token {
            Some(token) if !token.is_empty() => {
                info!(instance_id = %self.context.instance_id(), "Ledger session established");
                Ok(token)
            }
            _ => Err(SyncError::Unknown(
                "Authentication rejected by ledger service".to_string(),
            )),
        }
    }

    async fn invalidate(&self) {
        let mut session = self.session.write().await;
        *session = None;
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.token().await?;
        let mut builder = self
            .context
            .client()
            .request(method, self.context.url(path))
            .header(TOKEN_HEADER, token.expose());
        let passphrase = self.context.encrypt_password();
        if !passphrase.is_empty() {
            builder = builder.header(PASSPHRASE_HEADER, passphrase.expose());
        }
        Ok(builder)
    }

    /// Send a request and decode the `data` field of the envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        what: &str,
        not_found_is_file: bool,
    ) -> Result<T> {
        let response = builder.send().await.map_err(|e| SyncError::from_reqwest(&e))?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                self.invalidate().await;
            }
            warn!(status = %status, what, "Ledger service request failed");
            return Err(classify_status(status, &body, what, not_found_is_file));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| SyncError::Unknown(format!("Malformed response to {}: {}", what, e)))?;
        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let builder = self.request(Method::GET, &self.budget_path(path)).await?;
        self.call(builder, what, true).await
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn open_session(&self) -> Result<SessionInfo> {
        // Listing accounts proves the file exists and decrypts.
        let _: Vec<AccountWire> = self.get("accounts", "open budget file").await?;
        Ok(SessionInfo {
            file_id: self.context.file().to_string(),
        })
    }

    async fn list_accounts(&self) -> Result<Vec<LedgerAccount>> {
        let accounts: Vec<AccountWire> = self.get("accounts", "list accounts").await?;
        Ok(accounts.into_iter().map(AccountWire::into_model).collect())
    }

    async fn list_categories(&self) -> Result<Vec<LedgerCategory>> {
        let groups: Vec<CategoryGroupWire> = self.get("categorygroups", "list categories").await?;
        Ok(groups
            .into_iter()
            .flat_map(|group| {
                let group_name = group.name;
                group.categories.into_iter().map(move |c| LedgerCategory {
                    id: c.id,
                    name: c.name,
                    group_name: Some(group_name.clone()),
                })
            })
            .collect())
    }

    async fn transactions(&self, account_id: &str, since: NaiveDate) -> Result<Vec<LedgerTransaction>> {
        let builder = self
            .request(
                Method::GET,
                &self.budget_path(&format!("accounts/{}/transactions", account_id)),
            )
            .await?
            .query(&[("since_date", since.format("%Y-%m-%d").to_string())]);
        let rows: Vec<TransactionWire> = self.call(builder, "list transactions", false).await?;
        Ok(rows.into_iter().map(TransactionWire::into_model).collect())
    }

    async fn budget_snapshot(&self) -> Result<BudgetSnapshot> {
        let months: Vec<String> = self.get("months", "list budget months").await?;
        let current = chrono::Utc::now().format("%Y%m").to_string();

        let mut categories: Vec<CategoryBudget> = Vec::new();
        for month in &months {
            let detail: MonthWire = self
                .get(&format!("months/{}", month), "read budget month")
                .await?;
            let compact = month.replace('-', "");
            for group in detail.category_groups {
                for category in group.categories {
                    let amount = (category.budgeted != 0).then_some(category.budgeted);
                    let index = match categories.iter().position(|c| c.category_id == category.id) {
                        Some(index) => index,
                        None => {
                            categories.push(CategoryBudget {
                                category_id: category.id.clone(),
                                name: category.name.clone(),
                                amounts: Vec::new(),
                                balance: 0,
                            });
                            categories.len() - 1
                        }
                    };
                    let entry = &mut categories[index];
                    entry.amounts.push(BudgetAmount {
                        month: compact.clone(),
                        amount,
                    });
                    if compact <= current {
                        entry.balance = category.balance;
                    }
                }
            }
        }

        for category in &mut categories {
            category.amounts.sort_by(|a, b| a.month.cmp(&b.month));
        }

        Ok(BudgetSnapshot { categories })
    }

    async fn import_transactions(&self, account_id: &str, batch: &[NewTransaction]) -> Result<CommitAck> {
        if batch.is_empty() {
            return Ok(CommitAck::default());
        }

        let body = ImportRequest {
            transactions: batch.iter().map(ImportTransactionWire::from).collect(),
        };
        let builder = self
            .request(
                Method::POST,
                &self.budget_path(&format!("accounts/{}/transactions/import", account_id)),
            )
            .await?
            .json(&body);
        let ack: ImportResultWire = self.call(builder, "import transactions", false).await?;

        debug!(
            account_id,
            added = ack.added.len(),
            updated = ack.updated.len(),
            "Import batch acknowledged"
        );
        Ok(CommitAck {
            added: ack.added,
            updated: ack.updated,
        })
    }

    async fn set_budget_amount(&self, month: &str, category_id: &str, amount: i64) -> Result<()> {
        let month = to_wire_month(month)?;
        let builder = self
            .request(
                Method::PATCH,
                &self.budget_path(&format!("months/{}/categories/{}", month, category_id)),
            )
            .await?
            .json(&serde_json::json!({ "category": { "budgeted": amount } }));
        let _: serde_json::Value = self.call(builder, "update budget", false).await?;
        Ok(())
    }

    async fn create_account(&self, name: &str) -> Result<LedgerAccount> {
        let builder = self
            .request(Method::POST, &self.budget_path("accounts"))
            .await?
            .json(&serde_json::json!({ "account": { "name": name, "offbudget": false } }));
        let id: String = self.call(builder, "create account", false).await?;
        Ok(LedgerAccount::new(id, name))
    }

    async fn bank_transactions(
        &self,
        account: &LedgerAccount,
        since: NaiveDate,
    ) -> Result<Vec<ExternalTransaction>> {
        let link = account.bank_link.as_ref().ok_or_else(|| {
            SyncError::Unknown(format!("Account {} is not linked to a bank", account.name))
        })?;

        let builder = self
            .request(Method::POST, &format!("{}/transactions", link.sync_source.to_lowercase()))
            .await?
            .json(&serde_json::json!({
                "accountId": link.bank_account_id,
                "startDate": since.format("%Y-%m-%d").to_string(),
            }));
        let data: BankSyncWire = self.call(builder, "bank sync", false).await?;

        Ok(data
            .transactions
            .all
            .into_iter()
            .filter_map(|row| row.into_model(&account.id))
            .collect())
    }
}

/// Connector producing [`HttpLedgerClient`]s.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    session_timeout: Duration,
}

impl HttpConnector {
    pub fn new(session_timeout: Duration) -> Self {
        Self { session_timeout }
    }
}

impl LedgerConnector for HttpConnector {
    fn connect(&self, context: Arc<CredentialContext>) -> Arc<dyn LedgerClient> {
        Arc::new(HttpLedgerClient::new(context, self.session_timeout))
    }
}

fn classify_status(status: StatusCode, body: &str, what: &str, not_found_is_file: bool) -> SyncError {
    let body = body.to_lowercase();
    match status {
        StatusCode::NOT_FOUND if not_found_is_file => {
            SyncError::File(format!("Budget file not found ({})", what))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SyncError::Unknown("Authentication rejected by ledger service".to_string())
        }
        StatusCode::BAD_REQUEST if body.contains("password") => {
            SyncError::Unknown("Authentication rejected by ledger service".to_string())
        }
        _ if body.contains("decrypt") || body.contains("encrypt") => {
            SyncError::Unknown("Budget file could not be decrypted".to_string())
        }
        StatusCode::NOT_FOUND => SyncError::Unknown(format!("Not found during {}", what)),
        _ => SyncError::Unknown(format!("HTTP {} during {}", status, what)),
    }
}

/// `YYYYMM` (or `YYYY-MM`) to the `YYYY-MM` form of the API.
fn to_wire_month(month: &str) -> Result<String> {
    let digits: String = month.chars().filter(|c| *c != '-').collect();
    let well_formed = digits.len() == 6
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (month.len() == 6 || (month.len() == 7 && month.find('-') == Some(4)));
    if !well_formed {
        return Err(SyncError::Unknown(format!("Invalid budget month: {:?}", month)));
    }
    Ok(format!("{}-{}", &digits[..4], &digits[4..]))
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct AccountWire {
    id: String,
    name: String,
    #[serde(default)]
    offbudget: bool,
    #[serde(default)]
    closed: bool,
    #[serde(default)]
    balance: Option<i64>,
    #[serde(default)]
    account_sync_source: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
}

impl AccountWire {
    fn into_model(self) -> LedgerAccount {
        let bank_link = match (self.account_sync_source, self.account_id) {
            (Some(sync_source), Some(bank_account_id)) => Some(BankLink {
                sync_source,
                bank_account_id,
            }),
            _ => None,
        };
        LedgerAccount {
            id: self.id,
            name: self.name,
            balance: self.balance.unwrap_or_default(),
            closed: self.closed,
            off_budget: self.offbudget,
            bank_link,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CategoryGroupWire {
    name: String,
    #[serde(default)]
    categories: Vec<CategoryWire>,
}

#[derive(Debug, Deserialize)]
struct CategoryWire {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TransactionWire {
    id: String,
    account: String,
    date: NaiveDate,
    amount: i64,
    #[serde(default)]
    imported_id: Option<String>,
    #[serde(default)]
    payee_name: Option<String>,
    #[serde(default)]
    imported_payee: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    cleared: bool,
}

impl TransactionWire {
    fn into_model(self) -> LedgerTransaction {
        LedgerTransaction {
            id: self.id,
            account_id: self.account,
            imported_id: self.imported_id,
            amount: self.amount,
            date: self.date,
            payee: self.payee_name.or(self.imported_payee).unwrap_or_default(),
            notes: self.notes,
            category_id: self.category,
            cleared: self.cleared,
        }
    }
}

#[derive(Debug, Serialize)]
struct ImportRequest<'a> {
    transactions: Vec<ImportTransactionWire<'a>>,
}

#[derive(Debug, Serialize)]
struct ImportTransactionWire<'a> {
    date: String,
    amount: i64,
    imported_id: &'a str,
    payee_name: &'a str,
    imported_payee: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'a str>,
    cleared: bool,
}

impl<'a> From<&'a NewTransaction> for ImportTransactionWire<'a> {
    fn from(tx: &'a NewTransaction) -> Self {
        Self {
            date: tx.date.format("%Y-%m-%d").to_string(),
            amount: tx.amount,
            imported_id: &tx.imported_id,
            payee_name: &tx.payee,
            imported_payee: &tx.payee,
            notes: tx.notes.as_deref(),
            category: tx.category_id.as_deref(),
            cleared: tx.cleared,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImportResultWire {
    #[serde(default)]
    added: Vec<String>,
    #[serde(default)]
    updated: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonthWire {
    #[serde(default)]
    category_groups: Vec<MonthGroupWire>,
}

#[derive(Debug, Deserialize)]
struct MonthGroupWire {
    #[serde(default)]
    categories: Vec<MonthCategoryWire>,
}

#[derive(Debug, Deserialize)]
struct MonthCategoryWire {
    id: String,
    name: String,
    #[serde(default)]
    budgeted: i64,
    #[serde(default)]
    balance: i64,
}

#[derive(Debug, Deserialize)]
struct BankSyncWire {
    transactions: BankSyncTransactions,
}

#[derive(Debug, Deserialize)]
struct BankSyncTransactions {
    #[serde(default)]
    all: Vec<BankTransactionWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BankTransactionWire {
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    booking_date: Option<NaiveDate>,
    #[serde(default)]
    date: Option<NaiveDate>,
    transaction_amount: BankAmountWire,
    #[serde(default)]
    payee_name: Option<String>,
    #[serde(default)]
    remittance_information_unstructured: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BankAmountWire {
    amount: String,
}

impl BankTransactionWire {
    fn into_model(self, account_id: &str) -> Option<ExternalTransaction> {
        let date = self.booking_date.or(self.date)?;
        let amount = parse_minor_units(&self.transaction_amount.amount)?;
        let description = self
            .payee_name
            .clone()
            .or_else(|| self.remittance_information_unstructured.clone())
            .unwrap_or_default();
        let notes = self.notes.or(self.remittance_information_unstructured);
        Some(ExternalTransaction {
            account_id: account_id.to_string(),
            provider_id: self.transaction_id,
            amount,
            date,
            description,
            notes,
            category: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, "", "open", true).kind(),
            ErrorKind::FailedFile
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, "", "list", false).kind(),
            ErrorKind::FailedUnknown
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, "", "open", true).kind(),
            ErrorKind::FailedUnknown
        );
        let err = classify_status(StatusCode::BAD_REQUEST, "could not decrypt file", "open", true);
        assert!(err.to_string().contains("decrypted"));
    }

    #[test]
    fn test_wire_month() {
        assert_eq!(to_wire_month("202403").unwrap(), "2024-03");
        assert_eq!(to_wire_month("2024-03").unwrap(), "2024-03");

        // Multi-byte input of a plausible length is rejected, not sliced
        for bad in ["2024é", "ééé", "20240", "2024-3", "202-403", "2024--03", "abcdef"] {
            let err = to_wire_month(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::FailedUnknown, "{bad}");
        }
    }

    #[test]
    fn test_bank_row_mapping() {
        let row: BankTransactionWire = serde_json::from_value(serde_json::json!({
            "transactionId": "tx-9",
            "bookingDate": "2024-02-03",
            "transactionAmount": { "amount": "-19.90", "currency": "EUR" },
            "remittanceInformationUnstructured": "CARD 1234 BAKERY"
        }))
        .unwrap();
        let tx = row.into_model("acct-1").unwrap();
        assert_eq!(tx.amount, -1990);
        assert_eq!(tx.provider_id.as_deref(), Some("tx-9"));
        assert_eq!(tx.description, "CARD 1234 BAKERY");
        assert_eq!(tx.date, NaiveDate::from_ymd_opt(2024, 2, 3).unwrap());
    }
}
