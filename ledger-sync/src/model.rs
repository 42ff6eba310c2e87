//! Domain types shared by feeds, the ledger client and the reconciliation engine.
//!
//! Amounts are signed integers in minor currency units (cents).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Bank-sync link of a ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankLink {
    /// Aggregator behind the link (e.g. `goCardless`, `simpleFin`)
    pub sync_source: String,
    /// Account id at the aggregator
    pub bank_account_id: String,
}

/// An account as the ledger service knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: String,
    pub name: String,
    /// Current balance
    pub balance: i64,
    pub closed: bool,
    pub off_budget: bool,
    /// Present when the ledger service runs bank sync for this account
    pub bank_link: Option<BankLink>,
}

impl LedgerAccount {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            balance: 0,
            closed: false,
            off_budget: false,
            bank_link: None,
        }
    }
}

/// An account reported by a feed, bound to its ledger counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Id at the provider
    pub external_id: String,
    pub name: String,
    pub currency: Option<String>,
    /// Ledger account id, `None` until mapped
    pub ledger_account_id: Option<String>,
    /// Set when the ledger service itself syncs this account
    pub bank_link: Option<BankLink>,
}

/// A transaction as reported by a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTransaction {
    /// Ledger account the transaction belongs to
    pub account_id: String,
    /// Provider-assigned id, stable per provider
    pub provider_id: Option<String>,
    pub amount: i64,
    pub date: NaiveDate,
    /// Cleaned description, used as payee
    pub description: String,
    pub notes: Option<String>,
    /// Provider category name
    pub category: Option<String>,
}

/// A transaction stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub account_id: String,
    /// Dedup identifier recorded at import time
    pub imported_id: Option<String>,
    pub amount: i64,
    pub date: NaiveDate,
    pub payee: String,
    pub notes: Option<String>,
    pub category_id: Option<String>,
    pub cleared: bool,
}

/// A staged insert produced by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub account_id: String,
    pub imported_id: String,
    pub amount: i64,
    pub date: NaiveDate,
    pub payee: String,
    pub notes: Option<String>,
    pub category_id: Option<String>,
    pub cleared: bool,
}

/// A budget category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCategory {
    pub id: String,
    pub name: String,
    pub group_name: Option<String>,
}

/// Acknowledgment of a committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAck {
    /// Ledger ids of newly recorded transactions
    pub added: Vec<String>,
    /// Ledger ids of transactions the service matched to existing ones
    pub updated: Vec<String>,
}

/// Per-account watermark of the last committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncCursor {
    pub date: NaiveDate,
    pub provider_id: Option<String>,
}

/// Budgeted amount for one month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetAmount {
    /// Month as `YYYYMM`
    pub month: String,
    pub amount: Option<i64>,
}

/// Budget history and balance of one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryBudget {
    pub category_id: String,
    pub name: String,
    /// Sorted by month
    pub amounts: Vec<BudgetAmount>,
    pub balance: i64,
}

/// Current budget state of the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub categories: Vec<CategoryBudget>,
}

impl BudgetSnapshot {
    pub fn category(&self, name: &str) -> Option<&CategoryBudget> {
        self.categories.iter().find(|c| c.name == name)
    }
}

/// Parse a decimal string such as `"-12.5"` into minor units.
pub fn parse_minor_units(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction[..2].parse().ok()?,
    };
    // round half up on the third decimal
    if fraction.len() > 2 && fraction.as_bytes()[2] >= b'5' {
        cents += 1;
    }
    let value = whole.checked_mul(100)?.checked_add(cents)?;
    Some(if negative { -value } else { value })
}

/// Convert a major-unit float (as Akahu reports amounts) into minor units.
pub fn float_to_minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Minor units as a major-unit float for display.
pub fn minor_to_major(amount: i64) -> f64 {
    amount as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minor_units() {
        assert_eq!(parse_minor_units("-12.50"), Some(-1250));
        assert_eq!(parse_minor_units("12.5"), Some(1250));
        assert_eq!(parse_minor_units("7"), Some(700));
        assert_eq!(parse_minor_units("+0.07"), Some(7));
        assert_eq!(parse_minor_units("1.005"), Some(101));
        assert_eq!(parse_minor_units("abc"), None);
        assert_eq!(parse_minor_units(""), None);
    }

    #[test]
    fn test_float_conversion() {
        assert_eq!(float_to_minor_units(-45.99), -4599);
        assert_eq!(float_to_minor_units(0.1 + 0.2), 30);
        assert_eq!(minor_to_major(-4599), -45.99);
    }

    #[test]
    fn test_cursor_ordering() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let a = SyncCursor { date, provider_id: Some("a".into()) };
        let b = SyncCursor { date, provider_id: Some("b".into()) };
        let later = SyncCursor {
            date: date.succ_opt().unwrap(),
            provider_id: None,
        };
        assert!(a < b);
        assert!(b < later);
    }
}
