//! Account and budget sensors.
//!
//! Sensors are the read side of an instance: one per ledger account carrying
//! its balance, and one per budget category carrying what is left to spend.
//! They are rebuilt from the ledger after every sync.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::model::{minor_to_major, BudgetAmount, BudgetSnapshot, CategoryBudget, LedgerAccount};

/// Domain component of every sensor id.
pub const SENSOR_DOMAIN: &str = "actualbudget";

fn prefixed(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}

fn unique(source_id: &str, prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        format!("{}-{}-{}", SENSOR_DOMAIN, source_id, name).to_lowercase()
    } else {
        format!("{}-{}-{}-{}", SENSOR_DOMAIN, source_id, prefix, name).to_lowercase()
    }
}

/// Balance of one ledger account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSensor {
    pub unique_id: String,
    pub name: String,
    pub account_name: String,
    /// Minor units
    pub balance: i64,
    pub unit: String,
}

impl AccountSensor {
    pub fn new(account: &LedgerAccount, source_id: &str, prefix: &str, unit: &str) -> Self {
        Self {
            unique_id: unique(source_id, prefix, &account.name),
            name: prefixed(prefix, &account.name),
            account_name: account.name.clone(),
            balance: account.balance,
            unit: unit.to_string(),
        }
    }

    pub fn state(&self) -> f64 {
        minor_to_major(self.balance)
    }
}

/// Budget of one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSensor {
    pub unique_id: String,
    pub name: String,
    pub category_name: String,
    pub amounts: Vec<BudgetAmount>,
    /// Minor units
    pub balance: i64,
    pub unit: String,
}

impl BudgetSensor {
    pub fn new(budget: &CategoryBudget, source_id: &str, prefix: &str, unit: &str) -> Self {
        Self {
            unique_id: unique(source_id, prefix, &format!("budget-{}", budget.name)),
            name: prefixed(prefix, &format!("budget_{}", budget.name)),
            category_name: budget.name.clone(),
            amounts: budget.amounts.clone(),
            balance: budget.balance,
            unit: unit.to_string(),
        }
    }

    /// Amounts of months up to and including the month of `today`.
    fn elapsed(&self, today: NaiveDate) -> Vec<&BudgetAmount> {
        let current = today.format("%Y%m").to_string();
        self.amounts
            .iter()
            .filter(|a| a.month.as_str() <= current.as_str())
            .collect()
    }

    /// Balance plus everything budgeted up to this month, in minor units.
    pub fn state_minor(&self, today: NaiveDate) -> i64 {
        self.balance
            + self
                .elapsed(today)
                .iter()
                .filter_map(|a| a.amount)
                .sum::<i64>()
    }

    pub fn state(&self, today: NaiveDate) -> f64 {
        minor_to_major(self.state_minor(today))
    }

    /// Current and previous month figures plus the running total.
    pub fn attributes(&self, today: NaiveDate) -> Map<String, Value> {
        let elapsed = self.elapsed(today);
        let mut attributes = Map::new();

        if let Some(current) = elapsed.last() {
            attributes.insert("current_month".into(), json!(current.month));
            attributes.insert("current_amount".into(), json!(current.amount.map(minor_to_major)));
        }
        if elapsed.len() > 1 {
            let previous = elapsed[elapsed.len() - 2];
            attributes.insert("previous_month".into(), json!(previous.month));
            attributes.insert("previous_amount".into(), json!(previous.amount.map(minor_to_major)));
            let total: i64 = elapsed.iter().filter_map(|a| a.amount).sum();
            attributes.insert("total_amount".into(), json!(minor_to_major(total)));
        }
        attributes
    }
}

/// All sensors of an instance at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub source_id: String,
    pub accounts: Vec<AccountSensor>,
    pub budgets: Vec<BudgetSensor>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SensorSnapshot {
    pub fn build(
        source_id: &str,
        prefix: &str,
        unit: &str,
        accounts: &[LedgerAccount],
        budget: &BudgetSnapshot,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            accounts: accounts
                .iter()
                .filter(|a| !a.closed)
                .map(|a| AccountSensor::new(a, source_id, prefix, unit))
                .collect(),
            budgets: budget
                .categories
                .iter()
                .map(|b| BudgetSensor::new(b, source_id, prefix, unit))
                .collect(),
            updated_at: Some(Utc::now()),
        }
    }

    pub fn account(&self, name: &str) -> Option<&AccountSensor> {
        self.accounts.iter().find(|s| s.account_name == name)
    }

    pub fn budget(&self, name: &str) -> Option<&BudgetSensor> {
        self.budgets.iter().find(|s| s.category_name == name)
    }

    /// Flattened view for status output.
    pub fn to_json(&self, today: NaiveDate) -> Value {
        let accounts: Vec<Value> = self
            .accounts
            .iter()
            .map(|s| {
                json!({
                    "unique_id": s.unique_id,
                    "name": s.name,
                    "state": s.state(),
                    "unit": s.unit,
                })
            })
            .collect();
        let budgets: Vec<Value> = self
            .budgets
            .iter()
            .map(|s| {
                json!({
                    "unique_id": s.unique_id,
                    "name": s.name,
                    "state": s.state(today),
                    "unit": s.unit,
                    "attributes": s.attributes(today),
                })
            })
            .collect();
        json!({
            "source_id": self.source_id,
            "updated_at": self.updated_at,
            "accounts": accounts,
            "budgets": budgets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn food() -> CategoryBudget {
        CategoryBudget {
            category_id: "c1".into(),
            name: "Food".into(),
            amounts: vec![
                BudgetAmount { month: "202401".into(), amount: Some(40_000) },
                BudgetAmount { month: "202402".into(), amount: None },
                BudgetAmount { month: "202403".into(), amount: Some(45_000) },
                BudgetAmount { month: "202404".into(), amount: Some(50_000) },
            ],
            balance: -12_550,
        }
    }

    #[test]
    fn test_names_and_ids() {
        let account = LedgerAccount::new("a1", "Checking");
        let sensor = AccountSensor::new(&account, "File-1", "actualbudget", "€");
        assert_eq!(sensor.name, "actualbudget_Checking");
        assert_eq!(sensor.unique_id, "actualbudget-file-1-actualbudget-checking");

        let bare = AccountSensor::new(&account, "File-1", "", "€");
        assert_eq!(bare.name, "Checking");
        assert_eq!(bare.unique_id, "actualbudget-file-1-checking");

        let budget = BudgetSensor::new(&food(), "File-1", "actualbudget", "€");
        assert_eq!(budget.name, "actualbudget_budget_Food");
        assert_eq!(budget.unique_id, "actualbudget-file-1-actualbudget-budget-food");
    }

    #[test]
    fn test_budget_state_counts_elapsed_months() {
        let sensor = BudgetSensor::new(&food(), "f", "", "€");
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        // -125.50 + 400 + 450
        assert_eq!(sensor.state_minor(today), 72_450);
        assert_eq!(sensor.state(today), 724.5);
    }

    #[test]
    fn test_budget_attributes() {
        let sensor = BudgetSensor::new(&food(), "f", "", "€");
        let attributes = sensor.attributes(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(attributes["current_month"], "202403");
        assert_eq!(attributes["current_amount"], 450.0);
        assert_eq!(attributes["previous_month"], "202402");
        assert_eq!(attributes["previous_amount"], Value::Null);
        assert_eq!(attributes["total_amount"], 850.0);

        let early = sensor.attributes(NaiveDate::from_ymd_opt(2023, 12, 1).unwrap());
        assert!(early.is_empty());
    }

    #[test]
    fn test_snapshot_skips_closed_accounts() {
        let mut closed = LedgerAccount::new("a2", "Old");
        closed.closed = true;
        let accounts = vec![LedgerAccount::new("a1", "Checking"), closed];
        let budget = BudgetSnapshot { categories: vec![food()] };

        let snapshot = SensorSnapshot::build("f", "actualbudget", "€", &accounts, &budget);
        assert_eq!(snapshot.accounts.len(), 1);
        assert!(snapshot.budget("Food").is_some());
        assert!(snapshot.account("Old").is_none());

        let json = snapshot.to_json(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(json["budgets"][0]["state"], 724.5);
    }
}
