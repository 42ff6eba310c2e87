//! Reconciliation of fetched transactions against ledger state.
//!
//! Pure and synchronous. Given what a feed reported and what the ledger
//! already holds for the same accounts, decide which transactions are new,
//! which are already recorded, and which disagree with their recorded
//! counterpart. Nothing here ever deletes or overwrites ledger data.
//!
//! Identity comes from [`DedupKey`]: the provider's transaction id when one
//! exists, otherwise a fingerprint over account, amount, date, normalized
//! description and the occurrence ordinal among identical fingerprints. The
//! key is stored as the ledger transaction's `imported_id`, so a later run
//! recognizes what an earlier run committed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::{
    ExternalTransaction, LedgerCategory, LedgerTransaction, NewTransaction, SyncCursor,
};

const FINGERPRINT_PREFIX: &str = "fp:";

/// Stable identity of a transaction across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DedupKey {
    Provider { account_id: String, provider_id: String },
    Fingerprint { account_id: String, digest: String },
}

impl DedupKey {
    /// Key of an external transaction. `ordinal` counts earlier transactions
    /// in the same batch with an identical fingerprint.
    pub fn for_external(tx: &ExternalTransaction, ordinal: u32) -> Self {
        match tx.provider_id.as_deref().filter(|id| !id.is_empty()) {
            Some(provider_id) => DedupKey::Provider {
                account_id: tx.account_id.clone(),
                provider_id: provider_id.to_string(),
            },
            None => DedupKey::Fingerprint {
                account_id: tx.account_id.clone(),
                digest: fingerprint(tx, ordinal),
            },
        }
    }

    /// Key recorded on a ledger transaction, if it was imported.
    pub fn from_ledger(tx: &LedgerTransaction) -> Option<Self> {
        let imported_id = tx.imported_id.as_deref().filter(|id| !id.is_empty())?;
        Some(match imported_id.strip_prefix(FINGERPRINT_PREFIX) {
            Some(digest) => DedupKey::Fingerprint {
                account_id: tx.account_id.clone(),
                digest: digest.to_string(),
            },
            None => DedupKey::Provider {
                account_id: tx.account_id.clone(),
                provider_id: imported_id.to_string(),
            },
        })
    }

    /// Value stored as the ledger's `imported_id`.
    pub fn imported_id(&self) -> String {
        match self {
            DedupKey::Provider { provider_id, .. } => provider_id.clone(),
            DedupKey::Fingerprint { digest, .. } => format!("{}{}", FINGERPRINT_PREFIX, digest),
        }
    }

    pub fn account_id(&self) -> &str {
        match self {
            DedupKey::Provider { account_id, .. } | DedupKey::Fingerprint { account_id, .. } => account_id,
        }
    }
}

/// Lowercased description with runs of whitespace collapsed.
pub fn normalize_description(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn base_fingerprint(tx: &ExternalTransaction) -> String {
    format!(
        "{}|{}|{}|{}",
        tx.account_id,
        tx.amount,
        tx.date.format("%Y-%m-%d"),
        normalize_description(&tx.description)
    )
}

/// Fallback identity digest.
pub fn fingerprint(tx: &ExternalTransaction, ordinal: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base_fingerprint(tx).as_bytes());
    hasher.update(b"|");
    hasher.update(ordinal.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// A field that differs between the feed and the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FieldChange {
    Amount { ledger: i64, external: i64 },
    Date { ledger: chrono::NaiveDate, external: chrono::NaiveDate },
}

/// A recorded transaction the feed now reports differently. Never applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub key: DedupKey,
    pub ledger_id: String,
    pub changes: Vec<FieldChange>,
}

/// Minimal set of writes for one batch of external transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    /// Ordered by account, date, provider id
    pub inserts: Vec<NewTransaction>,
    pub conflicts: Vec<Conflict>,
    /// Transactions already recorded identically
    pub unchanged: usize,
    /// Highest examined position per account
    pub cursor_candidates: BTreeMap<String, SyncCursor>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
    }

    /// Inserts of one account, in commit order.
    pub fn inserts_for<'a>(&'a self, account_id: &'a str) -> impl Iterator<Item = &'a NewTransaction> + 'a {
        self.inserts.iter().filter(move |tx| tx.account_id == account_id)
    }

    /// Provider ids staged for insertion on an account.
    pub fn staged_provider_ids(&self, account_id: &str) -> Vec<String> {
        self.inserts_for(account_id)
            .filter(|tx| !tx.imported_id.starts_with(FINGERPRINT_PREFIX))
            .map(|tx| tx.imported_id.clone())
            .collect()
    }
}

/// Reconciliation settings.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationEngine {
    map_categories: bool,
    cleared: bool,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map provider categories onto ledger categories by name.
    pub fn with_category_mapping(mut self, enabled: bool) -> Self {
        self.map_categories = enabled;
        self
    }

    /// Cleared flag given to inserted transactions.
    pub fn with_cleared(mut self, cleared: bool) -> Self {
        self.cleared = cleared;
        self
    }

    /// Diff `external` against `ledger`.
    ///
    /// `ledger` must hold the recorded transactions of every account in
    /// `external` for at least the dates `external` covers.
    pub fn reconcile(
        &self,
        external: &[ExternalTransaction],
        ledger: &[LedgerTransaction],
        categories: &[LedgerCategory],
    ) -> WriteSet {
        let recorded: HashMap<DedupKey, &LedgerTransaction> = ledger
            .iter()
            .filter_map(|tx| DedupKey::from_ledger(tx).map(|key| (key, tx)))
            .collect();

        let category_ids: HashMap<String, &str> = categories
            .iter()
            .map(|c| (c.name.to_lowercase(), c.id.as_str()))
            .collect();

        let mut write_set = WriteSet::default();
        let mut occurrences: HashMap<String, u32> = HashMap::new();
        let mut staged: HashSet<DedupKey> = HashSet::new();

        for tx in external {
            let ordinal = if tx.provider_id.as_deref().map_or(true, str::is_empty) {
                let counter = occurrences.entry(base_fingerprint(tx)).or_insert(0);
                let ordinal = *counter;
                *counter += 1;
                ordinal
            } else {
                0
            };
            let key = DedupKey::for_external(tx, ordinal);

            let candidate = SyncCursor {
                date: tx.date,
                provider_id: tx.provider_id.clone(),
            };
            write_set
                .cursor_candidates
                .entry(tx.account_id.clone())
                .and_modify(|current| {
                    if candidate > *current {
                        *current = candidate.clone();
                    }
                })
                .or_insert_with(|| candidate.clone());

            if let Some(existing) = recorded.get(&key) {
                let changes = diff(existing, tx);
                if changes.is_empty() {
                    write_set.unchanged += 1;
                } else {
                    write_set.conflicts.push(Conflict {
                        key,
                        ledger_id: existing.id.clone(),
                        changes,
                    });
                }
                continue;
            }

            // The same provider id twice in one batch: first one wins.
            if !staged.insert(key.clone()) {
                continue;
            }

            let category_id = if self.map_categories {
                tx.category
                    .as_deref()
                    .and_then(|name| category_ids.get(&name.to_lowercase()))
                    .map(|id| id.to_string())
            } else {
                None
            };

            write_set.inserts.push(NewTransaction {
                account_id: tx.account_id.clone(),
                imported_id: key.imported_id(),
                amount: tx.amount,
                date: tx.date,
                payee: tx.description.clone(),
                notes: tx.notes.clone(),
                category_id,
                cleared: self.cleared,
            });
        }

        write_set.inserts.sort_by(|a, b| {
            (&a.account_id, a.date, &a.imported_id).cmp(&(&b.account_id, b.date, &b.imported_id))
        });
        write_set.conflicts.sort_by(|a, b| a.key.cmp(&b.key));
        write_set
    }
}

fn diff(ledger: &LedgerTransaction, external: &ExternalTransaction) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    if ledger.amount != external.amount {
        changes.push(FieldChange::Amount {
            ledger: ledger.amount,
            external: external.amount,
        });
    }
    if ledger.date != external.date {
        changes.push(FieldChange::Date {
            ledger: ledger.date,
            external: external.date,
        });
    }
    changes
}

/// True when every transaction of a non-empty page predates the cursor.
pub fn page_is_stale(page: &[ExternalTransaction], cursor: Option<&SyncCursor>) -> bool {
    match cursor {
        Some(cursor) => !page.is_empty() && page.iter().all(|tx| tx.date < cursor.date),
        None => false,
    }
}
