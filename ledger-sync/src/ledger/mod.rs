//! Ledger service clients.
//!
//! [`LedgerClient`] is the seam between the engine and the ledger service.
//! [`HttpLedgerClient`] talks to a real server; [`MemoryLedger`] keeps the
//! file in memory and is what the tests drive.

pub mod http;
pub mod memory;
pub mod traits;

pub use http::{HttpConnector, HttpLedgerClient};
pub use memory::MemoryLedger;
pub use traits::{get_or_create_account, LedgerClient, LedgerConnector, SessionInfo};
