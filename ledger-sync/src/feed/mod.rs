//! Bank feeds.
//!
//! A feed discovers the accounts it serves and streams their transactions
//! page by page. [`LinkedBankFeed`] goes through the ledger service's own
//! bank aggregation; [`AkahuFeed`] calls Akahu directly.

pub mod akahu;
pub mod generic;
pub mod traits;

pub use akahu::{AkahuFeed, AkahuOptions};
pub use generic::LinkedBankFeed;
pub use traits::{BankFeed, FeedKind, PageStream};
