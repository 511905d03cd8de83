//! `stockledger-core`: shared domain building blocks.
//!
//! Pure domain primitives only (no IO, no async, no storage).

pub mod error;
pub mod id;
pub mod key;
pub mod page;

pub use error::{DomainError, DomainResult};
pub use id::{ActorId, BalanceId, MerchantId, MovementId, ProductId, StoreId, VariantId};
pub use key::StockKey;
pub use page::{PageRequest, Paged};
