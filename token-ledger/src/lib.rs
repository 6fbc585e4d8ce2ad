//! DelTran Token Ledger
//!
//! Fungible-token ledger with ERC20 semantics (balances, transfers, minting,
//! burning) persisted in PostgreSQL.
//!
//! # Architecture
//!
//! - **LedgerService**: every public operation, validation and logging
//! - **LedgerStore**: transactional persistence seam (`PgLedgerStore`,
//!   `MemoryLedgerStore`)
//! - **Lazy addresses**: balances materialise on first touch via
//!   insert-if-absent
//!
//! # Invariants
//!
//! - Supply conservation: total_supply == Σ(balances) for every token
//! - Non-negativity: no balance or supply ever drops below zero
//! - Atomicity: each transfer, mint and burn commits in one transaction
//! - Symbol uniqueness across all tokens

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{ErrorKind, LedgerError, Result};
pub use service::LedgerService;
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use types::{
    AccountBookId, AddressId, Amount, DebitOperation, NewToken, SupplyAudit, Token, TokenId,
};
