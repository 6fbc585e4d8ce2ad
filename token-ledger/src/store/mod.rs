//! Persistence layer
//!
//! Every backend implements [`LedgerStore`]. Each method is one atomic unit:
//! it either commits all of its writes or none of them. Backends enforce the
//! balance rules themselves (under lock) so a check can never go stale
//! between read and write.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use crate::types::{
    AccountBookId, AddressId, Amount, NewToken, SupplyAudit, SupplyChange, Token, TokenId,
    TransferOutcome,
};
use crate::Result;
use async_trait::async_trait;

/// Transactional storage for account books, tokens and addresses
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Insert a new, empty account book
    async fn create_account_book(&self) -> Result<AccountBookId>;

    /// Insert a token. `None` creates a fresh account book in the same
    /// transaction. A non-zero initial supply is credited to the book's
    /// treasury address.
    async fn insert_token(&self, book: Option<AccountBookId>, token: &NewToken) -> Result<Token>;

    /// Token by ID
    async fn token(&self, token_id: TokenId) -> Result<Option<Token>>;

    /// Token by symbol
    async fn token_by_symbol(&self, symbol: &str) -> Result<Option<Token>>;

    /// Insert the address with a zero balance unless it already exists, then
    /// return its balance
    async fn ensure_address(&self, token_id: TokenId, address: AddressId) -> Result<Amount>;

    /// Move `amount` from `sender` to `recipient`
    async fn transfer(
        &self,
        token_id: TokenId,
        sender: AddressId,
        recipient: AddressId,
        amount: Amount,
    ) -> Result<TransferOutcome>;

    /// Credit `account` and raise supply by `amount`
    async fn mint(&self, token_id: TokenId, account: AddressId, amount: Amount)
        -> Result<SupplyChange>;

    /// Debit `account` and lower supply by `amount`
    async fn burn(&self, token_id: TokenId, account: AddressId, amount: Amount)
        -> Result<SupplyChange>;

    /// Compare recorded supply with the sum of balances
    async fn supply_audit(&self, token_id: TokenId) -> Result<Option<SupplyAudit>>;
}
