//! In-process store
//!
//! Same semantics as the PostgreSQL backend. Each method takes the state lock
//! once and never awaits while holding it, so every mutation is applied
//! whole or not at all.

use super::LedgerStore;
use crate::error::{LedgerError, Result};
use crate::types::{
    AccountBookId, AddressId, Amount, DebitOperation, NewToken, SupplyAudit, SupplyChange, Token,
    TokenId, TransferOutcome,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Default)]
struct State {
    account_books: HashSet<AccountBookId>,
    tokens: HashMap<TokenId, Token>,
    symbols: HashMap<String, TokenId>,
    addresses: BTreeMap<(TokenId, AddressId), Amount>,
}

impl State {
    fn token_mut(&mut self, token_id: TokenId) -> Result<&mut Token> {
        self.tokens
            .get_mut(&token_id)
            .ok_or(LedgerError::TokenNotFound(token_id))
    }

    fn balance(&self, token_id: TokenId, address: AddressId) -> Amount {
        self.addresses
            .get(&(token_id, address))
            .copied()
            .unwrap_or(0)
    }
}

/// Ledger store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<State>,
}

impl MemoryLedgerStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_account_book(&self) -> Result<AccountBookId> {
        let id = AccountBookId::new();
        self.state.lock().account_books.insert(id);
        Ok(id)
    }

    async fn insert_token(&self, book: Option<AccountBookId>, token: &NewToken) -> Result<Token> {
        let mut state = self.state.lock();

        if let Some(book_id) = book {
            if !state.account_books.contains(&book_id) {
                return Err(LedgerError::AccountBookNotFound(book_id));
            }
        }
        if state.symbols.contains_key(&token.symbol) {
            return Err(LedgerError::SymbolAlreadyExists(token.symbol.clone()));
        }

        let account_book_id = book.unwrap_or_default();
        let created = Token {
            id: TokenId::new(),
            account_book_id,
            name: token.name.clone(),
            symbol: token.symbol.clone(),
            decimals: token.decimals,
            total_supply: token.total_supply,
            created_at: Utc::now(),
        };

        state.account_books.insert(account_book_id);
        state.symbols.insert(created.symbol.clone(), created.id);
        if created.total_supply > 0 {
            state
                .addresses
                .insert((created.id, account_book_id.into()), created.total_supply);
        }
        state.tokens.insert(created.id, created.clone());

        Ok(created)
    }

    async fn token(&self, token_id: TokenId) -> Result<Option<Token>> {
        Ok(self.state.lock().tokens.get(&token_id).cloned())
    }

    async fn token_by_symbol(&self, symbol: &str) -> Result<Option<Token>> {
        let state = self.state.lock();
        Ok(state
            .symbols
            .get(symbol)
            .and_then(|id| state.tokens.get(id))
            .cloned())
    }

    async fn ensure_address(&self, token_id: TokenId, address: AddressId) -> Result<Amount> {
        let mut state = self.state.lock();
        if !state.tokens.contains_key(&token_id) {
            return Err(LedgerError::TokenNotFound(token_id));
        }
        Ok(*state.addresses.entry((token_id, address)).or_insert(0))
    }

    async fn transfer(
        &self,
        token_id: TokenId,
        sender: AddressId,
        recipient: AddressId,
        amount: Amount,
    ) -> Result<TransferOutcome> {
        let mut state = self.state.lock();
        if !state.tokens.contains_key(&token_id) {
            return Err(LedgerError::TokenNotFound(token_id));
        }

        let sender_balance = state.balance(token_id, sender);
        if sender_balance < amount {
            return Err(LedgerError::InsufficientBalance {
                operation: DebitOperation::Transfer,
                address: sender,
                attempted: amount,
                available: sender_balance,
            });
        }

        if sender == recipient {
            state.addresses.insert((token_id, sender), sender_balance);
            return Ok(TransferOutcome {
                sender_balance,
                recipient_balance: sender_balance,
            });
        }

        let recipient_balance = state
            .balance(token_id, recipient)
            .checked_add(amount)
            .ok_or_else(|| {
                LedgerError::AmountOverflow(format!("balance of {} + {}", recipient, amount))
            })?;
        let sender_balance = sender_balance - amount;

        state.addresses.insert((token_id, sender), sender_balance);
        state.addresses.insert((token_id, recipient), recipient_balance);

        Ok(TransferOutcome {
            sender_balance,
            recipient_balance,
        })
    }

    async fn mint(
        &self,
        token_id: TokenId,
        account: AddressId,
        amount: Amount,
    ) -> Result<SupplyChange> {
        let mut state = self.state.lock();
        let balance = state.balance(token_id, account);
        let token = state.token_mut(token_id)?;

        let total_supply = token.total_supply.checked_add(amount).ok_or_else(|| {
            LedgerError::AmountOverflow(format!("total supply of {} + {}", token_id, amount))
        })?;
        // Supply bounds every balance, so the balance cannot overflow if supply did not
        let balance = balance + amount;

        token.total_supply = total_supply;
        state.addresses.insert((token_id, account), balance);

        Ok(SupplyChange {
            balance,
            total_supply,
        })
    }

    async fn burn(
        &self,
        token_id: TokenId,
        account: AddressId,
        amount: Amount,
    ) -> Result<SupplyChange> {
        let mut state = self.state.lock();
        let balance = state.balance(token_id, account);
        let token = state.token_mut(token_id)?;

        if balance < amount {
            return Err(LedgerError::InsufficientBalance {
                operation: DebitOperation::Burn,
                address: account,
                attempted: amount,
                available: balance,
            });
        }

        token.total_supply -= amount;
        let total_supply = token.total_supply;
        let balance = balance - amount;
        state.addresses.insert((token_id, account), balance);

        Ok(SupplyChange {
            balance,
            total_supply,
        })
    }

    async fn supply_audit(&self, token_id: TokenId) -> Result<Option<SupplyAudit>> {
        let state = self.state.lock();
        let Some(token) = state.tokens.get(&token_id) else {
            return Ok(None);
        };

        let (balance_sum, address_count) = state
            .addresses
            .iter()
            .filter(|((owner_token, _), _)| *owner_token == token_id)
            .fold((0i64, 0i64), |(sum, count), (_, balance)| (sum + balance, count + 1));

        Ok(Some(SupplyAudit {
            token_id,
            total_supply: token.total_supply,
            balance_sum,
            address_count,
        }))
    }
}
