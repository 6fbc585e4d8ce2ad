//! Token ledger service
//!
//! Ties a [`LedgerStore`] to the public ERC20-style API: token registry,
//! address resolution and the balance-transfer engine.
//!
//! Every operation:
//! - validates its input before touching the store,
//! - runs in its own span on the injected [`Dispatch`],
//! - races the handle's [`CancellationToken`]; a cancelled operation drops
//!   its in-flight store future, which rolls back any open transaction.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use token_ledger::{AddressId, LedgerService, MemoryLedgerStore};
//!
//! #[tokio::main]
//! async fn main() -> token_ledger::Result<()> {
//!     let ledger = LedgerService::new(Arc::new(MemoryLedgerStore::new()), tracing::Dispatch::none());
//!
//!     let gold = ledger.create_token("Gold", "GLD", 18, 0).await?;
//!     let alice = AddressId::new();
//!     ledger.mint(gold.id, alice, 100).await?;
//!     assert_eq!(ledger.balance_of(gold.id, alice).await?, 100);
//!
//!     Ok(())
//! }
//! ```

use crate::error::{ErrorKind, LedgerError, Result};
use crate::store::{LedgerStore, PgLedgerStore};
use crate::telemetry;
use crate::types::{AccountBookId, AddressId, Amount, NewToken, SupplyAudit, Token, TokenId};
use crate::Config;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, info_span, warn, Dispatch, Instrument, Span};
use validator::Validate;

/// Main ledger interface
#[derive(Debug)]
pub struct LedgerService<S> {
    /// Persistence backend
    store: Arc<S>,

    /// Where this service's spans and events go
    dispatch: Dispatch,

    /// Cancels every operation started through this handle
    cancel: CancellationToken,
}

impl<S> Clone for LedgerService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            dispatch: self.dispatch.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl LedgerService<PgLedgerStore> {
    /// Connect to PostgreSQL and build the logging dispatcher from configuration
    pub async fn connect(config: &Config) -> Result<Self> {
        config.validate()?;
        let dispatch = telemetry::build_dispatch(&config.logging)?;

        let store = async {
            let store = PgLedgerStore::connect(&config.database).await?;
            if config.database.run_migrations {
                store.migrate().await?;
            }
            info!(
                max_connections = config.database.max_connections,
                "Token ledger connected to database"
            );
            Ok::<_, LedgerError>(store)
        }
        .with_subscriber(dispatch.clone())
        .await?;

        Ok(Self::new(Arc::new(store), dispatch))
    }
}

impl<S: LedgerStore> LedgerService<S> {
    /// Create a service over `store`, logging to `dispatch`
    pub fn new(store: Arc<S>, dispatch: Dispatch) -> Self {
        Self {
            store,
            dispatch,
            cancel: CancellationToken::new(),
        }
    }

    /// Handle sharing this service's store and logger whose operations are
    /// aborted when `cancel` fires
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            store: Arc::clone(&self.store),
            dispatch: self.dispatch.clone(),
            cancel,
        }
    }

    /// Persistence backend
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ===== Token registry =====

    /// Create an empty account book
    pub async fn create_account_book(&self) -> Result<AccountBookId> {
        self.run(
            || info_span!("create_account_book"),
            async {
                let id = self.store.create_account_book().await?;
                info!(account_book = %id, "Created account book");
                Ok(id)
            },
        )
        .await
    }

    /// Create a token in a new account book
    ///
    /// Fails with [`LedgerError::SymbolAlreadyExists`] if the symbol is taken.
    pub async fn create_token(
        &self,
        name: &str,
        symbol: &str,
        decimals: u8,
        total_supply: Amount,
    ) -> Result<Token> {
        let request = NewToken::new(name, symbol, decimals, total_supply);
        self.run(
            || info_span!("create_token", symbol),
            self.insert_token(None, request),
        )
        .await
    }

    /// Create a token inside an existing account book
    pub async fn create_token_in_book(
        &self,
        account_book_id: AccountBookId,
        request: NewToken,
    ) -> Result<Token> {
        self.run(
            || info_span!("create_token", symbol = %request.symbol, account_book = %account_book_id),
            self.insert_token(Some(account_book_id), request.clone()),
        )
        .await
    }

    async fn insert_token(&self, book: Option<AccountBookId>, request: NewToken) -> Result<Token> {
        request.validate()?;

        let token = self.store.insert_token(book, &request).await?;

        info!(
            token = %token.id,
            account_book = %token.account_book_id,
            decimals = token.decimals,
            total_supply = token.total_supply,
            "Created token {} ({})",
            token.symbol,
            token.name
        );

        Ok(token)
    }

    /// Resolve a symbol to its token ID
    pub async fn token_id_by_symbol(&self, symbol: &str) -> Result<TokenId> {
        self.run(|| info_span!("token_id_by_symbol", symbol), async {
            self.store
                .token_by_symbol(symbol)
                .await?
                .map(|token| token.id)
                .ok_or_else(|| LedgerError::SymbolNotFound(symbol.to_string()))
        })
        .await
    }

    /// Full token metadata
    pub async fn token(&self, token_id: TokenId) -> Result<Token> {
        self.run(|| info_span!("token", token = %token_id), async {
            self.store
                .token(token_id)
                .await?
                .ok_or(LedgerError::TokenNotFound(token_id))
        })
        .await
    }

    /// Token name (not unique)
    pub async fn name(&self, token_id: TokenId) -> Result<String> {
        Ok(self.token(token_id).await?.name)
    }

    /// Token symbol (unique)
    pub async fn symbol(&self, token_id: TokenId) -> Result<String> {
        Ok(self.token(token_id).await?.symbol)
    }

    /// Digits used for user representation
    pub async fn decimals(&self, token_id: TokenId) -> Result<u8> {
        Ok(self.token(token_id).await?.decimals)
    }

    /// Current total supply
    pub async fn total_supply(&self, token_id: TokenId) -> Result<Amount> {
        Ok(self.token(token_id).await?.total_supply)
    }

    // ===== Address resolution =====

    /// Treasury address of `account_book_id` for the token with `symbol`,
    /// created with a zero balance if absent
    pub async fn resolve_address(
        &self,
        symbol: &str,
        account_book_id: AccountBookId,
    ) -> Result<AddressId> {
        self.run(
            || info_span!("resolve_address", symbol, account_book = %account_book_id),
            async {
                let token = self
                    .store
                    .token_by_symbol(symbol)
                    .await?
                    .ok_or_else(|| LedgerError::SymbolNotFound(symbol.to_string()))?;

                if token.account_book_id != account_book_id {
                    return Err(LedgerError::TokenNotInAccountBook {
                        symbol: symbol.to_string(),
                        account_book_id,
                    });
                }

                let address = AddressId::from(account_book_id);
                self.store.ensure_address(token.id, address).await?;
                debug!(token = %token.id, address = %address, "Resolved address");

                Ok(address)
            },
        )
        .await
    }

    /// Balance of `address`; an unknown address is created with balance 0
    pub async fn balance_of(&self, token_id: TokenId, address: AddressId) -> Result<Amount> {
        self.run(
            || info_span!("balance_of", token = %token_id, address = %address),
            self.store.ensure_address(token_id, address),
        )
        .await
    }

    // ===== Balance-transfer engine =====

    /// Move `amount` from `sender` to `recipient`
    ///
    /// Rejected with [`LedgerError::InsufficientBalance`] and no state change
    /// when the sender holds less than `amount`.
    pub async fn transfer_from(
        &self,
        token_id: TokenId,
        sender: AddressId,
        recipient: AddressId,
        amount: Amount,
    ) -> Result<bool> {
        self.run(
            || {
                info_span!(
                    "transfer_from",
                    token = %token_id,
                    sender = %sender,
                    recipient = %recipient,
                    amount
                )
            },
            async {
                ensure_positive(amount)?;

                let outcome = self
                    .store
                    .transfer(token_id, sender, recipient, amount)
                    .await?;

                info!(
                    sender_balance = outcome.sender_balance,
                    recipient_balance = outcome.recipient_balance,
                    "Transferred {} from {} to {}",
                    amount,
                    sender,
                    recipient
                );

                Ok(true)
            },
        )
        .await
    }

    /// Create `amount` new tokens in `account`
    pub async fn mint(&self, token_id: TokenId, account: AddressId, amount: Amount) -> Result<()> {
        self.run(
            || info_span!("mint", token = %token_id, account = %account, amount),
            async {
                ensure_positive(amount)?;

                let change = self.store.mint(token_id, account, amount).await?;

                info!(
                    balance = change.balance,
                    total_supply = change.total_supply,
                    "Minted {} to {}",
                    amount,
                    account
                );

                Ok(())
            },
        )
        .await
    }

    /// Destroy `amount` tokens held by `account`
    ///
    /// Rejected with [`LedgerError::InsufficientBalance`] and no state change
    /// when the account holds less than `amount`.
    pub async fn burn(&self, token_id: TokenId, account: AddressId, amount: Amount) -> Result<()> {
        self.run(
            || info_span!("burn", token = %token_id, account = %account, amount),
            async {
                ensure_positive(amount)?;

                let change = self.store.burn(token_id, account, amount).await?;

                info!(
                    balance = change.balance,
                    total_supply = change.total_supply,
                    "Burned {} from {}",
                    amount,
                    account
                );

                Ok(())
            },
        )
        .await
    }

    /// Check supply conservation
    ///
    /// Compares the recorded total supply with the sum of all address
    /// balances of the token. A mismatch is logged at error level and
    /// returned to the caller, not repaired.
    pub async fn audit_supply(&self, token_id: TokenId) -> Result<SupplyAudit> {
        self.run(|| info_span!("audit_supply", token = %token_id), async {
            let audit = self
                .store
                .supply_audit(token_id)
                .await?
                .ok_or(LedgerError::TokenNotFound(token_id))?;

            if !audit.is_conserved() {
                error!(
                    total_supply = audit.total_supply,
                    balance_sum = audit.balance_sum,
                    "Supply conservation violated"
                );
            }

            Ok(audit)
        })
        .await
    }

    /// Run `fut` inside `span` on the injected dispatcher, racing cancellation
    async fn run<T, F>(&self, span: impl FnOnce() -> Span, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let cancel = self.cancel.clone();

        async move {
            // Created here so the span belongs to the injected dispatcher
            let span = span();
            async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(LedgerError::Cancelled),
                    result = fut => result,
                };

                if let Err(err) = &result {
                    log_failure(err);
                }

                result
            }
            .instrument(span)
            .await
        }
        .with_subscriber(self.dispatch.clone())
        .await
    }
}

fn ensure_positive(amount: Amount) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

fn log_failure(err: &LedgerError) {
    match err.kind() {
        ErrorKind::Persistence | ErrorKind::Configuration => {
            error!(error = %err, error_type = err.error_type(), "Ledger operation failed");
        }
        ErrorKind::Cancelled => {
            warn!("Ledger operation cancelled before commit");
        }
        _ => {
            warn!(error = %err, error_type = err.error_type(), "Ledger operation rejected");
        }
    }
}
