//! PostgreSQL store
//!
//! Balances and supply are changed with store-side arithmetic
//! (`balance = balance + $n`) and every update is scoped to one row by its
//! key. Rows are locked in a fixed order (token, then addresses by id) so
//! concurrent transfers, mints and burns cannot deadlock each other.

use super::LedgerStore;
use crate::config::DatabaseConfig;
use crate::error::{LedgerError, Result};
use crate::types::{
    AccountBookId, AddressId, Amount, DebitOperation, NewToken, SupplyAudit, SupplyChange, Token,
    TokenId, TransferOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// PostgreSQL error code for "numeric value out of range"
const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

const TOKEN_COLUMNS: &str =
    "id, account_book_id, name, symbol, decimals, total_supply, created_at";

#[derive(Debug, FromRow)]
struct TokenRow {
    id: Uuid,
    account_book_id: Uuid,
    name: String,
    symbol: String,
    decimals: i16,
    total_supply: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<TokenRow> for Token {
    type Error = LedgerError;

    fn try_from(row: TokenRow) -> Result<Self> {
        let decimals = u8::try_from(row.decimals).map_err(|_| {
            LedgerError::Validation(format!(
                "Token {} has out-of-range decimals {}",
                row.id, row.decimals
            ))
        })?;

        Ok(Token {
            id: TokenId(row.id),
            account_book_id: AccountBookId(row.account_book_id),
            name: row.name,
            symbol: row.symbol,
            decimals,
            total_supply: row.total_supply,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    total_supply: i64,
    balance_sum: i64,
    address_count: i64,
}

/// Map a failed statement, turning bigint overflow into a rule violation
fn classify(context: String) -> impl FnOnce(sqlx::Error) -> LedgerError {
    move |err| {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(NUMERIC_VALUE_OUT_OF_RANGE) {
                return LedgerError::AmountOverflow(context);
            }
        }
        LedgerError::Persistence {
            context,
            source: err,
        }
    }
}

/// Ledger store backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Open a connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(LedgerError::persistence("connect to database"))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Ledger schema migrations applied");
        Ok(())
    }

    async fn begin(&self, context: &str) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(LedgerError::persistence(format!("begin {}", context)))
    }

    async fn commit(tx: Transaction<'static, Postgres>, context: &str) -> Result<()> {
        tx.commit()
            .await
            .map_err(LedgerError::persistence(format!("commit {}", context)))
    }

    /// Lock the token row ahead of any address row
    async fn lock_token(
        tx: &mut Transaction<'static, Postgres>,
        token_id: TokenId,
        context: &str,
    ) -> Result<()> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM tokens WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(token_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(LedgerError::persistence(format!("lock token for {}", context)))?
        .map(|_| ())
        .ok_or(LedgerError::TokenNotFound(token_id))
    }

    /// Insert-if-absent for every address, inside the caller's transaction
    async fn materialize_addresses(
        tx: &mut Transaction<'static, Postgres>,
        token_id: TokenId,
        addresses: &[Uuid],
        context: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO addresses (token_id, id, balance)
            SELECT $1, address_id, 0 FROM UNNEST($2::uuid[]) AS address_id
            ON CONFLICT (token_id, id) DO NOTHING
            "#,
        )
        .bind(token_id)
        .bind(addresses)
        .execute(&mut **tx)
        .await
        .map_err(LedgerError::persistence(format!("create addresses for {}", context)))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_account_book(&self) -> Result<AccountBookId> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO account_books DEFAULT VALUES RETURNING id
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(LedgerError::persistence("create account book"))?;

        Ok(AccountBookId(id))
    }

    async fn insert_token(&self, book: Option<AccountBookId>, token: &NewToken) -> Result<Token> {
        let context = format!("create token {}", token.symbol);
        let mut tx = self.begin(&context).await?;

        let account_book_id = match book {
            Some(book_id) => {
                let exists = sqlx::query_scalar::<_, bool>(
                    r#"
                    SELECT EXISTS (SELECT 1 FROM account_books WHERE id = $1)
                    "#,
                )
                .bind(book_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(LedgerError::persistence(context.clone()))?;

                if !exists {
                    return Err(LedgerError::AccountBookNotFound(book_id));
                }
                book_id
            }
            None => {
                let id = sqlx::query_scalar::<_, Uuid>(
                    r#"
                    INSERT INTO account_books DEFAULT VALUES RETURNING id
                    "#,
                )
                .fetch_one(&mut *tx)
                .await
                .map_err(LedgerError::persistence(context.clone()))?;
                AccountBookId(id)
            }
        };

        let row = sqlx::query_as::<_, TokenRow>(&format!(
            r#"
            INSERT INTO tokens (account_book_id, name, symbol, decimals, total_supply)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            TOKEN_COLUMNS
        ))
        .bind(account_book_id)
        .bind(&token.name)
        .bind(&token.symbol)
        .bind(i16::from(token.decimals))
        .bind(token.total_supply)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if let sqlx::Error::Database(db) = &err {
                if db.is_unique_violation() {
                    return LedgerError::SymbolAlreadyExists(token.symbol.clone());
                }
            }
            LedgerError::Persistence {
                context: context.clone(),
                source: err,
            }
        })?;

        if token.total_supply > 0 {
            sqlx::query(
                r#"
                INSERT INTO addresses (token_id, id, balance) VALUES ($1, $2, $3)
                "#,
            )
            .bind(row.id)
            .bind(account_book_id.as_uuid())
            .bind(token.total_supply)
            .execute(&mut *tx)
            .await
            .map_err(LedgerError::persistence(format!("{} treasury", context)))?;
        }

        Self::commit(tx, &context).await?;

        row.try_into()
    }

    async fn token(&self, token_id: TokenId) -> Result<Option<Token>> {
        let row = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {} FROM tokens WHERE id = $1",
            TOKEN_COLUMNS
        ))
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::persistence(format!("get token {}", token_id)))?;

        row.map(Token::try_from).transpose()
    }

    async fn token_by_symbol(&self, symbol: &str) -> Result<Option<Token>> {
        let row = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {} FROM tokens WHERE symbol = $1",
            TOKEN_COLUMNS
        ))
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::persistence(format!("get token by symbol {}", symbol)))?;

        row.map(Token::try_from).transpose()
    }

    async fn ensure_address(&self, token_id: TokenId, address: AddressId) -> Result<Amount> {
        let context = format!("create address {} for token {}", address, token_id);

        sqlx::query(
            r#"
            INSERT INTO addresses (token_id, id, balance) VALUES ($1, $2, 0)
            ON CONFLICT (token_id, id) DO NOTHING
            "#,
        )
        .bind(token_id)
        .bind(address)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if let sqlx::Error::Database(db) = &err {
                if db.is_foreign_key_violation() {
                    return LedgerError::TokenNotFound(token_id);
                }
            }
            LedgerError::Persistence {
                context: context.clone(),
                source: err,
            }
        })?;

        // Separate statement: under READ COMMITTED it sees a row committed by a
        // concurrent insert that won the ON CONFLICT race
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT balance FROM addresses WHERE token_id = $1 AND id = $2
            "#,
        )
        .bind(token_id)
        .bind(address)
        .fetch_one(&self.pool)
        .await
        .map_err(LedgerError::persistence(context))
    }

    async fn transfer(
        &self,
        token_id: TokenId,
        sender: AddressId,
        recipient: AddressId,
        amount: Amount,
    ) -> Result<TransferOutcome> {
        let context = format!(
            "transfer {} of token {} from {} to {}",
            amount, token_id, sender, recipient
        );
        let mut tx = self.begin(&context).await?;

        let token_exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM tokens WHERE id = $1)
            "#,
        )
        .bind(token_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(LedgerError::persistence(context.clone()))?;

        if !token_exists {
            return Err(LedgerError::TokenNotFound(token_id));
        }

        // Ascending id, matching the lock order below
        let mut parties = [sender.as_uuid(), recipient.as_uuid()];
        parties.sort();
        Self::materialize_addresses(&mut tx, token_id, &parties, &context).await?;

        let locked = sqlx::query_as::<_, (Uuid, i64)>(
            r#"
            SELECT id, balance FROM addresses
            WHERE token_id = $1 AND id = ANY($2)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(token_id)
        .bind(&parties[..])
        .fetch_all(&mut *tx)
        .await
        .map_err(LedgerError::persistence(context.clone()))?;

        let sender_balance = locked
            .iter()
            .find(|(id, _)| *id == sender.as_uuid())
            .map(|(_, balance)| *balance)
            .unwrap_or(0);

        if sender_balance < amount {
            // Dropping the transaction rolls back the address inserts
            return Err(LedgerError::InsufficientBalance {
                operation: DebitOperation::Transfer,
                address: sender,
                attempted: amount,
                available: sender_balance,
            });
        }

        let sender_balance = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE addresses SET balance = balance - $3
            WHERE token_id = $1 AND id = $2
            RETURNING balance
            "#,
        )
        .bind(token_id)
        .bind(sender)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify(context.clone()))?;

        let recipient_balance = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE addresses SET balance = balance + $3
            WHERE token_id = $1 AND id = $2
            RETURNING balance
            "#,
        )
        .bind(token_id)
        .bind(recipient)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify(context.clone()))?;

        Self::commit(tx, &context).await?;

        Ok(TransferOutcome {
            // A self-transfer debits then credits the same row
            sender_balance: if sender == recipient {
                recipient_balance
            } else {
                sender_balance
            },
            recipient_balance,
        })
    }

    async fn mint(
        &self,
        token_id: TokenId,
        account: AddressId,
        amount: Amount,
    ) -> Result<SupplyChange> {
        let context = format!("mint {} of token {} to {}", amount, token_id, account);
        let mut tx = self.begin(&context).await?;

        let total_supply = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE tokens SET total_supply = total_supply + $2
            WHERE id = $1
            RETURNING total_supply
            "#,
        )
        .bind(token_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify(context.clone()))?
        .ok_or(LedgerError::TokenNotFound(token_id))?;

        let balance = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO addresses (token_id, id, balance) VALUES ($1, $2, $3)
            ON CONFLICT (token_id, id)
            DO UPDATE SET balance = addresses.balance + EXCLUDED.balance
            RETURNING balance
            "#,
        )
        .bind(token_id)
        .bind(account)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify(context.clone()))?;

        Self::commit(tx, &context).await?;

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
        let context = format!("burn {} of token {} from {}", amount, token_id, account);
        let mut tx = self.begin(&context).await?;

        Self::lock_token(&mut tx, token_id, &context).await?;
        Self::materialize_addresses(&mut tx, token_id, &[account.as_uuid()], &context).await?;

        let balance = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT balance FROM addresses WHERE token_id = $1 AND id = $2 FOR UPDATE
            "#,
        )
        .bind(token_id)
        .bind(account)
        .fetch_one(&mut *tx)
        .await
        .map_err(LedgerError::persistence(context.clone()))?;

        if balance < amount {
            return Err(LedgerError::InsufficientBalance {
                operation: DebitOperation::Burn,
                address: account,
                attempted: amount,
                available: balance,
            });
        }

        let balance = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE addresses SET balance = balance - $3
            WHERE token_id = $1 AND id = $2
            RETURNING balance
            "#,
        )
        .bind(token_id)
        .bind(account)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(LedgerError::persistence(context.clone()))?;

        let total_supply = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE tokens SET total_supply = total_supply - $2
            WHERE id = $1
            RETURNING total_supply
            "#,
        )
        .bind(token_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(LedgerError::persistence(context.clone()))?;

        Self::commit(tx, &context).await?;

        Ok(SupplyChange {
            balance,
            total_supply,
        })
    }

    async fn supply_audit(&self, token_id: TokenId) -> Result<Option<SupplyAudit>> {
        let row = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT
                t.total_supply,
                COALESCE(SUM(a.balance), 0)::BIGINT AS balance_sum,
                COUNT(a.id) AS address_count
            FROM tokens t
            LEFT JOIN addresses a ON a.token_id = t.id
            WHERE t.id = $1
            GROUP BY t.id, t.total_supply
            "#,
        )
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::persistence(format!("audit supply of token {}", token_id)))?;

        Ok(row.map(|row| SupplyAudit {
            token_id,
            total_supply: row.total_supply,
            balance_sum: row.balance_sum,
            address_count: row.address_count,
        }))
    }
}
