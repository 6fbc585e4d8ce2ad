//! Core types for the token ledger
//!
//! Identifiers are UUID newtypes so a token id can never be passed where an
//! address is expected. Amounts are whole base units (`i64`); `decimals`
//! only affects how a client renders them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Token amount in base units
pub type Amount = i64;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
            sqlx::Type,
        )]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Account book identifier (namespace grouping tokens)
    AccountBookId
);

uuid_id!(
    /// Token identifier
    TokenId
);

uuid_id!(
    /// Balance holder identifier, scoped to a token
    AddressId
);

impl From<AccountBookId> for AddressId {
    /// The treasury address of an account book shares the book's id.
    fn from(book: AccountBookId) -> Self {
        AddressId(book.0)
    }
}

/// Fungible token definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Token ID
    pub id: TokenId,

    /// Owning account book
    pub account_book_id: AccountBookId,

    /// Display name (not unique)
    pub name: String,

    /// Ticker symbol (unique across all tokens)
    pub symbol: String,

    /// Digits used for user representation; fixed at creation
    pub decimals: u8,

    /// Sum of all address balances
    pub total_supply: Amount,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Token creation request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewToken {
    /// Display name
    #[validate(length(min = 1, max = 64))]
    pub name: String,

    /// Ticker symbol
    #[validate(length(min = 1, max = 16), custom = "validate_symbol")]
    pub symbol: String,

    /// Decimals (ERC20 default is 18)
    pub decimals: u8,

    /// Initial supply, credited to the account book's treasury address
    #[validate(range(min = 0))]
    pub total_supply: i64,
}

impl NewToken {
    /// Build a creation request
    pub fn new(
        name: impl Into<String>,
        symbol: impl Into<String>,
        decimals: u8,
        total_supply: Amount,
    ) -> Self {
        Self {
            name: name.into(),
            symbol: symbol.into(),
            decimals,
            total_supply,
        }
    }
}

fn validate_symbol(symbol: &str) -> Result<(), ValidationError> {
    if symbol.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("symbol_whitespace"));
    }
    Ok(())
}

/// Balance-reducing operations that can be rejected for insufficient funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebitOperation {
    /// Sender side of a transfer
    Transfer,
    /// Burn from an account
    Burn,
}

impl fmt::Display for DebitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebitOperation::Transfer => write!(f, "transfer"),
            DebitOperation::Burn => write!(f, "burn"),
        }
    }
}

/// Balances after a committed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Sender balance after the debit
    pub sender_balance: Amount,
    /// Recipient balance after the credit
    pub recipient_balance: Amount,
}

/// Balance and supply after a committed mint or burn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupplyChange {
    /// Account balance after the change
    pub balance: Amount,
    /// Token supply after the change
    pub total_supply: Amount,
}

/// Snapshot comparing recorded supply with the sum of balances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyAudit {
    /// Audited token
    pub token_id: TokenId,
    /// Recorded total supply
    pub total_supply: Amount,
    /// Σ(balance) over all addresses of the token
    pub balance_sum: Amount,
    /// Number of materialised addresses
    pub address_count: i64,
}

impl SupplyAudit {
    /// Supply conservation holds
    pub fn is_conserved(&self) -> bool {
        self.total_supply == self.balance_sum
    }
}
