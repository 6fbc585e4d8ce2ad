//! End-to-end ledger behaviour against the in-memory store

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use token_ledger::{
    AddressId, DebitOperation, ErrorKind, LedgerError, LedgerService, MemoryLedgerStore, NewToken,
    TokenId,
};
use tokio_util::sync::CancellationToken;
use tracing::Dispatch;

fn create_test_ledger() -> LedgerService<MemoryLedgerStore> {
    LedgerService::new(Arc::new(MemoryLedgerStore::new()), Dispatch::none())
}

async fn create_gold(ledger: &LedgerService<MemoryLedgerStore>) -> TokenId {
    ledger.create_token("Gold", "GLD", 18, 0).await.unwrap().id
}

#[tokio::test]
async fn test_gold_scenario() {
    let ledger = create_test_ledger();
    let gld = create_gold(&ledger).await;
    let addr1 = AddressId::new();
    let addr2 = AddressId::new();

    ledger.mint(gld, addr1, 100).await.unwrap();
    assert_eq!(ledger.balance_of(gld, addr1).await.unwrap(), 100);
    assert_eq!(ledger.total_supply(gld).await.unwrap(), 100);

    assert!(ledger.transfer_from(gld, addr1, addr2, 40).await.unwrap());
    assert_eq!(ledger.balance_of(gld, addr1).await.unwrap(), 60);
    assert_eq!(ledger.balance_of(gld, addr2).await.unwrap(), 40);
    assert_eq!(ledger.total_supply(gld).await.unwrap(), 100);

    ledger.burn(gld, addr2, 10).await.unwrap();
    assert_eq!(ledger.balance_of(gld, addr2).await.unwrap(), 30);
    assert_eq!(ledger.total_supply(gld).await.unwrap(), 90);

    let err = ledger
        .transfer_from(gld, addr1, addr2, 1000)
        .await
        .unwrap_err();
    match err {
        LedgerError::InsufficientBalance {
            operation,
            address,
            attempted,
            available,
        } => {
            assert_eq!(operation, DebitOperation::Transfer);
            assert_eq!(address, addr1);
            assert_eq!(attempted, 1000);
            assert_eq!(available, 60);
        }
        other => panic!("expected insufficient balance, got {other:?}"),
    }
    assert_eq!(ledger.balance_of(gld, addr1).await.unwrap(), 60);
    assert_eq!(ledger.balance_of(gld, addr2).await.unwrap(), 30);

    let audit = ledger.audit_supply(gld).await.unwrap();
    assert!(audit.is_conserved());
    assert_eq!(audit.total_supply, 90);
}

#[tokio::test]
async fn test_token_metadata() {
    let ledger = create_test_ledger();
    let token = ledger.create_token("Gold", "GLD", 18, 0).await.unwrap();

    assert_eq!(ledger.token_id_by_symbol("GLD").await.unwrap(), token.id);
    assert_eq!(ledger.name(token.id).await.unwrap(), "Gold");
    assert_eq!(ledger.symbol(token.id).await.unwrap(), "GLD");
    assert_eq!(ledger.decimals(token.id).await.unwrap(), 18);
    assert_eq!(ledger.total_supply(token.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_token_is_not_found() {
    let ledger = create_test_ledger();
    let missing = TokenId::new();

    let err = ledger.token_id_by_symbol("NOPE").await.unwrap_err();
    assert!(matches!(err, LedgerError::SymbolNotFound(ref s) if s == "NOPE"));

    for err in [
        ledger.name(missing).await.unwrap_err(),
        ledger.decimals(missing).await.map(|_| ()).unwrap_err(),
        ledger.balance_of(missing, AddressId::new()).await.map(|_| ()).unwrap_err(),
        ledger.mint(missing, AddressId::new(), 1).await.unwrap_err(),
        ledger.burn(missing, AddressId::new(), 1).await.unwrap_err(),
        ledger
            .transfer_from(missing, AddressId::new(), AddressId::new(), 1)
            .await
            .map(|_| ())
            .unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::NotFound, "{err}");
    }
}

#[tokio::test]
async fn test_duplicate_symbol_conflicts() {
    let ledger = create_test_ledger();
    let original = ledger.create_token("Gold", "GLD", 18, 0).await.unwrap();
    ledger.mint(original.id, AddressId::new(), 7).await.unwrap();

    let err = ledger.create_token("Fool's Gold", "GLD", 2, 500).await.unwrap_err();
    assert!(matches!(err, LedgerError::SymbolAlreadyExists(ref s) if s == "GLD"));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let token = ledger.token(original.id).await.unwrap();
    assert_eq!(token.name, "Gold");
    assert_eq!(token.decimals, 18);
    assert_eq!(token.total_supply, 7);
    assert_eq!(ledger.token_id_by_symbol("GLD").await.unwrap(), original.id);
}

#[tokio::test]
async fn test_invalid_token_request_rejected() {
    let ledger = create_test_ledger();

    let err = ledger.create_token("Gold", "G L D", 18, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = ledger.create_token("Gold", "GLD", 18, -1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(ledger.token_id_by_symbol("GLD").await.is_err());
}

#[tokio::test]
async fn test_non_positive_amounts_rejected() {
    let ledger = create_test_ledger();
    let gld = create_gold(&ledger).await;
    let holder = AddressId::new();
    ledger.mint(gld, holder, 10).await.unwrap();

    for amount in [0, -1, i64::MIN] {
        assert!(matches!(
            ledger.mint(gld, holder, amount).await,
            Err(LedgerError::InvalidAmount(a)) if a == amount
        ));
        assert!(matches!(
            ledger.burn(gld, holder, amount).await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.transfer_from(gld, holder, AddressId::new(), amount).await,
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    assert_eq!(ledger.balance_of(gld, holder).await.unwrap(), 10);
    assert_eq!(ledger.total_supply(gld).await.unwrap(), 10);
}

#[tokio::test]
async fn test_burn_exceeding_balance_rejected() {
    let ledger = create_test_ledger();
    let gld = create_gold(&ledger).await;
    let holder = AddressId::new();
    ledger.mint(gld, holder, 5).await.unwrap();

    let err = ledger.burn(gld, holder, 6).await.unwrap_err();
    assert!(err.to_string().starts_with("burn amount exceeds balance"));
    assert!(!err.is_retryable());

    assert_eq!(ledger.balance_of(gld, holder).await.unwrap(), 5);
    assert_eq!(ledger.total_supply(gld).await.unwrap(), 5);
}

#[tokio::test]
async fn test_mint_overflow_rejected() {
    let ledger = create_test_ledger();
    let gld = create_gold(&ledger).await;
    let holder = AddressId::new();
    ledger.mint(gld, holder, i64::MAX).await.unwrap();

    let err = ledger.mint(gld, AddressId::new(), 1).await.unwrap_err();
    assert!(matches!(err, LedgerError::AmountOverflow(_)));
    assert_eq!(ledger.total_supply(gld).await.unwrap(), i64::MAX);
}

#[tokio::test]
async fn test_initial_supply_credited_to_treasury() {
    let ledger = create_test_ledger();
    let token = ledger.create_token("Silver", "SLV", 6, 1_000).await.unwrap();

    let treasury = ledger
        .resolve_address("SLV", token.account_book_id)
        .await
        .unwrap();
    assert_eq!(treasury, AddressId::from(token.account_book_id));
    assert_eq!(ledger.balance_of(token.id, treasury).await.unwrap(), 1_000);
    assert!(ledger.audit_supply(token.id).await.unwrap().is_conserved());
}

#[tokio::test]
async fn test_resolve_address_is_idempotent() {
    let ledger = create_test_ledger();
    let book = ledger.create_account_book().await.unwrap();
    let token = ledger
        .create_token_in_book(book, NewToken::new("Gold", "GLD", 18, 0))
        .await
        .unwrap();
    assert_eq!(token.account_book_id, book);

    let first = ledger.resolve_address("GLD", book).await.unwrap();
    let second = ledger.resolve_address("GLD", book).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(ledger.audit_supply(token.id).await.unwrap().address_count, 1);

    let other_book = ledger.create_account_book().await.unwrap();
    let err = ledger.resolve_address("GLD", other_book).await.unwrap_err();
    assert!(matches!(err, LedgerError::TokenNotInAccountBook { .. }));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = ledger.resolve_address("XYZ", book).await.unwrap_err();
    assert!(matches!(err, LedgerError::SymbolNotFound(_)));
}

#[tokio::test]
async fn test_create_token_in_missing_book() {
    let ledger = create_test_ledger();
    let err = ledger
        .create_token_in_book(
            token_ledger::AccountBookId::new(),
            NewToken::new("Gold", "GLD", 18, 0),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AccountBookNotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_touch_creates_one_address() {
    let ledger = create_test_ledger();
    let gld = create_gold(&ledger).await;
    let fresh = AddressId::new();

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.balance_of(gld, fresh).await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 0);
    }

    assert_eq!(ledger.audit_supply(gld).await.unwrap().address_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_conserve_supply() {
    let ledger = create_test_ledger();
    let gld = create_gold(&ledger).await;
    let holders: Vec<AddressId> = (0..4).map(|_| AddressId::new()).collect();
    for holder in &holders {
        ledger.mint(gld, *holder, 1_000).await.unwrap();
    }

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let ledger = ledger.clone();
            let from = holders[i % holders.len()];
            let to = holders[(i * 7 + 1) % holders.len()];
            tokio::spawn(async move { ledger.transfer_from(gld, from, to, 25).await })
        })
        .collect();

    for handle in handles {
        match handle.await.unwrap() {
            Ok(moved) => assert!(moved),
            Err(err) => assert_eq!(err.kind(), ErrorKind::InsufficientBalance),
        }
    }

    let audit = ledger.audit_supply(gld).await.unwrap();
    assert!(audit.is_conserved());
    assert_eq!(audit.total_supply, 4_000);
    for holder in &holders {
        assert!(ledger.balance_of(gld, *holder).await.unwrap() >= 0);
    }
}

#[tokio::test]
async fn test_cancelled_operation_leaves_no_state() {
    let ledger = create_test_ledger();
    let gld = create_gold(&ledger).await;
    let holder = AddressId::new();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let cancelled = ledger.with_cancellation(cancel);

    let err = cancelled.mint(gld, holder, 50).await.unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled));
    assert!(err.is_retryable());

    assert_eq!(ledger.total_supply(gld).await.unwrap(), 0);
    assert_eq!(ledger.audit_supply(gld).await.unwrap().address_count, 0);

    // The original handle is unaffected
    ledger.mint(gld, holder, 50).await.unwrap();
    assert_eq!(ledger.balance_of(gld, holder).await.unwrap(), 50);
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_logs_go_to_injected_dispatch() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();

    let ledger = LedgerService::new(
        Arc::new(MemoryLedgerStore::new()),
        Dispatch::new(subscriber),
    );
    let gld = ledger.create_token("Gold", "GLD", 18, 0).await.unwrap().id;
    let holder = AddressId::new();
    ledger.mint(gld, holder, 100).await.unwrap();
    let _ = ledger.burn(gld, holder, 500).await;

    let output = String::from_utf8(logs.0.lock().clone()).unwrap();
    assert!(output.contains("Created token GLD"), "{output}");
    assert!(output.contains("Minted 100"), "{output}");
    assert!(output.contains("insufficient_balance"), "{output}");
}
