use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::audit::AuditEventType;
use crate::error::QuorumError;
use crate::mpc::{PendingTransaction, SubmissionState, TxStatus};
use crate::notify::Notification;
use crate::tests::support::{AcceptAll, FlakyBackend, RecordingLedger, signers, start, start_on, wait_until};
use crate::types::{OperationType, SignerId, TxId, WalletId};

fn id(name: &str) -> SignerId {
    SignerId::from(name)
}

#[tokio::test]
async fn mint_reaches_quorum_on_second_signature() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B", "C"]), 2).unwrap();

    let tx_id = e
        .coordinator
        .propose_transaction(&wallet, &id("A"), "X", 5, OperationType::Mint, b"batch-42".to_vec())
        .unwrap();
    let tx = e.coordinator.get_transaction(&tx_id).unwrap();
    assert_eq!(tx.signatures, vec![id("A")]);
    assert_eq!(tx.status, TxStatus::Pending);
    assert_eq!(tx.required_signatures, 2);

    let tx = e.coordinator.sign_transaction(&tx_id, &id("B")).unwrap();
    assert_eq!(tx.signatures, vec![id("A"), id("B")]);
    assert_eq!(tx.status, TxStatus::Executed);
    assert_eq!(tx.executed_nonce, Some(1));
    assert_eq!(e.wallets.get_wallet(&wallet).unwrap().nonce, 1);

    let err = e.coordinator.sign_transaction(&tx_id, &id("C")).unwrap_err();
    assert!(matches!(err, QuorumError::State(_)));

    let ledger = h.ledger.clone();
    wait_until(|| ledger.submissions().len() == 1).await;
    let submitted = &h.ledger.submissions()[0];
    assert_eq!(submitted.nonce, 1);
    assert_eq!(submitted.wallet_id, wallet);
    assert_eq!(submitted.to, "X");
    assert_eq!(submitted.value, 5);
    assert_eq!(submitted.operation_type, OperationType::Mint);
    assert_eq!(submitted.payload, b"batch-42".to_vec());

    let coordinator = e.coordinator.clone();
    let tx_id_poll = tx_id.clone();
    wait_until(|| {
        matches!(
            coordinator.get_transaction(&tx_id_poll).unwrap().submission,
            Some(SubmissionState::Confirmed { .. })
        )
    })
    .await;

    assert!(h.notifier.events().contains(&Notification::QuorumReached {
        wallet_id: wallet.clone(),
        tx_id: tx_id.clone(),
        nonce: 1,
    }));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn double_signature_is_an_error_and_changes_nothing() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B", "C"]), 3).unwrap();
    let tx_id = e
        .coordinator
        .propose_transaction(&wallet, &id("A"), "X", 1, OperationType::Transfer, vec![])
        .unwrap();

    e.coordinator.sign_transaction(&tx_id, &id("B")).unwrap();
    let err = e.coordinator.sign_transaction(&tx_id, &id("B")).unwrap_err();
    assert!(matches!(err, QuorumError::AlreadySigned { .. }));

    // The proposer has implicitly signed already.
    let err = e.coordinator.sign_transaction(&tx_id, &id("A")).unwrap_err();
    assert!(matches!(err, QuorumError::AlreadySigned { .. }));

    let tx = e.coordinator.get_transaction(&tx_id).unwrap();
    assert_eq!(tx.signatures.len(), 2);
    assert_eq!(tx.status, TxStatus::Pending);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn proposal_checks_wallet_and_proposer() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B"]), 2).unwrap();

    let err = e
        .coordinator
        .propose_transaction(&WalletId::from("nope"), &id("A"), "X", 1, OperationType::Recall, vec![])
        .unwrap_err();
    assert!(matches!(err, QuorumError::NotFound(_)));

    let err = e
        .coordinator
        .propose_transaction(&wallet, &id("Mallory"), "X", 1, OperationType::Recall, vec![])
        .unwrap_err();
    assert!(matches!(err, QuorumError::Authorization(_)));

    e.wallets.deactivate(&wallet).unwrap();
    let err = e
        .coordinator
        .propose_transaction(&wallet, &id("A"), "X", 1, OperationType::Recall, vec![])
        .unwrap_err();
    assert!(matches!(err, QuorumError::WalletInactive(_)));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn outsider_cannot_sign_and_unknown_tx_is_not_found() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B"]), 2).unwrap();
    let tx_id = e
        .coordinator
        .propose_transaction(&wallet, &id("A"), "X", 1, OperationType::IoTUpdate, vec![])
        .unwrap();

    let err = e.coordinator.sign_transaction(&tx_id, &id("Z")).unwrap_err();
    assert!(matches!(err, QuorumError::Authorization(_)));
    assert_eq!(e.coordinator.get_transaction(&tx_id).unwrap().signatures.len(), 1);

    let err = e
        .coordinator
        .sign_transaction(&TxId::from("ghost"), &id("B"))
        .unwrap_err();
    assert!(matches!(err, QuorumError::NotFound(_)));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn single_signer_threshold_executes_on_proposal() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B"]), 1).unwrap();

    let tx_id = e
        .coordinator
        .propose_transaction(&wallet, &id("B"), "X", 3, OperationType::Transfer, vec![])
        .unwrap();
    let tx = e.coordinator.get_transaction(&tx_id).unwrap();
    assert_eq!(tx.status, TxStatus::Executed);
    assert_eq!(tx.executed_nonce, Some(1));
    assert_eq!(e.wallets.get_wallet(&wallet).unwrap().nonce, 1);

    let ledger = h.ledger.clone();
    wait_until(|| ledger.submissions().len() == 1).await;
    h.engine.shutdown().await;
}

#[tokio::test]
async fn rejection_is_terminal_and_keeps_nonce() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B", "C"]), 3).unwrap();
    let tx_id = e
        .coordinator
        .propose_transaction(&wallet, &id("A"), "X", 1, OperationType::Recall, vec![])
        .unwrap();

    let err = e.coordinator.reject_transaction(&tx_id, &id("Z")).unwrap_err();
    assert!(matches!(err, QuorumError::Authorization(_)));

    let tx = e.coordinator.reject_transaction(&tx_id, &id("C")).unwrap();
    assert_eq!(tx.status, TxStatus::Rejected);
    assert_eq!(tx.rejected_by, Some(id("C")));

    let err = e.coordinator.sign_transaction(&tx_id, &id("B")).unwrap_err();
    assert!(matches!(err, QuorumError::State(_)));
    let err = e.coordinator.reject_transaction(&tx_id, &id("B")).unwrap_err();
    assert!(matches!(err, QuorumError::State(_)));

    assert_eq!(e.wallets.get_wallet(&wallet).unwrap().nonce, 0);
    assert!(h.ledger.submissions().is_empty());
    assert!(h.notifier.events().contains(&Notification::Rejected {
        wallet_id: wallet,
        tx_id,
        by: id("C"),
    }));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn executed_transaction_cannot_be_rejected() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B"]), 2).unwrap();
    let tx_id = e
        .coordinator
        .propose_transaction(&wallet, &id("A"), "X", 1, OperationType::Mint, vec![])
        .unwrap();
    e.coordinator.sign_transaction(&tx_id, &id("B")).unwrap();

    let err = e.coordinator.reject_transaction(&tx_id, &id("A")).unwrap_err();
    assert!(matches!(err, QuorumError::State(_)));
    assert_eq!(e.coordinator.get_transaction(&tx_id).unwrap().status, TxStatus::Executed);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn expire_stale_only_touches_old_pending_transactions() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B", "C"]), 2).unwrap();

    let stale = e
        .coordinator
        .propose_transaction(&wallet, &id("A"), "X", 1, OperationType::Transfer, vec![])
        .unwrap();
    let executed = e
        .coordinator
        .propose_transaction(&wallet, &id("B"), "Y", 2, OperationType::Transfer, vec![])
        .unwrap();
    e.coordinator.sign_transaction(&executed, &id("C")).unwrap();

    // Nothing is old enough yet.
    assert!(e.coordinator.expire_stale(Utc::now()).unwrap().is_empty());

    let later = Utc::now() + Duration::seconds(61);
    let expired = e.coordinator.expire_stale(later).unwrap();
    assert_eq!(expired, vec![stale.clone()]);

    assert_eq!(e.coordinator.get_transaction(&stale).unwrap().status, TxStatus::Expired);
    assert_eq!(e.coordinator.get_transaction(&executed).unwrap().status, TxStatus::Executed);
    assert_eq!(e.wallets.get_wallet(&wallet).unwrap().nonce, 1);

    let err = e.coordinator.sign_transaction(&stale, &id("B")).unwrap_err();
    assert!(matches!(err, QuorumError::State(_)));

    // A second sweep finds nothing new.
    assert!(e.coordinator.expire_stale(later).unwrap().is_empty());
    assert!(h.notifier.events().contains(&Notification::Expired {
        wallet_id: wallet,
        tx_id: stale.clone(),
    }));
    let expiries = e
        .audit
        .for_subject(stale.as_str())
        .into_iter()
        .filter(|r| r.event_type == AuditEventType::Expiry)
        .count();
    assert_eq!(expiries, 1);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn list_pending_is_lazy_and_restartable() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B", "C"]), 3).unwrap();
    let other = e.wallets.create_wallet(signers(&["A", "B"]), 2).unwrap();

    let first = e
        .coordinator
        .propose_transaction(&wallet, &id("A"), "X", 1, OperationType::Transfer, vec![])
        .unwrap();
    e.coordinator
        .propose_transaction(&other, &id("A"), "X", 1, OperationType::Transfer, vec![])
        .unwrap();
    let second = e
        .coordinator
        .propose_transaction(&wallet, &id("B"), "Y", 2, OperationType::Mint, vec![])
        .unwrap();

    let pending = e.coordinator.list_pending(&wallet).unwrap();
    let ids: Vec<TxId> = pending.iter().map(|tx| tx.unwrap().tx_id).collect();
    assert_eq!(ids, vec![first.clone(), second.clone()]);

    e.coordinator.reject_transaction(&first, &id("C")).unwrap();

    // A new pass sees the current state.
    let ids: Vec<TxId> = (&pending).into_iter().map(|tx| tx.unwrap().tx_id).collect();
    assert_eq!(ids, vec![second]);

    let err = e.coordinator.list_pending(&WalletId::from("nope")).err().unwrap();
    assert!(matches!(err, QuorumError::NotFound(_)));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn list_pending_reports_a_failed_listing() {
    let backend = FlakyBackend::new();
    let h = start_on(backend.store(), RecordingLedger::new(), Arc::new(AcceptAll));
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B"]), 2).unwrap();
    let tx_id = e
        .coordinator
        .propose_transaction(&wallet, &id("A"), "X", 1, OperationType::Transfer, vec![])
        .unwrap();

    let pending = e.coordinator.list_pending(&wallet).unwrap();
    backend.fail_transaction_ids(true);
    let items: Vec<_> = pending.iter().collect();
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(QuorumError::Store(_))));
    assert!(pending.iter().collect::<Result<Vec<_>, _>>().is_err());

    backend.fail_transaction_ids(false);
    let ids: Vec<TxId> = pending.iter().map(|tx| tx.unwrap().tx_id).collect();
    assert_eq!(ids, vec![tx_id]);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn deactivated_wallet_blocks_execution_of_pending_transactions() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B", "C"]), 2).unwrap();
    let tx_id = e
        .coordinator
        .propose_transaction(&wallet, &id("A"), "X", 1, OperationType::Transfer, vec![])
        .unwrap();

    e.wallets.deactivate(&wallet).unwrap();

    let err = e.coordinator.sign_transaction(&tx_id, &id("B")).unwrap_err();
    assert!(matches!(err, QuorumError::WalletInactive(_)));
    let tx = e.coordinator.get_transaction(&tx_id).unwrap();
    assert_eq!(tx.status, TxStatus::Pending);
    assert_eq!(tx.signatures, vec![id("A")]);
    assert_eq!(e.wallets.get_wallet(&wallet).unwrap().nonce, 0);

    // The transaction can still be vetoed or left to expire.
    let tx = e.coordinator.reject_transaction(&tx_id, &id("C")).unwrap();
    assert_eq!(tx.status, TxStatus::Rejected);
    assert!(h.ledger.submissions().is_empty());
    h.engine.shutdown().await;
}

#[test]
fn transaction_is_stale_only_after_the_full_ttl() {
    let created = Utc::now();
    let ttl = Duration::seconds(60);
    let tx = PendingTransaction::propose(
        WalletId::from("w"),
        id("A"),
        "X".to_string(),
        1,
        OperationType::Transfer,
        vec![],
        2,
        created,
    );

    assert!(!tx.is_stale(created + ttl, ttl));
    assert!(tx.is_stale(created + ttl + Duration::milliseconds(1), ttl));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_signers_execute_exactly_once() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let names: Vec<String> = (0..8).map(|i| format!("S{i}")).collect();
    let all: Vec<SignerId> = names.iter().map(|n| SignerId::from(n.as_str())).collect();
    let wallet = e.wallets.create_wallet(all.clone(), 2).unwrap();

    let mut tx_ids = Vec::new();
    for _ in 0..5 {
        tx_ids.push(
            e.coordinator
                .propose_transaction(&wallet, &all[0], "X", 1, OperationType::Transfer, vec![])
                .unwrap(),
        );
    }

    for tx_id in &tx_ids {
        let outcomes: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = all[1..]
                .iter()
                .map(|signer| {
                    let coordinator = &e.coordinator;
                    s.spawn(move || coordinator.sign_transaction(tx_id, signer))
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        let winners = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "exactly one signer completes the quorum");
        assert!(
            outcomes
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|err| matches!(err, QuorumError::State(_)))
        );

        let tx = e.coordinator.get_transaction(tx_id).unwrap();
        assert_eq!(tx.status, TxStatus::Executed);
        assert_eq!(tx.signatures.len(), 2);
    }

    assert_eq!(e.wallets.get_wallet(&wallet).unwrap().nonce, 5);

    let mut nonces: Vec<u64> = tx_ids
        .iter()
        .map(|t| e.coordinator.get_transaction(t).unwrap().executed_nonce.unwrap())
        .collect();
    nonces.sort();
    assert_eq!(nonces, vec![1, 2, 3, 4, 5]);

    let ledger = h.ledger.clone();
    wait_until(|| ledger.submissions().len() == 5).await;
    let submitted: Vec<u64> = h.ledger.submissions().iter().map(|s| s.nonce).collect();
    assert_eq!(submitted, vec![1, 2, 3, 4, 5]);
    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_executions_on_one_wallet_reach_ledger_in_nonce_order() {
    let h = start(RecordingLedger::new());
    let e = &h.engine;
    let wallet = e.wallets.create_wallet(signers(&["A", "B"]), 2).unwrap();

    let tx_ids: Vec<TxId> = (0..10)
        .map(|i| {
            e.coordinator
                .propose_transaction(&wallet, &id("A"), "X", i, OperationType::Transfer, vec![])
                .unwrap()
        })
        .collect();

    std::thread::scope(|s| {
        for tx_id in &tx_ids {
            let coordinator = &e.coordinator;
            s.spawn(move || coordinator.sign_transaction(tx_id, &SignerId::from("B")).unwrap());
        }
    });

    let ledger = h.ledger.clone();
    wait_until(|| ledger.submissions().len() == 10).await;
    let nonces: Vec<u64> = h.ledger.submissions().iter().map(|s| s.nonce).collect();
    assert_eq!(nonces, (1..=10).collect::<Vec<u64>>());
    h.engine.shutdown().await;
}
