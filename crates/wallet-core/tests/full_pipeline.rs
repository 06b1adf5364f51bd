//! End-to-end tests through the public engine API:
//! mnemonic -> account -> sync -> build -> sign -> broadcast, plus key
//! backups and cosigner key handling.

mod common;

use std::sync::Arc;

use common::*;
use serde_json::Value;
use wallet_core::backup::FREE_ATTEMPTS;
use wallet_core::scheduler::ManualClock;
use wallet_core::types::PsbtState;
use wallet_core::*;

// ─── Single-sig: derive -> build -> sign -> broadcast ──────────────

#[tokio::test]
async fn hd_account_full_pipeline() {
    let backend = backend();
    let engine = engine(Some(TEST_MNEMONIC), &backend);
    let (account, address) = funded_account(&engine, &backend, &[500_000]).await;

    assert!(address.starts_with("tb1q"));
    assert_eq!(
        engine.derive_address(account, Chain::External, 0).unwrap().address,
        address
    );

    let built = engine
        .build_transaction(
            account,
            &PaymentRequest {
                recipient: RECIPIENT.into(),
                amount_sat: 100_000,
                fee_rate_sat_vbyte: 2,
            },
            false,
        )
        .unwrap();
    // Privacy features are off by default, so the round amount is kept.
    assert_eq!(built.amount_sat, 100_000);
    assert_eq!(built.inputs.len(), 1);
    assert!(built.change_sat > 0);
    assert!(!built.privacy_degraded);

    let signed = engine.sign_transaction(account, &built.psbt).unwrap();
    assert_eq!(signed.state, PsbtState::FullySigned { signatures: 1 });

    let outcome = engine.broadcast(account, &signed.psbt).await.unwrap();
    let BroadcastOutcome::Broadcast { id, .. } = outcome else {
        panic!("expected an immediate broadcast, got {outcome:?}");
    };
    assert_eq!(id, built.txid);
    assert_eq!(backend.broadcasts().len(), 1);
    assert_eq!(backend.balance(RECIPIENT), 100_000);
    assert_eq!(engine.transaction(&built.txid).unwrap().state, PsbtState::Broadcast);

    let report = engine.refresh(account, CancelToken::new()).await.unwrap();
    assert_eq!(report.balance_sat, built.change_sat);
    assert_eq!(
        built.amount_sat + built.fee_sat + built.change_sat,
        500_000
    );
}

#[tokio::test]
async fn refresh_discovers_funds_beyond_issued_addresses() {
    let backend = backend();
    let engine = engine(Some(TEST_MNEMONIC), &backend);
    let account = engine
        .create_hd_account("Main", AddressType::NativeSegwit)
        .unwrap();

    let ahead = engine.derive_address(account.id, Chain::External, 7).unwrap();
    backend.fund(&ahead.address, 42_000, 1).unwrap();

    let report = engine.refresh(account.id, CancelToken::new()).await.unwrap();
    assert_eq!(report.balance_sat, 42_000);
    assert!(report.interrupted.is_none());

    let record = engine.account(account.id).unwrap();
    assert_eq!(record.account.external_index, 8);
    assert!(record.address(Chain::External, 7).unwrap().used);
}

#[tokio::test]
async fn spending_more_than_the_balance_fails() {
    let backend = backend();
    let engine = engine(Some(TEST_MNEMONIC), &backend);
    let (account, _) = funded_account(&engine, &backend, &[10_000]).await;

    let err = engine
        .build_transaction(
            account,
            &PaymentRequest {
                recipient: RECIPIENT.into(),
                amount_sat: 20_000,
                fee_rate_sat_vbyte: 1,
            },
            false,
        )
        .unwrap_err();
    assert_eq!(err.kind(), "insufficient_funds");
}

#[test]
fn receive_gap_limit_is_enforced() {
    let backend = backend();
    let engine = engine(Some(TEST_MNEMONIC), &backend);
    let account = engine
        .create_hd_account("Main", AddressType::Segwit)
        .unwrap();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..20 {
        let issued = engine.allocate_receive_address(account.id).unwrap();
        assert!(seen.insert(issued.address));
    }
    let err = engine.allocate_receive_address(account.id).unwrap_err();
    assert_eq!(err.kind(), "gap_limit_exceeded");
}

#[test]
fn generated_mnemonic_restores_the_same_accounts() {
    let backend = backend();
    let (fresh, phrase) =
        WalletEngine::create_with_new_mnemonic(config(), None, "", 24, backend.clone()).unwrap();
    assert_eq!(phrase.split_whitespace().count(), 24);
    let restored = engine(Some(&phrase), &backend);

    let a = fresh.create_hd_account("Main", AddressType::NativeSegwit).unwrap();
    let b = restored.create_hd_account("Main", AddressType::NativeSegwit).unwrap();
    assert_eq!(
        fresh.allocate_receive_address(a.id).unwrap().address,
        restored.allocate_receive_address(b.id).unwrap().address
    );

    let err = WalletEngine::create_with_new_mnemonic(config(), None, "", 15, backend.clone())
        .err()
        .unwrap();
    assert_eq!(err.kind(), "invalid_mnemonic");
}

// ─── Key backups ───────────────────────────────────────────────────

#[tokio::test]
async fn encrypted_export_imports_to_the_same_address() {
    let backend = backend();
    let source = engine(Some(TEST_MNEMONIC), &backend);
    let account = source
        .create_hd_account("Savings", AddressType::NativeSegwit)
        .unwrap();
    let first = source
        .derive_address(account.id, Chain::External, 0)
        .unwrap()
        .address;

    let exported = source
        .export_private_key(account.id, Some("correct horse battery"))
        .unwrap();
    assert!(exported.qr_payload.is_none());
    let doc: Value = serde_json::from_str(&exported.backup).unwrap();
    assert_eq!(doc["version"], 1);
    assert_eq!(doc["account_name"], "Savings");
    assert_eq!(doc["address_type"], "native-segwit");
    assert_eq!(doc["first_address"], first.as_str());
    assert_eq!(doc["key"]["format"], "encrypted");
    assert!(doc["key"]["iterations"].as_u64().unwrap() >= 100_000);
    let plain = source.export_private_key(account.id, None).unwrap();
    let wif = plain.qr_payload.clone().unwrap();
    assert!(!exported.backup.contains(&wif));

    let target = engine(None, &backend);
    let imported = target
        .import_private_key(
            &exported.backup,
            Some("correct horse battery"),
            AddressType::NativeSegwit,
            None,
        )
        .unwrap();
    assert_eq!(imported.name, "Savings");
    assert!(matches!(imported.kind, AccountKind::ImportedSingle { compressed: true, .. }));
    let record = target.account(imported.id).unwrap();
    assert_eq!(record.addresses[0].address, first);

    // The imported key spends what the HD key received.
    backend.fund(&first, 80_000, 2).unwrap();
    target.refresh(imported.id, CancelToken::new()).await.unwrap();
    let built = target
        .build_transaction(
            imported.id,
            &PaymentRequest {
                recipient: RECIPIENT.into(),
                amount_sat: 30_000,
                fee_rate_sat_vbyte: 1,
            },
            false,
        )
        .unwrap();
    assert!(built.non_hd_change);
    assert_eq!(built.change_address.as_deref(), Some(first.as_str()));
    let signed = target.sign_transaction(imported.id, &built.psbt).unwrap();
    target.broadcast(imported.id, &signed.psbt).await.unwrap();
    assert_eq!(backend.balance(RECIPIENT), 30_000);
}

#[test]
fn plaintext_export_carries_the_wif_as_qr_payload() {
    let backend = backend();
    let source = engine(Some(TEST_MNEMONIC), &backend);
    let account = source
        .create_hd_account("Main", AddressType::Legacy)
        .unwrap();
    let exported = source.export_private_key(account.id, None).unwrap();

    let wif = exported.qr_payload.clone().unwrap();
    assert!(wif.starts_with('c'));
    let doc: Value = serde_json::from_str(&exported.backup).unwrap();
    assert_eq!(doc["key"]["format"], "plaintext");
    assert_eq!(doc["key"]["wif"], wif.as_str());

    // A bare WIF imports too, with the candidates listed up front.
    let target = engine(None, &backend);
    let candidates = target.address_candidates(&wif).unwrap();
    assert_eq!(candidates.candidates.len(), 3);
    let imported = target
        .import_private_key(&wif, None, AddressType::Legacy, Some("Paper"))
        .unwrap();
    assert_eq!(imported.name, "Paper");
    assert_eq!(
        target.account(imported.id).unwrap().addresses[0].address,
        doc["first_address"].as_str().unwrap()
    );
}

#[test]
fn duplicate_and_multisig_imports_are_rejected() {
    let backend = backend();
    let source = engine(Some(TEST_MNEMONIC), &backend);
    let account = source
        .create_hd_account("Main", AddressType::NativeSegwit)
        .unwrap();
    let exported = source.export_private_key(account.id, None).unwrap();

    let target = engine(None, &backend);
    target
        .import_private_key(&exported.backup, None, AddressType::NativeSegwit, None)
        .unwrap();
    let err = target
        .import_private_key(&exported.backup, None, AddressType::NativeSegwit, None)
        .unwrap_err();
    assert_eq!(err.kind(), "duplicate_key");

    let err = target
        .import_private_key(&exported.backup, None, AddressType::P2wsh, None)
        .unwrap_err();
    assert_eq!(err.kind(), "incompatible_address_type");
    assert_eq!(target.accounts().len(), 1);
}

#[test]
fn racing_imports_of_one_key_create_one_account() {
    let backend = backend();
    let source = engine(Some(TEST_MNEMONIC), &backend);
    let account = source
        .create_hd_account("Main", AddressType::NativeSegwit)
        .unwrap();
    let exported = source.export_private_key(account.id, None).unwrap();
    let target = engine(None, &backend);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    target.import_private_key(&exported.backup, None, AddressType::NativeSegwit, None)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.kind(), "duplicate_key");
    }
    assert_eq!(target.accounts().len(), 1);
}

#[test]
fn wrong_passwords_lock_out_imports() {
    let backend = backend();
    let source = engine(Some(TEST_MNEMONIC), &backend);
    let account = source
        .create_hd_account("Main", AddressType::NativeSegwit)
        .unwrap();
    let exported = source
        .export_private_key(account.id, Some("right password"))
        .unwrap();

    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let target = engine(None, &backend).with_clock(clock.clone());
    for _ in 0..FREE_ATTEMPTS {
        let err = target
            .import_private_key(
                &exported.backup,
                Some("wrong password"),
                AddressType::NativeSegwit,
                None,
            )
            .unwrap_err();
        assert_eq!(err.kind(), "decryption_failed");
    }

    // Locked out even with the right password.
    let err = target
        .import_private_key(
            &exported.backup,
            Some("right password"),
            AddressType::NativeSegwit,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, WalletError::RateLimited { retry_after_secs: 30 }));

    clock.advance(31);
    target
        .import_private_key(
            &exported.backup,
            Some("right password"),
            AddressType::NativeSegwit,
            None,
        )
        .unwrap();
}

#[test]
fn multisig_accounts_cannot_export_a_private_key() {
    let backend = backend();
    let engine = engine(Some(TEST_MNEMONIC), &backend);
    let ours = engine.multisig_xpub(AddressType::P2wsh, 0).unwrap();
    let other = common::engine(Some(SECOND_MNEMONIC), &backend)
        .multisig_xpub(AddressType::P2wsh, 0)
        .unwrap();
    let cosigners: Vec<CosignerInput> = [ours, other]
        .into_iter()
        .map(|x| CosignerInput {
            xpub: x.xpub,
            fingerprint: Some(x.fingerprint),
            derivation_path: Some(x.derivation_path),
            nickname: String::new(),
        })
        .collect();
    let account = engine
        .create_multisig_account(
            "Joint",
            MultisigConfig { required: 1, total: 2 },
            AddressType::P2wsh,
            &cosigners,
        )
        .unwrap();
    let err = engine.export_private_key(account.id, None).unwrap_err();
    assert_eq!(err.kind(), "unsupported");
}

// ─── Extended public keys ──────────────────────────────────────────

#[test]
fn slip132_keys_normalize_to_tpub() {
    let backend = backend();
    let engine = engine(Some(TEST_MNEMONIC), &backend);

    let export = engine.multisig_xpub(AddressType::P2wsh, 0).unwrap();
    assert!(export.xpub.starts_with("Vpub"));
    assert!(export.standard_xpub.starts_with("tpub"));
    assert_eq!(export.derivation_path, "m/48'/1'/0'/2'");

    let info = engine.import_cosigner_xpub(&export.xpub).unwrap();
    assert_eq!(info.xpub, export.standard_xpub);
    assert_eq!(info.depth, 4);
    assert_eq!(engine.import_cosigner_xpub(&export.standard_xpub).unwrap(), info);

    let err = engine.import_cosigner_xpub("Vpub-not-a-key").unwrap_err();
    assert_eq!(err.kind(), "invalid_xpub");
}

#[test]
fn hd_account_exports_its_slip132_xpub() {
    let backend = backend();
    let engine = engine(Some(TEST_MNEMONIC), &backend);
    let account = engine
        .create_hd_account("Main", AddressType::NativeSegwit)
        .unwrap();
    let export = engine.export_xpub(account.id).unwrap();
    assert!(export.xpub.starts_with("vpub"));
    assert_eq!(export.derivation_path, "m/84'/1'/0'");
    assert_eq!(export.fingerprint, "73c5da0a");

    let second = engine
        .create_hd_account("Second", AddressType::NativeSegwit)
        .unwrap();
    assert_eq!(
        engine.export_xpub(second.id).unwrap().derivation_path,
        "m/84'/1'/1'"
    );
}
