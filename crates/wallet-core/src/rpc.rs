//! JSON message interface for the extension UI.
//!
//! A request is `{"method": "...", "params": {...}}`; the reply is either
//! `{"status": "ok", "result": ...}` or
//! `{"status": "error", "kind": "...", "message": "..."}` where `kind` is
//! [`WalletError::kind`].

use chain_btc::AddressType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{CosignerInput, MultisigConfig, WalletEngine};
use crate::error::WalletError;
use crate::multisig::PaymentRequest;
use crate::types::{AccountId, Chain, PrivacySettings};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    ListAccounts,
    GetAccount {
        account: AccountId,
    },
    CreateHdAccount {
        name: String,
        address_type: AddressType,
    },
    CreateMultisigAccount {
        name: String,
        required: usize,
        total: usize,
        address_type: AddressType,
        cosigners: Vec<CosignerInput>,
    },
    MultisigXpub {
        address_type: AddressType,
        #[serde(default)]
        account_index: u32,
    },
    ExportXpub {
        account: AccountId,
    },
    ImportCosignerXpub {
        xpub: String,
    },
    DeriveAddress {
        account: AccountId,
        chain: Chain,
        index: u32,
    },
    AllocateReceiveAddress {
        account: AccountId,
    },
    AddressCandidates {
        wif: String,
    },
    Refresh {
        account: AccountId,
    },
    CancelRefresh {
        account: AccountId,
    },
    BuildTransaction {
        account: AccountId,
        recipient: String,
        amount_sat: u64,
        fee_rate_sat_vbyte: u64,
        #[serde(default)]
        keep_exact_amount: bool,
    },
    SignTransaction {
        account: AccountId,
        psbt: String,
    },
    MergePsbt {
        account: AccountId,
        a: String,
        b: String,
    },
    Finalize {
        account: AccountId,
        psbt: String,
    },
    Broadcast {
        account: AccountId,
        psbt: String,
    },
    CancelBroadcast {
        id: String,
    },
    BroadcastPendingNow {
        id: String,
    },
    ReconcilePending,
    ListPendingBroadcasts,
    GetTransaction {
        txid: String,
    },
    DiscardTransaction {
        account: AccountId,
        txid: String,
    },
    ExportPrivateKey {
        account: AccountId,
        #[serde(default)]
        password: Option<String>,
    },
    ImportPrivateKey {
        blob: String,
        #[serde(default)]
        password: Option<String>,
        address_type: AddressType,
        #[serde(default)]
        name: Option<String>,
    },
    GetPrivacySettings,
    SetPrivacySettings {
        settings: PrivacySettings,
    },
    SuggestAmount {
        amount_sat: u64,
    },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::ListAccounts => "list_accounts",
            Request::GetAccount { .. } => "get_account",
            Request::CreateHdAccount { .. } => "create_hd_account",
            Request::CreateMultisigAccount { .. } => "create_multisig_account",
            Request::MultisigXpub { .. } => "multisig_xpub",
            Request::ExportXpub { .. } => "export_xpub",
            Request::ImportCosignerXpub { .. } => "import_cosigner_xpub",
            Request::DeriveAddress { .. } => "derive_address",
            Request::AllocateReceiveAddress { .. } => "allocate_receive_address",
            Request::AddressCandidates { .. } => "address_candidates",
            Request::Refresh { .. } => "refresh",
            Request::CancelRefresh { .. } => "cancel_refresh",
            Request::BuildTransaction { .. } => "build_transaction",
            Request::SignTransaction { .. } => "sign_transaction",
            Request::MergePsbt { .. } => "merge_psbt",
            Request::Finalize { .. } => "finalize",
            Request::Broadcast { .. } => "broadcast",
            Request::CancelBroadcast { .. } => "cancel_broadcast",
            Request::BroadcastPendingNow { .. } => "broadcast_pending_now",
            Request::ReconcilePending => "reconcile_pending",
            Request::ListPendingBroadcasts => "list_pending_broadcasts",
            Request::GetTransaction { .. } => "get_transaction",
            Request::DiscardTransaction { .. } => "discard_transaction",
            Request::ExportPrivateKey { .. } => "export_private_key",
            Request::ImportPrivateKey { .. } => "import_private_key",
            Request::GetPrivacySettings => "get_privacy_settings",
            Request::SetPrivacySettings { .. } => "set_privacy_settings",
            Request::SuggestAmount { .. } => "suggest_amount",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { result: Value },
    Error { kind: String, message: String },
}

impl Response {
    fn from_result<T: Serialize>(result: Result<T, WalletError>) -> Self {
        match result.and_then(|value| {
            serde_json::to_value(value)
                .map_err(|e| WalletError::Internal(format!("serialize response: {e}")))
        }) {
            Ok(result) => Response::Ok { result },
            Err(e) => Response::Error {
                kind: e.kind().to_string(),
                message: e.to_string(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

/// Parses a JSON request and dispatches it. Unparseable input gets an
/// `invalid_request` error.
pub async fn handle_json(engine: &WalletEngine, json: &str) -> String {
    let response = match serde_json::from_str::<Request>(json) {
        Ok(request) => dispatch(engine, request).await,
        Err(e) => Response::Error {
            kind: "invalid_request".into(),
            message: e.to_string(),
        },
    };
    serde_json::to_string(&response).unwrap_or_else(|e| {
        format!(r#"{{"status":"error","kind":"internal","message":"{e}"}}"#)
    })
}

pub async fn dispatch(engine: &WalletEngine, request: Request) -> Response {
    // Params can hold passwords and keys; only the method is logged.
    let method = request.method();
    tracing::debug!(method, "rpc request");
    let response = match request {
        Request::ListAccounts => Response::from_result(Ok(engine.accounts())),
        Request::GetAccount { account } => Response::from_result(engine.account(account)),
        Request::CreateHdAccount { name, address_type } => {
            Response::from_result(engine.create_hd_account(&name, address_type))
        }
        Request::CreateMultisigAccount {
            name,
            required,
            total,
            address_type,
            cosigners,
        } => Response::from_result(engine.create_multisig_account(
            &name,
            MultisigConfig { required, total },
            address_type,
            &cosigners,
        )),
        Request::MultisigXpub {
            address_type,
            account_index,
        } => Response::from_result(engine.multisig_xpub(address_type, account_index)),
        Request::ExportXpub { account } => Response::from_result(engine.export_xpub(account)),
        Request::ImportCosignerXpub { xpub } => {
            Response::from_result(engine.import_cosigner_xpub(&xpub))
        }
        Request::DeriveAddress {
            account,
            chain,
            index,
        } => Response::from_result(engine.derive_address(account, chain, index)),
        Request::AllocateReceiveAddress { account } => {
            Response::from_result(engine.allocate_receive_address(account))
        }
        Request::AddressCandidates { wif } => {
            Response::from_result(engine.address_candidates(&wif))
        }
        Request::Refresh { account } => Response::from_result(engine.refresh_account(account).await),
        Request::CancelRefresh { account } => {
            Response::from_result(Ok(engine.cancel_refresh(account)))
        }
        Request::BuildTransaction {
            account,
            recipient,
            amount_sat,
            fee_rate_sat_vbyte,
            keep_exact_amount,
        } => Response::from_result(engine.build_transaction(
            account,
            &PaymentRequest {
                recipient,
                amount_sat,
                fee_rate_sat_vbyte,
            },
            keep_exact_amount,
        )),
        Request::SignTransaction { account, psbt } => {
            Response::from_result(engine.sign_transaction(account, &psbt))
        }
        Request::MergePsbt { account, a, b } => {
            Response::from_result(engine.merge_psbt(account, &a, &b))
        }
        Request::Finalize { account, psbt } => {
            Response::from_result(engine.finalize(account, &psbt))
        }
        Request::Broadcast { account, psbt } => {
            Response::from_result(engine.broadcast(account, &psbt).await)
        }
        Request::CancelBroadcast { id } => Response::from_result(engine.cancel_broadcast(&id).await),
        Request::BroadcastPendingNow { id } => {
            Response::from_result(engine.broadcast_pending_now(&id).await)
        }
        Request::ReconcilePending => Response::from_result(engine.reconcile_pending().await),
        Request::ListPendingBroadcasts => Response::from_result(Ok(engine.pending_broadcasts())),
        Request::GetTransaction { txid } => Response::from_result(engine.transaction(&txid)),
        Request::DiscardTransaction { account, txid } => {
            Response::from_result(engine.discard_transaction(account, &txid).await)
        }
        Request::ExportPrivateKey { account, password } => {
            Response::from_result(engine.export_private_key(account, password.as_deref()))
        }
        Request::ImportPrivateKey {
            blob,
            password,
            address_type,
            name,
        } => Response::from_result(engine.import_private_key(
            &blob,
            password.as_deref(),
            address_type,
            name.as_deref(),
        )),
        Request::GetPrivacySettings => Response::from_result(Ok(engine.privacy_settings())),
        Request::SetPrivacySettings { settings } => {
            Response::from_result(engine.set_privacy_settings(settings))
        }
        Request::SuggestAmount { amount_sat } => {
            Response::from_result(Ok(engine.suggest_amount(amount_sat)))
        }
    };
    if let Response::Error { kind, .. } = &response {
        tracing::warn!(method, %kind, "rpc request failed");
    }
    response
}
