//! The wallet engine: every operation the UI can ask for.
//!
//! [`WalletEngine`] ties the store, the chain backend and the broadcast
//! scheduler together. Each mutating operation persists the store before
//! it returns.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use chain_btc::multisig::validate_threshold;
use chain_btc::wif::WifKey;
use chain_btc::AddressType;
use chrono::Utc;
use parking_lot::Mutex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::backend::{AddressActivity, ChainBackend};
use crate::backup::{self, BackupInfo, ExportedKey, PasswordGuard};
use crate::change::{self, GAP_LIMIT};
use crate::config::EngineConfig;
use crate::derivation::{
    self, multisig_account_path, normalize_xpub, single_sig_account_path, to_slip132,
};
use crate::error::WalletError;
use crate::key_material::{format_path, parse_path, KeyMaterial, SeedKey};
use crate::mnemonic::{generate_mnemonic, mnemonic_to_seed};
use crate::multisig::{self, BuiltTransaction, FinalizedTransaction, PaymentRequest, SignedTransaction};
use crate::privacy::{self, CancelToken, Interrupted, TimingJitter};
use crate::resolver::{self, Resolution};
use crate::scheduler::{BroadcastScheduler, Clock, ReconcileReport, SystemClock};
use crate::store::WalletStore;
use crate::types::{
    Account, AccountId, AccountKind, AccountRecord, Chain, Cosigner, IssuedAddress,
    PendingBroadcast, PendingState, PrivacySettings, PsbtRecord, WalletUtxo,
};

/// An extended public key to hand to other wallets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpubExport {
    /// SLIP-132 rendering matching the address type (`zpub`, `Vpub`, …).
    pub xpub: String,
    /// Plain `xpub`/`tpub` rendering.
    pub standard_xpub: String,
    pub fingerprint: String,
    pub derivation_path: String,
}

/// A validated cosigner key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosignerInfo {
    /// Fingerprint of the extended key itself.
    pub fingerprint: String,
    /// Normalized `xpub`/`tpub`.
    pub xpub: String,
    pub depth: u8,
}

/// One cosigner as supplied when creating a multisig account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosignerInput {
    /// Any SLIP-132 flavour.
    pub xpub: String,
    /// Master fingerprint; with `derivation_path`, the key origin. When
    /// either is missing the xpub itself is used as the origin.
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub derivation_path: Option<String>,
    #[serde(default)]
    pub nickname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigConfig {
    pub required: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Addresses queried.
    pub scanned: usize,
    pub utxos: usize,
    pub balance_sat: u64,
    /// Set when the refresh stopped early; the results gathered so far are
    /// kept.
    pub interrupted: Option<Interrupted>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BroadcastOutcome {
    Broadcast { id: String, txid: String },
    Scheduled { id: String, txid: String, due_at: i64 },
}

pub struct WalletEngine {
    config: EngineConfig,
    store: Arc<WalletStore>,
    backend: Arc<dyn ChainBackend>,
    scheduler: Arc<BroadcastScheduler>,
    clock: Arc<dyn Clock>,
    guard: PasswordGuard,
    secp: Secp256k1<All>,
    /// Cancellation token shared by the refreshes running per account, with
    /// how many are running.
    refreshes: Mutex<HashMap<AccountId, (CancelToken, usize)>>,
}

/// Unregisters a refresh when it ends or its future is dropped.
struct RefreshRegistration<'a> {
    refreshes: &'a Mutex<HashMap<AccountId, (CancelToken, usize)>>,
    account_id: AccountId,
    token: CancelToken,
}

impl Drop for RefreshRegistration<'_> {
    fn drop(&mut self) {
        let mut refreshes = self.refreshes.lock();
        if let Entry::Occupied(mut entry) = refreshes.entry(self.account_id) {
            // A cancel may have replaced the entry already.
            if entry.get().0.same_as(&self.token) {
                entry.get_mut().1 -= 1;
                if entry.get().1 == 0 {
                    entry.remove();
                }
            }
        }
    }
}

impl WalletEngine {
    /// Creates a new wallet. With `path` the store is an encrypted file,
    /// otherwise it lives in memory. `mnemonic` seeds the HD accounts; a
    /// wallet without one holds imported keys only.
    pub fn create(
        config: EngineConfig,
        path: Option<&Path>,
        password: &str,
        mnemonic: Option<&str>,
        backend: Arc<dyn ChainBackend>,
    ) -> Result<Self, WalletError> {
        config.validate()?;
        let store = match path {
            Some(path) => WalletStore::create(
                path,
                password.as_bytes(),
                &config.store_kdf,
                config.network,
                config.privacy,
            )?,
            None => WalletStore::in_memory(config.network, config.privacy),
        };
        if let Some(phrase) = mnemonic {
            store.set_seed(mnemonic_to_seed(phrase, "")?);
            store.persist()?;
        }
        Ok(Self::assemble(config, Arc::new(store), backend))
    }

    /// Creates a wallet on a freshly generated mnemonic of `word_count`
    /// words (12 or 24). The phrase is returned once, for the user to
    /// write down; the store keeps only the seed.
    pub fn create_with_new_mnemonic(
        config: EngineConfig,
        path: Option<&Path>,
        password: &str,
        word_count: usize,
        backend: Arc<dyn ChainBackend>,
    ) -> Result<(Self, Zeroizing<String>), WalletError> {
        let phrase = generate_mnemonic(word_count)?;
        let engine = Self::create(config, path, password, Some(&phrase), backend)?;
        Ok((engine, phrase))
    }

    /// Opens an existing wallet file. Call [`WalletEngine::reconcile_pending`]
    /// afterwards to settle broadcasts interrupted by the last shutdown.
    pub fn open(
        config: EngineConfig,
        path: &Path,
        password: &str,
        backend: Arc<dyn ChainBackend>,
    ) -> Result<Self, WalletError> {
        config.validate()?;
        let store = WalletStore::open(path, password.as_bytes())?;
        config.network.ensure_matches(store.network())?;
        Ok(Self::assemble(config, Arc::new(store), backend))
    }

    fn assemble(config: EngineConfig, store: Arc<WalletStore>, backend: Arc<dyn ChainBackend>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let scheduler = Arc::new(BroadcastScheduler::new(
            store.clone(),
            backend.clone(),
            clock.clone(),
        ));
        Self {
            config,
            store,
            backend,
            scheduler,
            clock,
            guard: PasswordGuard::new(),
            secp: Secp256k1::new(),
            refreshes: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the clock used for due dates and lockouts.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.scheduler = Arc::new(BroadcastScheduler::new(
            self.store.clone(),
            self.backend.clone(),
            clock.clone(),
        ));
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<WalletStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<BroadcastScheduler> {
        &self.scheduler
    }

    fn seed_key(&self) -> Result<SeedKey, WalletError> {
        let seed = self
            .store
            .seed()
            .ok_or_else(|| WalletError::Unsupported("wallet has no seed".into()))?;
        SeedKey::new(seed, self.config.network, &self.secp)
    }

    // ─── Accounts ───────────────────────────────────────────────────────

    pub fn accounts(&self) -> Vec<Account> {
        self.store.accounts()
    }

    pub fn account(&self, id: AccountId) -> Result<AccountRecord, WalletError> {
        self.store.account_record(id)
    }

    /// Adds the next BIP44/49/84 account for `address_type`.
    pub fn create_hd_account(
        &self,
        name: &str,
        address_type: AddressType,
    ) -> Result<Account, WalletError> {
        let seed = self.seed_key()?;
        let account_index = self
            .accounts()
            .iter()
            .filter(|a| {
                a.address_type == address_type && matches!(a.kind, AccountKind::HdSingle { .. })
            })
            .count() as u32;
        let path = single_sig_account_path(address_type, self.config.network, account_index)?;
        let xpub = seed.xpub_at(&path, &self.secp)?;

        let account = self.store.insert_account(|id| {
            Ok(AccountRecord::new(Account {
                id,
                name: name.to_string(),
                kind: AccountKind::HdSingle {
                    account_index,
                    master_fingerprint: seed.fingerprint().to_string(),
                    account_xpub: xpub.to_string(),
                    derivation_path: format_path(&path),
                },
                address_type,
                network: self.config.network,
                external_index: 0,
                internal_index: 0,
                created_at: Utc::now(),
            }))
        })?;
        self.store.persist()?;
        tracing::info!(account = account.id, %address_type, path = %format_path(&path), "created HD account");
        Ok(account)
    }

    /// Checks a cosigner's extended public key and reports its fingerprint.
    pub fn import_cosigner_xpub(&self, xpub: &str) -> Result<CosignerInfo, WalletError> {
        let normalized = normalize_xpub(xpub, self.config.network)?;
        Ok(CosignerInfo {
            fingerprint: normalized.fingerprint().to_string(),
            xpub: normalized.to_string(),
            depth: normalized.depth,
        })
    }

    /// This wallet's BIP48/BIP45 key for joining a multisig account.
    pub fn multisig_xpub(
        &self,
        address_type: AddressType,
        account_index: u32,
    ) -> Result<XpubExport, WalletError> {
        let seed = self.seed_key()?;
        let path = multisig_account_path(address_type, self.config.network, account_index)?;
        let xpub = seed.xpub_at(&path, &self.secp)?;
        Ok(XpubExport {
            xpub: to_slip132(&xpub, address_type, self.config.network),
            standard_xpub: xpub.to_string(),
            fingerprint: seed.fingerprint().to_string(),
            derivation_path: format_path(&path),
        })
    }

    /// Creates an M-of-N account. One of `cosigners` must be this wallet's
    /// own multisig key for `address_type`.
    pub fn create_multisig_account(
        &self,
        name: &str,
        config: MultisigConfig,
        address_type: AddressType,
        cosigners: &[CosignerInput],
    ) -> Result<Account, WalletError> {
        validate_threshold(config.required, config.total)?;
        if !address_type.is_multisig() {
            return Err(WalletError::IncompatibleAddressType {
                address_type: address_type.to_string(),
                reason: "not a multisig encoding".into(),
            });
        }
        if cosigners.len() != config.total {
            return Err(WalletError::Derivation(format!(
                "{} cosigners supplied for a {}-of-{} account",
                cosigners.len(),
                config.required,
                config.total
            )));
        }

        let mut normalized: Vec<Xpub> = Vec::with_capacity(cosigners.len());
        for input in cosigners {
            let xpub = normalize_xpub(&input.xpub, self.config.network)?;
            if normalized.contains(&xpub) {
                return Err(WalletError::DuplicateKey(format!(
                    "cosigner {} appears twice",
                    xpub.fingerprint()
                )));
            }
            normalized.push(xpub);
        }

        let seed = self.seed_key()?;
        let (local_index, local_path) = self.find_local_cosigner(&seed, address_type, &normalized)?;

        let mut entries = Vec::with_capacity(cosigners.len());
        for (position, (input, xpub)) in cosigners.iter().zip(&normalized).enumerate() {
            let (fingerprint, derivation_path) = if position == local_index {
                (seed.fingerprint().to_string(), format_path(&local_path))
            } else {
                match (&input.fingerprint, &input.derivation_path) {
                    (Some(fp), Some(path)) => {
                        let fingerprint = derivation::parse_fingerprint(fp)?;
                        (fingerprint.to_string(), format_path(&parse_path(path)?))
                    }
                    _ => (xpub.fingerprint().to_string(), "m".to_string()),
                }
            };
            entries.push(Cosigner {
                fingerprint,
                xpub: xpub.to_string(),
                derivation_path,
                nickname: input.nickname.clone(),
            });
        }

        // Derive once up front so a bad cosigner set fails before it is stored.
        derivation::derive_multisig_address(
            config.required,
            config.total,
            &entries,
            address_type,
            self.config.network,
            Chain::External,
            0,
            &self.secp,
        )?;

        let account = self.store.insert_account(|id| {
            Ok(AccountRecord::new(Account {
                id,
                name: name.to_string(),
                kind: AccountKind::Multisig {
                    required: config.required,
                    total: config.total,
                    cosigners: entries,
                    local_cosigner: local_index,
                },
                address_type,
                network: self.config.network,
                external_index: 0,
                internal_index: 0,
                created_at: Utc::now(),
            }))
        })?;
        self.store.persist()?;
        tracing::info!(
            account = account.id,
            required = config.required,
            total = config.total,
            %address_type,
            "created multisig account"
        );
        Ok(account)
    }

    fn find_local_cosigner(
        &self,
        seed: &SeedKey,
        address_type: AddressType,
        cosigners: &[Xpub],
    ) -> Result<(usize, DerivationPath), WalletError> {
        let existing = self
            .accounts()
            .iter()
            .filter(|a| a.address_type == address_type && matches!(a.kind, AccountKind::Multisig { .. }))
            .count() as u32;
        for account_index in 0..=existing {
            let path = multisig_account_path(address_type, self.config.network, account_index)?;
            let ours = seed.xpub_at(&path, &self.secp)?;
            if let Some(position) = cosigners.iter().position(|x| *x == ours) {
                return Ok((position, path));
            }
            if address_type == AddressType::P2sh {
                // BIP45 has a single account path.
                break;
            }
        }
        Err(WalletError::InvalidCosigners(
            "none of the cosigners is this wallet's multisig key".into(),
        ))
    }

    /// Shares the account's extended public key.
    pub fn export_xpub(&self, account_id: AccountId) -> Result<XpubExport, WalletError> {
        let account = self.store.account_record(account_id)?.account;
        let (xpub, fingerprint, derivation_path) = match &account.kind {
            AccountKind::HdSingle {
                master_fingerprint,
                account_xpub,
                derivation_path,
                ..
            } => (account_xpub, master_fingerprint, derivation_path),
            AccountKind::Multisig {
                cosigners,
                local_cosigner,
                ..
            } => {
                let local = cosigners
                    .get(*local_cosigner)
                    .ok_or_else(|| WalletError::Internal("local cosigner out of range".into()))?;
                (&local.xpub, &local.fingerprint, &local.derivation_path)
            }
            AccountKind::ImportedSingle { .. } => {
                return Err(WalletError::Unsupported(
                    "an imported key has no extended public key".into(),
                ))
            }
        };
        let parsed = Xpub::from_str(xpub).map_err(|e| WalletError::InvalidXpub(e.to_string()))?;
        Ok(XpubExport {
            xpub: to_slip132(&parsed, account.address_type, account.network),
            standard_xpub: xpub.clone(),
            fingerprint: fingerprint.clone(),
            derivation_path: derivation_path.clone(),
        })
    }

    // ─── Addresses ──────────────────────────────────────────────────────

    /// Derives an address without issuing it.
    pub fn derive_address(
        &self,
        account_id: AccountId,
        chain: Chain,
        index: u32,
    ) -> Result<IssuedAddress, WalletError> {
        let account = self.store.account_record(account_id)?.account;
        Ok(derivation::derive_address(&account, chain, index, &self.secp)?.to_issued())
    }

    pub fn allocate_receive_address(&self, account_id: AccountId) -> Result<IssuedAddress, WalletError> {
        let issued = self
            .store
            .with_account(account_id, |record| change::allocate_receive_address(record, &self.secp))?;
        self.store.persist()?;
        Ok(issued)
    }

    /// Encodings available for a WIF key.
    pub fn address_candidates(&self, wif: &str) -> Result<Resolution, WalletError> {
        resolver::resolve_wif(wif, self.config.network, &self.secp)
    }

    /// Syncs UTXOs and address activity from the backend.
    ///
    /// Refreshes `account_id` under a token that [`WalletEngine::cancel_refresh`]
    /// can fire. Concurrent refreshes of one account share the token.
    pub async fn refresh_account(&self, account_id: AccountId) -> Result<RefreshReport, WalletError> {
        let token = {
            let mut refreshes = self.refreshes.lock();
            match refreshes.entry(account_id) {
                Entry::Occupied(mut entry) if !entry.get().0.is_cancelled() => {
                    entry.get_mut().1 += 1;
                    entry.get().0.clone()
                }
                entry => {
                    let token = CancelToken::new();
                    match entry {
                        Entry::Occupied(mut stale) => {
                            stale.insert((token.clone(), 1));
                        }
                        Entry::Vacant(vacant) => {
                            vacant.insert((token.clone(), 1));
                        }
                    }
                    token
                }
            }
        };
        let _registration = RefreshRegistration {
            refreshes: &self.refreshes,
            account_id,
            token: token.clone(),
        };
        self.refresh(account_id, token).await
    }

    /// Stops every refresh of `account_id` started through
    /// [`WalletEngine::refresh_account`]. They return what they gathered.
    /// Returns false when none was running.
    pub fn cancel_refresh(&self, account_id: AccountId) -> bool {
        match self.refreshes.lock().remove(&account_id) {
            Some((token, running)) => {
                token.cancel();
                tracing::info!(account_id, running, "refresh cancelled");
                true
            }
            None => false,
        }
    }

    /// Issued addresses are queried first, then HD accounts scan ahead on
    /// both chains until [`GAP_LIMIT`] consecutive unused addresses.
    /// Queries go through timing jitter when it is enabled; a timeout or
    /// cancellation keeps what was gathered.
    pub async fn refresh(
        &self,
        account_id: AccountId,
        token: CancelToken,
    ) -> Result<RefreshReport, WalletError> {
        let snapshot = self.store.account_record(account_id)?;
        let mut jitter = TimingJitter::new(
            self.store.privacy().timing_jitter,
            &self.config.timing_jitter,
            token,
        );
        let mut report = RefreshReport::default();

        for issued in &snapshot.addresses {
            if let Err(reason) = jitter.before_query().await {
                report.interrupted = Some(reason);
                break;
            }
            let activity = self.backend.address_activity(&issued.address).await?;
            report.scanned += 1;
            self.store.with_account(account_id, |record| {
                apply_activity(record, issued, &activity);
                Ok(())
            })?;
        }

        if report.interrupted.is_none() && snapshot.account.is_hd() {
            'chains: for chain in [Chain::External, Chain::Internal] {
                let mut index = match chain {
                    Chain::External => snapshot.account.external_index,
                    Chain::Internal => snapshot.account.internal_index,
                };
                let mut unused = 0;
                while unused < GAP_LIMIT {
                    if let Err(reason) = jitter.before_query().await {
                        report.interrupted = Some(reason);
                        break 'chains;
                    }
                    let issued =
                        derivation::derive_address(&snapshot.account, chain, index, &self.secp)?
                            .to_issued();
                    let activity = self.backend.address_activity(&issued.address).await?;
                    report.scanned += 1;
                    if activity.has_history || !activity.utxos.is_empty() {
                        self.store.with_account(account_id, |record| {
                            adopt_discovered(record, issued, &activity);
                            Ok(())
                        })?;
                        unused = 0;
                    } else {
                        unused += 1;
                    }
                    index += 1;
                }
            }
        }

        self.store.persist()?;
        let record = self.store.account_record(account_id)?;
        report.utxos = record.utxos.len();
        report.balance_sat = record.utxos.iter().map(|u| u.utxo.amount_sat).sum();
        tracing::info!(
            account = account_id,
            scanned = report.scanned,
            utxos = report.utxos,
            interrupted = ?report.interrupted,
            "refreshed account"
        );
        Ok(report)
    }

    // ─── Transactions ───────────────────────────────────────────────────

    /// Builds an unsigned PSBT. With amount jitter on, a round amount is
    /// nudged unless `keep_exact_amount` is set.
    pub fn build_transaction(
        &self,
        account_id: AccountId,
        request: &PaymentRequest,
        keep_exact_amount: bool,
    ) -> Result<BuiltTransaction, WalletError> {
        let mut rng = rand::thread_rng();
        let amount_sat = privacy::apply_amount_jitter(
            &self.store.privacy(),
            keep_exact_amount,
            request.amount_sat,
            self.config.dust_threshold_sat,
            &mut rng,
        );
        let request = PaymentRequest {
            amount_sat,
            ..request.clone()
        };
        let built = multisig::build(&self.store, account_id, &request, &self.config, &self.secp, &mut rng)?;
        self.store.persist()?;
        Ok(built)
    }

    pub fn sign_transaction(
        &self,
        account_id: AccountId,
        psbt: &str,
    ) -> Result<SignedTransaction, WalletError> {
        let account = self.store.account_record(account_id)?.account;
        let key = match &account.kind {
            AccountKind::ImportedSingle { .. } => {
                let wif = self
                    .store
                    .imported_key(account_id)
                    .ok_or_else(|| WalletError::Internal("imported key missing from store".into()))?;
                KeyMaterial::from_wif(&wif, self.config.network)?
            }
            AccountKind::HdSingle { .. } | AccountKind::Multisig { .. } => {
                KeyMaterial::Seed(self.seed_key()?)
            }
        };
        let signed = multisig::sign(&self.store, account_id, psbt, &key, &self.secp)?;
        self.store.persist()?;
        Ok(signed)
    }

    pub fn merge_psbt(
        &self,
        account_id: AccountId,
        a: &str,
        b: &str,
    ) -> Result<SignedTransaction, WalletError> {
        let merged = multisig::merge(&self.store, account_id, a, b, &self.secp)?;
        self.store.persist()?;
        Ok(merged)
    }

    pub fn finalize(
        &self,
        account_id: AccountId,
        psbt: &str,
    ) -> Result<FinalizedTransaction, WalletError> {
        let finalized = multisig::finalize(&self.store, account_id, psbt, &self.secp)?;
        self.store.persist()?;
        Ok(finalized)
    }

    /// Finalizes `psbt` and broadcasts it, right away or after a random
    /// delay when broadcast delay is on.
    pub async fn broadcast(
        &self,
        account_id: AccountId,
        psbt: &str,
    ) -> Result<BroadcastOutcome, WalletError> {
        let finalized = self.finalize(account_id, psbt)?;
        if self.store.privacy().broadcast_delay {
            let delay = privacy::broadcast_delay_secs(&self.config.broadcast_delay, &mut rand::thread_rng());
            let entry = self.scheduler.schedule(account_id, &finalized, delay)?;
            return Ok(BroadcastOutcome::Scheduled {
                id: entry.id,
                txid: entry.txid,
                due_at: entry.due_at,
            });
        }

        let entry = self.scheduler.schedule(account_id, &finalized, 0)?;
        let txid = self.scheduler.broadcast_now(&entry.id).await?;
        Ok(BroadcastOutcome::Broadcast { id: entry.id, txid })
    }

    pub async fn cancel_broadcast(&self, id: &str) -> Result<PendingBroadcast, WalletError> {
        self.scheduler.cancel(id).await
    }

    pub async fn broadcast_pending_now(&self, id: &str) -> Result<String, WalletError> {
        self.scheduler.broadcast_now(id).await
    }

    pub async fn reconcile_pending(&self) -> Result<ReconcileReport, WalletError> {
        self.scheduler.reconcile().await
    }

    /// Runs the delayed-broadcast loop until `token` is cancelled.
    pub async fn run_scheduler(&self, token: CancelToken) {
        self.scheduler.run(token).await
    }

    pub fn pending_broadcasts(&self) -> Vec<PendingBroadcast> {
        self.store.pending_entries()
    }

    pub fn transaction(&self, txid: &str) -> Result<PsbtRecord, WalletError> {
        self.store.transaction(txid)
    }

    /// Abandons an unbroadcast transaction, cancelling its scheduled
    /// broadcast if there is one.
    pub async fn discard_transaction(&self, account_id: AccountId, txid: &str) -> Result<(), WalletError> {
        if let Ok(entry) = self.store.pending(txid) {
            if matches!(entry.state, PendingState::Scheduled | PendingState::Failed) {
                self.scheduler.cancel(txid).await?;
                return Ok(());
            }
        }
        multisig::discard(&self.store, account_id, txid)?;
        self.store.persist()
    }

    // ─── Keys ───────────────────────────────────────────────────────────

    /// Exports the account's key as a backup document.
    ///
    /// Imported accounts export their key; HD accounts export the key of
    /// their first receive address. Multisig accounts cannot be exported
    /// this way.
    pub fn export_private_key(
        &self,
        account_id: AccountId,
        password: Option<&str>,
    ) -> Result<ExportedKey, WalletError> {
        let account = self.store.account_record(account_id)?.account;
        let key = match &account.kind {
            AccountKind::ImportedSingle { .. } => {
                let wif = self
                    .store
                    .imported_key(account_id)
                    .ok_or_else(|| WalletError::Internal("imported key missing from store".into()))?;
                WifKey::decode(&wif)?
            }
            AccountKind::HdSingle { derivation_path, .. } => {
                let path = parse_path(derivation_path)?
                    .child(ChildNumber::Normal { index: Chain::External.index() })
                    .child(ChildNumber::Normal { index: 0 });
                let secret = self.seed_key()?.secret_at(&path, &self.secp)?;
                let bytes = Zeroizing::new(secret.secret_bytes());
                WifKey::new(*bytes, true, self.config.network)?
            }
            AccountKind::Multisig { .. } => {
                return Err(WalletError::Unsupported(
                    "multisig accounts have no single private key to export".into(),
                ))
            }
        };

        let first_address = derivation::derive_address(&account, Chain::External, 0, &self.secp)?
            .address
            .to_string();
        let exported = backup::export_backup(
            &key,
            &BackupInfo {
                account_name: &account.name,
                address_type: account.address_type,
                first_address: &first_address,
            },
            password,
            self.config.pbkdf2_iterations,
        )?;
        tracing::info!(account = account_id, encrypted = password.is_some(), "exported private key");
        Ok(exported)
    }

    /// Imports a key from a backup document or a bare WIF as a new account
    /// using `address_type`.
    pub fn import_private_key(
        &self,
        blob: &str,
        password: Option<&str>,
        address_type: AddressType,
        name: Option<&str>,
    ) -> Result<Account, WalletError> {
        let decoded = self.guard.attempt(self.clock.now(), || {
            backup::decode_backup(blob, password, self.config.network)
        })?;
        let resolution = resolver::resolve_key(&decoded.key, &self.secp)?;
        let candidate = resolution.check_choice(address_type)?.clone();

        if let Some(meta) = &decoded.metadata {
            if meta.address_type == address_type && meta.first_address != candidate.address {
                return Err(WalletError::InvalidWif(
                    "backup first_address does not match its key".into(),
                ));
            }
        }

        let public_key = decoded.key.public_key(&self.secp)?.to_string();
        let name = name
            .map(str::to_string)
            .or_else(|| decoded.metadata.as_ref().map(|m| m.account_name.clone()))
            .unwrap_or_else(|| format!("Imported {}", candidate.address));
        let compressed = decoded.key.is_compressed();
        let account = self.store.insert_account(|id| {
            // Checked under the insert lock so two imports of one key cannot
            // both pass.
            let duplicate = self.accounts().into_iter().any(|a| {
                a.address_type == address_type
                    && matches!(&a.kind, AccountKind::ImportedSingle { public_key: pk, .. } if *pk == public_key)
            });
            if duplicate {
                return Err(WalletError::DuplicateKey(format!(
                    "{} is already imported as {address_type}",
                    candidate.address
                )));
            }
            let mut record = AccountRecord::new(Account {
                id,
                name,
                kind: AccountKind::ImportedSingle {
                    public_key,
                    compressed,
                },
                address_type,
                network: self.config.network,
                external_index: 0,
                internal_index: 0,
                created_at: Utc::now(),
            });
            change::allocate_receive_address(&mut record, &self.secp)?;
            Ok(record)
        })?;
        let wif = Zeroizing::new(decoded.key.encode());
        self.store
            .set_imported_key(account.id, SecretString::from(wif.to_string()));
        self.store.persist()?;
        tracing::info!(account = account.id, %address_type, "imported private key");
        Ok(account)
    }

    // ─── Privacy ────────────────────────────────────────────────────────

    pub fn privacy_settings(&self) -> PrivacySettings {
        self.store.privacy()
    }

    pub fn set_privacy_settings(&self, settings: PrivacySettings) -> Result<(), WalletError> {
        self.store.set_privacy(settings);
        self.store.persist()?;
        tracing::info!(?settings, "privacy settings updated");
        Ok(())
    }

    /// A less identifiable amount near `amount_sat`, if there is one.
    pub fn suggest_amount(&self, amount_sat: u64) -> Option<u64> {
        privacy::suggest_amount(amount_sat, self.config.dust_threshold_sat, &mut rand::thread_rng())
    }
}

/// Replaces the outputs recorded for one address with what the backend
/// reports, keeping reservations on outputs that are still there.
fn apply_activity(record: &mut AccountRecord, issued: &IssuedAddress, activity: &AddressActivity) {
    if activity.has_history || !activity.utxos.is_empty() {
        change::mark_used(record, &issued.address);
    }
    let fresh: Vec<WalletUtxo> = activity
        .utxos
        .iter()
        .map(|utxo| WalletUtxo {
            reserved_by: record
                .utxos
                .iter()
                .find(|owned| owned.utxo.outpoint_key() == utxo.outpoint_key())
                .and_then(|owned| owned.reserved_by.clone()),
            utxo: utxo.clone(),
            address: issued.address.clone(),
            chain: issued.chain,
            index: issued.index,
        })
        .collect();
    record.utxos.retain(|owned| owned.address != issued.address);
    record.utxos.extend(fresh);
}

/// Records an address found by scanning ahead and moves the chain counter
/// past it.
fn adopt_discovered(record: &mut AccountRecord, mut issued: IssuedAddress, activity: &AddressActivity) {
    issued.used = true;
    if record.address(issued.chain, issued.index).is_none() {
        record.addresses.push(issued.clone());
    }
    let next = issued.index + 1;
    match issued.chain {
        Chain::External => record.account.external_index = record.account.external_index.max(next),
        Chain::Internal => record.account.internal_index = record.account.internal_index.max(next),
    }
    apply_activity(record, &issued, activity);
}
