//! Persisted wallet state.
//!
//! The store owns accounts, issued addresses, UTXOs, PSBT records, the
//! pending-broadcast ledger, privacy settings and secrets. On disk it is a
//! JSON envelope around one AES-256-GCM ciphertext whose key comes from the
//! password through Argon2id. Writes go to a temporary file that is then
//! renamed over the previous one.
//!
//! Locking: each account has its own mutex. Never take an account lock
//! while holding the transactions or pending lock, and never call
//! [`WalletStore::persist`] while holding any lock from this store. The
//! [`WalletStore::insert_account`] closure runs under the meta lock and may
//! read accounts, so the meta lock is never taken under an account lock.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chain_btc::BtcNetwork;
use crypto_utils::encryption::{self, SealedBox, NONCE_SIZE};
use crypto_utils::kdf::{self, SALT_SIZE};
use crypto_utils::Argon2Params;
use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::WalletError;
use crate::types::{
    Account, AccountId, AccountRecord, PendingBroadcast, PrivacySettings, PsbtRecord,
};

const STORE_MAGIC: &str = "btc-wallet-store";
const STORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct KdfHeader {
    salt: String,
    params: Argon2Params,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    magic: String,
    version: u32,
    kdf: KdfHeader,
    nonce: String,
    ciphertext: String,
}

#[derive(Serialize, Deserialize)]
struct StoreDocument {
    network: BtcNetwork,
    next_account_id: AccountId,
    privacy: PrivacySettings,
    accounts: Vec<AccountRecord>,
    transactions: Vec<PsbtRecord>,
    pending: Vec<PendingBroadcast>,
    secrets: SecretsDocument,
}

/// Serialized form of [`Secrets`]; wiped on drop.
#[derive(Default, Serialize, Deserialize)]
struct SecretsDocument {
    seed: Option<String>,
    imported: BTreeMap<AccountId, String>,
}

impl Drop for SecretsDocument {
    fn drop(&mut self) {
        if let Some(seed) = self.seed.as_mut() {
            seed.zeroize();
        }
        for wif in self.imported.values_mut() {
            wif.zeroize();
        }
    }
}

#[derive(Default)]
struct Secrets {
    seed: Option<Zeroizing<[u8; 64]>>,
    imported: BTreeMap<AccountId, SecretString>,
}

struct StoreMeta {
    next_account_id: AccountId,
    privacy: PrivacySettings,
}

struct StoreKey {
    key: Zeroizing<[u8; 32]>,
    salt: [u8; SALT_SIZE],
    params: Argon2Params,
}

pub struct WalletStore {
    path: Option<PathBuf>,
    key: Option<StoreKey>,
    network: BtcNetwork,
    accounts: RwLock<BTreeMap<AccountId, Arc<Mutex<AccountRecord>>>>,
    transactions: Mutex<BTreeMap<String, PsbtRecord>>,
    pending: Mutex<BTreeMap<String, PendingBroadcast>>,
    meta: Mutex<StoreMeta>,
    secrets: Mutex<Secrets>,
    persist_lock: Mutex<()>,
}

impl WalletStore {
    /// A store that lives only in memory. `persist` is a no-op.
    pub fn in_memory(network: BtcNetwork, privacy: PrivacySettings) -> Self {
        Self::empty(None, None, network, privacy)
    }

    /// Creates a new encrypted store file at `path`, replacing nothing: an
    /// existing file is an error.
    pub fn create(
        path: &Path,
        password: &[u8],
        params: &Argon2Params,
        network: BtcNetwork,
        privacy: PrivacySettings,
    ) -> Result<Self, WalletError> {
        if path.exists() {
            return Err(WalletError::Internal(format!(
                "store already exists at {}",
                path.display()
            )));
        }
        let salt = kdf::generate_salt();
        let key = kdf::derive_key_with(password, &salt, params)?;
        let store = Self::empty(
            Some(path.to_path_buf()),
            Some(StoreKey {
                key,
                salt,
                params: *params,
            }),
            network,
            privacy,
        );
        store.persist()?;
        tracing::info!(path = %path.display(), %network, "created wallet store");
        Ok(store)
    }

    /// Opens and decrypts an existing store.
    ///
    /// A wrong password fails [`WalletError::DecryptionFailed`]; a file that
    /// decrypts but does not parse, or breaks an invariant, fails
    /// [`WalletError::StoreCorrupted`]. Nothing is repaired.
    pub fn open(path: &Path, password: &[u8]) -> Result<Self, WalletError> {
        let raw = fs::read(path)?;
        let envelope: Envelope = serde_json::from_slice(&raw)
            .map_err(|e| WalletError::StoreCorrupted(format!("envelope: {e}")))?;
        if envelope.magic != STORE_MAGIC {
            return Err(WalletError::StoreCorrupted("bad magic".into()));
        }
        if envelope.version != STORE_VERSION {
            return Err(WalletError::StoreCorrupted(format!(
                "unsupported store version {}",
                envelope.version
            )));
        }

        let salt: [u8; SALT_SIZE] = decode_fixed(&envelope.kdf.salt, "salt")?;
        let nonce: [u8; NONCE_SIZE] = decode_fixed(&envelope.nonce, "nonce")?;
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| WalletError::StoreCorrupted(format!("ciphertext: {e}")))?;

        let key = kdf::derive_key_with(password, &salt, &envelope.kdf.params)?;
        let plaintext = Zeroizing::new(encryption::open(&SealedBox { nonce, ciphertext }, &key)?);
        let doc: StoreDocument = serde_json::from_slice(&plaintext)
            .map_err(|e| WalletError::StoreCorrupted(format!("document: {e}")))?;
        check_document(&doc)?;

        let store = Self::empty(
            Some(path.to_path_buf()),
            Some(StoreKey {
                key,
                salt,
                params: envelope.kdf.params,
            }),
            doc.network,
            doc.privacy,
        );
        store.load_document(&doc)?;
        tracing::info!(
            path = %path.display(),
            accounts = doc.accounts.len(),
            pending = doc.pending.len(),
            "opened wallet store"
        );
        Ok(store)
    }

    fn empty(
        path: Option<PathBuf>,
        key: Option<StoreKey>,
        network: BtcNetwork,
        privacy: PrivacySettings,
    ) -> Self {
        Self {
            path,
            key,
            network,
            accounts: RwLock::new(BTreeMap::new()),
            transactions: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(BTreeMap::new()),
            meta: Mutex::new(StoreMeta {
                next_account_id: 1,
                privacy,
            }),
            secrets: Mutex::new(Secrets::default()),
            persist_lock: Mutex::new(()),
        }
    }

    fn load_document(&self, doc: &StoreDocument) -> Result<(), WalletError> {
        {
            let mut accounts = self.accounts.write();
            for record in &doc.accounts {
                accounts.insert(record.account.id, Arc::new(Mutex::new(record.clone())));
            }
        }
        {
            let mut transactions = self.transactions.lock();
            for record in &doc.transactions {
                transactions.insert(record.txid.clone(), record.clone());
            }
        }
        {
            let mut pending = self.pending.lock();
            for entry in &doc.pending {
                pending.insert(entry.id.clone(), entry.clone());
            }
        }
        self.meta.lock().next_account_id = doc.next_account_id;

        let mut secrets = self.secrets.lock();
        if let Some(seed_hex) = &doc.secrets.seed {
            let mut bytes = Zeroizing::new(
                hex::decode(seed_hex)
                    .map_err(|e| WalletError::StoreCorrupted(format!("seed: {e}")))?,
            );
            if bytes.len() != 64 {
                return Err(WalletError::StoreCorrupted("seed must be 64 bytes".into()));
            }
            let mut seed = Zeroizing::new([0u8; 64]);
            seed.copy_from_slice(&bytes);
            bytes.zeroize();
            secrets.seed = Some(seed);
        }
        for (id, wif) in &doc.secrets.imported {
            secrets
                .imported
                .insert(*id, SecretString::from(wif.clone()));
        }
        Ok(())
    }

    pub fn network(&self) -> BtcNetwork {
        self.network
    }

    /// Writes the current state to disk.
    pub fn persist(&self) -> Result<(), WalletError> {
        let (Some(path), Some(key)) = (&self.path, &self.key) else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock();

        let doc = self.snapshot();
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&doc)
                .map_err(|e| WalletError::Internal(format!("serialize store: {e}")))?,
        );
        let sealed = encryption::seal(&plaintext, &key.key)?;
        let envelope = Envelope {
            magic: STORE_MAGIC.into(),
            version: STORE_VERSION,
            kdf: KdfHeader {
                salt: BASE64.encode(key.salt),
                params: key.params,
            },
            nonce: BASE64.encode(sealed.nonce),
            ciphertext: BASE64.encode(&sealed.ciphertext),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| WalletError::Internal(format!("serialize envelope: {e}")))?;
        write_atomic(path, &bytes)?;
        tracing::trace!(path = %path.display(), "persisted wallet store");
        Ok(())
    }

    fn snapshot(&self) -> StoreDocument {
        let handles: Vec<_> = self.accounts.read().values().cloned().collect();
        let accounts = handles.iter().map(|h| h.lock().clone()).collect();
        let transactions = self.transactions.lock().values().cloned().collect();
        let pending = self.pending.lock().values().cloned().collect();
        let (next_account_id, privacy) = {
            let meta = self.meta.lock();
            (meta.next_account_id, meta.privacy)
        };
        let secrets = {
            let secrets = self.secrets.lock();
            SecretsDocument {
                seed: secrets.seed.as_ref().map(|s| hex::encode(&s[..])),
                imported: secrets
                    .imported
                    .iter()
                    .map(|(id, wif)| (*id, wif.expose_secret().to_string()))
                    .collect(),
            }
        };
        StoreDocument {
            network: self.network,
            next_account_id,
            privacy,
            accounts,
            transactions,
            pending,
            secrets,
        }
    }

    // ─── Accounts ───────────────────────────────────────────────────────

    /// Assigns the next account id and stores the record built from it.
    pub fn insert_account(
        &self,
        build: impl FnOnce(AccountId) -> Result<AccountRecord, WalletError>,
    ) -> Result<Account, WalletError> {
        let mut meta = self.meta.lock();
        let id = meta.next_account_id;
        let record = build(id)?;
        if record.account.id != id {
            return Err(WalletError::Internal("account id mismatch".into()));
        }
        let account = record.account.clone();
        self.accounts.write().insert(id, Arc::new(Mutex::new(record)));
        meta.next_account_id = id + 1;
        Ok(account)
    }

    pub fn account_handle(&self, id: AccountId) -> Result<Arc<Mutex<AccountRecord>>, WalletError> {
        self.accounts
            .read()
            .get(&id)
            .cloned()
            .ok_or(WalletError::AccountNotFound(id))
    }

    /// Runs `f` under the account lock.
    pub fn with_account<T>(
        &self,
        id: AccountId,
        f: impl FnOnce(&mut AccountRecord) -> Result<T, WalletError>,
    ) -> Result<T, WalletError> {
        let handle = self.account_handle(id)?;
        let mut record = handle.lock();
        f(&mut record)
    }

    pub fn account_record(&self, id: AccountId) -> Result<AccountRecord, WalletError> {
        Ok(self.account_handle(id)?.lock().clone())
    }

    pub fn accounts(&self) -> Vec<Account> {
        let handles: Vec<_> = self.accounts.read().values().cloned().collect();
        handles.iter().map(|h| h.lock().account.clone()).collect()
    }

    /// Clears reservations held by `txid`.
    pub fn release_reservations(&self, id: AccountId, txid: &str) -> Result<usize, WalletError> {
        self.with_account(id, |record| {
            let mut released = 0;
            for utxo in record.utxos.iter_mut() {
                if utxo.reserved_by.as_deref() == Some(txid) {
                    utxo.reserved_by = None;
                    released += 1;
                }
            }
            Ok(released)
        })
    }

    /// Drops the outputs `txid` spent.
    pub fn consume_reservations(&self, id: AccountId, txid: &str) -> Result<usize, WalletError> {
        self.with_account(id, |record| {
            let before = record.utxos.len();
            record
                .utxos
                .retain(|u| u.reserved_by.as_deref() != Some(txid));
            Ok(before - record.utxos.len())
        })
    }

    // ─── Transactions ───────────────────────────────────────────────────

    pub fn transaction(&self, txid: &str) -> Result<PsbtRecord, WalletError> {
        self.transactions
            .lock()
            .get(txid)
            .cloned()
            .ok_or_else(|| WalletError::UnknownTransaction(txid.to_string()))
    }

    pub fn find_transaction(&self, txid: &str) -> Option<PsbtRecord> {
        self.transactions.lock().get(txid).cloned()
    }

    pub fn put_transaction(&self, record: PsbtRecord) {
        self.transactions.lock().insert(record.txid.clone(), record);
    }

    pub fn update_transaction<T>(
        &self,
        txid: &str,
        f: impl FnOnce(&mut PsbtRecord) -> Result<T, WalletError>,
    ) -> Result<T, WalletError> {
        let mut transactions = self.transactions.lock();
        let record = transactions
            .get_mut(txid)
            .ok_or_else(|| WalletError::UnknownTransaction(txid.to_string()))?;
        f(record)
    }

    pub fn transactions(&self) -> Vec<PsbtRecord> {
        self.transactions.lock().values().cloned().collect()
    }

    // ─── Pending broadcasts ─────────────────────────────────────────────

    pub fn pending(&self, id: &str) -> Result<PendingBroadcast, WalletError> {
        self.pending
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| WalletError::UnknownTransaction(id.to_string()))
    }

    pub fn put_pending(&self, entry: PendingBroadcast) {
        self.pending.lock().insert(entry.id.clone(), entry);
    }

    pub fn update_pending<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut PendingBroadcast) -> Result<T, WalletError>,
    ) -> Result<T, WalletError> {
        let mut pending = self.pending.lock();
        let entry = pending
            .get_mut(id)
            .ok_or_else(|| WalletError::UnknownTransaction(id.to_string()))?;
        f(entry)
    }

    pub fn pending_entries(&self) -> Vec<PendingBroadcast> {
        self.pending.lock().values().cloned().collect()
    }

    // ─── Settings and secrets ───────────────────────────────────────────

    pub fn privacy(&self) -> PrivacySettings {
        self.meta.lock().privacy
    }

    pub fn set_privacy(&self, privacy: PrivacySettings) {
        self.meta.lock().privacy = privacy;
    }

    pub fn set_seed(&self, seed: Zeroizing<[u8; 64]>) {
        self.secrets.lock().seed = Some(seed);
    }

    pub fn seed(&self) -> Option<Zeroizing<[u8; 64]>> {
        self.secrets.lock().seed.clone()
    }

    pub fn set_imported_key(&self, id: AccountId, wif: SecretString) {
        self.secrets.lock().imported.insert(id, wif);
    }

    pub fn imported_key(&self, id: AccountId) -> Option<Zeroizing<String>> {
        self.secrets
            .lock()
            .imported
            .get(&id)
            .map(|wif| Zeroizing::new(wif.expose_secret().to_string()))
    }
}

fn decode_fixed<const N: usize>(encoded: &str, field: &str) -> Result<[u8; N], WalletError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| WalletError::StoreCorrupted(format!("{field}: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| WalletError::StoreCorrupted(format!("{field} must be {N} bytes")))
}

fn check_document(doc: &StoreDocument) -> Result<(), WalletError> {
    let mut seen = std::collections::BTreeSet::new();
    for record in &doc.accounts {
        let id = record.account.id;
        if !seen.insert(id) {
            return Err(WalletError::StoreCorrupted(format!("duplicate account id {id}")));
        }
        if id >= doc.next_account_id {
            return Err(WalletError::StoreCorrupted(format!(
                "account id {id} is not below next id {}",
                doc.next_account_id
            )));
        }
        if record.account.network != doc.network {
            return Err(WalletError::StoreCorrupted(format!(
                "account {id} is on {}, store is on {}",
                record.account.network, doc.network
            )));
        }
    }
    for tx in &doc.transactions {
        if !seen.contains(&tx.account_id) {
            return Err(WalletError::StoreCorrupted(format!(
                "transaction {} references missing account {}",
                tx.txid, tx.account_id
            )));
        }
    }
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WalletError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
