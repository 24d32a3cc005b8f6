use std::collections::BTreeMap;
use std::path::PathBuf;

use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{self, KdfParams, MasterKey, SALT_LEN};
use crate::error::StashError;
use crate::store::{StashStore, StoreData};

pub const MAX_KEY_BYTES: usize = 256;

/// In-memory state between an unlock and the next lock: the derived key, the
/// salt and cost parameters it was derived with, and the decrypted secret
/// map. The salt and parameters are cached because every add/delete persist
/// re-encrypts without re-running the kdf; the password itself is never kept.
struct Session {
    key: MasterKey,
    salt: [u8; SALT_LEN],
    params: KdfParams,
    secrets: BTreeMap<String, String>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for value in self.secrets.values_mut() {
            value.zeroize();
        }
    }
}

/// The stash: an encrypted file plus, while unlocked, its decrypted form.
pub struct Stash {
    store: StashStore,
    session: Option<Session>,
}

impl Stash {
    pub fn new(stash_path: impl Into<PathBuf>) -> Self {
        Self {
            store: StashStore::new(stash_path),
            session: None,
        }
    }

    pub fn store(&self) -> &StashStore {
        &self.store
    }

    pub fn exists(&self) -> bool {
        self.store.exists()
    }

    pub fn is_unlocked(&self) -> bool {
        self.session.is_some()
    }

    /// First-time setup: create the record with an empty secret map.
    pub fn init(&self, password: &str, params: &KdfParams) -> Result<(), StashError> {
        if self.store.exists() {
            return Err(StashError::AlreadyInitialized);
        }
        if password.is_empty() {
            return Err(StashError::EmptyPassword);
        }
        let salt = crypto::random_salt();
        let key = crypto::derive_key(password, &salt, params)?;
        let sealed = crypto::encrypt(&key, b"{}")?;
        self.store.write(&StoreData {
            params: *params,
            salt,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
        })
    }

    /// Derive the key with the persisted parameters, decrypt, and hold the
    /// secrets in memory. Runs the kdf inline; the daemon splits this into
    /// `load` + `derive_key` + [`Stash::install_session`] so the derivation
    /// happens outside its session mutex.
    pub fn unlock(&mut self, password: &str) -> Result<(), StashError> {
        let data = self.store.load()?;
        let key = crypto::derive_key(password, &data.salt, &data.params)?;
        self.install_session(key, data)
    }

    /// Apply an unlock with an already-derived key. On success the previous
    /// session (if any) is replaced and wiped; on failure the session is left
    /// exactly as it was.
    pub fn install_session(&mut self, key: MasterKey, data: StoreData) -> Result<(), StashError> {
        let plaintext = crypto::decrypt(&key, &data.nonce, &data.ciphertext)?;
        let secrets: BTreeMap<String, String> = serde_json::from_slice(&plaintext)
            .map_err(|_| StashError::CorruptStash("decrypted payload is not a secret map".into()))?;
        self.session = Some(Session {
            key,
            salt: data.salt,
            params: data.params,
            secrets,
        });
        Ok(())
    }

    /// Wipe the derived key and all secret values from memory.
    pub fn lock(&mut self) {
        self.session = None;
    }

    pub fn get(&self, key: &str) -> Result<&str, StashError> {
        let session = self.require_unlocked()?;
        session
            .secrets
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| StashError::NoSuchKey(key.to_string()))
    }

    /// Keys in lexicographic order, optionally narrowed to substring matches.
    pub fn list(&self, filter: Option<&str>) -> Result<Vec<String>, StashError> {
        let session = self.require_unlocked()?;
        Ok(session
            .secrets
            .keys()
            .filter(|k| filter.is_none_or(|f| k.contains(f)))
            .cloned()
            .collect())
    }

    /// Insert or replace a secret, then re-encrypt and persist.
    pub fn add(&mut self, key: &str, value: String) -> Result<(), StashError> {
        validate_key(key)?;
        let session = self.require_unlocked_mut()?;
        if let Some(mut previous) = session.secrets.insert(key.to_string(), value) {
            previous.zeroize();
        }
        self.persist()
    }

    /// Remove a secret, then re-encrypt and persist.
    pub fn delete(&mut self, key: &str) -> Result<(), StashError> {
        let session = self.require_unlocked_mut()?;
        let mut removed = session
            .secrets
            .remove(key)
            .ok_or_else(|| StashError::NoSuchKey(key.to_string()))?;
        removed.zeroize();
        self.persist()
    }

    /// Move a secret to a new key, overwriting any existing target.
    pub fn rename(&mut self, key: &str, new_key: &str) -> Result<(), StashError> {
        validate_key(new_key)?;
        let session = self.require_unlocked_mut()?;
        let value = session
            .secrets
            .remove(key)
            .ok_or_else(|| StashError::NoSuchKey(key.to_string()))?;
        if let Some(mut previous) = session.secrets.insert(new_key.to_string(), value) {
            previous.zeroize();
        }
        self.persist()
    }

    /// Verify the old password by decrypting, then re-encrypt under a key
    /// derived from the new password with a fresh salt. Cost parameters are
    /// carried over from the record. Works locked or unlocked; an unlocked
    /// session is re-pointed at the new credentials.
    pub fn change_password(&mut self, old: &str, new: &str) -> Result<(), StashError> {
        if new.is_empty() {
            return Err(StashError::EmptyPassword);
        }
        let data = self.store.load()?;
        let old_key = crypto::derive_key(old, &data.salt, &data.params)?;
        let plaintext = crypto::decrypt(&old_key, &data.nonce, &data.ciphertext)?;

        let new_salt = crypto::random_salt();
        let new_key = crypto::derive_key(new, &new_salt, &data.params)?;
        let sealed = crypto::encrypt(&new_key, &plaintext)?;
        self.store.write(&StoreData {
            params: data.params,
            salt: new_salt,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
        })?;
        self.refresh_credentials(new_key, new_salt, data.params);
        Ok(())
    }

    /// Point an unlocked session at a new key/salt so later persists stay
    /// decryptable by the new password. No-op while locked.
    pub fn refresh_credentials(&mut self, key: MasterKey, salt: [u8; SALT_LEN], params: KdfParams) {
        if let Some(session) = self.session.as_mut() {
            session.key = key;
            session.salt = salt;
            session.params = params;
        }
    }

    /// Re-encrypt the current secret map with the session key and a fresh
    /// nonce, and replace the record atomically. The salt is unchanged so no
    /// kdf run is needed.
    fn persist(&self) -> Result<(), StashError> {
        let session = self.require_unlocked()?;
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&session.secrets)
                .map_err(|err| StashError::Internal(err.to_string()))?,
        );
        let sealed = crypto::encrypt(&session.key, &plaintext)?;
        self.store.write(&StoreData {
            params: session.params,
            salt: session.salt,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
        })
    }

    fn require_unlocked(&self) -> Result<&Session, StashError> {
        self.session.as_ref().ok_or(StashError::Locked)
    }

    fn require_unlocked_mut(&mut self) -> Result<&mut Session, StashError> {
        self.session.as_mut().ok_or(StashError::Locked)
    }
}

/// A usable key is non-empty printable text of at most 256 bytes with no NUL
/// and no surrounding whitespace.
pub fn validate_key(key: &str) -> Result<(), StashError> {
    if key.is_empty() {
        return Err(StashError::InvalidKey("key cannot be empty".into()));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(StashError::InvalidKey(format!(
            "key is longer than {MAX_KEY_BYTES} bytes"
        )));
    }
    if key.contains('\0') {
        return Err(StashError::InvalidKey("key contains a NUL byte".into()));
    }
    if key.trim() != key {
        return Err(StashError::InvalidKey(
            "key has leading or trailing whitespace".into(),
        ));
    }
    Ok(())
}
