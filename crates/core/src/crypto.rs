use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

const DEFAULT_N: u64 = 1 << 20;
const DEFAULT_R: u32 = 8;
const DEFAULT_P: u32 = 1;

// scrypt scratch memory is 128 * n * r bytes; refuse parameter sets past this.
const MAX_KDF_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("authentication failed")]
    Auth,

    #[error("kdf parameters out of range: n={n} r={r} p={p}")]
    KdfParams { n: u64, r: u32, p: u32 },

    #[error("kdf parameters require more than {limit_bytes} bytes of memory")]
    ResourceExhausted { limit_bytes: u64 },

    #[error("crypto backend failure")]
    Backend,
}

/// scrypt cost parameters as persisted in the stash record. Derivation always
/// uses the parameters read back from the file, never compile-time defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub n: u64,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            n: DEFAULT_N,
            r: DEFAULT_R,
            p: DEFAULT_P,
        }
    }
}

impl KdfParams {
    fn to_scrypt(self) -> Result<scrypt::Params, CryptoError> {
        let out_of_range = CryptoError::KdfParams {
            n: self.n,
            r: self.r,
            p: self.p,
        };
        if !self.n.is_power_of_two() || self.n < 2 || self.r == 0 || self.p == 0 {
            return Err(out_of_range);
        }
        let memory = 128u64
            .checked_mul(self.n)
            .and_then(|m| m.checked_mul(u64::from(self.r)))
            .ok_or(CryptoError::KdfParams {
                n: self.n,
                r: self.r,
                p: self.p,
            })?;
        if memory > MAX_KDF_MEMORY_BYTES {
            return Err(CryptoError::ResourceExhausted {
                limit_bytes: MAX_KDF_MEMORY_BYTES,
            });
        }
        let log_n = self.n.trailing_zeros() as u8;
        scrypt::Params::new(log_n, self.r, self.p, KEY_LEN).map_err(|_| out_of_range)
    }
}

/// 32-byte derived key, wiped on drop.
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MasterKey").field(&"<redacted>").finish()
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// AEAD output: a fresh nonce plus ciphertext with the 16-byte tag appended.
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0_u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn derive_key(
    password: &str,
    salt: &[u8; SALT_LEN],
    params: &KdfParams,
) -> Result<MasterKey, CryptoError> {
    let scrypt_params = params.to_scrypt()?;
    let mut key = [0_u8; KEY_LEN];
    scrypt::scrypt(password.as_bytes(), salt, &scrypt_params, &mut key)
        .map_err(|_| CryptoError::Backend)?;
    let master = MasterKey(key);
    key.zeroize();
    Ok(master)
}

pub fn encrypt(key: &MasterKey, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Backend)?;
    let mut nonce = [0_u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Backend)?;
    Ok(Sealed { nonce, ciphertext })
}

pub fn decrypt(
    key: &MasterKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Backend)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Auth)?;
    Ok(Zeroizing::new(plaintext))
}

/// One-way hash used to recognize a clipboard value without retaining it.
pub fn fingerprint(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    // Small cost so the suite stays fast; production default is n = 2^20.
    KdfParams { n: 4096, r: 8, p: 1 }
}
