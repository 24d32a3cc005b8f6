//! On-disk record handling for the encrypted stash file.
//!
//! The record is JSON with a kdf section (scrypt parameters and salt) and an
//! encryption section (AES-256-GCM nonce and ciphertext). The ciphertext is
//! the only protected payload; everything else is parseable at rest.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::crypto::{KdfParams, NONCE_LEN, SALT_LEN};
use crate::error::StashError;

pub const RECORD_VERSION: u32 = 1;

const KDF_ALGORITHM: &str = "scrypt";
const ENCRYPTION_ALGORITHM: &str = "aes-256-gcm";

#[derive(Debug, Serialize, Deserialize)]
struct StashRecord {
    version: u32,
    kdf: KdfSection,
    encryption: EncryptionSection,
}

#[derive(Debug, Serialize, Deserialize)]
struct KdfSection {
    algorithm: String,
    salt: String,
    n: u64,
    r: u32,
    p: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct EncryptionSection {
    algorithm: String,
    nonce: String,
    ciphertext: String,
}

/// Decoded contents of the stash file. The ciphertext stays encrypted; this
/// is metadata plus the sealed payload, never plaintext.
#[derive(Debug, Clone)]
pub struct StoreData {
    pub params: KdfParams,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StashStore {
    path: PathBuf,
}

impl StashStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<StoreData, StashError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StashError::NoStash);
            }
            Err(err) => return Err(err.into()),
        };
        let record: StashRecord = serde_json::from_str(&raw)
            .map_err(|err| StashError::CorruptStash(format!("malformed record: {err}")))?;
        if record.version != RECORD_VERSION {
            return Err(StashError::CorruptStash(format!(
                "unsupported version {}",
                record.version
            )));
        }
        if record.kdf.algorithm != KDF_ALGORITHM {
            return Err(StashError::CorruptStash(format!(
                "unsupported kdf algorithm '{}'",
                record.kdf.algorithm
            )));
        }
        if record.encryption.algorithm != ENCRYPTION_ALGORITHM {
            return Err(StashError::CorruptStash(format!(
                "unsupported encryption algorithm '{}'",
                record.encryption.algorithm
            )));
        }

        let salt = decode_fixed::<SALT_LEN>("kdf.salt", &record.kdf.salt)?;
        let nonce = decode_fixed::<NONCE_LEN>("encryption.nonce", &record.encryption.nonce)?;
        let ciphertext = BASE64
            .decode(&record.encryption.ciphertext)
            .map_err(|_| StashError::CorruptStash("encryption.ciphertext is not base64".into()))?;

        Ok(StoreData {
            params: KdfParams {
                n: record.kdf.n,
                r: record.kdf.r,
                p: record.kdf.p,
            },
            salt,
            nonce,
            ciphertext,
        })
    }

    /// Atomically replace the stash file: serialize to a sibling tmp file,
    /// flush and sync it, then rename over the target. A crash before the
    /// rename leaves the old record intact; after it, the new record is
    /// complete. A tmp file left by an aborted write is unlinked here.
    pub fn write(&self, data: &StoreData) -> Result<(), StashError> {
        let record = StashRecord {
            version: RECORD_VERSION,
            kdf: KdfSection {
                algorithm: KDF_ALGORITHM.to_string(),
                salt: BASE64.encode(data.salt),
                n: data.params.n,
                r: data.params.r,
                p: data.params.p,
            },
            encryption: EncryptionSection {
                algorithm: ENCRYPTION_ALGORITHM.to_string(),
                nonce: BASE64.encode(data.nonce),
                ciphertext: BASE64.encode(&data.ciphertext),
            },
        };
        let mut serialized = serde_json::to_string_pretty(&record)
            .map_err(|err| StashError::Internal(err.to_string()))?;
        serialized.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
            restrict_dir_permissions(parent)?;
        }

        let tmp_path = self.tmp_path()?;
        let _ = fs::remove_file(&tmp_path);
        {
            let mut file = open_owner_only(&tmp_path)?;
            file.write_all(serialized.as_bytes())?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }

    fn tmp_path(&self) -> Result<PathBuf, StashError> {
        let name = self
            .path
            .file_name()
            .ok_or_else(|| StashError::Internal("stash path has no filename".into()))?
            .to_string_lossy();
        Ok(self.path.with_file_name(format!("{name}.tmp")))
    }
}

fn decode_fixed<const N: usize>(field: &str, encoded: &str) -> Result<[u8; N], StashError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| StashError::CorruptStash(format!("{field} is not base64")))?;
    bytes
        .try_into()
        .map_err(|_| StashError::CorruptStash(format!("{field} has the wrong length")))
}

#[cfg(unix)]
fn open_owner_only(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_owner_only(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().create_new(true).write(true).open(path)
}

#[cfg(unix)]
fn restrict_dir_permissions(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
