//! Secure Storage Module
//!
//! Keyed JSON blobs on disk. Values are encrypted with Windows DPAPI where
//! available and every write replaces the previous value atomically.

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

#[cfg(windows)]
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
};

/// Directory name used under the platform's local data dir
pub const APP_DIR_NAME: &str = "Nearby";

/// Secure storage rooted at a single directory
#[derive(Debug, Clone)]
pub struct SecureStorage {
    storage_path: PathBuf,
}

impl SecureStorage {
    /// Create storage in the platform default location
    pub fn new() -> Self {
        Self::at(Self::default_root())
    }

    /// `<local data dir>/Nearby`, or `./Nearby` when the platform has none
    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
    }

    /// Create storage rooted at `path`
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let storage_path = path.into();

        if let Err(e) = std::fs::create_dir_all(&storage_path) {
            error!("Failed to create storage directory: {}", e);
        }

        debug!("Secure storage initialized at: {:?}", storage_path);

        Self { storage_path }
    }

    pub fn root(&self) -> &Path {
        &self.storage_path
    }

    /// Serialize and store `data` under `key`.
    ///
    /// The value is written to a sibling temp file and renamed over the old
    /// one, so concurrent readers see either the previous or the new value.
    pub fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<(), StorageError> {
        let json = serde_json::to_vec(data)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let encrypted = self.encrypt(&json)?;

        let file_path = self.path_for(key);
        let tmp_path = self.storage_path.join(format!("{}.dat.tmp", key));
        std::fs::write(&tmp_path, encrypted)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, &file_path)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        debug!("Saved data for key: {}", key);
        Ok(())
    }

    /// Load the value stored under `key`
    pub fn load<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T, StorageError> {
        let file_path = self.path_for(key);

        let encrypted = match std::fs::read(&file_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        let decrypted = self.decrypt(&encrypted)?;

        serde_json::from_slice(&decrypted)
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Load `key`, treating a missing value as `None`
    pub fn load_optional<T: for<'de> Deserialize<'de>>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.load(key) {
            Ok(value) => Ok(Some(value)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete stored data
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let file_path = self.path_for(key);

        if file_path.exists() {
            std::fs::remove_file(&file_path)
                .map_err(|e| StorageError::Io(e.to_string()))?;
            info!("Deleted stored data for key: {}", key);
        }

        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{}.dat", key))
    }

    #[cfg(windows)]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        dpapi(data, true).map_err(StorageError::Encryption)
    }

    #[cfg(windows)]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        dpapi(data, false).map_err(StorageError::Decryption)
    }

    #[cfg(not(windows))]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        // Plain storage outside Windows; the data dir is user-private.
        Ok(data.to_vec())
    }

    #[cfg(not(windows))]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        Ok(data.to_vec())
    }
}

impl Default for SecureStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `data` through CryptProtectData / CryptUnprotectData.
#[cfg(windows)]
#[allow(unsafe_code)]
fn dpapi(data: &[u8], protect: bool) -> Result<Vec<u8>, String> {
    use std::ptr::null_mut;

    let input = CRYPT_INTEGER_BLOB {
        cbData: data.len() as u32,
        pbData: data.as_ptr() as *mut u8,
    };
    let mut output = CRYPT_INTEGER_BLOB {
        cbData: 0,
        pbData: null_mut(),
    };

    unsafe {
        let result = if protect {
            CryptProtectData(&input, None, None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut output)
        } else {
            CryptUnprotectData(&input, None, None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut output)
        };

        if result.is_err() {
            let op = if protect { "encryption" } else { "decryption" };
            return Err(format!("DPAPI {} failed", op));
        }

        let bytes = std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();

        // DPAPI allocates the output buffer with LocalAlloc
        windows::Win32::Foundation::LocalFree(windows::Win32::Foundation::HLOCAL(
            output.pbData as *mut std::ffi::c_void,
        ));

        Ok(bytes)
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("No stored value for key: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),
}
