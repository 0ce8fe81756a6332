//! File-keyed symmetric secrets vault (§4.6).

use crate::db::models::SecretMetadata;
use crate::db::RepositoryStore;
use crate::error::{AppError, AppResult};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use std::collections::HashMap;
use std::path::Path;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub struct SecretsVault {
    cipher: ChaCha20Poly1305,
    store: RepositoryStore,
}

impl SecretsVault {
    /// Loads the key from `ENV_KEY_PATH`, generating a fresh 32-byte CSPRNG key on first use.
    pub async fn new(store: RepositoryStore) -> AppResult<Self> {
        let path = crate::config::ENV_KEY_PATH.as_str();
        let key_bytes = load_or_create_key(path).await?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        Ok(Self { cipher, store })
    }

    pub async fn set(&self, name: &str, value: &str, description: Option<&str>) -> AppResult<()> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, value.as_bytes())
            .map_err(|e| AppError::Internal(format!("encryption failed: {e}")))?;
        self.store.upsert_secret(name, &ciphertext, &nonce_bytes, description).await
    }

    pub async fn get(&self, name: &str) -> AppResult<Option<String>> {
        match self.store.get_secret(name).await? {
            Some((ciphertext, nonce_bytes)) => Ok(decrypt(&self.cipher, &ciphertext, &nonce_bytes).ok()),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, name: &str) -> AppResult<bool> {
        self.store.delete_secret(name).await
    }

    pub async fn list_names(&self) -> AppResult<Vec<String>> {
        Ok(self.store.list_secret_metadata().await?.into_iter().map(|m| m.name).collect())
    }

    pub async fn list_metadata(&self) -> AppResult<Vec<SecretMetadata>> {
        self.store.list_secret_metadata().await
    }

    /// Decrypts every entry, silently skipping any that fail (key rotation must not break
    /// execution of unrelated jobs).
    pub async fn all_decrypted(&self) -> AppResult<HashMap<String, String>> {
        let all = self.store.all_secrets().await?;
        let mut out = HashMap::with_capacity(all.len());
        for (name, ciphertext, nonce_bytes) in all {
            match decrypt(&self.cipher, &ciphertext, &nonce_bytes) {
                Ok(plaintext) => {
                    out.insert(name, plaintext);
                }
                Err(_) => {
                    tracing::warn!(name, "skipping secret that failed to decrypt");
                }
            }
        }
        Ok(out)
    }
}

fn decrypt(cipher: &ChaCha20Poly1305, ciphertext: &[u8], nonce_bytes: &[u8]) -> Result<String, ()> {
    if nonce_bytes.len() != NONCE_LEN {
        return Err(());
    }
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| ())?;
    String::from_utf8(plaintext).map_err(|_| ())
}

async fn load_or_create_key(path: &str) -> AppResult<[u8; KEY_LEN]> {
    if Path::new(path).exists() {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| AppError::Internal(format!("failed to read env key: {e}")))?;
        if bytes.len() != KEY_LEN {
            return Err(AppError::Internal(format!(
                "env key at {path} has unexpected length {} (expected {KEY_LEN})",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(key)
    } else {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        tokio::fs::write(path, key)
            .await
            .map_err(|e| AppError::Internal(format!("failed to write env key: {e}")))?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_rejects_wrong_nonce_length() {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&[0u8; KEY_LEN]));
        assert!(decrypt(&cipher, b"whatever", &[1, 2, 3]).is_err());
    }

    #[test]
    fn round_trips_through_encrypt_decrypt() {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&[7u8; KEY_LEN]));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes[0] = 1;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, b"hunter2".as_ref()).unwrap();
        assert_eq!(decrypt(&cipher, &ciphertext, &nonce_bytes).unwrap(), "hunter2");
    }
}
