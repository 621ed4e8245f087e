//! Local encrypted secret store
//!
//! Envelope encryption: each secret gets a fresh AES-256-GCM data key, the
//! data key is wrapped by a [`KeyStore`], and only ciphertext, nonce and the
//! wrapped key are persisted. The `(instanceId, key)` pair is bound to the
//! ciphertext as associated data so rows cannot be swapped between secrets.

use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::FleetError;
use crate::store::{Entity, Repo};
use crate::utils::sha256_hash;
use crate::vault::SecretBackend;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Persisted form of one local secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultSecret {
    pub id: String,
    pub instance_id: String,
    pub key: String,
    pub ciphertext: String,
    pub nonce: String,
    pub wrapped_key: String,
    pub key_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VaultSecret {
    pub fn row_id(instance_id: &str, key: &str) -> String {
        format!("{}:{}", instance_id, key)
    }
}

impl Entity for VaultSecret {
    const COLLECTION: &'static str = "vault_secrets";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Wraps and unwraps data keys. Stands in for a managed keystore.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Id of the key new data keys are wrapped with
    fn key_id(&self) -> &str;

    async fn wrap(&self, data_key: &[u8]) -> Result<Vec<u8>, FleetError>;

    async fn unwrap(&self, key_id: &str, wrapped: &[u8]) -> Result<Vec<u8>, FleetError>;
}

fn seal(cipher: &Aes256Gcm, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>), FleetError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| FleetError::VaultError("encryption failed".to_string()))?;
    Ok((nonce.to_vec(), ciphertext))
}

fn open(cipher: &Aes256Gcm, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, FleetError> {
    if nonce.len() != NONCE_LEN {
        return Err(FleetError::VaultError(format!("bad nonce length {}", nonce.len())));
    }
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| FleetError::VaultError("decryption failed; wrong key or tampered row".to_string()))
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, FleetError> {
    Aes256Gcm::new_from_slice(key)
        .map_err(|_| FleetError::VaultError(format!("key must be {} bytes", KEY_LEN)))
}

/// Wraps data keys with a single master key held in memory
pub struct StaticKeyStore {
    key_id: String,
    cipher: Aes256Gcm,
}

impl StaticKeyStore {
    pub fn new(master_key: &[u8]) -> Result<Self, FleetError> {
        Ok(Self {
            // Identifies the master key without revealing it
            key_id: format!("static:{}", &sha256_hash(master_key)[..12]),
            cipher: cipher_for(master_key)?,
        })
    }

    /// Master key from a base64 environment variable
    pub fn from_env(var: &str) -> Result<Self, FleetError> {
        let encoded = std::env::var(var)
            .map_err(|_| FleetError::ConfigError(format!("vault master key variable {} is not set", var)))?;
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| FleetError::ConfigError(format!("{} is not valid base64: {}", var, e)))?;
        Self::new(&key)
    }

    /// Random master key; secrets do not survive a restart
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            key_id: format!("static:{}", &sha256_hash(&key)[..12]),
            cipher: Aes256Gcm::new(&key),
        }
    }
}

#[async_trait]
impl KeyStore for StaticKeyStore {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn wrap(&self, data_key: &[u8]) -> Result<Vec<u8>, FleetError> {
        let (mut nonce, ciphertext) = seal(&self.cipher, data_key, self.key_id.as_bytes())?;
        nonce.extend(ciphertext);
        Ok(nonce)
    }

    async fn unwrap(&self, key_id: &str, wrapped: &[u8]) -> Result<Vec<u8>, FleetError> {
        if key_id != self.key_id {
            return Err(FleetError::VaultError(format!("unknown wrapping key {}", key_id)));
        }
        if wrapped.len() <= NONCE_LEN {
            return Err(FleetError::VaultError("wrapped key is truncated".to_string()));
        }
        let (nonce, ciphertext) = wrapped.split_at(NONCE_LEN);
        open(&self.cipher, nonce, ciphertext, key_id.as_bytes())
    }
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>, FleetError> {
    STANDARD
        .decode(value)
        .map_err(|e| FleetError::VaultError(format!("corrupt {}: {}", field, e)))
}

/// Secret backend for LOCAL and DOCKER instances
pub struct LocalEncryptedStore {
    rows: Repo<VaultSecret>,
    keys: Arc<dyn KeyStore>,
}

impl LocalEncryptedStore {
    pub fn new(rows: Repo<VaultSecret>, keys: Arc<dyn KeyStore>) -> Self {
        Self { rows, keys }
    }

    async fn encrypt(&self, id: &str, value: &SecretString) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), FleetError> {
        let data_key = Aes256Gcm::generate_key(OsRng);
        let (nonce, ciphertext) = seal(&Aes256Gcm::new(&data_key), value.expose_secret().as_bytes(), id.as_bytes())?;
        let wrapped = self.keys.wrap(&data_key).await?;
        Ok((nonce, ciphertext, wrapped))
    }

    async fn decrypt(&self, row: &VaultSecret) -> Result<SecretString, FleetError> {
        let data_key = self
            .keys
            .unwrap(&row.key_id, &decode("wrappedKey", &row.wrapped_key)?)
            .await?;
        let plaintext = open(
            &cipher_for(&data_key)?,
            &decode("nonce", &row.nonce)?,
            &decode("ciphertext", &row.ciphertext)?,
            row.id.as_bytes(),
        )?;
        let value = String::from_utf8(plaintext)
            .map_err(|_| FleetError::VaultError(format!("secret {} is not UTF-8", row.id)))?;
        Ok(SecretString::from(value))
    }
}

#[async_trait]
impl SecretBackend for LocalEncryptedStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn store_secret(&self, instance_id: &str, key: &str, value: &SecretString) -> Result<(), FleetError> {
        let id = VaultSecret::row_id(instance_id, key);
        let (nonce, ciphertext, wrapped) = self.encrypt(&id, value).await?;
        let now = Utc::now();
        let created_at = match self.rows.get(&id).await? {
            Some(existing) => existing.value.created_at,
            None => now,
        };
        let row = VaultSecret {
            id,
            instance_id: instance_id.to_string(),
            key: key.to_string(),
            ciphertext: STANDARD.encode(ciphertext),
            nonce: STANDARD.encode(nonce),
            wrapped_key: STANDARD.encode(wrapped),
            key_id: self.keys.key_id().to_string(),
            created_at,
            updated_at: now,
        };
        self.rows.upsert(&row).await?;
        debug!(instance_id = %instance_id, "Stored local secret {}", key);
        Ok(())
    }

    async fn get_secret(&self, instance_id: &str, key: &str) -> Result<Option<SecretString>, FleetError> {
        match self.rows.get(&VaultSecret::row_id(instance_id, key)).await? {
            Some(row) => Ok(Some(self.decrypt(&row.value).await?)),
            None => Ok(None),
        }
    }

    async fn delete_secret(&self, instance_id: &str, key: &str) -> Result<(), FleetError> {
        self.rows.delete(&VaultSecret::row_id(instance_id, key)).await?;
        Ok(())
    }

    fn reference(&self, _instance_id: &str, _key: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Stores;

    fn store() -> (Stores, LocalEncryptedStore) {
        let stores = Stores::in_memory();
        let vault = LocalEncryptedStore::new(stores.repo(), Arc::new(StaticKeyStore::generate()));
        (stores, vault)
    }

    #[tokio::test]
    async fn test_value_is_encrypted_at_rest() {
        let (stores, vault) = store();
        vault
            .store_secret("i-1", "token", &SecretString::from("hunter2".to_string()))
            .await
            .unwrap();

        let row = stores.repo::<VaultSecret>().load("i-1:token").await.unwrap().value;
        assert!(!row.ciphertext.contains("hunter2"));
        assert_ne!(STANDARD.decode(&row.ciphertext).unwrap(), b"hunter2".to_vec());

        let value = vault.get_secret("i-1", "token").await.unwrap().unwrap();
        assert_eq!(value.expose_secret(), "hunter2");
    }

    #[tokio::test]
    async fn test_overwrite_keeps_created_at() {
        let (stores, vault) = store();
        vault.store_secret("i-1", "k", &SecretString::from("a".to_string())).await.unwrap();
        let first = stores.repo::<VaultSecret>().load("i-1:k").await.unwrap().value;
        vault.store_secret("i-1", "k", &SecretString::from("b".to_string())).await.unwrap();
        let second = stores.repo::<VaultSecret>().load("i-1:k").await.unwrap().value;

        assert_eq!(first.created_at, second.created_at);
        assert_ne!(first.wrapped_key, second.wrapped_key);
        assert_eq!(vault.get_secret("i-1", "k").await.unwrap().unwrap().expose_secret(), "b");
    }

    #[tokio::test]
    async fn test_swapped_rows_fail_to_decrypt() {
        let (stores, vault) = store();
        vault.store_secret("i-1", "a", &SecretString::from("one".to_string())).await.unwrap();
        let repo = stores.repo::<VaultSecret>();
        let mut row = repo.load("i-1:a").await.unwrap().value;
        row.id = "i-2:a".to_string();
        row.instance_id = "i-2".to_string();
        repo.upsert(&row).await.unwrap();

        let err = vault.get_secret("i-2", "a").await.unwrap_err();
        assert!(matches!(err, FleetError::VaultError(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_, vault) = store();
        vault.delete_secret("i-1", "missing").await.unwrap();
        vault.store_secret("i-1", "k", &SecretString::from("v".to_string())).await.unwrap();
        vault.delete_secret("i-1", "k").await.unwrap();
        vault.delete_secret("i-1", "k").await.unwrap();
        assert!(vault.get_secret("i-1", "k").await.unwrap().is_none());
    }

    #[test]
    fn test_master_key_length_is_checked() {
        assert!(StaticKeyStore::new(&[0u8; 16]).is_err());
        assert!(StaticKeyStore::new(&[7u8; 32]).is_ok());
    }
}
