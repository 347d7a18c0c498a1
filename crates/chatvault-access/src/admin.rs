use std::sync::Arc;

use chatvault_core::types::{AuditEntry, Role, ViewerAccount};
use chatvault_storage::{NewAuditEntry, StorageAdapter};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::instrument;

use crate::error::{AccessError, Result};
use crate::types::{NewViewerAccount, ViewerAccountUpdate};

const PBKDF2_ROUNDS: u32 = 600_000;
const SALT_BYTES: usize = 32;
const HASH_BYTES: usize = 32;

/// Master-only account administration plus the append-only audit log.
/// Every call here is assumed to already be behind a master-role check at
/// the HTTP layer; this service does not re-derive the caller's role.
pub struct AdminService {
    storage: Arc<dyn StorageAdapter>,
}

impl AdminService {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    #[instrument(skip(self, new_account), fields(username = %new_account.username))]
    pub async fn create_viewer_account(
        &self,
        new_account: NewViewerAccount,
        created_by: &str,
    ) -> Result<ViewerAccount> {
        if self
            .storage
            .get_viewer_by_username(&new_account.username)
            .await?
            .is_some()
        {
            return Err(AccessError::AlreadyExists(new_account.username));
        }
        let (hash, salt) = hash_password(&new_account.password);
        let account = self
            .storage
            .create_viewer_account(
                &new_account.username,
                &hash,
                &salt,
                new_account.allowed_chat_ids.as_deref(),
                created_by,
            )
            .await?;
        Ok(account)
    }

    pub async fn list_viewer_accounts(&self) -> Result<Vec<ViewerAccount>> {
        Ok(self.storage.list_viewer_accounts().await?)
    }

    #[instrument(skip(self, update))]
    pub async fn update_viewer_account(&self, id: i64, update: ViewerAccountUpdate) -> Result<()> {
        if self.storage.get_viewer_account(id).await?.is_none() {
            return Err(AccessError::NotFound(id.to_string()));
        }
        let (hash, salt) = match &update.new_password {
            Some(pw) => {
                let (h, s) = hash_password(pw);
                (Some(h), Some(s))
            }
            None => (None, None),
        };
        self.storage
            .update_viewer_account(
                id,
                hash.as_deref(),
                salt.as_deref(),
                update
                    .allowed_chat_ids
                    .as_ref()
                    .map(|opt| opt.as_deref()),
                update.is_active,
            )
            .await?;
        Ok(())
    }

    pub async fn delete_viewer_account(&self, id: i64) -> Result<()> {
        self.storage.delete_viewer_account(id).await?;
        Ok(())
    }

    /// Verify a login attempt's password against the stored hash in
    /// constant time. Returns the account only when active and matching.
    pub async fn verify_login(&self, username: &str, password: &str) -> Result<Option<ViewerAccount>> {
        let Some(account) = self.storage.get_viewer_by_username(username).await? else {
            return Ok(None);
        };
        if !account.is_active {
            return Ok(None);
        }
        if !verify_password(password, &account.password_hash, &account.salt) {
            return Ok(None);
        }
        Ok(Some(account))
    }

    pub async fn record_audit(
        &self,
        username: &str,
        role: Role,
        action: &str,
        endpoint: Option<&str>,
        chat_id: Option<i64>,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<()> {
        self.storage
            .create_audit_log(NewAuditEntry {
                username,
                role,
                action,
                endpoint,
                chat_id,
                ip_address,
                user_agent,
            })
            .await?;
        Ok(())
    }

    pub async fn get_audit_logs(
        &self,
        limit: u32,
        offset: u32,
        username: Option<&str>,
    ) -> Result<(Vec<AuditEntry>, i64)> {
        Ok(self.storage.get_audit_logs(limit, offset, username).await?)
    }
}

/// Hash a plaintext password with PBKDF2-HMAC-SHA256 and a fresh random
/// salt. Returns `(hex_hash, hex_salt)`.
fn hash_password(password: &str) -> (String, String) {
    let mut salt = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut out = [0u8; HASH_BYTES];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut out);
    (hex::encode(out), hex::encode(salt))
}

/// Recompute the hash for `password` under `salt_hex` and compare against
/// `expected_hex` in constant time.
fn verify_password(password: &str, expected_hex: &str, salt_hex: &str) -> bool {
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    let mut out = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut out);
    out.ct_eq(&expected).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_round_trips() {
        let (hash, salt) = hash_password("correct horse battery staple");
        assert!(verify_password("correct horse battery staple", &hash, &salt));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let (hash, salt) = hash_password("correct horse battery staple");
        assert!(!verify_password("wrong password", &hash, &salt));
    }

    #[test]
    fn each_hash_uses_a_fresh_salt() {
        let (hash_a, salt_a) = hash_password("same password");
        let (hash_b, salt_b) = hash_password("same password");
        assert_ne!(salt_a, salt_b);
        assert_ne!(hash_a, hash_b);
    }
}
