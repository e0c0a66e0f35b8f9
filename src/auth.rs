use std::collections::HashMap;
use std::sync::RwLock;

use hmac::{Hmac, Mac};
use rusqlite::params;
use sha2::Sha256;

use crate::db::{Db, generate_token};
use crate::error::ApiError;
use crate::models::Token;

type HmacSha256 = Hmac<Sha256>;

/// Bearer tokens, persisted and cached in memory. Issuance and revocation
/// are administrative operations; ordinary clients only present tokens.
pub struct TokenStore {
    tokens: RwLock<HashMap<String, Token>>,
}

impl TokenStore {
    pub fn new(recovered: Vec<Token>) -> Self {
        Self {
            tokens: RwLock::new(
                recovered.into_iter().map(|t| (t.token.clone(), t)).collect(),
            ),
        }
    }

    /// Verify a presented token: must exist, not be revoked, not be expired.
    /// Returns the bound client_id.
    pub fn verify(&self, token: &str) -> Result<String, ApiError> {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        let record = tokens
            .get(token)
            .ok_or_else(|| ApiError::AuthInvalid("unknown token".to_string()))?;
        if record.revoked {
            return Err(ApiError::AuthInvalid("token revoked".to_string()));
        }
        if record.expires_at.as_str() <= chrono::Utc::now().to_rfc3339().as_str() {
            return Err(ApiError::AuthInvalid("token expired".to_string()));
        }
        Ok(record.client_id.clone())
    }

    pub fn issue(
        &self,
        db: &Db,
        client_id: &str,
        expiry_hours: i64,
    ) -> Result<Token, ApiError> {
        let now = chrono::Utc::now();
        let record = Token {
            token: generate_token(),
            client_id: client_id.to_string(),
            created_at: now.to_rfc3339(),
            expires_at: (now + chrono::Duration::hours(expiry_hours)).to_rfc3339(),
            revoked: false,
        };
        db.conn().execute(
            "INSERT INTO tokens (token, client_id, created_at, expires_at, revoked)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                &record.token,
                &record.client_id,
                &record.created_at,
                &record.expires_at
            ],
        )?;
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.token.clone(), record.clone());
        Ok(record)
    }

    pub fn revoke(&self, db: &Db, token: &str) -> Result<(), ApiError> {
        let updated = db.conn().execute(
            "UPDATE tokens SET revoked = 1 WHERE token = ?1",
            params![token],
        )?;
        if updated == 0 {
            return Err(ApiError::NotFound("token not found".to_string()));
        }
        if let Some(record) = self
            .tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(token)
        {
            record.revoked = true;
        }
        Ok(())
    }
}

// --- Room passwords ---

/// HMAC-SHA256 keyed by the room id, hex-encoded. Keying by room id keeps
/// equal passwords in different rooms from hashing identically.
pub fn hash_room_password(room_id: &str, password: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(room_id.as_bytes())
        .unwrap_or_else(|_| HmacSha256::new_from_slice(b"agent-bus").unwrap());
    mac.update(password.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison via the MAC verifier.
pub fn verify_room_password(room_id: &str, password: &str, expected_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(room_id.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(password.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
