//! External collaborator contracts: session storage, token verification,
//! safety classification.
//!
//! The fabric consumes these capabilities but implements none of the logic
//! behind them; the only concrete implementations shipped here are the JWT
//! verifier and in-memory doubles used by tests and local development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::{FabricError, Result};
use crate::events::now_ts;

/// Minimal per-user record the fabric needs: identity plus display info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSessionRecord {
    pub user_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub created_at: f64,
    pub last_seen_at: f64,
}

impl UserSessionRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = now_ts();
        Self {
            user_id: user_id.into(),
            username: None,
            email: None,
            roles: Vec::new(),
            created_at: now,
            last_seen_at: now,
        }
    }
}

/// Session persistence owned by a collaborator (graph store + cache in the
/// full platform). The fabric uses it only to validate tokens and fetch
/// display info.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<UserSessionRecord>>;
    async fn put(&self, record: UserSessionRecord) -> Result<()>;
    async fn delete(&self, user_id: &str) -> Result<()>;
}

/// In-memory store for tests and single-node development.
#[derive(Default)]
pub struct InMemorySessionStore {
    records: RwLock<HashMap<String, UserSessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, user_id: &str) -> Result<Option<UserSessionRecord>> {
        Ok(self.records.read().await.get(user_id).cloned())
    }

    async fn put(&self, record: UserSessionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.user_id.clone(), record);
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<()> {
        self.records.write().await.remove(user_id);
        Ok(())
    }
}

/// Claims extracted from a verified credential.
#[derive(Debug, Clone)]
pub struct TokenClaims {
    pub user_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub expires_at: Option<u64>,
}

impl TokenClaims {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }
}

/// Credential verification capability used by the connection manager.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<TokenClaims>;
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    sub: String,
    exp: u64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

/// HS256 JWT verifier backed by an optional [`SessionStore`] lookup for
/// display info. Tokens without a known session still authenticate; the
/// store only enriches the claims.
pub struct JwtTokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    store: Option<Arc<dyn SessionStore>>,
}

impl JwtTokenVerifier {
    pub fn new(secret: &str, store: Option<Arc<dyn SessionStore>>) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            store,
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtTokenVerifier {
    async fn verify(&self, token: &str) -> Result<TokenClaims> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| FabricError::Authorization(format!("token verification failed: {e}")))?;

        let mut claims = TokenClaims {
            user_id: data.claims.sub,
            username: data.claims.username,
            email: data.claims.email,
            roles: data.claims.roles,
            expires_at: Some(data.claims.exp),
        };

        if let Some(store) = &self.store {
            if let Ok(Some(record)) = store.get(&claims.user_id).await {
                if claims.username.is_none() {
                    claims.username = record.username;
                }
                if claims.email.is_none() {
                    claims.email = record.email;
                }
                for role in record.roles {
                    if !claims.roles.contains(&role) {
                        claims.roles.push(role);
                    }
                }
            }
        }

        Ok(claims)
    }
}

/// Fixed token table, used by tests and local development.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, TokenClaims>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        self.tokens.insert(
            token.into(),
            TokenClaims {
                user_id,
                username: None,
                email: None,
                roles: Vec::new(),
                expires_at: None,
            },
        );
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<TokenClaims> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| FabricError::Authorization("unknown token".into()))
    }
}

/// Verdict returned by the clinical safety collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub is_crisis: bool,
    #[serde(default)]
    pub categories: Vec<String>,
    pub severity: f64,
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Safety classification capability, implemented outside the core.
#[async_trait]
pub trait SafetyEvaluator: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<SafetyVerdict>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn issue_token(secret: &str, sub: &str, exp_offset: i64) -> String {
        let claims = JwtClaims {
            sub: sub.to_string(),
            exp: (now_ts() as i64 + exp_offset) as u64,
            username: Some("traveler".into()),
            email: None,
            roles: vec![],
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_jwt_verifier_accepts_valid_token() {
        let verifier = JwtTokenVerifier::new("secret", None);
        let token = issue_token("secret", "user-1", 3600);

        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.user_id, "user-1");
        assert_eq!(claims.username.as_deref(), Some("traveler"));
    }

    #[tokio::test]
    async fn test_jwt_verifier_rejects_bad_signature_and_expiry() {
        let verifier = JwtTokenVerifier::new("secret", None);

        let forged = issue_token("other-secret", "user-1", 3600);
        assert!(verifier.verify(&forged).await.is_err());

        let expired = issue_token("secret", "user-1", -3600);
        assert!(verifier.verify(&expired).await.is_err());
    }

    #[tokio::test]
    async fn test_jwt_verifier_enriches_from_session_store() {
        let store = Arc::new(InMemorySessionStore::new());
        let mut record = UserSessionRecord::new("user-1");
        record.roles = vec!["admin".into()];
        store.put(record).await.unwrap();

        let verifier = JwtTokenVerifier::new("secret", Some(store));
        let token = issue_token("secret", "user-1", 3600);
        let claims = verifier.verify(&token).await.unwrap();
        assert!(claims.is_admin());
    }

    #[tokio::test]
    async fn test_session_store_round_trip() {
        let store = InMemorySessionStore::new();
        store.put(UserSessionRecord::new("user-9")).await.unwrap();
        assert!(store.get("user-9").await.unwrap().is_some());
        store.delete("user-9").await.unwrap();
        assert!(store.get("user-9").await.unwrap().is_none());
    }
}
