use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;

/// User record in the credential store.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,                         // store-assigned id, hex for ObjectId
    pub email: String,                      // normalized, unique
    pub password_hash: String,              // Argon2 PHC string, never exposed
    pub firstname: String,
    pub created_at: Option<OffsetDateTime>, // absent on records created elsewhere
    pub extra: Map<String, Value>,          // uninterpreted profile fields
}

/// Record to insert at registration.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub firstname: String,
    pub created_at: OffsetDateTime,
    pub extra: Map<String, Value>,
}

impl NewUser {
    pub fn into_user(self, id: String) -> User {
        User {
            id,
            email: self.email,
            password_hash: self.password_hash,
            firstname: self.firstname,
            created_at: Some(self.created_at),
            extra: self.extra,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique index on `email` rejected the insert.
    #[error("email already registered")]
    DuplicateEmail,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
