use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::auth::repo_types::User;

/// Request body for `POST /api/users`. Unknown keys are kept as profile fields.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Request body for `POST /api/login`.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Stored user without the password hash; returned by registration.
#[derive(Debug, Serialize)]
pub struct SanitizedUser {
    #[serde(rename = "_id")]
    pub id: String,
    pub email: String,
    pub firstname: String,
    #[serde(
        rename = "createdAt",
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<OffsetDateTime>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl From<User> for SanitizedUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            firstname: user.firstname,
            created_at: user.created_at,
            extra: user.extra,
        }
    }
}

/// The only user fields a successful login reveals.
#[derive(Debug, Serialize)]
pub struct AuthenticatedUser {
    pub email: String,
    pub firstname: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub message: &'static str,
    pub user: AuthenticatedUser,
}

impl LoginResponse {
    pub fn authenticated(user: AuthenticatedUser) -> Self {
        Self {
            success: true,
            message: "User authenticated",
            user,
        }
    }
}
