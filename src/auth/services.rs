use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::auth::{
    dto::{AuthenticatedUser, LoginRequest, RegisterRequest, SanitizedUser},
    password::PasswordService,
    repo::{extra_field_to_bson, UserStore},
    repo_types::{NewUser, StoreError},
};
use crate::error::{AppError, AppResult};

const RESERVED_FIELDS: &[&str] = &["_id", "createdAt"];

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateEmail => AppError::Conflict,
            StoreError::Backend(e) => AppError::Internal(e),
        }
    }
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Emails compare case-insensitively: everything is stored and looked up lowercased.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn required_trimmed(value: Option<String>, field: &str) -> AppResult<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(AppError::validation(format!("{field} is required"))),
    }
}

// Passwords are taken verbatim; only emptiness is rejected.
fn required_password(value: Option<String>) -> AppResult<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::validation("password is required")),
    }
}

fn check_extra_fields(extra: &Map<String, Value>) -> AppResult<()> {
    for (key, value) in extra {
        if RESERVED_FIELDS.contains(&key.as_str()) {
            return Err(AppError::validation(format!("field {key} cannot be set")));
        }
        if key.is_empty() || key.starts_with('$') || key.contains('\0') {
            return Err(AppError::validation(format!("invalid field name {key:?}")));
        }
        if extra_field_to_bson(key, value).is_err() {
            return Err(AppError::validation(format!(
                "field {key} has a value that cannot be stored"
            )));
        }
    }
    Ok(())
}

/// Registers a user. All input checks run before the store is touched.
pub async fn register(
    users: &dyn UserStore,
    passwords: &PasswordService,
    req: RegisterRequest,
) -> AppResult<SanitizedUser> {
    let email = normalize_email(&required_trimmed(req.email, "email")?);
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AppError::validation("email is not a valid address"));
    }
    let password = required_password(req.password)?;
    let firstname = required_trimmed(req.firstname, "firstname")?;
    check_extra_fields(&req.extra)?;

    if users.find_by_email(&email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(AppError::Conflict);
    }

    let password_hash = passwords.hash(password).await?;

    // The unique index still catches a concurrent registration of the same email.
    let user = users
        .insert(NewUser {
            email,
            password_hash,
            firstname,
            created_at: OffsetDateTime::now_utc(),
            extra: req.extra,
        })
        .await
        .map_err(|e| {
            if matches!(e, StoreError::DuplicateEmail) {
                warn!("email registered concurrently");
            }
            AppError::from(e)
        })?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok(SanitizedUser::from(user))
}

/// Checks credentials. Unknown email and wrong password fail the same way.
pub async fn login(
    users: &dyn UserStore,
    passwords: &PasswordService,
    req: LoginRequest,
) -> AppResult<AuthenticatedUser> {
    let email = normalize_email(&required_trimmed(req.email, "email")?);
    let password = required_password(req.password)?;

    let user = match users.find_by_email(&email).await? {
        Some(u) => u,
        None => {
            passwords.verify_dummy(password).await;
            warn!(email = %email, "login unknown email");
            return Err(AppError::InvalidCredentials);
        }
    };

    if !passwords.verify(password, user.password_hash.clone()).await? {
        warn!(email = %email, user_id = %user.id, "login invalid password");
        return Err(AppError::InvalidCredentials);
    }

    info!(user_id = %user.id, email = %user.email, "user logged in");
    Ok(AuthenticatedUser {
        email: user.email,
        firstname: user.firstname,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::auth::password::cheap_config;
    use crate::auth::repo::memory::MemoryUserStore;
    use crate::auth::repo_types::User;

    fn passwords() -> PasswordService {
        PasswordService::new(&cheap_config()).unwrap()
    }

    fn register_req(body: Value) -> RegisterRequest {
        serde_json::from_value(body).unwrap()
    }

    fn login_req(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: Some(email.into()),
            password: Some(password.into()),
        }
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("a@x.com"));
        assert!(is_valid_email("first.last+tag@sub.example.org"));
        assert!(!is_valid_email("a@x"));
        assert!(!is_valid_email("ax.com"));
        assert!(!is_valid_email("a b@x.com"));
        assert_eq!(normalize_email("  A@X.Com "), "a@x.com");
    }

    #[tokio::test]
    async fn register_then_login() {
        let store = MemoryUserStore::default();
        let pw = passwords();

        let user = register(
            &store,
            &pw,
            register_req(json!({ "email": "a@x.com", "password": "p1", "firstname": "A" })),
        )
        .await
        .expect("register should succeed");
        assert_eq!(user.email, "a@x.com");
        assert_eq!(user.firstname, "A");

        let stored = store.get("a@x.com").unwrap();
        assert_ne!(stored.password_hash, "p1");

        let authed = login(&store, &pw, login_req("a@x.com", "p1")).await.unwrap();
        assert_eq!(authed.email, "a@x.com");
        assert_eq!(authed.firstname, "A");
    }

    #[tokio::test]
    async fn register_normalizes_email_and_trims_firstname() {
        let store = MemoryUserStore::default();
        let pw = passwords();
        let user = register(
            &store,
            &pw,
            register_req(json!({ "email": " Bob@X.com ", "password": " spaced ", "firstname": " Bob " })),
        )
        .await
        .unwrap();
        assert_eq!(user.email, "bob@x.com");
        assert_eq!(user.firstname, "Bob");

        // password is not trimmed
        assert!(login(&store, &pw, login_req("BOB@x.com", " spaced ")).await.is_ok());
        assert!(matches!(
            login(&store, &pw, login_req("bob@x.com", "spaced")).await,
            Err(AppError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn register_keeps_extra_profile_fields() {
        let store = MemoryUserStore::default();
        let user = register(
            &store,
            &passwords(),
            register_req(json!({
                "email": "a@x.com", "password": "p1", "firstname": "A",
                "lastname": "Z", "team": { "name": "support" }
            })),
        )
        .await
        .unwrap();
        assert_eq!(user.extra.get("lastname"), Some(&json!("Z")));
        assert_eq!(store.get("a@x.com").unwrap().extra.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_email_conflicts_and_keeps_original() {
        let store = MemoryUserStore::default();
        let pw = passwords();
        register(
            &store,
            &pw,
            register_req(json!({ "email": "a@x.com", "password": "p1", "firstname": "A" })),
        )
        .await
        .unwrap();
        let before = store.get("a@x.com").unwrap();

        let err = register(
            &store,
            &pw,
            register_req(json!({ "email": "A@x.com", "password": "other", "firstname": "B" })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict));

        let after = store.get("a@x.com").unwrap();
        assert_eq!(after.password_hash, before.password_hash);
        assert_eq!(after.firstname, "A");
        assert_eq!(store.len(), 1);
        // existence check stopped it; no insert was attempted
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_fields_fail_before_store_access() {
        let store = MemoryUserStore::default();
        let pw = passwords();
        let bodies = [
            json!({ "password": "p1", "firstname": "A" }),
            json!({ "email": "a@x.com", "firstname": "A" }),
            json!({ "email": "a@x.com", "password": "p1" }),
            json!({ "email": "", "password": "p1", "firstname": "A" }),
            json!({ "email": "a@x.com", "password": "", "firstname": "A" }),
            json!({ "email": "a@x.com", "password": "p1", "firstname": "   " }),
            json!({ "email": "not-an-email", "password": "p1", "firstname": "A" }),
            json!({ "email": "a@x.com", "password": "p1", "firstname": "A", "_id": "x" }),
            json!({ "email": "a@x.com", "password": "p1", "firstname": "A", "$where": "1" }),
            json!({ "email": "a@x.com", "password": "p1", "firstname": "A", "n": u64::MAX }),
        ];
        for body in bodies {
            let err = register(&store, &pw, register_req(body.clone()))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "body {body}");
        }

        let logins = [
            LoginRequest { email: None, password: Some("p1".into()) },
            LoginRequest { email: Some("a@x.com".into()), password: None },
            LoginRequest { email: Some(" ".into()), password: Some("p1".into()) },
            LoginRequest { email: Some("a@x.com".into()), password: Some(String::new()) },
        ];
        for req in logins {
            assert!(matches!(
                login(&store, &pw, req).await,
                Err(AppError::Validation(_))
            ));
        }

        assert_eq!(store.accesses(), 0);
    }

    #[tokio::test]
    async fn unknown_email_and_wrong_password_are_indistinguishable() {
        let store = MemoryUserStore::default();
        let pw = passwords();
        register(
            &store,
            &pw,
            register_req(json!({ "email": "a@x.com", "password": "p1", "firstname": "A" })),
        )
        .await
        .unwrap();

        let unknown = login(&store, &pw, login_req("nobody@x.com", "p1"))
            .await
            .unwrap_err();
        let wrong = login(&store, &pw, login_req("a@x.com", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(unknown, AppError::InvalidCredentials));
        assert!(matches!(wrong, AppError::InvalidCredentials));
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert_eq!(unknown.status(), wrong.status());
    }

    /// Misses on lookup but loses the insert, like a concurrent registration.
    struct RacingUserStore;

    #[axum::async_trait]
    impl UserStore for RacingUserStore {
        async fn find_by_email(&self, _email: &str) -> Result<Option<User>, StoreError> {
            Ok(None)
        }

        async fn insert(&self, _user: NewUser) -> Result<User, StoreError> {
            Err(StoreError::DuplicateEmail)
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_key_on_insert_is_conflict() {
        let err = register(
            &RacingUserStore,
            &passwords(),
            register_req(json!({ "email": "a@x.com", "password": "p1", "firstname": "A" })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict));
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn login_accepts_bcrypt_hash_from_earlier_records() {
        let store = MemoryUserStore::default();
        store
            .insert(NewUser {
                email: "legacy@x.com".into(),
                password_hash: bcrypt::hash("p1", 4).unwrap(),
                firstname: "L".into(),
                created_at: OffsetDateTime::now_utc(),
                extra: Map::new(),
            })
            .await
            .unwrap();
        let pw = passwords();

        let user = login(&store, &pw, login_req("legacy@x.com", "p1")).await.unwrap();
        assert_eq!(user.firstname, "L");
        assert!(matches!(
            login(&store, &pw, login_req("legacy@x.com", "wrong")).await,
            Err(AppError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn store_failure_is_internal() {
        let store = MemoryUserStore::default();
        store.failing.store(true, Ordering::SeqCst);
        let pw = passwords();

        let err = register(
            &store,
            &pw,
            register_req(json!({ "email": "a@x.com", "password": "p1", "firstname": "A" })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));

        let err = login(&store, &pw, login_req("a@x.com", "p1")).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[tokio::test]
    async fn malformed_stored_hash_is_internal() {
        let store = MemoryUserStore::default();
        store
            .insert(NewUser {
                email: "legacy@x.com".into(),
                password_hash: "plaintext-from-somewhere".into(),
                firstname: "L".into(),
                created_at: OffsetDateTime::now_utc(),
                extra: Map::new(),
            })
            .await
            .unwrap();
        let err = login(&store, &passwords(), login_req("legacy@x.com", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }
}
