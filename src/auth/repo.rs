use anyhow::Context;
use axum::async_trait;
use mongodb::{
    bson::{doc, Bson, DateTime as BsonDateTime, Document},
    error::{ErrorKind, WriteFailure},
    options::{ClientOptions, IndexOptions},
    Client, Collection, Database, IndexModel,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::auth::repo_types::{NewUser, StoreError, User};
use crate::config::MongoConfig;

const DUPLICATE_KEY: i32 = 11000;

/// Credential store access. One record per email.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn insert(&self, user: NewUser) -> Result<User, StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
    async fn close(&self) {}
}

#[derive(Clone)]
pub struct MongoUserStore {
    client: Client,
    db: Database,
    users: Collection<Document>,
}

impl MongoUserStore {
    /// Connects, pings and makes sure the unique email index exists.
    pub async fn connect(cfg: &MongoConfig) -> anyhow::Result<Self> {
        let mut options = ClientOptions::parse(cfg.uri.as_str())
            .await
            .context("parse MongoDB URI")?;
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        let database = cfg
            .database
            .clone()
            .or_else(|| options.default_database.clone())
            .unwrap_or_else(|| "test".to_string());

        let client = Client::with_options(options).context("build MongoDB client")?;
        let db = client.database(&database);
        let store = Self {
            users: db.collection(&cfg.users_collection),
            client,
            db,
        };

        store.ping().await.context("MongoDB ping")?;
        store.ensure_indexes().await?;
        info!(database = %database, collection = %cfg.users_collection, "MongoDB connected");
        Ok(store)
    }

    async fn ensure_indexes(&self) -> anyhow::Result<()> {
        let index = IndexModel::builder()
            .keys(doc! { "email": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.users
            .create_index(index)
            .await
            .context("create unique index on users.email (are there duplicate emails?)")?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for MongoUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let found = self
            .users
            .find_one(doc! { "email": email })
            .await
            .context("users.find_one")?;
        match found {
            Some(document) => Ok(Some(from_document(document)?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, user: NewUser) -> Result<User, StoreError> {
        let document = to_document(&user)?;
        let result = match self.users.insert_one(document).await {
            Ok(r) => r,
            Err(e) if is_duplicate_key(&e) => return Err(StoreError::DuplicateEmail),
            Err(e) => return Err(anyhow::Error::new(e).context("users.insert_one").into()),
        };
        let id = bson_id_to_string(result.inserted_id);
        debug!(user_id = %id, "user document inserted");
        Ok(user.into_user(id))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .context("MongoDB ping")?;
        Ok(())
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(w)) if w.code == DUPLICATE_KEY
    )
}

fn bson_id_to_string(id: Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s,
        other => other.to_string(),
    }
}

fn to_bson_datetime(at: OffsetDateTime) -> BsonDateTime {
    BsonDateTime::from_millis((at.unix_timestamp_nanos() / 1_000_000) as i64)
}

fn from_bson_datetime(at: BsonDateTime) -> anyhow::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(at.timestamp_millis() as i128 * 1_000_000)
        .context("createdAt out of range")
}

/// BSON form of one extra profile field. Fails for values BSON cannot hold,
/// such as integers above `i64::MAX`.
pub(crate) fn extra_field_to_bson(key: &str, value: &serde_json::Value) -> anyhow::Result<Bson> {
    mongodb::bson::to_bson(value).with_context(|| format!("convert field {key:?} to BSON"))
}

pub(crate) fn to_document(user: &NewUser) -> anyhow::Result<Document> {
    let mut document = doc! {
        "email": user.email.as_str(),
        "password": user.password_hash.as_str(),
        "firstname": user.firstname.as_str(),
        "createdAt": to_bson_datetime(user.created_at),
    };
    for (key, value) in &user.extra {
        document.insert(key.clone(), extra_field_to_bson(key, value)?);
    }
    Ok(document)
}

pub(crate) fn from_document(mut document: Document) -> anyhow::Result<User> {
    let id = document
        .remove("_id")
        .map(bson_id_to_string)
        .context("user document has no _id")?;
    let email = match document.remove("email") {
        Some(Bson::String(s)) => s,
        _ => anyhow::bail!("user {id} has no email"),
    };
    let password_hash = match document.remove("password") {
        Some(Bson::String(s)) => s,
        _ => anyhow::bail!("user {id} has no password hash"),
    };
    let firstname = match document.remove("firstname") {
        Some(Bson::String(s)) => s,
        _ => String::new(),
    };
    let created_at = match document.remove("createdAt") {
        Some(Bson::DateTime(at)) => Some(from_bson_datetime(at)?),
        _ => None,
    };
    let extra = document
        .into_iter()
        .map(|(key, value)| (key, value.into_relaxed_extjson()))
        .collect();

    Ok(User {
        id,
        email,
        password_hash,
        firstname,
        created_at,
        extra,
    })
}
