use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

/// Argon2 cost parameters used for new password hashes.
#[derive(Debug, Clone)]
pub struct PasswordConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_kib: argon2::Params::DEFAULT_M_COST,
            iterations: argon2::Params::DEFAULT_T_COST,
            parallelism: argon2::Params::DEFAULT_P_COST,
        }
    }
}

/// PostgreSQL connection. `DATABASE_URL` wins; otherwise the parts are used,
/// read from the `host`/`port`/`user`/`password`/`database` variables.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Applies to the parts only; a URL carries its own `sslmode`.
    pub ssl_mode: PgSslMode,
    pub max_connections: u32,
}

impl PgConfig {
    pub fn connect_options(&self) -> anyhow::Result<PgConnectOptions> {
        if let Some(url) = &self.url {
            return url
                .parse::<PgConnectOptions>()
                .context("DATABASE_URL is not a valid PostgreSQL URL");
        }
        let host = self
            .host
            .as_deref()
            .context("DATABASE_URL is not set and no PostgreSQL host was given")?;
        let mut options = PgConnectOptions::new()
            .host(host)
            .port(self.port)
            .ssl_mode(self.ssl_mode);
        if let Some(user) = &self.user {
            options = options.username(user);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        if let Some(database) = &self.database {
            options = options.database(database);
        }
        Ok(options)
    }
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    /// Falls back to the database named in the URI, then `test`.
    pub database: Option<String>,
    pub users_collection: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub pg: PgConfig,
    pub mongo: MongoConfig,
    pub password: PasswordConfig,
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub cors_allowed_origin: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let pg = PgConfig {
            url: non_empty("DATABASE_URL"),
            host: non_empty("host"),
            port: parse_or(&lookup, "port", 5432)?,
            user: non_empty("user"),
            password: lookup("password"),
            database: non_empty("database"),
            ssl_mode: parse_or(&lookup, "PG_SSL_MODE", PgSslMode::Require)?,
            max_connections: parse_or(&lookup, "PG_MAX_CONNECTIONS", 10)?,
        };
        if pg.url.is_none() && pg.host.is_none() {
            anyhow::bail!("DATABASE_URL is not set (nor the PostgreSQL host variable)");
        }
        let mongo = MongoConfig {
            uri: lookup("MONGODB_URI")
                .or_else(|| lookup("MongoDBURI"))
                .context("MONGODB_URI is not set")?,
            database: lookup("MONGODB_DATABASE").filter(|v| !v.is_empty()),
            users_collection: lookup("MONGODB_USERS_COLLECTION")
                .unwrap_or_else(|| "users".into()),
        };

        let defaults = PasswordConfig::default();
        let password = PasswordConfig {
            memory_kib: parse_or(&lookup, "ARGON2_MEMORY_KIB", defaults.memory_kib)?,
            iterations: parse_or(&lookup, "ARGON2_ITERATIONS", defaults.iterations)?,
            parallelism: parse_or(&lookup, "ARGON2_PARALLELISM", defaults.parallelism)?,
        };

        Ok(Self {
            pg,
            mongo,
            password,
            host: lookup("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "APP_PORT", 5000)?,
            request_timeout_secs: parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 30)?,
            cors_allowed_origin: lookup("CORS_ALLOWED_ORIGIN").filter(|v| !v.is_empty()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}
