// dbbackup/src/config/mod.rs
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use url::Url;

use crate::errors::{AppError, Result};

const DEFAULT_EXPORT_DIR: &str = "./backups";
const DEFAULT_MONGO_AUTH_DB: &str = "admin";
const DEFAULT_MYSQL_SSL_MODE: &str = "REQUIRED";

/// The database engines a run can back up, in the order they are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    MySql,
    Postgres,
    Mongo,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::MySql, Engine::Postgres, Engine::Mongo];

    pub fn label(self) -> &'static str {
        match self {
            Engine::MySql => "MySQL",
            Engine::Postgres => "PostgreSQL",
            Engine::Mongo => "MongoDB",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Engine::MySql => 3306,
            Engine::Postgres => 5432,
            Engine::Mongo => 27017,
        }
    }

    /// Key prefix the engine's artifacts are grouped under in the bucket.
    pub fn prefix(self) -> &'static str {
        match self {
            Engine::MySql => "mysql",
            Engine::Postgres => "postgres",
            Engine::Mongo => "mongo",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Engine::MySql | Engine::Postgres => "sql",
            Engine::Mongo => "archive",
        }
    }

    /// Local artifact name for a given `YYYY-MM-DD` date stamp.
    pub fn file_name(self, date_stamp: &str) -> String {
        format!("{}-{}.{}.gz", self.prefix(), date_stamp, self.extension())
    }

    fn uri_schemes(self) -> &'static [&'static str] {
        match self {
            Engine::MySql => &["mysql", "mariadb"],
            Engine::Postgres => &["postgres", "postgresql"],
            Engine::Mongo => &["mongodb", "mongodb+srv"],
        }
    }

    fn env_keys(self) -> EnvKeys {
        match self {
            Engine::MySql => EnvKeys {
                host: "MYSQL_HOST",
                port: "MYSQL_PORT",
                user: "MYSQL_USER",
                password: "MYSQL_PWD",
                password_file: "MYSQL_PASS_FILE",
                uri: "MYSQL_URI",
            },
            Engine::Postgres => EnvKeys {
                host: "POSTGRES_HOST",
                port: "POSTGRES_PORT",
                user: "POSTGRES_USER",
                password: "PGPASSWORD",
                password_file: "POSTGRES_PASS_FILE",
                uri: "POSTGRES_URI",
            },
            Engine::Mongo => EnvKeys {
                host: "MONGO_HOST",
                port: "MONGO_PORT",
                user: "MONGO_USER",
                password: "MONGO_PASS",
                password_file: "MONGO_PASS_FILE",
                uri: "MONGO_URI",
            },
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

struct EnvKeys {
    host: &'static str,
    port: &'static str,
    user: &'static str,
    password: &'static str,
    password_file: &'static str,
    uri: &'static str,
}

/// A database password. Only ever handed to the one subprocess that needs it.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Password(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(****)")
    }
}

/// Connection target for one engine. The password is kept out of this struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub host: String,
    pub port: String,
    pub user: String,
}

impl Credential {
    /// A credential triggers a backup only when both host and user are set.
    pub fn is_active(&self) -> bool {
        !self.host.is_empty() && !self.user.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub credential: Credential,
    pub password: Option<Password>,
}

#[derive(Debug, Clone)]
pub struct MongoSettings {
    pub credential: Credential,
    pub password: Option<Password>,
    pub uri: Option<String>,
    pub auth_db: String,
}

impl MongoSettings {
    pub fn is_active(&self) -> bool {
        self.uri.is_some() || self.credential.is_active()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub export_dir: PathBuf,
    pub mysql: EngineSettings,
    pub mysql_ssl_mode: Option<String>,
    pub postgres: EngineSettings,
    pub mongo: MongoSettings,
    pub storage: StorageConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable source.
    ///
    /// Credentials and secrets are resolved first, then storage, so a missing
    /// password is reported even when the bucket is also missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };

        let mysql = load_engine_settings(Engine::MySql, &env)?;
        let postgres = load_engine_settings(Engine::Postgres, &env)?;
        let mongo = load_mongo_settings(&env)?;

        let mysql_ssl_mode = match env.get("MYSQL_SSL_MODE") {
            Some(mode) if mode.eq_ignore_ascii_case("none") => None,
            Some(mode) => Some(mode),
            None => Some(DEFAULT_MYSQL_SSL_MODE.to_string()),
        };

        let storage = load_storage_config(&env)?;
        let export_dir = env
            .get("EXPORT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_DIR));

        Ok(Settings {
            export_dir,
            mysql,
            mysql_ssl_mode,
            postgres,
            mongo,
            storage,
        })
    }
}

struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed value. Blank counts as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Verbatim value. Only the empty string counts as unset.
    fn secret(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }
}

fn load_storage_config<F>(env: &EnvSource<F>) -> Result<StorageConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let bucket = env
        .get("S3_BUCKET")
        .ok_or_else(|| AppError::Config("S3_BUCKET is required".to_string()))?;
    let force_path_style = env
        .get("S3_FORCE_PATH_STYLE")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    Ok(StorageConfig {
        bucket,
        endpoint: env.get("S3_ENDPOINT"),
        force_path_style,
    })
}

fn parse_port(var: &str, raw: &str) -> Result<u16> {
    match raw.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(AppError::Config(format!(
            "{} must be a port number between 1 and 65535, got '{}'",
            var, raw
        ))),
    }
}

/// Connection details carried by a `*_URI` variable.
#[derive(Debug)]
struct UriCredential {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<Password>,
}

fn parse_connection_uri(engine: Engine, var: &'static str, raw: &str) -> Result<UriCredential> {
    // Never echo the value: it usually carries a password.
    let invalid = |why: String| AppError::Config(format!("{} is not a valid connection URI: {}", var, why));
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;

    let schemes = engine.uri_schemes();
    if !schemes.contains(&url.scheme()) {
        return Err(AppError::Config(format!(
            "{} must use the {}:// scheme, got '{}://'",
            var,
            schemes.join(":// or "),
            url.scheme()
        )));
    }
    if url.port() == Some(0) {
        return Err(invalid("port 0".to_string()));
    }

    let decode = |part: &str| -> Result<Option<String>> {
        if part.is_empty() {
            return Ok(None);
        }
        urlencoding::decode(part)
            .map(|v| Some(v.into_owned()))
            .map_err(|_| invalid("credentials are not valid UTF-8".to_string()))
    };

    Ok(UriCredential {
        host: url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty()),
        port: url.port(),
        user: decode(url.username())?,
        password: url.password().map(decode).transpose()?.flatten().map(Password::new),
    })
}

fn unset_credential(engine: Engine) -> Credential {
    Credential {
        host: String::new(),
        port: engine.default_port().to_string(),
        user: String::new(),
    }
}

/// Explicit variables win over the URI. The port is only checked when the
/// credential will actually be used.
fn load_credential<F>(engine: Engine, env: &EnvSource<F>, from_uri: Option<&UriCredential>) -> Result<Credential>
where
    F: Fn(&str) -> Option<String>,
{
    let keys = engine.env_keys();
    let mut credential = Credential {
        host: env
            .get(keys.host)
            .or_else(|| from_uri.and_then(|u| u.host.clone()))
            .unwrap_or_default(),
        user: env
            .get(keys.user)
            .or_else(|| from_uri.and_then(|u| u.user.clone()))
            .unwrap_or_default(),
        ..unset_credential(engine)
    };
    if !credential.is_active() {
        return Ok(credential);
    }

    let port = match env.get(keys.port) {
        Some(raw) => parse_port(keys.port, &raw)?,
        None => from_uri
            .and_then(|u| u.port)
            .unwrap_or_else(|| engine.default_port()),
    };
    credential.port = port.to_string();
    Ok(credential)
}

/// Resolves a password from the secret file variable, falling back to the
/// direct variable. Trailing line terminators in the file are dropped; the
/// direct variable is taken verbatim.
fn resolve_password<F>(engine: Engine, env: &EnvSource<F>) -> Result<Option<Password>>
where
    F: Fn(&str) -> Option<String>,
{
    let keys = engine.env_keys();
    if let Some(path) = env.get(keys.password_file) {
        let secret = read_secret_file(keys.password_file, Path::new(&path))?;
        return Ok((!secret.is_empty()).then(|| Password::new(secret)));
    }
    Ok(env.secret(keys.password).map(Password::new))
}

fn read_secret_file(var: &'static str, path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path).map_err(|source| AppError::SecretFile {
        var,
        path: path.to_path_buf(),
        source,
    })?;
    Ok(raw.trim_end_matches(['\n', '\r']).to_string())
}

fn missing_password(engine: Engine) -> AppError {
    let keys = engine.env_keys();
    AppError::Config(format!(
        "{} backup is configured but no password was provided: set {} or {}",
        engine, keys.password, keys.password_file
    ))
}

fn load_engine_settings<F>(engine: Engine, env: &EnvSource<F>) -> Result<EngineSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let keys = engine.env_keys();
    let from_uri = env
        .get(keys.uri)
        .map(|raw| parse_connection_uri(engine, keys.uri, &raw))
        .transpose()?;

    let credential = load_credential(engine, env, from_uri.as_ref())?;
    let password = match resolve_password(engine, env)? {
        Some(password) => Some(password),
        None => from_uri.and_then(|u| u.password),
    };
    if credential.is_active() && password.is_none() {
        return Err(missing_password(engine));
    }
    Ok(EngineSettings { credential, password })
}

fn load_mongo_settings<F>(env: &EnvSource<F>) -> Result<MongoSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let keys = Engine::Mongo.env_keys();
    let uri = env.get(keys.uri);
    if let Some(uri) = &uri {
        validate_mongo_uri(uri)?;
    }
    // mongodump gets the URI as-is, so the host variables are unused.
    let credential = match &uri {
        Some(_) => unset_credential(Engine::Mongo),
        None => load_credential(Engine::Mongo, env, None)?,
    };
    let password = resolve_password(Engine::Mongo, env)?;

    let settings = MongoSettings {
        credential,
        password,
        uri,
        auth_db: env
            .get("MONGO_AUTH_DB")
            .unwrap_or_else(|| DEFAULT_MONGO_AUTH_DB.to_string()),
    };

    // A URI may carry its own password.
    if settings.uri.is_none() && settings.credential.is_active() && settings.password.is_none() {
        return Err(missing_password(Engine::Mongo));
    }
    Ok(settings)
}

fn validate_mongo_uri(uri: &str) -> Result<()> {
    let invalid = |why: &str| AppError::Config(format!("MONGO_URI is not a valid connection string: {}", why));
    let Some((scheme, rest)) = uri.split_once("://") else {
        return Err(invalid("missing scheme"));
    };
    if !Engine::Mongo.uri_schemes().contains(&scheme) {
        return Err(AppError::Config(format!(
            "MONGO_URI must use the mongodb:// or mongodb+srv:// scheme, got '{}://'",
            scheme
        )));
    }

    let authority_end = rest.find('/').unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    let (userinfo, hosts) = match authority.rfind('@') {
        Some(at) => authority.split_at(at + 1),
        None => ("", authority),
    };

    // Url cannot hold a seed list, so each host is parsed in its own copy.
    for host in hosts.split(',') {
        let single = format!("{}://{}{}{}", scheme, userinfo, host, tail);
        let parsed = Url::parse(&single).map_err(|e| invalid(&e.to_string()))?;
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host"));
        }
    }
    Ok(())
}

/// Renders a MongoDB URI for logs with any embedded password removed.
pub fn redact_uri(uri: &str) -> String {
    if let Ok(mut parsed) = Url::parse(uri) {
        if parsed.password().is_some() && parsed.set_password(Some("****")).is_ok() {
            return parsed.to_string();
        }
        if parsed.password().is_none() {
            return parsed.to_string();
        }
    }

    // Seed lists ("h1:27017,h2:27017") are not valid URL authorities.
    let Some((scheme, rest)) = uri.split_once("://") else {
        return "<unparseable uri>".to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => {
            let userinfo = &rest[..at];
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{}://{}:****{}", scheme, user, &rest[at..])
        }
        None => uri.to_string(),
    }
}
