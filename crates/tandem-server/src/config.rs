use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::str::FromStr;
use std::time::Duration;
use tandem_core::HubConfig;

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Set when `load` had to write a fresh template.
    #[serde(skip)]
    pub generated: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Statement timeout in seconds for PostgreSQL connections (0 = disabled).
    #[serde(default)]
    pub statement_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/tandem.db?mode=rwc".into(),
            max_connections: default_max_connections(),
            statement_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// 0 disables the limit.
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: usize,
    /// 0 disables the idle timeout.
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// 0 disables typing rate limiting.
    #[serde(default = "default_max_typing_events_per_minute")]
    pub max_typing_events_per_minute: u32,
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_frame_bytes: default_max_frame_bytes(),
            max_sessions_per_user: default_max_sessions_per_user(),
            idle_timeout_secs: 0,
            max_typing_events_per_minute: default_max_typing_events_per_minute(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_sessions_per_user: self.max_sessions_per_user,
            resolve_timeout: Duration::from_millis(self.resolve_timeout_ms),
            ..HubConfig::default()
        }
    }

    pub fn session_config(&self) -> tandem_core::GatewayConfig {
        tandem_core::GatewayConfig {
            outbound_queue_capacity: self.outbound_queue_capacity,
            max_frame_bytes: self.max_frame_bytes,
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            max_typing_events_per_minute: self.max_typing_events_per_minute,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 {
                b'0' + idx
            } else {
                b'a' + idx - 10
            })
        })
        .collect()
}

fn default_max_connections() -> u32 {
    10
}
fn default_outbound_queue_capacity() -> usize {
    tandem_core::session::DEFAULT_OUTBOUND_CAPACITY
}
fn default_max_frame_bytes() -> usize {
    tandem_core::DEFAULT_MAX_FRAME_BYTES
}
fn default_max_sessions_per_user() -> usize {
    tandem_core::hub::DEFAULT_MAX_SESSIONS_PER_USER
}
fn default_max_typing_events_per_minute() -> u32 {
    tandem_core::DEFAULT_MAX_TYPING_EVENTS_PER_MINUTE
}
fn default_resolve_timeout_ms() -> u64 {
    tandem_core::hub::DEFAULT_RESOLVE_TIMEOUT.as_millis() as u64
}
fn default_log_filter() -> String {
    "tandem_server=info,tandem_ws=info,tandem_core=info,tandem_db=info,tower_http=info,wire=info"
        .into()
}

fn looks_like_placeholder_secret(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return true;
    }
    normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.contains("replace_with")
        || normalized.starts_with("example")
        || normalized == "devsecret"
        || normalized == "secret"
}

fn validate_configuration(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use the account service's signing secret (at least 32 characters), never a placeholder"
        );
    }
    if config.gateway.outbound_queue_capacity == 0 {
        anyhow::bail!("Invalid gateway.outbound_queue_capacity: must be at least 1");
    }
    if config.gateway.max_frame_bytes == 0 {
        anyhow::bail!("Invalid gateway.max_frame_bytes: must be at least 1");
    }
    if config.gateway.resolve_timeout_ms == 0 {
        anyhow::bail!("Invalid gateway.resolve_timeout_ms: must be at least 1");
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Tandem Gateway Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"

[database]
# Shared with the account and messaging services; only read here.
url = "{db_url}"
max_connections = {max_connections}
# PostgreSQL only (0 = disabled):
# statement_timeout_secs = 30

[auth]
# Must match the secret the account service signs access tokens with.
jwt_secret = "{jwt_secret}"

[gateway]
# Frames buffered per connection before it is dropped as a slow consumer.
outbound_queue_capacity = {queue_capacity}
max_frame_bytes = {max_frame_bytes}
# Concurrent connections per user (0 = unlimited).
max_sessions_per_user = {max_sessions}
# Close connections that send nothing for this long (0 = never).
idle_timeout_secs = {idle_timeout}
max_typing_events_per_minute = {typing_per_minute}
resolve_timeout_ms = {resolve_timeout}

[logging]
# "pretty" or "json". RUST_LOG overrides the filter.
format = "{log_format}"
filter = "{log_filter}"
"#,
        bind_address = config.server.bind_address,
        db_url = config.database.url,
        max_connections = config.database.max_connections,
        jwt_secret = config.auth.jwt_secret,
        queue_capacity = config.gateway.outbound_queue_capacity,
        max_frame_bytes = config.gateway.max_frame_bytes,
        max_sessions = config.gateway.max_sessions_per_user,
        idle_timeout = config.gateway.idle_timeout_secs,
        typing_per_minute = config.gateway.max_typing_events_per_minute,
        resolve_timeout = config.gateway.resolve_timeout_ms,
        log_format = match config.logging.format {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        },
        log_filter = config.logging.filter,
    )
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) {
    if let Some(value) = lookup(name) {
        match value.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => {
                tracing::warn!("Ignoring invalid {} value '{}'", name, value);
            }
        }
    }
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let mut config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            let template = generate_config_template(&config);
            fs::write(path, &template)?;
            config.generated = true;
            config
        };
        let _ = harden_secret_file_permissions(path);

        config.apply_overrides(|name| std::env::var(name).ok());
        validate_configuration(&config)?;
        Ok(config)
    }

    /// Applies `TANDEM_*` overrides from `lookup`. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("TANDEM_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = lookup("TANDEM_DATABASE_URL") {
            self.database.url = value;
        }
        override_parsed(
            &lookup,
            "TANDEM_DATABASE_MAX_CONNECTIONS",
            &mut self.database.max_connections,
        );
        override_parsed(
            &lookup,
            "TANDEM_DATABASE_STATEMENT_TIMEOUT_SECS",
            &mut self.database.statement_timeout_secs,
        );
        if let Some(value) = lookup("TANDEM_JWT_SECRET") {
            self.auth.jwt_secret = value;
        }

        let gateway = &mut self.gateway;
        override_parsed(
            &lookup,
            "TANDEM_GATEWAY_OUTBOUND_QUEUE_CAPACITY",
            &mut gateway.outbound_queue_capacity,
        );
        override_parsed(
            &lookup,
            "TANDEM_GATEWAY_MAX_FRAME_BYTES",
            &mut gateway.max_frame_bytes,
        );
        override_parsed(
            &lookup,
            "TANDEM_GATEWAY_MAX_SESSIONS_PER_USER",
            &mut gateway.max_sessions_per_user,
        );
        override_parsed(
            &lookup,
            "TANDEM_GATEWAY_IDLE_TIMEOUT_SECS",
            &mut gateway.idle_timeout_secs,
        );
        override_parsed(
            &lookup,
            "TANDEM_GATEWAY_MAX_TYPING_EVENTS_PER_MINUTE",
            &mut gateway.max_typing_events_per_minute,
        );
        override_parsed(
            &lookup,
            "TANDEM_GATEWAY_RESOLVE_TIMEOUT_MS",
            &mut gateway.resolve_timeout_ms,
        );

        override_parsed(&lookup, "TANDEM_LOG_FORMAT", &mut self.logging.format);
        if let Some(value) = lookup("TANDEM_LOG_FILTER") {
            self.logging.filter = value;
        }
    }
}
