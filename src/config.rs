use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub relying_party: RelyingPartyConfig,
    #[serde(default)]
    pub stepup: StepUpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

/// Shared-secret token exchange with the hosting platform. The host mints
/// account and primary tokens; this service mints grant tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_service_secret")]
    pub secret: String,
    #[serde(default)]
    pub previous_secrets: Vec<String>,
    #[serde(default = "default_grant_ttl")]
    pub grant_ttl_secs: u64,
    #[serde(default = "default_reauth_max_age")]
    pub reauth_max_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelyingPartyConfig {
    #[serde(default = "default_rp_id")]
    pub rp_id: String,
    #[serde(default = "default_rp_name")]
    pub rp_name: String,
    #[serde(default = "default_rp_origin")]
    pub rp_origin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepUpConfig {
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl_secs: i64,
    #[serde(default = "default_pending_login_ttl")]
    pub pending_login_ttl_secs: i64,
    #[serde(default = "default_backup_code_count")]
    pub backup_code_count: usize,
    #[serde(default = "default_backup_code_length")]
    pub backup_code_length: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_ceremony_timeout")]
    pub ceremony_timeout_ms: u64,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1841
}

fn default_db_path() -> String {
    "data/edustep.db".to_string()
}

fn default_service_secret() -> String {
    // Replaced by a generated secret at startup if left as-is
    "change-this-shared-service-secret".to_string()
}

fn default_grant_ttl() -> u64 {
    120 // seconds; the host exchanges the grant promptly
}

fn default_reauth_max_age() -> u64 {
    300 // 5 minutes of primary-auth freshness for destructive changes
}

fn default_rp_id() -> String {
    "localhost".to_string()
}

fn default_rp_name() -> String {
    "EduStep".to_string()
}

fn default_rp_origin() -> String {
    "http://localhost:3000".to_string()
}

fn default_challenge_ttl() -> i64 {
    300
}

fn default_pending_login_ttl() -> i64 {
    600
}

fn default_backup_code_count() -> usize {
    10
}

fn default_backup_code_length() -> usize {
    8
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_ceremony_timeout() -> u64 {
    60_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: default_service_secret(),
            previous_secrets: Vec::new(),
            grant_ttl_secs: default_grant_ttl(),
            reauth_max_age_secs: default_reauth_max_age(),
        }
    }
}

impl Default for RelyingPartyConfig {
    fn default() -> Self {
        Self {
            rp_id: default_rp_id(),
            rp_name: default_rp_name(),
            rp_origin: default_rp_origin(),
        }
    }
}

impl Default for StepUpConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: default_challenge_ttl(),
            pending_login_ttl_secs: default_pending_login_ttl(),
            backup_code_count: default_backup_code_count(),
            backup_code_length: default_backup_code_length(),
            sweep_interval_secs: default_sweep_interval(),
            ceremony_timeout_ms: default_ceremony_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            tokens: TokenConfig::default(),
            relying_party: RelyingPartyConfig::default(),
            stepup: StepUpConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.ensure_directories()?;
        config.ensure_service_secret()?;
        config.ensure_relying_party_defaults();
        tracing::info!(
            "Relying party config: rp_id={}, rp_origin={}, rp_name={}",
            config.relying_party.rp_id,
            config.relying_party.rp_origin,
            config.relying_party.rp_name
        );
        Ok(config)
    }

    /// Ensure the shared service secret is non-default and persisted
    fn ensure_service_secret(&mut self) -> anyhow::Result<()> {
        if self.tokens.secret == default_service_secret() || self.tokens.secret.is_empty() {
            let secret_path = Path::new("data/.service_secret");

            if secret_path.exists() {
                let secret = fs::read_to_string(secret_path)?;
                self.tokens.secret = secret.trim().to_string();
                tracing::info!("Loaded persisted service secret from data/.service_secret");
            } else {
                let secret = uuid::Uuid::new_v4().to_string();

                if let Some(parent) = secret_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                fs::write(secret_path, &secret)?;
                self.tokens.secret = secret;
                tracing::info!("Generated and persisted new service secret to data/.service_secret");
            }
        }
        Ok(())
    }

    /// Load configuration from conf.ini or config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["conf.ini", "config.toml", "data/conf.ini", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: ES_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Ok(val) = env::var("ES_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = env::var("ES_CONF_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        // Database overrides
        if let Ok(val) = env::var("ES_CONF_DATABASE_PATH") {
            self.database.path = val;
        }

        // Token overrides
        if let Ok(val) = env::var("ES_CONF_TOKENS_SECRET") {
            self.tokens.secret = val;
        }
        if let Ok(val) = env::var("ES_CONF_TOKENS_PREVIOUS_SECRETS") {
            self.tokens.previous_secrets = val
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
        }
        if let Ok(val) = env::var("ES_CONF_TOKENS_GRANT_TTL") {
            if let Ok(secs) = val.parse() {
                self.tokens.grant_ttl_secs = secs;
            }
        }
        if let Ok(val) = env::var("ES_CONF_TOKENS_REAUTH_MAX_AGE") {
            if let Ok(secs) = val.parse() {
                self.tokens.reauth_max_age_secs = secs;
            }
        }

        // Relying party overrides
        if let Ok(val) = env::var("ES_CONF_RP_ID") {
            if !val.trim().is_empty() {
                self.relying_party.rp_id = val;
            }
        }
        if let Ok(val) = env::var("ES_CONF_RP_NAME") {
            if !val.trim().is_empty() {
                self.relying_party.rp_name = val;
            }
        }
        if let Ok(val) = env::var("ES_CONF_RP_ORIGIN") {
            if !val.trim().is_empty() {
                self.relying_party.rp_origin = val;
            }
        }

        // Step-up overrides
        if let Ok(val) = env::var("ES_CONF_STEPUP_CHALLENGE_TTL") {
            if let Ok(secs) = val.parse() {
                self.stepup.challenge_ttl_secs = secs;
            }
        }
        if let Ok(val) = env::var("ES_CONF_STEPUP_PENDING_LOGIN_TTL") {
            if let Ok(secs) = val.parse() {
                self.stepup.pending_login_ttl_secs = secs;
            }
        }
        if let Ok(val) = env::var("ES_CONF_STEPUP_SWEEP_INTERVAL") {
            if let Ok(secs) = val.parse() {
                self.stepup.sweep_interval_secs = secs;
            }
        }
    }

    fn ensure_relying_party_defaults(&mut self) {
        if self.relying_party.rp_id.trim().is_empty() {
            self.relying_party.rp_id = default_rp_id();
        }
        if self.relying_party.rp_name.trim().is_empty() {
            self.relying_party.rp_name = default_rp_name();
        }
        if self.relying_party.rp_origin.trim().is_empty() {
            self.relying_party.rp_origin = default_rp_origin();
        }
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
