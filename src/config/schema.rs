use anyhow::{ensure, Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path the config was loaded from, if any. Not serialized.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub environment: Environment,

    /// Default tracing level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: None,
            environment: Environment::default(),
            log_level: default_log_level(),
            gateway: GatewayConfig::default(),
            llm: LlmConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => anyhow::bail!("unknown environment: {other}"),
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Bind port (default: 8000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Origins allowed by CORS.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// Max request body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Take the client IP from the first `X-Forwarded-For` entry.
    /// Only enable behind a reverse proxy that sets the header.
    #[serde(default)]
    pub trust_proxy_headers: bool,
    /// Accept `X-User-ID` / `X-User-Tier` from an upstream auth proxy.
    #[serde(default)]
    pub trust_identity_headers: bool,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            cors_origins: default_cors_origins(),
            max_body_bytes: default_max_body_bytes(),
            trust_proxy_headers: false,
            trust_identity_headers: false,
        }
    }
}

// ── LLM ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    #[default]
    Google,
    /// No upstream: every vent gets the canned reply.
    Fallback,
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmProvider::OpenAi => write!(f, "openai"),
            LlmProvider::Anthropic => write!(f, "anthropic"),
            LlmProvider::Google => write!(f, "google"),
            LlmProvider::Fallback => write!(f, "fallback"),
        }
    }
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "google" | "gemini" => Ok(Self::Google),
            "fallback" | "none" => Ok(Self::Fallback),
            other => anyhow::bail!("unknown LLM provider: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub google_api_key: Option<String>,
    #[serde(default = "default_model_openai")]
    pub model_openai: String,
    #[serde(default = "default_model_anthropic")]
    pub model_anthropic: String,
    #[serde(default = "default_model_google")]
    pub model_google: String,
    /// Override the vendor API base URL (proxies, self-hosted gateways, tests).
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Whole-request timeout for the upstream call.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Max silence between upstream chunks before the stream is abandoned.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_model_openai() -> String {
    "gpt-4o-mini".into()
}

fn default_model_anthropic() -> String {
    "claude-3-haiku-20240307".into()
}

fn default_model_google() -> String {
    "gemini-2.5-flash-preview-05-20".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    2048
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    30
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            openai_api_key: None,
            anthropic_api_key: None,
            google_api_key: None,
            model_openai: default_model_openai(),
            model_anthropic: default_model_anthropic(),
            model_google: default_model_google(),
            base_url: None,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl LlmConfig {
    /// API key for the selected provider; empty strings count as missing.
    pub fn api_key(&self) -> Option<&str> {
        let key = match self.provider {
            LlmProvider::OpenAi => self.openai_api_key.as_deref(),
            LlmProvider::Anthropic => self.anthropic_api_key.as_deref(),
            LlmProvider::Google => self.google_api_key.as_deref(),
            LlmProvider::Fallback => None,
        };
        key.map(str::trim).filter(|k| !k.is_empty())
    }

    pub fn model(&self) -> &str {
        match self.provider {
            LlmProvider::OpenAi => &self.model_openai,
            LlmProvider::Anthropic => &self.model_anthropic,
            LlmProvider::Google => &self.model_google,
            LlmProvider::Fallback => "fallback",
        }
    }
}

// ── Rate limiting ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Expiry is set once, when the counter is created.
    Fixed,
    /// Expiry is pushed back on every accepted request.
    #[default]
    Sliding,
}

impl FromStr for WindowMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "sliding" => Ok(Self::Sliding),
            other => anyhow::bail!("unknown window mode: {other}"),
        }
    }
}

/// What to do with a vent when the counter store errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    #[default]
    Open,
    Closed,
}

impl FromStr for FailMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => anyhow::bail!("unknown fail mode: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_anon_daily_limit")]
    pub anon_daily_limit: u32,
    #[serde(default = "default_signed_in_daily_limit")]
    pub signed_in_daily_limit: u32,
    #[serde(default = "default_premium_daily_limit")]
    pub premium_daily_limit: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub window_mode: WindowMode,
    #[serde(default)]
    pub fail_mode: FailMode,
}

fn default_anon_daily_limit() -> u32 {
    10
}

fn default_signed_in_daily_limit() -> u32 {
    25
}

fn default_premium_daily_limit() -> u32 {
    100
}

/// Longest accepted rate-limit window: one year.
pub const MAX_WINDOW_SECS: u64 = 365 * 86_400;

fn default_window_secs() -> u64 {
    86_400
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            anon_daily_limit: default_anon_daily_limit(),
            signed_in_daily_limit: default_signed_in_daily_limit(),
            premium_daily_limit: default_premium_daily_limit(),
            window_secs: default_window_secs(),
            window_mode: WindowMode::default(),
            fail_mode: FailMode::default(),
        }
    }
}

// ── Cache ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

impl FromStr for CacheBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => anyhow::bail!("unknown cache backend: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// How often the in-memory store drops expired counters.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".into()
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            redis_url: default_redis_url(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

/// `~/.ventvault/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    UserDirs::new().map(|u| u.home_dir().join(".ventvault").join("config.toml"))
}

/// Config path named by `explicit` or `VENTVAULT_CONFIG`, if any.
pub fn requested_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    select_config_path(explicit, std::env::var_os("VENTVAULT_CONFIG"))
}

fn select_config_path(explicit: Option<&Path>, env: Option<OsString>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env.filter(|v| !v.is_empty()).map(PathBuf::from))
}

impl Config {
    /// Resolve, parse, override and validate the effective config.
    ///
    /// Resolution order: `explicit`, then `VENTVAULT_CONFIG`, then
    /// `~/.ventvault/config.toml` if it exists, else built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match requested_config_path(explicit) {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable source. The first non-empty
    /// value among each group of names wins.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| lookup(name))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        if let Some(env) = get(&["VENTVAULT_ENVIRONMENT", "ENVIRONMENT"]) {
            match env.parse() {
                Ok(env) => self.environment = env,
                Err(e) => tracing::warn!("Ignoring ENVIRONMENT override: {e}"),
            }
        }
        if let Some(level) = get(&["VENTVAULT_LOG_LEVEL", "LOG_LEVEL"]) {
            self.log_level = level.to_ascii_lowercase();
        }

        // Gateway
        if let Some(host) = get(&["VENTVAULT_HOST", "HOST"]) {
            self.gateway.host = host;
        }
        if let Some(port) = get(&["VENTVAULT_PORT", "PORT"]).and_then(|p| p.parse().ok()) {
            self.gateway.port = port;
        }
        if let Some(origins) = get(&["VENTVAULT_CORS_ORIGINS", "CORS_ORIGINS"]) {
            self.gateway.cors_origins = parse_list(&origins);
        }
        if let Some(val) = get(&["VENTVAULT_TRUST_PROXY_HEADERS"]) {
            self.gateway.trust_proxy_headers = parse_bool(&val);
        }
        if let Some(val) = get(&["VENTVAULT_TRUST_IDENTITY_HEADERS"]) {
            self.gateway.trust_identity_headers = parse_bool(&val);
        }

        // LLM
        if let Some(provider) = get(&["VENTVAULT_LLM_PROVIDER", "LLM_PROVIDER"]) {
            match provider.parse() {
                Ok(provider) => self.llm.provider = provider,
                Err(e) => tracing::warn!("Ignoring LLM_PROVIDER override: {e}"),
            }
        }
        if let Some(key) = get(&["VENTVAULT_OPENAI_API_KEY", "OPENAI_API_KEY"]) {
            self.llm.openai_api_key = Some(key);
        }
        if let Some(key) = get(&["VENTVAULT_ANTHROPIC_API_KEY", "ANTHROPIC_API_KEY"]) {
            self.llm.anthropic_api_key = Some(key);
        }
        if let Some(key) = get(&["VENTVAULT_GOOGLE_API_KEY", "GOOGLE_API_KEY", "GEMINI_API_KEY"]) {
            self.llm.google_api_key = Some(key);
        }
        if let Some(model) = get(&["LLM_MODEL_OPENAI"]) {
            self.llm.model_openai = model;
        }
        if let Some(model) = get(&["LLM_MODEL_ANTHROPIC"]) {
            self.llm.model_anthropic = model;
        }
        if let Some(model) = get(&["LLM_MODEL_GOOGLE"]) {
            self.llm.model_google = model;
        }
        if let Some(url) = get(&["VENTVAULT_LLM_BASE_URL"]) {
            self.llm.base_url = Some(url);
        }
        if let Some(temp) = get(&["VENTVAULT_LLM_TEMPERATURE", "LLM_TEMPERATURE"])
            .and_then(|t| t.parse::<f64>().ok())
        {
            self.llm.temperature = temp;
        }
        if let Some(tokens) = get(&["VENTVAULT_MAX_OUTPUT_TOKENS", "MAX_OUTPUT_TOKENS"])
            .and_then(|t| t.parse().ok())
        {
            self.llm.max_output_tokens = tokens;
        }
        // LLM_TIMEOUT is fractional seconds in older deployments.
        if let Some(secs) = get(&["VENTVAULT_LLM_TIMEOUT", "LLM_TIMEOUT"])
            .and_then(|t| t.parse::<f64>().ok())
            .filter(|t| t.is_finite() && *t > 0.0)
        {
            self.llm.timeout_secs = secs.ceil() as u64;
        }

        // Rate limiting
        if let Some(limit) = get(&["ANON_DAILY_LIMIT"]).and_then(|v| v.parse().ok()) {
            self.rate_limit.anon_daily_limit = limit;
        }
        if let Some(limit) = get(&["SIGNED_IN_DAILY_LIMIT"]).and_then(|v| v.parse().ok()) {
            self.rate_limit.signed_in_daily_limit = limit;
        }
        if let Some(limit) = get(&["PREMIUM_DAILY_LIMIT"]).and_then(|v| v.parse().ok()) {
            self.rate_limit.premium_daily_limit = limit;
        }
        if let Some(mode) = get(&["VENTVAULT_RATE_LIMIT_FAIL_MODE"]) {
            match mode.parse() {
                Ok(mode) => self.rate_limit.fail_mode = mode,
                Err(e) => tracing::warn!("Ignoring fail mode override: {e}"),
            }
        }

        // Cache: a REDIS_URL implies the redis backend unless told otherwise.
        if let Some(url) = get(&["VENTVAULT_REDIS_URL", "REDIS_URL"]) {
            self.cache.redis_url = url;
            self.cache.backend = CacheBackend::Redis;
        }
        if let Some(backend) = get(&["VENTVAULT_CACHE_BACKEND"]) {
            match backend.parse() {
                Ok(backend) => self.cache.backend = backend,
                Err(e) => tracing::warn!("Ignoring cache backend override: {e}"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limit;
        ensure!(rl.anon_daily_limit >= 1, "rate_limit.anon_daily_limit must be >= 1");
        ensure!(
            rl.signed_in_daily_limit >= 1,
            "rate_limit.signed_in_daily_limit must be >= 1"
        );
        ensure!(
            rl.premium_daily_limit >= 1,
            "rate_limit.premium_daily_limit must be >= 1"
        );
        ensure!(
            (1..=MAX_WINDOW_SECS).contains(&rl.window_secs),
            "rate_limit.window_secs must be within 1..={MAX_WINDOW_SECS} (got {})",
            rl.window_secs
        );

        let llm = &self.llm;
        ensure!(
            (0.0..=1.0).contains(&llm.temperature),
            "llm.temperature must be within 0.0..=1.0 (got {})",
            llm.temperature
        );
        ensure!(
            (50..=8192).contains(&llm.max_output_tokens),
            "llm.max_output_tokens must be within 50..=8192 (got {})",
            llm.max_output_tokens
        );
        ensure!(llm.timeout_secs >= 1, "llm.timeout_secs must be >= 1");
        ensure!(llm.idle_timeout_secs >= 1, "llm.idle_timeout_secs must be >= 1");

        ensure!(
            self.gateway.max_body_bytes >= 1024,
            "gateway.max_body_bytes must be at least 1024"
        );
        ensure!(
            self.cache.sweep_interval_secs >= 1,
            "cache.sweep_interval_secs must be >= 1"
        );
        Ok(())
    }

    /// Copy with every secret masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let mask = |key: &mut Option<String>| {
            if let Some(value) = key.as_mut() {
                *value = crate::security::redact(value);
            }
        };
        mask(&mut copy.llm.openai_api_key);
        mask(&mut copy.llm.anthropic_api_key);
        mask(&mut copy.llm.google_api_key);
        copy.cache.redis_url = redact_url_password(&copy.cache.redis_url);
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Write the config to `path` via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let toml_str = self.to_toml()?;

        let parent_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent_dir).with_context(|| {
            format!("Failed to create config directory: {}", parent_dir.display())
        })?;

        let file_name = path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!("Failed to create temporary config file: {}", temp_path.display())
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }
        Ok(())
    }
}

/// Accepts either a JSON array (`["a","b"]`) or a comma-separated list.
fn parse_list(raw: &str) -> Vec<String> {
    if let Ok(items) = serde_json::from_str::<Vec<String>>(raw) {
        return items;
    }
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    raw == "1" || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

fn redact_url_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
    format!("{scheme}://{user}:***@{host}")
}
