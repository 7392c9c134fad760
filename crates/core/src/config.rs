use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::tool::ToolName;
use crate::rate_limit::RateLimitPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub login: LoginConfig,
    pub turn: TurnConfig,
    pub flash_sale: FlashSaleConfig,
    pub llm: LlmConfig,
    pub tools: ToolsConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_requests: u32,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub max_idle_secs: u64,
    pub sweep_interval_secs: u64,
    pub context_limit: usize,
}

#[derive(Clone, Debug)]
pub struct LoginConfig {
    pub max_lookup_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct TurnConfig {
    pub deadline_secs: u64,
    pub max_message_chars: usize,
}

#[derive(Clone, Debug)]
pub struct FlashSaleConfig {
    pub proposal_ttl_hours: u32,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// Remote adapter endpoints. A tool without an endpoint is registered as
/// unavailable and every call to it is recorded as a tool error.
#[derive(Clone, Debug, Default)]
pub struct ToolsConfig {
    pub data_access_url: Option<String>,
    pub analytics_data_url: Option<String>,
    pub vector_search_url: Option<String>,
    pub image_generator_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub lookup_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub turn_deadline_secs: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            rate_limit: RateLimitConfig { window_secs: 60, max_requests: 60 },
            session: SessionConfig {
                max_idle_secs: 86_400,
                sweep_interval_secs: 300,
                context_limit: 20,
            },
            login: LoginConfig { max_lookup_attempts: 3 },
            turn: TurnConfig { deadline_secs: 30, max_message_chars: 4_000 },
            flash_sale: FlashSaleConfig { proposal_ttl_hours: 24 },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
            },
            tools: ToolsConfig { timeout_secs: 10, ..ToolsConfig::default() },
            identity: IdentityConfig { lookup_url: None, timeout_secs: 5 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl ToolsConfig {
    pub fn endpoint(&self, tool: ToolName) -> Option<&str> {
        let endpoint = match tool {
            ToolName::DataAccess => &self.data_access_url,
            ToolName::AnalyticsData => &self.analytics_data_url,
            ToolName::VectorSearch => &self.vector_search_url,
            ToolName::ImageGenerator => &self.image_generator_url,
            ToolName::FlashSaleManager => return None,
        };
        endpoint.as_deref()
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("kcart.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            window: chrono::Duration::seconds(to_i64(self.rate_limit.window_secs)),
            capacity: self.rate_limit.max_requests,
        }
    }

    pub fn turn_deadline(&self) -> StdDuration {
        StdDuration::from_secs(self.turn.deadline_secs)
    }

    pub fn session_max_idle(&self) -> chrono::Duration {
        chrono::Duration::seconds(to_i64(self.session.max_idle_secs))
    }

    pub fn proposal_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.flash_sale.proposal_ttl_hours))
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(rate_limit) = patch.rate_limit {
            if let Some(window_secs) = rate_limit.window_secs {
                self.rate_limit.window_secs = window_secs;
            }
            if let Some(max_requests) = rate_limit.max_requests {
                self.rate_limit.max_requests = max_requests;
            }
        }

        if let Some(session) = patch.session {
            if let Some(max_idle_secs) = session.max_idle_secs {
                self.session.max_idle_secs = max_idle_secs;
            }
            if let Some(sweep_interval_secs) = session.sweep_interval_secs {
                self.session.sweep_interval_secs = sweep_interval_secs;
            }
            if let Some(context_limit) = session.context_limit {
                self.session.context_limit = context_limit;
            }
        }

        if let Some(max_lookup_attempts) = patch.login.and_then(|login| login.max_lookup_attempts)
        {
            self.login.max_lookup_attempts = max_lookup_attempts;
        }

        if let Some(turn) = patch.turn {
            if let Some(deadline_secs) = turn.deadline_secs {
                self.turn.deadline_secs = deadline_secs;
            }
            if let Some(max_message_chars) = turn.max_message_chars {
                self.turn.max_message_chars = max_message_chars;
            }
        }

        if let Some(ttl) = patch.flash_sale.and_then(|flash_sale| flash_sale.proposal_ttl_hours) {
            self.flash_sale.proposal_ttl_hours = ttl;
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(tools) = patch.tools {
            if let Some(url) = tools.data_access_url {
                self.tools.data_access_url = Some(url);
            }
            if let Some(url) = tools.analytics_data_url {
                self.tools.analytics_data_url = Some(url);
            }
            if let Some(url) = tools.vector_search_url {
                self.tools.vector_search_url = Some(url);
            }
            if let Some(url) = tools.image_generator_url {
                self.tools.image_generator_url = Some(url);
            }
            if let Some(timeout_secs) = tools.timeout_secs {
                self.tools.timeout_secs = timeout_secs;
            }
        }

        if let Some(identity) = patch.identity {
            if let Some(lookup_url) = identity.lookup_url {
                self.identity.lookup_url = Some(lookup_url);
            }
            if let Some(timeout_secs) = identity.timeout_secs {
                self.identity.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("KCART_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("KCART_SERVER_PORT") {
            self.server.port = parse_u16("KCART_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("KCART_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("KCART_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("KCART_RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit.window_secs = parse_u64("KCART_RATE_LIMIT_WINDOW_SECS", &value)?;
        }
        if let Some(value) = read_env("KCART_RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limit.max_requests = parse_u32("KCART_RATE_LIMIT_MAX_REQUESTS", &value)?;
        }

        if let Some(value) = read_env("KCART_SESSION_MAX_IDLE_SECS") {
            self.session.max_idle_secs = parse_u64("KCART_SESSION_MAX_IDLE_SECS", &value)?;
        }
        if let Some(value) = read_env("KCART_SESSION_SWEEP_INTERVAL_SECS") {
            self.session.sweep_interval_secs =
                parse_u64("KCART_SESSION_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("KCART_SESSION_CONTEXT_LIMIT") {
            self.session.context_limit = parse_usize("KCART_SESSION_CONTEXT_LIMIT", &value)?;
        }

        if let Some(value) = read_env("KCART_LOGIN_MAX_LOOKUP_ATTEMPTS") {
            self.login.max_lookup_attempts = parse_u32("KCART_LOGIN_MAX_LOOKUP_ATTEMPTS", &value)?;
        }

        if let Some(value) = read_env("KCART_TURN_DEADLINE_SECS") {
            self.turn.deadline_secs = parse_u64("KCART_TURN_DEADLINE_SECS", &value)?;
        }
        if let Some(value) = read_env("KCART_TURN_MAX_MESSAGE_CHARS") {
            self.turn.max_message_chars = parse_usize("KCART_TURN_MAX_MESSAGE_CHARS", &value)?;
        }

        if let Some(value) = read_env("KCART_FLASH_SALE_PROPOSAL_TTL_HOURS") {
            self.flash_sale.proposal_ttl_hours =
                parse_u32("KCART_FLASH_SALE_PROPOSAL_TTL_HOURS", &value)?;
        }

        if let Some(value) = read_env("KCART_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("KCART_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("KCART_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("KCART_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("KCART_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("KCART_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("KCART_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("KCART_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("KCART_TOOLS_DATA_ACCESS_URL") {
            self.tools.data_access_url = Some(value);
        }
        if let Some(value) = read_env("KCART_TOOLS_ANALYTICS_DATA_URL") {
            self.tools.analytics_data_url = Some(value);
        }
        if let Some(value) = read_env("KCART_TOOLS_VECTOR_SEARCH_URL") {
            self.tools.vector_search_url = Some(value);
        }
        if let Some(value) = read_env("KCART_TOOLS_IMAGE_GENERATOR_URL") {
            self.tools.image_generator_url = Some(value);
        }
        if let Some(value) = read_env("KCART_TOOLS_TIMEOUT_SECS") {
            self.tools.timeout_secs = parse_u64("KCART_TOOLS_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("KCART_IDENTITY_LOOKUP_URL") {
            self.identity.lookup_url = Some(value);
        }
        if let Some(value) = read_env("KCART_IDENTITY_TIMEOUT_SECS") {
            self.identity.timeout_secs = parse_u64("KCART_IDENTITY_TIMEOUT_SECS", &value)?;
        }

        let log_level = read_env("KCART_LOGGING_LEVEL").or_else(|| read_env("KCART_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("KCART_LOGGING_FORMAT").or_else(|| read_env("KCART_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(deadline_secs) = overrides.turn_deadline_secs {
            self.turn.deadline_secs = deadline_secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_server(&self.server)?;
        validate_rate_limit(&self.rate_limit)?;
        validate_session(&self.session)?;
        validate_turn(&self.turn, &self.login)?;
        validate_flash_sale(&self.flash_sale)?;
        validate_llm(&self.llm)?;
        validate_endpoints(&self.tools, &self.identity)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("kcart.toml"), PathBuf::from("config/kcart.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_rate_limit(rate_limit: &RateLimitConfig) -> Result<(), ConfigError> {
    if rate_limit.window_secs == 0 || rate_limit.window_secs > 86_400 {
        return Err(ConfigError::Validation(
            "rate_limit.window_secs must be in range 1..=86400".to_string(),
        ));
    }

    if rate_limit.max_requests == 0 {
        return Err(ConfigError::Validation(
            "rate_limit.max_requests must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_session(session: &SessionConfig) -> Result<(), ConfigError> {
    if session.max_idle_secs == 0 {
        return Err(ConfigError::Validation(
            "session.max_idle_secs must be greater than zero".to_string(),
        ));
    }

    if session.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "session.sweep_interval_secs must be greater than zero".to_string(),
        ));
    }

    if session.context_limit == 0 || session.context_limit > 500 {
        return Err(ConfigError::Validation(
            "session.context_limit must be in range 1..=500".to_string(),
        ));
    }

    Ok(())
}

fn validate_turn(turn: &TurnConfig, login: &LoginConfig) -> Result<(), ConfigError> {
    if turn.deadline_secs == 0 || turn.deadline_secs > 300 {
        return Err(ConfigError::Validation(
            "turn.deadline_secs must be in range 1..=300".to_string(),
        ));
    }

    if turn.max_message_chars == 0 {
        return Err(ConfigError::Validation(
            "turn.max_message_chars must be greater than zero".to_string(),
        ));
    }

    if login.max_lookup_attempts == 0 {
        return Err(ConfigError::Validation(
            "login.max_lookup_attempts must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_flash_sale(flash_sale: &FlashSaleConfig) -> Result<(), ConfigError> {
    if flash_sale.proposal_ttl_hours == 0 {
        return Err(ConfigError::Validation(
            "flash_sale.proposal_ttl_hours must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_endpoints(tools: &ToolsConfig, identity: &IdentityConfig) -> Result<(), ConfigError> {
    let endpoints = [
        ("tools.data_access_url", &tools.data_access_url),
        ("tools.analytics_data_url", &tools.analytics_data_url),
        ("tools.vector_search_url", &tools.vector_search_url),
        ("tools.image_generator_url", &tools.image_generator_url),
        ("identity.lookup_url", &identity.lookup_url),
    ];
    for (key, value) in endpoints {
        if let Some(url) = value {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Validation(format!(
                    "{key} must start with http:// or https://"
                )));
            }
        }
    }

    if tools.timeout_secs == 0 || identity.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "tools.timeout_secs and identity.timeout_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    server: Option<ServerPatch>,
    rate_limit: Option<RateLimitPatch>,
    session: Option<SessionPatch>,
    login: Option<LoginPatch>,
    turn: Option<TurnPatch>,
    flash_sale: Option<FlashSalePatch>,
    llm: Option<LlmPatch>,
    tools: Option<ToolsPatch>,
    identity: Option<IdentityPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitPatch {
    window_secs: Option<u64>,
    max_requests: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    max_idle_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    context_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoginPatch {
    max_lookup_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct TurnPatch {
    deadline_secs: Option<u64>,
    max_message_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct FlashSalePatch {
    proposal_ttl_hours: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolsPatch {
    data_access_url: Option<String>,
    analytics_data_url: Option<String>,
    vector_search_url: Option<String>,
    image_generator_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct IdentityPatch {
    lookup_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};
    use crate::domain::tool::ToolName;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_match_the_documented_policy() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;
        let policy = config.rate_limit_policy();

        ensure(policy.capacity == 60, "default capacity is 60 requests")?;
        ensure(policy.window == chrono::Duration::seconds(60), "default window is 60s")?;
        ensure(config.proposal_ttl() == chrono::Duration::hours(24), "default ttl is 24h")?;
        ensure(config.login.max_lookup_attempts == 3, "default lookup budget is 3")?;
        ensure(config.tools.endpoint(ToolName::FlashSaleManager).is_none(), "in-process tool")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_KCART_LLM_KEY", "sk-from-env");
        env::set_var("TEST_KCART_SEARCH_HOST", "search.internal");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("kcart.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "openai"
api_key = "${TEST_KCART_LLM_KEY}"
model = "gpt-4o-mini"

[tools]
vector_search_url = "http://${TEST_KCART_SEARCH_HOST}/search"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should come from file")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be interpolated from environment",
            )?;
            ensure(
                config.tools.endpoint(ToolName::VectorSearch)
                    == Some("http://search.internal/search"),
                "vector search endpoint should be interpolated",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_KCART_LLM_KEY", "TEST_KCART_SEARCH_HOST"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("KCART_LOG_LEVEL", "warn");
        env::set_var("KCART_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["KCART_LOG_LEVEL", "KCART_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("KCART_SERVER_PORT", "9100");
        env::set_var("KCART_RATE_LIMIT_MAX_REQUESTS", "90");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("kcart.toml");
            fs::write(
                &path,
                r#"
[server]
port = 9000

[rate_limit]
window_secs = 30
max_requests = 10

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    port: Some(9200),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.server.port == 9200, "override port should win")?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.rate_limit.max_requests == 90, "env should win over file")?;
            ensure(config.rate_limit.window_secs == 30, "file should win over defaults")?;
            Ok(())
        })();

        clear_vars(&["KCART_SERVER_PORT", "KCART_RATE_LIMIT_MAX_REQUESTS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("KCART_LLM_PROVIDER", "anthropic");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["KCART_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("KCART_TURN_DEADLINE_SECS", "soon");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "KCART_TURN_DEADLINE_SECS", "error should name the variable")
            }
            other => Err(format!("expected invalid override error, got {other:?}")),
        };

        clear_vars(&["KCART_TURN_DEADLINE_SECS"]);
        result
    }

    #[test]
    fn endpoints_must_be_http_urls() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("KCART_IDENTITY_LOOKUP_URL", "ftp://users.internal");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::Validation(message)) => {
                ensure(message.contains("identity.lookup_url"), "error should name the key")
            }
            other => Err(format!("expected validation error, got {other:?}")),
        };

        clear_vars(&["KCART_IDENTITY_LOOKUP_URL"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("KCART_LLM_PROVIDER", "openai");
        env::set_var("KCART_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["KCART_LLM_PROVIDER", "KCART_LLM_API_KEY"]);
        result
    }
}
