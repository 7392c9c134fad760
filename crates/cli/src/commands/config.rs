use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use kcart_core::config::{AppConfig, LoadOptions};
use toml::Value;

const UNSET: &str = "<unset>";

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    render(&config, config_file_doc.as_ref(), config_file_path.as_deref())
}

/// One line per effective value, secrets redacted, with where it came from.
pub fn render(config: &AppConfig, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];

    for (key_path, env_keys, value) in entries(config) {
        let source = field_source(key_path, env_keys, file_doc, file_path);
        lines.push(format!("- {key_path} = {value} (source: {source})"));
    }

    lines.join("\n")
}

fn entries(config: &AppConfig) -> Vec<(&'static str, &'static [&'static str], String)> {
    let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| UNSET.to_string());
    let api_key = if config.llm.api_key.is_some() { "<redacted>" } else { UNSET };

    vec![
        ("server.bind_address", &["KCART_SERVER_BIND_ADDRESS"], config.server.bind_address.clone()),
        ("server.port", &["KCART_SERVER_PORT"], config.server.port.to_string()),
        (
            "server.graceful_shutdown_secs",
            &["KCART_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            config.server.graceful_shutdown_secs.to_string(),
        ),
        (
            "rate_limit.window_secs",
            &["KCART_RATE_LIMIT_WINDOW_SECS"],
            config.rate_limit.window_secs.to_string(),
        ),
        (
            "rate_limit.max_requests",
            &["KCART_RATE_LIMIT_MAX_REQUESTS"],
            config.rate_limit.max_requests.to_string(),
        ),
        (
            "session.max_idle_secs",
            &["KCART_SESSION_MAX_IDLE_SECS"],
            config.session.max_idle_secs.to_string(),
        ),
        (
            "session.sweep_interval_secs",
            &["KCART_SESSION_SWEEP_INTERVAL_SECS"],
            config.session.sweep_interval_secs.to_string(),
        ),
        (
            "session.context_limit",
            &["KCART_SESSION_CONTEXT_LIMIT"],
            config.session.context_limit.to_string(),
        ),
        (
            "login.max_lookup_attempts",
            &["KCART_LOGIN_MAX_LOOKUP_ATTEMPTS"],
            config.login.max_lookup_attempts.to_string(),
        ),
        ("turn.deadline_secs", &["KCART_TURN_DEADLINE_SECS"], config.turn.deadline_secs.to_string()),
        (
            "turn.max_message_chars",
            &["KCART_TURN_MAX_MESSAGE_CHARS"],
            config.turn.max_message_chars.to_string(),
        ),
        (
            "flash_sale.proposal_ttl_hours",
            &["KCART_FLASH_SALE_PROPOSAL_TTL_HOURS"],
            config.flash_sale.proposal_ttl_hours.to_string(),
        ),
        ("llm.provider", &["KCART_LLM_PROVIDER"], config.llm.provider.as_str().to_string()),
        ("llm.model", &["KCART_LLM_MODEL"], config.llm.model.clone()),
        ("llm.base_url", &["KCART_LLM_BASE_URL"], optional(&config.llm.base_url)),
        ("llm.api_key", &["KCART_LLM_API_KEY"], api_key.to_string()),
        ("llm.timeout_secs", &["KCART_LLM_TIMEOUT_SECS"], config.llm.timeout_secs.to_string()),
        ("llm.max_retries", &["KCART_LLM_MAX_RETRIES"], config.llm.max_retries.to_string()),
        (
            "tools.data_access_url",
            &["KCART_TOOLS_DATA_ACCESS_URL"],
            optional(&config.tools.data_access_url),
        ),
        (
            "tools.analytics_data_url",
            &["KCART_TOOLS_ANALYTICS_DATA_URL"],
            optional(&config.tools.analytics_data_url),
        ),
        (
            "tools.vector_search_url",
            &["KCART_TOOLS_VECTOR_SEARCH_URL"],
            optional(&config.tools.vector_search_url),
        ),
        (
            "tools.image_generator_url",
            &["KCART_TOOLS_IMAGE_GENERATOR_URL"],
            optional(&config.tools.image_generator_url),
        ),
        ("tools.timeout_secs", &["KCART_TOOLS_TIMEOUT_SECS"], config.tools.timeout_secs.to_string()),
        ("identity.lookup_url", &["KCART_IDENTITY_LOOKUP_URL"], optional(&config.identity.lookup_url)),
        (
            "identity.timeout_secs",
            &["KCART_IDENTITY_TIMEOUT_SECS"],
            config.identity.timeout_secs.to_string(),
        ),
        (
            "logging.level",
            &["KCART_LOGGING_LEVEL", "KCART_LOG_LEVEL"],
            config.logging.level.clone(),
        ),
        (
            "logging.format",
            &["KCART_LOGGING_FORMAT", "KCART_LOG_FORMAT"],
            config.logging.format.as_str().to_string(),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["kcart.toml", "config/kcart.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}
