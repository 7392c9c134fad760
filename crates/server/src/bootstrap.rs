use std::sync::Arc;
use std::time::Duration;

use kcart_agent::identity::{HttpUserDirectory, InMemoryUserDirectory, LookupError, UserDirectory};
use kcart_agent::llm::{HttpLlmClient, LlmError};
use kcart_agent::tools::{FlashSaleTool, RemoteTool, ToolError, ToolRegistry};
use kcart_agent::{
    AgentRuntime, GuardrailPolicy, LlmOracle, LoginDriver, RuntimeComponents, ToolDispatcher,
    TurnSettings,
};
use kcart_core::audit::{AuditSink, TracingAuditSink};
use kcart_core::config::{AppConfig, ToolsConfig};
use kcart_core::domain::tool::ToolName;
use kcart_core::flows::FlashSaleBook;
use kcart_core::rate_limit::SlidingWindowLimiter;
use kcart_core::sessions::SessionStore;
use thiserror::Error;
use tracing::{info, warn};

pub struct Application {
    pub config: AppConfig,
    pub runtime: Arc<AgentRuntime>,
    pub flash_sales: Arc<FlashSaleBook>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("llm client setup failed: {0}")]
    Llm(#[source] LlmError),
    #[error("identity directory setup failed: {0}")]
    Identity(#[source] LookupError),
    #[error("tool `{tool}` setup failed: {source}")]
    Tool {
        tool: ToolName,
        #[source]
        source: ToolError,
    },
}

/// Wires the runtime from an already loaded and validated config.
pub fn bootstrap(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        llm_provider = config.llm.provider.as_str(),
        "starting application bootstrap"
    );
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

    let llm = HttpLlmClient::from_config(&config.llm).map_err(BootstrapError::Llm)?;
    let oracle = Arc::new(LlmOracle::new(Arc::new(llm)));

    let directory: Arc<dyn UserDirectory> = match config.identity.lookup_url.as_deref() {
        Some(url) => Arc::new(
            HttpUserDirectory::new(url, Duration::from_secs(config.identity.timeout_secs))
                .map_err(BootstrapError::Identity)?,
        ),
        None => {
            warn!(
                event_name = "system.bootstrap.identity_unconfigured",
                correlation_id = "bootstrap",
                "identity.lookup_url is not set; account lookups will find no match"
            );
            Arc::new(InMemoryUserDirectory::default())
        }
    };

    let flash_sales = Arc::new(FlashSaleBook::new(config.proposal_ttl()));
    let registry = build_registry(&config.tools, Arc::clone(&flash_sales))?;

    let runtime = AgentRuntime::new(
        RuntimeComponents {
            limiter: Arc::new(SlidingWindowLimiter::new(config.rate_limit_policy())),
            sessions: Arc::new(SessionStore::new(config.session.context_limit)),
            oracle,
            login: LoginDriver::new(directory, config.login.max_lookup_attempts, Arc::clone(&audit)),
            guardrails: GuardrailPolicy {
                image_generation_enabled: config.tools.image_generator_url.is_some(),
            },
            dispatcher: ToolDispatcher::new(
                Arc::new(registry),
                Duration::from_secs(config.tools.timeout_secs),
                Arc::clone(&audit),
            ),
            audit,
        },
        TurnSettings::from(&config.turn),
    );

    Ok(Application { config, runtime: Arc::new(runtime), flash_sales })
}

/// The flash-sale tool is always local; the other tools are registered only
/// when an endpoint is configured.
pub fn build_registry(
    tools: &ToolsConfig,
    flash_sales: Arc<FlashSaleBook>,
) -> Result<ToolRegistry, BootstrapError> {
    let mut registry = ToolRegistry::default();
    registry.register(FlashSaleTool::new(flash_sales));

    let timeout = Duration::from_secs(tools.timeout_secs);
    for tool in ToolName::ALL {
        let Some(endpoint) = tools.endpoint(tool) else {
            continue;
        };
        let remote = RemoteTool::new(tool, endpoint, timeout)
            .map_err(|source| BootstrapError::Tool { tool, source })?;
        registry.register(remote);
    }

    let registered = registry.names().iter().map(ToolName::as_str).collect::<Vec<_>>();
    info!(
        event_name = "system.bootstrap.tools_registered",
        correlation_id = "bootstrap",
        tools = ?registered,
        "tool registry ready"
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kcart_core::config::{AppConfig, LlmProvider};
    use kcart_core::domain::tool::ToolName;
    use kcart_core::flows::FlashSaleBook;

    use super::{bootstrap, build_registry};

    #[test]
    fn registry_always_has_the_flash_sale_tool() {
        let config = AppConfig::default();
        let registry =
            build_registry(&config.tools, Arc::new(FlashSaleBook::default())).expect("registry");

        assert_eq!(registry.names(), vec![ToolName::FlashSaleManager]);
    }

    #[test]
    fn configured_endpoints_become_remote_tools() {
        let mut config = AppConfig::default();
        config.tools.vector_search_url = Some("http://127.0.0.1:9101/search".to_string());
        config.tools.data_access_url = Some("http://127.0.0.1:9102/data".to_string());

        let registry =
            build_registry(&config.tools, Arc::new(FlashSaleBook::default())).expect("registry");

        assert_eq!(
            registry.names(),
            vec![ToolName::DataAccess, ToolName::FlashSaleManager, ToolName::VectorSearch]
        );
    }

    #[test]
    fn bootstrap_wires_a_runtime_from_defaults() {
        let mut config = AppConfig::default();
        config.llm.provider = LlmProvider::Ollama;

        let app = bootstrap(config).expect("bootstrap succeeds");
        assert!(app.runtime.sessions().is_empty());
        assert_eq!(app.runtime.tool_names(), vec![ToolName::FlashSaleManager]);
        assert_eq!(app.flash_sales.proposal_ttl(), chrono::Duration::hours(24));
    }
}
