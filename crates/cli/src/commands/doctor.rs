use std::time::Duration;

use kcart_core::config::{AppConfig, ConfigError, LlmProvider, LoadOptions};
use kcart_core::domain::tool::ToolName;
use serde::Serialize;

use crate::commands::CommandResult;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub details: String,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub overall_status: CheckStatus,
    pub summary: String,
    pub checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool, server_url: Option<&str>) -> CommandResult {
    let report = build_report(AppConfig::load(LoadOptions::default()), server_url);
    let exit_code = if report.overall_status == CheckStatus::Fail { 1 } else { 0 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

/// Skipped checks do not fail the report; only an explicit failure does.
pub fn build_report(
    loaded: Result<AppConfig, ConfigError>,
    server_url: Option<&str>,
) -> DoctorReport {
    let mut checks = Vec::new();

    match loaded {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_llm_credentials(&config));
            checks.push(check_tool_endpoints(&config));
            checks.push(check_identity_lookup(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["llm_credentials", "tool_endpoints", "identity_lookup"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    checks.push(check_server_health(server_url));

    let failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_llm_credentials(config: &AppConfig) -> DoctorCheck {
    let details = match config.llm.provider {
        LlmProvider::Ollama => format!(
            "ollama model `{}` at {}",
            config.llm.model,
            config.llm.base_url.as_deref().unwrap_or("<unset>")
        ),
        provider => format!("{} model `{}` with api key present", provider.as_str(), config.llm.model),
    };
    DoctorCheck { name: "llm_credentials", status: CheckStatus::Pass, details }
}

fn check_tool_endpoints(config: &AppConfig) -> DoctorCheck {
    let missing = ToolName::ALL
        .into_iter()
        .filter(|tool| *tool != ToolName::FlashSaleManager)
        .filter(|tool| config.tools.endpoint(*tool).is_none())
        .map(|tool| tool.as_str())
        .collect::<Vec<_>>();

    if missing.is_empty() {
        DoctorCheck {
            name: "tool_endpoints",
            status: CheckStatus::Pass,
            details: "all remote tool endpoints configured".to_string(),
        }
    } else {
        DoctorCheck {
            name: "tool_endpoints",
            status: CheckStatus::Skipped,
            details: format!("not configured (answers will degrade): {}", missing.join(", ")),
        }
    }
}

fn check_identity_lookup(config: &AppConfig) -> DoctorCheck {
    match config.identity.lookup_url.as_deref() {
        Some(url) => DoctorCheck {
            name: "identity_lookup",
            status: CheckStatus::Pass,
            details: format!("phone lookups go to {url}"),
        },
        None => DoctorCheck {
            name: "identity_lookup",
            status: CheckStatus::Skipped,
            details: "no lookup url; the server falls back to an empty directory".to_string(),
        },
    }
}

fn check_server_health(server_url: Option<&str>) -> DoctorCheck {
    let Some(server_url) = server_url else {
        return DoctorCheck {
            name: "server_health",
            status: CheckStatus::Skipped,
            details: "pass --server-url to check a running server".to_string(),
        };
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "server_health",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let url = format!("{}/health", server_url.trim_end_matches('/'));
    let result = runtime.block_on(async {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .map_err(|error| format!("failed to build http client: {error}"))?;
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|error| format!("failed to reach {url}: {error}"))?;
        let status = response.status();
        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|error| format!("unreadable health payload: {error}"))?;
        Ok::<_, String>((status, body))
    });

    match result {
        Ok((status, body)) if status.is_success() => DoctorCheck {
            name: "server_health",
            status: CheckStatus::Pass,
            details: format!(
                "{url} reports `{}`",
                body.get("status").and_then(|value| value.as_str()).unwrap_or("unknown")
            ),
        },
        Ok((status, _)) => DoctorCheck {
            name: "server_health",
            status: CheckStatus::Fail,
            details: format!("{url} answered {status}"),
        },
        Err(details) => DoctorCheck { name: "server_health", status: CheckStatus::Fail, details },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use kcart_core::config::{AppConfig, ConfigError};

    use super::{build_report, render_human, CheckStatus};

    #[test]
    fn unconfigured_collaborators_are_skipped_not_failed() {
        let report = build_report(Ok(AppConfig::default()), None);

        assert_eq!(report.overall_status, CheckStatus::Pass);
        let statuses =
            report.checks.iter().map(|check| (check.name, check.status)).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                ("config_validation", CheckStatus::Pass),
                ("llm_credentials", CheckStatus::Pass),
                ("tool_endpoints", CheckStatus::Skipped),
                ("identity_lookup", CheckStatus::Skipped),
                ("server_health", CheckStatus::Skipped),
            ]
        );
    }

    #[test]
    fn config_failure_fails_the_report() {
        let report =
            build_report(Err(ConfigError::Validation("server.port must be > 0".to_string())), None);

        assert_eq!(report.overall_status, CheckStatus::Fail);
        let rendered = render_human(&report);
        assert!(rendered.contains("- [fail] config_validation:"));
        assert!(rendered.contains("- [skip] llm_credentials:"));
    }

    #[test]
    fn unreachable_server_fails_the_health_check() {
        let report = build_report(Ok(AppConfig::default()), Some("http://127.0.0.1:9"));

        let health = report.checks.last().expect("server check");
        assert_eq!(health.name, "server_health");
        assert_eq!(health.status, CheckStatus::Fail);
        assert_eq!(report.overall_status, CheckStatus::Fail);
    }
}
