use serde::Serialize;
use vocario_core::config::{AppConfig, LoadOptions};
use vocario_db::connect_with_settings;

use crate::commands::{runtime, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const CHECK_NAMES: [&str; 4] =
    ["whatsapp_delivery", "email_delivery", "pdf_converter", "database_connectivity"];

/// Exits non-zero when any readiness check fails or is skipped.
pub fn run(json_output: bool) -> CommandResult {
    let report = build_report(LoadOptions::default());
    let exit_code = u8::from(report.overall_status == CheckStatus::Fail);

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

fn build_report(options: LoadOptions) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(options) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_whatsapp(&config));
            checks.push(check_email(&config));
            checks.push(check_pdf_converter(&config));
            checks.push(check_database_connectivity(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.extend(CHECK_NAMES.into_iter().map(|name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
        }
    }

    let failed = checks
        .iter()
        .any(|check| matches!(check.status, CheckStatus::Fail | CheckStatus::Skipped));
    let warned = checks.iter().any(|check| check.status == CheckStatus::Warn);
    let (overall_status, summary) = match (failed, warned) {
        (true, _) => (CheckStatus::Fail, "doctor: one or more readiness checks failed"),
        (false, true) => (CheckStatus::Warn, "doctor: ready with warnings"),
        (false, false) => (CheckStatus::Pass, "doctor: all readiness checks passed"),
    };

    DoctorReport { overall_status, summary: summary.to_string(), checks }
}

/// Credentials are validated by the config contract; only the switch is reported here.
fn check_whatsapp(config: &AppConfig) -> DoctorCheck {
    if config.whatsapp.enabled {
        DoctorCheck {
            name: "whatsapp_delivery",
            status: CheckStatus::Pass,
            details: format!("twilio sender `{}`", config.whatsapp.sender),
        }
    } else {
        DoctorCheck {
            name: "whatsapp_delivery",
            status: CheckStatus::Warn,
            details: "whatsapp.enabled is false: replies are logged, not sent".to_string(),
        }
    }
}

fn check_email(config: &AppConfig) -> DoctorCheck {
    if config.email.enabled {
        DoctorCheck {
            name: "email_delivery",
            status: CheckStatus::Pass,
            details: format!("resend sender `{}`", config.email.from_address),
        }
    } else {
        DoctorCheck {
            name: "email_delivery",
            status: CheckStatus::Warn,
            details: "email.enabled is false: document emails will fail".to_string(),
        }
    }
}

fn check_pdf_converter(config: &AppConfig) -> DoctorCheck {
    let found = match &config.documents.wkhtmltopdf_path {
        Some(path) if path.exists() => Some(path.clone()),
        Some(_) => None,
        None => which::which("wkhtmltopdf").ok(),
    };
    match found {
        Some(path) => DoctorCheck {
            name: "pdf_converter",
            status: CheckStatus::Pass,
            details: format!("wkhtmltopdf at `{}`", path.display()),
        },
        None => DoctorCheck {
            name: "pdf_converter",
            status: CheckStatus::Fail,
            details: "wkhtmltopdf not found: PDF documents cannot be built".to_string(),
        },
    }
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        pool.close().await;
        Ok::<(), String>(())
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
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
