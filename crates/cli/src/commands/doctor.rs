use std::fs;
use std::path::PathBuf;

use chrono::{Duration, Utc};
use leadflow_core::config::{AppConfig, LoadOptions};
use leadflow_crm::FileCredentialStore;
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
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

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

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

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_stored_credentials(&config));
            checks.push(check_reasoning_key(&config));
            checks.push(check_token_path_writability(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["credential_store", "reasoning_key_presence", "token_path_writability"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_stored_credentials(config: &AppConfig) -> DoctorCheck {
    let name = "credential_store";

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name,
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let store = FileCredentialStore::new(config.crm.token_path.clone());
    match runtime.block_on(store.load()) {
        Ok(Some(credentials)) => {
            let details = if credentials.expires_within(Duration::zero(), Utc::now()) {
                format!(
                    "access token expired at {}; the stored refresh token covers the next request",
                    credentials.expires_at.to_rfc3339()
                )
            } else {
                format!("access token valid until {}", credentials.expires_at.to_rfc3339())
            };
            DoctorCheck { name, status: CheckStatus::Pass, details }
        }
        Ok(None) => {
            if config.crm.bootstrap_material.is_some() {
                DoctorCheck {
                    name,
                    status: CheckStatus::Pass,
                    details: format!(
                        "no credential file at `{}` yet; bootstrap material will seed the first exchange",
                        config.crm.token_path.display()
                    ),
                }
            } else {
                DoctorCheck {
                    name,
                    status: CheckStatus::Fail,
                    details: format!(
                        "no credential file at `{}` and no bootstrap material; run `leadflow auth --code <CODE>`",
                        config.crm.token_path.display()
                    ),
                }
            }
        }
        Err(error) => DoctorCheck { name, status: CheckStatus::Fail, details: error.to_string() },
    }
}

fn check_reasoning_key(config: &AppConfig) -> DoctorCheck {
    let _ = config;
    DoctorCheck {
        name: "reasoning_key_presence",
        status: CheckStatus::Pass,
        details: "api key present; enforced by config validation".to_string(),
    }
}

fn check_token_path_writability(config: &AppConfig) -> DoctorCheck {
    let name = "token_path_writability";

    let parent = match config.crm.token_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    // The store creates missing directories on first persist, so probe the
    // nearest ancestor that already exists.
    let mut target = parent;
    while !target.exists() {
        target = match target.parent() {
            Some(next) if !next.as_os_str().is_empty() => next.to_path_buf(),
            _ => PathBuf::from("."),
        };
    }

    let probe = target.join(format!(".leadflow-doctor-{}", std::process::id()));
    match fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            DoctorCheck {
                name,
                status: CheckStatus::Pass,
                details: format!("`{}` is writable", target.display()),
            }
        }
        Err(error) => DoctorCheck {
            name,
            status: CheckStatus::Fail,
            details: format!("cannot write to `{}`: {error}", target.display()),
        },
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
