use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use leadflow_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use serde::Serialize;
use toml::Value;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct ConfigField {
    key: &'static str,
    value: String,
    source: String,
}

#[derive(Debug, Serialize)]
struct ConfigReport {
    config_file: Option<String>,
    fields: Vec<ConfigField>,
}

pub fn run(json_output: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure("config", "config_validation", error.to_string(), 2)
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let fields = collect_fields(&config, config_file_doc.as_ref(), config_file_path.as_deref());
    let report = ConfigReport {
        config_file: config_file_path.map(|path| path.display().to_string()),
        fields,
    };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"config_file\":null,\"fields\":[],\"error\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code: 0, output }
}

fn collect_fields(
    config: &AppConfig,
    doc: Option<&Value>,
    path: Option<&Path>,
) -> Vec<ConfigField> {
    let field = |key: &'static str, value: String, env_keys: &[&str]| ConfigField {
        key,
        value,
        source: field_source(key, env_keys, doc, path),
    };

    let api_key = match &config.reasoning.api_key {
        Some(_) => "<redacted>".to_string(),
        None => "<unset>".to_string(),
    };

    vec![
        field(
            "server.bind_address",
            config.server.bind_address.clone(),
            &["LEADFLOW_SERVER_BIND_ADDRESS"],
        ),
        field("server.port", config.server.port.to_string(), &["LEADFLOW_SERVER_PORT"]),
        field(
            "crm.subdomain",
            config.crm.subdomain.clone(),
            &["LEADFLOW_CRM_SUBDOMAIN", "KOMMO_SUBDOMAIN"],
        ),
        field("crm.client_id", config.crm.client_id.clone(), &["LEADFLOW_CRM_CLIENT_ID"]),
        field(
            "crm.client_secret",
            redact_secret(config.crm.client_secret.expose_secret()),
            &["LEADFLOW_CRM_CLIENT_SECRET"],
        ),
        field("crm.redirect_uri", config.crm.redirect_uri.clone(), &["LEADFLOW_CRM_REDIRECT_URI"]),
        field(
            "crm.token_path",
            config.crm.token_path.display().to_string(),
            &["LEADFLOW_CRM_TOKEN_PATH"],
        ),
        field(
            "pipeline.sales_id",
            config.pipeline.sales_id.to_string(),
            &["LEADFLOW_PIPELINE_SALES_ID"],
        ),
        field(
            "pipeline.entry_stage_id",
            config.pipeline.entry_stage_id.to_string(),
            &["LEADFLOW_PIPELINE_ENTRY_STAGE_ID"],
        ),
        field(
            "pipeline.qualifying_stage_id",
            config.pipeline.qualifying_stage_id.to_string(),
            &["LEADFLOW_PIPELINE_QUALIFYING_STAGE_ID"],
        ),
        field(
            "pipeline.fulfillment_id",
            config.pipeline.fulfillment_id.to_string(),
            &["LEADFLOW_PIPELINE_FULFILLMENT_ID"],
        ),
        field(
            "pipeline.fulfillment_stage_id",
            config.pipeline.fulfillment_stage_id.to_string(),
            &["LEADFLOW_PIPELINE_FULFILLMENT_STAGE_ID"],
        ),
        field("fields.reply_id", config.fields.reply_id.to_string(), &["LEADFLOW_FIELDS_REPLY_ID"]),
        field("catalog.id", config.catalog.id.to_string(), &["LEADFLOW_CATALOG_ID"]),
        field(
            "catalog.product_id",
            config.catalog.product_id.to_string(),
            &["LEADFLOW_CATALOG_PRODUCT_ID"],
        ),
        field(
            "catalog.unit_price",
            config.catalog.unit_price.to_string(),
            &["LEADFLOW_CATALOG_UNIT_PRICE"],
        ),
        field("reasoning.api_key", api_key, &["LEADFLOW_REASONING_API_KEY", "OPENAI_API_KEY"]),
        field(
            "reasoning.base_url",
            config.reasoning.base_url.clone(),
            &["LEADFLOW_REASONING_BASE_URL"],
        ),
        field("reasoning.model", config.reasoning.model.clone(), &["LEADFLOW_REASONING_MODEL"]),
        field(
            "delivery.mode",
            format!("{:?}", config.delivery.mode),
            &["LEADFLOW_DELIVERY_MODE"],
        ),
        field(
            "logging.level",
            config.logging.level.clone(),
            &["LEADFLOW_LOGGING_LEVEL", "LEADFLOW_LOG_LEVEL"],
        ),
        field(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["LEADFLOW_LOGGING_FORMAT", "LEADFLOW_LOG_FORMAT"],
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    if let Some(from_env) = env::var_os("LEADFLOW_CONFIG") {
        let path = PathBuf::from(from_env);
        if path.exists() {
            return Some(path);
        }
    }

    let root = PathBuf::from("leadflow.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/leadflow.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
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
    for env_key in env_keys {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
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

fn render_human(report: &ConfigReport) -> String {
    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    for field in &report.fields {
        lines.push(format!("- {} = {} (source: {})", field.key, field.value, field.source));
    }

    lines.join("\n")
}

fn redact_secret(value: &str) -> String {
    if value.trim().is_empty() {
        "<empty>".to_string()
    } else {
        "<redacted>".to_string()
    }
}
