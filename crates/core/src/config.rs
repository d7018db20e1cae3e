use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub crm: CrmConfig,
    pub pipeline: PipelineConfig,
    pub fields: FieldsConfig,
    pub catalog: CatalogConfig,
    pub reasoning: ReasoningConfig,
    pub history: HistoryConfig,
    pub delivery: DeliveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    /// Bare account subdomain, e.g. `acme` for `acme.kommo.com`.
    pub subdomain: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uri: String,
    /// Seed material for the first token exchange: either a one-time
    /// authorization code or an out-of-band refresh token.
    pub bootstrap_material: Option<SecretString>,
    pub token_path: PathBuf,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// The only pipeline whose leads are orchestrated.
    pub sales_id: u64,
    /// Stage leads occupy before qualification; also the bounce target.
    pub entry_stage_id: u64,
    /// Stage whose entry fires the CRM reply automation.
    pub qualifying_stage_id: u64,
    pub fulfillment_id: u64,
    pub fulfillment_stage_id: u64,
    /// Last-resort settle delay when poll-and-verify never confirms a write.
    pub bounce_delay_ms: u64,
    pub verify_attempts: u32,
    pub verify_interval_ms: u64,
}

#[derive(Clone, Debug)]
pub struct FieldsConfig {
    /// Custom field the CRM automation reads the assistant reply from.
    pub reply_id: u64,
    pub reply_max_len: usize,
    pub name_id: u64,
    pub document_id: u64,
    pub phone_id: u64,
    pub email_id: u64,
    pub department_id: u64,
    pub city_id: u64,
    pub address_id: u64,
    pub quantity_id: u64,
}

#[derive(Clone, Debug)]
pub struct CatalogConfig {
    /// Catalog + element pair to link on confirmed orders; both zero disables
    /// the link step.
    pub id: u64,
    pub product_id: u64,
    pub product_name: String,
    pub unit_price: Decimal,
}

#[derive(Clone, Debug)]
pub struct ReasoningConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
    pub fallback_reply: String,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct HistoryConfig {
    pub events_limit: u32,
    pub notes_limit: u32,
}

#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    pub mode: ReplyDelivery,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyDelivery {
    /// Reply lands in the reply field; qualifying-stage re-entry triggers the
    /// CRM automation that forwards it to the customer.
    #[default]
    StageAutomation,
    /// Reply is posted straight into the resolved chat; no stage re-entry.
    DirectChat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub token_path: Option<PathBuf>,
    pub bootstrap_material: Option<String>,
    pub delivery_mode: Option<ReplyDelivery>,
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
                bind_address: "0.0.0.0".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            crm: CrmConfig {
                subdomain: String::new(),
                client_id: String::new(),
                client_secret: String::new().into(),
                redirect_uri: String::new(),
                bootstrap_material: None,
                token_path: PathBuf::from("tokens.json"),
                request_timeout_secs: 20,
            },
            pipeline: PipelineConfig {
                sales_id: 0,
                entry_stage_id: 0,
                qualifying_stage_id: 0,
                fulfillment_id: 0,
                fulfillment_stage_id: 0,
                bounce_delay_ms: 1_500,
                verify_attempts: 5,
                verify_interval_ms: 400,
            },
            fields: FieldsConfig {
                reply_id: 0,
                reply_max_len: 1_000,
                name_id: 0,
                document_id: 0,
                phone_id: 0,
                email_id: 0,
                department_id: 0,
                city_id: 0,
                address_id: 0,
                quantity_id: 0,
            },
            catalog: CatalogConfig {
                id: 0,
                product_id: 0,
                product_name: "Producto".to_string(),
                unit_price: Decimal::ZERO,
            },
            reasoning: ReasoningConfig {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4-turbo".to_string(),
                temperature: 0.5,
                system_prompt: "Eres un asesor de ventas digital. Responde en español, \
                                breve y cordial."
                    .to_string(),
                fallback_reply: "Estoy experimentando un problema técnico. ¿Me repites, \
                                 por favor?"
                    .to_string(),
                request_timeout_secs: 30,
            },
            history: HistoryConfig { events_limit: 50, notes_limit: 50 },
            delivery: DeliveryConfig { mode: ReplyDelivery::StageAutomation },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for ReplyDelivery {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stage_automation" => Ok(Self::StageAutomation),
            "direct_chat" => Ok(Self::DirectChat),
            other => Err(ConfigError::Validation(format!(
                "unsupported delivery mode `{other}` (expected stage_automation|direct_chat)"
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

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("leadflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
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

        if let Some(crm) = patch.crm {
            if let Some(subdomain) = crm.subdomain {
                self.crm.subdomain = subdomain;
            }
            if let Some(client_id) = crm.client_id {
                self.crm.client_id = client_id;
            }
            if let Some(client_secret_value) = crm.client_secret {
                self.crm.client_secret = secret_value(client_secret_value);
            }
            if let Some(redirect_uri) = crm.redirect_uri {
                self.crm.redirect_uri = redirect_uri;
            }
            if let Some(bootstrap_material_value) = crm.bootstrap_material {
                self.crm.bootstrap_material = Some(secret_value(bootstrap_material_value));
            }
            if let Some(token_path) = crm.token_path {
                self.crm.token_path = token_path;
            }
            if let Some(request_timeout_secs) = crm.request_timeout_secs {
                self.crm.request_timeout_secs = request_timeout_secs;
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(sales_id) = pipeline.sales_id {
                self.pipeline.sales_id = sales_id;
            }
            if let Some(entry_stage_id) = pipeline.entry_stage_id {
                self.pipeline.entry_stage_id = entry_stage_id;
            }
            if let Some(qualifying_stage_id) = pipeline.qualifying_stage_id {
                self.pipeline.qualifying_stage_id = qualifying_stage_id;
            }
            if let Some(fulfillment_id) = pipeline.fulfillment_id {
                self.pipeline.fulfillment_id = fulfillment_id;
            }
            if let Some(fulfillment_stage_id) = pipeline.fulfillment_stage_id {
                self.pipeline.fulfillment_stage_id = fulfillment_stage_id;
            }
            if let Some(bounce_delay_ms) = pipeline.bounce_delay_ms {
                self.pipeline.bounce_delay_ms = bounce_delay_ms;
            }
            if let Some(verify_attempts) = pipeline.verify_attempts {
                self.pipeline.verify_attempts = verify_attempts;
            }
            if let Some(verify_interval_ms) = pipeline.verify_interval_ms {
                self.pipeline.verify_interval_ms = verify_interval_ms;
            }
        }

        if let Some(fields) = patch.fields {
            if let Some(reply_id) = fields.reply_id {
                self.fields.reply_id = reply_id;
            }
            if let Some(reply_max_len) = fields.reply_max_len {
                self.fields.reply_max_len = reply_max_len;
            }
            if let Some(name_id) = fields.name_id {
                self.fields.name_id = name_id;
            }
            if let Some(document_id) = fields.document_id {
                self.fields.document_id = document_id;
            }
            if let Some(phone_id) = fields.phone_id {
                self.fields.phone_id = phone_id;
            }
            if let Some(email_id) = fields.email_id {
                self.fields.email_id = email_id;
            }
            if let Some(department_id) = fields.department_id {
                self.fields.department_id = department_id;
            }
            if let Some(city_id) = fields.city_id {
                self.fields.city_id = city_id;
            }
            if let Some(address_id) = fields.address_id {
                self.fields.address_id = address_id;
            }
            if let Some(quantity_id) = fields.quantity_id {
                self.fields.quantity_id = quantity_id;
            }
        }

        if let Some(catalog) = patch.catalog {
            if let Some(id) = catalog.id {
                self.catalog.id = id;
            }
            if let Some(product_id) = catalog.product_id {
                self.catalog.product_id = product_id;
            }
            if let Some(product_name) = catalog.product_name {
                self.catalog.product_name = product_name;
            }
            if let Some(unit_price) = catalog.unit_price {
                self.catalog.unit_price = unit_price;
            }
        }

        if let Some(reasoning) = patch.reasoning {
            if let Some(api_key_value) = reasoning.api_key {
                self.reasoning.api_key = Some(secret_value(api_key_value));
            }
            if let Some(base_url) = reasoning.base_url {
                self.reasoning.base_url = base_url;
            }
            if let Some(model) = reasoning.model {
                self.reasoning.model = model;
            }
            if let Some(temperature) = reasoning.temperature {
                self.reasoning.temperature = temperature;
            }
            if let Some(system_prompt) = reasoning.system_prompt {
                self.reasoning.system_prompt = system_prompt;
            }
            if let Some(fallback_reply) = reasoning.fallback_reply {
                self.reasoning.fallback_reply = fallback_reply;
            }
            if let Some(request_timeout_secs) = reasoning.request_timeout_secs {
                self.reasoning.request_timeout_secs = request_timeout_secs;
            }
        }

        if let Some(history) = patch.history {
            if let Some(events_limit) = history.events_limit {
                self.history.events_limit = events_limit;
            }
            if let Some(notes_limit) = history.notes_limit {
                self.history.notes_limit = notes_limit;
            }
        }

        if let Some(delivery) = patch.delivery {
            if let Some(mode) = delivery.mode {
                self.delivery.mode = mode;
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
        if let Some(value) = read_env("LEADFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("LEADFLOW_SERVER_PORT") {
            self.server.port = parse_u16("LEADFLOW_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("LEADFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        // The bare deployment names predate the prefixed scheme.
        let subdomain =
            read_env("LEADFLOW_CRM_SUBDOMAIN").or_else(|| read_env("KOMMO_SUBDOMAIN"));
        if let Some(value) = subdomain {
            self.crm.subdomain = value;
        }
        if let Some(value) = read_env("LEADFLOW_CRM_CLIENT_ID") {
            self.crm.client_id = value;
        }
        if let Some(value) = read_env("LEADFLOW_CRM_CLIENT_SECRET") {
            self.crm.client_secret = secret_value(value);
        }
        if let Some(value) = read_env("LEADFLOW_CRM_REDIRECT_URI") {
            self.crm.redirect_uri = value;
        }
        if let Some(value) = read_env("LEADFLOW_CRM_BOOTSTRAP_MATERIAL") {
            self.crm.bootstrap_material = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADFLOW_CRM_TOKEN_PATH") {
            self.crm.token_path = PathBuf::from(value);
        }
        if let Some(value) = read_env("LEADFLOW_CRM_REQUEST_TIMEOUT_SECS") {
            self.crm.request_timeout_secs =
                parse_u64("LEADFLOW_CRM_REQUEST_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_PIPELINE_SALES_ID") {
            self.pipeline.sales_id = parse_u64("LEADFLOW_PIPELINE_SALES_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_PIPELINE_ENTRY_STAGE_ID") {
            self.pipeline.entry_stage_id = parse_u64("LEADFLOW_PIPELINE_ENTRY_STAGE_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_PIPELINE_QUALIFYING_STAGE_ID") {
            self.pipeline.qualifying_stage_id =
                parse_u64("LEADFLOW_PIPELINE_QUALIFYING_STAGE_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_PIPELINE_FULFILLMENT_ID") {
            self.pipeline.fulfillment_id = parse_u64("LEADFLOW_PIPELINE_FULFILLMENT_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_PIPELINE_FULFILLMENT_STAGE_ID") {
            self.pipeline.fulfillment_stage_id =
                parse_u64("LEADFLOW_PIPELINE_FULFILLMENT_STAGE_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_PIPELINE_BOUNCE_DELAY_MS") {
            self.pipeline.bounce_delay_ms = parse_u64("LEADFLOW_PIPELINE_BOUNCE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_PIPELINE_VERIFY_ATTEMPTS") {
            self.pipeline.verify_attempts =
                parse_u32("LEADFLOW_PIPELINE_VERIFY_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_PIPELINE_VERIFY_INTERVAL_MS") {
            self.pipeline.verify_interval_ms =
                parse_u64("LEADFLOW_PIPELINE_VERIFY_INTERVAL_MS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_FIELDS_REPLY_ID") {
            self.fields.reply_id = parse_u64("LEADFLOW_FIELDS_REPLY_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_FIELDS_REPLY_MAX_LEN") {
            self.fields.reply_max_len = parse_usize("LEADFLOW_FIELDS_REPLY_MAX_LEN", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_FIELDS_NAME_ID") {
            self.fields.name_id = parse_u64("LEADFLOW_FIELDS_NAME_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_FIELDS_DOCUMENT_ID") {
            self.fields.document_id = parse_u64("LEADFLOW_FIELDS_DOCUMENT_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_FIELDS_PHONE_ID") {
            self.fields.phone_id = parse_u64("LEADFLOW_FIELDS_PHONE_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_FIELDS_EMAIL_ID") {
            self.fields.email_id = parse_u64("LEADFLOW_FIELDS_EMAIL_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_FIELDS_DEPARTMENT_ID") {
            self.fields.department_id = parse_u64("LEADFLOW_FIELDS_DEPARTMENT_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_FIELDS_CITY_ID") {
            self.fields.city_id = parse_u64("LEADFLOW_FIELDS_CITY_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_FIELDS_ADDRESS_ID") {
            self.fields.address_id = parse_u64("LEADFLOW_FIELDS_ADDRESS_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_FIELDS_QUANTITY_ID") {
            self.fields.quantity_id = parse_u64("LEADFLOW_FIELDS_QUANTITY_ID", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_CATALOG_ID") {
            self.catalog.id = parse_u64("LEADFLOW_CATALOG_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_CATALOG_PRODUCT_ID") {
            self.catalog.product_id = parse_u64("LEADFLOW_CATALOG_PRODUCT_ID", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_CATALOG_PRODUCT_NAME") {
            self.catalog.product_name = value;
        }
        if let Some(value) = read_env("LEADFLOW_CATALOG_UNIT_PRICE") {
            self.catalog.unit_price = parse_decimal("LEADFLOW_CATALOG_UNIT_PRICE", &value)?;
        }

        let api_key =
            read_env("LEADFLOW_REASONING_API_KEY").or_else(|| read_env("OPENAI_API_KEY"));
        if let Some(value) = api_key {
            self.reasoning.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADFLOW_REASONING_BASE_URL") {
            self.reasoning.base_url = value;
        }
        if let Some(value) = read_env("LEADFLOW_REASONING_MODEL") {
            self.reasoning.model = value;
        }
        if let Some(value) = read_env("LEADFLOW_REASONING_TEMPERATURE") {
            self.reasoning.temperature = parse_f32("LEADFLOW_REASONING_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_REASONING_SYSTEM_PROMPT") {
            self.reasoning.system_prompt = value;
        }
        if let Some(value) = read_env("LEADFLOW_REASONING_FALLBACK_REPLY") {
            self.reasoning.fallback_reply = value;
        }
        if let Some(value) = read_env("LEADFLOW_REASONING_TIMEOUT_SECS") {
            self.reasoning.request_timeout_secs =
                parse_u64("LEADFLOW_REASONING_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_HISTORY_EVENTS_LIMIT") {
            self.history.events_limit = parse_u32("LEADFLOW_HISTORY_EVENTS_LIMIT", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_HISTORY_NOTES_LIMIT") {
            self.history.notes_limit = parse_u32("LEADFLOW_HISTORY_NOTES_LIMIT", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_DELIVERY_MODE") {
            self.delivery.mode = value.parse()?;
        }

        let log_level =
            read_env("LEADFLOW_LOGGING_LEVEL").or_else(|| read_env("LEADFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LEADFLOW_LOGGING_FORMAT").or_else(|| read_env("LEADFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(token_path) = overrides.token_path {
            self.crm.token_path = token_path;
        }
        if let Some(bootstrap_material) = overrides.bootstrap_material {
            self.crm.bootstrap_material = Some(secret_value(bootstrap_material));
        }
        if let Some(delivery_mode) = overrides.delivery_mode {
            self.delivery.mode = delivery_mode;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_server(&self.server)?;
        validate_crm(&self.crm)?;
        validate_pipeline(&self.pipeline)?;
        validate_fields(&self.fields)?;
        validate_catalog(&self.catalog)?;
        validate_reasoning(&self.reasoning)?;
        validate_history(&self.history)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    if let Ok(from_env) = env::var("LEADFLOW_CONFIG") {
        let path = PathBuf::from(from_env);
        return path.exists().then_some(path);
    }

    [PathBuf::from("leadflow.toml"), PathBuf::from("config/leadflow.toml")]
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

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    let subdomain = crm.subdomain.trim();
    if subdomain.is_empty() {
        return Err(ConfigError::Validation(
            "crm.subdomain is required (the account part of `<subdomain>.kommo.com`)".to_string(),
        ));
    }
    if subdomain.contains('.') || subdomain.contains('/') {
        let hint = if subdomain.contains("kommo.com") {
            " (hint: use the bare account name, not the full host)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "crm.subdomain must be a bare account name{hint}"
        )));
    }

    if crm.client_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "crm.client_id is required. Get it from your CRM integration settings".to_string(),
        ));
    }
    if crm.client_secret.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "crm.client_secret is required. Get it from your CRM integration settings".to_string(),
        ));
    }

    let redirect = crm.redirect_uri.trim();
    if redirect.is_empty() {
        return Err(ConfigError::Validation(
            "crm.redirect_uri is required and must match the integration's registered value"
                .to_string(),
        ));
    }
    if !redirect.starts_with("http://") && !redirect.starts_with("https://") {
        return Err(ConfigError::Validation(
            "crm.redirect_uri must start with http:// or https://".to_string(),
        ));
    }

    if crm.token_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation("crm.token_path must not be empty".to_string()));
    }

    if crm.request_timeout_secs == 0 || crm.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "crm.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    let required = [
        ("pipeline.sales_id", pipeline.sales_id),
        ("pipeline.entry_stage_id", pipeline.entry_stage_id),
        ("pipeline.qualifying_stage_id", pipeline.qualifying_stage_id),
        ("pipeline.fulfillment_id", pipeline.fulfillment_id),
        ("pipeline.fulfillment_stage_id", pipeline.fulfillment_stage_id),
    ];
    for (key, value) in required {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{key} must be greater than zero")));
        }
    }

    if pipeline.sales_id == pipeline.fulfillment_id {
        return Err(ConfigError::Validation(
            "pipeline.fulfillment_id must differ from pipeline.sales_id".to_string(),
        ));
    }

    if pipeline.entry_stage_id == pipeline.qualifying_stage_id {
        return Err(ConfigError::Validation(
            "pipeline.entry_stage_id must differ from pipeline.qualifying_stage_id \
             (the bounce needs two distinct stages)"
                .to_string(),
        ));
    }

    if pipeline.bounce_delay_ms == 0 || pipeline.bounce_delay_ms > 60_000 {
        return Err(ConfigError::Validation(
            "pipeline.bounce_delay_ms must be in range 1..=60000".to_string(),
        ));
    }

    if pipeline.verify_attempts == 0 || pipeline.verify_attempts > 30 {
        return Err(ConfigError::Validation(
            "pipeline.verify_attempts must be in range 1..=30".to_string(),
        ));
    }

    if pipeline.verify_interval_ms == 0 || pipeline.verify_interval_ms > 10_000 {
        return Err(ConfigError::Validation(
            "pipeline.verify_interval_ms must be in range 1..=10000".to_string(),
        ));
    }

    Ok(())
}

fn validate_fields(fields: &FieldsConfig) -> Result<(), ConfigError> {
    let required = [
        ("fields.reply_id", fields.reply_id),
        ("fields.name_id", fields.name_id),
        ("fields.document_id", fields.document_id),
        ("fields.phone_id", fields.phone_id),
        ("fields.email_id", fields.email_id),
        ("fields.department_id", fields.department_id),
        ("fields.city_id", fields.city_id),
        ("fields.address_id", fields.address_id),
        ("fields.quantity_id", fields.quantity_id),
    ];
    for (key, value) in required {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{key} must be greater than zero")));
        }
    }

    if fields.reply_max_len < 16 {
        return Err(ConfigError::Validation(
            "fields.reply_max_len must be at least 16".to_string(),
        ));
    }

    Ok(())
}

fn validate_catalog(catalog: &CatalogConfig) -> Result<(), ConfigError> {
    if catalog.unit_price <= Decimal::ZERO {
        return Err(ConfigError::Validation(
            "catalog.unit_price must be greater than zero".to_string(),
        ));
    }

    let link_enabled = catalog.id != 0 || catalog.product_id != 0;
    if link_enabled && (catalog.id == 0 || catalog.product_id == 0) {
        return Err(ConfigError::Validation(
            "catalog.id and catalog.product_id must be set together (both zero disables linking)"
                .to_string(),
        ));
    }

    if catalog.product_name.trim().is_empty() {
        return Err(ConfigError::Validation("catalog.product_name must not be empty".to_string()));
    }

    Ok(())
}

fn validate_reasoning(reasoning: &ReasoningConfig) -> Result<(), ConfigError> {
    let missing = reasoning
        .api_key
        .as_ref()
        .map(|value| value.expose_secret().trim().is_empty())
        .unwrap_or(true);
    if missing {
        return Err(ConfigError::Validation(
            "reasoning.api_key is required (or set OPENAI_API_KEY)".to_string(),
        ));
    }

    let base_url = reasoning.base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "reasoning.base_url must start with http:// or https://".to_string(),
        ));
    }

    if reasoning.model.trim().is_empty() {
        return Err(ConfigError::Validation("reasoning.model must not be empty".to_string()));
    }

    if !(0.0..=2.0).contains(&reasoning.temperature) {
        return Err(ConfigError::Validation(
            "reasoning.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    if reasoning.fallback_reply.trim().is_empty() {
        return Err(ConfigError::Validation(
            "reasoning.fallback_reply must not be empty (the customer must always get a reply)"
                .to_string(),
        ));
    }

    if reasoning.request_timeout_secs == 0 || reasoning.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "reasoning.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_history(history: &HistoryConfig) -> Result<(), ConfigError> {
    if history.events_limit == 0 || history.events_limit > 250 {
        return Err(ConfigError::Validation(
            "history.events_limit must be in range 1..=250".to_string(),
        ));
    }
    if history.notes_limit == 0 || history.notes_limit > 250 {
        return Err(ConfigError::Validation(
            "history.notes_limit must be in range 1..=250".to_string(),
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

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse::<f32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal, ConfigError> {
    value.parse::<Decimal>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    server: Option<ServerPatch>,
    crm: Option<CrmPatch>,
    pipeline: Option<PipelinePatch>,
    fields: Option<FieldsPatch>,
    catalog: Option<CatalogPatch>,
    reasoning: Option<ReasoningPatch>,
    history: Option<HistoryPatch>,
    delivery: Option<DeliveryPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    subdomain: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
    bootstrap_material: Option<String>,
    token_path: Option<PathBuf>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    sales_id: Option<u64>,
    entry_stage_id: Option<u64>,
    qualifying_stage_id: Option<u64>,
    fulfillment_id: Option<u64>,
    fulfillment_stage_id: Option<u64>,
    bounce_delay_ms: Option<u64>,
    verify_attempts: Option<u32>,
    verify_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FieldsPatch {
    reply_id: Option<u64>,
    reply_max_len: Option<usize>,
    name_id: Option<u64>,
    document_id: Option<u64>,
    phone_id: Option<u64>,
    email_id: Option<u64>,
    department_id: Option<u64>,
    city_id: Option<u64>,
    address_id: Option<u64>,
    quantity_id: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogPatch {
    id: Option<u64>,
    product_id: Option<u64>,
    product_name: Option<String>,
    unit_price: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
struct ReasoningPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    system_prompt: Option<String>,
    fallback_reply: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryPatch {
    events_limit: Option<u32>,
    notes_limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DeliveryPatch {
    mode: Option<ReplyDelivery>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
