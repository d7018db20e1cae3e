use std::sync::Arc;

use axum::Router;
use leadflow_agent::{OpenAiReasoning, Orchestrator, OrchestratorSettings, ReasoningError};
use leadflow_core::audit::TracingAuditSink;
use leadflow_core::config::{AppConfig, ConfigError, LoadOptions};
use leadflow_crm::auth::{AuthError, HttpTokenExchanger, TokenManager};
use leadflow_crm::client::{CrmError, KommoClient};
use leadflow_crm::store::FileCredentialStore;
use thiserror::Error;
use tracing::info;

use crate::health::{self, HealthState};
use crate::webhook::{self, WebhookState};

pub struct Application {
    pub config: AppConfig,
    pub router: Router,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("token exchanger setup failed: {0}")]
    Auth(#[from] AuthError),
    #[error("CRM client setup failed: {0}")]
    Crm(#[from] CrmError),
    #[error("reasoning client setup failed: {0}")]
    Reasoning(#[from] ReasoningError),
}

pub fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config)
}

pub fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let exchanger = Arc::new(HttpTokenExchanger::new(&config.crm)?);
    let tokens = Arc::new(TokenManager::new(
        FileCredentialStore::new(config.crm.token_path.clone()),
        exchanger,
        config.crm.bootstrap_material.clone(),
    ));
    let crm = Arc::new(KommoClient::new(&config.crm, tokens)?);
    let reasoning = Arc::new(OpenAiReasoning::new(&config.reasoning)?);

    let orchestrator = Arc::new(Orchestrator::new(
        crm,
        reasoning,
        Arc::new(TracingAuditSink),
        OrchestratorSettings::from_config(&config),
    ));
    info!(
        event_name = "system.bootstrap.orchestrator_ready",
        subdomain = %config.crm.subdomain,
        sales_pipeline_id = config.pipeline.sales_id,
        delivery_mode = ?config.delivery.mode,
        "orchestrator wired"
    );

    let health_store = Arc::new(FileCredentialStore::new(config.crm.token_path.clone()));
    let router = webhook::router(WebhookState { orchestrator })
        .merge(health::router(HealthState::new(health_store)));

    Ok(Application { config, router })
}

#[cfg(test)]
mod tests {
    use leadflow_core::config::{AppConfig, LoadOptions};

    use crate::bootstrap::{bootstrap, bootstrap_with_config, BootstrapError};

    fn wired_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.crm.subdomain = "acme".to_string();
        config.crm.client_id = "client-1".to_string();
        config.crm.client_secret = "s3cret".to_string().into();
        config.crm.redirect_uri = "https://example.test/callback".to_string();
        config.pipeline.sales_id = 100;
        config.pipeline.entry_stage_id = 201;
        config.pipeline.qualifying_stage_id = 202;
        config.pipeline.fulfillment_id = 300;
        config.pipeline.fulfillment_stage_id = 301;
        config.reasoning.api_key = Some("sk-test".to_string().into());
        config
    }

    #[test]
    fn bootstrap_fails_fast_when_the_required_config_file_is_missing() {
        let result = bootstrap(LoadOptions {
            config_path: Some("/nonexistent/leadflow.toml".into()),
            require_file: true,
            ..LoadOptions::default()
        });

        assert!(matches!(result, Err(BootstrapError::Config(_))));
    }

    #[test]
    fn bootstrap_wires_the_router_and_keeps_the_config() {
        let app = bootstrap_with_config(wired_config()).expect("bootstrap should succeed");

        assert_eq!(app.config.pipeline.sales_id, 100);
        assert_eq!(app.config.crm.subdomain, "acme");
    }

    #[test]
    fn bootstrap_rejects_a_missing_reasoning_key() {
        let mut config = wired_config();
        config.reasoning.api_key = None;

        let result = bootstrap_with_config(config);

        assert!(matches!(result, Err(BootstrapError::Reasoning(_))));
    }
}
