use std::path::Path;

use chrono::{Duration, Utc};
use leadflow_core::config::{AppConfig, LoadOptions};
use leadflow_crm::{
    AuthError, FileCredentialStore, HttpTokenExchanger, StoredCredentials, TokenExchanger,
    TokenGrant,
};

use crate::commands::CommandResult;

/// One-time authorization-code exchange. The server refreshes tokens on its
/// own afterwards; this only has to seed the credential file.
pub fn run(code: &str, config_path: Option<&Path>) -> CommandResult {
    let options = LoadOptions {
        require_file: config_path.is_some(),
        config_path: config_path.map(Path::to_path_buf),
        ..LoadOptions::default()
    };
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure("auth", "config_validation", error.to_string(), 2)
        }
    };

    let exchanger = match HttpTokenExchanger::new(&config.crm) {
        Ok(exchanger) => exchanger,
        Err(error) => {
            return CommandResult::failure("auth", "exchange_transport", error.to_string(), 3)
        }
    };

    run_with_exchanger(code, &config, &exchanger)
}

pub fn run_with_exchanger(
    code: &str,
    config: &AppConfig,
    exchanger: &dyn TokenExchanger,
) -> CommandResult {
    let code = code.trim();
    if code.is_empty() {
        return CommandResult::failure(
            "auth",
            "invalid_code",
            "authorization code must not be empty",
            2,
        );
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "auth",
                "runtime",
                format!("failed to initialize async runtime: {error}"),
                3,
            )
        }
    };

    let store = FileCredentialStore::new(config.crm.token_path.clone());
    let result = runtime.block_on(async {
        let reply = exchanger.exchange(&TokenGrant::AuthorizationCode(code.to_string())).await?;
        if reply.access_token.trim().is_empty() {
            return Err(AuthError::EmptyAccessToken);
        }

        let credentials = StoredCredentials {
            access_token: reply.access_token,
            refresh_token: reply.refresh_token,
            expires_at: Utc::now() + Duration::seconds(reply.expires_in.max(0)),
        };
        store.persist(&credentials).await?;
        Ok(credentials)
    });

    match result {
        Ok(credentials) => CommandResult::success(
            "auth",
            format!(
                "credentials stored at `{}`; access token expires at {}",
                store.path().display(),
                credentials.expires_at.to_rfc3339()
            ),
        ),
        Err(AuthError::Store(error)) => {
            CommandResult::failure("auth", "credential_store", error.to_string(), 4)
        }
        Err(error @ (AuthError::Rejected { .. } | AuthError::EmptyAccessToken)) => {
            CommandResult::failure("auth", "exchange_rejected", error.to_string(), 3)
        }
        Err(error) => CommandResult::failure("auth", "exchange_transport", error.to_string(), 3),
    }
}
