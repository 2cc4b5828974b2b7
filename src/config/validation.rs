use crate::config::types::{Config, FetchConfig, ProjectConfig};
use crate::url::{FilterRules, MimeDefinition};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_project_config(&config.project)?;
    validate_fetch_config(&config.fetch)?;
    validate_mime_definitions(&config.mime)?;
    FilterRules::compile(&config.filter)?;
    Ok(())
}

/// Validates the `[project]` section
fn validate_project_config(config: &ProjectConfig) -> Result<(), ConfigError> {
    if config.local_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "local-path cannot be empty".to_string(),
        ));
    }

    validate_http_url("remote", &config.remote)?;

    if config.default_index.is_empty() {
        return Err(ConfigError::Validation(
            "default-index cannot be empty".to_string(),
        ));
    }

    if config.default_index.contains('/') || config.default_index.contains('\\') {
        return Err(ConfigError::Validation(format!(
            "default-index must be a plain file name, got '{}'",
            config.default_index
        )));
    }

    if config.temp_dir.as_deref() == Some(config.local_path.as_path()) {
        return Err(ConfigError::Validation(
            "temp-dir must differ from local-path".to_string(),
        ));
    }

    Ok(())
}

/// Validates the `[fetch]` section
fn validate_fetch_config(config: &FetchConfig) -> Result<(), ConfigError> {
    if config.timeout_to_headers < 1 {
        return Err(ConfigError::Validation(format!(
            "timeout-to-headers must be >= 1ms, got {}ms",
            config.timeout_to_headers
        )));
    }

    if config.timeout_to_download < 1 {
        return Err(ConfigError::Validation(format!(
            "timeout-to-download must be >= 1ms, got {}ms",
            config.timeout_to_download
        )));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    if let Some(proxy) = &config.proxy {
        Url::parse(proxy)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid proxy '{}': {}", proxy, e)))?;
    }

    Ok(())
}

/// Validates `[[mime]]` entries
fn validate_mime_definitions(definitions: &[MimeDefinition]) -> Result<(), ConfigError> {
    for definition in definitions {
        if !definition.mime.contains('/') {
            return Err(ConfigError::Validation(format!(
                "MIME type '{}' must look like 'type/subtype'",
                definition.mime
            )));
        }

        if definition.extensions.is_empty() {
            return Err(ConfigError::Validation(format!(
                "MIME type '{}' must have at least one extension",
                definition.mime
            )));
        }
    }
    Ok(())
}

/// Checks that a value parses as an absolute http(s) URL with a host
fn validate_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid {} '{}': {}", field, value, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "{} must use http or https, got '{}'",
            field,
            url.scheme()
        )));
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidUrl(format!(
            "{} '{}' has no host",
            field, value
        )));
    }

    Ok(())
}
