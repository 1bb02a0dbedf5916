// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Broker engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Hard ceiling on the lifetime of a single operation
    pub operation_timeout: Duration,
    /// Maximum time an operation may stay on one step before it fails
    pub max_step_processing_time: Duration,
    /// Worker count per operation queue
    pub workers_amount: usize,
    /// Binding subsystem settings
    pub binding: BindingConfig,
    /// Instance archiving on deprovisioning
    pub archiving: ToggleConfig,
    /// Runtime-state cleaning on deprovisioning
    pub cleaning: ToggleConfig,
    /// Data-ingress (EDP) registration
    pub edp: EdpConfig,
    /// 32-byte key for at-rest encryption of secret columns
    pub db_secret_key: String,
    /// Path to the YAML file listing EU-access whitelisted global accounts
    pub eu_access_whitelist_file: Option<String>,
    /// Path to the trial platform-region to provider-region mapping file
    pub trial_region_mapping_file: Option<String>,
    /// Path to the converged-cloud platform-region to provider-regions mapping file
    pub converged_cloud_region_mapping_file: Option<String>,
    /// Platform region assumed when a request carries none
    pub default_request_region: String,
}

/// Binding engine settings.
#[derive(Debug, Clone)]
pub struct BindingConfig {
    /// Whether the binding endpoints are served at all
    pub enabled: bool,
    /// Ceiling of non-expired bindings per instance
    pub max_bindings_count: usize,
    /// Default token lifetime when the request carries none
    pub expiration_seconds: u64,
    /// Lower bound accepted from requests
    pub min_expiration_seconds: u64,
    /// Upper bound accepted from requests
    pub max_expiration_seconds: u64,
}

/// On/off switch with a dry-run mode, used by archiving and cleaning.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToggleConfig {
    /// Whether the step is registered at all
    pub enabled: bool,
    /// Log what would happen without mutating storage
    pub dry_run: bool,
}

/// EDP registration settings.
#[derive(Debug, Clone)]
pub struct EdpConfig {
    /// Whether EDP steps are registered
    pub enabled: bool,
    /// Base URL of the EDP API
    pub url: String,
    /// Landscape environment name sent with registrations
    pub environment: String,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bindings_count: 10,
            expiration_seconds: 600,
            min_expiration_seconds: 600,
            max_expiration_seconds: 7200,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `EBROKER_DATABASE_URL`: PostgreSQL connection string
    /// - `EBROKER_DB_SECRET_KEY`: 32-byte key for column encryption
    ///
    /// Everything else has defaults; see the field docs.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("EBROKER_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("EBROKER_DATABASE_URL"))?;
        let db_secret_key = std::env::var("EBROKER_DB_SECRET_KEY")
            .map_err(|_| ConfigError::Missing("EBROKER_DB_SECRET_KEY"))?;
        if db_secret_key.len() != 32 {
            return Err(ConfigError::Invalid(
                "EBROKER_DB_SECRET_KEY",
                "must be exactly 32 bytes",
            ));
        }

        let operation_timeout = duration_var("EBROKER_OPERATION_TIMEOUT_SECONDS", 24 * 3600)?;
        let max_step_processing_time =
            duration_var("EBROKER_MAX_STEP_PROCESSING_TIME_SECONDS", 120)?;
        let workers_amount = parse_var("EBROKER_WORKERS_AMOUNT", 20usize)?;

        let binding = BindingConfig {
            enabled: parse_var("EBROKER_BINDING_ENABLED", true)?,
            max_bindings_count: parse_var("EBROKER_MAX_BINDINGS_COUNT", 10usize)?,
            expiration_seconds: parse_var("EBROKER_BINDING_EXPIRATION_SECONDS", 600u64)?,
            min_expiration_seconds: parse_var("EBROKER_BINDING_MIN_EXPIRATION_SECONDS", 600u64)?,
            max_expiration_seconds: parse_var("EBROKER_BINDING_MAX_EXPIRATION_SECONDS", 7200u64)?,
        };

        let archiving = ToggleConfig {
            enabled: parse_var("EBROKER_ARCHIVE_ENABLED", false)?,
            dry_run: parse_var("EBROKER_ARCHIVE_DRY_RUN", true)?,
        };
        let cleaning = ToggleConfig {
            enabled: parse_var("EBROKER_CLEANING_ENABLED", false)?,
            dry_run: parse_var("EBROKER_CLEANING_DRY_RUN", true)?,
        };
        let edp = EdpConfig {
            enabled: parse_var("EBROKER_EDP_ENABLED", false)?,
            url: std::env::var("EBROKER_EDP_URL").unwrap_or_default(),
            environment: std::env::var("EBROKER_EDP_ENVIRONMENT")
                .unwrap_or_else(|_| "prod".to_string()),
        };

        Ok(Self {
            database_url,
            operation_timeout,
            max_step_processing_time,
            workers_amount,
            binding,
            archiving,
            cleaning,
            edp,
            db_secret_key,
            eu_access_whitelist_file: std::env::var("EBROKER_EU_ACCESS_WHITELIST_FILE").ok(),
            trial_region_mapping_file: std::env::var("EBROKER_TRIAL_REGION_MAPPING_FILE").ok(),
            converged_cloud_region_mapping_file: std::env::var(
                "EBROKER_CONVERGED_CLOUD_REGION_MAPPING_FILE",
            )
            .ok(),
            default_request_region: std::env::var("EBROKER_DEFAULT_REQUEST_REGION")
                .unwrap_or_else(|_| "cf-eu10".to_string()),
        })
    }
}

fn duration_var(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_var(name, default_secs)?))
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "cannot be parsed")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
