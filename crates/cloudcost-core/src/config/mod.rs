//! Configuration: optional TOML file, overridden by environment variables
//!
//! Credentials that are secrets are only ever read from the environment. A
//! config file that contains one is rejected rather than silently ignored.

use crate::cost::Provider;
use crate::storage::database::default_database_path;
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keys that must never appear in the config file
const SECRET_KEYS: &[(&str, &str, &str)] = &[
    ("aws", "secret_access_key", "AWS_SECRET_ACCESS_KEY"),
    ("gcp", "access_token", "GCP_ACCESS_TOKEN"),
    ("azure", "client_secret", "AZURE_CLIENT_SECRET"),
    ("azure", "sponsorship_cookies", "AZURE_SPONSORSHIP_COOKIES"),
];

/// Cloudcost configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub app: AppConfig,
    pub aws: AwsConfig,
    pub gcp: GcpConfig,
    pub azure: AzureConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite file; defaults to the platform config dir
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub lookback_days: i64,
    pub backfill_days: i64,
    pub collector_timeout_secs: u64,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            lookback_days: 2,
            backfill_days: 90,
            collector_timeout_secs: 300,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub access_key_id: Option<String>,
    #[serde(skip)]
    pub secret_access_key: Option<String>,
    pub region: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            access_key_id: None,
            secret_access_key: None,
            region: "us-east-1".to_string(),
        }
    }
}

impl AwsConfig {
    pub fn is_configured(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    /// Narrows the export table to `gcp_billing_export_v1_<account>`
    pub billing_account_id: Option<String>,
    pub project_id: Option<String>,
    /// Service account key file
    pub credentials_path: Option<PathBuf>,
    pub bigquery_dataset: String,
    #[serde(skip)]
    pub access_token: Option<String>,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            billing_account_id: None,
            project_id: None,
            credentials_path: None,
            bigquery_dataset: "billing_export".to_string(),
            access_token: None,
        }
    }
}

impl GcpConfig {
    /// Project is the only hard requirement; tokens fall back to application default credentials
    pub fn is_configured(&self) -> bool {
        self.project_id.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    #[serde(skip)]
    pub client_secret: Option<String>,
    pub subscription_id: Option<String>,
    #[serde(skip)]
    pub sponsorship_cookies: Option<String>,
}

/// How the Azure collector authenticates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AzureAuth {
    ServicePrincipal {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    SponsorshipCookies(String),
}

impl AzureConfig {
    /// Service principal when fully configured, otherwise the sponsorship cookies
    pub fn auth(&self) -> Option<AzureAuth> {
        self.subscription_id.as_ref()?;

        if let (Some(tenant_id), Some(client_id), Some(client_secret)) =
            (&self.tenant_id, &self.client_id, &self.client_secret)
        {
            return Some(AzureAuth::ServicePrincipal {
                tenant_id: tenant_id.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            });
        }

        self.sponsorship_cookies
            .clone()
            .map(AzureAuth::SponsorshipCookies)
    }

    pub fn is_configured(&self) -> bool {
        self.auth().is_some()
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("CLOUDCOST_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("cloudcost")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load the config file (if any), then apply environment overrides
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_file(&path)?;
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file; a missing file yields the defaults
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let table: toml::Table = toml::from_str(contents)?;
        enforce_env_only(&table)?;
        Ok(toml::Value::Table(table).try_into::<Config>()?)
    }

    /// Apply environment overrides through `lookup`. Empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(path) = get("DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }

        if let Some(v) = get("LOOKBACK_DAYS") {
            self.app.lookback_days = v
                .parse()
                .with_context(|| format!("Invalid LOOKBACK_DAYS value: {v}"))?;
        }
        if let Some(v) = get("BACKFILL_DAYS") {
            self.app.backfill_days = v
                .parse()
                .with_context(|| format!("Invalid BACKFILL_DAYS value: {v}"))?;
        }
        if let Some(v) = get("COLLECTOR_TIMEOUT_SECS") {
            self.app.collector_timeout_secs = v
                .parse()
                .with_context(|| format!("Invalid COLLECTOR_TIMEOUT_SECS value: {v}"))?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.app.log_level = v.to_lowercase();
        }

        override_opt(&mut self.aws.access_key_id, get("AWS_ACCESS_KEY_ID"));
        override_opt(&mut self.aws.secret_access_key, get("AWS_SECRET_ACCESS_KEY"));
        if let Some(region) = get("AWS_REGION") {
            self.aws.region = region;
        }

        override_opt(&mut self.gcp.billing_account_id, get("GCP_BILLING_ACCOUNT_ID"));
        override_opt(&mut self.gcp.project_id, get("GCP_PROJECT_ID"));
        override_opt(
            &mut self.gcp.credentials_path,
            get("GCP_CREDENTIALS_PATH")
                .or_else(|| get("GOOGLE_APPLICATION_CREDENTIALS"))
                .map(PathBuf::from),
        );
        if let Some(dataset) = get("GCP_BIGQUERY_DATASET") {
            self.gcp.bigquery_dataset = dataset;
        }
        override_opt(&mut self.gcp.access_token, get("GCP_ACCESS_TOKEN"));

        override_opt(&mut self.azure.tenant_id, get("AZURE_TENANT_ID"));
        override_opt(&mut self.azure.client_id, get("AZURE_CLIENT_ID"));
        override_opt(&mut self.azure.client_secret, get("AZURE_CLIENT_SECRET"));
        override_opt(&mut self.azure.subscription_id, get("AZURE_SUBSCRIPTION_ID"));
        override_opt(&mut self.azure.sponsorship_cookies, get("AZURE_SPONSORSHIP_COOKIES"));

        Ok(())
    }

    /// Validate non-credential settings
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.app.lookback_days <= 0 {
            return Err(anyhow!("lookback_days must be positive"));
        }
        if self.app.backfill_days <= 0 {
            return Err(anyhow!("backfill_days must be positive"));
        }
        if self.app.collector_timeout_secs == 0 {
            return Err(anyhow!("collector_timeout_secs must be positive"));
        }
        if self.gcp.bigquery_dataset.trim().is_empty() {
            return Err(anyhow!("gcp.bigquery_dataset cannot be empty"));
        }
        Ok(())
    }

    /// Missing-credential messages for the requested providers; empty when all are usable
    pub fn validate_for(&self, providers: &BTreeSet<Provider>) -> Vec<String> {
        let mut errors = Vec::new();

        for provider in providers {
            match provider {
                Provider::Aws => {
                    if !self.aws.is_configured() {
                        errors.push(
                            "AWS credentials (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY) are required"
                                .to_string(),
                        );
                    }
                }
                Provider::Gcp => {
                    if self.gcp.project_id.is_none() {
                        errors.push("GCP_PROJECT_ID is required".to_string());
                    }
                }
                Provider::Azure => {
                    if self.azure.subscription_id.is_none() {
                        errors.push("AZURE_SUBSCRIPTION_ID is required".to_string());
                    } else if self.azure.auth().is_none() {
                        errors.push(
                            "Azure credentials are required: AZURE_TENANT_ID, AZURE_CLIENT_ID and \
                             AZURE_CLIENT_SECRET, or AZURE_SPONSORSHIP_COOKIES"
                                .to_string(),
                        );
                    }
                }
            }
        }

        errors
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        match provider {
            Provider::Aws => self.aws.is_configured(),
            Provider::Gcp => self.gcp.is_configured(),
            Provider::Azure => self.azure.is_configured(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database.path.clone().unwrap_or_else(default_database_path)
    }

    pub fn collector_timeout(&self) -> Duration {
        Duration::from_secs(self.app.collector_timeout_secs)
    }

    /// All settings as displayable key/value pairs, secrets redacted
    pub fn list(&self) -> Vec<(String, String)> {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "(not set)".to_string());
        let secret = |v: &Option<String>| redact(v.as_deref());

        vec![
            ("database.path".into(), self.database_path().display().to_string()),
            ("app.lookback_days".into(), self.app.lookback_days.to_string()),
            ("app.backfill_days".into(), self.app.backfill_days.to_string()),
            ("app.collector_timeout_secs".into(), self.app.collector_timeout_secs.to_string()),
            ("app.log_level".into(), self.app.log_level.clone()),
            ("aws.access_key_id".into(), show(&self.aws.access_key_id)),
            ("aws.secret_access_key".into(), secret(&self.aws.secret_access_key)),
            ("aws.region".into(), self.aws.region.clone()),
            ("gcp.billing_account_id".into(), show(&self.gcp.billing_account_id)),
            ("gcp.project_id".into(), show(&self.gcp.project_id)),
            (
                "gcp.credentials_path".into(),
                show(&self.gcp.credentials_path.as_ref().map(|p| p.display().to_string())),
            ),
            ("gcp.bigquery_dataset".into(), self.gcp.bigquery_dataset.clone()),
            ("gcp.access_token".into(), secret(&self.gcp.access_token)),
            ("azure.tenant_id".into(), show(&self.azure.tenant_id)),
            ("azure.client_id".into(), show(&self.azure.client_id)),
            ("azure.client_secret".into(), secret(&self.azure.client_secret)),
            ("azure.subscription_id".into(), show(&self.azure.subscription_id)),
            ("azure.sponsorship_cookies".into(), secret(&self.azure.sponsorship_cookies)),
        ]
    }
}

fn override_opt<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn redact(value: Option<&str>) -> String {
    match value {
        None => "(not set - environment only)".to_string(),
        Some(v) if v.chars().count() <= 4 => "***".to_string(),
        Some(v) => {
            let suffix: String = v.chars().skip(v.chars().count() - 4).collect();
            format!("***{suffix}")
        }
    }
}

fn enforce_env_only(table: &toml::Table) -> anyhow::Result<()> {
    for (section, key, var) in SECRET_KEYS {
        let present = table
            .get(*section)
            .and_then(|s| s.as_table())
            .is_some_and(|s| s.contains_key(*key));
        if present {
            return Err(anyhow!(
                "{section}.{key} must be provided via the {var} environment variable, not stored in configuration"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn all(providers: &[Provider]) -> BTreeSet<Provider> {
        providers.iter().copied().collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.app.lookback_days, 2);
        assert_eq!(config.app.backfill_days, 90);
        assert_eq!(config.app.collector_timeout_secs, 300);
        assert_eq!(config.aws.region, "us-east-1");
        assert_eq!(config.gcp.bigquery_dataset, "billing_export");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env_of(&[
                ("LOOKBACK_DAYS", "3"),
                ("BACKFILL_DAYS", "30"),
                ("AWS_ACCESS_KEY_ID", "AKIA123"),
                ("AWS_SECRET_ACCESS_KEY", "secret"),
                ("AWS_REGION", "eu-west-1"),
                ("GCP_PROJECT_ID", ""),
                ("DB_PATH", "/tmp/costs.db"),
            ]))
            .unwrap();

        assert_eq!(config.app.lookback_days, 3);
        assert_eq!(config.app.backfill_days, 30);
        assert_eq!(config.aws.region, "eu-west-1");
        assert!(config.aws.is_configured());
        // empty values are ignored
        assert!(config.gcp.project_id.is_none());
        assert_eq!(config.database_path(), PathBuf::from("/tmp/costs.db"));
    }

    #[test]
    fn test_invalid_numeric_env_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(env_of(&[("LOOKBACK_DAYS", "two")]))
            .unwrap_err();
        assert!(err.to_string().contains("LOOKBACK_DAYS"));
    }

    #[test]
    fn test_gcp_credentials_path_fallback() {
        let mut config = Config::default();
        config
            .apply_env(env_of(&[("GOOGLE_APPLICATION_CREDENTIALS", "/keys/sa.json")]))
            .unwrap();
        assert_eq!(config.gcp.credentials_path, Some(PathBuf::from("/keys/sa.json")));
    }

    #[test]
    fn test_file_settings() {
        let config = Config::from_toml_str(
            r#"
            [app]
            lookback_days = 4

            [gcp]
            project_id = "billing-project"
            bigquery_dataset = "exports"
            "#,
        )
        .unwrap();
        assert_eq!(config.app.lookback_days, 4);
        assert_eq!(config.app.backfill_days, 90);
        assert_eq!(config.gcp.project_id.as_deref(), Some("billing-project"));
        assert_eq!(config.gcp.bigquery_dataset, "exports");
    }

    #[test]
    fn test_secrets_in_file_rejected() {
        let err = Config::from_toml_str(
            r#"
            [azure]
            sponsorship_cookies = "session=abc"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("AZURE_SPONSORSHIP_COOKIES"));

        assert!(Config::from_toml_str("[aws]\nsecret_access_key = \"x\"\n").is_err());
    }

    #[test]
    fn test_azure_backend_selection() {
        let mut azure = AzureConfig {
            subscription_id: Some("sub".into()),
            sponsorship_cookies: Some("cookie=1".into()),
            ..Default::default()
        };
        assert_eq!(azure.auth(), Some(AzureAuth::SponsorshipCookies("cookie=1".into())));

        azure.tenant_id = Some("tenant".into());
        azure.client_id = Some("client".into());
        // incomplete service principal still falls back to cookies
        assert!(matches!(azure.auth(), Some(AzureAuth::SponsorshipCookies(_))));

        azure.client_secret = Some("secret".into());
        assert!(matches!(azure.auth(), Some(AzureAuth::ServicePrincipal { .. })));

        azure.subscription_id = None;
        assert_eq!(azure.auth(), None);
    }

    #[test]
    fn test_validate_for_reports_every_missing_provider() {
        let config = Config::default();
        let errors = config.validate_for(&all(&Provider::ALL));
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("AWS_ACCESS_KEY_ID"));
        assert!(errors[1].contains("GCP_PROJECT_ID"));
        assert!(errors[2].contains("AZURE_SUBSCRIPTION_ID"));

        let mut config = Config::default();
        config.gcp.project_id = Some("p".into());
        assert!(config.validate_for(&all(&[Provider::Gcp])).is_empty());
    }

    #[test]
    fn test_validate_rejects_non_positive_days() {
        let mut config = Config::default();
        config.app.lookback_days = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.app.collector_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_list_redacts_secrets() {
        let mut config = Config::default();
        config.azure.client_secret = Some("supersecretvalue".into());
        let listed: HashMap<_, _> = config.list().into_iter().collect();
        assert_eq!(listed["azure.client_secret"], "***alue");
        assert!(listed["aws.secret_access_key"].contains("not set"));
        assert_eq!(listed["aws.access_key_id"], "(not set)");
    }
}
