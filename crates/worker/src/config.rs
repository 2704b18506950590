//! Worker configuration from environment variables
//!
//! Gateway and messaging credentials are read by their own clients
//! (`TossConfig::from_env`, `ProviderConfig::from_env`); this covers the
//! database, scheduling and retention knobs.

use std::str::FromStr;

use anyhow::{anyhow, Context};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,
    pub tenant_utc_offset_hours: i8,
    pub billing_cron: String,
    pub billing_max_attempts: u32,
    pub billing_stale_charge_minutes: i64,
    pub notification_cron: String,
    pub notification_batch_size: i64,
    pub notification_retention_days: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset and blank values take defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;

        let config = Self {
            database_url,
            database_max_connections: parse(&var, "DATABASE_MAX_CONNECTIONS", 5)?,
            run_migrations: parse(&var, "RUN_MIGRATIONS", true)?,
            tenant_utc_offset_hours: parse(&var, "TENANT_UTC_OFFSET_HOURS", 9)?,
            billing_cron: var("BILLING_CRON").unwrap_or_else(|| "0 5 15 * * *".to_string()),
            billing_max_attempts: parse(&var, "BILLING_MAX_ATTEMPTS", 3)?,
            billing_stale_charge_minutes: parse(&var, "BILLING_STALE_CHARGE_MINUTES", 60)?,
            notification_cron: var("NOTIFICATION_CRON")
                .unwrap_or_else(|| "0 * * * * *".to_string()),
            notification_batch_size: parse(&var, "NOTIFICATION_BATCH_SIZE", 50)?,
            notification_retention_days: parse(&var, "NOTIFICATION_RETENTION_DAYS", 30)?,
        };

        if config.billing_max_attempts == 0 {
            return Err(anyhow!("BILLING_MAX_ATTEMPTS must be at least 1"));
        }
        if config.notification_batch_size < 1 {
            return Err(anyhow!("NOTIFICATION_BATCH_SIZE must be at least 1"));
        }

        Ok(config)
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("DATABASE_URL", "postgres://localhost/academy")]).unwrap();

        assert_eq!(config.database_max_connections, 5);
        assert!(config.run_migrations);
        assert_eq!(config.tenant_utc_offset_hours, 9);
        assert_eq!(config.billing_cron, "0 5 15 * * *");
        assert_eq!(config.billing_max_attempts, 3);
        assert_eq!(config.billing_stale_charge_minutes, 60);
        assert_eq!(config.notification_cron, "0 * * * * *");
        assert_eq!(config.notification_batch_size, 50);
        assert_eq!(config.notification_retention_days, 30);
    }

    #[test]
    fn test_database_url_required() {
        assert!(config_from(&[]).is_err());
        assert!(config_from(&[("DATABASE_URL", "  ")]).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/academy"),
            ("RUN_MIGRATIONS", "false"),
            ("TENANT_UTC_OFFSET_HOURS", "-5"),
            ("BILLING_CRON", "0 0 5 * * *"),
            ("NOTIFICATION_BATCH_SIZE", "10"),
        ])
        .unwrap();

        assert!(!config.run_migrations);
        assert_eq!(config.tenant_utc_offset_hours, -5);
        assert_eq!(config.billing_cron, "0 0 5 * * *");
        assert_eq!(config.notification_batch_size, 10);
    }

    #[test]
    fn test_invalid_number_names_variable() {
        let err = config_from(&[
            ("DATABASE_URL", "postgres://localhost/academy"),
            ("BILLING_MAX_ATTEMPTS", "three"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("BILLING_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(config_from(&[
            ("DATABASE_URL", "postgres://localhost/academy"),
            ("BILLING_MAX_ATTEMPTS", "0"),
        ])
        .is_err());
    }
}
