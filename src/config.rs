//! TOML configuration for the admission server.
//!
//! Everything has a default; an empty file yields a runnable (if
//! provider-less) configuration, and each section can be overridden
//! independently. Secrets never live here — provider credentials are
//! referenced by environment variable name and resolved at startup.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::breaker::BreakerConfig;
use crate::health::HealthConfig;
use crate::ledger::store::CasRetryPolicy;
use crate::ledger::{LedgerConfig, Period};
use crate::router::RouterConfig;
use crate::tier::Tier;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub failover: FailoverSection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub providers: Vec<ProviderSettings>,
}

impl Config {
    /// Load and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8088".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FailoverSection {
    /// Tiers that never absorb overflow from other tiers.
    #[serde(default)]
    pub exclude_tiers: Vec<u8>,
    /// Tiers that must resolve to at least one provider at startup.
    /// Defaults to every tier that has a configured provider.
    #[serde(default)]
    pub serviceable_tiers: Option<Vec<u8>>,
}

impl FailoverSection {
    pub fn excluded(&self) -> Result<Vec<Tier>> {
        self.exclude_tiers.iter().map(|&n| parse_tier(n)).collect()
    }

    pub fn serviceable(&self) -> Result<Option<Vec<Tier>>> {
        self.serviceable_tiers
            .as_ref()
            .map(|tiers| tiers.iter().map(|&n| parse_tier(n)).collect())
            .transpose()
    }
}

fn parse_tier(n: u8) -> Result<Tier> {
    Tier::new(n).with_context(|| format!("tier {n} out of range"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl From<&BreakerSection> for BreakerConfig {
    fn from(section: &BreakerSection) -> Self {
        Self {
            failure_threshold: section.failure_threshold,
            cooldown: Duration::from_secs(section.cooldown_secs),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthSection {
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            freshness_secs: default_freshness_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl From<&HealthSection> for HealthConfig {
    fn from(section: &HealthSection) -> Self {
        Self {
            freshness: Duration::from_secs(section.freshness_secs),
            probe_timeout: Duration::from_secs(section.probe_timeout_secs),
        }
    }
}

fn default_freshness_secs() -> u64 {
    300
}

fn default_probe_timeout_secs() -> u64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerSection {
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
    /// Window the router checks at admission time.
    #[serde(default = "default_enforcement_period")]
    pub enforcement_period: Period,
    #[serde(default = "default_daily_limit")]
    pub default_daily_limit: Decimal,
    #[serde(default = "default_weekly_limit")]
    pub default_weekly_limit: Decimal,
    #[serde(default = "default_monthly_limit")]
    pub default_monthly_limit: Decimal,
    #[serde(default = "default_output_token_allowance")]
    pub output_token_allowance: u32,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            max_cas_retries: default_max_cas_retries(),
            enforcement_period: default_enforcement_period(),
            default_daily_limit: default_daily_limit(),
            default_weekly_limit: default_weekly_limit(),
            default_monthly_limit: default_monthly_limit(),
            output_token_allowance: default_output_token_allowance(),
        }
    }
}

impl LedgerSection {
    pub fn ledger_config(&self) -> LedgerConfig {
        let mut default_limits = BTreeMap::new();
        default_limits.insert(Period::Daily, self.default_daily_limit);
        default_limits.insert(Period::Weekly, self.default_weekly_limit);
        default_limits.insert(Period::Monthly, self.default_monthly_limit);
        LedgerConfig {
            retry: CasRetryPolicy {
                max_attempts: self.max_cas_retries,
            },
            default_limits,
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            enforcement_period: self.enforcement_period,
            output_token_allowance: self.output_token_allowance,
        }
    }
}

fn default_max_cas_retries() -> u32 {
    5
}

fn default_enforcement_period() -> Period {
    Period::Daily
}

fn default_daily_limit() -> Decimal {
    dec!(10)
}

fn default_weekly_limit() -> Decimal {
    dec!(50)
}

fn default_monthly_limit() -> Decimal {
    dec!(150)
}

fn default_output_token_allowance() -> u32 {
    4096
}

/// One configured upstream provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    pub name: String,
    pub tier: u8,
    #[serde(default)]
    pub priority: u8,
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Prices are configured per million tokens, the unit providers quote.
    #[serde(default)]
    pub input_cost_per_million: Decimal,
    #[serde(default)]
    pub output_cost_per_million: Decimal,
    #[serde(default)]
    pub privacy_compatible: bool,
    /// Override of the tier-default invocation deadline.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ProviderSettings {
    pub fn tier(&self) -> Result<Tier> {
        parse_tier(self.tier)
    }

    pub fn input_cost_per_token(&self) -> Decimal {
        self.input_cost_per_million / dec!(1000000)
    }

    pub fn output_cost_per_token(&self) -> Decimal {
        self.output_cost_per_million / dec!(1000000)
    }

    pub fn invoke_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn empty_file_yields_defaults() {
        let file = write_config("");
        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.server.listen, "127.0.0.1:8088");
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.health.freshness_secs, 300);
        assert_eq!(config.ledger.enforcement_period, Period::Daily);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let file = write_config(
            r#"
            [server]
            listen = "0.0.0.0:9000"

            [failover]
            exclude_tiers = [2]
            serviceable_tiers = [0, 1]

            [breaker]
            failure_threshold = 5
            cooldown_secs = 60

            [ledger]
            enforcement_period = "weekly"
            default_daily_limit = "25.50"

            [[providers]]
            name = "ollama"
            tier = 0
            base_url = "http://localhost:11434/v1"
            model = "llama3"
            privacy_compatible = true

            [[providers]]
            name = "openai-main"
            tier = 3
            priority = 1
            base_url = "https://api.openai.com/v1"
            model = "gpt-4o"
            api_key_env = "OPENAI_API_KEY"
            input_cost_per_million = "2.50"
            output_cost_per_million = "10.00"
            timeout_secs = 90
            "#,
        );

        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.failover.excluded().expect("tiers"), vec![Tier::VISION]);
        assert_eq!(config.ledger.enforcement_period, Period::Weekly);
        assert_eq!(config.ledger.default_daily_limit, dec!(25.50));
        assert_eq!(config.providers.len(), 2);

        let openai = &config.providers[1];
        assert_eq!(openai.tier().expect("tier"), Tier::PREMIUM);
        assert_eq!(openai.input_cost_per_token(), dec!(0.0000025));
        assert_eq!(openai.invoke_timeout(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn out_of_range_tier_is_rejected() {
        let file = write_config(
            r#"
            [[providers]]
            name = "p"
            tier = 9
            base_url = "http://x"
            model = "m"
            "#,
        );
        let config = Config::load(file.path()).expect("load");
        assert!(config.providers[0].tier().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config("[server]\nlisten = \"x\"\ntypo_key = 1\n");
        assert!(Config::load(file.path()).is_err());
    }
}
