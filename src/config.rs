use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub engine: EngineSection,
    pub publisher: PublisherSection,
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
    #[serde(default)]
    pub symbols: Vec<SymbolEntry>,
    /// PostgreSQL connection URL for the relational mirror
    #[serde(default)]
    pub postgres_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineSection {
    /// Per-symbol command queue capacity
    pub queue_capacity: usize,
    /// Per-command submit budget in milliseconds
    pub submit_timeout_ms: u64,
    /// Shutdown drain grace period in milliseconds
    pub shutdown_grace_ms: u64,
    /// Market order slippage allowance in permille (50 = 5%)
    pub market_slippage_permille: u64,
    /// Levels per side in published depth events
    pub depth_levels: usize,
    /// User id commissions are credited to
    pub fee_account: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            submit_timeout_ms: 2_000,
            shutdown_grace_ms: 5_000,
            market_slippage_permille: 50,
            depth_levels: 20,
            fee_account: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PublisherSection {
    /// Per-subscriber outbound queue capacity; overflow disconnects
    pub subscriber_queue_capacity: usize,
    /// Heartbeat ping interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 1_024,
            heartbeat_interval_secs: 30,
        }
    }
}

/// One tradeable asset
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AssetEntry {
    pub asset_id: u32,
    pub name: String,
    /// Fractional digits of the internal fixed-point representation
    pub scale: u32,
}

/// One listed symbol with its explicit (base, quote) pair
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SymbolEntry {
    pub symbol: String,
    pub symbol_id: u32,
    pub base_asset_id: u32,
    pub quote_asset_id: u32,
    #[serde(default = "default_fee")]
    pub maker_fee: u64,
    #[serde(default = "default_fee")]
    pub taker_fee: u64,
}

fn default_fee() -> u64 {
    crate::fee::DEFAULT_MAKER_FEE
}

impl AppConfig {
    /// Load config from YAML file based on environment
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config: Self =
            serde_yaml::from_str(&content).context("Failed to parse config yaml")?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Environment variables take precedence over YAML config.
    /// Format: SPM_<SECTION>_<FIELD> (uppercase with underscores)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SPM_LOG_LEVEL") {
            tracing::info!("Config override: log_level = {} (from SPM_LOG_LEVEL)", level);
            self.log_level = level;
        }
        if let Ok(url) = std::env::var("SPM_POSTGRES_URL") {
            tracing::info!("Config override: postgres_url = [REDACTED] (from SPM_POSTGRES_URL)");
            self.postgres_url = Some(url);
        }
        if let Ok(capacity) = std::env::var("SPM_ENGINE_QUEUE_CAPACITY") {
            if let Ok(c) = capacity.parse::<usize>() {
                tracing::info!(
                    "Config override: engine.queue_capacity = {} (from SPM_ENGINE_QUEUE_CAPACITY)",
                    c
                );
                self.engine.queue_capacity = c;
            }
        }
        if let Ok(timeout) = std::env::var("SPM_ENGINE_SUBMIT_TIMEOUT_MS") {
            if let Ok(t) = timeout.parse::<u64>() {
                tracing::info!(
                    "Config override: engine.submit_timeout_ms = {} (from SPM_ENGINE_SUBMIT_TIMEOUT_MS)",
                    t
                );
                self.engine.submit_timeout_ms = t;
            }
        }
    }

    /// Validate configuration at startup.
    ///
    /// Returns an error if any critical configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log_level '{}': must be one of {:?}",
                self.log_level,
                valid_levels
            );
        }

        if self.engine.queue_capacity == 0 {
            anyhow::bail!("Invalid engine.queue_capacity: must be > 0");
        }
        if self.engine.submit_timeout_ms == 0 {
            anyhow::bail!("Invalid engine.submit_timeout_ms: must be > 0");
        }
        if self.publisher.subscriber_queue_capacity == 0 {
            anyhow::bail!("Invalid publisher.subscriber_queue_capacity: must be > 0");
        }

        for symbol in &self.symbols {
            let base_known = self.assets.iter().any(|a| a.asset_id == symbol.base_asset_id);
            let quote_known = self.assets.iter().any(|a| a.asset_id == symbol.quote_asset_id);
            if !base_known || !quote_known {
                anyhow::bail!(
                    "Symbol {} references unregistered assets ({}, {})",
                    symbol.symbol,
                    symbol.base_asset_id,
                    symbol.quote_asset_id
                );
            }
        }

        Ok(())
    }

    /// Build the symbol registry from the configured assets and symbols.
    pub fn build_registry(&self) -> Result<crate::symbols::SymbolRegistry> {
        let mut registry = crate::symbols::SymbolRegistry::new();
        for asset in &self.assets {
            registry
                .add_asset(asset.asset_id, &asset.name, asset.scale)
                .map_err(|e| anyhow::anyhow!("asset {}: {}", asset.name, e))?;
        }
        for symbol in &self.symbols {
            registry
                .add_symbol_with_fees(
                    &symbol.symbol,
                    symbol.symbol_id,
                    symbol.base_asset_id,
                    symbol.quote_asset_id,
                    symbol.maker_fee,
                    symbol.taker_fee,
                )
                .map_err(|e| anyhow::anyhow!("symbol {}: {}", symbol.symbol, e))?;
        }
        Ok(registry)
    }
}
