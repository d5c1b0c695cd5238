//! Symbol registry
//!
//! Every symbol maps explicitly to its `(base, quote)` asset pair. Nothing
//! in the system infers the pair from the symbol string - fixed-width
//! suffix slicing breaks the moment a 4-letter quote asset is listed.

use crate::core_types::{AssetId, SymbolId};
use crate::fee::{DEFAULT_MAKER_FEE, DEFAULT_TAKER_FEE};
use crate::money::{self, MoneyError, ScaledAmount, MAX_SCALE};
use rustc_hash::FxHashMap;

/// Per-symbol trading parameters
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub symbol: String,
    pub symbol_id: SymbolId,
    pub base_asset_id: AssetId,
    pub quote_asset_id: AssetId,
    /// Internal price scale = the quote asset's scale
    pub price_scale: u32,
    /// Internal quantity scale = the base asset's scale
    pub base_scale: u32,
    /// Maker fee rate (10^6 precision: 1000 = 0.10%)
    pub maker_fee: u64,
    /// Taker fee rate (10^6 precision)
    pub taker_fee: u64,
}

impl SymbolInfo {
    /// Base asset unit, e.g. 10^8 for an 8-decimal asset
    #[inline]
    pub fn qty_unit(&self) -> ScaledAmount {
        money::unit_amount(self.base_scale)
    }

    /// Quote notional of `price * qty`, truncating to the quote scale
    #[inline]
    pub fn quote_notional(&self, price: u64, qty: u64) -> Result<u64, MoneyError> {
        money::quote_notional(price, qty, self.base_scale)
    }
}

/// Asset parameters
#[derive(Debug, Clone)]
pub struct AssetInfo {
    pub asset_id: AssetId,
    /// Internal storage scale (e.g. 8 for BTC = 10^8 satoshi), <= MAX_SCALE
    pub scale: u32,
    pub name: String,
}

/// Maps symbols and assets to ids and trading parameters.
///
/// The registry is built once at startup from configuration and shared
/// read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct SymbolRegistry {
    symbol_to_id: FxHashMap<String, SymbolId>,
    symbols: FxHashMap<SymbolId, SymbolInfo>,
    assets: FxHashMap<AssetId, AssetInfo>,
    asset_by_name: FxHashMap<String, AssetId>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset. Scale is capped at [`MAX_SCALE`] fractional digits.
    pub fn add_asset(&mut self, asset_id: AssetId, name: &str, scale: u32) -> Result<(), &'static str> {
        if scale > MAX_SCALE {
            return Err("asset scale exceeds maximum");
        }
        self.assets.insert(
            asset_id,
            AssetInfo {
                asset_id,
                scale,
                name: name.to_string(),
            },
        );
        self.asset_by_name.insert(name.to_string(), asset_id);
        Ok(())
    }

    /// Register a symbol with default fee rates.
    pub fn add_symbol(
        &mut self,
        symbol: &str,
        symbol_id: SymbolId,
        base_asset_id: AssetId,
        quote_asset_id: AssetId,
    ) -> Result<(), &'static str> {
        self.add_symbol_with_fees(
            symbol,
            symbol_id,
            base_asset_id,
            quote_asset_id,
            DEFAULT_MAKER_FEE,
            DEFAULT_TAKER_FEE,
        )
    }

    /// Register a symbol. Both assets must already be registered - the
    /// scales come from them.
    pub fn add_symbol_with_fees(
        &mut self,
        symbol: &str,
        symbol_id: SymbolId,
        base_asset_id: AssetId,
        quote_asset_id: AssetId,
        maker_fee: u64,
        taker_fee: u64,
    ) -> Result<(), &'static str> {
        let base_scale = self
            .assets
            .get(&base_asset_id)
            .map(|a| a.scale)
            .ok_or("base asset not registered")?;
        let price_scale = self
            .assets
            .get(&quote_asset_id)
            .map(|a| a.scale)
            .ok_or("quote asset not registered")?;

        self.symbol_to_id.insert(symbol.to_string(), symbol_id);
        self.symbols.insert(
            symbol_id,
            SymbolInfo {
                symbol: symbol.to_string(),
                symbol_id,
                base_asset_id,
                quote_asset_id,
                price_scale,
                base_scale,
                maker_fee,
                taker_fee,
            },
        );
        Ok(())
    }

    pub fn symbol_id(&self, symbol: &str) -> Option<SymbolId> {
        self.symbol_to_id.get(symbol).copied()
    }

    pub fn symbol_info(&self, symbol: &str) -> Option<&SymbolInfo> {
        let id = self.symbol_id(symbol)?;
        self.symbols.get(&id)
    }

    pub fn symbol_info_by_id(&self, id: SymbolId) -> Option<&SymbolInfo> {
        self.symbols.get(&id)
    }

    pub fn symbol_name(&self, id: SymbolId) -> Option<&str> {
        self.symbols.get(&id).map(|s| s.symbol.as_str())
    }

    pub fn asset(&self, asset_id: AssetId) -> Option<&AssetInfo> {
        self.assets.get(&asset_id)
    }

    pub fn asset_by_name(&self, name: &str) -> Option<&AssetInfo> {
        let id = self.asset_by_name.get(name)?;
        self.assets.get(id)
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn iter_symbols(&self) -> impl Iterator<Item = &SymbolInfo> {
        self.symbols.values()
    }

    /// Parse a client quantity string into base-scaled units
    pub fn parse_qty(&self, qty: &str, symbol_id: SymbolId) -> Result<ScaledAmount, MoneyError> {
        let info = self
            .symbols
            .get(&symbol_id)
            .ok_or_else(|| MoneyError::InvalidFormat("unknown symbol".into()))?;
        money::parse_amount(qty, info.base_scale)
    }

    /// Parse a client price string into quote-scaled units
    pub fn parse_price(&self, price: &str, symbol_id: SymbolId) -> Result<ScaledAmount, MoneyError> {
        let info = self
            .symbols
            .get(&symbol_id)
            .ok_or_else(|| MoneyError::InvalidFormat("unknown symbol".into()))?;
        money::parse_amount(price, info.price_scale)
    }
}
