//! Per-symbol matching core
//!
//! A `SymbolEngine` is driven by exactly one worker at a time (see
//! `engine::service`): all mutations for a symbol are serialised, so the
//! book needs no interior locking. The Balance Store is shared across
//! symbols and does its own row-ordered locking.
//!
//! # Command flow
//!
//! ```text
//! Submit -> validate -> lock funds -> persist OPEN -> match -> residual policy
//!                          |  InsufficientFunds
//!                          v
//!                  persist REJECTED
//!
//! Cancel -> ownership/status check -> remove from book -> unlock -> CANCELLED
//! ```
//!
//! A failed settlement is fatal: the in-flight match aborts with the book
//! unchanged and the engine refuses further commands for this symbol until
//! an operator intervenes.

use crate::balance_store::{BalanceStore, Settlement};
use crate::core_types::{AssetId, OrderId, UserId};
use crate::engine::events::{BookSnapshot, DepthSnapshot, EventMessage};
use crate::error::{EngineError, Result};
use crate::fee::calculate_fee;
use crate::models::{Order, OrderStatus, OrderType, Side, TimeInForce, Trade};
use crate::orderbook::OrderBook;
use crate::persistence::MirrorEffect;
use crate::publisher::EventPublisher;
use crate::store::{OrderStore, TradeStore};
use crate::symbols::SymbolInfo;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Engine tuning knobs, shared by all symbol workers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Slippage allowance for market orders, in permille of the touch
    /// price (50 = 5%). Market buys pre-lock `cap_price * qty` of quote
    /// where `cap_price = best_ask * (1000 + permille) / 1000`.
    pub market_slippage_permille: u64,
    /// Price levels per side in published depth events
    pub depth_levels: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            market_slippage_permille: 50,
            depth_levels: 20,
        }
    }
}

/// A validated submit command, quantities already scaled by the registry.
#[derive(Debug, Clone)]
pub struct SubmitOrder {
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: u64,
    pub price: Option<u64>,
    pub stop_price: Option<u64>,
    pub tif: TimeInForce,
    pub client_order_id: Option<String>,
    pub display_qty: Option<u64>,
}

/// Cancel acknowledgement. `already_terminal` marks the idempotent case:
/// the order was terminal before this command and nothing changed.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelAck {
    pub order: Order,
    pub already_terminal: bool,
}

pub struct SymbolEngine {
    info: SymbolInfo,
    cfg: EngineConfig,
    book: OrderBook,
    /// Armed stop orders in acceptance order; not part of the book
    stops: Vec<Order>,
    /// Exact remaining locked amount per live order (quote for buys, base
    /// for sells). Tracking the leftovers explicitly instead of
    /// recomputing them keeps unlocks exact in the presence of notional
    /// truncation and price improvement.
    locked_remaining: FxHashMap<OrderId, u64>,
    balances: Arc<BalanceStore>,
    orders: Arc<OrderStore>,
    trades: Arc<TradeStore>,
    publisher: Arc<EventPublisher>,
    next_order_id: Arc<AtomicU64>,
    next_trade_id: Arc<AtomicU64>,
    /// Raised on any symbol's fatal halt; the process exits non-zero
    fatal_flag: Arc<AtomicBool>,
    /// State changes of the command in flight, drained by the worker and
    /// applied to the relational mirror before the next command runs
    effects: Vec<MirrorEffect>,
    last_trade_price: Option<u64>,
    halted: Option<String>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SymbolEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info: SymbolInfo,
        cfg: EngineConfig,
        balances: Arc<BalanceStore>,
        orders: Arc<OrderStore>,
        trades: Arc<TradeStore>,
        publisher: Arc<EventPublisher>,
        next_order_id: Arc<AtomicU64>,
        next_trade_id: Arc<AtomicU64>,
        fatal_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            info,
            cfg,
            book: OrderBook::new(),
            stops: Vec::new(),
            locked_remaining: FxHashMap::default(),
            balances,
            orders,
            trades,
            publisher,
            next_order_id,
            next_trade_id,
            fatal_flag,
            effects: Vec::new(),
            last_trade_price: None,
            halted: None,
        }
    }

    /// Hand the in-flight command's recorded state changes to the caller.
    /// The worker applies them to the relational mirror before dequeuing
    /// the next command.
    pub fn drain_effects(&mut self) -> Vec<MirrorEffect> {
        std::mem::take(&mut self.effects)
    }

    pub fn symbol(&self) -> &str {
        &self.info.symbol
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Rebuild the book and the trigger table from the order store on cold
    /// start.
    ///
    /// Orders arrive sorted by `(created_at, order_id)` which reproduces
    /// FIFO within each price level and the stops' acceptance order. Armed
    /// stops are persisted Open but must NOT enter the book: they carry no
    /// book price (a pure STOP has `price = 0`) and provide no liquidity
    /// until their trigger fires. Their lock leftover is rebuilt from the
    /// same basis `lock_requirement` used at acceptance.
    ///
    /// The recomputed buy-side lock leftovers are a lower bound of the
    /// true leftovers (notional truncation is floor-superadditive), so
    /// hydrated unlocks can never exceed what is actually locked.
    pub fn hydrate(&mut self) {
        let open = self.orders.open_by_symbol(self.info.symbol_id, usize::MAX);
        let (mut resting, mut armed) = (0usize, 0usize);
        for order in open {
            if matches!(order.order_type, OrderType::Stop | OrderType::StopLimit) {
                let remaining = match order.side {
                    Side::Buy => {
                        let basis = match order.order_type {
                            OrderType::StopLimit => order.price,
                            _ => self.slip_up(order.stop_price.unwrap_or(0)),
                        };
                        self.info.quote_notional(basis, order.qty).unwrap_or(0)
                    }
                    Side::Sell => order.qty,
                };
                self.locked_remaining.insert(order.order_id, remaining);
                self.stops.push(order);
                armed += 1;
                continue;
            }
            let remaining = match order.side {
                Side::Buy => self
                    .info
                    .quote_notional(order.price, order.remaining_qty())
                    .unwrap_or(0),
                Side::Sell => order.remaining_qty(),
            };
            self.locked_remaining.insert(order.order_id, remaining);
            self.book.insert(order);
            resting += 1;
        }
        tracing::info!(
            symbol = %self.info.symbol,
            orders = resting,
            stops = armed,
            "book hydrated"
        );
    }

    // ============================================================
    // SUBMIT
    // ============================================================

    pub fn submit(&mut self, cmd: SubmitOrder) -> Result<Order> {
        self.check_halted()?;
        self.validate(&cmd)?;

        let now = now_ms();
        let order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        let mut order = Order {
            order_id,
            user_id: cmd.user_id,
            client_order_id: cmd.client_order_id.clone(),
            symbol_id: self.info.symbol_id,
            side: cmd.side,
            order_type: cmd.order_type,
            price: cmd.price.unwrap_or(0),
            stop_price: cmd.stop_price,
            qty: cmd.qty,
            filled_qty: 0,
            display_qty: cmd.display_qty,
            tif: cmd.tif,
            status: OrderStatus::Open,
            reject_reason: None,
            created_at_ms: now,
            updated_at_ms: now,
            closed_at_ms: None,
        };

        // Market orders need a touch price to cap slippage against; an
        // empty opposite side means there is nothing sensible to lock.
        let market_cap = match self.market_cap(&order) {
            Ok(cap) => cap,
            Err(e) => {
                self.persist_rejected(order, "no liquidity for market order", now)?;
                return Err(e);
            }
        };

        let (lock_asset, lock_amount) = self.lock_requirement(&order, market_cap)?;
        match self.balances.lock(order.user_id, lock_asset, lock_amount) {
            Ok(()) => self.record_balance(order.user_id, lock_asset),
            Err(EngineError::InsufficientFunds) => {
                self.persist_rejected(order, "insufficient funds", now)?;
                return Err(EngineError::InsufficientFunds);
            }
            Err(e) => return Err(self.maybe_halt(e)),
        }

        if let Err(e) = self.orders.insert(order.clone()) {
            // Duplicate order id / client order id: release the lock
            self.balances
                .unlock(order.user_id, lock_asset, lock_amount)
                .map_err(|u| self.maybe_halt(u))?;
            self.record_balance(order.user_id, lock_asset);
            return Err(e);
        }
        self.locked_remaining.insert(order_id, lock_amount);
        self.emit_order(&order);

        // Stop orders arm and wait for their trigger; no matching now.
        if matches!(order.order_type, OrderType::Stop | OrderType::StopLimit) {
            self.stops.push(order.clone());
            return Ok(order);
        }

        // FOK: all-or-nothing, checked against the book before any fill
        if cmd.tif == TimeInForce::Fok {
            let available =
                self.book
                    .available_qty(order.side.opposite(), self.taker_limit(&order, market_cap), order.qty);
            if available < order.qty {
                self.release_lock(&order)?;
                let rejected = self
                    .orders
                    .mark_rejected(order_id, "FOK: insufficient liquidity", now)
                    .map_err(|e| self.maybe_halt(e))?;
                self.emit_order(&rejected);
                return Ok(rejected);
            }
        }

        // Stop types returned above; only Market and Limit reach the book
        if order.order_type == OrderType::Market {
            self.execute_market(&mut order, market_cap)?;
        } else {
            self.execute_limit(&mut order)?;
        }

        self.publish_depth();
        self.trigger_stops()?;

        Ok(self.orders.get_any(order_id).unwrap_or(order))
    }

    fn validate(&self, cmd: &SubmitOrder) -> Result<()> {
        if cmd.qty == 0 {
            return Err(EngineError::validation("quantity must be > 0"));
        }
        match cmd.order_type {
            OrderType::Limit | OrderType::StopLimit => {
                if cmd.price.unwrap_or(0) == 0 {
                    return Err(EngineError::validation("limit price must be > 0"));
                }
            }
            OrderType::Market => {}
            OrderType::Stop => {}
        }
        if matches!(cmd.order_type, OrderType::Stop | OrderType::StopLimit)
            && cmd.stop_price.unwrap_or(0) == 0
        {
            return Err(EngineError::validation("stop price must be > 0"));
        }
        if let Some(display) = cmd.display_qty {
            if display == 0 || display > cmd.qty {
                return Err(EngineError::validation("display quantity out of range"));
            }
        }
        if cmd.symbol != self.info.symbol {
            return Err(EngineError::validation("symbol routed to wrong engine"));
        }
        Ok(())
    }

    /// Slippage-capped walk limit for market orders, None for limit orders.
    /// Stop markets compute their cap from the stop price at activation.
    fn market_cap(&self, order: &Order) -> Result<Option<u64>> {
        if order.order_type != OrderType::Market {
            return Ok(None);
        }
        let touch = match order.side {
            Side::Buy => self.book.best_ask(),
            Side::Sell => self.book.best_bid(),
        }
        .ok_or_else(|| EngineError::validation("no liquidity for market order"))?;
        Ok(Some(match order.side {
            Side::Buy => self.slip_up(touch),
            Side::Sell => self.slip_down(touch),
        }))
    }

    fn slip_up(&self, price: u64) -> u64 {
        let wide = price as u128 * (1000 + self.cfg.market_slippage_permille) as u128 / 1000;
        wide.min(u64::MAX as u128) as u64
    }

    fn slip_down(&self, price: u64) -> u64 {
        (price as u128 * 1000 / (1000 + self.cfg.market_slippage_permille) as u128) as u64
    }

    /// Asset and amount to lock at acceptance.
    ///
    /// BUY locks quote: the limit notional, or the slippage-capped notional
    /// for markets and stop-markets. SELL locks the base quantity.
    fn lock_requirement(&self, order: &Order, market_cap: Option<u64>) -> Result<(AssetId, u64)> {
        match order.side {
            Side::Sell => Ok((self.info.base_asset_id, order.qty)),
            Side::Buy => {
                let cap_price = match order.order_type {
                    OrderType::Limit | OrderType::StopLimit => order.price,
                    OrderType::Market => {
                        market_cap.ok_or_else(|| EngineError::validation("market cap missing"))?
                    }
                    // Market on trigger: cap from the stop price
                    OrderType::Stop => self.slip_up(order.stop_price.unwrap_or(0)),
                };
                let notional = self
                    .info
                    .quote_notional(cap_price, order.qty)
                    .map_err(|_| EngineError::validation("order notional overflows"))?;
                Ok((self.info.quote_asset_id, notional))
            }
        }
    }

    /// Price bound a taker accepts from the opposite side, None = any.
    fn taker_limit(&self, order: &Order, market_cap: Option<u64>) -> Option<u64> {
        match order.order_type {
            OrderType::Limit | OrderType::StopLimit => Some(order.price),
            OrderType::Market | OrderType::Stop => market_cap,
        }
    }

    fn execute_limit(&mut self, order: &mut Order) -> Result<()> {
        self.match_incoming(order, None)?;

        if order.is_filled() {
            return Ok(());
        }
        if order.tif == TimeInForce::Ioc {
            // Residual cancels: unlock what is left and close the order
            return self.cancel_residual(order);
        }
        // GTC residual rests; the store already carries the right status
        self.book.insert(order.clone());
        Ok(())
    }

    fn execute_market(&mut self, order: &mut Order, cap: Option<u64>) -> Result<()> {
        self.match_incoming(order, cap)?;

        if order.filled_qty == 0 {
            self.release_lock(order)?;
            let rejected = self
                .orders
                .mark_rejected(order.order_id, "no fillable liquidity within slippage cap", now_ms())
                .map_err(|e| self.maybe_halt(e))?;
            self.emit_order(&rejected);
        } else if !order.is_filled() {
            // Market orders never rest: the remainder cancels
            self.cancel_residual(order)?;
        }
        Ok(())
    }

    /// Walk the opposite side of the book, best price first, FIFO within a
    /// level, filling at each maker's price until the taker is done or no
    /// acceptable price remains.
    fn match_incoming(&mut self, taker: &mut Order, market_cap: Option<u64>) -> Result<()> {
        let opposite = taker.side.opposite();
        let price_bound = self.taker_limit(taker, market_cap);

        while !taker.is_filled() {
            let (maker_snapshot, trade_price, fill_qty) = {
                let Some(top) = self.book.peek_top(opposite) else {
                    break;
                };
                let acceptable = match (taker.side, price_bound) {
                    (_, None) => true,
                    (Side::Buy, Some(limit)) => top.price <= limit,
                    (Side::Sell, Some(limit)) => top.price >= limit,
                };
                if !acceptable {
                    break;
                }
                let fill_qty = taker.remaining_qty().min(top.remaining_qty());
                (top.clone(), top.price, fill_qty)
            };

            self.execute_fill(taker, &maker_snapshot, trade_price, fill_qty)?;
        }
        Ok(())
    }

    /// One fill: settle balances, then apply the fill to the book and the
    /// stores and emit events.
    ///
    /// Settlement runs first so a failed settlement aborts with the book
    /// untouched; the symbol halts in that case.
    fn execute_fill(
        &mut self,
        taker: &mut Order,
        maker: &Order,
        trade_price: u64,
        fill_qty: u64,
    ) -> Result<()> {
        let now = now_ms();
        let (buyer, seller) = match taker.side {
            Side::Buy => (&*taker, maker),
            Side::Sell => (maker, &*taker),
        };
        let buyer_is_maker = buyer.order_id == maker.order_id;

        let notional = self
            .info
            .quote_notional(trade_price, fill_qty)
            .map_err(|e| self.halt(format!("fill notional overflow: {}", e)))?;
        let buyer_fee = calculate_fee(
            fill_qty,
            if buyer_is_maker { self.info.maker_fee } else { self.info.taker_fee },
        );
        let seller_fee = calculate_fee(
            notional,
            if buyer_is_maker { self.info.taker_fee } else { self.info.maker_fee },
        );

        let settlement = Settlement {
            buyer: buyer.user_id,
            seller: seller.user_id,
            base_asset: self.info.base_asset_id,
            quote_asset: self.info.quote_asset_id,
            base_qty: fill_qty,
            quote_amount: notional,
            buyer_fee,
            seller_fee,
        };
        let (buyer_order_id, seller_order_id) = (buyer.order_id, seller.order_id);
        if let Err(e) = self.balances.settle(&settlement) {
            tracing::error!(
                symbol = %self.info.symbol,
                maker_order = maker.order_id,
                taker_order = taker.order_id,
                price = trade_price,
                qty = fill_qty,
                notional,
                "settlement failed, halting symbol: {}",
                e
            );
            return Err(self.halt(format!("settlement failed: {}", e)));
        }

        // All six settled rows changed
        self.record_balance(settlement.buyer, self.info.base_asset_id);
        self.record_balance(settlement.buyer, self.info.quote_asset_id);
        self.record_balance(settlement.seller, self.info.base_asset_id);
        self.record_balance(settlement.seller, self.info.quote_asset_id);
        self.record_balance(self.balances.fee_account(), self.info.base_asset_id);
        self.record_balance(self.balances.fee_account(), self.info.quote_asset_id);

        // Consume the locked leftovers exactly as settlement consumed funds
        self.consume_locked(buyer_order_id, notional)
            .map_err(|e| self.maybe_halt(e))?;
        self.consume_locked(seller_order_id, fill_qty)
            .map_err(|e| self.maybe_halt(e))?;

        // Apply the fill to the resting side; fill_top removes the order
        // and cleans up the level when it is fully filled
        let (maker_updated, _maker_removed) = self
            .book
            .fill_top(maker.side, fill_qty)
            .ok_or_else(|| self.halt("book top vanished mid-fill".to_string()))?;
        if maker_updated.order_id != maker.order_id {
            return Err(self.halt(format!(
                "book top changed mid-fill: expected {}, found {}",
                maker.order_id, maker_updated.order_id
            )));
        }
        taker.filled_qty += fill_qty;

        let maker_stored = self
            .orders
            .update_fill(maker.order_id, maker_updated.filled_qty, now)
            .map_err(|e| self.maybe_halt(e))?;
        let taker_stored = self
            .orders
            .update_fill(taker.order_id, taker.filled_qty, now)
            .map_err(|e| self.maybe_halt(e))?;
        taker.status = taker_stored.status;

        // A fully filled buy order releases its truncation/improvement dust
        for filled in [&maker_stored, &taker_stored] {
            if filled.is_filled() {
                self.finish_lock_entry(filled)?;
            }
        }
        let trade = Trade {
            trade_id: self.next_trade_id.fetch_add(1, Ordering::Relaxed),
            symbol_id: self.info.symbol_id,
            maker_order_id: maker.order_id,
            taker_order_id: taker.order_id,
            buyer_user_id: settlement.buyer,
            seller_user_id: settlement.seller,
            price: trade_price,
            qty: fill_qty,
            buyer_fee,
            seller_fee,
            taker_side: taker.side,
            created_at_ms: now,
        };
        self.trades
            .insert(trade.clone())
            .map_err(|e| self.maybe_halt(e))?;
        self.effects.push(MirrorEffect::Trade(trade.clone()));
        self.last_trade_price = Some(trade_price);

        self.publisher
            .publish(EventMessage::trade(&self.info.symbol, &trade, now));
        self.emit_order(&maker_stored);
        self.emit_order(&taker_stored);
        Ok(())
    }

    /// Decrement an order's tracked locked leftover by the amount the
    /// settlement just consumed.
    fn consume_locked(&mut self, order_id: OrderId, amount: u64) -> Result<()> {
        let entry = self.locked_remaining.get_mut(&order_id).ok_or_else(|| {
            EngineError::invariant(format!("no lock entry for order {}", order_id))
        })?;
        let current = *entry;
        *entry = current.checked_sub(amount).ok_or_else(|| {
            EngineError::invariant(format!(
                "lock underrun on order {}: {} < {}",
                order_id, current, amount
            ))
        })?;
        Ok(())
    }

    /// Drop a filled order's lock entry, unlocking any leftover dust
    /// (price improvement and notional truncation leave a few quote units
    /// on fully filled buys).
    fn finish_lock_entry(&mut self, order: &Order) -> Result<()> {
        if let Some(dust) = self.locked_remaining.remove(&order.order_id) {
            if dust > 0 {
                let asset = self.lock_asset(order.side);
                self.balances
                    .unlock(order.user_id, asset, dust)
                    .map_err(|e| self.maybe_halt(e))?;
                self.record_balance(order.user_id, asset);
            }
        }
        Ok(())
    }

    /// Unlock everything still reserved for a live order.
    fn release_lock(&mut self, order: &Order) -> Result<()> {
        if let Some(remaining) = self.locked_remaining.remove(&order.order_id) {
            if remaining > 0 {
                let asset = self.lock_asset(order.side);
                self.balances
                    .unlock(order.user_id, asset, remaining)
                    .map_err(|e| self.maybe_halt(e))?;
                self.record_balance(order.user_id, asset);
            }
        }
        Ok(())
    }

    fn lock_asset(&self, side: Side) -> AssetId {
        match side {
            Side::Buy => self.info.quote_asset_id,
            Side::Sell => self.info.base_asset_id,
        }
    }

    /// IOC / market residual: unlock the rest and close the order.
    fn cancel_residual(&mut self, order: &mut Order) -> Result<()> {
        self.release_lock(order)?;
        let cancelled = self
            .orders
            .mark_cancelled(order.order_id, order.user_id, now_ms())
            .map_err(|e| self.maybe_halt(e))?;
        order.status = cancelled.status;
        self.emit_order(&cancelled);
        Ok(())
    }

    fn persist_rejected(&mut self, mut order: Order, reason: &str, now: i64) -> Result<()> {
        order.status = OrderStatus::Rejected;
        order.reject_reason = Some(reason.to_string());
        order.closed_at_ms = Some(now);
        self.orders.insert(order.clone())?;
        self.emit_order(&order);
        Ok(())
    }

    // ============================================================
    // STOP TRIGGERS
    // ============================================================

    /// Activate armed stops whose trigger the last trade price crossed.
    /// Activations can trade and thereby trigger further stops, so loop
    /// until a pass arms nothing.
    fn trigger_stops(&mut self) -> Result<()> {
        loop {
            let Some(last) = self.last_trade_price else {
                return Ok(());
            };
            let Some(pos) = self.stops.iter().position(|s| match s.side {
                Side::Buy => last >= s.stop_price.unwrap_or(u64::MAX),
                Side::Sell => last <= s.stop_price.unwrap_or(0),
            }) else {
                return Ok(());
            };
            let mut stop = self.stops.remove(pos);
            tracing::debug!(
                symbol = %self.info.symbol,
                order_id = stop.order_id,
                last_price = last,
                "stop order triggered"
            );
            match stop.order_type {
                OrderType::Stop => {
                    let cap = Some(match stop.side {
                        Side::Buy => self.slip_up(stop.stop_price.unwrap_or(0)),
                        Side::Sell => self.slip_down(stop.stop_price.unwrap_or(0)),
                    });
                    self.execute_market(&mut stop, cap)?;
                }
                OrderType::StopLimit => self.execute_limit(&mut stop)?,
                _ => {
                    return Err(self.halt(format!(
                        "non-stop order {} in trigger table",
                        stop.order_id
                    )))
                }
            }
            self.publish_depth();
        }
    }

    // ============================================================
    // CANCEL
    // ============================================================

    pub fn cancel(&mut self, user: UserId, order_id: OrderId) -> Result<CancelAck> {
        self.check_halted()?;

        let existing = self.orders.get_any(order_id).ok_or(EngineError::NotFound)?;
        if existing.user_id != user {
            return Err(EngineError::NotCancellable);
        }
        if existing.is_terminal() {
            // Idempotent: acknowledge without touching anything
            return Ok(CancelAck {
                order: existing,
                already_terminal: true,
            });
        }

        if let Some(pos) = self.stops.iter().position(|s| s.order_id == order_id) {
            self.stops.remove(pos);
        } else if self.book.remove(order_id).is_none() {
            return Err(self.halt(format!(
                "open order {} missing from book on cancel",
                order_id
            )));
        }

        self.release_lock(&existing)?;
        let cancelled = self
            .orders
            .mark_cancelled(order_id, user, now_ms())
            .map_err(|e| self.maybe_halt(e))?;
        self.emit_order(&cancelled);
        self.publish_depth();

        Ok(CancelAck {
            order: cancelled,
            already_terminal: false,
        })
    }

    // ============================================================
    // QUERIES
    // ============================================================

    /// Aggregated book depth, top `limit` levels per side.
    pub fn depth(&self, limit: usize) -> DepthSnapshot {
        let (bids, asks) = self.book.aggregate_depth(limit);
        DepthSnapshot {
            symbol: self.info.symbol.clone(),
            bids,
            asks,
            timestamp_ms: now_ms(),
        }
    }

    /// Recovery snapshot for subscribers that missed events.
    pub fn resync(&self) -> BookSnapshot {
        BookSnapshot {
            symbol: self.info.symbol.clone(),
            best_bid: self.book.best_bid(),
            best_ask: self.book.best_ask(),
            open_orders: self.book.all_orders().into_iter().cloned().collect(),
            timestamp_ms: now_ms(),
        }
    }

    /// The book must never stay crossed between commands.
    pub fn book_is_crossed(&self) -> bool {
        self.book.is_crossed()
    }

    // ============================================================
    // FAILURE HANDLING
    // ============================================================

    fn check_halted(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(EngineError::invariant(reason.clone())),
            None => Ok(()),
        }
    }

    /// Record a fatal condition and refuse all further commands for this
    /// symbol. Requires manual intervention.
    fn halt(&mut self, reason: String) -> EngineError {
        tracing::error!(symbol = %self.info.symbol, "engine halted: {}", reason);
        self.halted = Some(reason.clone());
        self.fatal_flag.store(true, Ordering::SeqCst);
        EngineError::InvariantViolation(reason)
    }

    /// Escalate fatal errors into a halt, pass the rest through.
    fn maybe_halt(&mut self, e: EngineError) -> EngineError {
        if e.is_fatal() {
            self.halt(e.to_string())
        } else {
            e
        }
    }

    // ============================================================
    // EVENTS
    // ============================================================

    /// Every order state change is both published and mirrored.
    fn emit_order(&mut self, order: &Order) {
        self.effects.push(MirrorEffect::Order(order.clone()));
        self.publisher
            .publish(EventMessage::order_update(&self.info.symbol, order, now_ms()));
    }

    fn record_balance(&mut self, user: UserId, asset: AssetId) {
        self.effects.push(MirrorEffect::Balance { user, asset });
    }

    fn publish_depth(&self) {
        let (bids, asks) = self.book.aggregate_depth(self.cfg.depth_levels);
        self.publisher
            .publish(EventMessage::depth(&self.info.symbol, bids, asks, now_ms()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::SymbolRegistry;
    use std::time::Duration;

    const FEE_ACCOUNT: UserId = 0;
    const BTC: AssetId = 1;
    const USDT: AssetId = 2;
    const ONE_BTC: u64 = 100_000_000;

    fn usdt(amount: u64) -> u64 {
        amount * 1_000_000
    }

    struct Harness {
        engine: SymbolEngine,
        balances: Arc<BalanceStore>,
        orders: Arc<OrderStore>,
        trades: Arc<TradeStore>,
    }

    fn harness() -> Harness {
        let mut registry = SymbolRegistry::new();
        registry.add_asset(BTC, "BTC", 8).unwrap();
        registry.add_asset(USDT, "USDT", 6).unwrap();
        registry.add_symbol("BTCUSDT", 0, BTC, USDT).unwrap();
        let info = registry.symbol_info("BTCUSDT").unwrap().clone();

        let balances = Arc::new(BalanceStore::new(FEE_ACCOUNT));
        let orders = Arc::new(OrderStore::new());
        let trades = Arc::new(TradeStore::new());
        let publisher = Arc::new(EventPublisher::new(1024, Duration::from_secs(30)));
        let engine = SymbolEngine::new(
            info,
            EngineConfig::default(),
            balances.clone(),
            orders.clone(),
            trades.clone(),
            publisher,
            Arc::new(AtomicU64::new(1)),
            Arc::new(AtomicU64::new(1)),
            Arc::new(AtomicBool::new(false)),
        );
        Harness {
            engine,
            balances,
            orders,
            trades,
        }
    }

    fn limit(user: UserId, side: Side, price: u64, qty: u64) -> SubmitOrder {
        SubmitOrder {
            user_id: user,
            symbol: "BTCUSDT".to_string(),
            side,
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            stop_price: None,
            tif: TimeInForce::Gtc,
            client_order_id: None,
            display_qty: None,
        }
    }

    fn market(user: UserId, side: Side, qty: u64) -> SubmitOrder {
        SubmitOrder {
            user_id: user,
            symbol: "BTCUSDT".to_string(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            stop_price: None,
            tif: TimeInForce::Gtc,
            client_order_id: None,
            display_qty: None,
        }
    }

    #[test]
    fn test_resting_order_locks_funds() {
        let mut h = harness();
        h.balances.credit_deposit(1, USDT, usdt(1000)).unwrap();

        let order = h.engine.submit(limit(1, Side::Buy, usdt(100), ONE_BTC)).unwrap();
        assert_eq!(order.status, OrderStatus::Open);

        let bal = h.balances.get_balance(1, USDT).unwrap();
        assert_eq!(bal.free(), usdt(900));
        assert_eq!(bal.locked(), usdt(100));
    }

    #[test]
    fn test_validation_rejected_without_side_effects() {
        let mut h = harness();
        let mut cmd = limit(1, Side::Buy, usdt(100), ONE_BTC);
        cmd.qty = 0;
        assert!(matches!(
            h.engine.submit(cmd),
            Err(EngineError::Validation(_))
        ));

        let mut cmd = limit(1, Side::Buy, 0, ONE_BTC);
        cmd.price = Some(0);
        assert!(matches!(
            h.engine.submit(cmd),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_maker_price_and_fees() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, ONE_BTC).unwrap();
        h.balances.credit_deposit(2, USDT, usdt(30100)).unwrap();

        // Maker sells at 30000, taker bids 30100: trade at the maker's price
        h.engine.submit(limit(1, Side::Sell, usdt(30000), ONE_BTC)).unwrap();
        let taker = h.engine.submit(limit(2, Side::Buy, usdt(30100), ONE_BTC)).unwrap();
        assert_eq!(taker.status, OrderStatus::Filled);

        let trades = h.trades.by_symbol(0, 10);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, usdt(30000));
        assert_eq!(trades[0].taker_side, Side::Buy);
        assert!(!trades[0].is_buyer_maker());

        // Price improvement accrues to the taker: only 30000 spent,
        // the 100 locked above it unlocks on completion
        let buyer = h.balances.get_balance(2, USDT).unwrap();
        assert_eq!(buyer.free(), usdt(100));
        assert_eq!(buyer.locked(), 0);

        // Commission on the received asset at 0.1%
        assert_eq!(h.balances.get_balance(2, BTC).unwrap().free(), 99_900_000);
        assert_eq!(h.balances.get_balance(1, USDT).unwrap().free(), usdt(29970));
        assert_eq!(h.balances.get_balance(FEE_ACCOUNT, BTC).unwrap().free(), 100_000);
        assert_eq!(h.balances.get_balance(FEE_ACCOUNT, USDT).unwrap().free(), usdt(30));
    }

    #[test]
    fn test_market_buy_walks_book_and_rejects_remainder() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, 2 * ONE_BTC).unwrap();
        h.balances.credit_deposit(2, USDT, usdt(100_000)).unwrap();

        h.engine.submit(limit(1, Side::Sell, usdt(100), ONE_BTC)).unwrap();
        h.engine.submit(limit(1, Side::Sell, usdt(101), ONE_BTC)).unwrap();

        // Wants 3 BTC, book only offers 2 within the cap
        let order = h.engine.submit(market(2, Side::Buy, 3 * ONE_BTC)).unwrap();
        assert_eq!(order.filled_qty, 2 * ONE_BTC);
        assert_eq!(order.status, OrderStatus::Cancelled);
        // Market orders never rest
        assert!(h.engine.depth(10).bids.is_empty());
        // Everything locked for the walk is released again
        assert_eq!(h.balances.get_balance(2, USDT).unwrap().locked(), 0);
    }

    #[test]
    fn test_market_buy_empty_book_rejected() {
        let mut h = harness();
        h.balances.credit_deposit(2, USDT, usdt(1000)).unwrap();

        let err = h.engine.submit(market(2, Side::Buy, ONE_BTC)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // Persisted REJECTED with its reason, no balance touched
        let rejected = h.orders.get(1, 2).unwrap();
        assert_eq!(rejected.status, OrderStatus::Rejected);
        assert!(rejected.reject_reason.is_some());
        assert_eq!(h.balances.get_balance(2, USDT).unwrap().locked(), 0);
    }

    #[test]
    fn test_market_respects_slippage_cap() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, 2 * ONE_BTC).unwrap();
        h.balances.credit_deposit(2, USDT, usdt(100_000)).unwrap();

        // Best ask 100, next ask 110 = beyond the 5% cap
        h.engine.submit(limit(1, Side::Sell, usdt(100), ONE_BTC)).unwrap();
        h.engine.submit(limit(1, Side::Sell, usdt(110), ONE_BTC)).unwrap();

        let order = h.engine.submit(market(2, Side::Buy, 2 * ONE_BTC)).unwrap();
        // Only the first level fills; 110 > 100 * 1.05
        assert_eq!(order.filled_qty, ONE_BTC);
        assert_eq!(order.status, OrderStatus::Cancelled);
        // The 110 ask is untouched
        assert_eq!(h.engine.depth(10).asks, vec![(usdt(110), ONE_BTC)]);
    }

    #[test]
    fn test_fok_kills_on_shortfall() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, ONE_BTC).unwrap();
        h.balances.credit_deposit(2, USDT, usdt(1000)).unwrap();

        h.engine.submit(limit(1, Side::Sell, usdt(100), ONE_BTC)).unwrap();

        let mut cmd = limit(2, Side::Buy, usdt(100), 2 * ONE_BTC);
        cmd.tif = TimeInForce::Fok;
        let order = h.engine.submit(cmd).unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.filled_qty, 0);

        // No trade happened, the resting ask is untouched, funds released
        assert!(h.trades.is_empty());
        assert_eq!(h.engine.depth(10).asks, vec![(usdt(100), ONE_BTC)]);
        assert_eq!(h.balances.get_balance(2, USDT).unwrap().locked(), 0);
    }

    #[test]
    fn test_fok_fills_fully_when_liquidity_exists() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, 2 * ONE_BTC).unwrap();
        h.balances.credit_deposit(2, USDT, usdt(1000)).unwrap();

        h.engine.submit(limit(1, Side::Sell, usdt(100), ONE_BTC)).unwrap();
        h.engine.submit(limit(1, Side::Sell, usdt(100), ONE_BTC)).unwrap();

        let mut cmd = limit(2, Side::Buy, usdt(100), 2 * ONE_BTC);
        cmd.tif = TimeInForce::Fok;
        let order = h.engine.submit(cmd).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(h.trades.len(), 2);
    }

    #[test]
    fn test_stop_order_arms_and_triggers() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, 3 * ONE_BTC).unwrap();
        h.balances.credit_deposit(2, USDT, usdt(100_000)).unwrap();
        h.balances.credit_deposit(3, USDT, usdt(100_000)).unwrap();

        // User 3 arms a stop-limit buy triggered at 100
        let mut stop = limit(3, Side::Buy, usdt(101), ONE_BTC);
        stop.order_type = OrderType::StopLimit;
        stop.stop_price = Some(usdt(100));
        let armed = h.engine.submit(stop).unwrap();
        assert_eq!(armed.status, OrderStatus::Open);
        // Armed stops are not book liquidity
        assert!(h.engine.depth(10).bids.is_empty());

        // A trade at 100 triggers the stop, which lifts the second ask
        h.engine.submit(limit(1, Side::Sell, usdt(100), ONE_BTC)).unwrap();
        h.engine.submit(limit(1, Side::Sell, usdt(101), ONE_BTC)).unwrap();
        h.engine.submit(limit(2, Side::Buy, usdt(100), ONE_BTC)).unwrap();

        let trades = h.trades.by_symbol(0, 10);
        assert_eq!(trades.len(), 2);
        let stop_order = h.orders.get(armed.order_id, 3).unwrap();
        assert_eq!(stop_order.status, OrderStatus::Filled);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut h = harness();
        h.balances.credit_deposit(1, USDT, usdt(1000)).unwrap();

        let order = h.engine.submit(limit(1, Side::Buy, usdt(100), ONE_BTC)).unwrap();
        let first = h.engine.cancel(1, order.order_id).unwrap();
        assert!(!first.already_terminal);
        assert_eq!(first.order.status, OrderStatus::Cancelled);

        // Second cancel acknowledges without changing anything
        let second = h.engine.cancel(1, order.order_id).unwrap();
        assert!(second.already_terminal);
        assert_eq!(second.order.status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_cancel_foreign_and_missing() {
        let mut h = harness();
        h.balances.credit_deposit(1, USDT, usdt(1000)).unwrap();
        let order = h.engine.submit(limit(1, Side::Buy, usdt(100), ONE_BTC)).unwrap();

        assert_eq!(h.engine.cancel(2, order.order_id), Err(EngineError::NotCancellable));
        assert_eq!(h.engine.cancel(1, 9999), Err(EngineError::NotFound));
    }

    #[test]
    fn test_settlement_failure_halts_symbol() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, ONE_BTC).unwrap();
        h.balances.credit_deposit(2, USDT, usdt(30000)).unwrap();

        h.engine.submit(limit(1, Side::Sell, usdt(30000), ONE_BTC)).unwrap();
        // Corrupt the seller's lock out-of-band so settlement must fail
        h.balances.unlock(1, BTC, ONE_BTC).unwrap();

        let err = h.engine.submit(limit(2, Side::Buy, usdt(30000), ONE_BTC)).unwrap_err();
        assert!(err.is_fatal());
        assert!(h.engine.is_halted());

        // The resting ask is still in the book, no trade was recorded
        assert!(h.trades.is_empty());
        assert_eq!(h.engine.resync().best_ask, Some(usdt(30000)));

        // Every further command is refused until manual intervention
        assert!(h.engine.submit(limit(2, Side::Buy, usdt(1), 1)).unwrap_err().is_fatal());
        assert!(h.engine.cancel(1, 1).unwrap_err().is_fatal());
    }

    #[test]
    fn test_duplicate_client_order_id_releases_lock() {
        let mut h = harness();
        h.balances.credit_deposit(1, USDT, usdt(1000)).unwrap();

        let mut cmd = limit(1, Side::Buy, usdt(100), ONE_BTC);
        cmd.client_order_id = Some("cid-1".to_string());
        h.engine.submit(cmd.clone()).unwrap();

        let err = h.engine.submit(cmd).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        // The duplicate's lock was released; only the first order's remains
        assert_eq!(h.balances.get_balance(1, USDT).unwrap().locked(), usdt(100));
    }

    #[test]
    fn test_book_never_crossed_after_commands() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, 10 * ONE_BTC).unwrap();
        h.balances.credit_deposit(2, USDT, usdt(100_000)).unwrap();

        h.engine.submit(limit(1, Side::Sell, usdt(101), ONE_BTC)).unwrap();
        h.engine.submit(limit(2, Side::Buy, usdt(99), ONE_BTC)).unwrap();
        h.engine.submit(limit(2, Side::Buy, usdt(102), ONE_BTC)).unwrap();
        h.engine.submit(limit(1, Side::Sell, usdt(98), 2 * ONE_BTC)).unwrap();

        assert!(!h.engine.book_is_crossed());
    }

    #[test]
    fn test_resync_snapshot() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, ONE_BTC).unwrap();
        h.balances.credit_deposit(2, USDT, usdt(1000)).unwrap();

        h.engine.submit(limit(1, Side::Sell, usdt(101), ONE_BTC)).unwrap();
        h.engine.submit(limit(2, Side::Buy, usdt(99), ONE_BTC)).unwrap();

        let snapshot = h.engine.resync();
        assert_eq!(snapshot.symbol, "BTCUSDT");
        assert_eq!(snapshot.best_bid, Some(usdt(99)));
        assert_eq!(snapshot.best_ask, Some(usdt(101)));
        assert_eq!(snapshot.open_orders.len(), 2);
    }

    #[test]
    fn test_hydration_restores_book() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, ONE_BTC).unwrap();
        h.balances.credit_deposit(2, USDT, usdt(1000)).unwrap();
        h.engine.submit(limit(1, Side::Sell, usdt(101), ONE_BTC)).unwrap();
        h.engine.submit(limit(2, Side::Buy, usdt(99), ONE_BTC)).unwrap();

        // A fresh engine over the same stores rebuilds the same book
        let mut registry = SymbolRegistry::new();
        registry.add_asset(BTC, "BTC", 8).unwrap();
        registry.add_asset(USDT, "USDT", 6).unwrap();
        registry.add_symbol("BTCUSDT", 0, BTC, USDT).unwrap();
        let info = registry.symbol_info("BTCUSDT").unwrap().clone();
        let mut rebuilt = SymbolEngine::new(
            info,
            EngineConfig::default(),
            h.balances.clone(),
            h.orders.clone(),
            h.trades.clone(),
            Arc::new(EventPublisher::new(1024, Duration::from_secs(30))),
            Arc::new(AtomicU64::new(h.orders.max_order_id() + 1)),
            Arc::new(AtomicU64::new(1)),
            Arc::new(AtomicBool::new(false)),
        );
        rebuilt.hydrate();

        let snapshot = rebuilt.resync();
        assert_eq!(snapshot.best_bid, Some(usdt(99)));
        assert_eq!(snapshot.best_ask, Some(usdt(101)));

        // And the hydrated book still matches correctly
        h.balances.credit_deposit(3, USDT, usdt(1000)).unwrap();
        let taker = rebuilt.submit(limit(3, Side::Buy, usdt(101), ONE_BTC)).unwrap();
        assert_eq!(taker.status, OrderStatus::Filled);
    }

    #[test]
    fn test_hydration_restores_armed_stops() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, ONE_BTC).unwrap();
        h.balances.credit_deposit(2, USDT, usdt(1000)).unwrap();

        // A pure STOP sell carries no book price at all
        let mut stop_sell = limit(1, Side::Sell, 0, ONE_BTC);
        stop_sell.order_type = OrderType::Stop;
        stop_sell.price = None;
        stop_sell.stop_price = Some(usdt(90));
        let armed_sell = h.engine.submit(stop_sell).unwrap();

        // A STOP buy locks its slippage-capped stop notional
        let mut stop_buy = limit(2, Side::Buy, 0, ONE_BTC);
        stop_buy.order_type = OrderType::Stop;
        stop_buy.price = None;
        stop_buy.stop_price = Some(usdt(100));
        let armed_buy = h.engine.submit(stop_buy).unwrap();
        let buy_locked = h.balances.get_balance(2, USDT).unwrap().locked();
        assert_eq!(buy_locked, usdt(105)); // 100 * 1.05

        // Cold restart over the same stores
        let mut registry = SymbolRegistry::new();
        registry.add_asset(BTC, "BTC", 8).unwrap();
        registry.add_asset(USDT, "USDT", 6).unwrap();
        registry.add_symbol("BTCUSDT", 0, BTC, USDT).unwrap();
        let info = registry.symbol_info("BTCUSDT").unwrap().clone();
        let mut rebuilt = SymbolEngine::new(
            info,
            EngineConfig::default(),
            h.balances.clone(),
            h.orders.clone(),
            h.trades.clone(),
            Arc::new(EventPublisher::new(1024, Duration::from_secs(30))),
            Arc::new(AtomicU64::new(h.orders.max_order_id() + 1)),
            Arc::new(AtomicU64::new(1)),
            Arc::new(AtomicBool::new(false)),
        );
        rebuilt.hydrate();

        // Armed stops are NOT book liquidity: no phantom ask at price 0
        let snapshot = rebuilt.resync();
        assert_eq!(snapshot.best_ask, None);
        assert_eq!(snapshot.best_bid, None);
        assert!(snapshot.open_orders.is_empty());

        // A buy probing the book rests instead of filling for free
        h.balances.credit_deposit(3, USDT, usdt(1000)).unwrap();
        let probe = rebuilt.submit(limit(3, Side::Buy, usdt(100), ONE_BTC)).unwrap();
        assert_eq!(probe.status, OrderStatus::Open);
        assert!(h.trades.is_empty());

        // Cancelling the hydrated stops releases exactly the original locks
        rebuilt.cancel(2, armed_buy.order_id).unwrap();
        let buyer = h.balances.get_balance(2, USDT).unwrap();
        assert_eq!(buyer.free(), usdt(1000));
        assert_eq!(buyer.locked(), 0);

        rebuilt.cancel(1, armed_sell.order_id).unwrap();
        let seller = h.balances.get_balance(1, BTC).unwrap();
        assert_eq!(seller.free(), ONE_BTC);
        assert_eq!(seller.locked(), 0);
    }

    #[test]
    fn test_hydrated_stop_triggers_after_restart() {
        let mut h = harness();
        h.balances.credit_deposit(1, BTC, ONE_BTC).unwrap();

        // Arm a STOP sell triggered at 90
        let mut stop_sell = limit(1, Side::Sell, 0, ONE_BTC);
        stop_sell.order_type = OrderType::Stop;
        stop_sell.price = None;
        stop_sell.stop_price = Some(usdt(90));
        let armed = h.engine.submit(stop_sell).unwrap();

        // Restart
        let mut registry = SymbolRegistry::new();
        registry.add_asset(BTC, "BTC", 8).unwrap();
        registry.add_asset(USDT, "USDT", 6).unwrap();
        registry.add_symbol("BTCUSDT", 0, BTC, USDT).unwrap();
        let info = registry.symbol_info("BTCUSDT").unwrap().clone();
        let mut rebuilt = SymbolEngine::new(
            info,
            EngineConfig::default(),
            h.balances.clone(),
            h.orders.clone(),
            h.trades.clone(),
            Arc::new(EventPublisher::new(1024, Duration::from_secs(30))),
            Arc::new(AtomicU64::new(h.orders.max_order_id() + 1)),
            Arc::new(AtomicU64::new(1)),
            Arc::new(AtomicBool::new(false)),
        );
        rebuilt.hydrate();

        // A trade at 88 (<= 90) fires the hydrated stop, which sells into
        // the remaining bid at 87 (within the 5% cap below the stop)
        h.balances.credit_deposit(2, USDT, usdt(1000)).unwrap();
        h.balances.credit_deposit(3, BTC, ONE_BTC).unwrap();
        rebuilt.submit(limit(2, Side::Buy, usdt(88), ONE_BTC)).unwrap();
        rebuilt.submit(limit(2, Side::Buy, usdt(87), ONE_BTC)).unwrap();
        rebuilt.submit(limit(3, Side::Sell, usdt(88), ONE_BTC)).unwrap();

        let trades = h.trades.by_symbol(0, 10);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].price, usdt(87)); // most recent: the stop's fill
        assert_eq!(trades[0].seller_user_id, 1);
        let stop_now = h.orders.get(armed.order_id, 1).unwrap();
        assert_eq!(stop_now.status, OrderStatus::Filled);
    }
}
