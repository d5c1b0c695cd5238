//! Engine service - symbol-partitioned worker orchestration
//!
//! Each symbol gets one worker task consuming a bounded command queue, so
//! all mutations for a symbol are serialised while distinct symbols run in
//! parallel. A full queue answers `Busy` immediately; submits carry a
//! deadline so a command that waited out its budget in the queue is
//! refused before it locks anything.

use crate::balance_store::BalanceStore;
use crate::core_types::{OrderId, UserId};
use crate::engine::engine::{CancelAck, EngineConfig, SubmitOrder, SymbolEngine};
use crate::engine::events::{BookSnapshot, DepthSnapshot};
use crate::error::{EngineError, Result};
use crate::models::{Order, Trade};
use crate::persistence::Mirror;
use crate::publisher::EventPublisher;
use crate::store::{OrderStore, TradeStore};
use crate::symbols::SymbolRegistry;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Book depth query bounds
const DEPTH_LIMIT_RANGE: std::ops::RangeInclusive<usize> = 5..=1000;
/// Trade history query bounds
const TRADES_LIMIT_RANGE: std::ops::RangeInclusive<usize> = 1..=1000;

/// Service tuning knobs.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Per-symbol command queue capacity; full queues answer `Busy`
    pub queue_capacity: usize,
    /// Per-command budget for submits, measured from enqueue
    pub submit_timeout: Duration,
    /// How long shutdown waits for workers to drain
    pub shutdown_grace: Duration,
    pub engine: EngineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            submit_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
            engine: EngineConfig::default(),
        }
    }
}

enum EngineCommand {
    Submit {
        cmd: SubmitOrder,
        deadline: Instant,
        respond: oneshot::Sender<Result<Order>>,
    },
    Cancel {
        user: UserId,
        order_id: OrderId,
        respond: oneshot::Sender<Result<CancelAck>>,
    },
    Depth {
        limit: usize,
        respond: oneshot::Sender<DepthSnapshot>,
    },
    Resync {
        respond: oneshot::Sender<BookSnapshot>,
    },
    Shutdown,
}

struct SymbolHandle {
    tx: mpsc::Sender<EngineCommand>,
    join: JoinHandle<()>,
}

/// The process-wide engine front: routes commands to symbol workers and
/// serves the query surface.
pub struct EngineService {
    registry: Arc<SymbolRegistry>,
    workers: FxHashMap<String, SymbolHandle>,
    balances: Arc<BalanceStore>,
    orders: Arc<OrderStore>,
    trades: Arc<TradeStore>,
    fatal_flag: Arc<AtomicBool>,
    cfg: ServiceConfig,
}

impl EngineService {
    /// Build one engine per registered symbol, hydrate every book from the
    /// order store, then start accepting commands. Hydration completes for
    /// all symbols before any worker runs, so no command can observe a
    /// half-rebuilt book.
    ///
    /// With a `mirror`, each worker awaits the relational writes for a
    /// command before dequeuing the next one.
    pub fn start(
        registry: Arc<SymbolRegistry>,
        balances: Arc<BalanceStore>,
        orders: Arc<OrderStore>,
        trades: Arc<TradeStore>,
        publisher: Arc<EventPublisher>,
        mirror: Option<Arc<Mirror>>,
        cfg: ServiceConfig,
    ) -> Self {
        let next_order_id = Arc::new(AtomicU64::new(orders.max_order_id() + 1));
        let next_trade_id = Arc::new(AtomicU64::new(1));
        let fatal_flag = Arc::new(AtomicBool::new(false));

        let mut engines = Vec::new();
        for info in registry.iter_symbols() {
            let mut engine = SymbolEngine::new(
                info.clone(),
                cfg.engine.clone(),
                balances.clone(),
                orders.clone(),
                trades.clone(),
                publisher.clone(),
                next_order_id.clone(),
                next_trade_id.clone(),
                fatal_flag.clone(),
            );
            engine.hydrate();
            engines.push(engine);
        }

        let mut workers = FxHashMap::default();
        for engine in engines {
            let symbol = engine.symbol().to_string();
            let (tx, rx) = mpsc::channel(cfg.queue_capacity);
            let join = tokio::spawn(run_worker(engine, rx, mirror.clone()));
            workers.insert(symbol, SymbolHandle { tx, join });
        }

        tracing::info!(symbols = workers.len(), "engine service started");
        Self {
            registry,
            workers,
            balances,
            orders,
            trades,
            fatal_flag,
            cfg,
        }
    }

    /// Shared flag raised when any symbol halts on an invariant violation.
    /// The binary uses it to exit with a non-zero status.
    pub fn fatal_flag(&self) -> Arc<AtomicBool> {
        self.fatal_flag.clone()
    }

    // ============================================================
    // COMMANDS
    // ============================================================

    /// Submit an order. Returns the order snapshot once the symbol worker
    /// has processed it; fills stream asynchronously over the publisher.
    pub async fn submit(&self, cmd: SubmitOrder) -> Result<Order> {
        let handle = self.workers.get(&cmd.symbol).ok_or(EngineError::NotFound)?;
        let (respond, rx) = oneshot::channel();
        let deadline = Instant::now() + self.cfg.submit_timeout;
        self.try_send(
            handle,
            EngineCommand::Submit {
                cmd,
                deadline,
                respond,
            },
        )?;
        // The worker re-checks the deadline before locking anything, so a
        // timed-out submit never leaves funds locked. A command that
        // completes in the race window right at the deadline is simply a
        // completed command whose caller gave up waiting.
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::invariant("symbol worker dropped the command")),
            Err(_) => Err(EngineError::TimedOut),
        }
    }

    /// Cancel an order. The command surface carries no symbol, so the
    /// order's symbol is resolved through the order store first.
    pub async fn cancel(&self, user: UserId, order_id: OrderId) -> Result<CancelAck> {
        let order = self.orders.get_any(order_id).ok_or(EngineError::NotFound)?;
        let symbol = self
            .registry
            .symbol_name(order.symbol_id)
            .ok_or(EngineError::NotFound)?;
        let handle = self.workers.get(symbol).ok_or(EngineError::NotFound)?;
        let (respond, rx) = oneshot::channel();
        self.try_send(
            handle,
            EngineCommand::Cancel {
                user,
                order_id,
                respond,
            },
        )?;
        rx.await
            .map_err(|_| EngineError::invariant("symbol worker dropped the command"))?
    }

    // ============================================================
    // QUERIES
    // ============================================================

    pub fn query_order(&self, user: UserId, order_id: OrderId) -> Option<Order> {
        self.orders.get(order_id, user)
    }

    /// Aggregated book depth with a server timestamp.
    pub async fn depth(&self, symbol: &str, limit: usize) -> Result<DepthSnapshot> {
        if !DEPTH_LIMIT_RANGE.contains(&limit) {
            return Err(EngineError::validation("depth limit out of range (5..=1000)"));
        }
        let handle = self.workers.get(symbol).ok_or(EngineError::NotFound)?;
        let (respond, rx) = oneshot::channel();
        self.try_send(handle, EngineCommand::Depth { limit, respond })?;
        rx.await
            .map_err(|_| EngineError::invariant("symbol worker dropped the command"))
    }

    /// Recovery snapshot (open orders + top-of-book) for subscribers that
    /// missed published events.
    pub async fn resync(&self, symbol: &str) -> Result<BookSnapshot> {
        let handle = self.workers.get(symbol).ok_or(EngineError::NotFound)?;
        let (respond, rx) = oneshot::channel();
        self.try_send(handle, EngineCommand::Resync { respond })?;
        rx.await
            .map_err(|_| EngineError::invariant("symbol worker dropped the command"))
    }

    pub fn user_trades(
        &self,
        user: UserId,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Trade>> {
        if !TRADES_LIMIT_RANGE.contains(&limit) {
            return Err(EngineError::validation("trade limit out of range (1..=1000)"));
        }
        let symbol_id = match symbol {
            Some(name) => Some(self.registry.symbol_id(name).ok_or(EngineError::NotFound)?),
            None => None,
        };
        Ok(self.trades.by_user(user, symbol_id, limit))
    }

    pub fn user_balances(&self, user: UserId) -> Vec<(String, crate::balance::Balance)> {
        self.balances
            .balances_for_user(user)
            .into_iter()
            .filter_map(|(asset_id, balance)| {
                self.registry
                    .asset(asset_id)
                    .map(|a| (a.name.clone(), balance))
            })
            .collect()
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    /// Graceful shutdown: signal every worker, let them drain their queues
    /// and publish remaining events within the grace period.
    pub async fn shutdown(self) {
        for (symbol, handle) in &self.workers {
            if handle.tx.try_send(EngineCommand::Shutdown).is_err() {
                tracing::warn!(symbol = %symbol, "shutdown signal dropped, queue full or worker gone");
            }
        }
        for (symbol, handle) in self.workers {
            match tokio::time::timeout(self.cfg.shutdown_grace, handle.join).await {
                Ok(_) => tracing::info!(symbol = %symbol, "symbol worker drained"),
                Err(_) => tracing::warn!(symbol = %symbol, "symbol worker exceeded drain grace period"),
            }
        }
    }

    fn try_send(&self, handle: &SymbolHandle, cmd: EngineCommand) -> Result<()> {
        handle.tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::Busy,
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::invariant("symbol worker stopped")
            }
        })
    }
}

/// Worker loop: commands for one symbol run strictly in enqueue order.
/// The relational mirror is awaited between commands, so persistence for
/// one command completes before the next is dequeued. On shutdown the
/// queue is closed and drained before the task exits.
async fn run_worker(
    mut engine: SymbolEngine,
    mut rx: mpsc::Receiver<EngineCommand>,
    mirror: Option<Arc<Mirror>>,
) {
    while let Some(cmd) = rx.recv().await {
        let stop = handle_command(&mut engine, cmd);
        flush_mirror(&mut engine, &mirror).await;
        if stop {
            break;
        }
    }
    // Drain whatever was enqueued before the shutdown signal
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        handle_command(&mut engine, cmd);
        flush_mirror(&mut engine, &mirror).await;
    }
    tracing::info!(symbol = %engine.symbol(), "symbol worker stopped");
}

/// Always drain the recorded effects (they must not pile up when no mirror
/// is configured); apply them when one is.
async fn flush_mirror(engine: &mut SymbolEngine, mirror: &Option<Arc<Mirror>>) {
    let effects = engine.drain_effects();
    if let Some(mirror) = mirror {
        mirror.apply_all(&effects).await;
    }
}

/// Returns true when the worker should stop.
fn handle_command(engine: &mut SymbolEngine, cmd: EngineCommand) -> bool {
    match cmd {
        EngineCommand::Submit {
            cmd,
            deadline,
            respond,
        } => {
            // Queue wait counts against the command budget: refuse late
            // commands before any balance is touched.
            let result = if Instant::now() >= deadline {
                Err(EngineError::TimedOut)
            } else {
                engine.submit(cmd)
            };
            let _ = respond.send(result);
        }
        EngineCommand::Cancel {
            user,
            order_id,
            respond,
        } => {
            let _ = respond.send(engine.cancel(user, order_id));
        }
        EngineCommand::Depth { limit, respond } => {
            let _ = respond.send(engine.depth(limit));
        }
        EngineCommand::Resync { respond } => {
            let _ = respond.send(engine.resync());
        }
        EngineCommand::Shutdown => return true,
    }
    false
}
