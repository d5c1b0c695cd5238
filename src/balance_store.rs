//! Balance store - the authoritative per-(user, asset) ledger
//!
//! The store is shared by all symbol workers. Every mutating operation
//! acquires the touched rows' locks in lexicographic `(user, asset)` order,
//! which precludes deadlock between concurrent settlements.
//!
//! This is the ONLY balance mutator in the system: matching settles through
//! [`BalanceStore::settle`], order acceptance locks through
//! [`BalanceStore::lock`], and external funds move only through
//! [`BalanceStore::credit_deposit`] / [`BalanceStore::debit_withdrawal`].

use crate::balance::Balance;
use crate::core_types::{AssetId, UserId};
use crate::error::{EngineError, Result};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

type RowKey = (UserId, AssetId);

/// Arguments for an atomic trade settlement.
///
/// `quote_amount` is the exact scaled notional computed once by the engine
/// (`price * qty / 10^base_scale`); lock, spend and credit all use this one
/// number so rounding can never diverge between them.
#[derive(Debug, Clone, Copy)]
pub struct Settlement {
    pub buyer: UserId,
    pub seller: UserId,
    pub base_asset: AssetId,
    pub quote_asset: AssetId,
    /// Base quantity traded
    pub base_qty: u64,
    /// Quote notional traded
    pub quote_amount: u64,
    /// Buyer's commission, in base units (taken from the received base)
    pub buyer_fee: u64,
    /// Seller's commission, in quote units (taken from the received quote)
    pub seller_fee: u64,
}

/// Shared free/locked ledger with row-level ordered locking.
pub struct BalanceStore {
    rows: RwLock<FxHashMap<RowKey, Arc<Mutex<Balance>>>>,
    /// Commissions are credited here
    fee_account: UserId,
}

/// The guard set of one multi-row operation, keyed by the same sorted key
/// order the locks were acquired in. Lookups of a row the operation never
/// locked surface as `InvariantViolation` instead of panicking.
struct LockedRows<'a> {
    keys: Vec<RowKey>,
    guards: Vec<MutexGuard<'a, Balance>>,
}

impl<'a> LockedRows<'a> {
    fn new(handles: &'a [(RowKey, Arc<Mutex<Balance>>)]) -> Result<Self> {
        let mut keys = Vec::with_capacity(handles.len());
        let mut guards = Vec::with_capacity(handles.len());
        for (key, row) in handles {
            keys.push(*key);
            guards.push(BalanceStore::guard(row)?);
        }
        Ok(Self { keys, guards })
    }

    fn index(&self, user: UserId, asset: AssetId) -> Result<usize> {
        self.keys.binary_search(&(user, asset)).map_err(|_| {
            EngineError::invariant(format!(
                "settle touched unlocked row user={} asset={}",
                user, asset
            ))
        })
    }

    fn get(&self, user: UserId, asset: AssetId) -> Result<&Balance> {
        let idx = self.index(user, asset)?;
        Ok(&self.guards[idx])
    }

    fn get_mut(&mut self, user: UserId, asset: AssetId) -> Result<&mut Balance> {
        let idx = self.index(user, asset)?;
        Ok(&mut self.guards[idx])
    }
}

fn settle_err(e: &'static str) -> EngineError {
    EngineError::invariant(format!("settle failed: {}", e))
}

impl BalanceStore {
    pub fn new(fee_account: UserId) -> Self {
        Self {
            rows: RwLock::new(FxHashMap::default()),
            fee_account,
        }
    }

    pub fn fee_account(&self) -> UserId {
        self.fee_account
    }

    /// Read a balance row, if it exists.
    pub fn get_balance(&self, user: UserId, asset: AssetId) -> Option<Balance> {
        let rows = self.rows.read().ok()?;
        let row = rows.get(&(user, asset))?.clone();
        drop(rows);
        let guard = row.lock().ok()?;
        Some(*guard)
    }

    /// All of a user's balance rows, ordered by asset id.
    pub fn balances_for_user(&self, user: UserId) -> Vec<(AssetId, Balance)> {
        let handles: Vec<(AssetId, Arc<Mutex<Balance>>)> = match self.rows.read() {
            Ok(rows) => rows
                .iter()
                .filter(|((u, _), _)| *u == user)
                .map(|((_, a), row)| (*a, row.clone()))
                .collect(),
            Err(_) => return Vec::new(),
        };
        let mut out: Vec<(AssetId, Balance)> = handles
            .into_iter()
            .filter_map(|(asset, row)| row.lock().ok().map(|b| (asset, *b)))
            .collect();
        out.sort_by_key(|(asset, _)| *asset);
        out
    }

    /// Total `free + locked` across all users for one asset.
    /// Used by invariant checks: matched trades conserve this (commissions
    /// move to the fee account, which is a user like any other).
    pub fn total_supply(&self, asset: AssetId) -> u128 {
        let handles: Vec<Arc<Mutex<Balance>>> = match self.rows.read() {
            Ok(rows) => rows
                .iter()
                .filter(|((_, a), _)| *a == asset)
                .map(|(_, row)| row.clone())
                .collect(),
            Err(_) => return 0,
        };
        handles
            .iter()
            .filter_map(|row| row.lock().ok())
            .map(|b| b.free() as u128 + b.locked() as u128)
            .sum()
    }

    /// Atomically move `amount` from free to locked.
    ///
    /// Fails with `InsufficientFunds` when `free < amount`; the row is
    /// untouched in that case.
    pub fn lock(&self, user: UserId, asset: AssetId, amount: u64) -> Result<()> {
        let row = self.row(user, asset)?;
        let mut guard = Self::guard(&row)?;
        guard
            .lock(amount)
            .map_err(|_| EngineError::InsufficientFunds)
    }

    /// Atomically move `amount` from locked back to free.
    ///
    /// Requires `locked >= amount`; violating this is a logic bug upstream
    /// and fails with `InvariantViolation` rather than silently clamping.
    pub fn unlock(&self, user: UserId, asset: AssetId, amount: u64) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let row = self.existing_row(user, asset).ok_or_else(|| {
            EngineError::invariant(format!("unlock of missing row user={} asset={}", user, asset))
        })?;
        let mut guard = Self::guard(&row)?;
        guard.unlock(amount).map_err(|e| {
            EngineError::invariant(format!(
                "unlock user={} asset={} amount={} locked={}: {}",
                user,
                asset,
                amount,
                guard.locked(),
                e
            ))
        })
    }

    /// Settle one trade in a single atomic step:
    ///
    /// - seller: `locked(base) -= qty`
    /// - buyer: `free(base) += qty - buyer_fee`, `locked(quote) -= quote_amount`
    /// - seller: `free(quote) += quote_amount - seller_fee`
    /// - fee account: `free(base) += buyer_fee`, `free(quote) += seller_fee`
    ///
    /// All six rows are locked in lexicographic order; every precondition is
    /// checked before the first mutation, so the step is all-or-nothing.
    /// Fails with `InvariantViolation` if any locked balance would go
    /// negative or a fee exceeds the amount it is taken from.
    pub fn settle(&self, s: &Settlement) -> Result<()> {
        if s.buyer_fee > s.base_qty {
            return Err(EngineError::invariant(format!(
                "buyer fee {} exceeds base qty {}",
                s.buyer_fee, s.base_qty
            )));
        }
        if s.seller_fee > s.quote_amount {
            return Err(EngineError::invariant(format!(
                "seller fee {} exceeds quote amount {}",
                s.seller_fee, s.quote_amount
            )));
        }

        let mut keys = vec![
            (s.buyer, s.base_asset),
            (s.buyer, s.quote_asset),
            (s.seller, s.base_asset),
            (s.seller, s.quote_asset),
            (self.fee_account, s.base_asset),
            (self.fee_account, s.quote_asset),
        ];
        keys.sort_unstable();
        keys.dedup();

        // Ensure every row exists, then acquire guards in sorted key order
        let handles: Vec<(RowKey, Arc<Mutex<Balance>>)> = keys
            .iter()
            .map(|&(u, a)| self.row(u, a).map(|r| ((u, a), r)))
            .collect::<Result<_>>()?;
        let mut rows = LockedRows::new(&handles)?;

        // Validate all preconditions before mutating anything
        let seller_base = rows.get(s.seller, s.base_asset)?;
        if seller_base.locked() < s.base_qty {
            return Err(EngineError::invariant(format!(
                "seller {} locked base {} < qty {}",
                s.seller,
                seller_base.locked(),
                s.base_qty
            )));
        }
        let buyer_quote = rows.get(s.buyer, s.quote_asset)?;
        if buyer_quote.locked() < s.quote_amount {
            return Err(EngineError::invariant(format!(
                "buyer {} locked quote {} < notional {}",
                s.buyer,
                buyer_quote.locked(),
                s.quote_amount
            )));
        }

        rows.get_mut(s.seller, s.base_asset)?
            .spend_locked(s.base_qty)
            .map_err(settle_err)?;
        rows.get_mut(s.buyer, s.base_asset)?
            .deposit(s.base_qty - s.buyer_fee)
            .map_err(settle_err)?;
        rows.get_mut(s.buyer, s.quote_asset)?
            .spend_locked(s.quote_amount)
            .map_err(settle_err)?;
        rows.get_mut(s.seller, s.quote_asset)?
            .deposit(s.quote_amount - s.seller_fee)
            .map_err(settle_err)?;
        rows.get_mut(self.fee_account, s.base_asset)?
            .deposit(s.buyer_fee)
            .map_err(settle_err)?;
        rows.get_mut(self.fee_account, s.quote_asset)?
            .deposit(s.seller_fee)
            .map_err(settle_err)?;
        Ok(())
    }

    /// Credit an external deposit to the free partition.
    pub fn credit_deposit(&self, user: UserId, asset: AssetId, amount: u64) -> Result<()> {
        let row = self.row(user, asset)?;
        let mut guard = Self::guard(&row)?;
        guard
            .deposit(amount)
            .map_err(|e| EngineError::invariant(format!("deposit overflow: {}", e)))
    }

    /// Debit an external withdrawal from the free partition.
    pub fn debit_withdrawal(&self, user: UserId, asset: AssetId, amount: u64) -> Result<()> {
        let row = self.existing_row(user, asset).ok_or(EngineError::InsufficientFunds)?;
        let mut guard = Self::guard(&row)?;
        guard
            .withdraw(amount)
            .map_err(|_| EngineError::InsufficientFunds)
    }

    /// Fetch or create a row handle.
    fn row(&self, user: UserId, asset: AssetId) -> Result<Arc<Mutex<Balance>>> {
        if let Some(row) = self.existing_row(user, asset) {
            return Ok(row);
        }
        let mut rows = self
            .rows
            .write()
            .map_err(|_| EngineError::invariant("balance registry poisoned"))?;
        Ok(rows
            .entry((user, asset))
            .or_insert_with(|| Arc::new(Mutex::new(Balance::default())))
            .clone())
    }

    fn existing_row(&self, user: UserId, asset: AssetId) -> Option<Arc<Mutex<Balance>>> {
        self.rows.read().ok()?.get(&(user, asset)).cloned()
    }

    /// A poisoned row means a thread panicked mid-mutation: that is an
    /// accounting invariant violation, not a recoverable condition.
    fn guard(row: &Arc<Mutex<Balance>>) -> Result<MutexGuard<'_, Balance>> {
        row.lock()
            .map_err(|_| EngineError::invariant("balance row poisoned"))
    }
}
