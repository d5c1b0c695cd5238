//! Funding - external deposits and withdrawals
//!
//! Completed transactions are the only legal way to change a user's total
//! free + locked outside of matching. Every movement produces an immutable
//! `Transaction` record.

use crate::balance_store::BalanceStore;
use crate::core_types::{AssetId, TxnId, UserId};
use crate::error::{EngineError, Result};
use crate::models::{Transaction, TxnKind, TxnStatus};
use crate::persistence::{Mirror, MirrorEffect};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub struct FundingService {
    balances: Arc<BalanceStore>,
    transactions: RwLock<Vec<Transaction>>,
    next_txn_id: AtomicU64,
    mirror: Option<Arc<Mirror>>,
}

impl FundingService {
    pub fn new(balances: Arc<BalanceStore>, mirror: Option<Arc<Mirror>>) -> Self {
        Self {
            balances,
            transactions: RwLock::new(Vec::new()),
            next_txn_id: AtomicU64::new(1),
            mirror,
        }
    }

    /// Credit a deposit to the user's free balance.
    pub async fn deposit(&self, user: UserId, asset: AssetId, amount: u64) -> Result<Transaction> {
        if amount == 0 {
            return Err(EngineError::validation("deposit amount must be > 0"));
        }
        self.balances.credit_deposit(user, asset, amount)?;
        let txn = self.record(user, asset, TxnKind::Deposit, amount, None, TxnStatus::Completed)?;
        self.mirror_movement(&txn).await;
        tracing::info!(user, asset, amount, txn_id = txn.txn_id, "deposit completed");
        Ok(txn)
    }

    /// Debit a withdrawal from the user's free balance.
    ///
    /// An insufficient balance records a Failed transaction and surfaces
    /// the error, so the attempt is auditable.
    pub async fn withdraw(
        &self,
        user: UserId,
        asset: AssetId,
        amount: u64,
        address: &str,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(EngineError::validation("withdrawal amount must be > 0"));
        }
        if address.is_empty() {
            return Err(EngineError::validation("withdrawal address required"));
        }
        match self.balances.debit_withdrawal(user, asset, amount) {
            Ok(()) => {
                let txn = self.record(
                    user,
                    asset,
                    TxnKind::Withdrawal,
                    amount,
                    Some(address.to_string()),
                    TxnStatus::Completed,
                )?;
                self.mirror_movement(&txn).await;
                tracing::info!(user, asset, amount, txn_id = txn.txn_id, "withdrawal completed");
                Ok(txn)
            }
            Err(EngineError::InsufficientFunds) => {
                let txn = self.record(
                    user,
                    asset,
                    TxnKind::Withdrawal,
                    amount,
                    Some(address.to_string()),
                    TxnStatus::Failed,
                )?;
                self.mirror_movement(&txn).await;
                Err(EngineError::InsufficientFunds)
            }
            Err(e) => Err(e),
        }
    }

    /// Mirror the transaction record and the touched balance row.
    async fn mirror_movement(&self, txn: &Transaction) {
        if let Some(mirror) = &self.mirror {
            mirror.apply(&MirrorEffect::Transaction(txn.clone())).await;
            mirror
                .apply(&MirrorEffect::Balance {
                    user: txn.user_id,
                    asset: txn.asset_id,
                })
                .await;
        }
    }

    /// A user's transaction history, most recent first.
    pub fn by_user(&self, user: UserId, limit: usize) -> Vec<Transaction> {
        let transactions = match self.transactions.read() {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get(&self, txn_id: TxnId, user: UserId) -> Option<Transaction> {
        let transactions = self.transactions.read().ok()?;
        transactions
            .iter()
            .find(|t| t.txn_id == txn_id && t.user_id == user)
            .cloned()
    }

    fn record(
        &self,
        user: UserId,
        asset: AssetId,
        kind: TxnKind,
        amount: u64,
        address: Option<String>,
        status: TxnStatus,
    ) -> Result<Transaction> {
        let txn = Transaction {
            txn_id: self.next_txn_id.fetch_add(1, Ordering::Relaxed),
            user_id: user,
            asset_id: asset,
            kind,
            amount,
            address,
            status,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        let mut transactions = self
            .transactions
            .write()
            .map_err(|_| EngineError::invariant("transaction log poisoned"))?;
        transactions.push(txn.clone());
        Ok(txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDT: AssetId = 2;

    fn service() -> FundingService {
        FundingService::new(Arc::new(BalanceStore::new(0)), None)
    }

    #[tokio::test]
    async fn test_deposit_credits_free() {
        let funding = service();
        let txn = funding.deposit(1, USDT, 1000).await.unwrap();
        assert_eq!(txn.status, TxnStatus::Completed);
        assert_eq!(txn.kind, TxnKind::Deposit);
        assert_eq!(funding.balances.get_balance(1, USDT).unwrap().free(), 1000);
    }

    #[tokio::test]
    async fn test_withdraw_debits_free() {
        let funding = service();
        funding.deposit(1, USDT, 1000).await.unwrap();
        let txn = funding.withdraw(1, USDT, 400, "addr-1").await.unwrap();
        assert_eq!(txn.status, TxnStatus::Completed);
        assert_eq!(txn.address.as_deref(), Some("addr-1"));
        assert_eq!(funding.balances.get_balance(1, USDT).unwrap().free(), 600);
    }

    #[tokio::test]
    async fn test_withdraw_insufficient_records_failed() {
        let funding = service();
        funding.deposit(1, USDT, 100).await.unwrap();
        let err = funding.withdraw(1, USDT, 200, "addr-1").await.unwrap_err();
        assert_eq!(err, EngineError::InsufficientFunds);

        let history = funding.by_user(1, 10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, TxnStatus::Failed);
        // Balance untouched by the failed attempt
        assert_eq!(funding.balances.get_balance(1, USDT).unwrap().free(), 100);
    }

    #[tokio::test]
    async fn test_validation() {
        let funding = service();
        assert!(funding.deposit(1, USDT, 0).await.is_err());
        assert!(funding.withdraw(1, USDT, 0, "addr").await.is_err());
        assert!(funding.withdraw(1, USDT, 10, "").await.is_err());
    }

    #[tokio::test]
    async fn test_get_scoped_to_user() {
        let funding = service();
        let txn = funding.deposit(1, USDT, 100).await.unwrap();
        assert!(funding.get(txn.txn_id, 1).is_some());
        assert!(funding.get(txn.txn_id, 2).is_none());
    }
}
