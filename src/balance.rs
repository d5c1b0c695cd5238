//! Enforced balance type
//!
//! The single source of truth for a `(user, asset)` row. ALL balance
//! mutations MUST go through these methods.
//!
//! # Invariants (enforced by private fields):
//! - `free` and `locked` are individually non-negative (unsigned + checked ops)
//! - version increments on EVERY mutation
//! - no overflow/underflow (checked arithmetic)
//! - all state changes return Result

use serde::{Deserialize, Serialize};

/// Balance for a single `(user, asset)` row.
///
/// # Usage:
/// ```ignore
/// let mut balance = Balance::default();
/// balance.deposit(1000)?;        // free = 1000
/// balance.lock(500)?;            // free = 500, locked = 500
/// balance.spend_locked(100)?;    // locked = 400
/// balance.unlock(200)?;          // free = 700, locked = 200
/// ```
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Balance {
    free: u64,    // PRIVATE - only modified through deposit/withdraw/lock/unlock
    locked: u64,  // PRIVATE - only modified through lock/unlock/spend_locked
    version: u64, // PRIVATE - auto-incremented on every mutation
}

impl Balance {
    /// Spendable amount (read-only)
    #[inline(always)]
    pub const fn free(&self) -> u64 {
        self.free
    }

    /// Amount reserved by resting orders or pending withdrawals (read-only)
    #[inline(always)]
    pub const fn locked(&self) -> u64 {
        self.locked
    }

    /// Total balance (free + locked).
    /// Returns None on overflow (indicates data corruption).
    #[inline(always)]
    pub const fn total(&self) -> Option<u64> {
        self.free.checked_add(self.locked)
    }

    #[inline(always)]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Credit funds to the free partition.
    pub fn deposit(&mut self, amount: u64) -> Result<(), &'static str> {
        self.free = self.free.checked_add(amount).ok_or("deposit overflow")?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Debit funds from the free partition.
    ///
    /// # Errors
    /// - "insufficient funds" if free < amount
    pub fn withdraw(&mut self, amount: u64) -> Result<(), &'static str> {
        if self.free < amount {
            return Err("insufficient funds");
        }
        self.free = self.free.checked_sub(amount).ok_or("withdraw underflow")?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Move funds from free to locked.
    ///
    /// # Errors
    /// - "insufficient funds" if free < amount
    pub fn lock(&mut self, amount: u64) -> Result<(), &'static str> {
        if self.free < amount {
            return Err("insufficient funds");
        }
        self.free = self.free.checked_sub(amount).ok_or("lock free underflow")?;
        self.locked = self
            .locked
            .checked_add(amount)
            .ok_or("lock locked overflow")?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Move funds from locked back to free.
    ///
    /// # Errors
    /// - "insufficient locked funds" if locked < amount
    pub fn unlock(&mut self, amount: u64) -> Result<(), &'static str> {
        if self.locked < amount {
            return Err("insufficient locked funds");
        }
        self.locked = self
            .locked
            .checked_sub(amount)
            .ok_or("unlock locked underflow")?;
        self.free = self.free.checked_add(amount).ok_or("unlock free overflow")?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Spend locked funds (remove from locked without adding to free).
    /// Used for trade settlement.
    ///
    /// # Errors
    /// - "insufficient locked funds" if locked < amount
    pub fn spend_locked(&mut self, amount: u64) -> Result<(), &'static str> {
        if self.locked < amount {
            return Err("insufficient locked funds");
        }
        self.locked = self
            .locked
            .checked_sub(amount)
            .ok_or("spend locked underflow")?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deposit() {
        let mut bal = Balance::default();
        assert_eq!(bal.free(), 0);

        bal.deposit(100).unwrap();
        assert_eq!(bal.free(), 100);
        assert_eq!(bal.version(), 1);

        bal.deposit(50).unwrap();
        assert_eq!(bal.free(), 150);
        assert_eq!(bal.version(), 2);
    }

    #[test]
    fn test_deposit_overflow() {
        let mut bal = Balance::default();
        bal.deposit(u64::MAX).unwrap();
        assert!(bal.deposit(1).is_err());
    }

    #[test]
    fn test_withdraw_insufficient() {
        let mut bal = Balance::default();
        bal.deposit(50).unwrap();

        assert!(bal.withdraw(100).is_err());
        assert_eq!(bal.free(), 50); // Unchanged
    }

    #[test]
    fn test_lock_unlock() {
        let mut bal = Balance::default();
        bal.deposit(100).unwrap();

        bal.lock(60).unwrap();
        assert_eq!(bal.free(), 40);
        assert_eq!(bal.locked(), 60);

        bal.unlock(20).unwrap();
        assert_eq!(bal.free(), 60);
        assert_eq!(bal.locked(), 40);
    }

    #[test]
    fn test_lock_insufficient() {
        let mut bal = Balance::default();
        bal.deposit(10).unwrap();
        assert!(bal.lock(11).is_err());
        assert_eq!(bal.free(), 10);
        assert_eq!(bal.locked(), 0);
    }

    #[test]
    fn test_unlock_beyond_locked_fails() {
        let mut bal = Balance::default();
        bal.deposit(100).unwrap();
        bal.lock(30).unwrap();
        // Must fail loudly, never clamp
        assert!(bal.unlock(31).is_err());
        assert_eq!(bal.locked(), 30);
    }

    #[test]
    fn test_spend_locked() {
        let mut bal = Balance::default();
        bal.deposit(100).unwrap();
        bal.lock(60).unwrap();

        bal.spend_locked(30).unwrap();
        assert_eq!(bal.locked(), 30);
        assert_eq!(bal.free(), 40); // Unchanged

        assert!(bal.spend_locked(31).is_err());
    }

    #[test]
    fn test_total() {
        let mut bal = Balance::default();
        bal.deposit(100).unwrap();
        assert_eq!(bal.total(), Some(100));

        bal.lock(60).unwrap();
        assert_eq!(bal.total(), Some(100)); // Total unchanged

        bal.spend_locked(20).unwrap();
        assert_eq!(bal.total(), Some(80)); // Total decreased
    }

    #[test]
    fn test_version_increments() {
        let mut bal = Balance::default();
        bal.deposit(100).unwrap();
        bal.lock(50).unwrap();
        bal.unlock(20).unwrap();
        bal.withdraw(10).unwrap();
        bal.spend_locked(10).unwrap();
        assert_eq!(bal.version(), 5);
    }
}
