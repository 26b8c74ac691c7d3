//! Wallet and chain locking
//!
//! Chain state and wallet state live behind separate mutexes. Code that
//! needs both must go through [`WalletContext::write_session`] (or its
//! non-blocking variant), which always takes the chain lock first. Short
//! read-only wallet accesses may take the wallet lock alone.
//!
//! Poisoned locks are recovered: wallet state only changes through commit,
//! which either completes or leaves the state untouched.

use bitcoin::{Network, OutPoint};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use stealthpay_common::logging::{log_security, LogLevel};

use crate::coin_selector::{group_by_owner, CoinGroups};
use crate::wallet::{Coin, CoinFilter, CoinSource, KeyPool, KeyPoolError, ReservedKey, WalletLock};

/// Shared chain and wallet state
pub struct WalletContext<C, W> {
    chain: Mutex<C>,
    wallet: Mutex<W>,
    network: Network,
    staking_only: AtomicBool,
}

impl<C, W> WalletContext<C, W> {
    pub fn new(chain: C, wallet: W, network: Network) -> Self {
        Self {
            chain: Mutex::new(chain),
            wallet: Mutex::new(wallet),
            network,
            staking_only: AtomicBool::new(false),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Record whether the current unlock only allows staking
    pub fn set_unlocked_for_staking_only(&self, staking_only: bool) {
        self.staking_only.store(staking_only, Ordering::SeqCst);
    }

    pub fn unlocked_for_staking_only(&self) -> bool {
        self.staking_only.load(Ordering::SeqCst)
    }

    /// Lock chain state, then wallet state
    pub fn write_session(&self) -> WalletWriteSession<'_, C, W> {
        let chain = recover(self.chain.lock());
        let wallet = recover(self.wallet.lock());
        WalletWriteSession { chain, wallet }
    }

    /// Like [`write_session`](Self::write_session), but gives up instead of
    /// waiting when either lock is held
    pub fn try_write_session(&self) -> Option<WalletWriteSession<'_, C, W>> {
        let chain = try_recover(self.chain.try_lock())?;
        let wallet = try_recover(self.wallet.try_lock())?;
        Some(WalletWriteSession { chain, wallet })
    }

    /// Lock wallet state alone, for short reads
    pub fn lock_wallet(&self) -> MutexGuard<'_, W> {
        recover(self.wallet.lock())
    }

    /// Lock chain state alone
    pub fn lock_chain(&self) -> MutexGuard<'_, C> {
        recover(self.chain.lock())
    }
}

impl<C, W: CoinSource> WalletContext<C, W> {
    /// Spendable coins grouped by owning address, for coin control
    pub fn list_coins(&self) -> CoinGroups {
        let wallet = self.lock_wallet();
        let coins = wallet.list_spendable_coins(&CoinFilter::spendable(None));
        group_by_owner(&*wallet, coins, self.network)
    }

    /// Wallet coins at `outpoints`, in the order asked for
    ///
    /// Outpoints the wallet does not hold are skipped.
    pub fn outputs<'o>(&self, outpoints: impl IntoIterator<Item = &'o OutPoint>) -> Vec<Coin> {
        let held = self.lock_wallet().list_spendable_coins(&CoinFilter::all());
        outpoints
            .into_iter()
            .filter_map(|outpoint| held.iter().find(|coin| coin.outpoint == *outpoint).cloned())
            .collect()
    }
}

impl<C, W: WalletLock> WalletContext<C, W> {
    /// Make sure the wallet is fully unlocked for the caller's next step
    ///
    /// A wallet unlocked for staking only is locked first. If the wallet is
    /// then locked, `unlock` gets the chance to unlock it (typically by asking
    /// the user for the passphrase). The returned context tells whether the
    /// wallet ended up unlocked, and locks it again when dropped if this call
    /// was what unlocked it. A wallet that was unlocked for staking stays
    /// unlocked afterwards.
    ///
    /// Must not be dropped while the same thread holds the wallet lock.
    pub fn request_unlock<F>(&self, unlock: F) -> UnlockContext<'_, C, W>
    where
        F: FnOnce(&mut W),
    {
        let staking_only = self.unlocked_for_staking_only();
        let mut wallet = self.lock_wallet();

        let mut was_locked = wallet.is_locked();
        if !was_locked && staking_only {
            wallet.lock();
            was_locked = wallet.is_locked();
        }
        if was_locked {
            log_security(LogLevel::Info, "Wallet unlock requested", None);
            unlock(&mut *wallet);
        }

        let valid = !wallet.is_locked();
        if was_locked && !valid {
            log_security(LogLevel::Warn, "Wallet unlock failed or was cancelled", None);
        }
        UnlockContext {
            context: self,
            valid,
            relock: was_locked && !staking_only,
        }
    }
}

/// The outcome of [`WalletContext::request_unlock`]
///
/// Relocks the wallet on drop when the request unlocked it.
pub struct UnlockContext<'a, C, W: WalletLock> {
    context: &'a WalletContext<C, W>,
    valid: bool,
    relock: bool,
}

impl<'a, C, W: WalletLock> UnlockContext<'a, C, W> {
    /// Whether the wallet is unlocked
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn will_relock(&self) -> bool {
        self.valid && self.relock
    }
}

impl<'a, C, W: WalletLock> Drop for UnlockContext<'a, C, W> {
    fn drop(&mut self) {
        if self.will_relock() {
            self.context.lock_wallet().lock();
            log_security(LogLevel::Debug, "Wallet locked again", None);
        }
    }
}

fn recover<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    result.unwrap_or_else(|poisoned| {
        log_security(LogLevel::Warn, "Recovering poisoned wallet lock", None);
        poisoned.into_inner()
    })
}

fn try_recover<T>(result: std::sync::TryLockResult<MutexGuard<'_, T>>) -> Option<MutexGuard<'_, T>> {
    match result {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

/// Both locks, held together
///
/// Field order matters: the wallet guard is declared first so it is released
/// before the chain guard.
pub struct WalletWriteSession<'a, C, W> {
    wallet: MutexGuard<'a, W>,
    chain: MutexGuard<'a, C>,
}

impl<'a, C, W> WalletWriteSession<'a, C, W> {
    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn wallet(&self) -> &W {
        &self.wallet
    }

    pub fn wallet_mut(&mut self) -> &mut W {
        &mut self.wallet
    }
}

/// A reserved change key that goes back to the pool unless kept
///
/// The guard borrows the wallet for its whole life, so every wallet access
/// while a change key is reserved goes through [`parts`](Self::parts) or
/// [`wallet_mut`](Self::wallet_mut).
pub struct ChangeKeyGuard<'a, W: KeyPool + ?Sized> {
    wallet: &'a mut W,
    key: ReservedKey,
    kept: bool,
}

impl<'a, W: KeyPool + ?Sized> ChangeKeyGuard<'a, W> {
    pub fn reserve(wallet: &'a mut W) -> Result<Self, KeyPoolError> {
        let key = wallet.reserve_change_key()?;
        Ok(Self {
            wallet,
            key,
            kept: false,
        })
    }

    pub fn key(&self) -> &ReservedKey {
        &self.key
    }

    pub fn wallet(&self) -> &W {
        self.wallet
    }

    pub fn wallet_mut(&mut self) -> &mut W {
        self.wallet
    }

    /// The wallet and the reserved key at the same time
    pub fn parts(&mut self) -> (&mut W, &ReservedKey) {
        (&mut *self.wallet, &self.key)
    }

    /// Remove the key from the pool for good
    pub fn keep(&mut self) {
        if !self.kept {
            self.wallet.keep_key(&self.key);
            self.kept = true;
        }
    }

    pub fn is_kept(&self) -> bool {
        self.kept
    }
}

impl<'a, W: KeyPool + ?Sized> Drop for ChangeKeyGuard<'a, W> {
    fn drop(&mut self) {
        if !self.kept {
            self.wallet.return_key(&self.key);
        }
    }
}
