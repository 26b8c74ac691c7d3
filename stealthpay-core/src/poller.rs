//! Periodic balance refresh
//!
//! The poller never waits for the wallet: if a send (or anything else) holds
//! chain or wallet state, the poll is skipped and retried next period.
//! Balances are read again when a new block arrives or when a transaction
//! changed, whichever comes first.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde_json::json;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use stealthpay_common::events::{WalletEvent, WalletEventBus};
use stealthpay_common::logging::{log_core, LogLevel};
use stealthpay_common::types::BalanceSnapshot;

use crate::session::WalletContext;
use crate::wallet::{BalanceSource, ChainView};

/// What a single poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Chain or wallet state was busy
    Skipped,
    /// Nothing new since the last poll
    Unchanged,
    /// Balances changed and were published
    BalanceChanged(BalanceSnapshot),
}

/// Keeps cached balances in sync with the wallet
pub struct BalancePoller<C, W> {
    context: Arc<WalletContext<C, W>>,
    events: WalletEventBus,
    transaction_changes: Receiver<WalletEvent>,
    cached: BalanceSnapshot,
    last_height: Option<u32>,
    transaction_count: usize,
    refresh_pending: bool,
}

impl<C, W> BalancePoller<C, W>
where
    C: ChainView,
    W: BalanceSource,
{
    /// Create a poller publishing on `events`
    ///
    /// Transaction changes published on the same bus make the next poll
    /// refresh without waiting for a new block.
    pub fn new(context: Arc<WalletContext<C, W>>, events: WalletEventBus) -> Self {
        let transaction_changes = events.subscribe("transaction_changed");
        Self {
            context,
            events,
            transaction_changes,
            cached: BalanceSnapshot::default(),
            last_height: None,
            transaction_count: 0,
            refresh_pending: false,
        }
    }

    /// Refresh on the next poll even if the chain has not moved
    pub fn on_transaction_changed(&mut self) {
        self.refresh_pending = true;
    }

    /// Balances as of the last successful refresh
    pub fn cached_balances(&self) -> BalanceSnapshot {
        self.cached
    }

    pub fn poll(&mut self) -> PollOutcome {
        if self.transaction_changes.try_iter().count() > 0 {
            self.on_transaction_changed();
        }

        let (height, balances, count) = {
            let Some(session) = self.context.try_write_session() else {
                log::trace!("Wallet busy, skipping balance poll");
                return PollOutcome::Skipped;
            };

            let height = session.chain().best_height();
            if self.last_height == Some(height) && !self.refresh_pending {
                return PollOutcome::Unchanged;
            }
            (
                height,
                session.wallet().balances(),
                session.wallet().transaction_count(),
            )
        };

        self.last_height = Some(height);
        self.refresh_pending = false;

        if count != self.transaction_count {
            self.transaction_count = count;
            self.events.publish(WalletEvent::NumTransactionsChanged(count));
        }

        if balances == self.cached {
            return PollOutcome::Unchanged;
        }

        self.cached = balances;
        log_core(
            LogLevel::Debug,
            "Balance changed",
            Some(json!({
                "height": height,
                "spendable": balances.spendable.to_sat(),
                "unconfirmed": balances.unconfirmed.to_sat(),
            })),
        );
        self.events.publish(WalletEvent::BalanceChanged(balances));
        PollOutcome::BalanceChanged(balances)
    }
}

impl<C, W> BalancePoller<C, W>
where
    C: ChainView + Send + 'static,
    W: BalanceSource + Send + 'static,
{
    /// Poll every `interval` on a background thread
    pub fn spawn(mut self, interval: Duration) -> PollerHandle {
        let (stop, stopped) = bounded::<()>(1);
        let thread = thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    self.poll();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        log_core(
            LogLevel::Info,
            "Balance poller started",
            Some(json!({ "interval_ms": interval.as_millis() as u64 })),
        );
        PollerHandle {
            stop: Some(stop),
            thread: Some(thread),
        }
    }
}

/// Stops the background poller when told to or when dropped
pub struct PollerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log_core(LogLevel::Error, "Balance poller thread panicked", None);
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_wallet::{MemoryChain, MemoryWallet};
    use bitcoin::{Amount, Network};

    fn context() -> Arc<WalletContext<MemoryChain, MemoryWallet>> {
        let wallet = MemoryWallet::new(Network::Regtest).with_coin(Amount::from_sat(1_000));
        Arc::new(WalletContext::new(MemoryChain::new(1), wallet, Network::Regtest))
    }

    #[test]
    fn first_poll_publishes_balances() {
        let bus = WalletEventBus::new();
        let events = bus.subscribe("balance_changed");
        let mut poller = BalancePoller::new(context(), bus);

        assert!(matches!(poller.poll(), PollOutcome::BalanceChanged(_)));
        assert_eq!(poller.cached_balances().spendable, Amount::from_sat(1_000));
        assert!(events.try_recv().is_ok());
        assert_eq!(poller.poll(), PollOutcome::Unchanged);
    }

    #[test]
    fn busy_wallet_skips_the_poll() {
        let context = context();
        let mut poller = BalancePoller::new(Arc::clone(&context), WalletEventBus::new());

        let session = context.write_session();
        assert_eq!(poller.poll(), PollOutcome::Skipped);
        drop(session);

        let wallet_only = context.lock_wallet();
        assert_eq!(poller.poll(), PollOutcome::Skipped);
        drop(wallet_only);

        assert!(matches!(poller.poll(), PollOutcome::BalanceChanged(_)));
    }

    #[test]
    fn balances_refresh_only_on_new_blocks() {
        let context = context();
        let mut poller = BalancePoller::new(Arc::clone(&context), WalletEventBus::new());
        poller.poll();

        context.lock_wallet().add_coin(Amount::from_sat(500), 1);
        assert_eq!(poller.poll(), PollOutcome::Unchanged);

        context.lock_chain().advance();
        match poller.poll() {
            PollOutcome::BalanceChanged(balances) => {
                assert_eq!(balances.spendable, Amount::from_sat(1_500))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn transaction_change_refreshes_without_a_block() {
        let context = context();
        let mut poller = BalancePoller::new(Arc::clone(&context), WalletEventBus::new());
        poller.poll();

        context.lock_wallet().add_coin(Amount::from_sat(500), 1);
        poller.on_transaction_changed();
        match poller.poll() {
            PollOutcome::BalanceChanged(balances) => {
                assert_eq!(balances.spendable, Amount::from_sat(1_500))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(poller.poll(), PollOutcome::Unchanged);
    }

    #[test]
    fn pending_refresh_survives_a_skipped_poll() {
        let context = context();
        let mut poller = BalancePoller::new(Arc::clone(&context), WalletEventBus::new());
        poller.poll();

        let mut wallet = context.lock_wallet();
        wallet.add_coin(Amount::from_sat(500), 1);
        poller.on_transaction_changed();
        assert_eq!(poller.poll(), PollOutcome::Skipped);
        drop(wallet);

        assert!(matches!(poller.poll(), PollOutcome::BalanceChanged(_)));
    }

    #[test]
    fn handle_stops_the_thread() {
        let bus = WalletEventBus::new();
        let events = bus.subscribe_all();
        let handle = BalancePoller::new(context(), bus).spawn(Duration::from_millis(5));

        assert!(events.recv_timeout(Duration::from_secs(5)).is_ok());
        handle.stop();
    }
}
