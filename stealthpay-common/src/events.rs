//! StealthPay event system: wallet change notifications
//!
//! Components publish [`WalletEvent`]s after they have released their wallet
//! locks; observers (a presentation layer, tests) subscribe either to one kind
//! of event or to all of them. Delivery uses `std::sync::mpsc` channels, so
//! receivers can block, poll or time out as they see fit.
//!
//! ## Security Considerations
//!
//! - Events carry public data only (txids, addresses, labels, balances)
//! - Subscribers that went away are pruned on the next publish

use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::logging::{log_core, LogLevel};
use crate::types::{BalanceSnapshot, ChangeType};

/// Subscription key that receives every event
pub const ALL_EVENTS: &str = "all";

/// Change notifications emitted by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletEvent {
    /// Cached balances changed
    BalanceChanged(BalanceSnapshot),
    /// A wallet transaction was added or updated
    TransactionChanged { txid: Txid, status: ChangeType },
    /// An address-book entry was added, relabeled or removed
    AddressBookChanged {
        address: String,
        label: String,
        is_mine: bool,
        status: ChangeType,
    },
    /// The number of wallet transactions changed
    NumTransactionsChanged(usize),
}

impl WalletEvent {
    /// Subscription key for this event
    pub fn kind(&self) -> &'static str {
        match self {
            WalletEvent::BalanceChanged(_) => "balance_changed",
            WalletEvent::TransactionChanged { .. } => "transaction_changed",
            WalletEvent::AddressBookChanged { .. } => "address_book_changed",
            WalletEvent::NumTransactionsChanged(_) => "num_transactions_changed",
        }
    }
}

/// Publish/subscribe bus for [`WalletEvent`]s
///
/// Cloning the bus yields another handle to the same subscriber table.
#[derive(Clone, Default)]
pub struct WalletEventBus {
    subscribers: Arc<Mutex<HashMap<String, Vec<Sender<WalletEvent>>>>>,
}

impl WalletEventBus {
    /// Create a new wallet event bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all wallet events
    pub fn subscribe_all(&self) -> Receiver<WalletEvent> {
        self.subscribe(ALL_EVENTS)
    }

    /// Subscribe to a specific kind of wallet event
    ///
    /// # Arguments
    ///
    /// * `kind` - One of the keys returned by [`WalletEvent::kind`]
    ///   (e.g. "balance_changed") or "all" for every event
    pub fn subscribe(&self, kind: &str) -> Receiver<WalletEvent> {
        let (sender, receiver) = mpsc::channel();

        self.lock_subscribers()
            .entry(kind.to_lowercase())
            .or_default()
            .push(sender);

        receiver
    }

    /// Publish an event to the subscribers of its kind and to "all"
    pub fn publish(&self, event: WalletEvent) {
        log_core(
            LogLevel::Debug,
            "Publishing wallet event",
            Some(json!({ "kind": event.kind() })),
        );

        let mut subscribers = self.lock_subscribers();
        for key in [event.kind(), ALL_EVENTS] {
            if let Some(channels) = subscribers.get_mut(key) {
                // Closed receivers are dropped from the table
                channels.retain(|channel| channel.send(event.clone()).is_ok());
            }
        }
    }

    /// Number of live subscriptions for a kind (including closed ones not yet pruned)
    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.lock_subscribers()
            .get(&kind.to_lowercase())
            .map_or(0, Vec::len)
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, HashMap<String, Vec<Sender<WalletEvent>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn kind_subscribers_only_see_their_kind() {
        let bus = WalletEventBus::new();
        let receiver = bus.subscribe("num_transactions_changed");

        bus.publish(WalletEvent::BalanceChanged(BalanceSnapshot::default()));
        bus.publish(WalletEvent::NumTransactionsChanged(3));

        assert_eq!(receiver.recv().unwrap(), WalletEvent::NumTransactionsChanged(3));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn all_subscribers_see_events_in_order() {
        let bus = WalletEventBus::new();
        let receiver = bus.subscribe_all();
        let txid = Txid::all_zeros();

        bus.publish(WalletEvent::TransactionChanged {
            txid,
            status: ChangeType::New,
        });
        bus.publish(WalletEvent::NumTransactionsChanged(1));

        assert_eq!(
            receiver.recv().unwrap(),
            WalletEvent::TransactionChanged {
                txid,
                status: ChangeType::New
            }
        );
        assert_eq!(receiver.recv().unwrap(), WalletEvent::NumTransactionsChanged(1));
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = WalletEventBus::new();
        let receiver = bus.subscribe_all();
        assert_eq!(bus.subscriber_count(ALL_EVENTS), 1);

        drop(receiver);
        bus.publish(WalletEvent::NumTransactionsChanged(0));
        assert_eq!(bus.subscriber_count(ALL_EVENTS), 0);
    }
}
