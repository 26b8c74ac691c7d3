//! In-memory wallet backend
//!
//! Keeps coins, keys, labels and committed transactions in plain
//! collections. It funds transactions largest-coin-first and iterates until
//! the fee covers the transaction it pays for. Used by the integration tests
//! and by anything that wants to drive the pipeline without a real wallet.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use stealthpay_common::address_book::AddressBook;
use stealthpay_common::logging::{log_storage, log_transaction, LogLevel};
use stealthpay_common::math::{estimate_tx_size_with_scripts, FeePolicy};
use stealthpay_common::types::{BalanceSnapshot, ChangeType, CoinControl};

use crate::coin_selector::spendable_balance;
use crate::tx_builder::{CandidateTransaction, OutputPlan};
use crate::wallet::{
    AddressBookStore, BalanceSource, ChainView, Coin, CoinFilter, CoinSource, CommitError,
    CreateTxError, KeyPool, KeyPoolError, ReservedKey, TransactionCommitter, TransactionFactory,
    WalletLock,
};
use crate::SECP;

/// Where the wallet puts the change output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangePlacement {
    /// After every planned output
    #[default]
    Last,
    /// At the first group boundary at or after the given position
    At(usize),
    /// Exactly at the given position, even inside a group
    Unchecked(usize),
}

/// A committed transaction
#[derive(Debug, Clone)]
pub struct WalletTransaction {
    pub txid: Txid,
    pub tx: Transaction,
    pub fee: Amount,
    pub metadata: std::collections::BTreeMap<String, String>,
}

/// Wallet state kept entirely in memory
pub struct MemoryWallet {
    network: Network,
    coins: Vec<Coin>,
    next_coin_id: u32,
    /// First input of the transaction that created each change coin
    funding: HashMap<OutPoint, Coin>,
    passphrase_hash: Option<[u8; 32]>,
    locked: bool,
    next_key_index: u32,
    key_pool_size: Option<u32>,
    reserved_keys: BTreeSet<u32>,
    kept_keys: Vec<u32>,
    returned_keys: Vec<u32>,
    address_book: AddressBook,
    transactions: Vec<WalletTransaction>,
    change_placement: ChangePlacement,
    fail_commit: bool,
    coin_list_calls: AtomicUsize,
    hide_coins_after: Option<usize>,
}

impl MemoryWallet {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            coins: Vec::new(),
            next_coin_id: 0,
            funding: HashMap::new(),
            passphrase_hash: None,
            locked: false,
            next_key_index: 0,
            key_pool_size: None,
            reserved_keys: BTreeSet::new(),
            kept_keys: Vec::new(),
            returned_keys: Vec::new(),
            address_book: AddressBook::new(network),
            transactions: Vec::new(),
            change_placement: ChangePlacement::Last,
            fail_commit: false,
            coin_list_calls: AtomicUsize::new(0),
            hide_coins_after: None,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Add a coin of `value` with `confirmations` paid to a fresh receiving
    /// address, returning its outpoint
    pub fn add_coin(&mut self, value: Amount, confirmations: u32) -> OutPoint {
        let script = derive_key("receive", self.next_coin_id)
            .map(|key| ScriptBuf::new_p2pkh(&key.pubkey_hash()))
            .unwrap_or_default();
        self.push_coin(script, value, confirmations)
    }

    /// Add a coin paid to `address`
    pub fn add_coin_to(&mut self, address: &Address, value: Amount, confirmations: u32) -> OutPoint {
        self.push_coin(address.script_pubkey(), value, confirmations)
    }

    fn push_coin(&mut self, script: ScriptBuf, value: Amount, confirmations: u32) -> OutPoint {
        let id = self.next_coin_id;
        self.next_coin_id += 1;
        let txid = Txid::hash(format!("funding-{}", id).as_bytes());
        let outpoint = OutPoint::new(txid, 0);
        self.coins.push(Coin {
            outpoint,
            value,
            script,
            confirmations,
            is_change: false,
        });
        outpoint
    }

    /// Protect the wallet with `passphrase` and lock it
    pub fn encrypt(&mut self, passphrase: &str) {
        self.passphrase_hash = Some(Sha256::digest(passphrase.as_bytes()).into());
        self.locked = true;
    }

    /// Unlock with `passphrase`, returning whether the wallet is now unlocked
    pub fn unlock(&mut self, passphrase: &str) -> bool {
        let digest: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
        if self.passphrase_hash == Some(digest) {
            self.locked = false;
        }
        !self.locked
    }

    pub fn with_coin(mut self, value: Amount) -> Self {
        self.add_coin(value, 1);
        self
    }

    pub fn set_change_placement(&mut self, placement: ChangePlacement) {
        self.change_placement = placement;
    }

    /// Make every commit fail
    pub fn set_fail_commit(&mut self, fail: bool) {
        self.fail_commit = fail;
    }

    /// List no coins once coins have been listed `listings` times, as if
    /// someone else spent them in between
    pub fn hide_coins_after(&mut self, listings: usize) {
        self.hide_coins_after = Some(listings);
    }

    /// Limit how many change keys can ever be handed out
    pub fn set_key_pool_size(&mut self, size: u32) {
        self.key_pool_size = Some(size);
    }

    /// Confirm every coin once, as if a block was mined
    pub fn confirm_all(&mut self) {
        for coin in &mut self.coins {
            coin.confirmations += 1;
        }
    }

    pub fn coins(&self) -> &[Coin] {
        &self.coins
    }

    pub fn transactions(&self) -> &[WalletTransaction] {
        &self.transactions
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    pub fn address_book_mut(&mut self) -> &mut AddressBook {
        &mut self.address_book
    }

    /// Keys currently reserved and neither kept nor returned
    pub fn reserved_keys(&self) -> usize {
        self.reserved_keys.len()
    }

    pub fn kept_keys(&self) -> &[u32] {
        &self.kept_keys
    }

    pub fn returned_keys(&self) -> &[u32] {
        &self.returned_keys
    }

    /// How often coins were listed
    pub fn coin_list_calls(&self) -> usize {
        self.coin_list_calls.load(Ordering::SeqCst)
    }

    fn change_position(&self, plan: &OutputPlan) -> usize {
        match self.change_placement {
            ChangePlacement::Last => plan.len(),
            ChangePlacement::At(requested) => plan.snap_change_position(requested),
            ChangePlacement::Unchecked(position) => position.min(plan.len()),
        }
    }

    fn selected_coins(&self, coin_control: Option<&CoinControl>) -> Vec<Coin> {
        let mut coins = self.list_spendable_coins(&CoinFilter::spendable(coin_control));
        coins.sort_by(|a, b| b.value.cmp(&a.value));
        coins
    }
}

fn derive_key(purpose: &str, index: u32) -> Result<bitcoin::PublicKey, KeyPoolError> {
    let digest: [u8; 32] = Sha256::digest(format!("memory-wallet-{}-{}", purpose, index)).into();
    let secret = SecretKey::from_slice(&digest).map_err(|_| KeyPoolError::Exhausted)?;
    Ok(bitcoin::PublicKey::new(PublicKey::from_secret_key(&SECP, &secret)))
}

impl CoinSource for MemoryWallet {
    fn list_spendable_coins(&self, filter: &CoinFilter<'_>) -> Vec<Coin> {
        let calls = self.coin_list_calls.fetch_add(1, Ordering::SeqCst);
        if self.hide_coins_after.map_or(false, |limit| calls >= limit) {
            return Vec::new();
        }
        self.coins
            .iter()
            .filter(|coin| filter.accepts(coin))
            .cloned()
            .collect()
    }

    fn funding_coin(&self, coin: &Coin) -> Option<Coin> {
        self.funding.get(&coin.outpoint).cloned()
    }
}

impl WalletLock for MemoryWallet {
    fn is_locked(&self) -> bool {
        self.locked
    }

    fn lock(&mut self) {
        if self.passphrase_hash.is_some() {
            self.locked = true;
        }
    }
}

impl KeyPool for MemoryWallet {
    fn reserve_change_key(&mut self) -> Result<ReservedKey, KeyPoolError> {
        if self.locked {
            return Err(KeyPoolError::Locked);
        }
        if let Some(size) = self.key_pool_size {
            if self.next_key_index >= size {
                return Err(KeyPoolError::Exhausted);
            }
        }
        let index = self.next_key_index;
        let pubkey = derive_key("change", index)?;
        self.next_key_index += 1;
        self.reserved_keys.insert(index);
        Ok(ReservedKey { index, pubkey })
    }

    fn return_key(&mut self, key: &ReservedKey) {
        if self.reserved_keys.remove(&key.index) {
            self.returned_keys.push(key.index);
        }
    }

    fn keep_key(&mut self, key: &ReservedKey) {
        if self.reserved_keys.remove(&key.index) {
            self.kept_keys.push(key.index);
        }
    }
}

impl TransactionFactory for MemoryWallet {
    fn create_transaction(
        &mut self,
        plan: &OutputPlan,
        change_key: &ReservedKey,
        fee_policy: &FeePolicy,
        coin_control: Option<&CoinControl>,
    ) -> Result<CandidateTransaction, CreateTxError> {
        if plan.is_empty() {
            return Err(CreateTxError::NoOutputs);
        }

        let target = plan.total_value();
        let available = self.selected_coins(coin_control);
        let change_script = change_key.script_pubkey();
        let mut fee = fee_policy.pay_tx_fee;

        loop {
            let required = target
                .checked_add(fee)
                .ok_or(CreateTxError::InsufficientFunds { required_fee: fee })?;

            let mut inputs = Vec::new();
            let mut funded = Amount::ZERO;
            for coin in &available {
                if funded >= required {
                    break;
                }
                funded = funded.checked_add(coin.value).unwrap_or(Amount::max_value());
                inputs.push(coin.clone());
            }
            if funded < required {
                return Err(CreateTxError::InsufficientFunds { required_fee: fee });
            }

            let change = funded - required;
            let mut script_lens: Vec<usize> =
                plan.outputs().iter().map(|o| o.script_pubkey.len()).collect();
            if change > Amount::ZERO {
                script_lens.push(change_script.len());
            }
            let needed = fee_policy.required_fee(estimate_tx_size_with_scripts(inputs.len(), script_lens));
            if needed > fee {
                fee = needed;
                continue;
            }

            let (outputs, change_position) = if change > Amount::ZERO {
                let position = self.change_position(plan);
                let change_output = TxOut {
                    value: change.to_sat(),
                    script_pubkey: change_script.clone(),
                };
                let outputs = match self.change_placement {
                    ChangePlacement::Unchecked(_) => {
                        let mut outputs = plan.outputs().to_vec();
                        outputs.insert(position, change_output);
                        outputs
                    }
                    _ => plan.with_change(position, change_output)?,
                };
                (outputs, Some(position))
            } else {
                (plan.outputs().to_vec(), None)
            };

            log_transaction(
                LogLevel::Debug,
                "Funded transaction",
                Some(json!({
                    "inputs": inputs.len(),
                    "fee": fee.to_sat(),
                    "change": change.to_sat(),
                })),
            );

            return Ok(CandidateTransaction {
                inputs,
                outputs,
                fee,
                change_position,
                metadata: Default::default(),
            });
        }
    }
}

impl TransactionCommitter for MemoryWallet {
    fn commit_transaction(
        &mut self,
        tx: &CandidateTransaction,
        change_key: &ReservedKey,
    ) -> Result<Txid, CommitError> {
        if self.fail_commit {
            return Err(CommitError::Rejected("commit disabled".to_string()));
        }

        let spent: BTreeSet<OutPoint> = tx.inputs.iter().map(|coin| coin.outpoint).collect();
        let owned = self
            .coins
            .iter()
            .filter(|coin| spent.contains(&coin.outpoint))
            .count();
        if owned != spent.len() {
            return Err(CommitError::CoinsUnavailable);
        }

        let unsigned = tx.unsigned_transaction();
        let txid = unsigned.txid();
        self.coins.retain(|coin| !spent.contains(&coin.outpoint));

        if let Some(position) = tx.change_position {
            if let Some(output) = tx.outputs.get(position) {
                let outpoint = OutPoint::new(txid, position as u32);
                if let Some(first) = tx.inputs.first() {
                    self.funding.insert(outpoint, first.clone());
                }
                self.coins.push(Coin {
                    outpoint,
                    value: Amount::from_sat(output.value),
                    script: change_key.script_pubkey(),
                    confirmations: 0,
                    is_change: true,
                });
            }
        }

        self.transactions.push(WalletTransaction {
            txid,
            tx: unsigned,
            fee: tx.fee,
            metadata: tx.metadata.clone(),
        });

        log_storage(
            LogLevel::Info,
            "Transaction recorded",
            Some(json!({ "txid": txid.to_string(), "fee": tx.fee.to_sat() })),
        );
        Ok(txid)
    }
}

impl AddressBookStore for MemoryWallet {
    fn address_label(&self, address: &str) -> Option<String> {
        self.address_book.label(address).map(str::to_string)
    }

    fn is_mine(&self, address: &str) -> bool {
        self.address_book
            .get_entry(address)
            .map_or(false, |entry| entry.is_mine)
    }

    fn set_address_label(&mut self, address: &str, label: &str) -> Option<ChangeType> {
        let is_mine = self.is_mine(address);
        let change = self.address_book.set_label(address, label, is_mine);
        self.address_book.mark_as_used(address);
        change
    }

    fn update_stealth_label(&mut self, address: &str, label: &str) -> Option<ChangeType> {
        let change = self.address_book.update_stealth_label(address, label);
        self.address_book.mark_as_used(address);
        change
    }
}

impl BalanceSource for MemoryWallet {
    fn balances(&self) -> BalanceSnapshot {
        let (confirmed, unconfirmed): (Vec<Coin>, Vec<Coin>) =
            self.coins.iter().cloned().partition(|coin| coin.confirmations > 0);
        BalanceSnapshot {
            spendable: spendable_balance(&confirmed),
            unconfirmed: spendable_balance(&unconfirmed),
            immature: Amount::ZERO,
        }
    }

    fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

/// Chain tip kept in memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryChain {
    pub height: u32,
}

impl MemoryChain {
    pub fn new(height: u32) -> Self {
        Self { height }
    }

    pub fn advance(&mut self) {
        self.height += 1;
    }
}

impl ChainView for MemoryChain {
    fn best_height(&self) -> u32 {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::ScriptBuf;

    fn plan(values: &[u64]) -> OutputPlan {
        let mut plan = OutputPlan::new();
        for &value in values {
            plan.push_group(vec![
                TxOut {
                    value,
                    script_pubkey: ScriptBuf::new(),
                },
                TxOut {
                    value: 0,
                    script_pubkey: ScriptBuf::new(),
                },
            ]);
        }
        plan
    }

    fn funded_wallet() -> MemoryWallet {
        MemoryWallet::new(Network::Regtest).with_coin(Amount::from_sat(1_000))
    }

    #[test]
    fn change_pays_back_the_surplus() {
        let mut wallet = funded_wallet();
        let key = wallet.reserve_change_key().unwrap();
        let policy = FeePolicy::flat(Amount::from_sat(10));

        let tx = wallet.create_transaction(&plan(&[500]), &key, &policy, None).unwrap();
        assert_eq!(tx.fee, Amount::from_sat(10));
        assert_eq!(tx.change_position, Some(2));
        assert_eq!(tx.change_output().unwrap().value, 490);
    }

    #[test]
    fn shortfall_reports_the_fee() {
        let mut wallet = funded_wallet();
        let key = wallet.reserve_change_key().unwrap();
        let policy = FeePolicy::flat(Amount::from_sat(10));

        let err = wallet
            .create_transaction(&plan(&[1_000]), &key, &policy, None)
            .unwrap_err();
        assert_eq!(err.required_fee(), Some(Amount::from_sat(10)));
    }

    #[test]
    fn rate_fee_grows_with_size() {
        let mut wallet = funded_wallet();
        let key = wallet.reserve_change_key().unwrap();
        let policy = FeePolicy::from_sats(0, 1.0);

        let tx = wallet.create_transaction(&plan(&[100]), &key, &policy, None).unwrap();
        assert!(tx.fee > Amount::from_sat(100));
        assert_eq!(tx.input_value(), tx.output_value() + tx.fee);
    }

    #[test]
    fn change_placement_snaps_to_group_start() {
        let mut wallet = funded_wallet();
        wallet.set_change_placement(ChangePlacement::At(1));
        let key = wallet.reserve_change_key().unwrap();
        let policy = FeePolicy::flat(Amount::from_sat(10));

        let tx = wallet
            .create_transaction(&plan(&[100, 200]), &key, &policy, None)
            .unwrap();
        assert_eq!(tx.change_position, Some(2));
    }

    #[test]
    fn keys_are_tracked_until_kept_or_returned() {
        let mut wallet = MemoryWallet::new(Network::Regtest);
        let first = wallet.reserve_change_key().unwrap();
        let second = wallet.reserve_change_key().unwrap();
        assert_ne!(first.pubkey, second.pubkey);
        assert_eq!(wallet.reserved_keys(), 2);

        wallet.keep_key(&first);
        wallet.return_key(&second);
        wallet.return_key(&second);
        assert_eq!(wallet.kept_keys(), &[0]);
        assert_eq!(wallet.returned_keys(), &[1]);
        assert_eq!(wallet.reserved_keys(), 0);
    }

    #[test]
    fn coins_added_after_a_spend_get_fresh_outpoints() {
        let mut wallet = funded_wallet();
        let key = wallet.reserve_change_key().unwrap();
        let policy = FeePolicy::flat(Amount::from_sat(10));
        let tx = wallet.create_transaction(&plan(&[990]), &key, &policy, None).unwrap();
        wallet.commit_transaction(&tx, &key).unwrap();
        assert!(wallet.coins().is_empty());

        let second = wallet.add_coin(Amount::from_sat(1_000), 1);
        assert_ne!(second, tx.inputs[0].outpoint);
    }

    #[test]
    fn locked_wallet_refuses_keys() {
        let mut wallet = MemoryWallet::new(Network::Regtest);
        wallet.encrypt("hunter2");
        assert_eq!(wallet.reserve_change_key(), Err(KeyPoolError::Locked));

        assert!(!wallet.unlock("wrong"));
        assert!(wallet.unlock("hunter2"));
        assert!(wallet.reserve_change_key().is_ok());

        wallet.lock();
        assert!(wallet.is_locked());
    }

    #[test]
    fn unencrypted_wallet_cannot_be_locked() {
        let mut wallet = MemoryWallet::new(Network::Regtest);
        wallet.lock();
        assert!(!wallet.is_locked());
    }

    #[test]
    fn change_remembers_its_funding_coin() {
        let mut wallet = funded_wallet();
        let funding = wallet.coins()[0].clone();
        let key = wallet.reserve_change_key().unwrap();
        let policy = FeePolicy::flat(Amount::from_sat(10));
        let tx = wallet.create_transaction(&plan(&[500]), &key, &policy, None).unwrap();
        wallet.commit_transaction(&tx, &key).unwrap();

        let change = wallet.coins()[0].clone();
        assert!(change.is_change);
        assert_eq!(wallet.funding_coin(&change), Some(funding.clone()));
        assert_eq!(wallet.funding_coin(&funding), None);
    }

    #[test]
    fn exhausted_pool_refuses_keys() {
        let mut wallet = MemoryWallet::new(Network::Regtest);
        wallet.set_key_pool_size(1);
        assert!(wallet.reserve_change_key().is_ok());
        assert_eq!(wallet.reserve_change_key(), Err(KeyPoolError::Exhausted));
    }

    #[test]
    fn commit_spends_inputs_and_keeps_change() {
        let mut wallet = funded_wallet();
        let key = wallet.reserve_change_key().unwrap();
        let policy = FeePolicy::flat(Amount::from_sat(10));
        let tx = wallet.create_transaction(&plan(&[500]), &key, &policy, None).unwrap();

        let txid = wallet.commit_transaction(&tx, &key).unwrap();
        assert_eq!(wallet.transaction_count(), 1);
        assert_eq!(wallet.coins().len(), 1);
        assert_eq!(wallet.coins()[0].outpoint, OutPoint::new(txid, 2));
        assert_eq!(wallet.balances().unconfirmed, Amount::from_sat(490));
        assert_eq!(wallet.balances().spendable, Amount::ZERO);

        assert_eq!(
            wallet.commit_transaction(&tx, &key),
            Err(CommitError::CoinsUnavailable)
        );
    }

    #[test]
    fn unconfirmed_coins_are_not_spendable() {
        let mut wallet = MemoryWallet::new(Network::Regtest);
        wallet.add_coin(Amount::from_sat(5_000), 0);
        let key = wallet.reserve_change_key().unwrap();
        let policy = FeePolicy::flat(Amount::from_sat(10));

        assert!(wallet
            .create_transaction(&plan(&[100]), &key, &policy, None)
            .is_err());
        wallet.confirm_all();
        assert!(wallet
            .create_transaction(&plan(&[100]), &key, &policy, None)
            .is_ok());
    }
}
