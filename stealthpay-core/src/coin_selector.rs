//! Balance sufficiency checks
//!
//! Coin aggregation itself belongs to the wallet; this module only decides
//! whether the visible coins can pay for a request. The checks run twice:
//! optimistically with the configured transaction fee before any transaction
//! is built, and again with the real fee once the wallet has built one.
//! Coin control gets its listing from [`group_by_owner`].

use bitcoin::{Address, Amount, Network};
use serde_json::json;
use std::collections::BTreeMap;

use stealthpay_common::logging::{log_transaction, LogLevel};
use stealthpay_common::types::SendError;

use crate::wallet::{Coin, CoinFilter, CoinSource, CreateTxError};

/// Sum of coin values
pub fn spendable_balance(coins: &[Coin]) -> Amount {
    coins
        .iter()
        .fold(Amount::ZERO, |sum, coin| {
            sum.checked_add(coin.value).unwrap_or(Amount::max_value())
        })
}

/// The visible spendable balance under `filter`
pub fn balance<W: CoinSource + ?Sized>(wallet: &W, filter: &CoinFilter<'_>) -> Amount {
    spendable_balance(&wallet.list_spendable_coins(filter))
}

/// `balance ≥ total`
pub fn check_amount(total: Amount, balance: Amount) -> Result<(), SendError> {
    if total > balance {
        return Err(SendError::AmountExceedsBalance);
    }
    Ok(())
}

/// `balance ≥ total + fee`
pub fn check_amount_with_fee(total: Amount, fee: Amount, balance: Amount) -> Result<(), SendError> {
    let required = total
        .checked_add(fee)
        .ok_or(SendError::AmountWithFeeExceedsBalance(fee))?;
    if required > balance {
        return Err(SendError::AmountWithFeeExceedsBalance(fee));
    }
    Ok(())
}

/// Optimistic check before the transaction is built
///
/// Returns the balance it checked against.
pub fn precheck<W: CoinSource + ?Sized>(
    wallet: &W,
    filter: &CoinFilter<'_>,
    total: Amount,
    pay_tx_fee: Amount,
) -> Result<Amount, SendError> {
    let balance = balance(wallet, filter);
    log_transaction(
        LogLevel::Debug,
        "Checking balance",
        Some(json!({
            "total": total.to_sat(),
            "balance": balance.to_sat(),
            "fee": pay_tx_fee.to_sat(),
        })),
    );

    check_amount(total, balance)?;
    check_amount_with_fee(total, pay_tx_fee, balance)?;
    Ok(balance)
}

/// Map a failed transaction creation onto a send outcome
///
/// When the wallet reports the fee it would have needed and that fee pushes
/// the total over the balance, the caller learns the fee; every other
/// failure is a creation failure.
pub fn classify_creation_failure(err: &CreateTxError, total: Amount, balance: Amount) -> SendError {
    match err.required_fee() {
        Some(fee) if check_amount_with_fee(total, fee, balance).is_err() => {
            SendError::AmountWithFeeExceedsBalance(fee)
        }
        _ => SendError::TransactionCreationFailed,
    }
}

/// Coins keyed by the encoded address that owns them
pub type CoinGroups = BTreeMap<String, Vec<Coin>>;

/// Group coins by owning address
///
/// Change is listed under the address whose coin paid for it, following the
/// funding chain back for as long as the wallet knows the funding coin.
/// Coins whose script has no address form are left out.
pub fn group_by_owner<W: CoinSource + ?Sized>(
    wallet: &W,
    coins: Vec<Coin>,
    network: Network,
) -> CoinGroups {
    let mut groups = CoinGroups::new();
    for coin in coins {
        let mut owner = coin.clone();
        while owner.is_change {
            match wallet.funding_coin(&owner) {
                Some(funding) => owner = funding,
                None => break,
            }
        }

        match Address::from_script(&owner.script, network) {
            Ok(address) => groups.entry(address.to_string()).or_default().push(coin),
            Err(_) => log::trace!("Skipping coin {} without an address", coin.outpoint),
        }
    }
    groups
}
