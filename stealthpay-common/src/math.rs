//! Fee and size calculations for outgoing transactions
//!
//! Amounts are handled with `bitcoin::Amount` and fee rates with
//! `bdk::FeeRate`, so the numbers used here match what the rest of the
//! Bitcoin ecosystem computes.
//!
//! Example:
//! ```
//! use bitcoin::Amount;
//! use stealthpay_common::math::{estimate_tx_size, FeePolicy};
//!
//! let policy = FeePolicy::from_sats(10_000, 1.0);
//! let size = estimate_tx_size(1, 2);
//! assert_eq!(policy.required_fee(size), Amount::from_sat(10_000));
//! ```

use bdk::FeeRate;
use bitcoin::Amount;

/// Fixed transaction overhead: version, locktime and the two count varints
pub const TX_OVERHEAD_SIZE: usize = 10;

/// Size of a signed P2PKH input with a compressed key
pub const P2PKH_INPUT_SIZE: usize = 148;

/// Size of a P2PKH output
pub const P2PKH_OUTPUT_SIZE: usize = 34;

/// How the wallet prices a transaction
///
/// The required fee is the larger of the flat per-transaction fee and the
/// rate-based fee for the transaction's size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeePolicy {
    /// Minimum fee paid by every transaction
    pub pay_tx_fee: Amount,
    /// Fee rate applied to the transaction size
    pub fee_rate: FeeRate,
}

impl FeePolicy {
    pub fn new(pay_tx_fee: Amount, fee_rate: FeeRate) -> Self {
        Self {
            pay_tx_fee,
            fee_rate,
        }
    }

    /// Build a policy from a flat fee in satoshis and a rate in sat/vB
    pub fn from_sats(pay_tx_fee_sats: u64, sat_per_vb: f32) -> Self {
        Self::new(
            Amount::from_sat(pay_tx_fee_sats),
            FeeRate::from_sat_per_vb(sat_per_vb),
        )
    }

    /// A flat fee that ignores transaction size
    pub fn flat(pay_tx_fee: Amount) -> Self {
        Self::new(pay_tx_fee, FeeRate::from_sat_per_vb(0.0))
    }

    /// Fee required for a transaction of `tx_size` bytes
    pub fn required_fee(&self, tx_size: usize) -> Amount {
        let by_rate = (tx_size as f32 * self.fee_rate.as_sat_per_vb()).ceil() as u64;
        let by_rate = Amount::from_sat(by_rate);
        by_rate.max(self.pay_tx_fee)
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self::from_sats(10_000, 1.0)
    }
}

/// Serialized size of an output whose script is `script_len` bytes long
pub fn output_size(script_len: usize) -> usize {
    // 8-byte value, compact-size script length, script
    8 + compact_size_len(script_len) + script_len
}

/// Estimated size of a transaction spending P2PKH inputs into P2PKH outputs
pub fn estimate_tx_size(inputs: usize, outputs: usize) -> usize {
    TX_OVERHEAD_SIZE + inputs * P2PKH_INPUT_SIZE + outputs * P2PKH_OUTPUT_SIZE
}

/// Estimated size of a transaction with P2PKH inputs and arbitrary outputs
pub fn estimate_tx_size_with_scripts<I>(inputs: usize, script_lens: I) -> usize
where
    I: IntoIterator<Item = usize>,
{
    TX_OVERHEAD_SIZE
        + inputs * P2PKH_INPUT_SIZE
        + script_lens.into_iter().map(output_size).sum::<usize>()
}

fn compact_size_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn flat_fee_wins_for_small_transactions() {
        let policy = FeePolicy::from_sats(10_000, 1.0);
        assert_eq!(policy.required_fee(226), Amount::from_sat(10_000));
    }

    #[test]
    fn rate_wins_for_large_transactions() {
        let policy = FeePolicy::from_sats(100, 2.0);
        assert_eq!(policy.required_fee(500), Amount::from_sat(1_000));
    }

    #[test]
    fn p2pkh_output_matches_script_based_size() {
        assert_eq!(output_size(25), P2PKH_OUTPUT_SIZE);
        assert_eq!(
            estimate_tx_size(2, 3),
            estimate_tx_size_with_scripts(2, vec![25, 25, 25])
        );
    }

    #[quickcheck]
    fn required_fee_never_below_flat_fee(flat: u32, size: u16) -> bool {
        let policy = FeePolicy::from_sats(flat as u64, 1.0);
        policy.required_fee(size as usize) >= Amount::from_sat(flat as u64)
    }

    #[quickcheck]
    fn flat_policy_ignores_size(flat: u32, size: u16) -> bool {
        let policy = FeePolicy::flat(Amount::from_sat(flat as u64));
        policy.required_fee(size as usize) == Amount::from_sat(flat as u64)
    }
}
