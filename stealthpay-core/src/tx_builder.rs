//! Transaction assembly
//!
//! The builder turns resolved recipients into an [`OutputPlan`]: an ordered
//! list of outputs split into groups. A group is a payment output followed by
//! the data outputs that belong to it (the stealth data carrier, or the two
//! plain narration outputs). Change may only be inserted between groups, so
//! a payment is never separated from its data.
//!
//! Input selection, change and fee are left to the wallet's
//! [`TransactionFactory`]. Once the wallet reports where it put the change,
//! narration records are shifted past it and stored as `n_<position>`
//! metadata on the candidate.

use bitcoin::absolute::LockTime;
use bitcoin::{Amount, Network, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde_json::json;
use std::collections::BTreeMap;
use std::ops::Range;

use stealthpay_common::logging::{log_security, log_transaction, LogLevel};
use stealthpay_common::math::FeePolicy;
use stealthpay_common::types::{CoinControl, Recipient, SendError};

use crate::address::Destination;
use crate::narration;
use crate::script::{self, ScriptError};
use crate::stealth::{EphemeralKeyPair, SecretSource, StealthAddress};
use crate::wallet::{Coin, CreateTxError, ReservedKey, TransactionFactory};

/// Metadata key under which the narration of output `position` is stored
pub fn narration_key(position: usize) -> String {
    format!("n_{}", position)
}

/// Move narration records keyed by pre-change position past the change output
pub fn reconcile_narrations(
    narrations: &BTreeMap<usize, String>,
    change_position: Option<usize>,
) -> BTreeMap<usize, String> {
    narrations
        .iter()
        .map(|(&position, text)| match change_position {
            Some(change) if position >= change => (position + 1, text.clone()),
            _ => (position, text.clone()),
        })
        .collect()
}

/// Ordered outputs of a transaction, before change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputPlan {
    outputs: Vec<TxOut>,
    group_starts: Vec<usize>,
    narrations: BTreeMap<usize, String>,
}

impl OutputPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a group of outputs that must stay adjacent, returning the
    /// position of its first output
    pub fn push_group(&mut self, outputs: Vec<TxOut>) -> usize {
        let start = self.outputs.len();
        if !outputs.is_empty() {
            self.group_starts.push(start);
            self.outputs.extend(outputs);
        }
        start
    }

    /// Record the narration of the payment output at `position`
    pub fn attach_narration(&mut self, position: usize, narration: impl Into<String>) {
        self.narrations.insert(position, narration.into());
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn narrations(&self) -> &BTreeMap<usize, String> {
        &self.narrations
    }

    /// Sum of all output values
    pub fn total_value(&self) -> Amount {
        Amount::from_sat(self.outputs.iter().map(|o| o.value).sum())
    }

    /// Output ranges of the groups, in order
    pub fn groups(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.group_starts.iter().enumerate().map(move |(i, &start)| {
            let end = self
                .group_starts
                .get(i + 1)
                .copied()
                .unwrap_or(self.outputs.len());
            start..end
        })
    }

    /// Positions where a change output may be inserted
    pub fn change_positions(&self) -> Vec<usize> {
        let mut positions = self.group_starts.clone();
        positions.push(self.outputs.len());
        positions
    }

    pub fn is_legal_change_position(&self, position: usize) -> bool {
        position == self.outputs.len() || self.group_starts.contains(&position)
    }

    /// The first legal change position at or after `requested`
    pub fn snap_change_position(&self, requested: usize) -> usize {
        self.group_starts
            .iter()
            .copied()
            .find(|&start| start >= requested)
            .unwrap_or(self.outputs.len())
    }

    /// The plan's outputs with `change` inserted at `position`
    pub fn with_change(&self, position: usize, change: TxOut) -> Result<Vec<TxOut>, CreateTxError> {
        if !self.is_legal_change_position(position) {
            return Err(CreateTxError::InvalidChangePosition(position));
        }
        let mut outputs = self.outputs.clone();
        outputs.insert(position, change);
        Ok(outputs)
    }

    /// Whether `outputs` are this plan's outputs, with change at `change_position`
    fn matches(&self, outputs: &[TxOut], change_position: Option<usize>) -> Result<(), CreateTxError> {
        let without_change: Vec<&TxOut> = match change_position {
            Some(position) => {
                if !self.is_legal_change_position(position) {
                    return Err(CreateTxError::InvalidChangePosition(position));
                }
                if position >= outputs.len() {
                    return Err(CreateTxError::OutputMismatch);
                }
                outputs
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != position)
                    .map(|(_, o)| o)
                    .collect()
            }
            None => outputs.iter().collect(),
        };

        if without_change.len() != self.outputs.len()
            || without_change.iter().zip(&self.outputs).any(|(a, b)| *a != b)
        {
            return Err(CreateTxError::OutputMismatch);
        }
        Ok(())
    }
}

/// A funded, unsigned transaction waiting for fee confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateTransaction {
    pub inputs: Vec<Coin>,
    pub outputs: Vec<TxOut>,
    pub fee: Amount,
    pub change_position: Option<usize>,
    pub metadata: BTreeMap<String, String>,
}

impl CandidateTransaction {
    pub fn unsigned_transaction(&self) -> Transaction {
        Transaction {
            version: 1,
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|coin| TxIn {
                    previous_output: coin.outpoint,
                    script_sig: Default::default(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs.clone(),
        }
    }

    pub fn txid(&self) -> Txid {
        self.unsigned_transaction().txid()
    }

    pub fn input_value(&self) -> Amount {
        Amount::from_sat(self.inputs.iter().map(|c| c.value.to_sat()).sum())
    }

    pub fn output_value(&self) -> Amount {
        Amount::from_sat(self.outputs.iter().map(|o| o.value).sum())
    }

    pub fn change_output(&self) -> Option<&TxOut> {
        self.change_position.and_then(|pos| self.outputs.get(pos))
    }

    /// Narration recorded for the output at `position`
    pub fn narration(&self, position: usize) -> Option<&str> {
        self.metadata.get(&narration_key(position)).map(String::as_str)
    }
}

/// A recipient whose address has been validated and classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecipient {
    pub recipient: Recipient,
    pub destination: Destination,
}

impl ResolvedRecipient {
    pub fn amount(&self) -> Result<Amount, SendError> {
        self.recipient
            .amount
            .to_unsigned()
            .map_err(|_| SendError::InvalidAmount)
    }
}

impl From<ScriptError> for SendError {
    fn from(_: ScriptError) -> Self {
        SendError::Aborted
    }
}

/// Builds output plans and funds them through the wallet
pub struct TransactionBuilder<'s, S: SecretSource + ?Sized> {
    network: Network,
    secrets: &'s mut S,
}

impl<'s, S: SecretSource + ?Sized> TransactionBuilder<'s, S> {
    pub fn new(network: Network, secrets: &'s mut S) -> Self {
        Self { network, secrets }
    }

    /// Lay out the outputs for `recipients`, in order
    ///
    /// Stealth recipients run a fresh key agreement each; narrations are
    /// encrypted for them and attached in plain form for everyone else.
    pub fn plan(&mut self, recipients: &[ResolvedRecipient]) -> Result<OutputPlan, SendError> {
        let mut plan = OutputPlan::new();

        for resolved in recipients {
            narration::check_length(&resolved.recipient.narration)?;
            let amount = resolved.amount()?;

            match &resolved.destination {
                Destination::Stealth(address) => {
                    self.plan_stealth(&mut plan, &resolved.recipient, address, amount)?
                }
                Destination::Standard(address) => {
                    let payment = TxOut {
                        value: amount.to_sat(),
                        script_pubkey: address.script_pubkey(),
                    };
                    let mut group = vec![payment];
                    if resolved.recipient.has_narration() {
                        group.push(data_output(script::narration_tag_script()));
                        group.push(data_output(script::narration_script(
                            &resolved.recipient.narration,
                        )?));
                    }
                    let position = plan.push_group(group);
                    if resolved.recipient.has_narration() {
                        plan.attach_narration(position, resolved.recipient.narration.clone());
                    }
                }
            }
        }

        log_transaction(
            LogLevel::Debug,
            "Output plan built",
            Some(json!({
                "outputs": plan.len(),
                "groups": plan.change_positions().len() - 1,
                "narrations": plan.narrations().len(),
            })),
        );
        Ok(plan)
    }

    fn plan_stealth(
        &mut self,
        plan: &mut OutputPlan,
        recipient: &Recipient,
        address: &StealthAddress,
        amount: Amount,
    ) -> Result<(), SendError> {
        let pair = EphemeralKeyPair::generate(address, &mut *self.secrets).map_err(|e| {
            log_security(
                LogLevel::Error,
                "Stealth key agreement failed",
                Some(json!({ "error": e.to_string() })),
            );
            SendError::from(e)
        })?;

        let ciphertext = if recipient.has_narration() {
            Some(narration::encrypt(
                &recipient.narration,
                pair.shared_secret().expose_secret(),
                pair.ephemeral_pubkey(),
            )?)
        } else {
            None
        };

        let payment = TxOut {
            value: amount.to_sat(),
            script_pubkey: pair.destination(self.network).script_pubkey(),
        };
        let carrier = data_output(script::stealth_data_script(
            pair.ephemeral_pubkey(),
            ciphertext.as_deref(),
        )?);

        let position = plan.push_group(vec![payment, carrier]);
        if recipient.has_narration() {
            plan.attach_narration(position, recipient.narration.clone());
        }
        Ok(())
    }
}

fn data_output(script_pubkey: bitcoin::ScriptBuf) -> TxOut {
    TxOut {
        value: 0,
        script_pubkey,
    }
}

/// Fund `plan` through the wallet and attach narration metadata
///
/// Rejects candidates whose outputs differ from the plan or whose change
/// splits a group.
pub fn build_transaction<F>(
    factory: &mut F,
    plan: &OutputPlan,
    change_key: &ReservedKey,
    fee_policy: &FeePolicy,
    coin_control: Option<&CoinControl>,
) -> Result<CandidateTransaction, CreateTxError>
where
    F: TransactionFactory + ?Sized,
{
    if plan.is_empty() {
        return Err(CreateTxError::NoOutputs);
    }

    let mut candidate = factory.create_transaction(plan, change_key, fee_policy, coin_control)?;
    plan.matches(&candidate.outputs, candidate.change_position)?;

    for (position, text) in reconcile_narrations(plan.narrations(), candidate.change_position) {
        candidate.metadata.insert(narration_key(position), text);
    }

    log_transaction(
        LogLevel::Debug,
        "Candidate transaction created",
        Some(json!({
            "inputs": candidate.inputs.len(),
            "outputs": candidate.outputs.len(),
            "fee": candidate.fee.to_sat(),
            "change_position": candidate.change_position,
        })),
    );
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::ScriptBuf;

    fn out(value: u64) -> TxOut {
        TxOut {
            value,
            script_pubkey: ScriptBuf::new(),
        }
    }

    fn narrations(entries: &[(usize, &str)]) -> BTreeMap<usize, String> {
        entries.iter().map(|(p, t)| (*p, t.to_string())).collect()
    }

    #[test]
    fn narration_positions_shift_past_change() {
        let records = narrations(&[(0, "a"), (2, "b"), (4, "c")]);

        let table = [
            (None, vec![0, 2, 4]),
            (Some(0), vec![1, 3, 5]),
            (Some(2), vec![0, 3, 5]),
            (Some(3), vec![0, 2, 5]),
            (Some(6), vec![0, 2, 4]),
        ];
        for (change, expected) in table {
            let shifted: Vec<usize> = reconcile_narrations(&records, change).into_keys().collect();
            assert_eq!(shifted, expected, "change at {:?}", change);
        }
    }

    #[test]
    fn change_snaps_to_group_boundaries() {
        let mut plan = OutputPlan::new();
        plan.push_group(vec![out(1), out(0)]);
        plan.push_group(vec![out(2)]);
        plan.push_group(vec![out(3), out(0), out(0)]);

        assert_eq!(plan.change_positions(), vec![0, 2, 3, 6]);
        assert_eq!(plan.snap_change_position(1), 2);
        assert_eq!(plan.snap_change_position(4), 6);
        assert_eq!(plan.snap_change_position(99), 6);
        assert!(!plan.is_legal_change_position(5));
        assert_eq!(
            plan.with_change(1, out(9)),
            Err(CreateTxError::InvalidChangePosition(1))
        );
    }

    #[test]
    fn groups_cover_every_output() {
        let mut plan = OutputPlan::new();
        plan.push_group(vec![out(1), out(0)]);
        plan.push_group(vec![out(2)]);
        let groups: Vec<_> = plan.groups().collect();
        assert_eq!(groups, vec![0..2, 2..3]);
        assert_eq!(plan.total_value(), Amount::from_sat(3));
    }

    #[test]
    fn candidate_must_contain_the_plan() {
        let mut plan = OutputPlan::new();
        plan.push_group(vec![out(5), out(0)]);

        assert!(plan.matches(&[out(5), out(0), out(7)], Some(2)).is_ok());
        assert!(plan.matches(&[out(7), out(5), out(0)], Some(0)).is_ok());
        assert_eq!(
            plan.matches(&[out(5), out(7), out(0)], Some(1)),
            Err(CreateTxError::InvalidChangePosition(1))
        );
        assert_eq!(
            plan.matches(&[out(6), out(0)], None),
            Err(CreateTxError::OutputMismatch)
        );
    }
}
