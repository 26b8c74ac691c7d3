//! The send pipeline
//!
//! A send request moves through
//!
//! ```text
//! Validating -> Selecting -> Building -> AwaitingFeeConfirmation -> Committing -> Done
//! ```
//!
//! and any stage may end in `Failed`. Validation touches nothing. Selection
//! takes the wallet lock only for a moment. Everything from building to the
//! address-book updates runs inside one write session, with the change key
//! held by a guard that returns it to the pool unless the commit succeeded.
//! Events are published once the session has been released.

use bitcoin::{Amount, Network};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use stealthpay_common::config::Config;
use stealthpay_common::error::{config_error, StealthPayResult};
use stealthpay_common::events::{WalletEvent, WalletEventBus};
use stealthpay_common::logging::{log_security, log_transaction, sanitize_for_logging, LogLevel};
use stealthpay_common::math::FeePolicy;
use stealthpay_common::types::{
    AddressKind, ChangeType, CoinControl, Recipient, SendError, SendResult, MAX_MONEY,
};

use crate::address::{resolve_destination, Destination};
use crate::coin_selector;
use crate::confirm::FeeConfirmer;
use crate::narration;
use crate::session::{ChangeKeyGuard, WalletContext};
use crate::stealth::{OsSecretSource, SecretSource};
use crate::tx_builder::{build_transaction, ResolvedRecipient, TransactionBuilder};
use crate::wallet::{CoinFilter, WalletBackend};

/// Where a send request currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStage {
    Idle,
    Validating,
    Selecting,
    Building,
    AwaitingFeeConfirmation,
    Committing,
    Done,
    Failed(SendError),
}

impl SendStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SendStage::Done | SendStage::Failed(_))
    }
}

/// Recipients of one transaction, plus optional manual coin selection
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub recipients: Vec<Recipient>,
    pub coin_control: Option<CoinControl>,
}

impl SendRequest {
    pub fn new(recipients: Vec<Recipient>) -> Self {
        Self {
            recipients,
            coin_control: None,
        }
    }

    pub fn with_coin_control(mut self, coin_control: CoinControl) -> Self {
        self.coin_control = Some(coin_control);
        self
    }
}

/// Check every recipient and classify its destination
///
/// Fails on the first recipient that is invalid, in request order. An empty
/// request is treated as an invalid amount.
pub fn validate_recipients(
    recipients: &[Recipient],
    network: Network,
) -> Result<Vec<ResolvedRecipient>, SendError> {
    if recipients.is_empty() {
        return Err(SendError::InvalidAmount);
    }

    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(recipients.len());

    for recipient in recipients {
        let destination =
            resolve_destination(&recipient.address, network).ok_or(SendError::InvalidAddress)?;

        let amount = recipient.amount.to_sat();
        if amount <= 0 || amount as u64 > MAX_MONEY {
            return Err(SendError::InvalidAmount);
        }

        narration::check_length(&recipient.narration)?;

        if !seen.insert(recipient.address.as_str()) {
            return Err(SendError::DuplicateAddress);
        }

        let declared_stealth = recipient.kind == AddressKind::Stealth;
        if declared_stealth != destination.is_stealth() {
            log::warn!(
                "Recipient {} declared as {} but parsed as the other kind",
                sanitize_for_logging(&recipient.address),
                recipient.kind
            );
        }

        resolved.push(ResolvedRecipient {
            recipient: recipient.clone(),
            destination,
        });
    }
    Ok(resolved)
}

/// Sum of all payment amounts, bounded by the money supply
pub fn total_amount(recipients: &[ResolvedRecipient]) -> Result<Amount, SendError> {
    let mut total = Amount::ZERO;
    for recipient in recipients {
        total = total
            .checked_add(recipient.amount()?)
            .ok_or(SendError::InvalidAmount)?;
    }
    if total.to_sat() > MAX_MONEY {
        return Err(SendError::InvalidAmount);
    }
    Ok(total)
}

/// Turns send requests into committed transactions
pub struct SendPipeline<C, W> {
    context: Arc<WalletContext<C, W>>,
    fee_policy: FeePolicy,
    confirmer: Box<dyn FeeConfirmer + Send>,
    secrets: Box<dyn SecretSource + Send>,
    events: WalletEventBus,
    require_fee_confirmation: bool,
    stage: SendStage,
}

impl<C, W: WalletBackend> SendPipeline<C, W> {
    pub fn new(
        context: Arc<WalletContext<C, W>>,
        fee_policy: FeePolicy,
        confirmer: impl FeeConfirmer + Send + 'static,
    ) -> Self {
        Self {
            context,
            fee_policy,
            confirmer: Box::new(confirmer),
            secrets: Box::new(OsSecretSource),
            events: WalletEventBus::new(),
            require_fee_confirmation: true,
            stage: SendStage::Idle,
        }
    }

    /// Build a pipeline from loaded configuration
    ///
    /// The configuration must validate and its network must be the one the
    /// wallet runs on.
    pub fn from_config(
        context: Arc<WalletContext<C, W>>,
        config: &Config,
        confirmer: impl FeeConfirmer + Send + 'static,
    ) -> StealthPayResult<Self> {
        config.validate().map_err(|e| config_error(e.to_string()))?;
        let network = config
            .network()
            .map_err(|e| config_error(e.to_string()))?;
        if network != context.network() {
            return Err(config_error(format!(
                "Configured network {} does not match wallet network {}",
                network,
                context.network()
            )));
        }

        let mut pipeline = Self::new(context, config.fee_policy(), confirmer);
        pipeline.require_fee_confirmation = config.send.require_fee_confirmation;
        Ok(pipeline)
    }

    /// Use `secrets` for ephemeral stealth keys instead of the OS generator
    pub fn with_secret_source(mut self, secrets: impl SecretSource + Send + 'static) -> Self {
        self.secrets = Box::new(secrets);
        self
    }

    pub fn with_event_bus(mut self, events: WalletEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_fee_confirmation(mut self, required: bool) -> Self {
        self.require_fee_confirmation = required;
        self
    }

    pub fn stage(&self) -> SendStage {
        self.stage
    }

    pub fn events(&self) -> &WalletEventBus {
        &self.events
    }

    pub fn context(&self) -> &Arc<WalletContext<C, W>> {
        &self.context
    }

    pub fn fee_policy(&self) -> &FeePolicy {
        &self.fee_policy
    }

    /// Run one send request to completion
    ///
    /// Returns the committed transaction id or the single reason the request
    /// failed. On failure the wallet is left as it was.
    pub fn send(&mut self, request: &SendRequest) -> SendResult {
        let result = self.run(request);
        match &result {
            Ok(txid) => {
                self.stage = SendStage::Done;
                log_transaction(
                    LogLevel::Info,
                    "Send completed",
                    Some(json!({ "txid": txid.to_string() })),
                );
            }
            Err(err) => {
                self.stage = SendStage::Failed(*err);
                let level = if err.is_input_error() {
                    LogLevel::Debug
                } else {
                    LogLevel::Warn
                };
                log_transaction(level, "Send failed", Some(json!({ "error": err.to_string() })));
            }
        }
        result
    }

    fn run(&mut self, request: &SendRequest) -> SendResult {
        let network = self.context.network();

        self.stage = SendStage::Validating;
        let resolved = validate_recipients(&request.recipients, network)?;
        let total = total_amount(&resolved)?;

        self.stage = SendStage::Selecting;
        let filter = CoinFilter::spendable(request.coin_control.as_ref());
        {
            let wallet = self.context.lock_wallet();
            coin_selector::precheck(&*wallet, &filter, total, self.fee_policy.pay_tx_fee)?;
        }

        self.stage = SendStage::Building;
        let mut session = self.context.write_session();
        let mut guard = ChangeKeyGuard::reserve(session.wallet_mut())?;

        // Coins may have changed since the optimistic check
        let balance = coin_selector::balance(guard.wallet(), &filter);
        coin_selector::check_amount(total, balance)?;

        let plan = TransactionBuilder::new(network, &mut *self.secrets).plan(&resolved)?;
        let candidate = {
            let (wallet, change_key) = guard.parts();
            build_transaction(
                wallet,
                &plan,
                change_key,
                &self.fee_policy,
                request.coin_control.as_ref(),
            )
        }
        .map_err(|err| {
            log_transaction(
                LogLevel::Warn,
                "Transaction creation failed",
                Some(json!({ "error": err.to_string() })),
            );
            coin_selector::classify_creation_failure(&err, total, balance)
        })?;
        coin_selector::check_amount_with_fee(total, candidate.fee, balance)?;

        self.stage = SendStage::AwaitingFeeConfirmation;
        if self.require_fee_confirmation {
            let context = format!("Send {} to {} recipient(s)", total, resolved.len());
            if !self.confirmer.confirm_fee(candidate.fee, &context) {
                log_transaction(
                    LogLevel::Info,
                    "Fee declined",
                    Some(json!({ "fee": candidate.fee.to_sat() })),
                );
                return Err(SendError::Aborted);
            }
        }

        self.stage = SendStage::Committing;
        let txid = {
            let (wallet, change_key) = guard.parts();
            wallet.commit_transaction(&candidate, change_key)
        }
        .map_err(|err| {
            log_security(
                LogLevel::Error,
                "Commit failed",
                Some(json!({ "error": err.to_string() })),
            );
            SendError::from(err)
        })?;
        guard.keep();

        let wallet = guard.wallet_mut();
        let mut book_events = Vec::new();
        for item in &resolved {
            let address = item.recipient.address.as_str();
            let label = item.recipient.label.as_str();
            let status = match item.destination {
                Destination::Stealth(_) => wallet.update_stealth_label(address, label),
                Destination::Standard(_) => wallet.set_address_label(address, label),
            };
            if let Some(status) = status {
                book_events.push(WalletEvent::AddressBookChanged {
                    address: address.to_string(),
                    label: label.to_string(),
                    is_mine: wallet.is_mine(address),
                    status,
                });
            }
        }
        let transaction_count = wallet.transaction_count();

        drop(guard);
        drop(session);

        self.events.publish(WalletEvent::TransactionChanged {
            txid,
            status: ChangeType::New,
        });
        for event in book_events {
            self.events.publish(event);
        }
        self.events
            .publish(WalletEvent::NumTransactionsChanged(transaction_count));

        Ok(txid)
    }
}
