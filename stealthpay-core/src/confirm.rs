//! Fee confirmation
//!
//! After the wallet has computed the real fee, the pipeline asks a
//! [`FeeConfirmer`] whether to go ahead. Declining is the only way to cancel
//! a send once it has started.

use bitcoin::Amount;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde_json::json;

use stealthpay_common::logging::{log_transaction, LogLevel};

/// Authority that approves or declines the fee of a candidate transaction
pub trait FeeConfirmer {
    /// `context` is a short human-readable description of the payment
    fn confirm_fee(&mut self, fee: Amount, context: &str) -> bool;
}

impl<F> FeeConfirmer for F
where
    F: FnMut(Amount, &str) -> bool,
{
    fn confirm_fee(&mut self, fee: Amount, context: &str) -> bool {
        self(fee, context)
    }
}

/// Approves every fee
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl FeeConfirmer for AutoApprove {
    fn confirm_fee(&mut self, _fee: Amount, _context: &str) -> bool {
        true
    }
}

/// Declines every fee
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysDecline;

impl FeeConfirmer for AlwaysDecline {
    fn confirm_fee(&mut self, _fee: Amount, _context: &str) -> bool {
        false
    }
}

/// Approves fees up to `threshold` and asks `inner` about anything larger
#[derive(Debug, Clone)]
pub struct ThresholdFeeConfirmer<C> {
    pub threshold: Amount,
    pub inner: C,
}

impl<C: FeeConfirmer> ThresholdFeeConfirmer<C> {
    pub fn new(threshold: Amount, inner: C) -> Self {
        Self { threshold, inner }
    }
}

impl<C: FeeConfirmer> FeeConfirmer for ThresholdFeeConfirmer<C> {
    fn confirm_fee(&mut self, fee: Amount, context: &str) -> bool {
        if fee <= self.threshold {
            return true;
        }
        self.inner.confirm_fee(fee, context)
    }
}

/// A fee question waiting for an answer from another thread
#[derive(Debug)]
pub struct FeeRequest {
    pub fee: Amount,
    pub context: String,
    reply: Sender<bool>,
}

impl FeeRequest {
    pub fn approve(self) {
        self.answer(true);
    }

    pub fn decline(self) {
        self.answer(false);
    }

    pub fn answer(self, approved: bool) {
        // The asking side may have given up already
        let _ = self.reply.send(approved);
    }
}

/// Forwards fee questions over a channel and blocks until they are answered
///
/// A request that is dropped without an answer, or a receiver that went
/// away, counts as a decline.
#[derive(Debug, Clone)]
pub struct ChannelFeeConfirmer {
    requests: Sender<FeeRequest>,
}

impl ChannelFeeConfirmer {
    /// A confirmer and the receiving end the presentation layer listens on
    pub fn new() -> (Self, Receiver<FeeRequest>) {
        let (requests, receiver) = crossbeam_channel::unbounded();
        (Self { requests }, receiver)
    }
}

impl FeeConfirmer for ChannelFeeConfirmer {
    fn confirm_fee(&mut self, fee: Amount, context: &str) -> bool {
        let (reply, answer) = bounded(1);
        let request = FeeRequest {
            fee,
            context: context.to_string(),
            reply,
        };

        if self.requests.send(request).is_err() {
            log_transaction(LogLevel::Warn, "No one is listening for fee requests", None);
            return false;
        }

        let approved = answer.recv().unwrap_or(false);
        log_transaction(
            LogLevel::Debug,
            "Fee request answered",
            Some(json!({ "fee": fee.to_sat(), "approved": approved })),
        );
        approved
    }
}
