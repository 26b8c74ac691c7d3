use bitcoin::Amount;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stealthpay_common::events::WalletEventBus;
use stealthpay_common::types::SendError;
use stealthpay_core::wallet::BalanceSource;
use stealthpay_core::{BalancePoller, ChannelFeeConfirmer, PollOutcome, SendRequest, SendStage};

mod test_utils;
use test_utils::*;

#[test]
fn test_poller_skips_while_send_awaits_confirmation() {
    init_test_environment();
    let context = funded_context(&[1_000]);
    let (confirmer, requests) = ChannelFeeConfirmer::new();
    let mut pipeline = pipeline_with(&context, confirmer);
    let mut poller = BalancePoller::new(Arc::clone(&context), WalletEventBus::new());

    let address = standard_address(1);
    let sender = thread::spawn(move || {
        pipeline.send(&SendRequest::new(vec![pay(&address, 500)]))
    });

    let request = requests
        .recv_timeout(Duration::from_secs(10))
        .expect("fee request");
    assert_eq!(request.fee, Amount::from_sat(FLAT_FEE));

    // The send holds chain and wallet state until it finishes
    assert_eq!(poller.poll(), PollOutcome::Skipped);
    assert!(context.try_write_session().is_none());

    request.approve();
    assert!(sender.join().unwrap().is_ok());

    match poller.poll() {
        PollOutcome::BalanceChanged(balances) => {
            assert_eq!(balances.spendable, Amount::ZERO);
            assert_eq!(balances.unconfirmed, Amount::from_sat(490));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_concurrent_sends_serialize() {
    init_test_environment();
    let context = funded_context(&[1_000, 1_000, 1_000, 1_000]);

    let senders: Vec<_> = (0..4u8)
        .map(|i| {
            let mut pipeline = pipeline(&context);
            let address = standard_address(10 + i);
            thread::spawn(move || pipeline.send(&SendRequest::new(vec![pay(&address, 500)])))
        })
        .collect();

    for sender in senders {
        assert!(sender.join().unwrap().is_ok());
    }

    let wallet = context.lock_wallet();
    assert_eq!(wallet.transaction_count(), 4);
    assert_eq!(wallet.reserved_keys(), 0);
    assert_eq!(wallet.kept_keys().len(), 4);

    let mut spent: Vec<_> = wallet
        .transactions()
        .iter()
        .flat_map(|t| t.tx.input.iter().map(|i| i.previous_output))
        .collect();
    spent.sort();
    spent.dedup();
    assert_eq!(spent.len(), 4);
}

#[test]
fn test_poller_sees_a_send_without_a_new_block() {
    init_test_environment();
    let context = funded_context(&[1_000]);
    let bus = WalletEventBus::new();
    let mut poller = BalancePoller::new(Arc::clone(&context), bus.clone());
    let mut pipeline = pipeline(&context).with_event_bus(bus);

    assert!(matches!(poller.poll(), PollOutcome::BalanceChanged(_)));
    assert_eq!(poller.poll(), PollOutcome::Unchanged);

    pipeline
        .send(&SendRequest::new(vec![pay(&standard_address(1), 500)]))
        .unwrap();

    match poller.poll() {
        PollOutcome::BalanceChanged(balances) => {
            assert_eq!(balances.spendable, Amount::ZERO);
            assert_eq!(balances.unconfirmed, Amount::from_sat(490));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(context.lock_chain().height, 100);
}

#[test]
fn test_coins_spent_after_the_precheck_fail_inside_the_session() {
    init_test_environment();
    let context = funded_context(&[1_000]);
    // The precheck still sees the coin, the session no longer does
    context.lock_wallet().hide_coins_after(1);
    let mut pipeline = pipeline(&context);

    let result = pipeline.send(&SendRequest::new(vec![pay(&standard_address(1), 500)]));
    assert_eq!(result, Err(SendError::AmountExceedsBalance));
    assert_eq!(pipeline.stage(), SendStage::Failed(SendError::AmountExceedsBalance));

    let wallet = context.lock_wallet();
    assert_eq!(wallet.coin_list_calls(), 2);
    // A key was reserved, so the failure came after the session opened
    assert_eq!(wallet.returned_keys(), &[0]);
    assert_eq!(wallet.reserved_keys(), 0);
    assert_eq!(wallet.transaction_count(), 0);
}

#[test]
fn test_second_send_waits_for_the_first_and_finds_its_coin_spent() {
    init_test_environment();
    let context = funded_context(&[1_000]);
    let (confirmer, requests) = ChannelFeeConfirmer::new();
    let mut first = pipeline_with(&context, confirmer);
    let mut second = pipeline(&context);

    let first_send = thread::spawn(move || {
        first.send(&SendRequest::new(vec![pay(&standard_address(1), 900)]))
    });
    let request = requests.recv_timeout(Duration::from_secs(10)).unwrap();

    // The second send waits for the wallet until the first one is done, and by
    // then the only coin is spent
    let second_send =
        thread::spawn(move || second.send(&SendRequest::new(vec![pay(&standard_address(2), 900)])));
    thread::sleep(Duration::from_millis(50));
    request.approve();

    assert!(first_send.join().unwrap().is_ok());
    assert_eq!(
        second_send.join().unwrap(),
        Err(SendError::AmountExceedsBalance)
    );
    assert_eq!(context.lock_wallet().transaction_count(), 1);
}
