mod common;

use bytes::Bytes;
use common::{
    append_private, chat, delivery_harness, fast_options, wait_until, AckMode, ByInstance,
    RecordingLog, ScriptedPush, INSTANCE,
};
use std::sync::Arc;
use std::time::Duration;
use switchboard::coord::{AckOutcome, CoordinationStore, MemoryCoordinator};
use switchboard::delivery::{DeliveryPump, Dispatcher, OnlineObjectTracker, PumpContext};
use switchboard::gateway::PushService;
use switchboard::ops::metrics::SwitchboardMetrics;
use switchboard::mailbox::{Envelope, LogPosition, MailboxId, MailboxLog, MemoryLog};
use tokio_util::sync::CancellationToken;

async fn cursor_offset(coord: &MemoryCoordinator, mailbox: MailboxId) -> Option<u64> {
    coord
        .cursor(mailbox)
        .await
        .unwrap()
        .map(|position| position.offset)
}

#[tokio::test]
async fn pump_resumes_just_past_committed_cursor() {
    let log = MemoryLog::new();
    let mailbox = MailboxId::user(5);
    for i in 0..43 {
        append_private(&log, 5, &format!("m-{i}")).await;
    }
    let h = delivery_harness(
        MemoryCoordinator::new(),
        Arc::new(log.clone()),
        AckMode::Deliver,
        fast_options(Duration::from_secs(5)),
    );
    h.coord
        .commit_cursor(mailbox, &LogPosition::new(mailbox.topic(), 0, 41))
        .await
        .unwrap();
    h.coord.mark_online(5, INSTANCE, &[]).await.unwrap();

    let pump = DeliveryPump::spawn(mailbox, h.ctx.clone());
    let coord = &h.coord;
    wait_until("cursor at 42", || async move {
        cursor_offset(coord, mailbox).await == Some(42)
    })
    .await;
    assert_eq!(h.push.offsets(mailbox), vec![42]);

    pump.teardown();
    pump.join().await;
    assert_eq!(log.open_readers(), 0);
}

#[tokio::test]
async fn unconfirmed_record_is_redelivered_and_cursor_holds() {
    let log = MemoryLog::new();
    let mailbox = MailboxId::user(8);
    append_private(&log, 8, "m-0").await;
    let h = delivery_harness(
        MemoryCoordinator::new(),
        Arc::new(log.clone()),
        AckMode::Silent,
        fast_options(Duration::from_millis(100)),
    );
    h.coord.mark_online(8, INSTANCE, &[]).await.unwrap();

    let pump = DeliveryPump::spawn(mailbox, h.ctx.clone());
    let push = &h.push;
    wait_until("a second attempt", || async move {
        push.offsets(mailbox).len() >= 2
    })
    .await;
    assert!(h.push.offsets(mailbox).iter().all(|offset| *offset == 0));
    assert_eq!(cursor_offset(&h.coord, mailbox).await, None);
    assert!(h.metrics.snapshot().deliveries_timed_out_total >= 1);

    h.push.set_mode(AckMode::Deliver);
    let coord = &h.coord;
    wait_until("cursor at 0", || async move {
        cursor_offset(coord, mailbox).await == Some(0)
    })
    .await;

    pump.teardown();
    pump.join().await;
}

#[tokio::test]
async fn failed_write_is_redelivered_immediately() {
    let log = MemoryLog::new();
    let mailbox = MailboxId::user(4);
    append_private(&log, 4, "m-0").await;
    let h = delivery_harness(
        MemoryCoordinator::new(),
        Arc::new(log),
        AckMode::Fail,
        fast_options(Duration::from_secs(30)),
    );
    h.coord.mark_online(4, INSTANCE, &[]).await.unwrap();

    let pump = DeliveryPump::spawn(mailbox, h.ctx.clone());
    let push = &h.push;
    wait_until("three failed attempts", || async move {
        push.offsets(mailbox).len() >= 3
    })
    .await;
    assert_eq!(cursor_offset(&h.coord, mailbox).await, None);

    h.push.set_mode(AckMode::Deliver);
    let coord = &h.coord;
    wait_until("cursor at 0", || async move {
        cursor_offset(coord, mailbox).await == Some(0)
    })
    .await;
    assert!(h.metrics.snapshot().pump_reinit_total >= 2);

    pump.teardown();
    pump.join().await;
}

#[tokio::test]
async fn next_record_is_fetched_only_after_confirmation() {
    let log = RecordingLog::new(MemoryLog::new());
    let mailbox = MailboxId::user(2);
    let mut positions = Vec::new();
    for i in 0..3 {
        positions.push(append_private(&log, 2, &format!("m-{i}")).await);
    }
    let h = delivery_harness(
        MemoryCoordinator::new(),
        Arc::new(log.clone()),
        AckMode::Silent,
        fast_options(Duration::from_secs(30)),
    );
    h.coord.mark_online(2, INSTANCE, &[]).await.unwrap();
    let pump = DeliveryPump::spawn(mailbox, h.ctx.clone());
    let push = &h.push;

    for (index, position) in positions.iter().enumerate() {
        wait_until("the next push", || async move {
            push.offsets(mailbox).len() > index
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let expected: Vec<u64> = (0..=index as u64).collect();
        assert_eq!(log.fetched(), expected, "fetched ahead of confirmation");
        assert_eq!(h.push.offsets(mailbox), expected);
        h.coord
            .acknowledge(mailbox, position, AckOutcome::Delivered)
            .await
            .unwrap();
    }

    let coord = &h.coord;
    wait_until("cursor at 2", || async move {
        cursor_offset(coord, mailbox).await == Some(2)
    })
    .await;
    pump.teardown();
    pump.join().await;
}

#[tokio::test]
async fn competing_pumps_deliver_each_record_once() {
    let log = MemoryLog::new();
    let mailbox = MailboxId::user(11);
    for i in 0..5 {
        append_private(&log, 11, &format!("m-{i}")).await;
    }
    let h = delivery_harness(
        MemoryCoordinator::new().with_lock_delay(Duration::from_millis(2)),
        Arc::new(log),
        AckMode::Deliver,
        fast_options(Duration::from_secs(5)),
    );
    h.coord.mark_online(11, INSTANCE, &[]).await.unwrap();

    let first = DeliveryPump::spawn(mailbox, h.ctx.clone());
    let second = DeliveryPump::spawn(mailbox, h.ctx.clone());
    let coord = &h.coord;
    wait_until("cursor at 4", || async move {
        cursor_offset(coord, mailbox).await == Some(4)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.push.offsets(mailbox), vec![0, 1, 2, 3, 4]);
    for pump in [first, second] {
        pump.teardown();
        pump.join().await;
    }
    assert_eq!(h.coord.lock_holder(&mailbox.lock_key()), None);
}

#[tokio::test]
async fn undeliverable_records_are_committed_past() {
    let log = MemoryLog::new();
    let mailbox = MailboxId::user(6);
    log.append(mailbox, Bytes::from_static(b"not json"))
        .await
        .unwrap();
    let misfiled = Envelope::GroupMessage(chat("g-1", 1, 7, "wrong mailbox"));
    log.append(mailbox, misfiled.encode().unwrap())
        .await
        .unwrap();
    append_private(&log, 6, "m-2").await;
    let h = delivery_harness(
        MemoryCoordinator::new(),
        Arc::new(log),
        AckMode::Deliver,
        fast_options(Duration::from_secs(5)),
    );
    h.coord.mark_online(6, INSTANCE, &[]).await.unwrap();

    let pump = DeliveryPump::spawn(mailbox, h.ctx.clone());
    let coord = &h.coord;
    wait_until("cursor at 2", || async move {
        cursor_offset(coord, mailbox).await == Some(2)
    })
    .await;
    assert_eq!(h.push.offsets(mailbox), vec![2]);
    assert_eq!(h.metrics.snapshot().deliveries_skipped_total, 2);

    pump.teardown();
    pump.join().await;
}

#[tokio::test]
async fn offline_recipient_is_retried_until_online() {
    let log = MemoryLog::new();
    let mailbox = MailboxId::user(12);
    append_private(&log, 12, "m-0").await;
    let h = delivery_harness(
        MemoryCoordinator::new(),
        Arc::new(log),
        AckMode::Deliver,
        fast_options(Duration::from_secs(5)),
    );

    let pump = DeliveryPump::spawn(mailbox, h.ctx.clone());
    let metrics = &h.metrics;
    wait_until("an unresolved attempt", || async move {
        metrics.snapshot().unresolved_recipients_total >= 1
    })
    .await;
    assert_eq!(cursor_offset(&h.coord, mailbox).await, None);
    assert!(h.push.pushes().is_empty());

    h.coord.mark_online(12, INSTANCE, &[]).await.unwrap();
    let coord = &h.coord;
    wait_until("cursor at 0", || async move {
        cursor_offset(coord, mailbox).await == Some(0)
    })
    .await;

    pump.teardown();
    pump.join().await;
}

#[tokio::test]
async fn group_record_reaches_hosting_instance_once() {
    let log = MemoryLog::new();
    let group = MailboxId::group(7);
    let message = Envelope::GroupMessage(chat("g-1", 1, 7, "hello group"));
    log.append(group, message.encode().unwrap()).await.unwrap();
    let h = delivery_harness(
        MemoryCoordinator::new(),
        Arc::new(log),
        AckMode::Deliver,
        fast_options(Duration::from_secs(5)),
    );
    h.coord.mark_online(1, INSTANCE, &[7]).await.unwrap();
    h.coord.mark_online(2, INSTANCE, &[7]).await.unwrap();

    let pump = DeliveryPump::spawn(group, h.ctx.clone());
    let coord = &h.coord;
    wait_until("group cursor at 0", || async move {
        cursor_offset(coord, group).await == Some(0)
    })
    .await;
    assert_eq!(h.push.offsets(group), vec![0]);

    pump.teardown();
    pump.join().await;
}

#[tokio::test]
async fn group_record_confirmed_by_one_instance_despite_a_failing_member() {
    let log = MemoryLog::new();
    let group = MailboxId::group(7);
    let message = Envelope::GroupMessage(chat("g-1", 1, 7, "hello group"));
    log.append(group, message.encode().unwrap()).await.unwrap();

    let coord = Arc::new(MemoryCoordinator::new());
    let healthy = ScriptedPush::new(coord.clone(), AckMode::Deliver);
    let failing = ScriptedPush::new(coord.clone(), AckMode::Fail);
    let healthy_service: Arc<dyn PushService> = healthy.clone();
    let failing_service: Arc<dyn PushService> = failing.clone();
    let metrics = Arc::new(SwitchboardMetrics::default());
    let dispatcher = Arc::new(Dispatcher::new(
        coord.clone(),
        Arc::new(ByInstance(vec![
            ("ws-a", healthy_service),
            ("ws-b", failing_service),
        ])),
        metrics.clone(),
    ));
    let ctx = Arc::new(PumpContext {
        log: Arc::new(log),
        coord: coord.clone(),
        dispatcher,
        metrics: metrics.clone(),
        options: fast_options(Duration::from_secs(5)),
    });
    coord.mark_online(1, "ws-a", &[7]).await.unwrap();
    coord.mark_online(2, "ws-b", &[7]).await.unwrap();

    let pump = DeliveryPump::spawn(group, ctx);
    let c = &coord;
    wait_until("group cursor at 0", || async move {
        cursor_offset(c, group).await == Some(0)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(healthy.offsets(group), vec![0]);
    assert_eq!(failing.offsets(group), vec![0]);
    assert_eq!(metrics.snapshot().pump_reinit_total, 0);

    pump.teardown();
    pump.join().await;
}

// -----------------------------------------------------------------------------
// Online object tracker
// -----------------------------------------------------------------------------

#[tokio::test]
async fn tracker_follows_the_online_set() {
    let log = MemoryLog::new();
    let h = delivery_harness(
        MemoryCoordinator::new(),
        Arc::new(log.clone()),
        AckMode::Deliver,
        fast_options(Duration::from_secs(5)),
    );
    let mut tracker = OnlineObjectTracker::new(h.ctx.clone(), Duration::from_secs(5));

    h.coord.mark_online(1, INSTANCE, &[7]).await.unwrap();
    let report = tracker.reconcile().await.unwrap();
    assert_eq!(
        report.started,
        vec![MailboxId::user(1), MailboxId::group(7)]
    );
    assert!(tracker.reconcile().await.unwrap().is_empty());

    h.coord.mark_offline(1, &[7]).await.unwrap();
    let mut report = tracker.reconcile().await.unwrap();
    report.stopped.sort();
    assert_eq!(
        report.stopped,
        vec![MailboxId::user(1), MailboxId::group(7)]
    );
    assert!(tracker.active().is_empty());
    assert_eq!(tracker.retiring_len(), 2);

    h.coord.mark_online(1, INSTANCE, &[]).await.unwrap();
    let report = tracker.reconcile().await.unwrap();
    assert_eq!(report.started, vec![MailboxId::user(1)]);
    assert!(tracker.retiring_len() <= 1);

    tracker.shutdown().await;
    assert!(tracker.active().is_empty());
    assert_eq!(tracker.retiring_len(), 0);
    assert_eq!(log.open_readers(), 0);
    assert_eq!(h.metrics.snapshot().pumps_active, 0);
}

#[tokio::test]
async fn failed_snapshot_keeps_existing_pumps() {
    let h = delivery_harness(
        MemoryCoordinator::new(),
        Arc::new(MemoryLog::new()),
        AckMode::Deliver,
        fast_options(Duration::from_secs(5)),
    );
    let mut tracker = OnlineObjectTracker::new(h.ctx.clone(), Duration::from_secs(5));
    h.coord.mark_online(3, INSTANCE, &[]).await.unwrap();
    tracker.reconcile().await.unwrap();

    h.coord.set_unavailable(true);
    assert!(tracker.reconcile().await.is_err());
    assert_eq!(tracker.active(), vec![MailboxId::user(3)]);

    h.coord.set_unavailable(false);
    assert!(tracker.reconcile().await.unwrap().is_empty());
    tracker.shutdown().await;
}

#[tokio::test]
async fn running_tracker_delivers_and_drains_on_cancel() {
    let log = MemoryLog::new();
    let mailbox = MailboxId::user(21);
    append_private(&log, 21, "m-0").await;
    let h = delivery_harness(
        MemoryCoordinator::new(),
        Arc::new(log.clone()),
        AckMode::Deliver,
        fast_options(Duration::from_secs(5)),
    );
    h.coord.mark_online(21, INSTANCE, &[]).await.unwrap();

    let tracker = OnlineObjectTracker::new(h.ctx.clone(), Duration::from_millis(20));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(tracker.run(cancel.clone()));
    let coord = &h.coord;
    wait_until("cursor at 0", || async move {
        cursor_offset(coord, mailbox).await == Some(0)
    })
    .await;
    assert_eq!(h.metrics.snapshot().pumps_active, 1);

    cancel.cancel();
    task.await.unwrap();
    assert_eq!(h.metrics.snapshot().pumps_active, 0);
    assert_eq!(log.open_readers(), 0);
}
