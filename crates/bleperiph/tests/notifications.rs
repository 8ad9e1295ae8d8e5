//! Notification fan-out through the manager: targets, flow control and purges


use bleperiph::native::simulated::SentValue;
use bleperiph::{
    CentralId, DeliveryFailure, DeliveryStatus, EventFilter, EventKind, NativeError, NotifyError,
    NotifyTarget, PeripheralConfig, PeripheralEvent, SendOutcome,
};
use test_utils::*;

fn id(central: &str) -> CentralId {
    central.into()
}

#[tokio::test]
async fn test_max_update_len_is_enforced_per_central() {
    let (stack, handle) = start();
    publish_demo(&handle).await;
    stack.subscribe("central-a", C2, 20);
    stack.subscribe("central-b", C2, 512);

    let report = handle
        .notify(C2, vec![0x42; 30], NotifyTarget::AllSubscribed)
        .await
        .unwrap();

    assert_eq!(report.target_count(), 2);
    assert_eq!(
        report.status_for(&id("central-a")),
        Some(&DeliveryStatus::PayloadTooLarge { len: 30, max: 20 })
    );
    assert_eq!(
        report.status_for(&id("central-b")),
        Some(&DeliveryStatus::Delivered)
    );
    assert_eq!(
        stack.sent_values(),
        vec![SentValue {
            central: id("central-b"),
            characteristic: C2,
            value: vec![0x42; 30],
        }]
    );
}

#[tokio::test]
async fn test_notify_caches_the_value_for_reads() {
    let (stack, handle) = start();
    publish_demo(&handle).await;

    let report = handle
        .notify(C2, b"latest".to_vec(), NotifyTarget::AllSubscribed)
        .await
        .unwrap();
    assert_eq!(report.target_count(), 0);

    let request = stack.read("central-a", C2, 0);
    assert_eq!(
        stack.until_response(request).await,
        bleperiph::AttResponse::Value(b"latest".to_vec())
    );
}

#[tokio::test]
async fn test_would_block_queues_until_ready() {
    let (stack, handle) = start();
    publish_demo(&handle).await;
    stack.subscribe("central-a", C2, 185);
    let mut events = handle.subscribe(EventFilter::only([EventKind::Notification]));

    stack.push_send_outcome(SendOutcome::WouldBlock);
    let first = handle
        .notify(C2, b"one".to_vec(), NotifyTarget::AllSubscribed)
        .await
        .unwrap();
    let second = handle
        .notify(C2, b"two".to_vec(), NotifyTarget::AllSubscribed)
        .await
        .unwrap();
    assert_eq!(first.queued_count(), 1);
    assert_eq!(second.queued_count(), 1);
    assert_ne!(first.notification, second.notification);
    assert_eq!(handle.info().await.unwrap().pending_notifications, 2);

    stack.ready_to_send_more();

    for expected in [first.notification, second.notification] {
        match next_event(&mut events).await {
            PeripheralEvent::NotificationDelivered {
                notification,
                central,
                characteristic,
            } => {
                assert_eq!(notification, expected);
                assert_eq!(central, id("central-a"));
                assert_eq!(characteristic, C2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    let values: Vec<Vec<u8>> = stack
        .sent_values()
        .into_iter()
        .map(|sent| sent.value)
        .collect();
    assert_eq!(values, vec![b"one".to_vec(), b"two".to_vec()]);
    assert_eq!(handle.info().await.unwrap().pending_notifications, 0);
}

#[tokio::test]
async fn test_queue_depth_is_bounded() {
    let config = PeripheralConfig::new().with_max_queue_depth(2);
    let (stack, handle) = start_with(config);
    publish_demo(&handle).await;
    stack.subscribe("central-a", C2, 185);
    stack.push_send_outcome(SendOutcome::WouldBlock);

    let mut statuses = Vec::new();
    for payload in [b"1", b"2", b"3"] {
        let report = handle
            .notify(C2, payload.to_vec(), NotifyTarget::AllSubscribed)
            .await
            .unwrap();
        statuses.push(report.status_for(&id("central-a")).cloned());
    }

    assert_eq!(
        statuses,
        vec![
            Some(DeliveryStatus::Queued),
            Some(DeliveryStatus::Queued),
            Some(DeliveryStatus::WouldBlockExceeded { depth: 2 }),
        ]
    );
}

#[tokio::test]
async fn test_native_send_failure_is_reported() {
    let (stack, handle) = start();
    publish_demo(&handle).await;
    stack.subscribe("central-a", C2, 185);
    let failure = NativeError::new("link lost");
    stack.push_send_outcome(SendOutcome::Failed(failure.clone()));

    let report = handle
        .notify(C2, b"x".to_vec(), NotifyTarget::AllSubscribed)
        .await
        .unwrap();
    assert_eq!(
        report.status_for(&id("central-a")),
        Some(&DeliveryStatus::Failed(failure))
    );
    assert_eq!(report.rejected_count(), 1);
}

#[tokio::test]
async fn test_disconnect_purges_queue() {
    let (stack, handle) = start();
    publish_demo(&handle).await;
    stack.subscribe("central-a", C2, 185);

    stack.push_send_outcome(SendOutcome::WouldBlock);
    for payload in [b"1", b"2", b"3"] {
        handle
            .notify(C2, payload.to_vec(), NotifyTarget::AllSubscribed)
            .await
            .unwrap();
    }

    let mut events = handle.subscribe(EventFilter::All);
    stack.disconnect("central-a");

    for _ in 0..3 {
        assert!(matches!(
            next_event(&mut events).await,
            PeripheralEvent::NotificationFailed {
                reason: DeliveryFailure::Disconnected,
                ..
            }
        ));
    }
    assert_eq!(
        next_event(&mut events).await,
        PeripheralEvent::CentralDisconnected {
            central: id("central-a"),
            purged: 3
        }
    );

    assert!(handle.subscribers(C2).await.unwrap().is_empty());
    assert!(handle.connected().await.unwrap().is_empty());
    assert_eq!(handle.info().await.unwrap().pending_notifications, 0);

    // A later disconnect for the same central is ignored
    stack.disconnect("central-a");
    handle.info().await.unwrap();
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn test_unsubscribe_purges_that_characteristic() {
    let (stack, handle) = start();
    publish_demo(&handle).await;
    stack.subscribe("central-a", C2, 185);
    stack.push_send_outcome(SendOutcome::WouldBlock);
    handle
        .notify(C2, b"held".to_vec(), NotifyTarget::AllSubscribed)
        .await
        .unwrap();

    let mut events = handle.subscribe(EventFilter::only([
        EventKind::Notification,
        EventKind::Subscription,
    ]));
    stack.unsubscribe("central-a", C2);

    assert!(matches!(
        next_event(&mut events).await,
        PeripheralEvent::NotificationFailed {
            reason: DeliveryFailure::NotSubscribed,
            ..
        }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        PeripheralEvent::SubscriptionChanged { enabled: false, .. }
    ));

    // Still connected, just no longer a subscriber
    assert_eq!(handle.connected().await.unwrap().len(), 1);
    assert!(handle.subscribers(C2).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unpublish_fails_queued_notifications() {
    let (stack, handle) = start();
    publish_demo(&handle).await;
    stack.subscribe("central-a", C2, 185);
    stack.push_send_outcome(SendOutcome::WouldBlock);
    handle
        .notify(C2, b"held".to_vec(), NotifyTarget::AllSubscribed)
        .await
        .unwrap();
    let mut events = handle.subscribe(EventFilter::only([EventKind::Notification]));

    handle.unpublish(S1).await.unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        PeripheralEvent::NotificationFailed {
            reason: DeliveryFailure::Unpublished,
            ..
        }
    ));
    assert!(handle.subscribers(C2).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_all_connected_reports_unsubscribed_centrals() {
    let (stack, handle) = start();
    publish_demo(&handle).await;
    stack.subscribe("central-a", C2, 185);
    stack.connect("central-b", 100);

    let subscribed = handle
        .notify(C2, b"x".to_vec(), NotifyTarget::AllSubscribed)
        .await
        .unwrap();
    assert_eq!(subscribed.target_count(), 1);

    let connected = handle
        .notify(C2, b"x".to_vec(), NotifyTarget::AllConnected)
        .await
        .unwrap();
    assert_eq!(connected.target_count(), 2);
    assert_eq!(
        connected.status_for(&id("central-a")),
        Some(&DeliveryStatus::Delivered)
    );
    assert_eq!(
        connected.status_for(&id("central-b")),
        Some(&DeliveryStatus::NotSubscribed)
    );
}

#[tokio::test]
async fn test_single_central_target() {
    let (stack, handle) = start();
    publish_demo(&handle).await;
    stack.subscribe("central-a", C2, 185);
    stack.connect("central-b", 100);

    let report = handle
        .notify(C2, b"x".to_vec(), NotifyTarget::Central(id("ghost")))
        .await
        .unwrap();
    assert_eq!(
        report.status_for(&id("ghost")),
        Some(&DeliveryStatus::Disconnected)
    );

    let report = handle
        .notify(C2, b"x".to_vec(), NotifyTarget::Central(id("central-b")))
        .await
        .unwrap();
    assert_eq!(
        report.status_for(&id("central-b")),
        Some(&DeliveryStatus::NotSubscribed)
    );

    let report = handle
        .notify(C2, b"x".to_vec(), NotifyTarget::Central(id("central-a")))
        .await
        .unwrap();
    assert_eq!(report.delivered_count(), 1);
}

#[tokio::test]
async fn test_notify_rejects_bad_characteristics() {
    let (_stack, handle) = start();
    handle.define(demo_service()).await.unwrap();
    handle.define(second_service()).await.unwrap();
    handle.publish(S1).await.unwrap();

    let unknown = short(0xFFFF);
    assert_eq!(
        handle
            .notify(unknown, b"x".to_vec(), NotifyTarget::AllSubscribed)
            .await,
        Err(NotifyError::UnknownCharacteristic {
            characteristic: unknown
        })
    );
    assert_eq!(
        handle
            .notify(C1, b"x".to_vec(), NotifyTarget::AllSubscribed)
            .await,
        Err(NotifyError::NotNotifiable { characteristic: C1 })
    );
    assert_eq!(
        handle
            .notify(C3, b"x".to_vec(), NotifyTarget::AllSubscribed)
            .await,
        Err(NotifyError::NotPublished { characteristic: C3 })
    );
    assert_eq!(
        handle
            .notify(C2, vec![0; 513], NotifyTarget::AllSubscribed)
            .await,
        Err(NotifyError::PayloadTooLarge { len: 513, max: 512 })
    );
}

fn short(value: u16) -> uuid::Uuid {
    bleperiph::short_uuid(value)
}
