mod common;

use ble_request_queue::{
    Capabilities, ConnectionEventKind, ConnectionState, DisconnectReason, Error, StackFailure,
    WriteMode,
};
use bytes::Bytes;
use common::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_connect_then_read_rssi() {
    let mut h = Harness::new();
    let (connect_done, connected) = capture();
    let (rssi_done, rssi) = capture();
    h.session.enqueue_connect(vec![SVC_A, SVC_B], connect_done);
    h.session.enqueue_read_rssi(rssi_done);

    assert_eq!(h.next_call().await, Call::Connect);
    assert_eq!(h.session.connection_state(), ConnectionState::Connecting);
    h.sink().connected();
    assert_eq!(h.next_call().await, Call::DiscoverServices(vec![SVC_A, SVC_B]));
    h.sink().services_discovered(Ok(vec![SVC_A, SVC_B]));
    assert_eq!(h.next_call().await, Call::DiscoverCharacteristics(SVC_A));
    assert_eq!(h.next_call().await, Call::DiscoverCharacteristics(SVC_B));

    let notifiable = characteristic(Capabilities {
        notifiable: true,
        ..Default::default()
    });
    h.sink()
        .characteristics_discovered(SVC_A, Ok(vec![notifiable]));
    h.sink().characteristics_discovered(SVC_B, Ok(Vec::new()));

    assert_eq!(resolved(connected).await, Ok(()));
    assert_eq!(h.next_call().await, Call::ReadRssi);
    h.sink().rssi_read(Ok(-45));
    assert_eq!(resolved(rssi).await, Ok(-45));

    assert!(h.session.is_connected());
    assert_eq!(h.session.last_rssi(), Some(-45));
    assert_eq!(h.session.services(), vec![SVC_A, SVC_B]);
    assert_eq!(h.session.characteristic(&SVC_A, &CHR), Some(notifiable));
    assert!(h.session.characteristics(&SVC_B).is_empty());
}

#[tokio::test]
async fn test_cancel_before_link_issues_no_disconnect() {
    let mut h = Harness::new();
    let (done, connected) = capture();
    h.session.enqueue_connect(Vec::new(), done);
    assert_eq!(h.next_call().await, Call::Connect);

    h.session.cancel_queue();
    assert_eq!(resolved(connected).await, Err(Error::Canceled));
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        h.session.last_disconnect_reason(),
        Some(DisconnectReason::Canceled)
    );
    assert_eq!(h.radio.log(), vec![Call::Connect]);

    // The canceled attempt completing late leaves a link to release.
    h.sink().connected();
    assert_eq!(h.next_call().await, Call::Disconnect);
}

#[tokio::test]
async fn test_write_mode_not_supported_is_rejected() {
    let mut h = Harness::new();
    let target = characteristic(Capabilities {
        writable_no_ack: true,
        ..Default::default()
    });
    h.connect_ready(vec![target]).await;

    let (done, written) = capture();
    h.session
        .enqueue_write_characteristic(target, vec![0x01, 0x02], true, done);
    let (rssi_done, rssi) = capture();
    h.session.enqueue_read_rssi(rssi_done);

    assert!(matches!(
        resolved(written).await,
        Err(Error::InvalidParameters { .. })
    ));
    // The queue moves on to the next request.
    assert_eq!(h.next_call().await, Call::ReadRssi);
    h.sink().rssi_read(Ok(-70));
    assert_eq!(resolved(rssi).await, Ok(-70));
    assert!(!h
        .radio
        .log()
        .iter()
        .any(|c| matches!(c, Call::WriteValue(..))));
}

#[tokio::test]
async fn test_missing_required_service_disconnects() {
    let mut h = Harness::new();
    let mut events = h.session.subscribe();
    let (done, connected) = capture();
    h.session.enqueue_connect(vec![SVC_A], done);

    assert_eq!(h.next_call().await, Call::Connect);
    h.sink().connected();
    assert_eq!(h.next_call().await, Call::DiscoverServices(vec![SVC_A]));
    h.sink().services_discovered(Ok(vec![SVC_B]));
    assert_eq!(h.next_call().await, Call::DiscoverCharacteristics(SVC_B));
    h.sink().characteristics_discovered(SVC_B, Ok(Vec::new()));

    assert!(matches!(
        resolved(connected).await,
        Err(Error::InvalidParameters { .. })
    ));
    assert_eq!(h.next_call().await, Call::Disconnect);
    h.sink().disconnected(None);

    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if event.kind == ConnectionEventKind::Disconnected {
            assert_eq!(event.reason, Some(DisconnectReason::DiscoveryFailed));
            break;
        }
    }
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_completions_follow_enqueue_order() {
    let mut h = Harness::new();
    let target = characteristic(Capabilities::ALL);
    h.connect_ready(vec![target]).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done, finished) = capture();
    {
        let o = order.clone();
        h.session
            .enqueue_read_rssi(move |r| o.lock().push(format!("rssi {:?}", r)));
        let o = order.clone();
        h.session
            .enqueue_read_characteristic(target, move |r| o.lock().push(format!("read {:?}", r)));
        let o = order.clone();
        h.session.enqueue_write_characteristic(target, vec![7], false, move |r| {
            o.lock().push(format!("write {:?}", r))
        });
        let o = order.clone();
        h.session.enqueue_disconnect(move |r| {
            o.lock().push(format!("disconnect {:?}", r));
            done(r);
        });
    }

    assert_eq!(h.next_call().await, Call::ReadRssi);
    assert_eq!(h.session.pending_requests(), 3);
    h.sink().rssi_read(Ok(-50));
    assert_eq!(h.next_call().await, Call::ReadValue(target.id));
    h.sink().value_read(target.id, Ok(Bytes::from_static(b"hi")));
    assert_eq!(
        h.next_call().await,
        Call::WriteValue(target.id, Bytes::from_static(&[7]), WriteMode::WithoutResponse)
    );
    assert_eq!(h.next_call().await, Call::Disconnect);
    h.sink().disconnected(None);
    assert_eq!(resolved(finished).await, Ok(()));

    assert_eq!(
        *order.lock(),
        vec![
            "rssi Ok(-50)".to_string(),
            "read Ok(b\"hi\")".to_string(),
            "write Ok(())".to_string(),
            "disconnect Ok(())".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_cancel_waits_for_running_request() {
    let mut h = Harness::new();
    let target = characteristic(Capabilities::ALL);
    h.connect_ready(vec![target]).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done, last) = capture();
    {
        let o = order.clone();
        h.session
            .enqueue_read_rssi(move |r| o.lock().push(("rssi", r.err())));
        let o = order.clone();
        h.session
            .enqueue_read_characteristic(target, move |r| o.lock().push(("read", r.err())));
        let o = order.clone();
        h.session.enqueue_disconnect(move |r| {
            o.lock().push(("disconnect", r.clone().err()));
            done(r);
        });
    }
    assert_eq!(h.next_call().await, Call::ReadRssi);

    h.session.cancel_queue();
    assert_eq!(h.next_call().await, Call::Disconnect);
    assert!(order.lock().is_empty());
    assert_eq!(h.session.pending_requests(), 0);

    h.sink().disconnected(None);
    assert_eq!(resolved(last).await, Err(Error::Canceled));
    assert_eq!(
        *order.lock(),
        vec![
            ("rssi", Some(Error::Canceled)),
            ("read", Some(Error::Canceled)),
            ("disconnect", Some(Error::Canceled)),
        ]
    );
    assert_eq!(
        h.session.last_disconnect_reason(),
        Some(DisconnectReason::Canceled)
    );
}

#[tokio::test]
async fn test_link_loss_flushes_up_to_next_connect() {
    let mut h = Harness::new();
    let target = characteristic(Capabilities::ALL);
    h.connect_ready(vec![target]).await;
    let mut events = h.session.subscribe();

    let (rssi_done, rssi) = capture();
    let (read_done, read) = capture();
    let (disconnect_done, disconnected) = capture();
    let (connect_done, _reconnected) = capture();
    let (later_done, _later) = capture::<i16>();
    h.session.enqueue_read_rssi(rssi_done);
    h.session.enqueue_read_characteristic(target, read_done);
    h.session.enqueue_disconnect(disconnect_done);
    h.session.enqueue_connect(vec![SVC_A], connect_done);
    h.session.enqueue_read_rssi(later_done);
    assert_eq!(h.next_call().await, Call::ReadRssi);

    h.sink().disconnected(Some(StackFailure::Transport(8)));
    assert_eq!(resolved(rssi).await, Err(Error::Disconnected));
    assert_eq!(resolved(read).await, Err(Error::Disconnected));
    assert_eq!(resolved(disconnected).await, Ok(()));

    // The reconnect and everything after it stay queued.
    assert_eq!(h.next_call().await, Call::Connect);
    assert_eq!(h.session.pending_requests(), 1);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push((event.kind, event.reason));
    }
    assert_eq!(
        kinds,
        vec![
            (
                ConnectionEventKind::Disconnected,
                Some(DisconnectReason::LinkLost)
            ),
            (ConnectionEventKind::Connecting, None),
        ]
    );
}

#[tokio::test]
async fn test_set_notify_replaces_handler() {
    let mut h = Harness::new();
    let target = characteristic(Capabilities {
        notifiable: true,
        ..Default::default()
    });
    h.connect_ready(vec![target]).await;

    let (first_tx, mut first) = mpsc::unbounded_channel();
    let (done, subscribed) = capture();
    h.session.enqueue_set_notify(
        target,
        move |_, value| {
            let _ = first_tx.send(value);
        },
        done,
    );
    assert_eq!(h.next_call().await, Call::SetNotify(target.id, true));
    h.sink().notify_state_updated(target.id, Ok(()));
    assert_eq!(resolved(subscribed).await, Ok(()));

    h.sink()
        .value_changed(target.id, Ok(Bytes::from_static(&[1])));
    assert_eq!(first.recv().await, Some(Ok(Bytes::from_static(&[1]))));

    let (second_tx, mut second) = mpsc::unbounded_channel();
    let (done, resubscribed) = capture();
    h.session.enqueue_set_notify(
        target,
        move |_, value| {
            let _ = second_tx.send(value);
        },
        done,
    );
    assert_eq!(h.next_call().await, Call::SetNotify(target.id, true));
    h.sink().notify_state_updated(target.id, Ok(()));
    assert_eq!(resolved(resubscribed).await, Ok(()));

    h.sink()
        .value_changed(target.id, Ok(Bytes::from_static(&[2])));
    assert_eq!(second.recv().await, Some(Ok(Bytes::from_static(&[2]))));
    // The replaced handler was dropped without seeing the second value.
    assert_eq!(first.recv().await, None);

    let (done, cleared) = capture();
    h.session.enqueue_clear_notify(target, done);
    assert_eq!(h.next_call().await, Call::SetNotify(target.id, false));
    h.sink().notify_state_updated(target.id, Ok(()));
    assert_eq!(resolved(cleared).await, Ok(()));
    assert_eq!(second.recv().await, None);
}

#[tokio::test]
async fn test_failed_set_notify_keeps_previous_handler() {
    let mut h = Harness::new();
    let target = characteristic(Capabilities::ALL);
    h.connect_ready(vec![target]).await;

    let (tx, mut values) = mpsc::unbounded_channel();
    let (done, subscribed) = capture();
    h.session.enqueue_set_notify(
        target,
        move |_, value| {
            let _ = tx.send(value);
        },
        done,
    );
    assert_eq!(h.next_call().await, Call::SetNotify(target.id, true));
    h.sink().notify_state_updated(target.id, Ok(()));
    assert_eq!(resolved(subscribed).await, Ok(()));

    let (done, cleared) = capture();
    h.session.enqueue_clear_notify(target, done);
    assert_eq!(h.next_call().await, Call::SetNotify(target.id, false));
    h.sink()
        .notify_state_updated(target.id, Err(StackFailure::Protocol(0x03)));
    assert_eq!(resolved(cleared).await, Err(Error::Protocol { code: 0x03 }));

    h.sink()
        .value_changed(target.id, Ok(Bytes::from_static(&[9])));
    assert_eq!(values.recv().await, Some(Ok(Bytes::from_static(&[9]))));
}

#[tokio::test]
async fn test_notifications_cleared_on_disconnect() {
    let mut h = Harness::new();
    let target = characteristic(Capabilities::ALL);
    h.connect_ready(vec![target]).await;

    let (tx, mut values) = mpsc::unbounded_channel();
    h.session.enqueue_set_notify(
        target,
        move |_, value| {
            let _ = tx.send(value);
        },
        |_| {},
    );
    assert_eq!(h.next_call().await, Call::SetNotify(target.id, true));
    h.sink().notify_state_updated(target.id, Ok(()));

    let (done, disconnected) = capture();
    h.session.enqueue_disconnect(done);
    assert_eq!(h.next_call().await, Call::Disconnect);
    h.sink().disconnected(None);
    assert_eq!(resolved(disconnected).await, Ok(()));
    assert_eq!(values.recv().await, None);
}

#[tokio::test]
async fn test_acknowledged_write_waits_for_peer() {
    let mut h = Harness::new();
    let target = characteristic(Capabilities::ALL);
    h.connect_ready(vec![target]).await;

    let (done, written) = capture();
    h.session
        .enqueue_write_characteristic(target, Bytes::from_static(b"go"), true, done);
    assert_eq!(
        h.next_call().await,
        Call::WriteValue(target.id, Bytes::from_static(b"go"), WriteMode::WithResponse)
    );
    h.sink()
        .value_written(target.id, Err(StackFailure::Protocol(0x03)));
    assert_eq!(resolved(written).await, Err(Error::Protocol { code: 0x03 }));
}

#[tokio::test]
async fn test_rejected_write_is_translated() {
    let mut h = Harness::new();
    let target = characteristic(Capabilities::ALL);
    h.connect_ready(vec![target]).await;
    h.radio.reject_writes(StackFailure::Transport(3));

    let result = h
        .session
        .write_characteristic(target, vec![1], false)
        .await;
    assert_eq!(result, Err(Error::Transport { code: 3 }));
}

#[tokio::test]
async fn test_read_requires_connection() {
    let h = Harness::new();
    let target = characteristic(Capabilities::ALL);
    let result = h.session.read_characteristic(target).await;
    assert!(matches!(result, Err(Error::InvalidCall { .. })));
    assert!(h.radio.log().is_empty());
}

#[tokio::test]
async fn test_connection_events() {
    let mut h = Harness::new();
    let mut events = h.session.subscribe();
    h.connect_ready(Vec::new()).await;

    let (done, disconnected) = capture();
    h.session.enqueue_disconnect(done);
    assert_eq!(h.next_call().await, Call::Disconnect);
    h.sink().disconnected(None);
    assert_eq!(resolved(disconnected).await, Ok(()));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.peripheral.as_str(), "fake-peripheral");
        kinds.push((event.kind, event.reason));
    }
    assert_eq!(
        kinds,
        vec![
            (ConnectionEventKind::Connecting, None),
            (ConnectionEventKind::Connected, None),
            (ConnectionEventKind::Ready, None),
            (ConnectionEventKind::Disconnecting, None),
            (
                ConnectionEventKind::Disconnected,
                Some(DisconnectReason::Requested)
            ),
        ]
    );
}

#[tokio::test]
async fn test_dropping_session_disconnects() {
    let mut h = Harness::new();
    h.connect_ready(Vec::new()).await;
    let sink = h.sink();

    let session = h.session.clone();
    drop(session);
    assert_eq!(h.radio.log().last(), Some(&Call::DiscoverCharacteristics(SVC_A)));

    let Harness { session, radio, .. } = h;
    drop(session);
    drop(radio);

    // The worker holds the radio now; wait for it to release the link.
    tokio::time::timeout(Duration::from_secs(2), async {
        while !sink.is_closed() {
            tokio::task::yield_now().await;
            sink.disconnected(None);
        }
    })
    .await
    .expect("session worker did not stop");
}

#[tokio::test]
async fn test_cancel_leaves_later_requests_alone_when_disconnected() {
    let h = Harness::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (done, finished) = capture();

    let o = order.clone();
    h.session
        .enqueue_read_rssi(move |r| o.lock().push(("a", r.err())));
    h.session.cancel_queue();
    let o = order.clone();
    h.session.enqueue_read_rssi(move |r| {
        o.lock().push(("c", r.clone().err()));
        done(r);
    });

    assert!(matches!(
        resolved(finished).await,
        Err(Error::InvalidCall { .. })
    ));
    let order = order.lock();
    assert_eq!(order.len(), 2);
    assert_eq!(order[0], ("a", Some(Error::Canceled)));
    assert_eq!(order[1].0, "c");
    assert!(matches!(order[1].1, Some(Error::InvalidCall { .. })));
}

#[tokio::test]
async fn test_cancel_does_not_dispatch_later_requests_first() {
    let mut h = Harness::new();
    h.connect_ready(Vec::new()).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done, finished) = capture();
    let o = order.clone();
    h.session
        .enqueue_read_rssi(move |r| o.lock().push(("a", r.err())));
    h.session.cancel_queue();
    let o = order.clone();
    h.session.enqueue_read_rssi(move |r| {
        o.lock().push(("c", r.clone().err()));
        done(r);
    });

    // The forced disconnect comes first; the later read never reaches the
    // stack while the link is going down.
    assert_eq!(h.next_call().await, Call::Disconnect);
    assert_eq!(*order.lock(), vec![("a", Some(Error::Canceled))]);
    assert_eq!(h.session.pending_requests(), 1);

    h.sink().disconnected(None);
    assert!(matches!(
        resolved(finished).await,
        Err(Error::InvalidCall { .. })
    ));
    assert!(!h.radio.log().contains(&Call::ReadRssi));
    assert_eq!(order.lock()[0], ("a", Some(Error::Canceled)));
    assert_eq!(order.lock()[1].0, "c");
}

#[tokio::test]
async fn test_cancel_after_link_up_waits_for_disconnect() {
    let mut h = Harness::new();
    let (done, mut connected) = capture();
    h.session.enqueue_connect(vec![SVC_A], done);
    assert_eq!(h.next_call().await, Call::Connect);
    h.sink().connected();
    assert_eq!(h.next_call().await, Call::DiscoverServices(vec![SVC_A]));

    h.session.cancel_queue();
    assert_eq!(h.next_call().await, Call::Disconnect);
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnecting);
    assert!(connected.try_recv().is_err());

    // Discovery finishing after the cancel does not revive the connect.
    h.sink().services_discovered(Ok(vec![SVC_A]));
    h.sink().disconnected(None);
    assert_eq!(resolved(connected).await, Err(Error::Canceled));
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        h.session.last_disconnect_reason(),
        Some(DisconnectReason::Canceled)
    );
}

#[tokio::test]
async fn test_service_discovery_error_disconnects_and_pauses_queue() {
    let mut h = Harness::new();
    let (done, connected) = capture();
    let (rssi_done, rssi) = capture();
    h.session.enqueue_connect(vec![SVC_A], done);
    h.session.enqueue_read_rssi(rssi_done);
    assert_eq!(h.next_call().await, Call::Connect);
    h.sink().connected();
    assert_eq!(h.next_call().await, Call::DiscoverServices(vec![SVC_A]));

    h.sink()
        .services_discovered(Err(StackFailure::Protocol(0x0a)));
    assert_eq!(resolved(connected).await, Err(Error::Protocol { code: 0x0a }));
    assert_eq!(h.next_call().await, Call::Disconnect);
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnecting);
    assert_eq!(h.session.pending_requests(), 1);

    h.sink().disconnected(None);
    assert!(matches!(resolved(rssi).await, Err(Error::InvalidCall { .. })));
    assert_eq!(
        h.session.last_disconnect_reason(),
        Some(DisconnectReason::DiscoveryFailed)
    );
    assert!(!h.radio.log().contains(&Call::ReadRssi));
}

#[tokio::test]
async fn test_characteristic_discovery_error_fails_connect() {
    let mut h = Harness::new();
    let (done, connected) = capture();
    h.session.enqueue_connect(vec![SVC_A], done);
    assert_eq!(h.next_call().await, Call::Connect);
    h.sink().connected();
    assert_eq!(h.next_call().await, Call::DiscoverServices(vec![SVC_A]));
    h.sink().services_discovered(Ok(vec![SVC_A]));
    assert_eq!(h.next_call().await, Call::DiscoverCharacteristics(SVC_A));

    h.sink()
        .characteristics_discovered(SVC_A, Err(StackFailure::Transport(22)));
    assert_eq!(resolved(connected).await, Err(Error::Transport { code: 22 }));
    assert_eq!(h.next_call().await, Call::Disconnect);

    h.sink().disconnected(None);
    assert_eq!(h.session.disconnect().await, Ok(()));
    assert_eq!(
        h.session.last_disconnect_reason(),
        Some(DisconnectReason::DiscoveryFailed)
    );
}

#[tokio::test]
async fn test_link_loss_during_discovery_fails_connect() {
    let mut h = Harness::new();
    let (done, connected) = capture();
    h.session.enqueue_connect(vec![SVC_A], done);
    assert_eq!(h.next_call().await, Call::Connect);
    h.sink().connected();
    assert_eq!(h.next_call().await, Call::DiscoverServices(vec![SVC_A]));

    h.sink().disconnected(None);
    assert_eq!(resolved(connected).await, Err(Error::Disconnected));
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        h.session.last_disconnect_reason(),
        Some(DisconnectReason::LinkLost)
    );
}

#[tokio::test]
async fn test_stale_connect_failure_after_cancel_is_ignored() {
    let mut h = Harness::new();
    let mut events = h.session.subscribe();
    let (done, connected) = capture();
    h.session.enqueue_connect(Vec::new(), done);
    assert_eq!(h.next_call().await, Call::Connect);

    h.session.cancel_queue();
    assert_eq!(resolved(connected).await, Err(Error::Canceled));

    h.sink().connect_failed(StackFailure::Transport(5));
    let (done, _reconnected) = capture();
    h.session.enqueue_connect(Vec::new(), done);
    assert_eq!(h.next_call().await, Call::Connect);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push((event.kind, event.reason));
    }
    assert_eq!(
        kinds,
        vec![
            (ConnectionEventKind::Connecting, None),
            (
                ConnectionEventKind::Disconnected,
                Some(DisconnectReason::Canceled)
            ),
            (ConnectionEventKind::Connecting, None),
        ]
    );
}
