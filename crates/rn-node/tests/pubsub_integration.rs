//! Publish/subscribe integration tests
//!
//! Nodes run in-process against a shared `LocalRegistry` and talk to each
//! other over real loopback sockets.

mod common;

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use rn_core::msgs::{Int32, RawMessage, StdString};
use rn_core::traits::NodeApi;
use rn_core::{RnError, RosMessage, SessionError, SessionState};
use rn_node::transport::{framed, read_header, send_header};
use rn_node::{AdvertiseOptions, SessionEvent, SubscribeOptions};
use rn_protocol::ConnectionHeader;

use common::{registry, start_held_node, start_node, wait_until, HeldRegistry};

fn queue_of(size: usize) -> (AdvertiseOptions, SubscribeOptions) {
    (
        AdvertiseOptions {
            queue_size: Some(size),
            ..AdvertiseOptions::default()
        },
        SubscribeOptions {
            queue_size: Some(size),
            ..SubscribeOptions::default()
        },
    )
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_arrive_in_order() {
    let registry = registry();
    let talker = start_node("talker", &registry).await;
    let listener = start_node("listener", &registry).await;
    let (pub_opts, sub_opts) = queue_of(3);

    let publisher = talker.advertise::<Int32>("numbers", pub_opts).unwrap();
    let mut events = publisher.events();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscriber = listener
        .subscribe::<Int32, _>("numbers", sub_opts, move |msg: Int32| {
            let _ = tx.send(msg.data);
            Ok(())
        })
        .unwrap();

    wait_until("subscriber connection", || talker.num_subscribers("/numbers") == 1).await;
    wait_until("publisher connection", || listener.num_publishers("/numbers") == 1).await;

    for data in 1..=3 {
        publisher.publish(Int32 { data });
    }

    assert_eq!(recv(&mut rx).await, 1);
    assert_eq!(recv(&mut rx).await, 2);
    assert_eq!(recv(&mut rx).await, 3);

    let connected = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Connected { header, .. }) => return header,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(connected.caller_id(), Some("/listener"));
    assert_eq!(connected.md5sum(), Some(Int32::md5sum()));

    talker.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_latched_message_reaches_late_subscriber() {
    let registry = registry();
    let talker = start_node("talker", &registry).await;
    let listener = start_node("listener", &registry).await;

    let publisher = talker
        .advertise::<StdString>("status", AdvertiseOptions::latching())
        .unwrap();
    assert!(publisher.is_latching());
    publisher.publish(StdString::new("ready"));
    // Give the scheduler a chance to flush into the latch
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscriber = listener
        .subscribe::<StdString, _>("status", SubscribeOptions::default(), move |msg: StdString| {
            let _ = tx.send(msg.data);
            Ok(())
        })
        .unwrap();

    assert_eq!(recv(&mut rx).await, "ready");

    talker.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_disconnects_both_sides() {
    let registry = registry();
    let talker = start_node("talker", &registry).await;
    let listener = start_node("listener", &registry).await;

    let _publisher = talker
        .advertise::<StdString>("chatter", AdvertiseOptions::default())
        .unwrap();
    let subscriber = listener
        .subscribe::<StdString, _>("chatter", SubscribeOptions::default(), |_| Ok(()))
        .unwrap();

    wait_until("subscriber connection", || talker.num_subscribers("chatter") == 1).await;
    assert_eq!(registry.subscribers_of("/chatter").len(), 1);

    subscriber.shutdown().await;
    assert_eq!(subscriber.state(), SessionState::Shutdown);
    assert!(listener.subscriptions().is_empty());
    assert!(registry.subscribers_of("/chatter").is_empty());

    wait_until("publisher to drop the peer", || talker.num_subscribers("chatter") == 0).await;
    assert_eq!(listener.num_publishers("chatter"), 0);

    talker.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_publisher_shutdown_disconnects_subscribers() {
    let registry = registry();
    let talker = start_node("talker", &registry).await;
    let first = start_node("first", &registry).await;
    let second = start_node("second", &registry).await;

    let publisher = talker
        .advertise::<StdString>("chatter", AdvertiseOptions::default())
        .unwrap();
    let _a = first
        .subscribe::<StdString, _>("chatter", SubscribeOptions::default(), |_| Ok(()))
        .unwrap();
    let _b = second
        .subscribe::<StdString, _>("chatter", SubscribeOptions::default(), |_| Ok(()))
        .unwrap();

    wait_until("both subscribers", || publisher.num_peers() == 2).await;
    wait_until("first connected", || first.num_publishers("chatter") == 1).await;
    wait_until("second connected", || second.num_publishers("chatter") == 1).await;

    publisher.shutdown().await;
    assert_eq!(publisher.num_peers(), 0);
    assert!(talker.publications().is_empty());

    wait_until("first to drop", || first.num_publishers("chatter") == 0).await;
    wait_until("second to drop", || second.num_publishers("chatter") == 0).await;

    talker.shutdown().await;
    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_raw_subscriber_accepts_any_type() {
    let registry = registry();
    let talker = start_node("talker", &registry).await;
    let listener = start_node("listener", &registry).await;

    let publisher = talker
        .advertise::<StdString>("anything", AdvertiseOptions::default())
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _raw = listener
        .subscribe::<RawMessage, _>("anything", SubscribeOptions::default(), move |msg: RawMessage| {
            let _ = tx.send(msg.0);
            Ok(())
        })
        .unwrap();

    wait_until("raw subscriber connection", || talker.num_subscribers("anything") == 1).await;
    publisher.publish(StdString::new("hi"));

    let bytes = recv(&mut rx).await;
    assert_eq!(&bytes[..], &[2, 0, 0, 0, b'h', b'i']);

    talker.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_type_mismatch_never_connects() {
    let registry = registry();
    let talker = start_node("talker", &registry).await;
    let listener = start_node("listener", &registry).await;

    let _publisher = talker
        .advertise::<StdString>("mixed", AdvertiseOptions::default())
        .unwrap();
    let _subscriber = listener
        .subscribe::<Int32, _>("mixed", SubscribeOptions::default(), |_| Ok(()))
        .unwrap();

    wait_until("registry to know both ends", || {
        registry.publishers_of("/mixed").len() == 1 && registry.subscribers_of("/mixed").len() == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(talker.num_subscribers("mixed"), 0);
    assert_eq!(listener.num_publishers("mixed"), 0);

    talker.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test]
async fn test_same_topic_different_type_is_an_error() {
    let registry = registry();
    let node = start_node("node", &registry).await;

    let first = node
        .advertise::<StdString>("dup", AdvertiseOptions::default())
        .unwrap();
    let again = node
        .advertise::<StdString>("/dup", AdvertiseOptions::default())
        .unwrap();
    assert_eq!(first.topic(), again.topic());
    assert_eq!(node.publications().len(), 1);

    match node.advertise::<Int32>("dup", AdvertiseOptions::default()) {
        Err(RnError::Session(SessionError::TypeMismatch {
            existing,
            requested,
            ..
        })) => {
            assert_eq!(existing, "std_msgs/String");
            assert_eq!(requested, "std_msgs/Int32");
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("advertising a second type should fail"),
    }

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_callback_shares_the_subscription() {
    let registry = registry();
    let talker = start_node("talker", &registry).await;
    let listener = start_node("listener", &registry).await;

    let publisher = talker
        .advertise::<StdString>("shared", AdvertiseOptions::default())
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let first_tx = tx.clone();
    let _first = listener
        .subscribe::<StdString, _>("shared", SubscribeOptions::default(), move |msg: StdString| {
            let _ = first_tx.send(format!("first:{}", msg.data));
            Ok(())
        })
        .unwrap();
    let _second = listener
        .subscribe::<StdString, _>("shared", SubscribeOptions::default(), move |msg: StdString| {
            let _ = tx.send(format!("second:{}", msg.data));
            Ok(())
        })
        .unwrap();
    assert_eq!(listener.subscriptions().len(), 1);

    wait_until("subscriber connection", || talker.num_subscribers("shared") == 1).await;
    publisher.publish(StdString::new("x"));

    let mut got = vec![recv(&mut rx).await, recv(&mut rx).await];
    got.sort();
    assert_eq!(got, vec!["first:x".to_string(), "second:x".to_string()]);

    talker.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_publisher_update_drops_removed_publisher() {
    let registry = registry();
    let first = start_node("first", &registry).await;
    let second = start_node("second", &registry).await;
    let listener = start_node("listener", &registry).await;

    let _a = first
        .advertise::<StdString>("feed", AdvertiseOptions::default())
        .unwrap();
    let b = second
        .advertise::<StdString>("feed", AdvertiseOptions::default())
        .unwrap();
    let _subscriber = listener
        .subscribe::<StdString, _>("feed", SubscribeOptions::default(), |_| Ok(()))
        .unwrap();

    wait_until("both publishers", || listener.num_publishers("feed") == 2).await;

    b.shutdown().await;
    assert_eq!(registry.publishers_of("/feed"), vec![first.api_uri()]);
    wait_until("one publisher left", || listener.num_publishers("feed") == 1).await;
    assert_eq!(first.num_subscribers("feed"), 1);

    first.shutdown().await;
    second.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test]
async fn test_unknown_topic_header_is_rejected() {
    let registry = registry();
    let node = start_node("node", &registry).await;

    let stream = TcpStream::connect(("127.0.0.1", node.port())).await.unwrap();
    let (mut reader, mut writer) = framed(stream);
    let header = ConnectionHeader::subscriber(
        "/probe",
        "/nobody_publishes_this",
        StdString::type_name(),
        StdString::md5sum(),
    );
    send_header(&mut writer, &header).await.unwrap();

    let reply = read_header(&mut reader).await.unwrap();
    assert!(reply.error().is_some());

    let stream = TcpStream::connect(("127.0.0.1", node.port())).await.unwrap();
    let (mut reader, mut writer) = framed(stream);
    send_header(&mut writer, &ConnectionHeader::default().with("callerid", "/probe"))
        .await
        .unwrap();
    let reply = read_header(&mut reader).await.unwrap();
    assert!(reply.error().is_some());

    node.shutdown().await;
}

#[tokio::test]
async fn test_request_topic_answers() {
    let registry = registry();
    let node = start_node("node", &registry).await;
    let _publisher = node
        .advertise::<StdString>("chatter", AdvertiseOptions::default())
        .unwrap();

    let api = node.api();
    let tcpros = vec!["TCPROS".to_string()];

    let reply = api.request_topic("/peer", "/chatter", &tcpros);
    assert!(reply.is_success());
    let transport = reply.value.unwrap();
    assert_eq!(transport.host, "127.0.0.1");
    assert_eq!(transport.port, node.port());

    assert_eq!(api.request_topic("/peer", "/other", &tcpros).code, 0);
    assert_eq!(
        api.request_topic("/peer", "/chatter", &["UDPROS".to_string()]).code,
        -1
    );

    node.shutdown().await;
}

#[tokio::test]
async fn test_wait_for_master_retries_until_reachable() {
    let registry = registry();
    registry.set_reachable(false);
    let node = start_node("patient", &registry).await;

    let waiter = {
        let node = node.clone();
        tokio::spawn(async move { node.wait_for_master().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    registry.set_reachable(true);
    let uri = timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(uri, "local://registry");

    node.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_node_refuses_new_endpoints() {
    let registry = registry();
    let node = start_node("node", &registry).await;
    let publisher = node
        .advertise::<StdString>("chatter", AdvertiseOptions::default())
        .unwrap();

    node.shutdown().await;
    node.shutdown().await;

    assert!(node.is_shutdown());
    assert_eq!(publisher.state(), SessionState::Shutdown);
    assert!(node.publications().is_empty());
    assert!(matches!(
        node.advertise::<StdString>("again", AdvertiseOptions::default()),
        Err(RnError::Session(SessionError::Shutdown(_)))
    ));
    assert!(matches!(
        node.wait_for_master().await,
        Err(RnError::Session(SessionError::Shutdown(_)))
    ));

    // Publishing after shutdown is a no-op
    publisher.publish(StdString::new("late"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_callback_does_not_stop_delivery() {
    let registry = registry();
    let talker = start_node("talker", &registry).await;
    let listener = start_node("listener", &registry).await;
    let (pub_opts, sub_opts) = queue_of(10);

    let publisher = talker.advertise::<Int32>("flaky", pub_opts).unwrap();

    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let _first = listener
        .subscribe::<Int32, _>("flaky", sub_opts.clone(), move |msg: Int32| {
            let _ = first_tx.send(msg.data);
            match msg.data {
                1 => Err(anyhow::anyhow!("rejecting {}", msg.data)),
                2 => panic!("callback bug on {}", msg.data),
                _ => Ok(()),
            }
        })
        .unwrap();
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    let _second = listener
        .subscribe::<Int32, _>("flaky", sub_opts, move |msg: Int32| {
            let _ = second_tx.send(msg.data);
            Ok(())
        })
        .unwrap();

    wait_until("subscriber connection", || talker.num_subscribers("flaky") == 1).await;
    for data in 1..=3 {
        publisher.publish(Int32 { data });
    }

    for expected in 1..=3 {
        assert_eq!(recv(&mut first_rx).await, expected);
        assert_eq!(recv(&mut second_rx).await, expected);
    }

    // The node keeps delivering on other topics too
    let other = talker.advertise::<Int32>("steady", AdvertiseOptions::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _steady = listener
        .subscribe::<Int32, _>("steady", SubscribeOptions::default(), move |msg: Int32| {
            let _ = tx.send(msg.data);
            Ok(())
        })
        .unwrap();
    wait_until("second topic connection", || talker.num_subscribers("steady") == 1).await;
    other.publish(Int32 { data: 7 });
    assert_eq!(recv(&mut rx).await, 7);

    talker.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_negative_throttle_bypasses_scheduler() {
    let registry = registry();
    let talker = start_node("talker", &registry).await;
    let listener = start_node("listener", &registry).await;

    let publisher = talker
        .advertise::<Int32>(
            "direct",
            AdvertiseOptions {
                queue_size: Some(10),
                throttle_ms: Some(60_000),
                ..AdvertiseOptions::default()
            },
        )
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscriber = listener
        .subscribe::<Int32, _>(
            "direct",
            SubscribeOptions {
                queue_size: Some(10),
                throttle_ms: Some(-1),
            },
            move |msg: Int32| {
                let _ = tx.send(msg.data);
                Ok(())
            },
        )
        .unwrap();

    wait_until("subscriber connection", || talker.num_subscribers("direct") == 1).await;

    // First flush is never throttled; the next one waits a minute
    publisher.publish(Int32 { data: 1 });
    assert_eq!(recv(&mut rx).await, 1);
    publisher.publish(Int32 { data: 2 });

    publisher.publish_with_throttle(Int32 { data: 3 }, -1);
    assert_eq!(recv(&mut rx).await, 3);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "throttled message arrived early");

    talker.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscriber_shut_down_while_registering() {
    let registry = registry();
    let talker = start_node("talker", &registry).await;
    let _publisher = talker
        .advertise::<StdString>("late", AdvertiseOptions::default())
        .unwrap();
    wait_until("publisher registration", || registry.publishers_of("/late").len() == 1).await;

    let held = HeldRegistry::new(&registry);
    let listener = start_held_node("listener", &held, &registry).await;
    let subscriber = listener
        .subscribe::<StdString, _>("late", SubscribeOptions::default(), |_| Ok(()))
        .unwrap();
    let mut events = subscriber.events();
    wait_until("registration in flight", || held.waiting() == 1).await;

    let shutdown = {
        let subscriber = subscriber.clone();
        tokio::spawn(async move { subscriber.shutdown().await })
    };
    wait_until("shutdown to start", || subscriber.state() == SessionState::Shutdown).await;
    assert!(!shutdown.is_finished(), "unregister must wait for the registration");

    // The registry now answers with the talker as a publisher
    held.release();
    timeout(Duration::from_secs(5), shutdown).await.unwrap().unwrap();

    assert_eq!(subscriber.state(), SessionState::Shutdown);
    assert!(registry.subscribers_of("/late").is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(talker.num_subscribers("late"), 0);
    assert_eq!(subscriber.num_peers(), 0);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::Registered | SessionEvent::Connected { .. }));
    }

    talker.shutdown().await;
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_publisher_shut_down_while_registering() {
    let registry = registry();
    let held = HeldRegistry::new(&registry);
    let talker = start_held_node("talker", &held, &registry).await;

    let publisher = talker
        .advertise::<StdString>("late", AdvertiseOptions::default())
        .unwrap();
    let mut events = publisher.events();
    wait_until("registration in flight", || held.waiting() == 1).await;

    let shutdown = {
        let publisher = publisher.clone();
        tokio::spawn(async move { publisher.shutdown().await })
    };
    wait_until("shutdown to start", || publisher.state() == SessionState::Shutdown).await;

    held.release();
    timeout(Duration::from_secs(5), shutdown).await.unwrap().unwrap();

    assert_eq!(publisher.state(), SessionState::Shutdown);
    assert!(registry.publishers_of("/late").is_empty());
    assert!(talker.publications().is_empty());
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::Registered));
    }

    talker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registry_can_shut_a_node_down() {
    let registry = registry();
    let talker = start_node("talker", &registry).await;
    let listener = start_node("listener", &registry).await;

    let publisher = talker
        .advertise::<StdString>("chatter", AdvertiseOptions::default())
        .unwrap();
    let _subscriber = listener
        .subscribe::<StdString, _>("chatter", SubscribeOptions::default(), |_| Ok(()))
        .unwrap();
    wait_until("subscriber connection", || talker.num_subscribers("chatter") == 1).await;

    let reply = registry.shutdown_node("/talker", "operator request").unwrap();
    assert!(reply.is_success());
    wait_until("talker to shut down", || talker.is_shutdown()).await;

    wait_until("publisher to shut down", || publisher.state() == SessionState::Shutdown).await;
    wait_until("registry entry to go", || registry.publishers_of("/chatter").is_empty()).await;
    wait_until("listener to drop the peer", || listener.num_publishers("chatter") == 0).await;
    assert!(talker.publications().is_empty());

    // Asking again is harmless
    assert!(registry
        .shutdown_node("/talker", "operator request")
        .unwrap()
        .is_success());
    assert!(registry.shutdown_node("/nobody", "operator request").is_err());
    assert!(!listener.is_shutdown());

    listener.shutdown().await;
}
