// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Control channel and broker tests: the registration handshake, port
// creation through request/reply, keep-alive, and a full pub/sub round
// trip with the broker serving on its own thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shmbus::control::{ControlMessage, ControlQueue, MessageKind};
use shmbus::{
    Broker, BrokerConfig, PoolEntry, PublisherOptions, Runtime, ServiceDescription,
    SubscriberOptions,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_domain(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_ctl_{n}_{}", std::process::id())
}

fn test_config(domain: &str) -> BrokerConfig {
    BrokerConfig {
        domain: domain.to_owned(),
        pools: vec![PoolEntry {
            size: 256,
            count: 16,
            access_group: "default".into(),
        }],
        discovery_interval_ms: 20,
        keep_alive_threshold_ms: 60_000,
        max_publishers: 4,
        max_subscribers: 4,
    }
}

#[test]
fn control_queue_carries_messages_across_threads() {
    let name = format!("sbus_{}_rawq", unique_domain("raw"));
    let server = ControlQueue::open(&name).expect("server end");
    let client = ControlQueue::open(&name).expect("client end");

    let reader = std::thread::spawn(move || {
        let msg = server.recv(Some(2000)).expect("recv").expect("message");
        (msg.kind(), msg.pid, msg.app_name_str().to_owned())
    });

    std::thread::sleep(Duration::from_millis(20));
    client
        .push(&ControlMessage::reg_app("pingpong", 4242))
        .expect("push");

    let (kind, pid, app) = reader.join().expect("reader");
    assert_eq!(kind, Some(MessageKind::RegApp));
    assert_eq!(pid, 4242);
    assert_eq!(app, "pingpong");
    ControlQueue::clear_storage(&name);
}

#[test]
fn handshake_reports_segments_and_client_id() {
    let domain = unique_domain("handshake");
    let mut broker = Broker::new(test_config(&domain)).expect("broker");

    let runtime_thread = std::thread::spawn({
        let domain = domain.clone();
        move || Runtime::connect(&domain, "handshake_app")
    });

    // Serve until the registration landed.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !runtime_thread.is_finished() {
        broker.run_once(Instant::now());
        std::thread::sleep(Duration::from_millis(5));
    }
    let runtime = runtime_thread.join().expect("join").expect("connect");
    assert!(runtime.client_id() >= 1);
    assert_eq!(runtime.memory().pool_stats()[0].block_count, 16);
}

#[test]
fn full_round_trip_through_broker_thread() {
    let domain = unique_domain("roundtrip");
    let mut broker = Broker::new(test_config(&domain)).expect("broker");
    let shutdown = Arc::new(AtomicBool::new(false));

    let broker_thread = {
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || {
            broker.run(&shutdown);
        })
    };

    let runtime = Runtime::connect(&domain, "rt_app").expect("connect");
    let desc = ServiceDescription::new("camera", "front", "frames");

    let mut publisher = runtime
        .create_publisher(
            &desc,
            &PublisherOptions {
                history_capacity: 0,
                initially_offered: true,
            },
        )
        .expect("publisher");
    let subscriber = runtime
        .create_subscriber(
            &desc,
            &SubscriberOptions {
                queue_capacity: 8,
                ..Default::default()
            },
        )
        .expect("subscriber");

    let mut chunk = publisher.loan(16, 8).expect("loan");
    chunk.payload_mut().copy_from_slice(b"frame-0000000001");
    assert_eq!(publisher.send(chunk).expect("send"), 1);

    assert!(subscriber.wait_for_chunks(Some(2000)).expect("wait"));
    let received = subscriber.take().chunk.expect("chunk");
    assert_eq!(received.payload(), b"frame-0000000001");
    drop(received);

    runtime.keep_alive();

    drop(subscriber);
    drop(publisher);
    drop(runtime);

    shutdown.store(true, Ordering::Release);
    broker_thread.join().expect("broker thread");
}

#[test]
fn port_pool_exhaustion_travels_back_as_rejection() {
    let domain = unique_domain("reject");
    let mut config = test_config(&domain);
    config.max_publishers = 1;
    let mut broker = Broker::new(config).expect("broker");
    let shutdown = Arc::new(AtomicBool::new(false));

    let broker_thread = {
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || broker.run(&shutdown))
    };

    let runtime = Runtime::connect(&domain, "greedy").expect("connect");
    let desc = ServiceDescription::new("only", "one", "slot");

    let _first = runtime
        .create_publisher(&desc, &PublisherOptions::default())
        .expect("first publisher");
    let err = runtime
        .create_publisher(&desc, &PublisherOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        shmbus::ControlError::Rejected(shmbus::error::ReplyStatus::PortPoolExhausted)
    ));

    drop(runtime);
    shutdown.store(true, Ordering::Release);
    broker_thread.join().expect("broker thread");
}

#[test]
fn unregister_reclaims_client_ports() {
    let domain = unique_domain("unreg");
    let mut broker = Broker::new(test_config(&domain)).expect("broker");
    let shutdown = Arc::new(AtomicBool::new(false));

    let broker_thread = {
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || broker.run(&shutdown))
    };

    let desc = ServiceDescription::new("ephemeral", "x", "y");
    {
        let runtime = Runtime::connect(&domain, "shortlived").expect("connect");
        let _publisher = runtime
            .create_publisher(&desc, &PublisherOptions::default())
            .expect("publisher");
        // Dropping the runtime sends UnregApp.
    }

    // A fresh client sees no stale offer once the broker processed the
    // unregistration.
    let runtime = Runtime::connect(&domain, "observer").expect("connect");
    let subscriber = runtime
        .create_subscriber(&desc, &SubscriberOptions::default())
        .expect("subscriber");

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut state = subscriber.subscription_state();
    while Instant::now() < deadline {
        state = subscriber.subscription_state();
        if state == shmbus::SubscriptionState::WaitForOffer {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(state, shmbus::SubscriptionState::WaitForOffer);

    drop(subscriber);
    drop(runtime);
    shutdown.store(true, Ordering::Release);
    broker_thread.join().expect("broker thread");
}
