// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Port graph tests: matching, offer/subscription state machines, and
// crash cleanup through the discovery tick.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shmbus::graph::{PortGraph, PortHandle};
use shmbus::port::{
    OfferState, PortPool, PublisherOptions, PublisherPort, ServiceDescription,
    SubscriberOptions, SubscriberPort, SubscriptionState,
};
use shmbus::segment::{allocate_segment_id, DataSegment};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_domain(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_graph_{n}_{}", std::process::id())
}

/// A pid no live process plausibly has; `kill(pid, 0)` reports ESRCH.
const DEAD_PID: i32 = i32::MAX - 7;

fn live_pid() -> i32 {
    std::process::id() as i32
}

struct Harness {
    domain: String,
    segment: DataSegment,
    ports: Arc<PortPool>,
    graph: PortGraph,
}

fn harness(prefix: &str) -> Harness {
    let domain = unique_domain(prefix);
    let seg_name = format!("sbus_{domain}_seg_test");
    let segment =
        DataSegment::create(&seg_name, allocate_segment_id(), &[(256, 16)]).expect("segment");
    let ports = Arc::new(PortPool::create(&domain, 4, 8).expect("port pool"));
    let graph = PortGraph::new(&domain, Arc::clone(&ports));
    Harness {
        domain,
        segment,
        ports,
        graph,
    }
}

fn desc(event: &str) -> ServiceDescription {
    ServiceDescription::new("lidar", "roof", event)
}

fn sub_state(h: &Harness, handle: PortHandle) -> SubscriptionState {
    unsafe { &*h.ports.subscriber(handle.index) }.subscription_state()
}

#[test]
fn matching_is_exact_on_all_three_fields() {
    let mut h = harness("match");
    h.graph
        .create_publisher(&desc("points"), &PublisherOptions::default(), live_pid())
        .expect("publisher");

    let attached = h
        .graph
        .create_subscriber(&desc("points"), &SubscriberOptions::default(), live_pid())
        .expect("matching subscriber");
    assert_eq!(sub_state(&h, attached), SubscriptionState::Subscribed);

    let waiting = h
        .graph
        .create_subscriber(&desc("intensity"), &SubscriberOptions::default(), live_pid())
        .expect("non-matching subscriber");
    assert_eq!(sub_state(&h, waiting), SubscriptionState::WaitForOffer);
}

#[test]
fn late_publisher_promotes_waiting_subscriber() {
    let mut h = harness("latepub");
    let sub = h
        .graph
        .create_subscriber(&desc("points"), &SubscriberOptions::default(), live_pid())
        .expect("subscriber");
    assert_eq!(sub_state(&h, sub), SubscriptionState::WaitForOffer);

    h.graph
        .create_publisher(&desc("points"), &PublisherOptions::default(), live_pid())
        .expect("publisher");
    assert_eq!(sub_state(&h, sub), SubscriptionState::Subscribed);
}

#[test]
fn qos_history_check_is_unilateral() {
    let mut h = harness("qos");
    h.graph
        .create_publisher(
            &desc("points"),
            &PublisherOptions {
                history_capacity: 2,
                initially_offered: true,
            },
            live_pid(),
        )
        .expect("publisher");

    // Requested history exceeds the publisher's depth: no connection.
    let sub = h
        .graph
        .create_subscriber(
            &desc("points"),
            &SubscriberOptions {
                queue_capacity: 8,
                requested_history: 5,
                ..Default::default()
            },
            live_pid(),
        )
        .expect("subscriber");
    assert_eq!(sub_state(&h, sub), SubscriptionState::WaitForOffer);
}

#[test]
fn offer_and_stop_offer_drive_attachment() {
    let mut h = harness("offer");
    let pub_handle = h
        .graph
        .create_publisher(
            &desc("points"),
            &PublisherOptions {
                history_capacity: 0,
                initially_offered: false,
            },
            live_pid(),
        )
        .expect("publisher");
    let mut publisher = PublisherPort::from_handle(
        Arc::clone(&h.ports),
        Arc::clone(h.segment.memory()),
        &h.domain,
        pub_handle,
    );

    let sub = h
        .graph
        .create_subscriber(&desc("points"), &SubscriberOptions::default(), live_pid())
        .expect("subscriber");
    assert_eq!(sub_state(&h, sub), SubscriptionState::WaitForOffer);

    publisher.offer();
    assert_eq!(publisher.offer_state(), OfferState::OfferRequested);
    h.graph.discovery_tick(Instant::now(), Duration::from_secs(3600));
    assert_eq!(publisher.offer_state(), OfferState::Offered);
    assert_eq!(sub_state(&h, sub), SubscriptionState::Subscribed);

    publisher.stop_offer();
    h.graph.discovery_tick(Instant::now(), Duration::from_secs(3600));
    assert_eq!(publisher.offer_state(), OfferState::NotOffered);
    assert_eq!(sub_state(&h, sub), SubscriptionState::WaitForOffer);
}

#[test]
fn unsubscribe_detaches_on_next_tick() {
    let mut h = harness("unsub");
    h.graph
        .create_publisher(&desc("points"), &PublisherOptions::default(), live_pid())
        .expect("publisher");
    let handle = h
        .graph
        .create_subscriber(&desc("points"), &SubscriberOptions::default(), live_pid())
        .expect("subscriber");
    let subscriber =
        SubscriberPort::from_handle(Arc::clone(&h.ports), &h.domain, handle).expect("bind");
    assert_eq!(subscriber.subscription_state(), SubscriptionState::Subscribed);

    subscriber.unsubscribe();
    assert_eq!(
        subscriber.subscription_state(),
        SubscriptionState::UnsubscribeRequested
    );
    h.graph.discovery_tick(Instant::now(), Duration::from_secs(3600));
    assert_eq!(
        subscriber.subscription_state(),
        SubscriptionState::NotSubscribed
    );

    subscriber.subscribe();
    h.graph.discovery_tick(Instant::now(), Duration::from_secs(3600));
    assert_eq!(subscriber.subscription_state(), SubscriptionState::Subscribed);
}

#[test]
fn port_pool_exhaustion_is_reported() {
    let mut h = harness("exhaust");
    for _ in 0..4 {
        h.graph
            .create_publisher(&desc("points"), &PublisherOptions::default(), live_pid())
            .expect("publisher");
    }
    let err = h
        .graph
        .create_publisher(&desc("points"), &PublisherOptions::default(), live_pid())
        .unwrap_err();
    assert!(matches!(
        err,
        shmbus::GraphError::PortPoolExhausted { role: "publisher", .. }
    ));
}

#[test]
fn remove_port_rejects_stale_handles() {
    let mut h = harness("stale");
    let handle = h
        .graph
        .create_publisher(&desc("points"), &PublisherOptions::default(), live_pid())
        .expect("publisher");
    h.graph.remove_port(handle).expect("first removal");
    let err = h.graph.remove_port(handle).unwrap_err();
    assert!(matches!(err, shmbus::GraphError::UnknownHandle { .. }));
}

// Killing a client returns every chunk and port it owned: ports of a dead
// pid disappear on the next tick, history references drain back to the
// pool, and a later subscriber sees no stale offer.
#[test]
fn crash_cleanup_reclaims_ports_and_chunks() {
    let mut h = harness("crash");
    let d = desc("points");

    // Two publishers owned by a process that is already gone.
    let p1 = h
        .graph
        .create_publisher(
            &d,
            &PublisherOptions {
                history_capacity: 4,
                initially_offered: true,
            },
            DEAD_PID,
        )
        .expect("publisher 1");
    h.graph
        .create_publisher(&d, &PublisherOptions::default(), DEAD_PID)
        .expect("publisher 2");
    assert_eq!(h.graph.publisher_count(), 2);

    // Park chunks in the first publisher's history.
    let mut publisher = PublisherPort::from_handle(
        Arc::clone(&h.ports),
        Arc::clone(h.segment.memory()),
        &h.domain,
        p1,
    );
    for i in 0..3u8 {
        let mut chunk = publisher.loan(1, 1).expect("loan");
        chunk.payload_mut()[0] = i;
        publisher.send(chunk).expect("send");
    }
    assert_eq!(h.segment.memory().pool_stats()[0].used, 3);

    let removed = h
        .graph
        .discovery_tick(Instant::now(), Duration::from_secs(3600));
    assert_eq!(removed, 2);
    assert_eq!(h.graph.publisher_count(), 0);
    assert_eq!(h.segment.memory().pool_stats()[0].used, 0);
    assert_eq!(h.segment.memory().mgmt_records_in_use(), 0);

    // No stale offer remains.
    assert!(!h.graph.has_offer(&d));
    let sub = h
        .graph
        .create_subscriber(&d, &SubscriberOptions::default(), live_pid())
        .expect("subscriber");
    assert_eq!(sub_state(&h, sub), SubscriptionState::WaitForOffer);
}

// A registered process whose keep-alive epoch goes stale is reclaimed even
// if its pid still exists.
#[test]
fn stale_keep_alive_epoch_is_reclaimed() {
    let mut h = harness("stale_epoch");
    let my_pid = std::process::id() as i32;
    let t0 = Instant::now();

    h.graph.register_process(my_pid, "sluggish", t0);
    h.graph
        .create_publisher(&desc("points"), &PublisherOptions::default(), my_pid)
        .expect("publisher");

    // Within the threshold nothing happens.
    let removed = h.graph.discovery_tick(t0 + Duration::from_millis(500), Duration::from_secs(1));
    assert_eq!(removed, 0);

    // A keep-alive refreshes the epoch.
    h.graph.keep_alive(my_pid, t0 + Duration::from_millis(800));
    let removed = h.graph.discovery_tick(t0 + Duration::from_millis(1500), Duration::from_secs(1));
    assert_eq!(removed, 0);

    // Past the threshold without refresh the ports are gone.
    let removed = h.graph.discovery_tick(t0 + Duration::from_secs(5), Duration::from_secs(1));
    assert_eq!(removed, 1);
    assert_eq!(h.graph.publisher_count(), 0);
}

// Removing a publisher drains its history and detaches its subscribers.
#[test]
fn remove_publisher_returns_history_chunks() {
    let mut h = harness("remove_pub");
    let d = desc("points");
    let handle = h
        .graph
        .create_publisher(
            &d,
            &PublisherOptions {
                history_capacity: 4,
                initially_offered: true,
            },
            live_pid(),
        )
        .expect("publisher");
    let sub = h
        .graph
        .create_subscriber(&d, &SubscriberOptions::default(), live_pid())
        .expect("subscriber");

    let mut publisher = PublisherPort::from_handle(
        Arc::clone(&h.ports),
        Arc::clone(h.segment.memory()),
        &h.domain,
        handle,
    );
    let mut chunk = publisher.loan(1, 1).expect("loan");
    chunk.payload_mut()[0] = 42;
    publisher.send(chunk).expect("send");

    h.graph.remove_port(handle).expect("remove");
    assert_eq!(sub_state(&h, sub), SubscriptionState::WaitForOffer);
    // The subscriber's queued reference is still valid until taken.
    let subscriber = unsafe { &*h.ports.subscriber(sub.index) };
    assert_eq!(subscriber.queue.len(), 1);
}
