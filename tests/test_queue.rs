// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Queue safety under real concurrency: a producer and a consumer running
// full speed over one port pair, with the pool accounting checked at the
// end. Elements are popped at most once, nothing is lost, nothing leaks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use shmbus::graph::PortGraph;
use shmbus::port::{
    OverflowPolicy, PortPool, PublisherOptions, PublisherPort, ServiceDescription,
    SubscriberOptions, SubscriberPort,
};
use shmbus::segment::{allocate_segment_id, DataSegment};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_domain(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_queue_{n}_{}", std::process::id())
}

#[test]
fn concurrent_send_take_loses_nothing_with_reject_new() {
    let domain = unique_domain("spsc");
    let seg_name = format!("sbus_{domain}_seg_test");
    let segment =
        DataSegment::create(&seg_name, allocate_segment_id(), &[(256, 64)]).expect("segment");
    let ports = Arc::new(PortPool::create(&domain, 2, 2).expect("ports"));
    let mut graph = PortGraph::new(&domain, Arc::clone(&ports));

    let desc = ServiceDescription::new("stress", "spsc", "data");
    let pid = std::process::id() as i32;
    let pub_handle = graph
        .create_publisher(&desc, &PublisherOptions::default(), pid)
        .expect("publisher");
    let sub_handle = graph
        .create_subscriber(
            &desc,
            &SubscriberOptions {
                queue_capacity: 16,
                requested_history: 0,
                // RejectNew so every successfully delivered value arrives
                // exactly once and in order.
                policy: OverflowPolicy::RejectNew,
            },
            pid,
        )
        .expect("subscriber");

    let mut publisher = PublisherPort::from_handle(
        Arc::clone(&ports),
        Arc::clone(segment.memory()),
        &domain,
        pub_handle,
    );
    let subscriber =
        SubscriberPort::from_handle(Arc::clone(&ports), &domain, sub_handle).expect("bind");

    const TOTAL: u64 = 20_000;
    let done = Arc::new(AtomicBool::new(false));

    let producer = {
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let mut delivered = 0u64;
            let mut value = 0u64;
            while value < TOTAL {
                let mut chunk = match publisher.loan(8, 8) {
                    Ok(c) => c,
                    Err(_) => {
                        std::thread::yield_now();
                        continue;
                    }
                };
                chunk.payload_mut().copy_from_slice(&value.to_le_bytes());
                match publisher.send(chunk) {
                    Ok(1) => {
                        delivered += 1;
                        value += 1;
                    }
                    // Queue full: the value was rejected, resend it.
                    Ok(_) => std::thread::yield_now(),
                    Err(e) => panic!("send failed: {e}"),
                }
            }
            done.store(true, Ordering::Release);
            delivered
        })
    };

    let consumer = std::thread::spawn({
        let done = Arc::clone(&done);
        move || {
            let mut expected = 0u64;
            loop {
                match subscriber.take().chunk {
                    Some(chunk) => {
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(chunk.payload());
                        let v = u64::from_le_bytes(bytes);
                        assert_eq!(v, expected, "values arrive in send order, none lost");
                        expected += 1;
                    }
                    None => {
                        if done.load(Ordering::Acquire) && !subscriber.has_chunks() {
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
            }
            expected
        }
    });

    let delivered = producer.join().expect("producer");
    let consumed = consumer.join().expect("consumer");
    assert_eq!(delivered, TOTAL);
    assert_eq!(consumed, TOTAL);

    // Every block and management record is back in its pool.
    assert_eq!(segment.memory().pool_stats()[0].used, 0);
    assert_eq!(segment.memory().mgmt_records_in_use(), 0);
}

#[test]
fn wait_for_chunks_wakes_on_send() {
    let domain = unique_domain("wake");
    let seg_name = format!("sbus_{domain}_seg_test");
    let segment =
        DataSegment::create(&seg_name, allocate_segment_id(), &[(256, 8)]).expect("segment");
    let ports = Arc::new(PortPool::create(&domain, 2, 2).expect("ports"));
    let mut graph = PortGraph::new(&domain, Arc::clone(&ports));

    let desc = ServiceDescription::new("stress", "wake", "data");
    let pid = std::process::id() as i32;
    let pub_handle = graph
        .create_publisher(&desc, &PublisherOptions::default(), pid)
        .expect("publisher");
    let sub_handle = graph
        .create_subscriber(&desc, &SubscriberOptions::default(), pid)
        .expect("subscriber");

    let mut publisher = PublisherPort::from_handle(
        Arc::clone(&ports),
        Arc::clone(segment.memory()),
        &domain,
        pub_handle,
    );
    let subscriber =
        SubscriberPort::from_handle(Arc::clone(&ports), &domain, sub_handle).expect("bind");

    let waiter = std::thread::spawn(move || {
        let got = subscriber.wait_for_chunks(Some(5000)).expect("wait");
        assert!(got, "woken by the publisher, not by timeout");
        subscriber.take().chunk.expect("chunk after wake")
    });

    // Give the other thread a moment to block.
    std::thread::sleep(std::time::Duration::from_millis(50));
    let mut chunk = publisher.loan(4, 4).expect("loan");
    chunk.payload_mut().copy_from_slice(&[9, 9, 9, 9]);
    publisher.send(chunk).expect("send");

    let received = waiter.join().expect("waiter thread");
    assert_eq!(received.payload(), &[9, 9, 9, 9]);
}

#[test]
fn timed_wait_returns_false_when_nothing_arrives() {
    let domain = unique_domain("timeout");
    let seg_name = format!("sbus_{domain}_seg_test");
    let _segment =
        DataSegment::create(&seg_name, allocate_segment_id(), &[(256, 4)]).expect("segment");
    let ports = Arc::new(PortPool::create(&domain, 2, 2).expect("ports"));
    let mut graph = PortGraph::new(&domain, Arc::clone(&ports));

    let desc = ServiceDescription::new("stress", "timeout", "data");
    let sub_handle = graph
        .create_subscriber(&desc, &SubscriberOptions::default(), std::process::id() as i32)
        .expect("subscriber");
    let subscriber =
        SubscriberPort::from_handle(Arc::clone(&ports), &domain, sub_handle).expect("bind");

    let t0 = std::time::Instant::now();
    let got = subscriber.wait_for_chunks(Some(100)).expect("wait");
    assert!(!got);
    assert!(t0.elapsed() >= std::time::Duration::from_millis(80));
}
