// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Demo publisher: loans a chunk once per interval, writes a counter into
// it, and sends. Run the broker first, then any number of
// demo_subscribe processes.
//
// Usage:
//   demo_publish [service] [count]

use std::time::Duration;

use shmbus::{PublisherOptions, Runtime, ServiceDescription};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let service = std::env::args().nth(1).unwrap_or_else(|| "demo".to_owned());
    let count: u64 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    let runtime = match Runtime::connect("default", "demo_publish") {
        Ok(r) => r,
        Err(e) => {
            eprintln!("cannot reach broker: {e}");
            std::process::exit(1);
        }
    };

    let desc = ServiceDescription::new(&service, "demo", "counter");
    let options = PublisherOptions {
        history_capacity: 4,
        initially_offered: true,
    };
    let mut publisher = match runtime.create_publisher(&desc, &options) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("cannot create publisher: {e}");
            std::process::exit(1);
        }
    };

    for i in 0..count {
        let mut chunk = match publisher.loan(8, 8) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("loan failed ({e}), retrying");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };
        chunk.payload_mut().copy_from_slice(&i.to_le_bytes());
        match publisher.send(chunk) {
            Ok(delivered) => log::info!("sent {i} to {delivered} subscribers"),
            Err(e) => log::warn!("send failed: {e}"),
        }
        runtime.keep_alive();
        std::thread::sleep(Duration::from_millis(100));
    }
}
