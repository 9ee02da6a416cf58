// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Demo subscriber: waits for chunks on the demo topic and prints the
// counter each one carries.
//
// Usage:
//   demo_subscribe [service]

use shmbus::{Runtime, ServiceDescription, SubscriberOptions};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let service = std::env::args().nth(1).unwrap_or_else(|| "demo".to_owned());

    let runtime = match Runtime::connect("default", "demo_subscribe") {
        Ok(r) => r,
        Err(e) => {
            eprintln!("cannot reach broker: {e}");
            std::process::exit(1);
        }
    };

    let desc = ServiceDescription::new(&service, "demo", "counter");
    let options = SubscriberOptions {
        queue_capacity: 16,
        requested_history: 4,
        ..Default::default()
    };
    let subscriber = match runtime.create_subscriber(&desc, &options) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot create subscriber: {e}");
            std::process::exit(1);
        }
    };

    loop {
        match subscriber.wait_for_chunks(Some(1000)) {
            Ok(true) => {}
            Ok(false) => {
                runtime.keep_alive();
                continue;
            }
            Err(e) => {
                eprintln!("wait failed: {e}");
                break;
            }
        }
        loop {
            let taken = subscriber.take();
            if taken.overflowed {
                log::warn!("queue overflowed, oldest samples were discarded");
            }
            match taken.chunk {
                Some(chunk) => {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(chunk.payload());
                    log::info!(
                        "received {} (seq {})",
                        u64::from_le_bytes(bytes),
                        chunk.sequence()
                    );
                }
                None => break,
            }
        }
        runtime.keep_alive();
    }
}
