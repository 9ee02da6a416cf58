// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// The broker daemon.
//
// Usage:
//   broker [config.toml]
//
// With no argument a built-in default configuration is used (three pool
// tiers in one segment). Ctrl-C shuts down cleanly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shmbus::{Broker, BrokerConfig};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("cannot read {path}: {e}");
                    std::process::exit(1);
                }
            };
            match BrokerConfig::from_toml(&text) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("cannot parse {path}: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => BrokerConfig::default(),
    };

    let mut broker = match Broker::new(config) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("broker startup failed: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc_handler(move || shutdown.store(true, Ordering::Release)) {
            log::warn!("cannot install signal handler: {e}");
        }
    }

    broker.run(&shutdown);
}

/// Minimal SIGINT/SIGTERM hook without an extra dependency.
fn ctrlc_handler<F: Fn() + Send + Sync + 'static>(f: F) -> std::io::Result<()> {
    use std::sync::OnceLock;
    static HANDLER: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();
    let _ = HANDLER.set(Box::new(f));

    extern "C" fn trampoline(_: libc::c_int) {
        if let Some(h) = HANDLER.get() {
            h();
        }
    }

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = trampoline as usize;
        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0
            || libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut()) != 0
        {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
