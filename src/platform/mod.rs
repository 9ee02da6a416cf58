// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// OS bindings. The transport relies on POSIX shared memory and robust
// process-shared pthread primitives; there is no non-POSIX backend.

#[cfg(unix)]
pub mod posix;

#[cfg(unix)]
pub use posix::{PlatformMutex, PlatformShm};

#[cfg(not(unix))]
compile_error!("shmbus requires POSIX shared memory and robust pthread mutexes");
