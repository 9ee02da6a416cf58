// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// shmbus: a zero-copy shared-memory publish/subscribe transport for
// co-located processes. Publishers loan fixed-size blocks from pre-sized
// pools inside shared segments, write payloads in place, and hand off a
// reference; subscribers read the same bytes. A central broker owns the
// segments and mediates discovery, connection, and teardown.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod condition;
pub use condition::IpcCondition;

mod waiter;
pub use waiter::Waiter;

pub mod spin_lock;
pub use spin_lock::SpinLock;

pub mod error;
pub use error::{ConnectError, ControlError, GraphError, LoanError, SegmentError, SendError};

pub mod rel_ptr;
pub use rel_ptr::{RelPtr, SegmentToken, MAX_SEGMENTS, SEGMENT_ID_NULL};

pub mod pool;
pub use pool::MemPool;

pub mod chunk;
pub use chunk::{Chunk, ChunkHeader, ChunkManagement};

pub mod memory;
pub use memory::{MemoryManager, PoolStats};

pub mod queue;
pub use queue::{ChunkQueue, IndexQueue, OverflowPolicy, PushOutcome, MAX_QUEUE_CAPACITY};

pub mod port;
pub use port::{
    OfferState, PortPool, PortRole, PublisherOptions, PublisherPort, ServiceDescription,
    SubscriberOptions, SubscriberPort, SubscriptionState, TakeResult, MAX_HISTORY,
    MAX_SUBSCRIBERS_PER_PUBLISHER,
};

pub mod graph;
pub use graph::{PortGraph, PortHandle};

pub mod segment;
pub use segment::{DataSegment, SegmentInfo, SegmentManager};

pub mod config;
pub use config::{BrokerConfig, PoolEntry};

pub mod control;
pub use control::{ControlMessage, ControlQueue, MessageKind};

pub mod broker;
pub use broker::{Broker, BrokerError};

pub mod runtime;
pub use runtime::Runtime;

pub mod timer;
pub use timer::{TimerHandle, TimerPool};
