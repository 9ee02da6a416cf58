// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Error taxonomy for the transport core.
//
// Capacity and protocol errors are returned to the caller as tagged results;
// nothing in the public API panics across the boundary. Liveness errors are
// absorbed where dropping is the correct behaviour and show up only in port
// statistics. Invariant violations (a pointer into an unregistered segment,
// freeing a block a pool does not own, a refcount underflow) signify memory
// corruption and route through [`fatal`], which logs and aborts.

use thiserror::Error;

/// Failure to loan a chunk from the tiered pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoanError {
    /// The best-fit pool has no free blocks. Larger pools are never used as
    /// a fallback; retry after releasing chunks.
    #[error("pool exhausted, no free chunk of the required size")]
    OutOfChunks,
    /// No configured pool is large enough for the requested payload.
    #[error("payload of {payload_size} bytes exceeds every configured pool")]
    ChunkTooLarge { payload_size: u64 },
}

/// Failure to deliver a chunk from a publisher port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The port is not in an offering state; `send` is a protocol violation.
    #[error("send on a port that is not offered")]
    NotOffered,
}

/// Failure to attach a subscriber to a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The publisher's connection list is full.
    #[error("publisher connection list is full")]
    TooManyConsumers,
}

/// Failures raised by the broker-resident port graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("port pool exhausted ({role} capacity {capacity})")]
    PortPoolExhausted { role: &'static str, capacity: u32 },
    #[error("unknown port handle {index}/{generation}")]
    UnknownHandle { index: u32, generation: u32 },
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Failures during segment creation or mapping.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("segment i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment {name:?} carries bad magic or version")]
    BadHeader { name: String },
    #[error("pool configuration is empty")]
    NoPools,
    #[error("pool entry with zero {what}")]
    ZeroSized { what: &'static str },
}

/// Failures on the client/broker control channel.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("control queue full")]
    QueueFull,
    #[error("timed out waiting for a broker reply")]
    Timeout,
    #[error("malformed control message (kind {kind})")]
    Malformed { kind: u8 },
    #[error("broker rejected the request: {0}")]
    Rejected(ReplyStatus),
    #[error(transparent)]
    Segment(#[from] SegmentError),
}

/// Status byte carried in every broker reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    PortPoolExhausted,
    TooManyConsumers,
    UnknownHandle,
    UnknownClient,
    Malformed,
}

impl ReplyStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::PortPoolExhausted,
            2 => ReplyStatus::TooManyConsumers,
            3 => ReplyStatus::UnknownHandle,
            4 => ReplyStatus::UnknownClient,
            _ => ReplyStatus::Malformed,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            ReplyStatus::Ok => 0,
            ReplyStatus::PortPoolExhausted => 1,
            ReplyStatus::TooManyConsumers => 2,
            ReplyStatus::UnknownHandle => 3,
            ReplyStatus::UnknownClient => 4,
            ReplyStatus::Malformed => 5,
        }
    }
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::PortPoolExhausted => "port pool exhausted",
            ReplyStatus::TooManyConsumers => "too many consumers",
            ReplyStatus::UnknownHandle => "unknown handle",
            ReplyStatus::UnknownClient => "unknown client",
            ReplyStatus::Malformed => "malformed message",
        };
        f.write_str(s)
    }
}

/// Single sink for invariant violations.
///
/// These indicate shared-memory corruption; continuing would propagate it to
/// peer processes, so the process is terminated immediately.
#[cold]
pub fn fatal(msg: &str) -> ! {
    log::error!("fatal invariant violation: {msg}");
    eprintln!("shmbus fatal: {msg}");
    std::process::abort();
}
