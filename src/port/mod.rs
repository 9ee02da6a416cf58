// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Port records and the port pool.
//
// Ports are the broker-visible endpoints. Their records live in a dedicated
// broker-owned segment so that publisher fan-out, subscriber consumption,
// and broker bookkeeping all observe the same state. Records are addressed
// by (slot index, generation): the generation is even while a slot is free
// and odd while it is live, so a stale handle from a removed port can never
// alias a reused slot.

pub mod publisher;
pub mod subscriber;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::queue::ChunkQueue;
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::shm_name;
use crate::spin_lock::SpinLock;

pub use publisher::PublisherPort;
pub use subscriber::{SubscriberPort, TakeResult};

/// Cap for each identifier string stored in shared memory.
pub const MAX_SERVICE_LEN: usize = 64;

/// How many subscribers one publisher can fan out to.
pub const MAX_SUBSCRIBERS_PER_PUBLISHER: usize = 32;

/// Upper bound on a publisher's history depth.
pub const MAX_HISTORY: usize = 16;

// ---------------------------------------------------------------------------
// Service identity
// ---------------------------------------------------------------------------

/// The three-part topic identity of a port, process-local form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceDescription {
    pub service: String,
    pub instance: String,
    pub event: String,
}

impl ServiceDescription {
    pub fn new(service: &str, instance: &str, event: &str) -> Self {
        Self {
            service: service.to_owned(),
            instance: instance.to_owned(),
            event: event.to_owned(),
        }
    }
}

impl std::fmt::Display for ServiceDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.instance, self.event)
    }
}

/// Copy `src` into a fixed capped buffer, null-terminated. Returns whether
/// the string was truncated.
pub(crate) fn copy_capped(dst: &mut [u8; MAX_SERVICE_LEN], src: &str) -> bool {
    let bytes = src.as_bytes();
    let len = bytes.len().min(MAX_SERVICE_LEN - 1);
    dst[..len].copy_from_slice(&bytes[..len]);
    dst[len] = 0;
    len < bytes.len()
}

pub(crate) fn capped_str(src: &[u8; MAX_SERVICE_LEN]) -> &str {
    let end = src.iter().position(|&b| b == 0).unwrap_or(MAX_SERVICE_LEN);
    std::str::from_utf8(&src[..end]).unwrap_or("")
}

/// The shared-memory form of a service identity: capped strings plus a
/// truncation flag.
#[repr(C)]
pub struct ServiceId {
    pub service: [u8; MAX_SERVICE_LEN],
    pub instance: [u8; MAX_SERVICE_LEN],
    pub event: [u8; MAX_SERVICE_LEN],
    pub truncated: u8,
}

impl ServiceId {
    pub fn write(&mut self, desc: &ServiceDescription) {
        let mut truncated = false;
        truncated |= copy_capped(&mut self.service, &desc.service);
        truncated |= copy_capped(&mut self.instance, &desc.instance);
        truncated |= copy_capped(&mut self.event, &desc.event);
        self.truncated = truncated as u8;
    }

    pub fn to_description(&self) -> ServiceDescription {
        ServiceDescription::new(
            capped_str(&self.service),
            capped_str(&self.instance),
            capped_str(&self.event),
        )
    }

    /// Exact string equality on all three identifier fields.
    pub fn matches(&self, desc: &ServiceDescription) -> bool {
        capped_str(&self.service) == desc.service
            && capped_str(&self.instance) == desc.instance
            && capped_str(&self.event) == desc.event
    }
}

// ---------------------------------------------------------------------------
// Roles, states, QoS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortRole {
    Publisher = 0,
    Subscriber = 1,
}

/// Publisher offer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OfferState {
    NotOffered = 0,
    OfferRequested = 1,
    Offered = 2,
    StopOfferRequested = 3,
}

impl OfferState {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => OfferState::OfferRequested,
            2 => OfferState::Offered,
            3 => OfferState::StopOfferRequested,
            _ => OfferState::NotOffered,
        }
    }

    /// Whether a publisher in this state accepts `send`.
    pub fn is_offering(self) -> bool {
        matches!(self, OfferState::Offered | OfferState::OfferRequested)
    }
}

/// Subscriber subscription state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    NotSubscribed = 0,
    SubscribeRequested = 1,
    Subscribed = 2,
    UnsubscribeRequested = 3,
    WaitForOffer = 4,
}

impl SubscriptionState {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => SubscriptionState::SubscribeRequested,
            2 => SubscriptionState::Subscribed,
            3 => SubscriptionState::UnsubscribeRequested,
            4 => SubscriptionState::WaitForOffer,
            _ => SubscriptionState::NotSubscribed,
        }
    }

    /// Whether a subscriber in this state receives live traffic.
    pub fn is_attached(self) -> bool {
        matches!(self, SubscriptionState::Subscribed)
    }
}

pub use crate::queue::OverflowPolicy;

/// Publisher-side QoS.
#[derive(Debug, Clone, Copy)]
pub struct PublisherOptions {
    /// Depth of the replay history ring (≤ [`MAX_HISTORY`]).
    pub history_capacity: u32,
    /// Whether the port starts out offered.
    pub initially_offered: bool,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            history_capacity: 0,
            initially_offered: true,
        }
    }
}

/// Subscriber-side QoS.
#[derive(Debug, Clone, Copy)]
pub struct SubscriberOptions {
    /// Delivery queue depth (≤ [`crate::queue::MAX_QUEUE_CAPACITY`]).
    pub queue_capacity: u32,
    /// How many history chunks to replay on late join.
    pub requested_history: u32,
    pub policy: OverflowPolicy,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            requested_history: 0,
            policy: OverflowPolicy::DiscardOldest,
        }
    }
}

// ---------------------------------------------------------------------------
// Port descriptor
// ---------------------------------------------------------------------------

/// Persistent identity of one port, written once at creation.
#[repr(C)]
pub struct PortDescriptor {
    pub service_id: ServiceId,
    /// 128-bit unique id (uuid bytes).
    pub uid: [u8; 16],
    /// Low 64 bits of `uid`; stamped into every chunk header this port
    /// sends.
    pub origin_id: u64,
    pub pid: i32,
    pub role: u8,
    _pad: [u8; 3],
}

impl PortDescriptor {
    /// Fill in place. `uid` is freshly generated.
    pub fn write(&mut self, desc: &ServiceDescription, pid: i32, role: PortRole) {
        self.service_id.write(desc);
        let uuid = uuid::Uuid::new_v4();
        self.uid = *uuid.as_bytes();
        self.origin_id = u64::from_le_bytes(self.uid[..8].try_into().unwrap());
        self.pid = pid;
        self.role = role as u8;
    }
}

// ---------------------------------------------------------------------------
// Shared port records
// ---------------------------------------------------------------------------

/// A packed connection-list entry: `(generation << 32) | (index + 1)`.
/// Zero means "empty slot".
pub(crate) fn pack_connection(index: u32, generation: u32) -> u64 {
    ((generation as u64) << 32) | (index as u64 + 1)
}

pub(crate) fn unpack_connection(entry: u64) -> Option<(u32, u32)> {
    if entry == 0 {
        return None;
    }
    let index = (entry & 0xFFFF_FFFF) as u32 - 1;
    let generation = (entry >> 32) as u32;
    Some((index, generation))
}

/// Shared record of a publisher port.
///
/// `history` and the connection list are mutated only under
/// `distributor_lock`; the lock bounds each critical section to at most one
/// history append plus one fan-out round.
#[repr(C)]
pub struct PublisherPortData {
    /// Even = slot free, odd = live.
    pub generation: AtomicU32,
    pub history_capacity: u32,
    pub descriptor: PortDescriptor,
    pub offer_state: AtomicU8,
    pub distributor_lock: SpinLock,
    pub connections: [AtomicU64; MAX_SUBSCRIBERS_PER_PUBLISHER],
    /// Replay ring; entries own one refcount each.
    pub history: [std::cell::UnsafeCell<crate::rel_ptr::RelPtr<crate::chunk::ChunkManagement>>;
        MAX_HISTORY],
    /// Total appends; the ring holds the last `history_len` of them.
    pub history_head: AtomicU64,
    pub history_len: AtomicU64,
    pub next_sequence: AtomicU64,
    /// Deliveries dropped on full REJECT_NEW queues or stale peers.
    pub dropped_deliveries: AtomicU64,
}

unsafe impl Sync for PublisherPortData {}

impl PublisherPortData {
    pub fn offer_state(&self) -> OfferState {
        OfferState::from_byte(self.offer_state.load(Ordering::Acquire))
    }

    pub fn set_offer_state(&self, s: OfferState) {
        self.offer_state.store(s as u8, Ordering::Release);
    }
}

/// Shared record of a subscriber port.
#[repr(C)]
pub struct SubscriberPortData {
    /// Even = slot free, odd = live.
    pub generation: AtomicU32,
    pub requested_history: u32,
    pub descriptor: PortDescriptor,
    pub sub_state: AtomicU8,
    /// Set while a waiter exists for this port.
    pub has_waiter: AtomicBool,
    pub queue: ChunkQueue,
}

impl SubscriberPortData {
    pub fn subscription_state(&self) -> SubscriptionState {
        SubscriptionState::from_byte(self.sub_state.load(Ordering::Acquire))
    }

    pub fn set_subscription_state(&self, s: SubscriptionState) {
        self.sub_state.store(s as u8, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Port pool — the broker-owned segment holding every port record
// ---------------------------------------------------------------------------

const PORT_SEGMENT_MAGIC: u32 = 0x5342_5553; // "SBUS"
const PORT_SEGMENT_VERSION: u32 = 1;

#[repr(C)]
struct PortSegmentHeader {
    magic: u32,
    version: u32,
    max_publishers: u32,
    max_subscribers: u32,
    publishers_offset: u64,
    subscribers_offset: u64,
    constructed: AtomicBool,
}

/// Process-local view of the port segment. The broker creates it; clients
/// open it during the handshake.
pub struct PortPool {
    shm: ShmHandle,
    max_publishers: u32,
    max_subscribers: u32,
    publishers_offset: usize,
    subscribers_offset: usize,
}

unsafe impl Send for PortPool {}
unsafe impl Sync for PortPool {}

impl PortPool {
    fn layout(max_publishers: u32, max_subscribers: u32) -> (usize, usize, usize) {
        let align64 = |v: usize| (v + 63) & !63;
        let publishers_offset = align64(std::mem::size_of::<PortSegmentHeader>());
        let subscribers_offset = align64(
            publishers_offset
                + max_publishers as usize * std::mem::size_of::<PublisherPortData>(),
        );
        let total = subscribers_offset
            + max_subscribers as usize * std::mem::size_of::<SubscriberPortData>();
        (publishers_offset, subscribers_offset, total)
    }

    /// Create the port segment (broker side). Fresh shm is zero-filled, and
    /// zero is exactly the "every slot free" state. Any leftover segment
    /// from a crashed broker is unlinked first; its records would carry
    /// stale generations and dangling chunk references.
    pub fn create(domain: &str, max_publishers: u32, max_subscribers: u32) -> io::Result<Self> {
        let (publishers_offset, subscribers_offset, total) =
            Self::layout(max_publishers, max_subscribers);
        let name = shm_name::port_segment_name(domain);
        ShmHandle::unlink_by_name(&name);
        let shm = ShmHandle::acquire(&name, total, ShmOpenMode::Create)?;

        let header = shm.as_mut_ptr() as *mut PortSegmentHeader;
        unsafe {
            (*header).magic = PORT_SEGMENT_MAGIC;
            (*header).version = PORT_SEGMENT_VERSION;
            (*header).max_publishers = max_publishers;
            (*header).max_subscribers = max_subscribers;
            (*header).publishers_offset = publishers_offset as u64;
            (*header).subscribers_offset = subscribers_offset as u64;
            (*header).constructed.store(true, Ordering::Release);
        }

        Ok(Self {
            shm,
            max_publishers,
            max_subscribers,
            publishers_offset,
            subscribers_offset,
        })
    }

    /// Open an existing port segment (client side). The capacities travel
    /// in the registration reply; every mapping of one segment must use
    /// the same size, so they are an input here, verified against the
    /// header after mapping.
    pub fn open(domain: &str, max_publishers: u32, max_subscribers: u32) -> io::Result<Self> {
        let name = shm_name::port_segment_name(domain);
        let (publishers_offset, subscribers_offset, total) =
            Self::layout(max_publishers, max_subscribers);
        let shm = ShmHandle::acquire(&name, total, ShmOpenMode::Open)?;

        let header = shm.as_ptr() as *const PortSegmentHeader;
        unsafe {
            if (*header).magic != PORT_SEGMENT_MAGIC
                || (*header).version != PORT_SEGMENT_VERSION
                || !(*header).constructed.load(Ordering::Acquire)
                || (*header).max_publishers != max_publishers
                || (*header).max_subscribers != max_subscribers
            {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "port segment header does not match the handshake",
                ));
            }
        }

        Ok(Self {
            shm,
            max_publishers,
            max_subscribers,
            publishers_offset,
            subscribers_offset,
        })
    }

    pub fn max_publishers(&self) -> u32 {
        self.max_publishers
    }

    pub fn max_subscribers(&self) -> u32 {
        self.max_subscribers
    }

    /// Pointer to publisher slot `index`. Panics on out-of-range index.
    pub fn publisher(&self, index: u32) -> *mut PublisherPortData {
        assert!(index < self.max_publishers, "publisher index out of range");
        unsafe {
            (self.shm.as_mut_ptr().add(self.publishers_offset) as *mut PublisherPortData)
                .add(index as usize)
        }
    }

    /// Pointer to subscriber slot `index`. Panics on out-of-range index.
    pub fn subscriber(&self, index: u32) -> *mut SubscriberPortData {
        assert!(index < self.max_subscribers, "subscriber index out of range");
        unsafe {
            (self.shm.as_mut_ptr().add(self.subscribers_offset) as *mut SubscriberPortData)
                .add(index as usize)
        }
    }

    /// Whether the publisher slot currently holds a live port of the given
    /// generation.
    pub fn publisher_live(&self, index: u32, generation: u32) -> bool {
        if index >= self.max_publishers {
            return false;
        }
        let data = unsafe { &*self.publisher(index) };
        let g = data.generation.load(Ordering::Acquire);
        g == generation && g % 2 == 1
    }

    /// Whether the subscriber slot currently holds a live port of the given
    /// generation.
    pub fn subscriber_live(&self, index: u32, generation: u32) -> bool {
        if index >= self.max_subscribers {
            return false;
        }
        let data = unsafe { &*self.subscriber(index) };
        let g = data.generation.load(Ordering::Acquire);
        g == generation && g % 2 == 1
    }

    /// Remove the backing segment by name.
    pub fn clear_storage(domain: &str) {
        ShmHandle::unlink_by_name(&shm_name::port_segment_name(domain));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_packing_roundtrip() {
        let e = pack_connection(7, 13);
        assert_eq!(unpack_connection(e), Some((7, 13)));
        assert_eq!(unpack_connection(0), None);
        // index 0 must not collide with the empty encoding
        let e0 = pack_connection(0, 0);
        assert_ne!(e0, 0);
        assert_eq!(unpack_connection(e0), Some((0, 0)));
    }

    #[test]
    fn capped_strings_roundtrip() {
        let mut id: ServiceId = unsafe { std::mem::zeroed() };
        id.write(&ServiceDescription::new("radar", "front", "objects"));
        assert_eq!(id.to_description(), ServiceDescription::new("radar", "front", "objects"));
        assert_eq!(id.truncated, 0);
        assert!(id.matches(&ServiceDescription::new("radar", "front", "objects")));
        assert!(!id.matches(&ServiceDescription::new("radar", "rear", "objects")));
    }

    #[test]
    fn over_long_identifier_sets_truncation_flag() {
        let mut id: ServiceId = unsafe { std::mem::zeroed() };
        let long = "x".repeat(MAX_SERVICE_LEN * 2);
        id.write(&ServiceDescription::new(&long, "i", "e"));
        assert_eq!(id.truncated, 1);
        assert_eq!(capped_str(&id.service).len(), MAX_SERVICE_LEN - 1);
    }
}
