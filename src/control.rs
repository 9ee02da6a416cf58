// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Client ↔ broker control channel.
//
// Messages are fixed-size, self-describing records: the first byte is the
// kind, strings are capped with a truncation flag, and nothing on the hot
// path allocates. Transport is a small shared-memory MPMC ring plus a
// waiter — one well-known request queue owned by the broker, one reply
// queue per registered client.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ControlError, ReplyStatus};
use crate::port::{capped_str, copy_capped, OverflowPolicy, PortRole, ServiceDescription};
use crate::queue::IndexQueue;
use crate::segment::SegmentInfo;
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::spin_lock;
use crate::waiter::Waiter;

/// Depth of each control ring. Power of two.
pub const CONTROL_QUEUE_DEPTH: usize = 16;

/// Segment records one RegApp reply can carry.
pub const MAX_SEGMENTS_PER_REPLY: usize = 8;

/// Capped length of names carried in control messages.
pub const MAX_NAME_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Message taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    RegApp = 1,
    UnregApp = 2,
    CreatePub = 3,
    CreateSub = 4,
    RemovePort = 5,
    KeepAlive = 6,
    RegAppReply = 7,
    CreatePubReply = 8,
    CreateSubReply = 9,
    RemovePortReply = 10,
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => MessageKind::RegApp,
            2 => MessageKind::UnregApp,
            3 => MessageKind::CreatePub,
            4 => MessageKind::CreateSub,
            5 => MessageKind::RemovePort,
            6 => MessageKind::KeepAlive,
            7 => MessageKind::RegAppReply,
            8 => MessageKind::CreatePubReply,
            9 => MessageKind::CreateSubReply,
            10 => MessageKind::RemovePortReply,
            _ => return None,
        })
    }
}

/// One segment entry inside a RegApp reply.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SegmentRecord {
    pub name: [u8; MAX_NAME_LEN],
    pub segment_id: u64,
    pub size: u64,
}

impl SegmentRecord {
    pub fn to_info(&self) -> SegmentInfo {
        SegmentInfo {
            name: capped_str(&self.name).to_owned(),
            segment_id: self.segment_id,
            size: self.size,
        }
    }
}

/// The fixed-size control record. Fields beyond `kind`/`status` are
/// meaningful per kind; unused ones stay zero.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ControlMessage {
    pub kind: u8,
    pub status: u8,
    pub truncated: u8,
    pub role: u8,
    pub pid: i32,
    /// Broker-assigned client identity; echoed in every later request.
    pub client_id: u64,
    pub port_index: u32,
    pub port_generation: u32,
    pub queue_capacity: u32,
    pub requested_history: u32,
    pub history_capacity: u32,
    pub policy: u8,
    pub initially_offered: u8,
    _pad: [u8; 2],
    pub app_name: [u8; MAX_NAME_LEN],
    pub service: [u8; MAX_NAME_LEN],
    pub instance: [u8; MAX_NAME_LEN],
    pub event: [u8; MAX_NAME_LEN],
    pub segment_count: u32,
    /// Port segment capacities (RegApp reply); every process must map the
    /// port segment with the same layout.
    pub max_publishers: u32,
    pub max_subscribers: u32,
    _pad2: u32,
    pub segments: [SegmentRecord; MAX_SEGMENTS_PER_REPLY],
}

impl ControlMessage {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_byte(self.kind)
    }

    pub fn status(&self) -> ReplyStatus {
        ReplyStatus::from_byte(self.status)
    }

    pub fn app_name_str(&self) -> &str {
        capped_str(&self.app_name)
    }

    pub fn service_description(&self) -> ServiceDescription {
        ServiceDescription::new(
            capped_str(&self.service),
            capped_str(&self.instance),
            capped_str(&self.event),
        )
    }

    fn set_service(&mut self, desc: &ServiceDescription) {
        let mut truncated = false;
        truncated |= copy_capped(&mut self.service, &desc.service);
        truncated |= copy_capped(&mut self.instance, &desc.instance);
        truncated |= copy_capped(&mut self.event, &desc.event);
        self.truncated |= truncated as u8;
    }

    // -- request constructors ---------------------------------------------

    pub fn reg_app(app_name: &str, pid: i32) -> Self {
        let mut m = Self::zeroed();
        m.kind = MessageKind::RegApp as u8;
        m.pid = pid;
        m.truncated = copy_capped(&mut m.app_name, app_name) as u8;
        m
    }

    pub fn unreg_app(client_id: u64, pid: i32) -> Self {
        let mut m = Self::zeroed();
        m.kind = MessageKind::UnregApp as u8;
        m.client_id = client_id;
        m.pid = pid;
        m
    }

    pub fn keep_alive(client_id: u64, pid: i32) -> Self {
        let mut m = Self::zeroed();
        m.kind = MessageKind::KeepAlive as u8;
        m.client_id = client_id;
        m.pid = pid;
        m
    }

    pub fn create_pub(
        client_id: u64,
        pid: i32,
        desc: &ServiceDescription,
        history_capacity: u32,
        initially_offered: bool,
    ) -> Self {
        let mut m = Self::zeroed();
        m.kind = MessageKind::CreatePub as u8;
        m.client_id = client_id;
        m.pid = pid;
        m.history_capacity = history_capacity;
        m.initially_offered = initially_offered as u8;
        m.set_service(desc);
        m
    }

    pub fn create_sub(
        client_id: u64,
        pid: i32,
        desc: &ServiceDescription,
        queue_capacity: u32,
        requested_history: u32,
        policy: OverflowPolicy,
    ) -> Self {
        let mut m = Self::zeroed();
        m.kind = MessageKind::CreateSub as u8;
        m.client_id = client_id;
        m.pid = pid;
        m.queue_capacity = queue_capacity;
        m.requested_history = requested_history;
        m.policy = policy as u8;
        m.set_service(desc);
        m
    }

    pub fn remove_port(client_id: u64, pid: i32, role: PortRole, index: u32, generation: u32) -> Self {
        let mut m = Self::zeroed();
        m.kind = MessageKind::RemovePort as u8;
        m.client_id = client_id;
        m.pid = pid;
        m.role = role as u8;
        m.port_index = index;
        m.port_generation = generation;
        m
    }

    // -- reply constructors -----------------------------------------------

    pub fn reg_app_reply(
        client_id: u64,
        segments: &[SegmentInfo],
        max_publishers: u32,
        max_subscribers: u32,
    ) -> Self {
        let mut m = Self::zeroed();
        m.kind = MessageKind::RegAppReply as u8;
        m.status = ReplyStatus::Ok.as_byte();
        m.client_id = client_id;
        m.max_publishers = max_publishers;
        m.max_subscribers = max_subscribers;
        m.segment_count = segments.len().min(MAX_SEGMENTS_PER_REPLY) as u32;
        for (i, s) in segments.iter().take(MAX_SEGMENTS_PER_REPLY).enumerate() {
            let mut rec: SegmentRecord = unsafe { std::mem::zeroed() };
            copy_capped(&mut rec.name, &s.name);
            rec.segment_id = s.segment_id;
            rec.size = s.size;
            m.segments[i] = rec;
        }
        m
    }

    pub fn port_reply(kind: MessageKind, status: ReplyStatus, index: u32, generation: u32) -> Self {
        let mut m = Self::zeroed();
        m.kind = kind as u8;
        m.status = status.as_byte();
        m.port_index = index;
        m.port_generation = generation;
        m
    }

    pub fn segment_infos(&self) -> Vec<SegmentInfo> {
        (0..self.segment_count.min(MAX_SEGMENTS_PER_REPLY as u32))
            .map(|i| self.segments[i as usize].to_info())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ControlQueue — shared-memory transport
// ---------------------------------------------------------------------------

#[repr(C)]
struct ControlQueueShm {
    constructed: AtomicBool,
    _pad: [u8; 63],
    queue: IndexQueue<ControlMessage, CONTROL_QUEUE_DEPTH>,
}

/// A named control ring with wake-up support.
pub struct ControlQueue {
    shm: ShmHandle,
    waiter: Waiter,
    name: String,
}

impl ControlQueue {
    /// Open or create a named control queue. The creator constructs the
    /// ring; late openers wait until construction is visible.
    pub fn open(name: &str) -> io::Result<Self> {
        let shm = ShmHandle::acquire(
            name,
            std::mem::size_of::<ControlQueueShm>(),
            ShmOpenMode::CreateOrOpen,
        )?;
        let data = shm.as_mut_ptr() as *mut ControlQueueShm;
        if shm.is_creator() {
            unsafe {
                IndexQueue::init_in_place(
                    std::ptr::addr_of_mut!((*data).queue),
                    CONTROL_QUEUE_DEPTH,
                );
                (*data).constructed.store(true, Ordering::Release);
            }
        } else {
            let constructed = unsafe { &(*data).constructed };
            let mut k = 0u32;
            while !constructed.load(Ordering::Acquire) {
                spin_lock::backoff(&mut k);
            }
        }
        let waiter = Waiter::open(name)?;
        Ok(Self {
            shm,
            waiter,
            name: name.to_owned(),
        })
    }

    fn queue(&self) -> &IndexQueue<ControlMessage, CONTROL_QUEUE_DEPTH> {
        unsafe { &(*(self.shm.as_ptr() as *const ControlQueueShm)).queue }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a message and wake the receiver.
    pub fn push(&self, msg: &ControlMessage) -> Result<(), ControlError> {
        self.queue()
            .try_push(*msg)
            .map_err(|_| ControlError::QueueFull)?;
        let _ = self.waiter.broadcast();
        Ok(())
    }

    /// Dequeue without blocking.
    pub fn try_pop(&self) -> Option<ControlMessage> {
        self.queue().try_pop()
    }

    /// Dequeue, blocking up to `timeout_ms`. `None` timeout blocks until a
    /// message or a quit signal arrives.
    pub fn recv(&self, timeout_ms: Option<u64>) -> io::Result<Option<ControlMessage>> {
        if let Some(m) = self.try_pop() {
            return Ok(Some(m));
        }
        self.waiter
            .wait_if(|| self.queue().is_empty(), timeout_ms)?;
        Ok(self.try_pop())
    }

    /// Wake any blocked receiver so it can observe shutdown.
    pub fn interrupt(&self) {
        let _ = self.waiter.quit_waiting();
    }

    /// Remove the backing storage for a named control queue.
    pub fn clear_storage(name: &str) {
        ShmHandle::unlink_by_name(name);
        Waiter::clear_storage(name);
    }
}
