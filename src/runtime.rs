// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Client-side runtime: the handshake with the broker, segment mapping, and
// the port factory.
//
// Handshake:
//   1. open the well-known broker request queue and send RegApp
//   2. receive {client id, segment list} on the client's reply queue
//   3. map every segment read/write and register it with the relative-
//      pointer table
// After that, ports are created and removed through request/reply pairs;
// data flow itself never touches the control channel again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::control::{ControlMessage, ControlQueue, MessageKind};
use crate::error::{ControlError, ReplyStatus};
use crate::graph::PortHandle;
use crate::memory::MemoryManager;
use crate::platform::posix::current_pid;
use crate::port::{
    PortPool, PortRole, PublisherOptions, PublisherPort, ServiceDescription, SubscriberOptions,
    SubscriberPort,
};
use crate::segment::DataSegment;
use crate::shm_name;

/// How long a client waits for any broker reply.
const REPLY_TIMEOUT_MS: u64 = 5000;

/// A registered client's connection to the broker.
pub struct Runtime {
    domain: String,
    app_name: String,
    pid: i32,
    client_id: u64,
    req: ControlQueue,
    reply: ControlQueue,
    _segments: Vec<DataSegment>,
    memory: Arc<MemoryManager>,
    ports: Arc<PortPool>,
}

impl Runtime {
    /// Register with the broker for `domain` and map its segments.
    pub fn connect(domain: &str, app_name: &str) -> Result<Self, ControlError> {
        let pid = current_pid();
        let req = ControlQueue::open(&shm_name::broker_queue_name(domain))?;
        let reply = ControlQueue::open(&shm_name::reply_queue_name(domain, app_name, pid))?;

        req.push(&ControlMessage::reg_app(app_name, pid))?;
        let ack = wait_for(&reply, MessageKind::RegAppReply)?;
        let client_id = ack.client_id;

        let mut segments = Vec::new();
        for info in ack.segment_infos() {
            segments.push(DataSegment::open(&info)?);
        }
        if segments.is_empty() {
            return Err(ControlError::Malformed {
                kind: MessageKind::RegAppReply as u8,
            });
        }
        let memory = Arc::clone(segments[0].memory());
        let ports = Arc::new(PortPool::open(
            domain,
            ack.max_publishers,
            ack.max_subscribers,
        )?);

        log::info!("runtime: {app_name} registered with broker as client {client_id}");
        Ok(Self {
            domain: domain.to_owned(),
            app_name: app_name.to_owned(),
            pid,
            client_id,
            req,
            reply,
            _segments: segments,
            memory,
            ports,
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// The allocator of the default payload segment.
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    fn request(
        &self,
        msg: &ControlMessage,
        expected: MessageKind,
    ) -> Result<ControlMessage, ControlError> {
        self.req.push(msg)?;
        let reply = wait_for(&self.reply, expected)?;
        match reply.status() {
            ReplyStatus::Ok => Ok(reply),
            status => Err(ControlError::Rejected(status)),
        }
    }

    /// Ask the broker for a publisher port.
    pub fn create_publisher(
        &self,
        desc: &ServiceDescription,
        options: &PublisherOptions,
    ) -> Result<PublisherPort, ControlError> {
        let msg = ControlMessage::create_pub(
            self.client_id,
            self.pid,
            desc,
            options.history_capacity,
            options.initially_offered,
        );
        let reply = self.request(&msg, MessageKind::CreatePubReply)?;
        Ok(PublisherPort::new(
            Arc::clone(&self.ports),
            Arc::clone(&self.memory),
            &self.domain,
            reply.port_index,
            reply.port_generation,
        ))
    }

    /// Ask the broker for a subscriber port.
    pub fn create_subscriber(
        &self,
        desc: &ServiceDescription,
        options: &SubscriberOptions,
    ) -> Result<SubscriberPort, ControlError> {
        let msg = ControlMessage::create_sub(
            self.client_id,
            self.pid,
            desc,
            options.queue_capacity,
            options.requested_history,
            options.policy,
        );
        let reply = self.request(&msg, MessageKind::CreateSubReply)?;
        SubscriberPort::new(
            Arc::clone(&self.ports),
            &self.domain,
            reply.port_index,
            reply.port_generation,
        )
        .map_err(ControlError::Io)
    }

    /// Release a port explicitly. Dropping the port handle alone leaves the
    /// record to the broker's liveness sweep.
    pub fn remove_port(
        &self,
        role: PortRole,
        index: u32,
        generation: u32,
    ) -> Result<(), ControlError> {
        let msg = ControlMessage::remove_port(self.client_id, self.pid, role, index, generation);
        self.request(&msg, MessageKind::RemovePortReply)?;
        Ok(())
    }

    /// Remove a port by graph handle.
    pub fn remove_handle(&self, handle: PortHandle) -> Result<(), ControlError> {
        self.remove_port(handle.role, handle.index, handle.generation)
    }

    /// Refresh this process's liveness epoch. Call at least once per
    /// keep-alive threshold.
    pub fn keep_alive(&self) {
        let _ = self
            .req
            .push(&ControlMessage::keep_alive(self.client_id, self.pid));
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Best effort; a crashed client is reclaimed by discovery instead.
        let _ = self
            .req
            .push(&ControlMessage::unreg_app(self.client_id, self.pid));
        ControlQueue::clear_storage(&shm_name::reply_queue_name(
            &self.domain,
            &self.app_name,
            self.pid,
        ));
    }
}

/// Wait for a reply of the expected kind, skipping anything else.
fn wait_for(queue: &ControlQueue, expected: MessageKind) -> Result<ControlMessage, ControlError> {
    let deadline = Instant::now() + Duration::from_millis(REPLY_TIMEOUT_MS);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ControlError::Timeout);
        }
        match queue.recv(Some(remaining.as_millis() as u64))? {
            Some(msg) if msg.kind() == Some(expected) => return Ok(msg),
            Some(other) => {
                log::debug!(
                    "runtime: ignoring out-of-order reply kind {:?}",
                    other.kind()
                );
            }
            None => {}
        }
    }
}
