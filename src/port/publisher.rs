// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Publisher port: offer state machine, replay history, and chunk fan-out.
//
// The distributor (history + connection list) is guarded by a spin lock
// with bounded critical sections: one history append plus at most one push
// per connected subscriber. Broker-side connect/disconnect take the same
// lock, which is what keeps history replay and live traffic from ever
// interleaving. Everything the subscriber touches stays lock-free.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunk::{Chunk, ChunkManagement};
use crate::error::{ConnectError, LoanError, SendError};
use crate::memory::MemoryManager;
use crate::port::{
    pack_connection, unpack_connection, OfferState, PortPool, PublisherPortData,
    MAX_HISTORY,
};
use crate::queue::PushOutcome;
use crate::rel_ptr::RelPtr;
use crate::shm_name;
use crate::waiter::Waiter;

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl PublisherPortData {
    fn history_slot(&self, pos: u64) -> *mut RelPtr<ChunkManagement> {
        self.history[(pos % MAX_HISTORY as u64) as usize].get()
    }

    /// Append to the history ring. Returns the evicted oldest entry when
    /// the ring was full. Caller must hold `distributor_lock`.
    fn history_append(&self, rel: RelPtr<ChunkManagement>) -> Option<RelPtr<ChunkManagement>> {
        let head = self.history_head.load(Ordering::Relaxed);
        let len = self.history_len.load(Ordering::Relaxed);
        let evicted = if len == self.history_capacity as u64 {
            let oldest = unsafe { *self.history_slot(head - len) };
            self.history_len.store(len - 1, Ordering::Relaxed);
            Some(oldest)
        } else {
            None
        };
        unsafe { *self.history_slot(head) = rel };
        self.history_head.store(head + 1, Ordering::Relaxed);
        self.history_len
            .store(self.history_len.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
        evicted
    }

    /// Release every history entry. Caller must hold `distributor_lock`.
    pub(crate) fn drain_history(&self) {
        let head = self.history_head.load(Ordering::Relaxed);
        let len = self.history_len.load(Ordering::Relaxed);
        for i in 0..len {
            let rel = unsafe { *self.history_slot(head - len + i) };
            ChunkManagement::release(rel);
        }
        self.history_len.store(0, Ordering::Relaxed);
    }

    /// Push one counted reference into a connected subscriber's queue.
    /// Returns `true` if the subscriber should be woken.
    fn deliver_to(
        &self,
        ports: &PortPool,
        entry_cell: &std::sync::atomic::AtomicU64,
        rel: RelPtr<ChunkManagement>,
    ) -> bool {
        let entry = entry_cell.load(Ordering::Acquire);
        let (index, generation) = match unpack_connection(entry) {
            Some(pair) => pair,
            None => return false,
        };
        if !ports.subscriber_live(index, generation) {
            // Peer is gone; drop the stale entry silently.
            entry_cell.store(0, Ordering::Release);
            self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let sub = unsafe { &*ports.subscriber(index) };
        if !sub.subscription_state().is_attached() {
            return false;
        }

        // Count the reference before it becomes visible to the consumer.
        unsafe { &*rel.get() }.increment_ref();
        match sub.queue.try_push(rel) {
            PushOutcome::Pushed => true,
            PushOutcome::Evicted(old) => {
                ChunkManagement::release(old);
                true
            }
            PushOutcome::Full => {
                // REJECT_NEW: roll the increment back.
                ChunkManagement::release(rel);
                self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Distribute one sent chunk: history append, then fan-out. Returns the
    /// connection entries whose subscribers should be woken.
    pub(crate) fn distribute(
        &self,
        ports: &PortPool,
        rel: RelPtr<ChunkManagement>,
    ) -> Vec<u64> {
        let mut wake = Vec::with_capacity(self.connections.len());
        self.distributor_lock.with(|| {
            if self.history_capacity > 0 {
                if let Some(old) = self.history_append(rel) {
                    ChunkManagement::release(old);
                }
            }
            for entry_cell in &self.connections {
                if self.deliver_to(ports, entry_cell, rel) {
                    wake.push(entry_cell.load(Ordering::Relaxed));
                }
            }
        });
        if self.history_capacity == 0 {
            // No history to park the loan reference in; the queues hold
            // their own counts now.
            ChunkManagement::release(rel);
        }
        wake
    }

    /// Attach a subscriber: replay up to `requested_history` most recent
    /// history chunks in send order, then enter it into the connection
    /// list. Replay-before-enter is what delivers history strictly before
    /// live traffic.
    pub(crate) fn connect_subscriber(
        &self,
        ports: &PortPool,
        sub_index: u32,
        sub_generation: u32,
        requested_history: u32,
    ) -> Result<(), ConnectError> {
        self.distributor_lock.with(|| {
            let packed = pack_connection(sub_index, sub_generation);
            let free = self
                .connections
                .iter()
                .find(|c| c.load(Ordering::Relaxed) == 0)
                .ok_or(ConnectError::TooManyConsumers)?;

            let sub = unsafe { &*ports.subscriber(sub_index) };
            let head = self.history_head.load(Ordering::Relaxed);
            let len = self.history_len.load(Ordering::Relaxed);
            let replay = (requested_history as u64).min(len);
            for i in 0..replay {
                let rel = unsafe { *self.history_slot(head - replay + i) };
                unsafe { &*rel.get() }.increment_ref();
                match sub.queue.try_push(rel) {
                    PushOutcome::Pushed => {}
                    PushOutcome::Evicted(old) => ChunkManagement::release(old),
                    PushOutcome::Full => {
                        ChunkManagement::release(rel);
                        self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            free.store(packed, Ordering::Release);
            Ok(())
        })
    }

    /// Remove a subscriber from the connection list. Chunks already in its
    /// queue keep their counts; the subscriber releases them on consumption
    /// or teardown.
    pub(crate) fn disconnect_subscriber(&self, sub_index: u32, sub_generation: u32) {
        let packed = pack_connection(sub_index, sub_generation);
        self.distributor_lock.with(|| {
            for entry_cell in &self.connections {
                if entry_cell.load(Ordering::Relaxed) == packed {
                    entry_cell.store(0, Ordering::Release);
                }
            }
        });
    }

    /// Number of live connection entries. Observational.
    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) != 0)
            .count()
    }
}

/// User-facing handle to a publisher port.
///
/// One producer per port: `send` takes `&mut self`.
pub struct PublisherPort {
    ports: Arc<PortPool>,
    memory: Arc<MemoryManager>,
    domain: String,
    index: u32,
    generation: u32,
    /// Lazily opened waiters, keyed by packed connection entry. `None`
    /// records an open failure so it is not retried on every send.
    waiters: HashMap<u64, Option<Waiter>>,
}

impl std::fmt::Debug for PublisherPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherPort")
            .field("domain", &self.domain)
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

impl PublisherPort {
    pub(crate) fn new(
        ports: Arc<PortPool>,
        memory: Arc<MemoryManager>,
        domain: &str,
        index: u32,
        generation: u32,
    ) -> Self {
        Self {
            ports,
            memory,
            domain: domain.to_owned(),
            index,
            generation,
            waiters: HashMap::new(),
        }
    }

    /// Bind a user handle to a port record the broker created.
    pub fn from_handle(
        ports: Arc<PortPool>,
        memory: Arc<MemoryManager>,
        domain: &str,
        handle: crate::graph::PortHandle,
    ) -> Self {
        Self::new(ports, memory, domain, handle.index, handle.generation)
    }

    fn data(&self) -> &PublisherPortData {
        unsafe { &*self.ports.publisher(self.index) }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn offer_state(&self) -> OfferState {
        self.data().offer_state()
    }

    /// Advertise willingness to deliver. The broker completes the
    /// transition and attaches waiting subscribers on its next tick.
    pub fn offer(&mut self) {
        let data = self.data();
        if data.offer_state() == OfferState::NotOffered {
            data.set_offer_state(OfferState::OfferRequested);
            log::debug!(
                "publisher {}: offer requested",
                data.descriptor.service_id.to_description()
            );
        }
    }

    /// Withdraw the offer. The broker detaches subscribers on its next
    /// tick.
    pub fn stop_offer(&mut self) {
        let data = self.data();
        if data.offer_state().is_offering() {
            data.set_offer_state(OfferState::StopOfferRequested);
            log::debug!(
                "publisher {}: stop offer requested",
                data.descriptor.service_id.to_description()
            );
        }
    }

    /// Loan a chunk for in-place writing.
    pub fn loan(&self, payload_size: u64, payload_align: u32) -> Result<Chunk, LoanError> {
        self.memory.loan(payload_size, payload_align)
    }

    /// Send a loaned chunk: stamp it, park it in history, fan it out, wake
    /// the receivers. Returns the number of queues the chunk was delivered
    /// to.
    pub fn send(&mut self, mut chunk: Chunk) -> Result<usize, SendError> {
        let data = self.data();
        if !data.offer_state().is_offering() {
            // The chunk handle drops here, releasing its reference.
            return Err(SendError::NotOffered);
        }

        let sequence = data.next_sequence.fetch_add(1, Ordering::Relaxed);
        {
            let header = chunk.header_mut();
            header.origin_id = data.descriptor.origin_id;
            header.sequence = sequence;
            header.timestamp_ns = now_ns();
        }

        let rel = chunk.into_rel();
        let wake = data.distribute(&self.ports, rel);
        let delivered = wake.len();

        for entry in wake {
            self.signal(entry);
        }
        Ok(delivered)
    }

    fn signal(&mut self, entry: u64) {
        let (index, generation) = match unpack_connection(entry) {
            Some(pair) => pair,
            None => return,
        };
        let domain = &self.domain;
        let waiter = self.waiters.entry(entry).or_insert_with(|| {
            let name = shm_name::port_waiter_name(domain, index, generation);
            match Waiter::open(&name) {
                Ok(w) => Some(w),
                Err(e) => {
                    log::warn!("publisher: cannot open waiter {name}: {e}");
                    None
                }
            }
        });
        if let Some(w) = waiter {
            let _ = w.notify();
        }
    }

    /// Number of connected subscribers. Observational.
    pub fn subscriber_count(&self) -> usize {
        self.data().connection_count()
    }

    /// Deliveries dropped on full REJECT_NEW queues or stale peers.
    pub fn dropped_deliveries(&self) -> u64 {
        self.data().dropped_deliveries.load(Ordering::Relaxed)
    }
}

impl Drop for PublisherPort {
    fn drop(&mut self) {
        if self.ports.publisher_live(self.index, self.generation) {
            let data = self.data();
            if data.offer_state().is_offering() {
                data.set_offer_state(OfferState::StopOfferRequested);
            }
        }
    }
}
