// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Subscriber port: subscription state machine, wait-free consumption, and
// blocking wait-for-data through the port's waiter.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::chunk::Chunk;
use crate::port::{PortPool, SubscriberPortData, SubscriptionState};
use crate::shm_name;
use crate::waiter::Waiter;

/// One `take` outcome: possibly a chunk, plus the overflow flag which is
/// surfaced exactly once after the queue discarded anything since the last
/// take.
#[derive(Debug)]
pub struct TakeResult {
    pub chunk: Option<Chunk>,
    pub overflowed: bool,
}

/// User-facing handle to a subscriber port.
pub struct SubscriberPort {
    ports: Arc<PortPool>,
    domain: String,
    index: u32,
    generation: u32,
    waiter: Waiter,
}

impl SubscriberPort {
    pub(crate) fn new(
        ports: Arc<PortPool>,
        domain: &str,
        index: u32,
        generation: u32,
    ) -> io::Result<Self> {
        let waiter_name = shm_name::port_waiter_name(domain, index, generation);
        let waiter = Waiter::open(&waiter_name)?;
        let port = Self {
            ports,
            domain: domain.to_owned(),
            index,
            generation,
            waiter,
        };
        port.data().has_waiter.store(true, Ordering::Release);
        Ok(port)
    }

    /// Bind a user handle to a port record the broker created.
    pub fn from_handle(
        ports: Arc<PortPool>,
        domain: &str,
        handle: crate::graph::PortHandle,
    ) -> io::Result<Self> {
        Self::new(ports, domain, handle.index, handle.generation)
    }

    fn data(&self) -> &SubscriberPortData {
        unsafe { &*self.ports.subscriber(self.index) }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.data().subscription_state()
    }

    /// Ask to be attached to a matching offer. The broker completes the
    /// transition on its next tick.
    pub fn subscribe(&self) {
        let data = self.data();
        match data.subscription_state() {
            SubscriptionState::NotSubscribed | SubscriptionState::UnsubscribeRequested => {
                data.set_subscription_state(SubscriptionState::SubscribeRequested);
                log::debug!(
                    "subscriber {}: subscribe requested",
                    data.descriptor.service_id.to_description()
                );
            }
            _ => {}
        }
    }

    /// Ask to be detached. The broker completes the transition on its next
    /// tick.
    pub fn unsubscribe(&self) {
        let data = self.data();
        match data.subscription_state() {
            SubscriptionState::Subscribed
            | SubscriptionState::SubscribeRequested
            | SubscriptionState::WaitForOffer => {
                data.set_subscription_state(SubscriptionState::UnsubscribeRequested);
                log::debug!(
                    "subscriber {}: unsubscribe requested",
                    data.descriptor.service_id.to_description()
                );
            }
            _ => {}
        }
    }

    /// Pop one chunk from the delivery queue. Wait-free.
    pub fn take(&self) -> TakeResult {
        let data = self.data();
        let overflowed = data.queue.take_overflow_flag();
        let chunk = data
            .queue
            .try_pop()
            .map(|rel| unsafe { Chunk::from_rel(rel) });
        TakeResult { chunk, overflowed }
    }

    /// Release a taken chunk. Equivalent to dropping the handle; the last
    /// release returns the block to its pool.
    pub fn release(&self, chunk: Chunk) {
        drop(chunk);
    }

    /// Block until the delivery queue becomes non-empty, with an optional
    /// timeout. Returns `Ok(true)` if data is available.
    pub fn wait_for_chunks(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        let data = self.data();
        if !data.queue.is_empty() {
            return Ok(true);
        }
        self.waiter.wait_if(|| data.queue.is_empty(), timeout_ms)?;
        Ok(!data.queue.is_empty())
    }

    /// Abort a blocked [`wait_for_chunks`], now and for the rest of this
    /// handle's lifetime. Used on shutdown paths.
    ///
    /// [`wait_for_chunks`]: Self::wait_for_chunks
    pub fn cancel_wait(&self) {
        let _ = self.waiter.quit_waiting();
    }

    /// Number of chunks waiting in the delivery queue. Observational.
    pub fn queue_len(&self) -> usize {
        self.data().queue.len()
    }

    pub fn has_chunks(&self) -> bool {
        !self.data().queue.is_empty()
    }
}

impl Drop for SubscriberPort {
    fn drop(&mut self) {
        if !self.ports.subscriber_live(self.index, self.generation) {
            return;
        }
        let data = self.data();
        data.has_waiter.store(false, Ordering::Release);
        // Stop receiving, then drain whatever is queued so no refcount is
        // stranded; the broker reclaims the record itself.
        data.set_subscription_state(SubscriptionState::UnsubscribeRequested);
        while let Some(rel) = data.queue.try_pop() {
            crate::chunk::ChunkManagement::release(rel);
        }
        Waiter::clear_storage(&shm_name::port_waiter_name(
            &self.domain,
            self.index,
            self.generation,
        ));
    }
}
