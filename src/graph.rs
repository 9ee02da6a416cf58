// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// The broker-resident port graph: a registry of every live port, the
// matching policy between offers and subscriptions, and the liveness sweep
// that reclaims everything a dead process left behind.
//
// The graph itself is mutated only on the broker's dispatch thread; the
// shared port records it manipulates are synchronised through their own
// locks and atomics.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chunk::ChunkManagement;
use crate::error::{ConnectError, GraphError};
use crate::platform::posix::is_pid_alive;
use crate::port::{
    pack_connection, OfferState, PortPool, PortRole, PublisherOptions, ServiceDescription,
    SubscriberOptions, SubscriptionState, MAX_HISTORY,
};
use crate::queue::ChunkQueue;
use crate::shm_name;
use crate::waiter::Waiter;

/// Opaque identity of one port, as handed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortHandle {
    pub role: PortRole,
    pub index: u32,
    pub generation: u32,
}

struct GraphEntry {
    role: PortRole,
    index: u32,
    generation: u32,
    desc: ServiceDescription,
    pid: i32,
}

struct ProcessEntry {
    app_name: String,
    last_seen: Instant,
}

/// Broker-side registry and matcher.
pub struct PortGraph {
    domain: String,
    ports: Arc<PortPool>,
    entries: Vec<GraphEntry>,
    processes: HashMap<i32, ProcessEntry>,
}

impl PortGraph {
    pub fn new(domain: &str, ports: Arc<PortPool>) -> Self {
        Self {
            domain: domain.to_owned(),
            ports,
            entries: Vec::new(),
            processes: HashMap::new(),
        }
    }

    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    // -- process ledger ----------------------------------------------------

    /// Record a registered client process.
    pub fn register_process(&mut self, pid: i32, app_name: &str, now: Instant) {
        log::debug!("graph: process {app_name} (pid {pid}) registered");
        self.processes.insert(
            pid,
            ProcessEntry {
                app_name: app_name.to_owned(),
                last_seen: now,
            },
        );
    }

    /// Refresh a process's liveness epoch.
    pub fn keep_alive(&mut self, pid: i32, now: Instant) {
        if let Some(p) = self.processes.get_mut(&pid) {
            p.last_seen = now;
        }
    }

    /// Remove a process and everything it owned.
    pub fn deregister_process(&mut self, pid: i32) -> usize {
        let removed = self.remove_ports_of(pid);
        if let Some(p) = self.processes.remove(&pid) {
            log::debug!(
                "graph: process {} (pid {pid}) deregistered, {removed} ports reclaimed",
                p.app_name
            );
        }
        removed
    }

    // -- port creation -----------------------------------------------------

    /// Allocate a publisher port, insert it into the registry, and attach
    /// every waiting subscriber whose subscription matches.
    pub fn create_publisher(
        &mut self,
        desc: &ServiceDescription,
        options: &PublisherOptions,
        pid: i32,
    ) -> Result<PortHandle, GraphError> {
        let index = self.find_free_publisher().ok_or(GraphError::PortPoolExhausted {
            role: "publisher",
            capacity: self.ports.max_publishers(),
        })?;

        let data_ptr = self.ports.publisher(index);
        let generation = unsafe {
            let data = &mut *data_ptr;
            data.descriptor.write(desc, pid, PortRole::Publisher);
            data.history_capacity = options.history_capacity.min(MAX_HISTORY as u32);
            data.history_head.store(0, Ordering::Relaxed);
            data.history_len.store(0, Ordering::Relaxed);
            data.next_sequence.store(0, Ordering::Relaxed);
            data.dropped_deliveries.store(0, Ordering::Relaxed);
            for c in &data.connections {
                c.store(0, Ordering::Relaxed);
            }
            data.set_offer_state(if options.initially_offered {
                OfferState::Offered
            } else {
                OfferState::NotOffered
            });
            let generation = data.generation.load(Ordering::Relaxed) + 1;
            data.generation.store(generation, Ordering::Release);
            generation
        };

        self.entries.push(GraphEntry {
            role: PortRole::Publisher,
            index,
            generation,
            desc: desc.clone(),
            pid,
        });
        log::debug!("graph: publisher {desc} created at {index}/{generation}");

        if options.initially_offered {
            self.attach_waiting_subscribers(index);
        }

        Ok(PortHandle {
            role: PortRole::Publisher,
            index,
            generation,
        })
    }

    /// Allocate a subscriber port in SUBSCRIBE_REQUESTED state and attach
    /// it to every matching offered publisher; with no match it rests in
    /// WAIT_FOR_OFFER until one appears.
    pub fn create_subscriber(
        &mut self,
        desc: &ServiceDescription,
        options: &SubscriberOptions,
        pid: i32,
    ) -> Result<PortHandle, GraphError> {
        let index = self.find_free_subscriber().ok_or(GraphError::PortPoolExhausted {
            role: "subscriber",
            capacity: self.ports.max_subscribers(),
        })?;

        let data_ptr = self.ports.subscriber(index);
        let generation = unsafe {
            let data = &mut *data_ptr;
            data.descriptor.write(desc, pid, PortRole::Subscriber);
            data.requested_history = options.requested_history;
            ChunkQueue::init_in_place(
                std::ptr::addr_of_mut!(data.queue),
                options.queue_capacity as usize,
                options.policy,
            );
            data.has_waiter.store(false, Ordering::Relaxed);
            data.set_subscription_state(SubscriptionState::SubscribeRequested);
            let generation = data.generation.load(Ordering::Relaxed) + 1;
            data.generation.store(generation, Ordering::Release);
            generation
        };

        self.entries.push(GraphEntry {
            role: PortRole::Subscriber,
            index,
            generation,
            desc: desc.clone(),
            pid,
        });
        log::debug!("graph: subscriber {desc} created at {index}/{generation}");

        // A full connection list on some publisher leaves the port in
        // WAIT_FOR_OFFER; the port itself is still valid.
        let _ = self.attach_subscriber(index, generation);

        Ok(PortHandle {
            role: PortRole::Subscriber,
            index,
            generation,
        })
    }

    /// Remove a port: detach every peer, return outstanding chunk
    /// references, and free the slot.
    pub fn remove_port(&mut self, handle: PortHandle) -> Result<(), GraphError> {
        let pos = self
            .entries
            .iter()
            .position(|e| {
                e.role == handle.role
                    && e.index == handle.index
                    && e.generation == handle.generation
            })
            .ok_or(GraphError::UnknownHandle {
                index: handle.index,
                generation: handle.generation,
            })?;
        let entry = self.entries.remove(pos);
        match entry.role {
            PortRole::Publisher => self.teardown_publisher(entry.index),
            PortRole::Subscriber => self.teardown_subscriber(entry.index, entry.generation),
        }
        Ok(())
    }

    // -- discovery ---------------------------------------------------------

    /// One pass of the broker's periodic discovery:
    /// completes requested offer/subscription transitions, then reclaims
    /// the ports of every process whose liveness epoch is stale or whose
    /// pid is gone. Returns the number of ports reclaimed.
    pub fn discovery_tick(&mut self, now: Instant, keep_alive_threshold: Duration) -> usize {
        // Publisher state transitions.
        let pub_indices: Vec<(u32, u32)> = self
            .entries
            .iter()
            .filter(|e| e.role == PortRole::Publisher)
            .map(|e| (e.index, e.generation))
            .collect();
        for (index, _) in &pub_indices {
            let data = unsafe { &*self.ports.publisher(*index) };
            match data.offer_state() {
                OfferState::OfferRequested => {
                    data.set_offer_state(OfferState::Offered);
                    self.attach_waiting_subscribers(*index);
                }
                OfferState::StopOfferRequested => {
                    self.detach_all_subscribers(*index);
                    data.set_offer_state(OfferState::NotOffered);
                }
                _ => {}
            }
        }

        // Subscriber state transitions.
        let sub_entries: Vec<(u32, u32)> = self
            .entries
            .iter()
            .filter(|e| e.role == PortRole::Subscriber)
            .map(|e| (e.index, e.generation))
            .collect();
        for (index, generation) in sub_entries {
            let data = unsafe { &*self.ports.subscriber(index) };
            match data.subscription_state() {
                SubscriptionState::SubscribeRequested | SubscriptionState::WaitForOffer => {
                    let _ = self.attach_subscriber(index, generation);
                }
                SubscriptionState::UnsubscribeRequested => {
                    self.detach_subscriber_from_all(index, generation);
                    data.set_subscription_state(SubscriptionState::NotSubscribed);
                }
                _ => {}
            }
        }

        // Liveness sweep.
        let mut dead_pids: Vec<i32> = self
            .processes
            .iter()
            .filter(|(pid, p)| {
                now.duration_since(p.last_seen) > keep_alive_threshold || !is_pid_alive(**pid)
            })
            .map(|(pid, _)| *pid)
            .collect();
        // Ports owned by processes that never registered are swept by pid
        // probe alone.
        for e in &self.entries {
            if !self.processes.contains_key(&e.pid)
                && !is_pid_alive(e.pid)
                && !dead_pids.contains(&e.pid)
            {
                dead_pids.push(e.pid);
            }
        }

        let mut removed = 0;
        for pid in dead_pids {
            if let Some(p) = self.processes.remove(&pid) {
                log::warn!(
                    "graph: process {} (pid {pid}) is gone, reclaiming its ports",
                    p.app_name
                );
            }
            removed += self.remove_ports_of(pid);
        }
        removed
    }

    // -- observation -------------------------------------------------------

    pub fn publisher_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.role == PortRole::Publisher)
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.role == PortRole::Subscriber)
            .count()
    }

    /// Whether any live publisher currently offers this service.
    pub fn has_offer(&self, desc: &ServiceDescription) -> bool {
        self.entries.iter().any(|e| {
            e.role == PortRole::Publisher && e.desc == *desc && {
                let data = unsafe { &*self.ports.publisher(e.index) };
                data.offer_state().is_offering()
            }
        })
    }

    // -- internals ---------------------------------------------------------

    fn find_free_publisher(&self) -> Option<u32> {
        (0..self.ports.max_publishers()).find(|&i| {
            let data = unsafe { &*self.ports.publisher(i) };
            data.generation.load(Ordering::Acquire) % 2 == 0
        })
    }

    fn find_free_subscriber(&self) -> Option<u32> {
        (0..self.ports.max_subscribers()).find(|&i| {
            let data = unsafe { &*self.ports.subscriber(i) };
            data.generation.load(Ordering::Acquire) % 2 == 0
        })
    }

    /// QoS compatibility: a unilateral check on the subscriber side.
    fn qos_compatible(requested_history: u32, publisher_history: u32) -> bool {
        requested_history <= publisher_history
    }

    fn publisher_has_connection(&self, pub_index: u32, sub_index: u32, sub_gen: u32) -> bool {
        let data = unsafe { &*self.ports.publisher(pub_index) };
        let packed = pack_connection(sub_index, sub_gen);
        data.connections
            .iter()
            .any(|c| c.load(Ordering::Relaxed) == packed)
    }

    /// Attach one subscriber to every matching offered publisher. Sets its
    /// state to SUBSCRIBED on success, WAIT_FOR_OFFER when nothing matched.
    fn attach_subscriber(&mut self, sub_index: u32, sub_gen: u32) -> Result<(), GraphError> {
        let sub_data = unsafe { &*self.ports.subscriber(sub_index) };
        let desc = sub_data.descriptor.service_id.to_description();
        let requested_history = sub_data.requested_history;

        let matching: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.role == PortRole::Publisher && e.desc == desc)
            .map(|e| e.index)
            .collect();

        let mut attached = self
            .entries
            .iter()
            .filter(|e| e.role == PortRole::Publisher)
            .any(|e| self.publisher_has_connection(e.index, sub_index, sub_gen));

        let mut last_err = None;
        for pub_index in matching {
            let pub_data = unsafe { &*self.ports.publisher(pub_index) };
            if !pub_data.offer_state().is_offering() {
                continue;
            }
            if !Self::qos_compatible(requested_history, pub_data.history_capacity) {
                log::warn!(
                    "graph: {desc}: requested history {requested_history} exceeds \
                     publisher history {}, not connecting",
                    pub_data.history_capacity
                );
                continue;
            }
            if self.publisher_has_connection(pub_index, sub_index, sub_gen) {
                continue;
            }
            // The subscriber must count as attached before replay lands in
            // its queue.
            sub_data.set_subscription_state(SubscriptionState::Subscribed);
            match pub_data.connect_subscriber(
                &self.ports,
                sub_index,
                sub_gen,
                requested_history,
            ) {
                Ok(()) => {
                    attached = true;
                    self.signal_subscriber(sub_index, sub_gen);
                    log::debug!("graph: {desc}: connected subscriber {sub_index}/{sub_gen}");
                }
                Err(ConnectError::TooManyConsumers) => {
                    last_err = Some(ConnectError::TooManyConsumers);
                    log::warn!("graph: {desc}: publisher {pub_index} connection list full");
                }
            }
        }

        sub_data.set_subscription_state(if attached {
            SubscriptionState::Subscribed
        } else {
            SubscriptionState::WaitForOffer
        });

        match (attached, last_err) {
            (false, Some(e)) => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Attach every waiting subscriber whose service matches the given
    /// publisher's offer.
    fn attach_waiting_subscribers(&mut self, pub_index: u32) {
        let desc = {
            let data = unsafe { &*self.ports.publisher(pub_index) };
            data.descriptor.service_id.to_description()
        };
        let waiting: Vec<(u32, u32)> = self
            .entries
            .iter()
            .filter(|e| e.role == PortRole::Subscriber && e.desc == desc)
            .map(|e| (e.index, e.generation))
            .collect();
        for (sub_index, sub_gen) in waiting {
            let sub_data = unsafe { &*self.ports.subscriber(sub_index) };
            match sub_data.subscription_state() {
                SubscriptionState::SubscribeRequested
                | SubscriptionState::WaitForOffer
                | SubscriptionState::Subscribed => {
                    let _ = self.attach_subscriber(sub_index, sub_gen);
                }
                _ => {}
            }
        }
    }

    /// Detach all subscribers of a publisher; any subscriber left with no
    /// other connection falls back to WAIT_FOR_OFFER.
    fn detach_all_subscribers(&mut self, pub_index: u32) {
        let data = unsafe { &*self.ports.publisher(pub_index) };
        let connected: Vec<u64> = data
            .connections
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .filter(|&e| e != 0)
            .collect();
        for entry in connected {
            if let Some((sub_index, sub_gen)) = crate::port::unpack_connection(entry) {
                data.disconnect_subscriber(sub_index, sub_gen);
                if !self.subscriber_connected_anywhere(sub_index, sub_gen) {
                    let sub = unsafe { &*self.ports.subscriber(sub_index) };
                    if sub.subscription_state() == SubscriptionState::Subscribed {
                        sub.set_subscription_state(SubscriptionState::WaitForOffer);
                    }
                }
            }
        }
    }

    fn subscriber_connected_anywhere(&self, sub_index: u32, sub_gen: u32) -> bool {
        self.entries
            .iter()
            .filter(|e| e.role == PortRole::Publisher)
            .any(|e| self.publisher_has_connection(e.index, sub_index, sub_gen))
    }

    fn detach_subscriber_from_all(&mut self, sub_index: u32, sub_gen: u32) {
        let pubs: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.role == PortRole::Publisher)
            .map(|e| e.index)
            .collect();
        for pub_index in pubs {
            let data = unsafe { &*self.ports.publisher(pub_index) };
            data.disconnect_subscriber(sub_index, sub_gen);
        }
    }

    fn teardown_publisher(&mut self, pub_index: u32) {
        let data = unsafe { &*self.ports.publisher(pub_index) };
        self.detach_all_subscribers(pub_index);
        data.distributor_lock.with(|| data.drain_history());
        data.set_offer_state(OfferState::NotOffered);
        // Bump to even: the slot is free and every stale handle is dead.
        let g = data.generation.load(Ordering::Relaxed);
        data.generation.store(g + 1, Ordering::Release);
        log::debug!("graph: publisher slot {pub_index} reclaimed");
    }

    fn teardown_subscriber(&mut self, sub_index: u32, sub_gen: u32) {
        self.detach_subscriber_from_all(sub_index, sub_gen);
        let data = unsafe { &*self.ports.subscriber(sub_index) };
        // Return every outstanding chunk reference parked in the queue.
        while let Some(rel) = data.queue.try_pop() {
            ChunkManagement::release(rel);
        }
        data.queue.take_overflow_flag();
        data.set_subscription_state(SubscriptionState::NotSubscribed);
        Waiter::clear_storage(&shm_name::port_waiter_name(&self.domain, sub_index, sub_gen));
        let g = data.generation.load(Ordering::Relaxed);
        data.generation.store(g + 1, Ordering::Release);
        log::debug!("graph: subscriber slot {sub_index} reclaimed");
    }

    fn remove_ports_of(&mut self, pid: i32) -> usize {
        let handles: Vec<PortHandle> = self
            .entries
            .iter()
            .filter(|e| e.pid == pid)
            .map(|e| PortHandle {
                role: e.role,
                index: e.index,
                generation: e.generation,
            })
            .collect();
        let n = handles.len();
        for h in handles {
            let _ = self.remove_port(h);
        }
        n
    }

    fn signal_subscriber(&self, sub_index: u32, sub_gen: u32) {
        let sub = unsafe { &*self.ports.subscriber(sub_index) };
        if !sub.has_waiter.load(Ordering::Acquire) || sub.queue.is_empty() {
            return;
        }
        let name = shm_name::port_waiter_name(&self.domain, sub_index, sub_gen);
        if let Ok(w) = Waiter::open(&name) {
            let _ = w.notify();
        }
    }
}
