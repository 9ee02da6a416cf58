// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// The broker: owns the segments and the port graph, serves the control
// channel, and garbage-collects the ports of vanished clients.
//
// Everything here runs on one dispatch thread; the shared structures it
// touches (port records, pools, queues) carry their own synchronisation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::BrokerConfig;
use crate::control::{ControlMessage, ControlQueue, MessageKind};
use crate::error::{GraphError, ReplyStatus, SegmentError};
use crate::graph::{PortGraph, PortHandle};
use crate::memory::MemoryManager;
use crate::port::{
    PortPool, PortRole, PublisherOptions, SubscriberOptions,
};
use crate::queue::OverflowPolicy;
use crate::segment::SegmentManager;
use crate::shm_name;
use crate::timer::{TimerHandle, TimerPool};

/// Failures during broker startup.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error("broker i/o: {0}")]
    Io(#[from] std::io::Error),
}

struct ClientEntry {
    pid: i32,
    app_name: String,
    reply: ControlQueue,
}

/// The central broker process state.
pub struct Broker {
    config: BrokerConfig,
    segments: SegmentManager,
    ports: Arc<PortPool>,
    graph: PortGraph,
    req_queue: ControlQueue,
    clients: HashMap<u64, ClientEntry>,
    next_client_id: u64,
    timers: TimerPool,
    _discovery_timer: TimerHandle,
    discovery_due: Arc<AtomicBool>,
}

impl Broker {
    /// Create segments, the port pool, and the well-known request queue
    /// from a validated configuration.
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        let config = config.validate()?;
        log::info!(
            "broker starting: domain {:?}, {} pool tiers, discovery every {} ms",
            config.domain,
            config.pools.len(),
            config.discovery_interval_ms
        );

        let segments = SegmentManager::create(&config)?;
        let ports = Arc::new(PortPool::create(
            &config.domain,
            config.max_publishers,
            config.max_subscribers,
        )?);
        let graph = PortGraph::new(&config.domain, Arc::clone(&ports));
        // A crashed predecessor may have left a queue with stale messages.
        let req_name = shm_name::broker_queue_name(&config.domain);
        ControlQueue::clear_storage(&req_name);
        let req_queue = ControlQueue::open(&req_name)?;

        let now = Instant::now();
        let mut timers = TimerPool::new(8, now);
        let discovery_due = Arc::new(AtomicBool::new(false));
        let due_flag = Arc::clone(&discovery_due);
        let discovery_timer = timers
            .register(
                Duration::from_millis(config.discovery_interval_ms),
                now,
                Box::new(move || {
                    due_flag.store(true, Ordering::Release);
                }),
            )
            .expect("fresh timer pool has a free slot");

        Ok(Self {
            config,
            segments,
            ports,
            graph,
            req_queue,
            clients: HashMap::new(),
            next_client_id: 1,
            timers,
            _discovery_timer: discovery_timer,
            discovery_due,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    /// The allocator of the default payload segment.
    pub fn default_memory(&self) -> Arc<MemoryManager> {
        self.segments.default_memory()
    }

    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    /// Direct graph access; the broker and its tests share one dispatch
    /// thread.
    pub fn graph_mut(&mut self) -> &mut PortGraph {
        &mut self.graph
    }

    /// Drain pending control requests and run discovery when its timer has
    /// fired. Returns the number of messages handled.
    pub fn run_once(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        while let Some(msg) = self.req_queue.try_pop() {
            self.handle(msg, now);
            handled += 1;
        }
        self.timers.tick(now);
        if self.discovery_due.swap(false, Ordering::AcqRel) {
            let removed = self.graph.discovery_tick(
                now,
                Duration::from_millis(self.config.keep_alive_threshold_ms),
            );
            if removed > 0 {
                log::info!("broker: discovery reclaimed {removed} ports");
            }
            self.prune_dead_clients();
        }
        handled
    }

    /// Serve until `shutdown` is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let poll = self.config.discovery_interval_ms.max(1);
        while !shutdown.load(Ordering::Acquire) {
            match self.req_queue.recv(Some(poll)) {
                Ok(Some(msg)) => {
                    let now = Instant::now();
                    self.handle(msg, now);
                    self.run_once(now);
                }
                Ok(None) => {
                    self.run_once(Instant::now());
                }
                Err(e) => {
                    log::error!("broker: control queue receive failed: {e}");
                    break;
                }
            }
        }
        log::info!("broker: shutting down");
    }

    fn reply_to(&self, client_id: u64, msg: &ControlMessage) {
        if let Some(client) = self.clients.get(&client_id) {
            if let Err(e) = client.reply.push(msg) {
                log::warn!(
                    "broker: cannot reply to {} ({e}); client will time out",
                    client.app_name
                );
            }
        }
    }

    fn handle(&mut self, msg: ControlMessage, now: Instant) {
        let kind = match msg.kind() {
            Some(k) => k,
            None => {
                log::warn!("broker: malformed control message (kind {})", msg.kind);
                return;
            }
        };
        match kind {
            MessageKind::RegApp => self.handle_reg_app(msg, now),
            MessageKind::UnregApp => {
                let pid = msg.pid;
                self.graph.deregister_process(pid);
                if let Some(client) = self.clients.remove(&msg.client_id) {
                    log::info!("broker: client {} (pid {pid}) unregistered", client.app_name);
                    ControlQueue::clear_storage(&shm_name::reply_queue_name(
                        &self.config.domain,
                        &client.app_name,
                        pid,
                    ));
                }
            }
            MessageKind::KeepAlive => {
                self.graph.keep_alive(msg.pid, now);
            }
            MessageKind::CreatePub => {
                let desc = msg.service_description();
                let options = PublisherOptions {
                    history_capacity: msg.history_capacity,
                    initially_offered: msg.initially_offered != 0,
                };
                let reply = match self.graph.create_publisher(&desc, &options, msg.pid) {
                    Ok(handle) => ControlMessage::port_reply(
                        MessageKind::CreatePubReply,
                        ReplyStatus::Ok,
                        handle.index,
                        handle.generation,
                    ),
                    Err(e) => ControlMessage::port_reply(
                        MessageKind::CreatePubReply,
                        graph_error_status(&e),
                        0,
                        0,
                    ),
                };
                self.reply_to(msg.client_id, &reply);
            }
            MessageKind::CreateSub => {
                let desc = msg.service_description();
                let options = SubscriberOptions {
                    queue_capacity: msg.queue_capacity,
                    requested_history: msg.requested_history,
                    policy: OverflowPolicy::from_byte(msg.policy),
                };
                let reply = match self.graph.create_subscriber(&desc, &options, msg.pid) {
                    Ok(handle) => ControlMessage::port_reply(
                        MessageKind::CreateSubReply,
                        ReplyStatus::Ok,
                        handle.index,
                        handle.generation,
                    ),
                    Err(e) => ControlMessage::port_reply(
                        MessageKind::CreateSubReply,
                        graph_error_status(&e),
                        0,
                        0,
                    ),
                };
                self.reply_to(msg.client_id, &reply);
            }
            MessageKind::RemovePort => {
                let handle = PortHandle {
                    role: if msg.role == PortRole::Subscriber as u8 {
                        PortRole::Subscriber
                    } else {
                        PortRole::Publisher
                    },
                    index: msg.port_index,
                    generation: msg.port_generation,
                };
                let status = match self.graph.remove_port(handle) {
                    Ok(()) => ReplyStatus::Ok,
                    Err(e) => graph_error_status(&e),
                };
                let reply = ControlMessage::port_reply(
                    MessageKind::RemovePortReply,
                    status,
                    msg.port_index,
                    msg.port_generation,
                );
                self.reply_to(msg.client_id, &reply);
            }
            MessageKind::RegAppReply
            | MessageKind::CreatePubReply
            | MessageKind::CreateSubReply
            | MessageKind::RemovePortReply => {
                log::warn!("broker: reply message on the request queue, dropped");
            }
        }
    }

    fn handle_reg_app(&mut self, msg: ControlMessage, now: Instant) {
        let app_name = msg.app_name_str().to_owned();
        let pid = msg.pid;
        let reply_name = shm_name::reply_queue_name(&self.config.domain, &app_name, pid);
        let reply = match ControlQueue::open(&reply_name) {
            Ok(q) => q,
            Err(e) => {
                log::error!("broker: cannot create reply queue for {app_name}: {e}");
                return;
            }
        };

        let client_id = self.next_client_id;
        self.next_client_id += 1;
        self.graph.register_process(pid, &app_name, now);

        let infos = self.segments.segment_infos();
        let ack = ControlMessage::reg_app_reply(
            client_id,
            &infos,
            self.config.max_publishers,
            self.config.max_subscribers,
        );
        if let Err(e) = reply.push(&ack) {
            log::error!("broker: cannot ack registration of {app_name}: {e}");
            return;
        }
        log::info!("broker: client {app_name} (pid {pid}) registered as {client_id}");
        self.clients.insert(
            client_id,
            ClientEntry {
                pid,
                app_name,
                reply,
            },
        );
    }

    /// Drop the reply queues of clients whose processes the graph no longer
    /// tracks (crashed or deregistered).
    fn prune_dead_clients(&mut self) {
        let dead: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, c)| !crate::platform::posix::is_pid_alive(c.pid))
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(client) = self.clients.remove(&id) {
                log::info!(
                    "broker: pruning dead client {} (pid {})",
                    client.app_name,
                    client.pid
                );
                ControlQueue::clear_storage(&shm_name::reply_queue_name(
                    &self.config.domain,
                    &client.app_name,
                    client.pid,
                ));
            }
        }
    }
}

fn graph_error_status(e: &GraphError) -> ReplyStatus {
    match e {
        GraphError::PortPoolExhausted { .. } => ReplyStatus::PortPoolExhausted,
        GraphError::UnknownHandle { .. } => ReplyStatus::UnknownHandle,
        GraphError::Connect(_) => ReplyStatus::TooManyConsumers,
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.req_queue.interrupt();
        ControlQueue::clear_storage(&shm_name::broker_queue_name(&self.config.domain));
    }
}
