//! Event fan-out to per-agent and session-wide subscribers.
//!
//! A single dispatch loop owns every registry. Callers only talk to it through
//! three bounded queues (register, unregister, publish), so no registry lock is
//! ever shared with producers. Each subscriber has its own bounded outbound
//! queue; a subscriber whose queue is full is dropped instead of stalling the
//! loop.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::WebSocketMessage;

/// Default depth of the hub's inbound queues and of each subscriber queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub type SubscriberId = u64;

/// Which events a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Only events targeting this agent.
    Agent(String),
    /// Every event published on the hub.
    Session,
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub subscriber_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            subscriber_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Receiving half handed to a subscriber. `recv` yields `None` once the hub
/// has dropped the subscriber or stopped.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub scope: Scope,
    rx: mpsc::Receiver<Arc<WebSocketMessage>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<WebSocketMessage>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<WebSocketMessage>> {
        self.rx.try_recv().ok()
    }
}

/// Point-in-time subscriber counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HubStats {
    pub total_clients: usize,
    pub session_clients: usize,
    pub agent_clients: HashMap<String, usize>,
}

struct Registration {
    id: SubscriberId,
    scope: Scope,
    tx: mpsc::Sender<Arc<WebSocketMessage>>,
}

/// Handle to the dispatch loop. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<SubscriberId>,
    publish_tx: mpsc::Sender<Arc<WebSocketMessage>>,
    next_id: AtomicU64,
    subscriber_capacity: usize,
    stats: Arc<RwLock<HubStats>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Spawns the dispatch loop on the current runtime.
    pub fn spawn(config: HubConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (publish_tx, publish_rx) = mpsc::channel(capacity);
        let stats = Arc::new(RwLock::new(HubStats::default()));
        let shutdown = CancellationToken::new();

        let dispatcher = Dispatcher {
            clients: HashMap::new(),
            by_agent: HashMap::new(),
            session: HashSet::new(),
            stats: stats.clone(),
        };
        let task = tokio::spawn(dispatcher.run(
            register_rx,
            unregister_rx,
            publish_rx,
            shutdown.clone(),
        ));

        Self {
            inner: Arc::new(HubInner {
                register_tx,
                unregister_tx,
                publish_tx,
                next_id: AtomicU64::new(1),
                subscriber_capacity: config.subscriber_capacity.max(1),
                stats,
                shutdown,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Registers a new subscriber. After the hub has stopped the returned
    /// subscription is already closed.
    pub async fn subscribe(&self, scope: Scope) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.subscriber_capacity);
        let registration = Registration {
            id,
            scope: scope.clone(),
            tx,
        };
        if self.inner.register_tx.send(registration).await.is_err() {
            debug!(subscriber_id = id, "hub stopped, subscription closed");
        }
        Subscription { id, scope, rx }
    }

    /// Removes a subscriber. Unknown ids and a stopped hub are both no-ops.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.inner.unregister_tx.send(id).await;
    }

    /// Queues an event for delivery without waiting. When the publish queue
    /// is full the event is dropped and a warning is logged.
    pub fn publish(&self, message: WebSocketMessage) {
        match self.inner.publish_tx.try_send(Arc::new(message)) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!(agent_id = %msg.agent_id, kind = ?msg.kind, "hub publish queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn stats(&self) -> HubStats {
        self.inner.stats.read().clone()
    }

    pub fn client_count(&self) -> usize {
        self.inner.stats.read().total_clients
    }

    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Stops the dispatch loop and closes every subscriber queue.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("event hub stopped");
        }
    }
}

struct Dispatcher {
    clients: HashMap<SubscriberId, Client>,
    by_agent: HashMap<String, HashSet<SubscriberId>>,
    session: HashSet<SubscriberId>,
    stats: Arc<RwLock<HubStats>>,
}

struct Client {
    scope: Scope,
    tx: mpsc::Sender<Arc<WebSocketMessage>>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut register_rx: mpsc::Receiver<Registration>,
        mut unregister_rx: mpsc::Receiver<SubscriberId>,
        mut publish_rx: mpsc::Receiver<Arc<WebSocketMessage>>,
        shutdown: CancellationToken,
    ) {
        loop {
            // Registrations win over publishes so a subscriber registered
            // before an event was published always sees it.
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(reg) = register_rx.recv() => self.register(reg),
                Some(id) = unregister_rx.recv() => self.remove(id),
                Some(msg) = publish_rx.recv() => self.dispatch(&msg),
                else => break,
            }
        }

        self.clients.clear();
        self.by_agent.clear();
        self.session.clear();
        self.refresh_stats();
    }

    fn register(&mut self, reg: Registration) {
        match &reg.scope {
            Scope::Agent(agent_id) => {
                self.by_agent
                    .entry(agent_id.clone())
                    .or_default()
                    .insert(reg.id);
            }
            Scope::Session => {
                self.session.insert(reg.id);
            }
        }
        debug!(subscriber_id = reg.id, scope = ?reg.scope, "subscriber registered");
        self.clients.insert(
            reg.id,
            Client {
                scope: reg.scope,
                tx: reg.tx,
            },
        );
        self.refresh_stats();
    }

    fn remove(&mut self, id: SubscriberId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        match client.scope {
            Scope::Agent(agent_id) => {
                if let Some(set) = self.by_agent.get_mut(&agent_id) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.by_agent.remove(&agent_id);
                    }
                }
            }
            Scope::Session => {
                self.session.remove(&id);
            }
        }
        self.refresh_stats();
    }

    fn dispatch(&mut self, msg: &Arc<WebSocketMessage>) {
        let targets: Vec<SubscriberId> = self
            .by_agent
            .get(&msg.agent_id)
            .into_iter()
            .flatten()
            .chain(self.session.iter())
            .copied()
            .collect();

        let mut dropped = Vec::new();
        for id in targets {
            let Some(client) = self.clients.get(&id) else {
                continue;
            };
            match client.tx.try_send(Arc::clone(msg)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber_id = id, agent_id = %msg.agent_id, "subscriber queue full, dropping client");
                    dropped.push(id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(id),
            }
        }

        for id in dropped {
            self.remove(id);
        }
    }

    fn refresh_stats(&self) {
        let mut stats = self.stats.write();
        stats.total_clients = self.clients.len();
        stats.session_clients = self.session.len();
        stats.agent_clients = self
            .by_agent
            .iter()
            .map(|(agent, set)| (agent.clone(), set.len()))
            .collect();
    }
}
