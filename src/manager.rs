//! The Manager (§4.4): the single coordinator task that owns the
//! Connection, the tab registry, the waiter queue and the pending-reply
//! table, and multiplexes every tab owner's commands over one browser
//! connection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::{Connection, ConnectionEvent, PumpOutcome};
use crate::error::CdpError;
use crate::protocol::{CloseRequest, CommandRequest, CreateRequest, CreatedInfo, OwnerMessage, TabOptions};
use crate::types::{BrowserContextId, CallId, OwnerId, SessionId, TargetId};

const CONTROL_PLANE_DOMAINS: &[&str] = &["Page", "Runtime", "Network", "DOM"];

struct TabRecord {
    target: TargetId,
    context: BrowserContextId,
    owner: OwnerId,
    owner_tx: mpsc::Sender<OwnerMessage>,
}

struct Waiter {
    owner: OwnerId,
    options: TabOptions,
    reply: oneshot::Sender<Result<CreatedInfo, CdpError>>,
    owner_tx: mpsc::Sender<OwnerMessage>,
}

struct PendingReply {
    owner: OwnerId,
    method: String,
    reply: oneshot::Sender<Result<Value, CdpError>>,
}

type LivenessFuture = Pin<Box<dyn Future<Output = OwnerId> + Send>>;

/// One outstanding `recv()` on a tab's session event bus. Resolves to the
/// session, the (still-owned) receiver so it can be re-queued, and the event
/// itself — or `None` once the bus has been unsubscribed/closed.
type EventPollFuture = Pin<Box<dyn Future<Output = (SessionId, mpsc::Receiver<ConnectionEvent>, Option<ConnectionEvent>)> + Send>>;

/// Cloneable front-end used by tab owners to talk to a running [`Manager`].
#[derive(Clone)]
pub struct ManagerHandle {
    create_tx: mpsc::Sender<CreateRequest>,
    command_tx: mpsc::Sender<CommandRequest>,
    close_tx: mpsc::Sender<CloseRequest>,
    next_owner: Arc<AtomicU64>,
    pub(crate) event_bus_capacity: usize,
    pub(crate) default_command_timeout: std::time::Duration,
    pub(crate) default_navigation_timeout: std::time::Duration,
}

impl ManagerHandle {
    pub(crate) fn alloc_owner(&self) -> OwnerId {
        OwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) async fn create(
        &self,
        owner: OwnerId,
        options: TabOptions,
        owner_tx: mpsc::Sender<OwnerMessage>,
    ) -> Result<CreatedInfo, CdpError> {
        let (reply, rx) = oneshot::channel();
        self.create_tx
            .send(CreateRequest {
                owner,
                options,
                reply,
                owner_tx,
            })
            .await
            .map_err(|_| CdpError::Disconnected)?;
        rx.await.map_err(|_| CdpError::Disconnected)?
    }

    pub(crate) async fn command(
        &self,
        owner: OwnerId,
        session: SessionId,
        method: impl Into<String>,
        params: Value,
        timeout: std::time::Duration,
    ) -> Result<Value, CdpError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(CommandRequest {
                owner,
                session,
                method: method.into(),
                params,
                timeout,
                reply,
            })
            .await
            .map_err(|_| CdpError::Disconnected)?;
        rx.await.map_err(|_| CdpError::Disconnected)?
    }

    pub(crate) async fn close(&self, session: SessionId) {
        let _ = self.close_tx.send(CloseRequest { session }).await;
    }
}

/// Spawns the Manager as a background task and returns a handle plus the
/// task's join handle. The join handle resolves to `Err` only when the
/// Manager could not recover from a disconnect (§7 "Fatal for the Manager").
pub async fn spawn(config: Config) -> Result<(ManagerHandle, JoinHandle<Result<(), CdpError>>), CdpError> {
    let connection = Arc::new(Connection::connect(&config.address, config.connect_timeout).await?);

    let (create_tx, create_rx) = mpsc::channel(32);
    let (command_tx, command_rx) = mpsc::channel(256);
    let (close_tx, close_rx) = mpsc::channel(32);

    let handle = ManagerHandle {
        create_tx,
        command_tx,
        close_tx,
        next_owner: Arc::new(AtomicU64::new(1)),
        event_bus_capacity: config.event_bus_capacity,
        default_command_timeout: config.default_command_timeout,
        default_navigation_timeout: config.default_navigation_timeout,
    };

    let manager = Manager {
        config,
        connection,
        tabs: HashMap::new(),
        owner_sessions: HashMap::new(),
        owner_liveness: FuturesUnordered::new(),
        session_events: FuturesUnordered::new(),
        monitored_owners: HashSet::new(),
        waiters: VecDeque::new(),
        pending: FnvHashMap::default(),
        create_rx,
        command_rx,
        close_rx,
    };

    let join = tokio::spawn(manager.run());
    Ok((handle, join))
}

struct Manager {
    config: Config,
    connection: Arc<Connection>,
    tabs: HashMap<SessionId, TabRecord>,
    owner_sessions: HashMap<OwnerId, HashSet<SessionId>>,
    owner_liveness: FuturesUnordered<LivenessFuture>,
    session_events: FuturesUnordered<EventPollFuture>,
    monitored_owners: HashSet<OwnerId>,
    waiters: VecDeque<Waiter>,
    pending: FnvHashMap<CallId, PendingReply>,
    create_rx: mpsc::Receiver<CreateRequest>,
    command_rx: mpsc::Receiver<CommandRequest>,
    close_rx: mpsc::Receiver<CloseRequest>,
}

impl Manager {
    async fn run(mut self) -> Result<(), CdpError> {
        let mut health_timer = tokio::time::interval(self.config.health_interval);
        health_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so the first real
        // health check happens one full interval after startup.
        health_timer.tick().await;

        loop {
            tokio::select! {
                Some(req) = self.create_rx.recv() => {
                    self.handle_create(req).await;
                }
                Some(req) = self.command_rx.recv() => {
                    self.handle_command(req).await;
                }
                Some(req) = self.close_rx.recv() => {
                    self.handle_close(&req.session).await;
                    self.serve_waiters().await;
                }
                Some(owner) = self.owner_liveness.next() => {
                    self.handle_owner_exit(owner).await;
                }
                Some((session, rx, event)) = self.session_events.next() => {
                    if let Some(ev) = event {
                        self.forward_event(&session, ev);
                        self.push_event_poll(session, rx);
                    }
                }
                _ = health_timer.tick() => {
                    if let Err(fatal) = self.handle_health_check().await {
                        return Err(fatal);
                    }
                }
                outcome = self.connection.pump_message() => {
                    match outcome {
                        PumpOutcome::Response(id, result) => self.route_response(id, result),
                        PumpOutcome::Other => {}
                        PumpOutcome::Closed => {
                            if let Err(fatal) = self.handle_disconnect().await {
                                return Err(fatal);
                            }
                        }
                    }
                }
                else => {
                    // All owner-facing channels dropped: nothing left to serve.
                    return Ok(());
                }
            }
        }
    }

    fn monitor_owner(&mut self, owner: OwnerId, owner_tx: &mpsc::Sender<OwnerMessage>) {
        if self.monitored_owners.insert(owner) {
            let tx = owner_tx.clone();
            self.owner_liveness.push(Box::pin(async move {
                tx.closed().await;
                owner
            }));
        }
    }

    async fn handle_create(&mut self, req: CreateRequest) {
        if self.config.max_tabs != 0 && self.tabs.len() >= self.config.max_tabs {
            self.monitor_owner(req.owner, &req.owner_tx);
            self.waiters.push_back(Waiter {
                owner: req.owner,
                options: req.options,
                reply: req.reply,
                owner_tx: req.owner_tx,
            });
            return;
        }
        self.create_tab(req.owner, req.options, req.owner_tx, req.reply).await;
    }

    /// Runs the create-target control-plane sequence (§4.4), rolling back
    /// whatever was built on failure.
    async fn create_tab(
        &mut self,
        owner: OwnerId,
        options: TabOptions,
        owner_tx: mpsc::Sender<OwnerMessage>,
        reply: oneshot::Sender<Result<CreatedInfo, CdpError>>,
    ) {
        let timeout = self.config.default_timeout;
        let initial_url = options.initial_url.as_deref().unwrap_or("about:blank").to_string();

        let context_result = self
            .connection
            .send(
                "Target.createBrowserContext",
                json!({"disposeOnDetach": true}),
                None,
                timeout,
            )
            .await;
        self.drain_and_route().await;
        let context_id = match context_result {
            Ok(v) => match v.get("browserContextId").and_then(Value::as_str) {
                Some(id) => BrowserContextId::new(id),
                None => {
                    let _ = reply.send(Err(CdpError::ConnectionFailed(
                        "createBrowserContext: missing browserContextId".into(),
                    )));
                    return;
                }
            },
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let target_result = self
            .connection
            .send(
                "Target.createTarget",
                json!({"url": initial_url, "browserContextId": context_id.as_str()}),
                None,
                timeout,
            )
            .await;
        self.drain_and_route().await;
        let target_id = match target_result {
            Ok(v) => match v.get("targetId").and_then(Value::as_str) {
                Some(id) => TargetId::new(id),
                None => {
                    self.rollback(Some(&context_id), None).await;
                    let _ = reply.send(Err(CdpError::ConnectionFailed(
                        "createTarget: missing targetId".into(),
                    )));
                    return;
                }
            },
            Err(e) => {
                self.rollback(Some(&context_id), None).await;
                let _ = reply.send(Err(e));
                return;
            }
        };

        let attach_result = self
            .connection
            .send(
                "Target.attachToTarget",
                json!({"targetId": target_id.as_str(), "flatten": true}),
                None,
                timeout,
            )
            .await;
        self.drain_and_route().await;
        let session_id = match attach_result {
            Ok(v) => match v.get("sessionId").and_then(Value::as_str) {
                Some(id) => SessionId::new(id),
                None => {
                    self.rollback(Some(&context_id), Some(&target_id)).await;
                    let _ = reply.send(Err(CdpError::ConnectionFailed(
                        "attachToTarget: missing sessionId".into(),
                    )));
                    return;
                }
            },
            Err(e) => {
                self.rollback(Some(&context_id), Some(&target_id)).await;
                let _ = reply.send(Err(e));
                return;
            }
        };

        for domain in CONTROL_PLANE_DOMAINS {
            let method = format!("{domain}.enable");
            if let Err(e) = self
                .connection
                .send(method.clone(), json!({}), Some(&session_id), timeout)
                .await
            {
                tracing::warn!(session = %session_id, method = %method, error = %e, "domain enable failed, continuing");
            }
            self.drain_and_route().await;
        }

        let events = self
            .connection
            .subscribe(session_id.clone(), self.config.event_bus_capacity)
            .await;
        self.push_event_poll(session_id.clone(), events);

        self.tabs.insert(
            session_id.clone(),
            TabRecord {
                target: target_id.clone(),
                context: context_id.clone(),
                owner,
                owner_tx: owner_tx.clone(),
            },
        );
        self.owner_sessions
            .entry(owner)
            .or_default()
            .insert(session_id.clone());
        self.monitor_owner(owner, &owner_tx);

        let _ = reply.send(Ok(CreatedInfo {
            session: session_id,
            target: target_id,
            context: context_id,
        }));
    }

    /// Queues one more `recv()` on a session's event bus as a future the
    /// Manager's own select loop polls alongside every other event source
    /// (§4.4: "every active session event bus, one case per tab"). The
    /// receiver is handed back out of the future so it can be re-queued
    /// after each event without the Manager owning a live borrow across
    /// `await` points.
    fn push_event_poll(&mut self, session: SessionId, mut rx: mpsc::Receiver<ConnectionEvent>) {
        self.session_events.push(Box::pin(async move {
            let event = rx.recv().await;
            (session, rx, event)
        }));
    }

    /// Forwards a decoded event to its session's owner. Best-effort: a slow
    /// owner must never stall event dispatch for the rest of the tabs.
    fn forward_event(&self, session: &SessionId, event: ConnectionEvent) {
        if let Some(record) = self.tabs.get(session) {
            let msg = OwnerMessage::Event {
                method: event.method.to_string(),
                params: event.params,
                session: session.clone(),
            };
            let _ = record.owner_tx.try_send(msg);
        }
    }

    async fn rollback(&mut self, context: Option<&BrowserContextId>, target: Option<&TargetId>) {
        let timeout = self.config.default_timeout;
        if let Some(target_id) = target {
            let _ = self
                .connection
                .send(
                    "Target.closeTarget",
                    json!({"targetId": target_id.as_str()}),
                    None,
                    timeout,
                )
                .await;
            self.drain_and_route().await;
        }
        if let Some(context_id) = context {
            let _ = self
                .connection
                .send(
                    "Target.disposeBrowserContext",
                    json!({"browserContextId": context_id.as_str()}),
                    None,
                    timeout,
                )
                .await;
            self.drain_and_route().await;
        }
    }

    /// Drains responses buffered by the Connection during a blocking `send`
    /// and routes them to their pending commands (§4.4).
    async fn drain_and_route(&mut self) {
        for (id, result) in self.connection.drain_responses().await {
            self.route_response(id, result);
        }
    }

    fn route_response(&mut self, id: CallId, result: Result<Value, CdpError>) {
        if let Some(pending) = self.pending.remove(&id) {
            let result = result.map_err(|e| match e {
                CdpError::Classified(_, msg) => CdpError::from_remote(msg, Some(pending.method.as_str())),
                other => other,
            });
            let _ = pending.reply.send(result);
        }
    }

    async fn handle_command(&mut self, req: CommandRequest) {
        let Some(tab) = self.tabs.get(&req.session) else {
            let _ = req.reply.send(Err(CdpError::from_remote(
                "Session with given id not found",
                Some(req.method.as_str()),
            )));
            return;
        };
        if tab.owner != req.owner {
            let _ = req.reply.send(Err(CdpError::from_remote(
                "Session with given id not found",
                Some(req.method.as_str()),
            )));
            return;
        }
        if self.connection.is_closed() {
            let _ = req.reply.send(Err(CdpError::Disconnected));
            return;
        }

        match self
            .connection
            .send_async(req.method.clone(), req.params, Some(&req.session))
            .await
        {
            Ok(id) => {
                self.pending.insert(
                    id,
                    PendingReply {
                        owner: req.owner,
                        method: req.method,
                        reply: req.reply,
                    },
                );
            }
            Err(e) => {
                let _ = req.reply.send(Err(e));
            }
        }
    }

    async fn handle_close(&mut self, session: &SessionId) {
        let Some(tab) = self.tabs.remove(session) else {
            return;
        };
        let timeout = self.config.default_timeout;
        let _ = self
            .connection
            .send(
                "Target.detachFromTarget",
                json!({"sessionId": session.as_str()}),
                None,
                timeout,
            )
            .await;
        self.drain_and_route().await;
        let _ = self
            .connection
            .send(
                "Target.closeTarget",
                json!({"targetId": tab.target.as_str()}),
                None,
                timeout,
            )
            .await;
        self.drain_and_route().await;
        let _ = self
            .connection
            .send(
                "Target.disposeBrowserContext",
                json!({"browserContextId": tab.context.as_str()}),
                None,
                timeout,
            )
            .await;
        self.drain_and_route().await;

        self.connection.unsubscribe(session).await;
        if let Some(sessions) = self.owner_sessions.get_mut(&tab.owner) {
            sessions.remove(session);
        }
    }

    async fn handle_owner_exit(&mut self, owner: OwnerId) {
        self.monitored_owners.remove(&owner);
        let sessions: Vec<SessionId> = self
            .owner_sessions
            .remove(&owner)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for session in sessions {
            self.handle_close(&session).await;
        }
        // Any waiters from this owner are now moot; they'll be discarded
        // naturally in serve_waiters when their reply channel is found closed.
        self.serve_waiters().await;
    }

    /// FIFO: served only when a slot frees, never ahead of a created tab.
    async fn serve_waiters(&mut self) {
        while self.config.max_tabs == 0 || self.tabs.len() < self.config.max_tabs {
            let Some(waiter) = self.waiters.pop_front() else {
                return;
            };
            if waiter.reply.is_closed() {
                continue;
            }
            self.create_tab(waiter.owner, waiter.options, waiter.owner_tx, waiter.reply)
                .await;
        }
    }

    /// Shared by both the health-check failure path and an unsolicited
    /// stream closure (§4.4, §7): fail pending replies before clearing the
    /// tab table, reject waiters, then attempt exactly one reconnect.
    async fn handle_disconnect(&mut self) -> Result<(), CdpError> {
        tracing::warn!("CDP connection lost, recovering");

        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(CdpError::Disconnected));
        }

        self.connection.close().await;
        self.tabs.clear();
        self.owner_sessions.clear();
        self.monitored_owners.clear();
        self.owner_liveness.clear();

        for waiter in self.waiters.drain(..) {
            let _ = waiter.reply.send(Err(CdpError::Disconnected));
        }

        match Connection::connect(&self.config.address, self.config.connect_timeout).await {
            Ok(fresh) => {
                self.connection = Arc::new(fresh);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "reconnect failed, manager exiting");
                Err(e)
            }
        }
    }

    async fn handle_health_check(&mut self) -> Result<(), CdpError> {
        let probe_timeout = std::time::Duration::from_secs(5).min(self.config.default_timeout);
        match self
            .connection
            .send("Browser.getVersion", json!({}), None, probe_timeout)
            .await
        {
            Ok(_) => {
                self.drain_and_route().await;
                self.discard_browser_events().await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "health check failed");
                self.handle_disconnect().await
            }
        }
    }

    /// Session-less events (e.g. `Target.targetCreated`) have no tab owner to
    /// forward to; they only exist so the Connection never has to guess
    /// whether to drop them. The Manager has no use for them today, but must
    /// still drain the buffer each health-check tick so it cannot grow
    /// without bound over a long-lived connection.
    async fn discard_browser_events(&mut self) {
        let dropped = self.connection.drain_browser_events().await;
        if !dropped.is_empty() {
            tracing::trace!(count = dropped.len(), "discarded session-less browser events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiters_are_fifo() {
        let mut waiters: VecDeque<u32> = VecDeque::new();
        waiters.push_back(1);
        waiters.push_back(2);
        assert_eq!(waiters.pop_front(), Some(1));
        assert_eq!(waiters.pop_front(), Some(2));
    }
}
