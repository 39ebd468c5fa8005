//! Step engine
//!
//! A `Flow` drives one side of one swap through its protocol's ordered step
//! list. Step actions run as spawned tasks; they may finish their step right
//! away, later from a wait, or never (the flow parks until an external
//! trigger re-runs the step). The engine itself never advances on return.

mod state;

pub use state::{FlowEvent, FlowRecord, FlowState, StepMeta};

use crate::chain::{AdapterSet, Legs};
use crate::config::FlowConfig;
use crate::error::{SwapError, SwapResult};
use crate::peer::{PeerChannel, Subscription, SwapMessage};
use crate::protocol::ProtocolDescriptor;
use crate::retry::{poll_with_token, Attempt, GenerationRegistry};
use crate::state::StateStore;
use crate::swap::{Identity, Role, Swap};

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every flow of a host
#[derive(Clone)]
pub struct SwapContext {
    pub identity: Identity,
    pub room: Arc<dyn PeerChannel>,
    pub store: Arc<dyn StateStore>,
    pub generations: Arc<GenerationRegistry>,
    pub adapters: Arc<AdapterSet>,
    pub config: FlowConfig,
}

struct Snapshot {
    step: u8,
    state: FlowState,
}

/// Read-only view for the API and logs
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub id: String,
    pub protocol: String,
    pub role: Role,
    pub step: u8,
    pub step_name: Option<&'static str>,
    pub state: FlowState,
}

/// One side of one swap
pub struct Flow {
    swap: Swap,
    protocol: Arc<ProtocolDescriptor>,
    ctx: SwapContext,
    legs: Legs,
    /// Generation scope; both sides of a swap may share a process
    scope: String,
    inner: Mutex<Snapshot>,
    events: broadcast::Sender<FlowEvent>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Running step actions by step index, aborted on stop
    tasks: std::sync::Mutex<Vec<(u8, JoinHandle<()>)>>,
    stopped: AtomicBool,
}

impl Flow {
    /// Build a flow, resuming from the store when a snapshot exists
    pub async fn new(
        swap: Swap,
        protocol: Arc<ProtocolDescriptor>,
        ctx: SwapContext,
    ) -> SwapResult<Arc<Self>> {
        ctx.identity.validate()?;
        swap.counterparty.validate()?;

        if swap.role != protocol.role {
            return Err(SwapError::Config(format!(
                "Protocol {} is for the {:?} role, swap {} is {:?}",
                protocol.name, protocol.role, swap.id, swap.role
            )));
        }

        let legs = ctx.adapters.resolve(&swap)?;

        let (step, state) = match ctx.store.load(&swap.id).await? {
            Some(record) if record.protocol != protocol.name => {
                return Err(SwapError::Config(format!(
                    "Swap {} was stored under protocol {}, not {}",
                    swap.id, record.protocol, protocol.name
                )));
            }
            Some(record) => {
                info!(
                    "Resuming swap {} ({}) at step {}",
                    swap.id, protocol.name, record.step
                );
                (record.step, record.state)
            }
            None => {
                let record = FlowRecord::new(swap.clone(), protocol.name.clone());
                ctx.store.save(&swap.id, &record).await?;
                (record.step, record.state)
            }
        };

        let (events, _) = broadcast::channel(256);
        let scope = format!("{}:{}", ctx.identity.peer_id, swap.id);

        Ok(Arc::new(Self {
            swap,
            protocol,
            ctx,
            legs,
            scope,
            inner: Mutex::new(Snapshot { step, state }),
            events,
            pump: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.swap.id
    }

    pub fn swap(&self) -> &Swap {
        &self.swap
    }

    pub fn protocol(&self) -> &ProtocolDescriptor {
        &self.protocol
    }

    pub fn identity(&self) -> &Identity {
        &self.ctx.identity
    }

    pub fn legs(&self) -> &Legs {
        &self.legs
    }

    pub fn config(&self) -> &FlowConfig {
        &self.ctx.config
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub async fn step(&self) -> u8 {
        self.inner.lock().await.step
    }

    pub async fn state(&self) -> FlowState {
        self.inner.lock().await.state.clone()
    }

    pub async fn snapshot(&self) -> (u8, FlowState) {
        let inner = self.inner.lock().await;
        (inner.step, inner.state.clone())
    }

    pub async fn summary(&self) -> FlowSummary {
        let (step, state) = self.snapshot().await;
        FlowSummary {
            id: self.swap.id.clone(),
            protocol: self.protocol.name.clone(),
            role: self.swap.role,
            step,
            step_name: self.protocol.step_name(step),
            state,
        }
    }

    /// Whether the flow currently sits on the named step
    pub async fn is_at(&self, name: &str) -> bool {
        let step = self.step().await;
        self.protocol.step_index(name) == Some(step)
    }

    /// Resolves once the flow is no longer on the named step
    pub async fn left_step(&self, name: &str) {
        let mut events = self.events();
        loop {
            if !self.is_at(name).await {
                return;
            }
            if let Err(broadcast::error::RecvError::Closed) = events.recv().await {
                return;
            }
        }
    }

    /// Lifecycle events; lagging receivers lose old events
    pub fn events(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: FlowEvent) {
        let _ = self.events.send(event);
    }

    async fn persist(&self, step: u8, state: &FlowState) -> SwapResult<()> {
        let record = FlowRecord {
            swap: self.swap.clone(),
            protocol: self.protocol.name.clone(),
            step,
            state: state.clone(),
        };
        self.ctx.store.save(&self.swap.id, &record).await
    }

    /// Start (or resume) driving the flow
    pub async fn start(self: &Arc<Self>) -> SwapResult<()> {
        self.ensure_running()?;
        self.start_pump();

        let (step, finished) = {
            let mut inner = self.inner.lock().await;
            if inner.step == 0 {
                self.persist(1, &inner.state).await?;
                inner.step = 1;
            }
            (inner.step, inner.state.is_finished)
        };

        if finished {
            debug!("Swap {} already finished", self.swap.id);
            return Ok(());
        }

        self.spawn_step(step);
        Ok(())
    }

    /// Stop message handling and step actions, and supersede every poll.
    /// A stopped flow never writes to the store again.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.abort_tasks();
        self.ctx.generations.remove_scope(&self.scope);
        debug!("Swap {} stopped", self.swap.id);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> SwapResult<()> {
        if self.is_stopped() {
            return Err(SwapError::Precondition(format!(
                "swap {} is stopped",
                self.swap.id
            )));
        }
        Ok(())
    }

    fn abort_tasks(&self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain(..) {
                handle.abort();
            }
        }
    }

    fn start_pump(self: &Arc<Self>) {
        let Ok(mut pump) = self.pump.lock() else {
            return;
        };
        if pump.is_some() {
            return;
        }

        // Subscribe before spawning so nothing sent after start is missed
        let mut sub = self.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        let on_message = self.protocol.on_message.clone();

        *pump = Some(tokio::spawn(async move {
            loop {
                let message = match sub.recv().await {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("Message pump stopped: {}", e);
                        break;
                    }
                };
                let Some(flow) = weak.upgrade() else {
                    break;
                };
                let event = message.event();
                if let Err(e) = on_message(flow.clone(), message).await {
                    warn!(
                        "Swap {} failed handling '{}': {}",
                        flow.swap.id, event, e
                    );
                }
            }
        }));
    }

    /// Merge an update into the state and persist it, without advancing.
    /// Returns the closure's result, so flags can be tested and set atomically.
    pub async fn set_state<R>(&self, update: impl FnOnce(&mut FlowState) -> R) -> SwapResult<R> {
        let (step, just_finished, out) = {
            let mut inner = self.inner.lock().await;
            self.ensure_running()?;
            let mut next = inner.state.clone();
            let out = update(&mut next);
            if next == inner.state {
                return Ok(out);
            }
            self.persist(inner.step, &next).await?;
            let just_finished = !inner.state.is_finished && next.is_finished;
            inner.state = next;
            (inner.step, just_finished, out)
        };

        self.emit(FlowEvent::StateChanged { step });
        if just_finished {
            self.on_finished();
        }
        Ok(out)
    }

    /// Complete the current step and spawn the next one.
    ///
    /// Returns `Ok(false)` when a silent guard did not match.
    pub async fn finish_step(
        self: &Arc<Self>,
        meta: StepMeta<'_>,
        update: impl FnOnce(&mut FlowState),
    ) -> SwapResult<bool> {
        let (finished_name, next_step, just_finished) = {
            let mut inner = self.inner.lock().await;
            self.ensure_running()?;
            let current = inner.step;

            if let Some(name) = meta.step {
                let expected = self
                    .protocol
                    .step_index(name)
                    .ok_or_else(|| SwapError::UnknownStep(name.to_string()))?;
                if expected != current {
                    if meta.silent {
                        debug!(
                            "Swap {} ignoring late finish of {} (on step {})",
                            self.swap.id, name, current
                        );
                        return Ok(false);
                    }
                    return Err(SwapError::StepMismatch {
                        step: name.to_string(),
                        expected,
                        current,
                    });
                }
            }

            let Some(finished_name) = self.protocol.step_name(current) else {
                return Err(SwapError::Precondition(format!(
                    "swap {} has no active step ({})",
                    self.swap.id, current
                )));
            };

            let mut next = inner.state.clone();
            update(&mut next);
            let next_step = current + 1;

            self.persist(next_step, &next).await?;

            let just_finished = !inner.state.is_finished && next.is_finished;
            inner.step = next_step;
            inner.state = next;
            (finished_name, next_step, just_finished)
        };

        debug!(
            "Swap {} finished step {} ({})",
            self.swap.id,
            next_step - 1,
            finished_name
        );
        self.ctx.generations.remove(&self.scope, finished_name);
        self.emit(FlowEvent::StateChanged { step: next_step });
        if just_finished {
            self.on_finished();
        }
        self.spawn_step(next_step);
        Ok(true)
    }

    fn on_finished(&self) {
        info!("Swap {} ({}) finished", self.swap.id, self.protocol.name);
        crate::metrics::record_swap_finished(&self.protocol.name);
        self.emit(FlowEvent::Finished);
    }

    /// Re-run the current step's action.
    ///
    /// Refused while an earlier run of the same step is still in progress,
    /// so a step's side effects never overlap.
    pub async fn retry_step(self: &Arc<Self>) -> SwapResult<()> {
        self.ensure_running()?;
        let step = self.step().await;
        let Some(name) = self.protocol.step_name(step) else {
            return Err(SwapError::Precondition(format!(
                "swap {} has no active step ({})",
                self.swap.id, step
            )));
        };
        info!("Swap {} retrying step {}", self.swap.id, step);
        if !self.spawn_step(step) {
            return Err(SwapError::Precondition(format!(
                "step {} of swap {} is still running",
                name, self.swap.id
            )));
        }
        Ok(())
    }

    /// Supersede the polls of the named step, wait for its action to
    /// return, then run it again if the flow is still there
    pub async fn restart_step(self: &Arc<Self>, name: &str) -> SwapResult<()> {
        self.ensure_running()?;
        let step = self
            .protocol
            .step_index(name)
            .ok_or_else(|| SwapError::UnknownStep(name.to_string()))?;
        if self.step().await != step {
            return Err(SwapError::Precondition(format!(
                "swap {} is not on step {}",
                self.swap.id, name
            )));
        }

        self.ctx.generations.remove(&self.scope, name);
        let running: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => {
                let (same, rest): (Vec<_>, Vec<_>) =
                    tasks.drain(..).partition(|(s, _)| *s == step);
                *tasks = rest;
                same.into_iter().map(|(_, handle)| handle).collect()
            }
            Err(_) => Vec::new(),
        };
        for handle in running {
            let _ = handle.await;
        }

        if !self.is_at(name).await {
            debug!("Swap {} moved past {} while restarting", self.swap.id, name);
            return Ok(());
        }
        self.retry_step().await
    }

    /// Drop the polls of the current step; its action stops at the next check
    pub async fn supersede_polls(&self) {
        let step = self.step().await;
        if let Some(name) = self.protocol.step_name(step) {
            self.ctx.generations.remove(&self.scope, name);
        }
    }

    /// Spawn the action of `step` unless a run of it is still in progress
    fn spawn_step(self: &Arc<Self>, step: u8) -> bool {
        let Some(def) = self.protocol.step(step) else {
            return false;
        };
        let name = def.name;
        let action = def.action.clone();

        let Ok(mut tasks) = self.tasks.lock() else {
            return false;
        };
        tasks.retain(|(_, h)| !h.is_finished());
        if tasks.iter().any(|(s, _)| *s == step) {
            debug!("Swap {} step {} already running", self.swap.id, name);
            return false;
        }

        info!(
            "Swap {} ({}) entering step {}: {}",
            self.swap.id, self.protocol.name, step, name
        );
        crate::metrics::record_step_entered(&self.protocol.name, name);
        self.emit(FlowEvent::StepEntered {
            step,
            name: name.to_string(),
        });

        let flow = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = action(flow.clone()).await {
                if flow.is_stopped() {
                    debug!("Swap {} step {} ended after stop: {}", flow.swap.id, name, e);
                    return;
                }
                error!(
                    "Swap {} step {} ({}) failed, flow parked: {}",
                    flow.swap.id, step, name, e
                );
                crate::metrics::record_step_failure(&flow.protocol.name, name);
            }
        });
        tasks.push((step, handle));
        true
    }

    /// Poll under a fresh generation token named after `name`.
    /// Finishing the step of the same name supersedes the poll.
    pub async fn poll<T, F, Fut>(&self, name: &str, interval: Duration, check: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        poll_with_token(&self.ctx.generations, &self.scope, name, interval, check).await
    }

    /// Unicast to the counter-party
    pub async fn send(&self, message: SwapMessage) -> SwapResult<()> {
        debug!("Swap {} sending '{}'", self.swap.id, message.event());
        self.ctx
            .room
            .send_to(&self.swap.counterparty.peer_id, &self.swap.id, message)
            .await
    }

    /// Messages of this swap from now on
    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.swap.id.clone(), self.ctx.room.subscribe())
    }

    /// Report a protocol violation and park the current step
    pub fn protocol_error(&self, kind: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(
            "Swap {} protocol error ({}): {}",
            self.swap.id, kind, message
        );
        crate::metrics::record_protocol_error(&self.protocol.name, kind);
        self.emit(FlowEvent::ProtocolError {
            kind: kind.to_string(),
            message,
        });
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
