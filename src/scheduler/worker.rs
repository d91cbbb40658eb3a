//! Fixed-size pool of stream workers.
//!
//! Each slot is one tokio task that owns the slot's stream units and
//! processes its commands in order. Slots report back to the dispatcher on
//! a shared event channel: one `Idle` token after every finished event, or
//! `Failed` when something went wrong. Scope exits are acknowledged on a
//! per-command oneshot so the dispatcher can wait for a barrier.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::counter::{Transition, TransitionCounter};
use crate::error::{ContractViolation, Result, SchedulerError};
use crate::module::Event;
use crate::report::StreamStats;
use crate::scheduler::runner::{ScheduledModule, StreamScopes, StreamUnit};
use crate::scope::{ScopeId, ScopeInstance, ScopeKind, StreamId, StreamPhase};

/// Command sent from the dispatcher to one stream slot
#[derive(Debug)]
pub enum StreamCommand {
    /// Enter a run or lumi
    BeginScope(ScopeInstance),
    /// Run the module path on one event
    Event(Event),
    /// Leave a scope; acknowledged once every module has finished with it
    EndScope {
        scope: ScopeId,
        ack: oneshot::Sender<Result<()>>,
    },
    /// Run `end_stream` and stop
    EndStream { ack: oneshot::Sender<Result<StreamStats>> },
}

/// Event sent from stream slots back to the dispatcher
#[derive(Debug)]
pub enum WorkerEvent {
    /// The slot finished its event and can take another one
    Idle(StreamId),
    /// The slot failed and will not take more work
    Failed { stream: StreamId, error: SchedulerError },
}

struct StreamWorker {
    stream: StreamId,
    units: Vec<Box<dyn StreamUnit>>,
    scopes: StreamScopes,
    phases: HashMap<ScopeId, StreamPhase>,
    stats: StreamStats,
    counter: Arc<TransitionCounter>,
    cancel: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    commands: mpsc::Receiver<StreamCommand>,
    failed: bool,
}

impl StreamWorker {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                StreamCommand::BeginScope(scope) => {
                    if self.halted() {
                        continue;
                    }
                    if let Err(e) = self.begin_scope(scope) {
                        self.fail(e);
                    }
                }
                StreamCommand::Event(event) => {
                    if self.halted() {
                        continue;
                    }
                    match self.process(event).await {
                        Ok(()) => {
                            let _ = self.events.send(WorkerEvent::Idle(self.stream));
                        }
                        Err(e) => self.fail(e),
                    }
                }
                StreamCommand::EndScope { scope, ack } => {
                    let result = if self.halted() {
                        Err(SchedulerError::Cancelled)
                    } else {
                        self.end_scope(scope)
                    };
                    if result.is_err() {
                        self.halt();
                    }
                    let _ = ack.send(result);
                }
                StreamCommand::EndStream { ack } => {
                    let result = if self.halted() {
                        Err(SchedulerError::Cancelled)
                    } else {
                        self.end_stream()
                    };
                    let _ = ack.send(result);
                    break;
                }
            }
        }
        tracing::debug!(stream = %self.stream, "Stream worker exiting");
    }

    fn halted(&self) -> bool {
        self.failed || self.cancel.load(Ordering::SeqCst)
    }

    fn halt(&mut self) {
        self.failed = true;
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn fail(&mut self, error: SchedulerError) {
        tracing::error!(stream = %self.stream, error = %error, "Stream failed");
        self.halt();
        let _ = self.events.send(WorkerEvent::Failed {
            stream: self.stream,
            error,
        });
    }

    fn begin_scope(&mut self, scope: ScopeInstance) -> Result<()> {
        match scope.kind {
            ScopeKind::Run => {
                if let Some(open) = &self.scopes.run {
                    return Err(ContractViolation::ordering(format!("entered while still inside {}", open))
                        .in_scope(&scope)
                        .on_stream(self.stream)
                        .into());
                }
                self.scopes.run = Some(scope.clone());
            }
            ScopeKind::LuminosityBlock => {
                let inside_parent = self.scopes.run.as_ref().is_some_and(|run| Some(run.id) == scope.parent);
                if !inside_parent || self.scopes.lumi.is_some() {
                    return Err(ContractViolation::ordering("lumi entered outside its run")
                        .in_scope(&scope)
                        .on_stream(self.stream)
                        .into());
                }
                self.scopes.lumi = Some(scope.clone());
            }
            kind => {
                return Err(ContractViolation::ordering(format!("streams cannot enter a {} scope", kind))
                    .on_stream(self.stream)
                    .into());
            }
        }

        self.phases.insert(scope.id, StreamPhase::Entering);
        self.counter.record(scope.kind, Transition::StreamBegin);
        tracing::debug!(stream = %self.stream, scope = %scope, transition = "stream_begin", "Stream entering scope");
        for unit in self.units.iter_mut() {
            unit.begin_scope(&scope, &self.scopes)?;
        }
        self.phases.insert(scope.id, StreamPhase::Working);
        Ok(())
    }

    async fn process(&mut self, event: Event) -> Result<()> {
        let lumi = self.scopes.lumi.as_ref().ok_or_else(|| {
            ContractViolation::ordering(format!("event {} dispatched outside a lumi", event.event))
                .on_stream(self.stream)
        })?;
        if lumi.run != event.run || lumi.number != event.lumi {
            return Err(ContractViolation::ordering(format!(
                "event {}:{}:{} dispatched inside {}",
                event.run, event.lumi, event.event, lumi
            ))
            .on_stream(self.stream)
            .into());
        }
        if self.phases.get(&lumi.id) != Some(&StreamPhase::Working) {
            return Err(ContractViolation::ordering("event processed before the stream entered its lumi")
                .in_scope(lumi)
                .on_stream(self.stream)
                .into());
        }

        self.counter.record(ScopeKind::Stream, Transition::Work);
        self.stats.events += 1;

        let mut accepted = true;
        for unit in self.units.iter_mut() {
            let _permit = match unit.limiter() {
                Some(limiter) => Some(limiter.acquire_owned().await.map_err(|_| SchedulerError::Cancelled)?),
                None => None,
            };
            if !unit.process(&self.scopes, &event)? {
                accepted = false;
                break;
            }
        }
        if accepted {
            self.stats.accepted += 1;
        }
        Ok(())
    }

    fn end_scope(&mut self, id: ScopeId) -> Result<()> {
        let scope = match (&self.scopes.lumi, &self.scopes.run) {
            (Some(lumi), _) if lumi.id == id => lumi.clone(),
            (None, Some(run)) if run.id == id => run.clone(),
            (Some(lumi), Some(run)) if run.id == id => {
                return Err(ContractViolation::ordering(format!("run exit requested while still inside {}", lumi))
                    .in_scope(run)
                    .on_stream(self.stream)
                    .into());
            }
            _ => {
                return Err(ContractViolation::ordering(format!(
                    "exit requested for scope {} the stream is not inside",
                    id.0
                ))
                .on_stream(self.stream)
                .into());
            }
        };

        for unit in self.units.iter_mut() {
            unit.end_scope(&scope, &self.scopes)?;
        }
        self.counter.record(scope.kind, Transition::StreamEnd);
        self.phases.insert(scope.id, StreamPhase::Exited);
        match scope.kind {
            ScopeKind::LuminosityBlock => self.scopes.lumi = None,
            _ => self.scopes.run = None,
        }
        tracing::debug!(stream = %self.stream, scope = %scope, transition = "stream_end", "Stream left scope");
        Ok(())
    }

    fn end_stream(&mut self) -> Result<StreamStats> {
        if let Some(open) = self.scopes.lumi.as_ref().or(self.scopes.run.as_ref()) {
            return Err(ContractViolation::ordering("stream ended while still inside a scope")
                .in_scope(open)
                .on_stream(self.stream)
                .into());
        }
        for unit in std::mem::take(&mut self.units) {
            unit.end_stream()?;
        }
        self.counter.record(ScopeKind::Stream, Transition::End);
        Ok(self.stats)
    }
}

/// Dispatcher-side handle on the stream slots
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<StreamCommand>>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create `streams` slots. `begin_stream` runs here, slot by slot,
    /// before any worker task starts.
    pub fn spawn(
        modules: &[Arc<dyn ScheduledModule>],
        streams: usize,
        capacity: usize,
        counter: Arc<TransitionCounter>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut senders = Vec::with_capacity(streams);
        let mut handles = Vec::with_capacity(streams);

        for slot in 0..streams {
            let stream = StreamId(slot);
            let units = modules
                .iter()
                .map(|m| Arc::clone(m).begin_stream(stream))
                .collect::<Result<Vec<_>>>()?;
            counter.record(ScopeKind::Stream, Transition::Begin);

            let (tx, rx) = mpsc::channel(capacity.max(1));
            let worker = StreamWorker {
                stream,
                units,
                scopes: StreamScopes::default(),
                phases: HashMap::new(),
                stats: StreamStats::new(stream),
                counter: Arc::clone(&counter),
                cancel: Arc::clone(&cancel),
                events: event_tx.clone(),
                commands: rx,
                failed: false,
            };
            handles.push(tokio::spawn(worker.run()));
            senders.push(tx);
            let _ = event_tx.send(WorkerEvent::Idle(stream));
            tracing::debug!(stream = %stream, transition = "begin", "Stream slot started");
        }

        Ok(Self {
            senders,
            events: event_rx,
            handles,
        })
    }

    pub fn streams(&self) -> usize {
        self.senders.len()
    }

    /// Wait for the next slot that can take an event
    pub async fn next_idle(&mut self) -> Result<StreamId> {
        match self.events.recv().await {
            Some(WorkerEvent::Idle(stream)) => Ok(stream),
            Some(WorkerEvent::Failed { error, .. }) => Err(error),
            None => Err(SchedulerError::WorkerLost("all stream workers exited".to_string())),
        }
    }

    pub async fn send(&self, stream: StreamId, command: StreamCommand) -> Result<()> {
        let sender = self
            .senders
            .get(stream.value())
            .ok_or_else(|| SchedulerError::WorkerLost(format!("no worker for {}", stream)))?;
        sender
            .send(command)
            .await
            .map_err(|_| SchedulerError::WorkerLost(format!("{} stopped accepting commands", stream)))
    }

    /// Barrier: every slot in `streams` leaves `scope`
    pub async fn end_scope(&mut self, scope: ScopeId, streams: &[StreamId]) -> Result<()> {
        let mut acks = Vec::with_capacity(streams.len());
        for &stream in streams {
            let (ack, done) = oneshot::channel();
            self.send(stream, StreamCommand::EndScope { scope, ack }).await?;
            acks.push(async move {
                match done.await {
                    Ok(result) => result,
                    Err(_) => Err(SchedulerError::WorkerLost(format!("{} dropped a scope exit", stream))),
                }
            });
        }
        match futures::future::try_join_all(acks).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.first_failure().unwrap_or(e)),
        }
    }

    /// End every slot and collect their stats
    pub async fn shutdown(mut self) -> Result<Vec<StreamStats>> {
        let mut acks = Vec::with_capacity(self.senders.len());
        for slot in 0..self.senders.len() {
            let stream = StreamId(slot);
            let (ack, done) = oneshot::channel();
            self.send(stream, StreamCommand::EndStream { ack }).await?;
            acks.push(async move {
                match done.await {
                    Ok(result) => result,
                    Err(_) => Err(SchedulerError::WorkerLost(format!("{} dropped end of stream", stream))),
                }
            });
        }
        let stats = match futures::future::try_join_all(acks).await {
            Ok(stats) => stats,
            Err(e) => return Err(self.first_failure().unwrap_or(e)),
        };
        self.senders.clear();
        for handle in self.handles.drain(..) {
            handle
                .await
                .map_err(|e| SchedulerError::WorkerLost(format!("stream task panicked: {}", e)))?;
        }
        Ok(stats)
    }

    /// Stop every slot without running `end_stream`
    pub async fn abort(mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Stream task panicked during abort");
            }
        }
    }

    /// The failure a slot reported, if one is already queued
    fn first_failure(&mut self) -> Option<SchedulerError> {
        while let Ok(event) = self.events.try_recv() {
            if let WorkerEvent::Failed { error, .. } = event {
                return Some(error);
            }
        }
        None
    }
}
