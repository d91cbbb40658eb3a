//! Transition scheduler
//!
//! Drives every registered module through the job: process block, runs,
//! lumis and events, with events dispatched to a fixed pool of stream
//! slots. Global transitions run on the dispatcher; a scope only ends after
//! every slot that entered it has acknowledged its exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;

use crate::counter::{Transition, TransitionCounter};
use crate::error::{ContractViolation, Result, SchedulerError};
use crate::module::LimitedModule;
use crate::process_block::ProcessBlockStore;
use crate::report::JobReport;
use crate::scheduler::runner::{ModuleRunner, ScheduledModule};
use crate::scheduler::worker::{StreamCommand, WorkerPool};
use crate::scope::{ScopeHierarchy, ScopeInstance, ScopeKind, StreamId};
use crate::source::{InputFile, JobInput, LumiInput, RunInput};
use crate::validator::TransitionValidator;

/// Global transitions issued when a run or lumi begins, in order
const BEGIN_SEQUENCE: [Transition; 3] = [Transition::Begin, Transition::BeginSummary, Transition::BeginProduce];

/// Global transitions issued after the stream barrier, in order
const END_SEQUENCE: [Transition; 3] = [Transition::EndSummary, Transition::EndProduce, Transition::End];

/// Configuration for the TransitionScheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of stream slots
    pub streams: usize,
    /// Name of the current process stage
    pub process_name: String,
    /// Command queue depth per stream slot
    pub channel_capacity: usize,
    /// Check job-level transition totals against the input at teardown
    pub strict: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            streams: 3,
            process_name: "TEST".to_string(),
            channel_capacity: 64,
            strict: true,
        }
    }
}

impl SchedulerConfig {
    pub fn with_streams(mut self, streams: usize) -> Self {
        self.streams = streams;
        self
    }

    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = name.into();
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

pub struct TransitionScheduler {
    config: SchedulerConfig,
    modules: Vec<Arc<dyn ScheduledModule>>,
    validator: Option<TransitionValidator>,
}

impl TransitionScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        if config.streams == 0 {
            return Err(SchedulerError::Config("at least one stream is required".to_string()));
        }
        if config.process_name.trim().is_empty() {
            return Err(SchedulerError::Config("process name must not be empty".to_string()));
        }
        Ok(Self {
            config,
            modules: Vec::new(),
            validator: None,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a module; modules run in registration order
    pub fn add_module<M: LimitedModule>(&mut self, module: M) -> Result<()> {
        self.add_module_with_limit(module, None)
    }

    /// Register a module with a concurrency limit overriding its own
    pub fn add_module_with_limit<M: LimitedModule>(&mut self, module: M, limit: Option<usize>) -> Result<()> {
        let runner = ModuleRunner::new(module, limit)?;
        if self.modules.iter().any(|m| m.label() == runner.label()) {
            return Err(SchedulerError::Config(format!(
                "module label '{}' is registered twice",
                runner.label()
            )));
        }
        log::debug!("Registered module '{}' ({} hooks)", runner.label(), runner.hooks().len());
        self.modules.push(Arc::new(runner));
        Ok(())
    }

    /// Extra teardown checks on the job-level transition totals
    pub fn with_validator(mut self, validator: TransitionValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn module_labels(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.label()).collect()
    }

    /// Run one job over `input`. Any contract violation aborts the job.
    pub async fn run(self, input: &JobInput) -> Result<JobReport> {
        input.validate()?;
        if self.modules.is_empty() {
            return Err(SchedulerError::Config("no modules registered".to_string()));
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let counter = Arc::new(TransitionCounter::new());
        let cancel = Arc::new(AtomicBool::new(false));

        tracing::info!(
            process = %self.config.process_name,
            streams = self.config.streams,
            modules = self.modules.len(),
            "Job starting"
        );

        for module in &self.modules {
            module.begin_job()?;
        }
        counter.record(ScopeKind::Process, Transition::BeginJob);

        let mut pool = WorkerPool::spawn(
            &self.modules,
            self.config.streams,
            self.config.channel_capacity,
            Arc::clone(&counter),
            Arc::clone(&cancel),
        )?;

        let mut job = Job {
            modules: &self.modules,
            streams: self.config.streams,
            hierarchy: ScopeHierarchy::new(),
            store: ProcessBlockStore::new(&self.config.process_name),
            counter: Arc::clone(&counter),
            next_event: 1,
        };

        let process = match job.process(&mut pool, input).await {
            Ok(process) => process,
            Err(e) => {
                cancel.store(true, Ordering::SeqCst);
                tracing::error!(error = %e, "Job aborted");
                pool.abort().await;
                return Err(e);
            }
        };

        let per_stream = pool.shutdown().await?;
        job.finish(&process)?;

        let transitions = counter.snapshot();
        if self.config.strict {
            TransitionValidator::for_job(&input.totals(), self.config.streams).validate(&transitions)?;
        }
        if let Some(validator) = &self.validator {
            validator.validate(&transitions)?;
        }

        let report = JobReport {
            process_name: self.config.process_name.clone(),
            streams: self.config.streams,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            events_seen: per_stream.iter().map(|s| s.events).sum(),
            events_accepted: per_stream.iter().map(|s| s.accepted).sum(),
            scopes_retired: job.hierarchy.retired_count(),
            transitions,
            modules: self.modules.iter().map(|m| m.report()).collect(),
            per_stream,
        };
        tracing::info!(
            events = report.events_seen,
            accepted = report.events_accepted,
            duration_ms = report.duration_ms,
            "Job finished"
        );
        Ok(report)
    }
}

/// Per-job dispatcher state
struct Job<'a> {
    modules: &'a [Arc<dyn ScheduledModule>],
    streams: usize,
    hierarchy: ScopeHierarchy,
    store: ProcessBlockStore,
    counter: Arc<TransitionCounter>,
    next_event: u64,
}

impl Job<'_> {
    /// Everything up to the end of the process scope. Returns the ended
    /// process instance, still to be destroyed.
    async fn process(&mut self, pool: &mut WorkerPool, input: &JobInput) -> Result<ScopeInstance> {
        let process = self.hierarchy.open(ScopeKind::Process, 0, None)?;
        self.hierarchy.begin(process.id)?;
        self.counter.record_once(&process, Transition::Begin)?;
        self.process_block(Transition::BeginProduce, Transition::Begin)?;

        for (index, file) in input.files.iter().enumerate() {
            self.read_file(pool, index, file, &process).await?;
        }

        self.process_block(Transition::EndProduce, Transition::End)?;
        self.hierarchy.all_streams_ended(process.id)?;
        self.hierarchy.end(process.id)?;
        self.counter.record_once(&process, Transition::End)?;
        Ok(process)
    }

    /// Producers of every module run before any watcher, so a watcher can
    /// read what another module produced in the same transition.
    fn process_block(&mut self, produce: Transition, watch: Transition) -> Result<()> {
        for module in self.modules {
            module.process_block(produce, &mut self.store)?;
        }
        for module in self.modules {
            module.process_block(watch, &mut self.store)?;
        }
        tracing::debug!(
            scope = "process",
            transition = %watch,
            artifacts = self.store.artifact_count(),
            "Process block transition done"
        );
        Ok(())
    }

    async fn read_file(
        &mut self,
        pool: &mut WorkerPool,
        index: usize,
        file: &InputFile,
        process: &ScopeInstance,
    ) -> Result<()> {
        tracing::debug!(file = index, runs = file.runs.len(), "Reading input file");

        for block in &file.process_blocks {
            self.store.add_input_stage(&block.stage, &block.artifacts)?;
            let view = self.store.view(&block.stage);
            for module in self.modules {
                module.fill_input_caches(&view)?;
            }
            for module in self.modules {
                module.access_input(&view)?;
            }
            self.counter.record(ScopeKind::Process, Transition::AccessInput);
            tracing::debug!(stage = %block.stage, transition = "access_input", "Input process block read");
        }

        for run in &file.runs {
            self.run_scope(pool, run, process).await?;
        }

        let mut retired = 0;
        for module in self.modules {
            retired += module.retire_input_caches()?;
        }
        if retired > 0 {
            tracing::debug!(file = index, retired, "Input caches retired");
        }
        Ok(())
    }

    async fn run_scope(&mut self, pool: &mut WorkerPool, run: &RunInput, process: &ScopeInstance) -> Result<()> {
        let scope = self.hierarchy.open(ScopeKind::Run, run.run, Some(process.id))?;
        self.begin_global(&scope)?;

        for slot in 0..pool.streams() {
            let stream = StreamId(slot);
            self.hierarchy.enter(scope.id, stream)?;
            pool.send(stream, StreamCommand::BeginScope(scope.clone())).await?;
        }

        for lumi in &run.lumis {
            self.lumi_scope(pool, lumi, &scope).await?;
        }

        self.end_global(pool, &scope).await
    }

    async fn lumi_scope(&mut self, pool: &mut WorkerPool, lumi: &LumiInput, run: &ScopeInstance) -> Result<()> {
        let scope = self.hierarchy.open(ScopeKind::LuminosityBlock, lumi.lumi, Some(run.id))?;
        self.begin_global(&scope)?;

        for event in lumi.events(run.number, self.next_event) {
            let stream = pool.next_idle().await?;
            if self.hierarchy.enter(scope.id, stream)? {
                pool.send(stream, StreamCommand::BeginScope(scope.clone())).await?;
            }
            pool.send(stream, StreamCommand::Event(event)).await?;
        }
        self.next_event += lumi.events;

        self.end_global(pool, &scope).await
    }

    fn begin_global(&mut self, scope: &ScopeInstance) -> Result<()> {
        self.hierarchy.begin(scope.id)?;
        self.counter.record_once(scope, Transition::Begin)?;
        for transition in BEGIN_SEQUENCE {
            for module in self.modules {
                module.global(scope, transition)?;
            }
        }
        tracing::debug!(scope = %scope, transition = "begin", "Scope begun");
        Ok(())
    }

    async fn end_global(&mut self, pool: &mut WorkerPool, scope: &ScopeInstance) -> Result<()> {
        let entered = self.hierarchy.entered(scope.id);
        pool.end_scope(scope.id, &entered).await?;
        for &stream in &entered {
            self.hierarchy.exit(scope.id, stream)?;
        }
        self.hierarchy.all_streams_ended(scope.id)?;

        for module in self.modules {
            module.close_streams(scope)?;
        }
        for transition in END_SEQUENCE {
            for module in self.modules {
                module.global(scope, transition)?;
            }
        }
        self.hierarchy.end(scope.id)?;
        self.counter.record_once(scope, Transition::End)?;

        for module in self.modules {
            module.release(scope)?;
        }
        self.counter.check_balanced(scope)?;
        self.hierarchy.destroy(scope.id)?;
        self.counter.forget(scope.id);
        tracing::debug!(scope = %scope, streams = entered.len(), transition = "end", "Scope retired");
        Ok(())
    }

    /// Teardown after every stream has ended
    fn finish(&mut self, process: &ScopeInstance) -> Result<()> {
        for module in self.modules {
            let held = module.input_cache_size();
            if held != 0 {
                return Err(ContractViolation::leak(format!(
                    "{}: {} input cache sets still held at end of job",
                    module.label(),
                    held
                ))
                .into());
            }
            let live = module.live_caches();
            if live != 0 {
                return Err(ContractViolation::leak(format!(
                    "{}: {} scope caches outlived their scope",
                    module.label(),
                    live
                ))
                .into());
            }
        }

        self.counter.check_balanced(process)?;
        self.hierarchy.destroy(process.id)?;
        self.counter.forget(process.id);
        if self.counter.tracked_instances() != 0 {
            return Err(ContractViolation::leak(format!(
                "{} destroyed scopes still tracked by the transition counter",
                self.counter.tracked_instances()
            ))
            .into());
        }
        if self.hierarchy.live_count() != 0 {
            return Err(ContractViolation::leak(format!(
                "{} scope instances still live at end of job",
                self.hierarchy.live_count()
            ))
            .into());
        }

        for module in self.modules {
            module.end_job(self.streams)?;
        }
        self.counter.record(ScopeKind::Process, Transition::EndJob);
        Ok(())
    }
}
