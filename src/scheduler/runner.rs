//! Type-erased adapter between a `LimitedModule` and the scheduler.
//!
//! `ModuleRunner<M>` owns the module, its shared caches and its input cache
//! pool, and exposes them through the object-safe `ScheduledModule` trait.
//! Each stream slot gets one `StreamUnit` per module holding that slot's
//! exclusively owned stream cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Semaphore;

use crate::cache::Access;
use crate::counter::{Transition, TransitionCounter};
use crate::error::{ContractViolation, Result, SchedulerError};
use crate::input_cache::{FillOutcome, InputCachePool, InputCacheRegistry, InputCaches};
use crate::module::{
    Ability, EndJobContext, Event, GlobalContext, HookTable, LimitedModule, ModuleCaches, StreamContext,
};
use crate::process_block::{ProcessBlock, ProcessBlockStore};
use crate::report::ModuleReport;
use crate::scope::{ScopeInstance, ScopeKind, StreamId};
use crate::summary::SummaryReducer;

/// Scopes a stream slot is currently inside
#[derive(Debug, Clone, Default)]
pub struct StreamScopes {
    pub run: Option<ScopeInstance>,
    pub lumi: Option<ScopeInstance>,
}

/// Scheduler-facing view of one module
pub trait ScheduledModule: Send + Sync {
    fn label(&self) -> &str;

    fn hooks(&self) -> &HookTable;

    fn limiter(&self) -> Option<Arc<Semaphore>>;

    fn begin_job(&self) -> Result<()>;

    /// Create this module's unit for `stream`, running `begin_stream`
    fn begin_stream(self: Arc<Self>, stream: StreamId) -> Result<Box<dyn StreamUnit>>;

    /// Begin/BeginProduce/EndProduce/End of the current process block
    fn process_block(&self, transition: Transition, store: &mut ProcessBlockStore) -> Result<()>;

    fn access_input(&self, block: &ProcessBlock<'_>) -> Result<()>;

    fn fill_input_caches(&self, block: &ProcessBlock<'_>) -> Result<FillOutcome>;

    /// One global transition of a run or lumi
    fn global(&self, scope: &ScopeInstance, transition: Transition) -> Result<()>;

    /// Close stream access to the caches of `scope`
    fn close_streams(&self, scope: &ScopeInstance) -> Result<()>;

    /// Destroy the caches of `scope` after its end hooks
    fn release(&self, scope: &ScopeInstance) -> Result<()>;

    fn retire_input_caches(&self) -> Result<usize>;

    fn input_cache_size(&self) -> usize;

    /// Shared caches not yet destroyed
    fn live_caches(&self) -> usize;

    fn end_job(&self, streams: usize) -> Result<()>;

    fn report(&self) -> ModuleReport;
}

/// Per-stream half of a module, owned by one worker
pub trait StreamUnit: Send {
    fn label(&self) -> &str;

    fn limiter(&self) -> Option<Arc<Semaphore>>;

    fn begin_scope(&mut self, scope: &ScopeInstance, scopes: &StreamScopes) -> Result<()>;

    fn process(&mut self, scopes: &StreamScopes, event: &Event) -> Result<bool>;

    fn end_scope(&mut self, scope: &ScopeInstance, scopes: &StreamScopes) -> Result<()>;

    fn end_stream(self: Box<Self>) -> Result<()>;
}

pub struct ModuleRunner<M: LimitedModule> {
    module: M,
    label: String,
    hooks: HookTable,
    caches: ModuleCaches<M>,
    inputs: InputCachePool,
    limit: Option<usize>,
    limiter: Option<Arc<Semaphore>>,
    counter: TransitionCounter,
    passed: AtomicU64,
    rejected: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl<M: LimitedModule> ModuleRunner<M> {
    /// Wrap `module`; `limit` overrides the module's own concurrency limit
    pub fn new(module: M, limit: Option<usize>) -> Result<Self> {
        let label = module.label().to_string();
        if label.trim().is_empty() {
            return Err(SchedulerError::Config("module label must not be empty".to_string()));
        }
        let abilities = module.abilities();
        let hooks = HookTable::from_abilities(abilities);

        let mut registry = InputCacheRegistry::new();
        if abilities.has(Ability::InputProcessBlockCache) {
            module.register_input_caches(&mut registry)?;
        }

        let limit = limit.or_else(|| module.concurrency_limit());
        let limiter = match limit {
            Some(0) => {
                return Err(SchedulerError::Config(format!(
                    "module '{}' has a concurrency limit of 0",
                    label
                )));
            }
            Some(n) => Some(Arc::new(Semaphore::new(n))),
            None => None,
        };

        Ok(Self {
            module,
            label,
            hooks,
            caches: ModuleCaches::default(),
            inputs: InputCachePool::new(registry),
            limit,
            limiter,
            counter: TransitionCounter::new(),
            passed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    fn tag(&self, err: SchedulerError) -> SchedulerError {
        match err {
            SchedulerError::Contract(mut v) => {
                if !v.message.starts_with(&self.label) {
                    v.message = format!("{}: {}", self.label, v.message);
                }
                SchedulerError::Contract(v)
            }
            other => other,
        }
    }

    fn global_hook(&self, scope: &ScopeInstance, transition: Transition) -> Result<()> {
        use ScopeKind::*;
        use Transition::*;

        let ctx = GlobalContext {
            scope,
            caches: &self.caches,
        };
        match (scope.kind, transition) {
            (Run, Begin) => {
                let value = self.module.global_begin_run(scope)?;
                self.caches.runs.create(scope, value)
            }
            (Run, BeginSummary) => {
                let value = self.module.global_begin_run_summary(scope)?;
                self.caches.run_summaries.create(scope, SummaryReducer::new(value))
            }
            (Run, BeginProduce) => self.module.global_begin_run_produce(&ctx),
            (Run, EndSummary) => {
                let reducer = self.caches.run_summaries.handle(scope.id, Access::Global)?;
                reducer.finalize(|summary| self.module.global_end_run_summary(&ctx, summary))
            }
            (Run, EndProduce) => self.module.global_end_run_produce(&ctx),
            (Run, End) => self.module.global_end_run(&ctx),
            (LuminosityBlock, Begin) => {
                let value = self.module.global_begin_lumi(scope)?;
                self.caches.lumis.create(scope, value)
            }
            (LuminosityBlock, BeginSummary) => {
                let value = self.module.global_begin_lumi_summary(scope)?;
                self.caches.lumi_summaries.create(scope, SummaryReducer::new(value))
            }
            (LuminosityBlock, BeginProduce) => self.module.global_begin_lumi_produce(&ctx),
            (LuminosityBlock, EndSummary) => {
                let reducer = self.caches.lumi_summaries.handle(scope.id, Access::Global)?;
                reducer.finalize(|summary| self.module.global_end_lumi_summary(&ctx, summary))
            }
            (LuminosityBlock, EndProduce) => self.module.global_end_lumi_produce(&ctx),
            (LuminosityBlock, End) => self.module.global_end_lumi(&ctx),
            (kind, transition) => Err(ContractViolation::ordering(format!(
                "{} {} is not a global transition",
                kind, transition
            ))
            .in_scope(scope)
            .into()),
        }
    }
}

impl<M: LimitedModule> ScheduledModule for ModuleRunner<M> {
    fn label(&self) -> &str {
        &self.label
    }

    fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    fn limiter(&self) -> Option<Arc<Semaphore>> {
        self.limiter.clone()
    }

    fn begin_job(&self) -> Result<()> {
        self.counter.record(ScopeKind::Process, Transition::BeginJob);
        self.module.begin_job().map_err(|e| self.tag(e))
    }

    fn begin_stream(self: Arc<Self>, stream: StreamId) -> Result<Box<dyn StreamUnit>> {
        let cache = if self.hooks.handles(ScopeKind::Stream, Transition::Begin) {
            self.counter.record(ScopeKind::Stream, Transition::Begin);
            self.module.begin_stream(stream).map_err(|e| self.tag(e))?
        } else {
            M::StreamCache::default()
        };
        Ok(Box::new(ModuleStream {
            runner: self,
            stream,
            cache,
        }))
    }

    fn process_block(&self, transition: Transition, store: &mut ProcessBlockStore) -> Result<()> {
        if !self.hooks.handles(ScopeKind::Process, transition) {
            return Ok(());
        }
        self.counter.record(ScopeKind::Process, transition);
        let result = match transition {
            Transition::BeginProduce => self.module.begin_process_block_produce(&mut store.current()),
            Transition::Begin => self.module.begin_process_block(&store.view(store.process_name())),
            Transition::EndProduce => self.module.end_process_block_produce(&mut store.current()),
            Transition::End => self.module.end_process_block(&store.view(store.process_name())),
            other => Err(ContractViolation::ordering(format!("{} is not a process block transition", other)).into()),
        };
        result.map_err(|e| self.tag(e))
    }

    fn access_input(&self, block: &ProcessBlock<'_>) -> Result<()> {
        if !self.hooks.handles(ScopeKind::Process, Transition::AccessInput) {
            return Ok(());
        }
        self.counter.record(ScopeKind::Process, Transition::AccessInput);
        self.module.access_input_process_block(block).map_err(|e| self.tag(e))
    }

    fn fill_input_caches(&self, block: &ProcessBlock<'_>) -> Result<FillOutcome> {
        if !self.hooks.handles(ScopeKind::Process, Transition::FillInputCache) {
            return Ok(FillOutcome::default());
        }
        let outcome = self.inputs.fill(block).map_err(|e| self.tag(e))?;
        for _ in 0..outcome.filled {
            self.counter.record(ScopeKind::Process, Transition::FillInputCache);
        }
        Ok(outcome)
    }

    fn global(&self, scope: &ScopeInstance, transition: Transition) -> Result<()> {
        if !self.hooks.handles(scope.kind, transition) {
            return Ok(());
        }
        self.counter.record_once(scope, transition)?;
        self.global_hook(scope, transition).map_err(|e| self.tag(e))
    }

    fn close_streams(&self, scope: &ScopeInstance) -> Result<()> {
        match scope.kind {
            ScopeKind::Run => {
                if self.hooks.handles(ScopeKind::Run, Transition::Begin) {
                    self.caches.runs.close_streams(scope.id)?;
                }
                if self.hooks.handles(ScopeKind::Run, Transition::BeginSummary) {
                    self.caches.run_summaries.close_streams(scope.id)?;
                }
            }
            ScopeKind::LuminosityBlock => {
                if self.hooks.handles(ScopeKind::LuminosityBlock, Transition::Begin) {
                    self.caches.lumis.close_streams(scope.id)?;
                }
                if self.hooks.handles(ScopeKind::LuminosityBlock, Transition::BeginSummary) {
                    self.caches.lumi_summaries.close_streams(scope.id)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn release(&self, scope: &ScopeInstance) -> Result<()> {
        let result = match scope.kind {
            ScopeKind::Run => release_pair(
                &self.hooks,
                scope,
                |id| {
                    self.caches.runs.mark_ended(id)?;
                    self.caches.runs.destroy(id).map(drop)
                },
                |id| {
                    self.caches.run_summaries.mark_ended(id)?;
                    self.caches.run_summaries.destroy(id).map(drop)
                },
            ),
            ScopeKind::LuminosityBlock => release_pair(
                &self.hooks,
                scope,
                |id| {
                    self.caches.lumis.mark_ended(id)?;
                    self.caches.lumis.destroy(id).map(drop)
                },
                |id| {
                    self.caches.lumi_summaries.mark_ended(id)?;
                    self.caches.lumi_summaries.destroy(id).map(drop)
                },
            ),
            _ => Ok(()),
        };
        result.map_err(|e| self.tag(e))?;
        self.counter.forget(scope.id);
        Ok(())
    }

    fn retire_input_caches(&self) -> Result<usize> {
        self.inputs.retire().map_err(|e| self.tag(e))
    }

    fn input_cache_size(&self) -> usize {
        self.inputs.cache_size()
    }

    fn live_caches(&self) -> usize {
        self.caches.live()
    }

    fn end_job(&self, streams: usize) -> Result<()> {
        self.counter.record(ScopeKind::Process, Transition::EndJob);
        let ctx = EndJobContext {
            counts: self.counter.snapshot(),
            input_cache_size: self.inputs.cache_size(),
            streams,
        };
        self.module.end_job(&ctx).map_err(|e| self.tag(e))
    }

    fn report(&self) -> ModuleReport {
        ModuleReport {
            label: self.label.clone(),
            passed: self.passed.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            concurrency_limit: self.limit,
            peak_concurrency: self.peak.load(Ordering::SeqCst),
            transitions: self.counter.snapshot(),
        }
    }
}

fn release_pair(
    hooks: &HookTable,
    scope: &ScopeInstance,
    cache: impl FnOnce(crate::scope::ScopeId) -> Result<()>,
    summary: impl FnOnce(crate::scope::ScopeId) -> Result<()>,
) -> Result<()> {
    if hooks.handles(scope.kind, Transition::Begin) {
        cache(scope.id)?;
    }
    if hooks.handles(scope.kind, Transition::BeginSummary) {
        summary(scope.id)?;
    }
    Ok(())
}

struct ModuleStream<M: LimitedModule> {
    runner: Arc<ModuleRunner<M>>,
    stream: StreamId,
    cache: M::StreamCache,
}

fn stream_context<'a, M: LimitedModule>(
    stream: StreamId,
    runner: &'a ModuleRunner<M>,
    scopes: &'a StreamScopes,
    input: Option<&'a Arc<InputCaches>>,
) -> StreamContext<'a, M> {
    StreamContext {
        stream,
        run: scopes.run.as_ref(),
        lumi: scopes.lumi.as_ref(),
        caches: &runner.caches,
        input,
    }
}

impl<M: LimitedModule> ModuleStream<M> {
    /// Stream end hook, then the summary fold
    fn end_scope_hooks(&mut self, scope: &ScopeInstance, scopes: &StreamScopes) -> Result<()> {
        let runner = &*self.runner;
        let ctx = stream_context(self.stream, runner, scopes, None);
        let cache = &mut self.cache;

        if runner.hooks.handles(scope.kind, Transition::StreamEnd) {
            runner.counter.record(scope.kind, Transition::StreamEnd);
            match scope.kind {
                ScopeKind::Run => runner.module.stream_end_run(&ctx, cache)?,
                ScopeKind::LuminosityBlock => runner.module.stream_end_lumi(&ctx, cache)?,
                _ => {}
            }
        }
        if runner.hooks.handles(scope.kind, Transition::StreamEndSummary) {
            runner.counter.record(scope.kind, Transition::StreamEndSummary);
            match scope.kind {
                ScopeKind::Run => {
                    let reducer = runner.caches.run_summaries.handle(scope.id, Access::Stream)?;
                    reducer.fold(|summary| runner.module.stream_end_run_summary(&ctx, cache, summary))?;
                }
                ScopeKind::LuminosityBlock => {
                    let reducer = runner.caches.lumi_summaries.handle(scope.id, Access::Stream)?;
                    reducer.fold(|summary| runner.module.stream_end_lumi_summary(&ctx, cache, summary))?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl<M: LimitedModule> StreamUnit for ModuleStream<M> {
    fn label(&self) -> &str {
        &self.runner.label
    }

    fn limiter(&self) -> Option<Arc<Semaphore>> {
        self.runner.limiter.clone()
    }

    fn begin_scope(&mut self, scope: &ScopeInstance, scopes: &StreamScopes) -> Result<()> {
        let runner = &*self.runner;
        if !runner.hooks.handles(scope.kind, Transition::StreamBegin) {
            return Ok(());
        }
        runner.counter.record(scope.kind, Transition::StreamBegin);
        let ctx = stream_context(self.stream, runner, scopes, None);
        let result = match scope.kind {
            ScopeKind::Run => runner.module.stream_begin_run(&ctx, &mut self.cache),
            ScopeKind::LuminosityBlock => runner.module.stream_begin_lumi(&ctx, &mut self.cache),
            kind => Err(ContractViolation::ordering(format!("streams cannot enter a {} scope", kind)).into()),
        };
        result.map_err(|e| runner.tag(e))
    }

    fn process(&mut self, scopes: &StreamScopes, event: &Event) -> Result<bool> {
        let runner = &*self.runner;
        runner.counter.record(ScopeKind::Stream, Transition::Work);

        let now = runner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        runner.peak.fetch_max(now, Ordering::SeqCst);

        let input = runner.inputs.current();
        let ctx = stream_context(self.stream, runner, scopes, input.as_ref());
        let result = runner.module.filter(&ctx, &mut self.cache, event);
        drop(ctx);
        drop(input);
        runner.in_flight.fetch_sub(1, Ordering::SeqCst);

        let pass = result.map_err(|e| runner.tag(e))?;
        if pass {
            runner.passed.fetch_add(1, Ordering::SeqCst);
        } else {
            runner.rejected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(pass)
    }

    fn end_scope(&mut self, scope: &ScopeInstance, scopes: &StreamScopes) -> Result<()> {
        self.end_scope_hooks(scope, scopes)
            .map_err(|e| self.runner.tag(e.with_stream(self.stream)))
    }

    fn end_stream(self: Box<Self>) -> Result<()> {
        let ModuleStream { runner, stream, cache } = *self;
        if !runner.hooks.handles(ScopeKind::Stream, Transition::End) {
            return Ok(());
        }
        runner.counter.record(ScopeKind::Stream, Transition::End);
        runner.module.end_stream(stream, cache).map_err(|e| runner.tag(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViolationKind;
    use crate::module::Abilities;
    use crate::scope::ScopeHierarchy;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Tally {
        value: AtomicU32,
    }

    struct Counting {
        abilities: Abilities,
    }

    impl LimitedModule for Counting {
        type StreamCache = u32;
        type RunCache = Tally;
        type LumiCache = ();
        type RunSummary = u32;
        type LumiSummary = ();

        fn label(&self) -> &str {
            "counting"
        }

        fn abilities(&self) -> Abilities {
            self.abilities
        }

        fn filter(&self, ctx: &StreamContext<'_, Self>, cache: &mut u32, _event: &Event) -> Result<bool> {
            ctx.run_cache()?.value.fetch_add(1, Ordering::SeqCst);
            *cache += 1;
            Ok(*cache % 2 == 1)
        }

        fn stream_end_run_summary(
            &self,
            _ctx: &StreamContext<'_, Self>,
            cache: &mut u32,
            summary: &mut u32,
        ) -> Result<()> {
            *summary += *cache;
            *cache = 0;
            Ok(())
        }

        fn global_end_run_summary(&self, ctx: &GlobalContext<'_, Self>, summary: &mut u32) -> Result<()> {
            let seen = ctx.run_cache()?.value.load(Ordering::SeqCst);
            if seen != *summary {
                return Err(ContractViolation::expected("run summary", *summary, seen).into());
            }
            Ok(())
        }
    }

    fn counting() -> Arc<ModuleRunner<Counting>> {
        let abilities = Abilities::none()
            .with(Ability::StreamCache)
            .with(Ability::RunCache)
            .with(Ability::RunSummaryCache);
        Arc::new(ModuleRunner::new(Counting { abilities }, None).unwrap())
    }

    fn run_scope(h: &mut ScopeHierarchy) -> ScopeInstance {
        let p = h.open(ScopeKind::Process, 0, None).unwrap();
        h.begin(p.id).unwrap();
        let run = h.open(ScopeKind::Run, 1, Some(p.id)).unwrap();
        h.begin(run.id).unwrap();
        run
    }

    #[test]
    fn test_run_lifecycle_through_runner() {
        let runner = counting();
        let mut h = ScopeHierarchy::new();
        let run = run_scope(&mut h);

        for t in [Transition::Begin, Transition::BeginSummary, Transition::BeginProduce] {
            runner.global(&run, t).unwrap();
        }

        let mut unit = Arc::clone(&runner).begin_stream(StreamId(0)).unwrap();
        let scopes = StreamScopes {
            run: Some(run.clone()),
            lumi: None,
        };
        unit.begin_scope(&run, &scopes).unwrap();
        let event = Event { run: 1, lumi: 1, event: 1 };
        assert!(unit.process(&scopes, &event).unwrap());
        assert!(!unit.process(&scopes, &event).unwrap());
        assert!(unit.process(&scopes, &event).unwrap());
        unit.end_scope(&run, &scopes).unwrap();

        runner.close_streams(&run).unwrap();
        for t in [Transition::EndSummary, Transition::EndProduce, Transition::End] {
            runner.global(&run, t).unwrap();
        }
        runner.release(&run).unwrap();
        unit.end_stream().unwrap();

        assert_eq!(runner.live_caches(), 0);
        assert_eq!(runner.counter.tracked_instances(), 0);
        let report = runner.report();
        assert_eq!(report.passed, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.peak_concurrency, 1);
        assert_eq!(report.transitions.get(ScopeKind::Run, Transition::StreamEndSummary), 1);
    }

    #[test]
    fn test_undeclared_hooks_not_dispatched() {
        let runner = Arc::new(
            ModuleRunner::new(
                Counting {
                    abilities: Abilities::none(),
                },
                None,
            )
            .unwrap(),
        );
        let mut h = ScopeHierarchy::new();
        let run = run_scope(&mut h);
        runner.global(&run, Transition::Begin).unwrap();
        assert_eq!(runner.live_caches(), 0);
        assert!(runner.report().transitions.get(ScopeKind::Run, Transition::Begin) == 0);
    }

    #[test]
    fn test_double_global_begin_rejected() {
        let runner = counting();
        let mut h = ScopeHierarchy::new();
        let run = run_scope(&mut h);
        runner.global(&run, Transition::Begin).unwrap();
        let err = runner.global(&run, Transition::Begin).unwrap_err();
        assert!(err.is_violation(ViolationKind::Ordering));
    }

    #[test]
    fn test_filter_before_begin_is_ordering_violation() {
        let runner = counting();
        let mut h = ScopeHierarchy::new();
        let run = run_scope(&mut h);
        let mut unit = Arc::clone(&runner).begin_stream(StreamId(1)).unwrap();
        let scopes = StreamScopes {
            run: Some(run),
            lumi: None,
        };
        let err = unit.process(&scopes, &Event { run: 1, lumi: 1, event: 1 }).unwrap_err();
        assert!(err.is_violation(ViolationKind::Ordering));
        assert!(err.to_string().contains("counting"));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let result = ModuleRunner::new(
            Counting {
                abilities: Abilities::none(),
            },
            Some(0),
        );
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }
}
