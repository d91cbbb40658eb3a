//! Run-scoped filters: a shared run cache and the global begin/end watchers.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ContractViolation, Result};
use crate::filters::{HookCount, SharedTally, StreamTally, out_of_sequence};
use crate::module::{Abilities, Ability, EndJobContext, Event, GlobalContext, LimitedModule, StreamContext};
use crate::scope::ScopeInstance;

/// Counts events into a run cache shared by every stream and checks the
/// total when the run ends.
pub struct RunIntFilter {
    label: String,
    transitions: u32,
    cachevalue: u32,
    count: HookCount,
}

impl RunIntFilter {
    pub fn new(label: impl Into<String>, transitions: u32, cachevalue: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            cachevalue,
            count: HookCount::default(),
        }
    }
}

impl LimitedModule for RunIntFilter {
    type StreamCache = StreamTally;
    type RunCache = SharedTally;
    type LumiCache = ();
    type RunSummary = ();
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none().with(Ability::StreamCache).with(Ability::RunCache)
    }

    fn global_begin_run(&self, _run: &ScopeInstance) -> Result<SharedTally> {
        self.count.bump();
        let cache = SharedTally::default();
        cache.run.fetch_add(1, Ordering::SeqCst);
        Ok(cache)
    }

    fn stream_begin_run(&self, ctx: &StreamContext<'_, Self>, _cache: &mut StreamTally) -> Result<()> {
        if ctx.run_cache()?.run.load(Ordering::SeqCst) == 0 {
            return Err(out_of_sequence("stream_begin_run before global_begin_run", ctx.stream()));
        }
        Ok(())
    }

    fn filter(&self, ctx: &StreamContext<'_, Self>, _cache: &mut StreamTally, _event: &Event) -> Result<bool> {
        self.count.bump();
        ctx.run_cache()?.value.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn stream_end_run(&self, ctx: &StreamContext<'_, Self>, _cache: &mut StreamTally) -> Result<()> {
        if ctx.run_cache()?.run.load(Ordering::SeqCst) == 0 {
            return Err(out_of_sequence("stream_end_run after global_end_run", ctx.stream()));
        }
        Ok(())
    }

    fn global_end_run(&self, ctx: &GlobalContext<'_, Self>) -> Result<()> {
        self.count.bump();
        let cache = ctx.run_cache()?;
        let value = cache.value.load(Ordering::SeqCst);
        if value != self.cachevalue {
            return Err(ContractViolation::expected("cache value", value, self.cachevalue)
                .in_scope(ctx.scope())
                .into());
        }
        cache.run.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        self.count.expect(self.transitions)
    }
}

/// Checks that `filter` only runs after the run's begin produce hook
pub struct BeginRunFilter {
    label: String,
    transitions: u32,
    count: HookCount,
    produced: AtomicBool,
}

impl BeginRunFilter {
    pub fn new(label: impl Into<String>, transitions: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            count: HookCount::default(),
            produced: AtomicBool::new(false),
        }
    }
}

impl LimitedModule for BeginRunFilter {
    type StreamCache = ();
    type RunCache = ();
    type LumiCache = ();
    type RunSummary = ();
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none().with(Ability::RunCache).with(Ability::BeginRunProducer)
    }

    fn global_begin_run(&self, _run: &ScopeInstance) -> Result<()> {
        self.produced.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn global_begin_run_produce(&self, _ctx: &GlobalContext<'_, Self>) -> Result<()> {
        self.count.bump();
        self.produced.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn filter(&self, ctx: &StreamContext<'_, Self>, _cache: &mut (), _event: &Event) -> Result<bool> {
        if !self.produced.load(Ordering::SeqCst) {
            return Err(out_of_sequence("filter before global_begin_run_produce", ctx.stream()));
        }
        Ok(true)
    }

    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        self.count.expect(self.transitions)
    }
}

/// Checks that the run's end produce hook only runs after `filter`
pub struct EndRunFilter {
    label: String,
    transitions: u32,
    count: HookCount,
    filtered: AtomicBool,
}

impl EndRunFilter {
    pub fn new(label: impl Into<String>, transitions: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            count: HookCount::default(),
            filtered: AtomicBool::new(false),
        }
    }
}

impl LimitedModule for EndRunFilter {
    type StreamCache = ();
    type RunCache = ();
    type LumiCache = ();
    type RunSummary = ();
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none().with(Ability::RunCache).with(Ability::EndRunProducer)
    }

    fn global_begin_run(&self, _run: &ScopeInstance) -> Result<()> {
        self.filtered.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn filter(&self, _ctx: &StreamContext<'_, Self>, _cache: &mut (), _event: &Event) -> Result<bool> {
        self.filtered.store(true, Ordering::SeqCst);
        Ok(true)
    }

    fn global_end_run_produce(&self, ctx: &GlobalContext<'_, Self>) -> Result<()> {
        if !self.filtered.load(Ordering::SeqCst) {
            return Err(ContractViolation::ordering("global_end_run_produce before filter")
                .in_scope(ctx.scope())
                .into());
        }
        self.count.bump();
        Ok(())
    }

    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        self.count.expect(self.transitions)
    }
}
