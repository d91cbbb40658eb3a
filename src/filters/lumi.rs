//! Luminosity block filters

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ContractViolation, Result};
use crate::filters::{HookCount, SharedTally, StreamTally, out_of_sequence};
use crate::module::{Abilities, Ability, EndJobContext, Event, GlobalContext, LimitedModule, StreamContext};
use crate::scope::ScopeInstance;

/// Counts events into a lumi cache shared by every stream and checks the
/// total when the lumi ends.
pub struct LumiIntFilter {
    label: String,
    transitions: u32,
    cachevalue: u32,
    count: HookCount,
}

impl LumiIntFilter {
    pub fn new(label: impl Into<String>, transitions: u32, cachevalue: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            cachevalue,
            count: HookCount::default(),
        }
    }
}

impl LimitedModule for LumiIntFilter {
    type StreamCache = StreamTally;
    type RunCache = ();
    type LumiCache = SharedTally;
    type RunSummary = ();
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none().with(Ability::StreamCache).with(Ability::LumiCache)
    }

    fn global_begin_lumi(&self, _lumi: &ScopeInstance) -> Result<SharedTally> {
        self.count.bump();
        let cache = SharedTally::default();
        cache.lumi.fetch_add(1, Ordering::SeqCst);
        Ok(cache)
    }

    fn stream_begin_lumi(&self, ctx: &StreamContext<'_, Self>, _cache: &mut StreamTally) -> Result<()> {
        if ctx.lumi_cache()?.lumi.load(Ordering::SeqCst) == 0 {
            return Err(out_of_sequence("stream_begin_lumi seen before global_begin_lumi", ctx.stream()));
        }
        Ok(())
    }

    fn filter(&self, ctx: &StreamContext<'_, Self>, _cache: &mut StreamTally, _event: &Event) -> Result<bool> {
        self.count.bump();
        ctx.lumi_cache()?.value.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn stream_end_lumi(&self, ctx: &StreamContext<'_, Self>, _cache: &mut StreamTally) -> Result<()> {
        if ctx.lumi_cache()?.lumi.load(Ordering::SeqCst) == 0 {
            return Err(out_of_sequence("stream_end_lumi seen after global_end_lumi", ctx.stream()));
        }
        Ok(())
    }

    fn global_end_lumi(&self, ctx: &GlobalContext<'_, Self>) -> Result<()> {
        self.count.bump();
        let cache = ctx.lumi_cache()?;
        let remaining = cache.lumi.fetch_sub(1, Ordering::SeqCst).wrapping_sub(1);
        if remaining != 0 {
            return Err(ContractViolation::ordering("global_end_lumi seen before global_begin_lumi")
                .in_scope(ctx.scope())
                .into());
        }
        let value = cache.value.load(Ordering::SeqCst);
        if value != self.cachevalue {
            return Err(ContractViolation::expected("cache value", value, self.cachevalue)
                .in_scope(ctx.scope())
                .into());
        }
        Ok(())
    }

    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        self.count.expect(self.transitions)
    }
}

/// Checks that `filter` only runs after the lumi's begin produce hook
pub struct BeginLumiFilter {
    label: String,
    transitions: u32,
    count: HookCount,
    produced: AtomicBool,
}

impl BeginLumiFilter {
    pub fn new(label: impl Into<String>, transitions: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            count: HookCount::default(),
            produced: AtomicBool::new(false),
        }
    }
}

impl LimitedModule for BeginLumiFilter {
    type StreamCache = ();
    type RunCache = ();
    type LumiCache = ();
    type RunSummary = ();
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none().with(Ability::LumiCache).with(Ability::BeginLumiProducer)
    }

    fn global_begin_lumi(&self, _lumi: &ScopeInstance) -> Result<()> {
        self.produced.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn global_begin_lumi_produce(&self, _ctx: &GlobalContext<'_, Self>) -> Result<()> {
        self.count.bump();
        self.produced.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn filter(&self, ctx: &StreamContext<'_, Self>, _cache: &mut (), _event: &Event) -> Result<bool> {
        if !self.produced.load(Ordering::SeqCst) {
            return Err(out_of_sequence("filter before global_begin_lumi_produce", ctx.stream()));
        }
        Ok(true)
    }

    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        self.count.expect(self.transitions)
    }
}

/// Checks that the lumi's end produce hook only runs after `filter`
pub struct EndLumiFilter {
    label: String,
    transitions: u32,
    count: HookCount,
    filtered: AtomicBool,
}

impl EndLumiFilter {
    pub fn new(label: impl Into<String>, transitions: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            count: HookCount::default(),
            filtered: AtomicBool::new(false),
        }
    }
}

impl LimitedModule for EndLumiFilter {
    type StreamCache = ();
    type RunCache = ();
    type LumiCache = ();
    type RunSummary = ();
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none().with(Ability::LumiCache).with(Ability::EndLumiProducer)
    }

    fn global_begin_lumi(&self, _lumi: &ScopeInstance) -> Result<()> {
        self.filtered.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn filter(&self, _ctx: &StreamContext<'_, Self>, _cache: &mut (), _event: &Event) -> Result<bool> {
        self.filtered.store(true, Ordering::SeqCst);
        Ok(true)
    }

    fn global_end_lumi_produce(&self, ctx: &GlobalContext<'_, Self>) -> Result<()> {
        if !self.filtered.load(Ordering::SeqCst) {
            return Err(ContractViolation::ordering("global_end_lumi_produce before filter")
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
