//! Client contract of the scheduler.
//!
//! A client implements `LimitedModule`, declares which transitions it wants
//! through `Abilities`, and the scheduler builds a `HookTable` from that
//! declaration. Only declared hooks are ever invoked. Every hook is a
//! synchronous call made at the transition described on the hook.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::cache::{Access, CacheArena, CacheHandle};
use crate::counter::{Transition, TransitionCounts};
use crate::error::{ContractViolation, Result};
use crate::input_cache::{InputCacheRegistry, InputCaches};
use crate::process_block::ProcessBlock;
use crate::scope::{ScopeInstance, ScopeKind, StreamId};
use crate::summary::SummaryReducer;

/// One optional capability a module may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ability {
    StreamCache,
    RunCache,
    LumiCache,
    RunSummaryCache,
    LumiSummaryCache,
    WatchProcessBlock,
    BeginProcessBlockProducer,
    EndProcessBlockProducer,
    BeginRunProducer,
    EndRunProducer,
    BeginLumiProducer,
    EndLumiProducer,
    InputProcessBlockCache,
}

impl Ability {
    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Set of declared abilities
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Abilities(u32);

impl Abilities {
    pub fn none() -> Self {
        Self(0)
    }

    pub fn with(self, ability: Ability) -> Self {
        Self(self.0 | ability.bit())
    }

    pub fn has(self, ability: Ability) -> bool {
        self.0 & ability.bit() != 0
    }
}

impl From<&[Ability]> for Abilities {
    fn from(list: &[Ability]) -> Self {
        list.iter().fold(Abilities::none(), |acc, a| acc.with(*a))
    }
}

impl fmt::Debug for Abilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Ability::*;
        let all = [
            StreamCache,
            RunCache,
            LumiCache,
            RunSummaryCache,
            LumiSummaryCache,
            WatchProcessBlock,
            BeginProcessBlockProducer,
            EndProcessBlockProducer,
            BeginRunProducer,
            EndRunProducer,
            BeginLumiProducer,
            EndLumiProducer,
            InputProcessBlockCache,
        ];
        f.debug_set().entries(all.iter().filter(|a| self.has(**a))).finish()
    }
}

/// Dispatch table keyed by (ScopeKind, Transition)
#[derive(Debug, Clone, Default)]
pub struct HookTable {
    hooks: BTreeSet<(ScopeKind, Transition)>,
}

impl HookTable {
    pub fn from_abilities(abilities: Abilities) -> Self {
        use ScopeKind::*;
        use Transition::*;

        let mut hooks = BTreeSet::new();
        hooks.insert((Process, BeginJob));
        hooks.insert((Stream, Work));
        hooks.insert((Process, EndJob));

        if abilities.has(Ability::StreamCache) {
            hooks.extend([(Stream, Begin), (Stream, End)]);
            for scope in [Run, LuminosityBlock] {
                hooks.extend([(scope, StreamBegin), (scope, StreamEnd)]);
            }
        }
        if abilities.has(Ability::RunCache) {
            hooks.extend([(Run, Begin), (Run, End)]);
        }
        if abilities.has(Ability::LumiCache) {
            hooks.extend([(LuminosityBlock, Begin), (LuminosityBlock, End)]);
        }
        if abilities.has(Ability::RunSummaryCache) {
            hooks.extend([(Run, BeginSummary), (Run, StreamEndSummary), (Run, EndSummary)]);
        }
        if abilities.has(Ability::LumiSummaryCache) {
            hooks.extend([
                (LuminosityBlock, BeginSummary),
                (LuminosityBlock, StreamEndSummary),
                (LuminosityBlock, EndSummary),
            ]);
        }
        if abilities.has(Ability::WatchProcessBlock) {
            hooks.extend([(Process, Begin), (Process, End)]);
        }
        if abilities.has(Ability::BeginProcessBlockProducer) {
            hooks.insert((Process, BeginProduce));
        }
        if abilities.has(Ability::EndProcessBlockProducer) {
            hooks.insert((Process, EndProduce));
        }
        if abilities.has(Ability::BeginRunProducer) {
            hooks.insert((Run, BeginProduce));
        }
        if abilities.has(Ability::EndRunProducer) {
            hooks.insert((Run, EndProduce));
        }
        if abilities.has(Ability::BeginLumiProducer) {
            hooks.insert((LuminosityBlock, BeginProduce));
        }
        if abilities.has(Ability::EndLumiProducer) {
            hooks.insert((LuminosityBlock, EndProduce));
        }
        if abilities.has(Ability::InputProcessBlockCache) {
            hooks.extend([(Process, AccessInput), (Process, FillInputCache)]);
        }
        Self { hooks }
    }

    pub fn handles(&self, kind: ScopeKind, transition: Transition) -> bool {
        self.hooks.contains(&(kind, transition))
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// One event handed to `filter`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub run: u32,
    pub lumi: u32,
    pub event: u64,
}

/// Shared caches of one module, one arena per scope kind
pub struct ModuleCaches<M: LimitedModule> {
    pub(crate) runs: CacheArena<M::RunCache>,
    pub(crate) lumis: CacheArena<M::LumiCache>,
    pub(crate) run_summaries: CacheArena<SummaryReducer<M::RunSummary>>,
    pub(crate) lumi_summaries: CacheArena<SummaryReducer<M::LumiSummary>>,
}

impl<M: LimitedModule> Default for ModuleCaches<M> {
    fn default() -> Self {
        Self {
            runs: CacheArena::new(ScopeKind::Run),
            lumis: CacheArena::new(ScopeKind::LuminosityBlock),
            run_summaries: CacheArena::new(ScopeKind::Run),
            lumi_summaries: CacheArena::new(ScopeKind::LuminosityBlock),
        }
    }
}

impl<M: LimitedModule> ModuleCaches<M> {
    /// Number of live shared caches of every kind
    pub fn live(&self) -> usize {
        self.runs.len() + self.lumis.len() + self.run_summaries.len() + self.lumi_summaries.len()
    }
}

/// What a stream hook can see: its slot, its current scopes and the
/// shared caches of those scopes
pub struct StreamContext<'a, M: LimitedModule> {
    pub(crate) stream: StreamId,
    pub(crate) run: Option<&'a ScopeInstance>,
    pub(crate) lumi: Option<&'a ScopeInstance>,
    pub(crate) caches: &'a ModuleCaches<M>,
    pub(crate) input: Option<&'a Arc<InputCaches>>,
}

impl<M: LimitedModule> StreamContext<'_, M> {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn run(&self) -> Result<&ScopeInstance> {
        self.run.ok_or_else(|| {
            ContractViolation::ordering("run requested outside a run")
                .on_stream(self.stream)
                .into()
        })
    }

    pub fn lumi(&self) -> Result<&ScopeInstance> {
        self.lumi.ok_or_else(|| {
            ContractViolation::ordering("luminosity block requested outside a luminosity block")
                .on_stream(self.stream)
                .into()
        })
    }

    pub fn run_cache(&self) -> Result<CacheHandle<M::RunCache>> {
        let run = self.run()?;
        self.caches
            .runs
            .handle(run.id, Access::Stream)
            .map_err(|e| e.with_stream(self.stream))
    }

    pub fn lumi_cache(&self) -> Result<CacheHandle<M::LumiCache>> {
        let lumi = self.lumi()?;
        self.caches
            .lumis
            .handle(lumi.id, Access::Stream)
            .map_err(|e| e.with_stream(self.stream))
    }

    /// Input caches filled from the most recent upstream process block
    pub fn input_caches(&self) -> Result<&InputCaches> {
        self.input.map(|set| set.as_ref()).ok_or_else(|| {
            ContractViolation::ordering("input caches read before any process block filled them")
                .on_stream(self.stream)
                .into()
        })
    }
}

/// What a global run/lumi hook can see
pub struct GlobalContext<'a, M: LimitedModule> {
    pub(crate) scope: &'a ScopeInstance,
    pub(crate) caches: &'a ModuleCaches<M>,
}

impl<M: LimitedModule> GlobalContext<'_, M> {
    pub fn scope(&self) -> &ScopeInstance {
        self.scope
    }

    /// Cache of the run, or of the enclosing run for a lumi
    pub fn run_cache(&self) -> Result<CacheHandle<M::RunCache>> {
        let run_id = match self.scope.kind {
            ScopeKind::Run => self.scope.id,
            ScopeKind::LuminosityBlock => self
                .scope
                .parent
                .ok_or_else(|| ContractViolation::ordering("lumi without a parent run").in_scope(self.scope))?,
            _ => {
                return Err(ContractViolation::ordering("run cache requested outside a run")
                    .in_scope(self.scope)
                    .into());
            }
        };
        self.caches.runs.handle(run_id, Access::Global)
    }

    pub fn lumi_cache(&self) -> Result<CacheHandle<M::LumiCache>> {
        if self.scope.kind != ScopeKind::LuminosityBlock {
            return Err(ContractViolation::ordering("lumi cache requested outside a lumi")
                .in_scope(self.scope)
                .into());
        }
        self.caches.lumis.handle(self.scope.id, Access::Global)
    }
}

/// Handed to `end_job` for teardown checks
#[derive(Debug, Clone)]
pub struct EndJobContext {
    pub counts: TransitionCounts,
    /// Input cache sets still held by the module's pool
    pub input_cache_size: usize,
    pub streams: usize,
}

/// A module driven by the transition scheduler.
///
/// Modules are shared by every stream, so hooks take `&self`; state that
/// changes during the job lives in the caches or in atomics. All hooks have
/// no-op defaults except `filter`. Only hooks enabled by `abilities()` are
/// called.
pub trait LimitedModule: Send + Sync + Sized + 'static {
    /// Exclusively owned by one stream slot
    type StreamCache: Default + Send + 'static;
    /// Shared by every stream inside a run
    type RunCache: Default + Send + Sync + 'static;
    /// Shared by every stream inside a lumi
    type LumiCache: Default + Send + Sync + 'static;
    /// Accumulated from per-stream folds at run end
    type RunSummary: Default + Send + 'static;
    /// Accumulated from per-stream folds at lumi end
    type LumiSummary: Default + Send + 'static;

    fn label(&self) -> &str;

    fn abilities(&self) -> Abilities;

    /// Maximum concurrent `filter` calls across streams (None = unlimited)
    fn concurrency_limit(&self) -> Option<usize> {
        None
    }

    /// Called once per job before any stream begins
    fn begin_job(&self) -> Result<()> {
        Ok(())
    }

    fn register_input_caches(&self, _registry: &mut InputCacheRegistry) -> Result<()> {
        Ok(())
    }

    fn begin_stream(&self, _stream: StreamId) -> Result<Self::StreamCache> {
        Ok(Self::StreamCache::default())
    }

    fn begin_process_block(&self, _block: &ProcessBlock<'_>) -> Result<()> {
        Ok(())
    }

    fn begin_process_block_produce(&self, _block: &mut ProcessBlock<'_>) -> Result<()> {
        Ok(())
    }

    fn access_input_process_block(&self, _block: &ProcessBlock<'_>) -> Result<()> {
        Ok(())
    }

    fn global_begin_run(&self, _run: &ScopeInstance) -> Result<Self::RunCache> {
        Ok(Self::RunCache::default())
    }

    fn global_begin_run_summary(&self, _run: &ScopeInstance) -> Result<Self::RunSummary> {
        Ok(Self::RunSummary::default())
    }

    fn global_begin_run_produce(&self, _ctx: &GlobalContext<'_, Self>) -> Result<()> {
        Ok(())
    }

    fn stream_begin_run(&self, _ctx: &StreamContext<'_, Self>, _cache: &mut Self::StreamCache) -> Result<()> {
        Ok(())
    }

    fn global_begin_lumi(&self, _lumi: &ScopeInstance) -> Result<Self::LumiCache> {
        Ok(Self::LumiCache::default())
    }

    fn global_begin_lumi_summary(&self, _lumi: &ScopeInstance) -> Result<Self::LumiSummary> {
        Ok(Self::LumiSummary::default())
    }

    fn global_begin_lumi_produce(&self, _ctx: &GlobalContext<'_, Self>) -> Result<()> {
        Ok(())
    }

    fn stream_begin_lumi(&self, _ctx: &StreamContext<'_, Self>, _cache: &mut Self::StreamCache) -> Result<()> {
        Ok(())
    }

    /// Per-event work; returning false stops the event in this path
    fn filter(&self, ctx: &StreamContext<'_, Self>, cache: &mut Self::StreamCache, event: &Event) -> Result<bool>;

    fn stream_end_lumi(&self, _ctx: &StreamContext<'_, Self>, _cache: &mut Self::StreamCache) -> Result<()> {
        Ok(())
    }

    /// Fold this stream's contribution into the lumi summary
    fn stream_end_lumi_summary(
        &self,
        _ctx: &StreamContext<'_, Self>,
        _cache: &mut Self::StreamCache,
        _summary: &mut Self::LumiSummary,
    ) -> Result<()> {
        Ok(())
    }

    fn global_end_lumi_summary(&self, _ctx: &GlobalContext<'_, Self>, _summary: &mut Self::LumiSummary) -> Result<()> {
        Ok(())
    }

    fn global_end_lumi_produce(&self, _ctx: &GlobalContext<'_, Self>) -> Result<()> {
        Ok(())
    }

    fn global_end_lumi(&self, _ctx: &GlobalContext<'_, Self>) -> Result<()> {
        Ok(())
    }

    fn stream_end_run(&self, _ctx: &StreamContext<'_, Self>, _cache: &mut Self::StreamCache) -> Result<()> {
        Ok(())
    }

    /// Fold this stream's contribution into the run summary
    fn stream_end_run_summary(
        &self,
        _ctx: &StreamContext<'_, Self>,
        _cache: &mut Self::StreamCache,
        _summary: &mut Self::RunSummary,
    ) -> Result<()> {
        Ok(())
    }

    fn global_end_run_summary(&self, _ctx: &GlobalContext<'_, Self>, _summary: &mut Self::RunSummary) -> Result<()> {
        Ok(())
    }

    fn global_end_run_produce(&self, _ctx: &GlobalContext<'_, Self>) -> Result<()> {
        Ok(())
    }

    fn global_end_run(&self, _ctx: &GlobalContext<'_, Self>) -> Result<()> {
        Ok(())
    }

    fn end_process_block_produce(&self, _block: &mut ProcessBlock<'_>) -> Result<()> {
        Ok(())
    }

    fn end_process_block(&self, _block: &ProcessBlock<'_>) -> Result<()> {
        Ok(())
    }

    fn end_stream(&self, _stream: StreamId, _cache: Self::StreamCache) -> Result<()> {
        Ok(())
    }

    /// Called once after every scope is destroyed; teardown checks go here
    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        Ok(())
    }
}
