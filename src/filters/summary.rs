//! Filters that fold per-stream counts into run and lumi summaries.
//!
//! The fold order across streams is not fixed, so the finalized value only
//! depends on the sum.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{ContractViolation, Result};
use crate::filters::{HookCount, StreamTally, expect_stream_range, out_of_sequence};
use crate::module::{Abilities, Ability, EndJobContext, Event, GlobalContext, LimitedModule, StreamContext};
use crate::scope::{ScopeInstance, StreamId};

/// Counts events per stream and folds the stream counts into a run summary
pub struct RunSummaryIntFilter {
    label: String,
    transitions: u32,
    cachevalue: u32,
    count: HookCount,
}

impl RunSummaryIntFilter {
    pub fn new(label: impl Into<String>, transitions: u32, cachevalue: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            cachevalue,
            count: HookCount::default(),
        }
    }
}

impl LimitedModule for RunSummaryIntFilter {
    type StreamCache = StreamTally;
    type RunCache = ();
    type LumiCache = ();
    type RunSummary = StreamTally;
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none()
            .with(Ability::StreamCache)
            .with(Ability::RunSummaryCache)
    }

    fn begin_stream(&self, _stream: StreamId) -> Result<StreamTally> {
        self.count.bump();
        Ok(StreamTally::default())
    }

    fn global_begin_run_summary(&self, _run: &ScopeInstance) -> Result<StreamTally> {
        self.count.bump();
        Ok(StreamTally {
            run: 1,
            ..Default::default()
        })
    }

    fn filter(&self, _ctx: &StreamContext<'_, Self>, cache: &mut StreamTally, _event: &Event) -> Result<bool> {
        self.count.bump();
        cache.value += 1;
        Ok(true)
    }

    fn stream_end_run_summary(
        &self,
        ctx: &StreamContext<'_, Self>,
        cache: &mut StreamTally,
        summary: &mut StreamTally,
    ) -> Result<()> {
        self.count.bump();
        if summary.run == 0 {
            return Err(out_of_sequence("stream_end_run_summary after global_end_run_summary", ctx.stream()));
        }
        summary.value += cache.value;
        cache.value = 0;
        Ok(())
    }

    fn global_end_run_summary(&self, ctx: &GlobalContext<'_, Self>, summary: &mut StreamTally) -> Result<()> {
        self.count.bump();
        if summary.value != self.cachevalue {
            return Err(ContractViolation::expected("cache value", summary.value, self.cachevalue)
                .in_scope(ctx.scope())
                .into());
        }
        summary.run -= 1;
        Ok(())
    }

    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        self.count.expect(self.transitions)
    }
}

/// Counts events per stream and folds them into a lumi summary, checking
/// that every fold lands in the lumi it belongs to.
pub struct LumiSummaryIntFilter {
    label: String,
    transitions: u32,
    cachevalue: u32,
    count: HookCount,
    lumis: AtomicU32,
    streams: AtomicU32,
    stream_lumi_transitions: AtomicU32,
}

impl LumiSummaryIntFilter {
    pub fn new(label: impl Into<String>, transitions: u32, cachevalue: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            cachevalue,
            count: HookCount::default(),
            lumis: AtomicU32::new(0),
            streams: AtomicU32::new(0),
            stream_lumi_transitions: AtomicU32::new(0),
        }
    }
}

impl LimitedModule for LumiSummaryIntFilter {
    type StreamCache = StreamTally;
    type RunCache = ();
    type LumiCache = ();
    type RunSummary = ();
    type LumiSummary = StreamTally;

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none()
            .with(Ability::StreamCache)
            .with(Ability::LumiSummaryCache)
    }

    fn begin_stream(&self, _stream: StreamId) -> Result<StreamTally> {
        self.count.bump();
        self.streams.fetch_add(1, Ordering::SeqCst);
        Ok(StreamTally::default())
    }

    fn global_begin_lumi_summary(&self, lumi: &ScopeInstance) -> Result<StreamTally> {
        self.count.bump();
        self.lumis.fetch_add(1, Ordering::SeqCst);
        Ok(StreamTally {
            lumi: lumi.number,
            ..Default::default()
        })
    }

    fn filter(&self, _ctx: &StreamContext<'_, Self>, cache: &mut StreamTally, _event: &Event) -> Result<bool> {
        self.count.bump();
        cache.value += 1;
        Ok(true)
    }

    fn stream_end_lumi_summary(
        &self,
        ctx: &StreamContext<'_, Self>,
        cache: &mut StreamTally,
        summary: &mut StreamTally,
    ) -> Result<()> {
        self.stream_lumi_transitions.fetch_add(1, Ordering::SeqCst);
        let lumi = ctx.lumi()?;
        if summary.lumi != lumi.number {
            return Err(ContractViolation::expected("stream_end_lumi_summary lumi number", summary.lumi, lumi.number)
                .in_scope(lumi)
                .on_stream(ctx.stream())
                .into());
        }
        summary.value += cache.value;
        cache.value = 0;
        Ok(())
    }

    fn global_end_lumi_summary(&self, ctx: &GlobalContext<'_, Self>, summary: &mut StreamTally) -> Result<()> {
        self.count.bump();
        if summary.lumi != ctx.scope().number {
            return Err(ContractViolation::expected(
                "global_end_lumi_summary lumi number",
                summary.lumi,
                ctx.scope().number,
            )
            .in_scope(ctx.scope())
            .into());
        }
        if summary.value != self.cachevalue {
            return Err(ContractViolation::expected("cache value", summary.value, self.cachevalue)
                .in_scope(ctx.scope())
                .into());
        }
        Ok(())
    }

    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        self.count.expect(self.transitions)?;
        expect_stream_range(
            "stream lumi transitions",
            self.stream_lumi_transitions.load(Ordering::SeqCst),
            self.lumis.load(Ordering::SeqCst),
            self.streams.load(Ordering::SeqCst),
        )
    }
}
