//! Stream-scoped filter

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{ContractViolation, Result};
use crate::filters::{HookCount, StreamTally, expect_stream_range, out_of_sequence};
use crate::module::{Abilities, Ability, EndJobContext, Event, LimitedModule, StreamContext};
use crate::scope::StreamId;

/// Walks every stream transition with a slot-owned cache and checks that
/// they arrive properly nested.
///
/// `transitions` counts begin/end stream, stream begin/end run and filter
/// calls. Stream lumi transitions are lazy, so they are only checked to
/// lie between `n_lumis` and `n_lumis` times the stream count.
pub struct StreamIntFilter {
    label: String,
    transitions: u32,
    n_lumis: u32,
    count: HookCount,
    streams: AtomicU32,
    stream_begin_lumis: AtomicU32,
    stream_end_lumis: AtomicU32,
}

impl StreamIntFilter {
    pub fn new(label: impl Into<String>, transitions: u32, n_lumis: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            n_lumis,
            count: HookCount::default(),
            streams: AtomicU32::new(0),
            stream_begin_lumis: AtomicU32::new(0),
            stream_end_lumis: AtomicU32::new(0),
        }
    }

    /// The slot's cache must carry the slot's own id
    fn check_owner(stream: StreamId, cache: &StreamTally) -> Result<()> {
        if cache.value as usize != stream.value() {
            return Err(ContractViolation::expected("cache value", cache.value, stream)
                .on_stream(stream)
                .into());
        }
        Ok(())
    }
}

impl LimitedModule for StreamIntFilter {
    type StreamCache = StreamTally;
    type RunCache = ();
    type LumiCache = ();
    type RunSummary = ();
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none().with(Ability::StreamCache)
    }

    fn begin_stream(&self, stream: StreamId) -> Result<StreamTally> {
        self.count.bump();
        self.streams.fetch_add(1, Ordering::SeqCst);
        Ok(StreamTally {
            value: stream.value() as u32,
            strm: 1,
            ..Default::default()
        })
    }

    fn stream_begin_run(&self, ctx: &StreamContext<'_, Self>, cache: &mut StreamTally) -> Result<()> {
        self.count.bump();
        Self::check_owner(ctx.stream(), cache)?;
        if cache.run != 0 || cache.lumi != 0 || cache.work != 0 || cache.strm != 1 {
            return Err(out_of_sequence("stream_begin_run out of sequence", ctx.stream()));
        }
        cache.run += 1;
        Ok(())
    }

    fn stream_begin_lumi(&self, ctx: &StreamContext<'_, Self>, cache: &mut StreamTally) -> Result<()> {
        self.stream_begin_lumis.fetch_add(1, Ordering::SeqCst);
        Self::check_owner(ctx.stream(), cache)?;
        if cache.lumi != 0 || cache.work != 0 {
            return Err(out_of_sequence("stream_begin_lumi out of sequence", ctx.stream()));
        }
        cache.lumi += 1;
        Ok(())
    }

    fn filter(&self, ctx: &StreamContext<'_, Self>, cache: &mut StreamTally, _event: &Event) -> Result<bool> {
        self.count.bump();
        Self::check_owner(ctx.stream(), cache)?;
        cache.work += 1;
        if cache.lumi == 0 && cache.run == 0 {
            return Err(out_of_sequence("filter out of sequence", ctx.stream()));
        }
        Ok(true)
    }

    fn stream_end_lumi(&self, ctx: &StreamContext<'_, Self>, cache: &mut StreamTally) -> Result<()> {
        self.stream_end_lumis.fetch_add(1, Ordering::SeqCst);
        Self::check_owner(ctx.stream(), cache)?;
        cache.lumi = cache.lumi.wrapping_sub(1);
        cache.work = 0;
        if cache.lumi != 0 || cache.run == 0 {
            return Err(out_of_sequence("stream_end_lumi out of sequence", ctx.stream()));
        }
        Ok(())
    }

    fn stream_end_run(&self, ctx: &StreamContext<'_, Self>, cache: &mut StreamTally) -> Result<()> {
        self.count.bump();
        Self::check_owner(ctx.stream(), cache)?;
        cache.run = cache.run.wrapping_sub(1);
        cache.work = 0;
        if cache.run != 0 || cache.lumi != 0 {
            return Err(out_of_sequence("stream_end_run out of sequence", ctx.stream()));
        }
        Ok(())
    }

    fn end_stream(&self, stream: StreamId, mut cache: StreamTally) -> Result<()> {
        self.count.bump();
        cache.strm = cache.strm.wrapping_sub(1);
        Self::check_owner(stream, &cache)?;
        if cache.strm != 0 || cache.run != 0 || cache.lumi != 0 {
            return Err(out_of_sequence("end_stream out of sequence", stream));
        }
        Ok(())
    }

    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        self.count.expect(self.transitions)?;

        let begins = self.stream_begin_lumis.load(Ordering::SeqCst);
        let ends = self.stream_end_lumis.load(Ordering::SeqCst);
        let streams = self.streams.load(Ordering::SeqCst);
        expect_stream_range("stream begin lumi transitions", begins, self.n_lumis, streams)?;
        if ends != begins {
            return Err(ContractViolation::count(format!(
                "stream end lumi transitions {} does not equal stream begin lumi transitions {}",
                ends, begins
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::TransitionCounts;
    use crate::error::ViolationKind;

    fn end_job_ctx() -> EndJobContext {
        EndJobContext {
            counts: TransitionCounts::default(),
            input_cache_size: 0,
            streams: 1,
        }
    }

    #[test]
    fn test_end_stream_detects_open_run() {
        let filter = StreamIntFilter::new("s", 2, 1);
        let mut cache = filter.begin_stream(StreamId(0)).unwrap();
        cache.run = 1;
        let err = filter.end_stream(StreamId(0), cache).unwrap_err();
        assert!(err.is_violation(ViolationKind::Ordering));
        assert_eq!(err.violation().unwrap().stream, Some(StreamId(0)));
    }

    #[test]
    fn test_foreign_cache_rejected() {
        let filter = StreamIntFilter::new("s", 2, 1);
        let cache = filter.begin_stream(StreamId(1)).unwrap();
        let err = filter.end_stream(StreamId(2), cache).unwrap_err();
        assert!(err.to_string().contains("cache value 1 but it was supposed to be stream 2"));
    }

    #[test]
    fn test_end_job_checks_lumi_range() {
        let filter = StreamIntFilter::new("s", 0, 2);
        filter.streams.store(3, Ordering::SeqCst);
        filter.stream_begin_lumis.store(1, Ordering::SeqCst);
        filter.stream_end_lumis.store(1, Ordering::SeqCst);
        let err = filter.end_job(&end_job_ctx()).unwrap_err();
        assert!(err.to_string().contains("between 2 and 6"));

        filter.stream_begin_lumis.store(4, Ordering::SeqCst);
        filter.stream_end_lumis.store(3, Ordering::SeqCst);
        assert!(filter.end_job(&end_job_ctx()).is_err());

        filter.stream_end_lumis.store(4, Ordering::SeqCst);
        filter.end_job(&end_job_ctx()).unwrap();
    }
}
