//! Filter fed by input caches filled from upstream process blocks.
//!
//! Two caches are filled per upstream block: the sum of its begin and end
//! artifacts, and a running total carried over from the previous block.
//! Events compare the current set against the values the job expects.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{ContractViolation, Result};
use crate::input_cache::InputCacheRegistry;
use crate::module::{Abilities, Ability, EndJobContext, Event, LimitedModule, StreamContext};
use crate::process_block::ProcessBlock;

/// Artifact keys and stage names read from upstream process blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputKeys {
    pub begin: String,
    pub end: String,
    pub begin_merge: String,
    pub end_merge: String,
    pub stage: String,
    pub merge_stage: String,
}

impl Default for InputKeys {
    fn default() -> Self {
        Self {
            begin: "begin".to_string(),
            end: "end".to_string(),
            begin_merge: "beginM".to_string(),
            end_merge: "endM".to_string(),
            stage: "PROD1".to_string(),
            merge_stage: "MERGE".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryInputCache {
    pub value: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecondaryInputCache {
    pub value: i64,
}

fn block_sum(block: &ProcessBlock<'_>, begin: &str, end: &str) -> Result<i64> {
    Ok(*block.get::<i64>(begin)? + *block.get::<i64>(end)?)
}

/// Fills three typed caches from each upstream process block and checks the
/// values events see against the expected value of their run.
pub struct InputProcessBlockIntFilter {
    label: String,
    transitions: u32,
    expected_by_run: Vec<i64>,
    expected_sum: i64,
    keys: InputKeys,
    /// Shared with the fillers, which outlive any borrow of the filter
    seen: Arc<AtomicU32>,
    sum: AtomicI64,
}

impl InputProcessBlockIntFilter {
    pub fn new(label: impl Into<String>, transitions: u32, expected_by_run: Vec<i64>, expected_sum: i64) -> Self {
        Self {
            label: label.into(),
            transitions,
            expected_by_run,
            expected_sum,
            keys: InputKeys::default(),
            seen: Arc::new(AtomicU32::new(0)),
            sum: AtomicI64::new(0),
        }
    }

    pub fn with_keys(mut self, keys: InputKeys) -> Self {
        self.keys = keys;
        self
    }

    fn check_cache(&self, which: &str, value: i64, expected: i64) -> Result<()> {
        if value != expected {
            return Err(ContractViolation::expected(format!("{} cached value was", which), value, expected).into());
        }
        Ok(())
    }
}

impl LimitedModule for InputProcessBlockIntFilter {
    type StreamCache = ();
    type RunCache = ();
    type LumiCache = ();
    type RunSummary = ();
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none().with(Ability::InputProcessBlockCache)
    }

    fn register_input_caches(&self, registry: &mut InputCacheRegistry) -> Result<()> {
        let (begin, end) = (self.keys.begin.clone(), self.keys.end.clone());

        let seen = Arc::clone(&self.seen);
        let (b, e) = (begin.clone(), end.clone());
        registry.register_filler::<i64, _>("int", &begin, move |block, _previous| {
            seen.fetch_add(1, Ordering::SeqCst);
            block_sum(block, &b, &e)
        })?;

        let seen = Arc::clone(&self.seen);
        let (b, e) = (begin.clone(), end.clone());
        registry.register_filler::<PrimaryInputCache, _>("cache", &begin, move |block, _previous| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(PrimaryInputCache {
                value: block_sum(block, &b, &e)?,
            })
        })?;

        let seen = Arc::clone(&self.seen);
        let (b, e) = (begin.clone(), end);
        registry.register_filler::<SecondaryInputCache, _>("cache1", &begin, move |block, _previous| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(SecondaryInputCache {
                value: block_sum(block, &b, &e)?,
            })
        })
    }

    fn access_input_process_block(&self, block: &ProcessBlock<'_>) -> Result<()> {
        let stage = block.process_name();
        if stage == self.keys.stage {
            self.sum
                .fetch_add(block_sum(block, &self.keys.begin, &self.keys.end)?, Ordering::SeqCst);
        }
        if stage == self.keys.merge_stage {
            self.sum.fetch_add(
                block_sum(block, &self.keys.begin_merge, &self.keys.end_merge)?,
                Ordering::SeqCst,
            );
        }
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn filter(&self, ctx: &StreamContext<'_, Self>, _cache: &mut (), event: &Event) -> Result<bool> {
        if !self.expected_by_run.is_empty() {
            let expected = event
                .run
                .checked_sub(1)
                .and_then(|i| self.expected_by_run.get(i as usize))
                .copied()
                .ok_or_else(|| {
                    ContractViolation::count(format!("no expected cache value for run {}", event.run))
                        .on_stream(ctx.stream())
                })?;
            let caches = ctx.input_caches()?;
            self.check_cache("first", *caches.get::<i64>("int")?, expected)?;
            self.check_cache("second", caches.get::<PrimaryInputCache>("cache")?.value, expected)?;
            self.check_cache("third", caches.get::<SecondaryInputCache>("cache1")?.value, expected)?;
        }
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn end_job(&self, ctx: &EndJobContext) -> Result<()> {
        let seen = self.seen.load(Ordering::SeqCst);
        if seen != self.transitions {
            return Err(ContractViolation::expected("transitions", seen, self.transitions).into());
        }
        let sum = self.sum.load(Ordering::SeqCst);
        if sum != self.expected_sum {
            return Err(ContractViolation::expected("sum", sum, self.expected_sum).into());
        }
        if ctx.input_cache_size > 0 {
            return Err(ContractViolation::leak(format!(
                "cache size not zero at end_job {}",
                ctx.input_cache_size
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_cache::InputCachePool;
    use crate::process_block::ProcessBlockStore;
    use std::collections::BTreeMap;

    fn store_with(stage: &str, artifacts: &[(&str, i64)]) -> ProcessBlockStore {
        let mut store = ProcessBlockStore::new("TEST");
        let artifacts: BTreeMap<String, i64> = artifacts.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        store.add_input_stage(stage, &artifacts).unwrap();
        store
    }

    #[test]
    fn test_fillers_sum_begin_and_end() {
        let filter = InputProcessBlockIntFilter::new("i", 4, vec![72], 72);
        let mut registry = InputCacheRegistry::new();
        filter.register_input_caches(&mut registry).unwrap();
        assert_eq!(registry.names(), vec!["int", "cache", "cache1"]);

        let pool = InputCachePool::new(registry);
        let store = store_with("PROD1", &[("begin", 31), ("end", 41)]);
        let outcome = pool.fill(&store.view("PROD1")).unwrap();
        assert_eq!(outcome.filled, 3);

        let caches = pool.current().unwrap();
        assert_eq!(*caches.get::<i64>("int").unwrap(), 72);
        assert_eq!(caches.get::<SecondaryInputCache>("cache1").unwrap().value, 72);
        drop(caches);

        filter.access_input_process_block(&store.view("PROD1")).unwrap();
        assert_eq!(filter.sum.load(Ordering::SeqCst), 72);
        assert_eq!(filter.seen.load(Ordering::SeqCst), 4);
        assert_eq!(pool.retire().unwrap(), 1);
    }

    #[test]
    fn test_merge_stage_uses_merge_keys() {
        let filter = InputProcessBlockIntFilter::new("i", 1, Vec::new(), 10);
        let store = store_with("MERGE", &[("beginM", 4), ("endM", 6)]);
        filter.access_input_process_block(&store.view("MERGE")).unwrap();
        assert_eq!(filter.sum.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_end_job_reports_leftover_caches() {
        let filter = InputProcessBlockIntFilter::new("i", 0, Vec::new(), 0);
        let ctx = EndJobContext {
            counts: Default::default(),
            input_cache_size: 2,
            streams: 1,
        };
        let err = filter.end_job(&ctx).unwrap_err();
        assert!(err.is_violation(crate::error::ViolationKind::Leak));
    }
}
