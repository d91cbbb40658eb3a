//! Built-in validating filters.
//!
//! Each filter exercises one family of transitions and checks the order and
//! number of hook calls it observes. Totals are checked in `end_job`; any
//! mismatch fails the job with a contract violation.

mod input;
mod lumi;
mod process_block;
mod run;
mod stream;
mod summary;

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{ContractViolation, Result, SchedulerError};
use crate::scheduler::TransitionScheduler;
use crate::scope::StreamId;

pub use input::{InputKeys, InputProcessBlockIntFilter, PrimaryInputCache, SecondaryInputCache};
pub use lumi::{BeginLumiFilter, EndLumiFilter, LumiIntFilter};
pub use process_block::{BEGIN_VALUE, BeginProcessBlockFilter, END_VALUE, EndProcessBlockFilter, ProcessBlockIntFilter};
pub use run::{BeginRunFilter, EndRunFilter, RunIntFilter};
pub use stream::StreamIntFilter;
pub use summary::{LumiSummaryIntFilter, RunSummaryIntFilter};

/// Bookkeeping owned by a single stream slot, or folded into a summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamTally {
    pub value: u32,
    pub run: u32,
    pub lumi: u32,
    pub strm: u32,
    pub work: u32,
}

/// Bookkeeping shared by every stream inside a run or lumi
#[derive(Debug, Default)]
pub struct SharedTally {
    pub value: AtomicU32,
    pub run: AtomicU32,
    pub lumi: AtomicU32,
}

/// Hook calls seen by one filter
#[derive(Debug, Default)]
pub(crate) struct HookCount(AtomicU32);

impl HookCount {
    pub(crate) fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Count violation unless exactly `expected` hooks were seen
    pub(crate) fn expect(&self, expected: u32) -> Result<()> {
        let seen = self.get();
        if seen != expected {
            return Err(ContractViolation::expected("transitions", seen, expected).into());
        }
        Ok(())
    }
}

pub(crate) fn out_of_sequence(message: impl Into<String>, stream: StreamId) -> SchedulerError {
    ContractViolation::ordering(message).on_stream(stream).into()
}

/// Check that `seen` lies in `[per_scope, per_scope * streams]`
pub(crate) fn expect_stream_range(what: &str, seen: u32, per_scope: u32, streams: u32) -> Result<()> {
    let max = per_scope * streams;
    if seen < per_scope || seen > max {
        return Err(ContractViolation::count(format!(
            "{} {} but it was supposed to be between {} and {}",
            what, seen, per_scope, max
        ))
        .into());
    }
    Ok(())
}

fn default_n_lumis() -> u32 {
    1
}

/// One module entry of a job file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub label: String,
    /// At most this many `filter` calls of the module run at once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<usize>,
    #[serde(flatten)]
    pub filter: FilterSpec,
}

/// Built-in filter and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterSpec {
    StreamInt {
        transitions: u32,
        #[serde(default = "default_n_lumis")]
        n_lumis: u32,
    },
    RunInt {
        transitions: u32,
        cachevalue: u32,
    },
    LumiInt {
        transitions: u32,
        cachevalue: u32,
    },
    RunSummaryInt {
        transitions: u32,
        cachevalue: u32,
    },
    LumiSummaryInt {
        transitions: u32,
        cachevalue: u32,
    },
    ProcessBlockInt {
        transitions: u32,
        #[serde(default)]
        consumes_begin_process_block: Option<String>,
        #[serde(default)]
        consumes_end_process_block: Option<String>,
    },
    BeginProcessBlock {
        transitions: u32,
        #[serde(default)]
        consumes_begin_process_block: Option<String>,
    },
    EndProcessBlock {
        transitions: u32,
        #[serde(default)]
        consumes_end_process_block: Option<String>,
    },
    BeginRun {
        transitions: u32,
    },
    EndRun {
        transitions: u32,
    },
    BeginLumi {
        transitions: u32,
    },
    EndLumi {
        transitions: u32,
    },
    InputProcessBlockInt {
        transitions: u32,
        #[serde(default)]
        expected_by_run: Vec<i64>,
        #[serde(default)]
        expected_sum: i64,
        #[serde(default)]
        keys: InputKeys,
    },
}

impl FilterSpec {
    /// Type tag as written in job files
    pub fn kind(&self) -> &'static str {
        match self {
            FilterSpec::StreamInt { .. } => "stream_int",
            FilterSpec::RunInt { .. } => "run_int",
            FilterSpec::LumiInt { .. } => "lumi_int",
            FilterSpec::RunSummaryInt { .. } => "run_summary_int",
            FilterSpec::LumiSummaryInt { .. } => "lumi_summary_int",
            FilterSpec::ProcessBlockInt { .. } => "process_block_int",
            FilterSpec::BeginProcessBlock { .. } => "begin_process_block",
            FilterSpec::EndProcessBlock { .. } => "end_process_block",
            FilterSpec::BeginRun { .. } => "begin_run",
            FilterSpec::EndRun { .. } => "end_run",
            FilterSpec::BeginLumi { .. } => "begin_lumi",
            FilterSpec::EndLumi { .. } => "end_lumi",
            FilterSpec::InputProcessBlockInt { .. } => "input_process_block_int",
        }
    }
}

impl ModuleSpec {
    /// Build the filter and register it with `scheduler`
    pub fn register(&self, scheduler: &mut TransitionScheduler) -> Result<()> {
        let label = self.label.clone();
        let limit = self.concurrency_limit;
        match &self.filter {
            FilterSpec::StreamInt { transitions, n_lumis } => {
                scheduler.add_module_with_limit(StreamIntFilter::new(label, *transitions, *n_lumis), limit)
            }
            FilterSpec::RunInt { transitions, cachevalue } => {
                scheduler.add_module_with_limit(RunIntFilter::new(label, *transitions, *cachevalue), limit)
            }
            FilterSpec::LumiInt { transitions, cachevalue } => {
                scheduler.add_module_with_limit(LumiIntFilter::new(label, *transitions, *cachevalue), limit)
            }
            FilterSpec::RunSummaryInt { transitions, cachevalue } => {
                scheduler.add_module_with_limit(RunSummaryIntFilter::new(label, *transitions, *cachevalue), limit)
            }
            FilterSpec::LumiSummaryInt { transitions, cachevalue } => {
                scheduler.add_module_with_limit(LumiSummaryIntFilter::new(label, *transitions, *cachevalue), limit)
            }
            FilterSpec::ProcessBlockInt {
                transitions,
                consumes_begin_process_block,
                consumes_end_process_block,
            } => scheduler.add_module_with_limit(
                ProcessBlockIntFilter::new(label, *transitions)
                    .consumes_begin(consumes_begin_process_block.clone())
                    .consumes_end(consumes_end_process_block.clone()),
                limit,
            ),
            FilterSpec::BeginProcessBlock {
                transitions,
                consumes_begin_process_block,
            } => scheduler.add_module_with_limit(
                BeginProcessBlockFilter::new(label, *transitions).consumes(consumes_begin_process_block.clone()),
                limit,
            ),
            FilterSpec::EndProcessBlock {
                transitions,
                consumes_end_process_block,
            } => scheduler.add_module_with_limit(
                EndProcessBlockFilter::new(label, *transitions).consumes(consumes_end_process_block.clone()),
                limit,
            ),
            FilterSpec::BeginRun { transitions } => {
                scheduler.add_module_with_limit(BeginRunFilter::new(label, *transitions), limit)
            }
            FilterSpec::EndRun { transitions } => {
                scheduler.add_module_with_limit(EndRunFilter::new(label, *transitions), limit)
            }
            FilterSpec::BeginLumi { transitions } => {
                scheduler.add_module_with_limit(BeginLumiFilter::new(label, *transitions), limit)
            }
            FilterSpec::EndLumi { transitions } => {
                scheduler.add_module_with_limit(EndLumiFilter::new(label, *transitions), limit)
            }
            FilterSpec::InputProcessBlockInt {
                transitions,
                expected_by_run,
                expected_sum,
                keys,
            } => scheduler.add_module_with_limit(
                InputProcessBlockIntFilter::new(label, *transitions, expected_by_run.clone(), *expected_sum)
                    .with_keys(keys.clone()),
                limit,
            ),
        }
    }
}
