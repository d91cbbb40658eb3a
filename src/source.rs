//! Job input description.
//!
//! A job reads a sequence of input files. Each file carries the process
//! blocks written by upstream stages and the runs it contains; runs are
//! split into luminosity blocks holding a number of events.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::module::Event;

/// Everything the scheduler reads in one job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobInput {
    pub files: Vec<InputFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputFile {
    /// Upstream process blocks, in arrival order
    pub process_blocks: Vec<InputProcessBlock>,
    pub runs: Vec<RunInput>,
}

/// Artifacts written by one upstream stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputProcessBlock {
    pub stage: String,
    #[serde(default)]
    pub artifacts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    pub run: u32,
    #[serde(default)]
    pub lumis: Vec<LumiInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LumiInput {
    pub lumi: u32,
    #[serde(default)]
    pub events: u64,
}

impl LumiInput {
    /// Events of this lumi, numbered from `first`
    pub fn events(&self, run: u32, first: u64) -> impl Iterator<Item = Event> + '_ {
        let lumi = self.lumi;
        (0..self.events).map(move |i| Event {
            run,
            lumi,
            event: first + i,
        })
    }
}

/// Totals over a whole job input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InputTotals {
    pub files: usize,
    pub process_blocks: usize,
    pub runs: u64,
    pub lumis: u64,
    /// Lumis with at least one event; only these are ever entered by a stream
    pub lumis_with_events: u64,
    pub events: u64,
}

impl JobInput {
    /// One file with `runs` runs numbered from 1, each holding
    /// `lumis_per_run` lumis of `events_per_lumi` events
    pub fn uniform(runs: u32, lumis_per_run: u32, events_per_lumi: u64) -> Self {
        let runs = (1..=runs)
            .map(|run| RunInput {
                run,
                lumis: (1..=lumis_per_run)
                    .map(|lumi| LumiInput {
                        lumi,
                        events: events_per_lumi,
                    })
                    .collect(),
            })
            .collect();
        Self {
            files: vec![InputFile {
                process_blocks: Vec::new(),
                runs,
            }],
        }
    }

    /// Attach an upstream process block to the first file
    pub fn with_process_block(mut self, stage: &str, artifacts: &[(&str, i64)]) -> Self {
        if self.files.is_empty() {
            self.files.push(InputFile::default());
        }
        self.files[0].process_blocks.push(InputProcessBlock {
            stage: stage.to_string(),
            artifacts: artifacts.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        });
        self
    }

    pub fn totals(&self) -> InputTotals {
        let mut totals = InputTotals {
            files: self.files.len(),
            ..Default::default()
        };
        for file in &self.files {
            totals.process_blocks += file.process_blocks.len();
            for run in &file.runs {
                totals.runs += 1;
                for lumi in &run.lumis {
                    totals.lumis += 1;
                    totals.events += lumi.events;
                    if lumi.events > 0 {
                        totals.lumis_with_events += 1;
                    }
                }
            }
        }
        totals
    }

    /// Reject inputs the scheduler cannot lay out as nested scopes
    pub fn validate(&self) -> Result<()> {
        for (index, file) in self.files.iter().enumerate() {
            for block in &file.process_blocks {
                if block.stage.trim().is_empty() {
                    return Err(SchedulerError::Input(format!(
                        "file {} has a process block without a stage name",
                        index
                    )));
                }
            }
            let mut runs = HashSet::new();
            for run in &file.runs {
                if run.run == 0 {
                    return Err(SchedulerError::Input(format!("file {} contains run number 0", index)));
                }
                if !runs.insert(run.run) {
                    return Err(SchedulerError::Input(format!("file {} lists run {} twice", index, run.run)));
                }
                let mut lumis = HashSet::new();
                for lumi in &run.lumis {
                    if lumi.lumi == 0 {
                        return Err(SchedulerError::Input(format!("run {} contains lumi number 0", run.run)));
                    }
                    if !lumis.insert(lumi.lumi) {
                        return Err(SchedulerError::Input(format!(
                            "run {} lists lumi {} twice",
                            run.run, lumi.lumi
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
