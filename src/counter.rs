//! Atomic transition counters.
//!
//! Totals are kept per (ScopeKind, Transition); a second table keeps
//! per-instance counts so once-only hooks can be verified for every scope.
//! Counters only ever go up and are only reachable through `record`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{ContractViolation, Result};
use crate::scope::{ScopeId, ScopeInstance, ScopeKind};

/// Kind of transition issued by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    BeginJob,
    /// Global begin (cache creation); for Stream scope, begin_stream
    Begin,
    BeginSummary,
    BeginProduce,
    /// A stream entering a shared scope
    StreamBegin,
    /// Per-event work on a stream
    Work,
    /// A stream exiting a shared scope
    StreamEnd,
    StreamEndSummary,
    EndSummary,
    EndProduce,
    /// Global end; for Stream scope, end_stream
    End,
    /// An upstream process block handed to modules
    AccessInput,
    FillInputCache,
    EndJob,
}

impl Transition {
    pub const ALL: [Transition; 14] = [
        Transition::BeginJob,
        Transition::Begin,
        Transition::BeginSummary,
        Transition::BeginProduce,
        Transition::StreamBegin,
        Transition::Work,
        Transition::StreamEnd,
        Transition::StreamEndSummary,
        Transition::EndSummary,
        Transition::EndProduce,
        Transition::End,
        Transition::AccessInput,
        Transition::FillInputCache,
        Transition::EndJob,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Transition::BeginJob => "begin_job",
            Transition::Begin => "begin",
            Transition::BeginSummary => "begin_summary",
            Transition::BeginProduce => "begin_produce",
            Transition::StreamBegin => "stream_begin",
            Transition::Work => "work",
            Transition::StreamEnd => "stream_end",
            Transition::StreamEndSummary => "stream_end_summary",
            Transition::EndSummary => "end_summary",
            Transition::EndProduce => "end_produce",
            Transition::End => "end",
            Transition::AccessInput => "access_input",
            Transition::FillInputCache => "fill_input_cache",
            Transition::EndJob => "end_job",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

const SLOTS: usize = ScopeKind::ALL.len() * Transition::ALL.len();

fn slot(kind: ScopeKind, transition: Transition) -> usize {
    kind.depth() * Transition::ALL.len() + transition.index()
}

/// Invariant-tracking counters owned by the scheduler
pub struct TransitionCounter {
    totals: [AtomicU64; SLOTS],
    per_instance: Mutex<HashMap<(ScopeId, Transition), u64>>,
}

impl Default for TransitionCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionCounter {
    pub fn new() -> Self {
        Self {
            totals: std::array::from_fn(|_| AtomicU64::new(0)),
            per_instance: Mutex::new(HashMap::new()),
        }
    }

    /// Count a transition that is not tied to a shared scope instance
    pub fn record(&self, kind: ScopeKind, transition: Transition) -> u64 {
        self.totals[slot(kind, transition)].fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count a transition of a specific scope instance, returning the
    /// instance count after the increment
    pub fn record_instance(&self, scope: &ScopeInstance, transition: Transition) -> u64 {
        self.record(scope.kind, transition);
        let mut table = match self.per_instance.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = table.entry((scope.id, transition)).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Record a once-only transition; a second invocation is an ordering violation
    pub fn record_once(&self, scope: &ScopeInstance, transition: Transition) -> Result<()> {
        let n = self.record_instance(scope, transition);
        if n > 1 {
            return Err(ContractViolation::ordering(format!("{} {} invoked {} times", scope.kind, transition, n))
                .in_scope(scope)
                .into());
        }
        Ok(())
    }

    pub fn get(&self, kind: ScopeKind, transition: Transition) -> u64 {
        self.totals[slot(kind, transition)].load(Ordering::SeqCst)
    }

    pub fn get_instance(&self, id: ScopeId, transition: Transition) -> u64 {
        match self.per_instance.lock() {
            Ok(table) => table.get(&(id, transition)).copied().unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(&(id, transition)).copied().unwrap_or(0),
        }
    }

    /// Every Begin of the instance must be matched by exactly one End
    pub fn check_balanced(&self, scope: &ScopeInstance) -> Result<()> {
        let begins = self.get_instance(scope.id, Transition::Begin);
        let ends = self.get_instance(scope.id, Transition::End);
        if begins != 1 || ends != 1 {
            return Err(ContractViolation::count(format!(
                "{} begin invoked {} times and end {} times, expected exactly once each",
                scope.kind, begins, ends
            ))
            .in_scope(scope)
            .into());
        }
        Ok(())
    }

    /// Drop the per-instance entries of a destroyed scope; totals are kept
    pub fn forget(&self, id: ScopeId) -> usize {
        let mut table = match self.per_instance.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = table.len();
        table.retain(|(scope, _), _| *scope != id);
        before - table.len()
    }

    /// Scope instances with per-instance entries still held
    pub fn tracked_instances(&self) -> usize {
        let table = match self.per_instance.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut ids: Vec<ScopeId> = table.keys().map(|(id, _)| *id).collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    pub fn snapshot(&self) -> TransitionCounts {
        let mut counts = BTreeMap::new();
        for kind in ScopeKind::ALL {
            for transition in Transition::ALL {
                let n = self.get(kind, transition);
                if n > 0 {
                    counts.insert((kind, transition), n);
                }
            }
        }
        TransitionCounts { counts }
    }
}

/// Frozen copy of the transition totals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionCounts {
    counts: BTreeMap<(ScopeKind, Transition), u64>,
}

impl TransitionCounts {
    pub fn get(&self, kind: ScopeKind, transition: Transition) -> u64 {
        self.counts.get(&(kind, transition)).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ScopeKind, Transition, u64)> + '_ {
        self.counts.iter().map(|(&(k, t), &n)| (k, t, n))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl Serialize for TransitionCounts {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let flat: BTreeMap<String, u64> = self.iter().map(|(k, t, n)| (format!("{}.{}", k, t), n)).collect();
        flat.serialize(serializer)
    }
}
