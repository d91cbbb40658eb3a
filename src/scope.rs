//! Scope hierarchy: Process → Run → LuminosityBlock → Stream.
//!
//! The scheduler owns every `ScopeInstance` through a `ScopeHierarchy`.
//! Instances refer to their parent by id only, never by ownership.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ContractViolation, Result};

/// The four nesting levels, ordered from outermost to innermost
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Process,
    Run,
    #[serde(rename = "lumi")]
    LuminosityBlock,
    Stream,
}

impl ScopeKind {
    pub const ALL: [ScopeKind; 4] = [
        ScopeKind::Process,
        ScopeKind::Run,
        ScopeKind::LuminosityBlock,
        ScopeKind::Stream,
    ];

    /// Nesting depth, 0 for Process
    pub fn depth(self) -> usize {
        match self {
            ScopeKind::Process => 0,
            ScopeKind::Run => 1,
            ScopeKind::LuminosityBlock => 2,
            ScopeKind::Stream => 3,
        }
    }

    /// The enclosing scope kind (None for Process)
    pub fn parent(self) -> Option<ScopeKind> {
        match self {
            ScopeKind::Process => None,
            ScopeKind::Run => Some(ScopeKind::Process),
            ScopeKind::LuminosityBlock => Some(ScopeKind::Run),
            ScopeKind::Stream => Some(ScopeKind::LuminosityBlock),
        }
    }

    /// Whether a cache of this scope is shared between streams
    pub fn is_shared(self) -> bool {
        !matches!(self, ScopeKind::Stream)
    }

    pub fn label(self) -> &'static str {
        match self {
            ScopeKind::Process => "process",
            ScopeKind::Run => "run",
            ScopeKind::LuminosityBlock => "lumi",
            ScopeKind::Stream => "stream",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identifier of one scope instance, unique within a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub u64);

/// Index of a stream worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub usize);

impl StreamId {
    pub fn value(self) -> usize {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {}", self.0)
    }
}

/// One concrete occurrence of a scope kind ("run 7", "lumi 7:3")
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeInstance {
    pub id: ScopeId,
    pub kind: ScopeKind,
    /// Run number for runs, lumi number for lumis, 0 for the process
    pub number: u32,
    /// Enclosing run number for lumis
    pub run: u32,
    /// Monotonic sequence within the parent, starting at 0
    pub sequence: u64,
    pub parent: Option<ScopeId>,
}

impl fmt::Display for ScopeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScopeKind::Process => write!(f, "process"),
            ScopeKind::Run => write!(f, "run {}", self.number),
            ScopeKind::LuminosityBlock => write!(f, "lumi {}:{}", self.run, self.number),
            ScopeKind::Stream => write!(f, "stream scope {}", self.number),
        }
    }
}

/// Lifecycle of a scope instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeState {
    Uninitialized,
    Begun,
    AllStreamsEnded,
    Ended,
    Destroyed,
}

impl ScopeState {
    /// The only state that may follow this one
    pub fn successor(self) -> Option<ScopeState> {
        match self {
            ScopeState::Uninitialized => Some(ScopeState::Begun),
            ScopeState::Begun => Some(ScopeState::AllStreamsEnded),
            ScopeState::AllStreamsEnded => Some(ScopeState::Ended),
            ScopeState::Ended => Some(ScopeState::Destroyed),
            ScopeState::Destroyed => None,
        }
    }
}

/// Per-stream sub-state inside one scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Entering,
    Working,
    Exited,
}

#[derive(Debug)]
struct ScopeRecord {
    instance: ScopeInstance,
    state: ScopeState,
    entered: BTreeSet<StreamId>,
    exited: BTreeSet<StreamId>,
}

/// Registry of live scope instances, owned by the scheduler.
///
/// Enforces the scope state machine: a child can only open under a Begun
/// parent, streams only enter Begun scopes, and a scope only ends once every
/// stream that entered it has exited.
#[derive(Debug, Default)]
pub struct ScopeHierarchy {
    next_id: u64,
    records: HashMap<ScopeId, ScopeRecord>,
    sequences: HashMap<(Option<ScopeId>, ScopeKind), u64>,
    retired: u64,
}

impl ScopeHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new Uninitialized instance under `parent`
    pub fn open(&mut self, kind: ScopeKind, number: u32, parent: Option<ScopeId>) -> Result<ScopeInstance> {
        let run = match parent {
            Some(parent_id) => {
                let parent_record = self.record(parent_id)?;
                if Some(parent_record.instance.kind) != kind.parent() {
                    return Err(ContractViolation::ordering(format!(
                        "{} cannot nest inside {}",
                        kind, parent_record.instance.kind
                    ))
                    .into());
                }
                if parent_record.state != ScopeState::Begun {
                    return Err(ContractViolation::ordering(format!(
                        "{} opened while parent is {:?}",
                        kind, parent_record.state
                    ))
                    .in_scope(&parent_record.instance)
                    .into());
                }
                match parent_record.instance.kind {
                    ScopeKind::Run => parent_record.instance.number,
                    _ => number,
                }
            }
            None if kind == ScopeKind::Process => 0,
            None => {
                return Err(ContractViolation::ordering(format!("{} opened without a parent scope", kind)).into());
            }
        };

        let sequence = self.sequences.entry((parent, kind)).or_insert(0);
        let instance = ScopeInstance {
            id: ScopeId(self.next_id),
            kind,
            number,
            run,
            sequence: *sequence,
            parent,
        };
        *sequence += 1;
        self.next_id += 1;

        self.records.insert(
            instance.id,
            ScopeRecord {
                instance: instance.clone(),
                state: ScopeState::Uninitialized,
                entered: BTreeSet::new(),
                exited: BTreeSet::new(),
            },
        );
        Ok(instance)
    }

    /// Uninitialized → Begun. A second call is a double invocation.
    pub fn begin(&mut self, id: ScopeId) -> Result<()> {
        self.advance(id, ScopeState::Uninitialized, ScopeState::Begun)
    }

    /// Record `stream` entering a Begun scope. Entering twice is a no-op
    /// returning false.
    pub fn enter(&mut self, id: ScopeId, stream: StreamId) -> Result<bool> {
        let record = self.record_mut(id)?;
        if record.state != ScopeState::Begun {
            return Err(ContractViolation::ordering(format!("stream entered scope in state {:?}", record.state))
                .in_scope(&record.instance)
                .on_stream(stream)
                .into());
        }
        if record.exited.contains(&stream) {
            return Err(ContractViolation::ordering("stream re-entered a scope it already exited")
                .in_scope(&record.instance)
                .on_stream(stream)
                .into());
        }
        Ok(record.entered.insert(stream))
    }

    pub fn exit(&mut self, id: ScopeId, stream: StreamId) -> Result<()> {
        let record = self.record_mut(id)?;
        if !record.entered.contains(&stream) {
            return Err(ContractViolation::ordering("stream exited a scope it never entered")
                .in_scope(&record.instance)
                .on_stream(stream)
                .into());
        }
        if !record.exited.insert(stream) {
            return Err(ContractViolation::ordering("stream exited a scope twice")
                .in_scope(&record.instance)
                .on_stream(stream)
                .into());
        }
        Ok(())
    }

    /// Begun → AllStreamsEnded; requires every entered stream to have exited
    pub fn all_streams_ended(&mut self, id: ScopeId) -> Result<()> {
        let record = self.record(id)?;
        if record.entered != record.exited {
            let pending: Vec<String> = record
                .entered
                .difference(&record.exited)
                .map(|s| s.0.to_string())
                .collect();
            return Err(ContractViolation::ordering(format!(
                "end requested while streams [{}] are still working",
                pending.join(", ")
            ))
            .in_scope(&record.instance)
            .into());
        }
        self.advance(id, ScopeState::Begun, ScopeState::AllStreamsEnded)
    }

    /// AllStreamsEnded → Ended
    pub fn end(&mut self, id: ScopeId) -> Result<()> {
        self.advance(id, ScopeState::AllStreamsEnded, ScopeState::Ended)
    }

    /// Ended → Destroyed; the instance is retired and becomes unreachable.
    /// Children must be destroyed first.
    pub fn destroy(&mut self, id: ScopeId) -> Result<ScopeInstance> {
        if let Some(child) = self.records.values().find(|r| r.instance.parent == Some(id)) {
            return Err(ContractViolation::ordering(format!(
                "parent destroyed while child {} is {:?}",
                child.instance, child.state
            ))
            .in_scope(&self.record(id)?.instance)
            .into());
        }
        let record = self.record(id)?;
        if record.state != ScopeState::Ended {
            return Err(ContractViolation::ordering(format!("destroy requested in state {:?}", record.state))
                .in_scope(&record.instance)
                .into());
        }
        let record = self
            .records
            .remove(&id)
            .ok_or_else(|| ContractViolation::ordering(format!("unknown scope id {}", id.0)))?;
        self.retired += 1;
        Ok(record.instance)
    }

    pub fn state(&self, id: ScopeId) -> Option<ScopeState> {
        self.records.get(&id).map(|r| r.state)
    }

    pub fn instance(&self, id: ScopeId) -> Option<&ScopeInstance> {
        self.records.get(&id).map(|r| &r.instance)
    }

    /// Streams that entered the scope, in slot order
    pub fn entered(&self, id: ScopeId) -> Vec<StreamId> {
        self.records
            .get(&id)
            .map(|r| r.entered.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_entered(&self, id: ScopeId, stream: StreamId) -> bool {
        self.records.get(&id).is_some_and(|r| r.entered.contains(&stream))
    }

    /// Number of instances not yet destroyed
    pub fn live_count(&self) -> usize {
        self.records.len()
    }

    pub fn retired_count(&self) -> u64 {
        self.retired
    }

    fn advance(&mut self, id: ScopeId, from: ScopeState, to: ScopeState) -> Result<()> {
        let record = self.record_mut(id)?;
        if record.state != from || from.successor() != Some(to) {
            return Err(ContractViolation::ordering(format!(
                "transition to {:?} attempted from {:?}",
                to, record.state
            ))
            .in_scope(&record.instance)
            .into());
        }
        record.state = to;
        Ok(())
    }

    fn record(&self, id: ScopeId) -> Result<&ScopeRecord> {
        self.records
            .get(&id)
            .ok_or_else(|| ContractViolation::ordering(format!("unknown scope id {}", id.0)).into())
    }

    fn record_mut(&mut self, id: ScopeId) -> Result<&mut ScopeRecord> {
        self.records
            .get_mut(&id)
            .ok_or_else(|| ContractViolation::ordering(format!("unknown scope id {}", id.0)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViolationKind;

    fn begun_process(h: &mut ScopeHierarchy) -> ScopeInstance {
        let p = h.open(ScopeKind::Process, 0, None).unwrap();
        h.begin(p.id).unwrap();
        p
    }

    #[test]
    fn test_kind_ordering_and_parents() {
        assert!(ScopeKind::Process < ScopeKind::Run);
        assert!(ScopeKind::LuminosityBlock < ScopeKind::Stream);
        assert_eq!(ScopeKind::LuminosityBlock.parent(), Some(ScopeKind::Run));
        assert_eq!(ScopeKind::Process.parent(), None);
        assert!(!ScopeKind::Stream.is_shared());
        assert_eq!(ScopeKind::Stream.depth(), 3);
    }

    #[test]
    fn test_full_lifecycle() {
        let mut h = ScopeHierarchy::new();
        let p = begun_process(&mut h);
        let run = h.open(ScopeKind::Run, 7, Some(p.id)).unwrap();
        assert_eq!(h.state(run.id), Some(ScopeState::Uninitialized));

        h.begin(run.id).unwrap();
        assert!(h.enter(run.id, StreamId(0)).unwrap());
        assert!(!h.enter(run.id, StreamId(0)).unwrap());
        h.enter(run.id, StreamId(1)).unwrap();
        h.exit(run.id, StreamId(0)).unwrap();
        h.exit(run.id, StreamId(1)).unwrap();
        h.all_streams_ended(run.id).unwrap();
        h.end(run.id).unwrap();
        let retired = h.destroy(run.id).unwrap();

        assert_eq!(retired.number, 7);
        assert_eq!(h.state(run.id), None);
        assert_eq!(h.retired_count(), 1);
    }

    #[test]
    fn test_double_begin_is_ordering_violation() {
        let mut h = ScopeHierarchy::new();
        let p = begun_process(&mut h);
        let run = h.open(ScopeKind::Run, 1, Some(p.id)).unwrap();
        h.begin(run.id).unwrap();
        let err = h.begin(run.id).unwrap_err();
        assert!(err.is_violation(ViolationKind::Ordering));
    }

    #[test]
    fn test_enter_before_begin_rejected() {
        let mut h = ScopeHierarchy::new();
        let p = begun_process(&mut h);
        let run = h.open(ScopeKind::Run, 1, Some(p.id)).unwrap();
        let err = h.enter(run.id, StreamId(0)).unwrap_err();
        let v = err.violation().unwrap();
        assert_eq!(v.stream, Some(StreamId(0)));
        assert_eq!(v.scope.as_deref(), Some("run 1"));
    }

    #[test]
    fn test_end_blocked_until_all_streams_exit() {
        let mut h = ScopeHierarchy::new();
        let p = begun_process(&mut h);
        let run = h.open(ScopeKind::Run, 1, Some(p.id)).unwrap();
        h.begin(run.id).unwrap();
        h.enter(run.id, StreamId(0)).unwrap();
        h.enter(run.id, StreamId(2)).unwrap();
        h.exit(run.id, StreamId(0)).unwrap();

        let err = h.all_streams_ended(run.id).unwrap_err();
        assert!(err.to_string().contains("[2]"));

        h.exit(run.id, StreamId(2)).unwrap();
        h.all_streams_ended(run.id).unwrap();
    }

    #[test]
    fn test_end_before_barrier_rejected() {
        let mut h = ScopeHierarchy::new();
        let p = begun_process(&mut h);
        let run = h.open(ScopeKind::Run, 1, Some(p.id)).unwrap();
        h.begin(run.id).unwrap();
        assert!(h.end(run.id).is_err());
    }

    #[test]
    fn test_lumi_requires_begun_run() {
        let mut h = ScopeHierarchy::new();
        let p = begun_process(&mut h);
        let run = h.open(ScopeKind::Run, 3, Some(p.id)).unwrap();
        assert!(h.open(ScopeKind::LuminosityBlock, 1, Some(run.id)).is_err());

        h.begin(run.id).unwrap();
        let lumi = h.open(ScopeKind::LuminosityBlock, 1, Some(run.id)).unwrap();
        assert_eq!(lumi.run, 3);
        assert_eq!(lumi.to_string(), "lumi 3:1");
    }

    #[test]
    fn test_wrong_nesting_rejected() {
        let mut h = ScopeHierarchy::new();
        let p = begun_process(&mut h);
        assert!(h.open(ScopeKind::LuminosityBlock, 1, Some(p.id)).is_err());
        assert!(h.open(ScopeKind::Run, 1, None).is_err());
    }

    #[test]
    fn test_sequence_monotonic_within_parent() {
        let mut h = ScopeHierarchy::new();
        let p = begun_process(&mut h);
        let a = h.open(ScopeKind::Run, 10, Some(p.id)).unwrap();
        let b = h.open(ScopeKind::Run, 4, Some(p.id)).unwrap();
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert!(b.id > a.id);
    }

    #[test]
    fn test_parent_destroy_waits_for_children() {
        let mut h = ScopeHierarchy::new();
        let p = begun_process(&mut h);
        let run = h.open(ScopeKind::Run, 1, Some(p.id)).unwrap();
        h.all_streams_ended(p.id).unwrap();
        h.end(p.id).unwrap();
        assert!(h.destroy(p.id).is_err());
        assert_eq!(h.live_count(), 2);
        let _ = run;
    }
}
