//! Process block producers and watchers.
//!
//! `BeginProcessBlockFilter` and `EndProcessBlockFilter` produce the
//! "begin" and "end" artifacts; `ProcessBlockIntFilter` reads them back in
//! the same transition.

use crate::error::{ContractViolation, Result};
use crate::filters::{HookCount, out_of_sequence};
use crate::module::{Abilities, Ability, EndJobContext, Event, LimitedModule, StreamContext};
use crate::process_block::ProcessBlock;

/// Value produced under "begin" at begin process block
pub const BEGIN_VALUE: u32 = 31;

/// Value produced under "end" at end process block
pub const END_VALUE: u32 = 41;

fn check_artifact(block: &ProcessBlock<'_>, key: Option<&str>, expected: u32) -> Result<()> {
    let Some(key) = key else {
        return Ok(());
    };
    let value = *block.get::<u32>(key)?;
    if value != expected {
        return Err(ContractViolation::count(format!("expected {} but got {}", expected, value))
            .in_scope(format!("process block {}", block.process_name()))
            .into());
    }
    Ok(())
}

/// Watches the current process block and reads what the producers put
/// into it.
pub struct ProcessBlockIntFilter {
    label: String,
    transitions: u32,
    count: HookCount,
    consumes_begin: Option<String>,
    consumes_end: Option<String>,
}

impl ProcessBlockIntFilter {
    pub fn new(label: impl Into<String>, transitions: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            count: HookCount::default(),
            consumes_begin: None,
            consumes_end: None,
        }
    }

    /// Read and check the begin artifact under `key`
    pub fn consumes_begin(mut self, key: Option<String>) -> Self {
        self.consumes_begin = key.filter(|k| !k.is_empty());
        self
    }

    /// Read and check the end artifact under `key` at end process block
    pub fn consumes_end(mut self, key: Option<String>) -> Self {
        self.consumes_end = key.filter(|k| !k.is_empty());
        self
    }
}

impl LimitedModule for ProcessBlockIntFilter {
    type StreamCache = ();
    type RunCache = ();
    type LumiCache = ();
    type RunSummary = ();
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none().with(Ability::WatchProcessBlock)
    }

    fn begin_process_block(&self, block: &ProcessBlock<'_>) -> Result<()> {
        let seen = self.count.get();
        if seen != 0 {
            return Err(ContractViolation::expected("begin transitions", seen, 0).into());
        }
        self.count.bump();
        check_artifact(block, self.consumes_begin.as_deref(), BEGIN_VALUE)
    }

    fn filter(&self, ctx: &StreamContext<'_, Self>, _cache: &mut (), _event: &Event) -> Result<bool> {
        let seen = self.count.get();
        if seen < 1 {
            return Err(out_of_sequence(
                format!("filter before begin_process_block {}", seen),
                ctx.stream(),
            ));
        }
        self.count.bump();
        Ok(true)
    }

    fn end_process_block(&self, block: &ProcessBlock<'_>) -> Result<()> {
        let seen = self.count.bump();
        if seen != self.transitions {
            return Err(ContractViolation::expected("end transitions", seen, self.transitions).into());
        }
        check_artifact(block, self.consumes_begin.as_deref(), BEGIN_VALUE)?;
        check_artifact(block, self.consumes_end.as_deref(), END_VALUE)
    }

    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        self.count.expect(self.transitions)
    }
}

/// Produces "begin" into the current process block before any event
pub struct BeginProcessBlockFilter {
    label: String,
    transitions: u32,
    count: HookCount,
    consumes: Option<String>,
}

impl BeginProcessBlockFilter {
    pub fn new(label: impl Into<String>, transitions: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            count: HookCount::default(),
            consumes: None,
        }
    }

    /// Read back the produced value under `key`
    pub fn consumes(mut self, key: Option<String>) -> Self {
        self.consumes = key.filter(|k| !k.is_empty());
        self
    }
}

impl LimitedModule for BeginProcessBlockFilter {
    type StreamCache = ();
    type RunCache = ();
    type LumiCache = ();
    type RunSummary = ();
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none().with(Ability::BeginProcessBlockProducer)
    }

    fn begin_process_block_produce(&self, block: &mut ProcessBlock<'_>) -> Result<()> {
        let seen = self.count.get();
        if seen != 0 {
            return Err(ContractViolation::expected("transitions", seen, 0).into());
        }
        self.count.bump();
        block.produce("begin", BEGIN_VALUE)?;
        check_artifact(block, self.consumes.as_deref(), BEGIN_VALUE)
    }

    fn filter(&self, ctx: &StreamContext<'_, Self>, _cache: &mut (), _event: &Event) -> Result<bool> {
        let seen = self.count.get();
        if seen < 1 {
            return Err(out_of_sequence(
                format!("filter before begin_process_block_produce {}", seen),
                ctx.stream(),
            ));
        }
        self.count.bump();
        Ok(true)
    }

    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        self.count.expect(self.transitions)
    }
}

/// Produces "end" into the current process block after every event
pub struct EndProcessBlockFilter {
    label: String,
    transitions: u32,
    count: HookCount,
    consumes: Option<String>,
}

impl EndProcessBlockFilter {
    pub fn new(label: impl Into<String>, transitions: u32) -> Self {
        Self {
            label: label.into(),
            transitions,
            count: HookCount::default(),
            consumes: None,
        }
    }

    /// Read back the produced value under `key`
    pub fn consumes(mut self, key: Option<String>) -> Self {
        self.consumes = key.filter(|k| !k.is_empty());
        self
    }
}

impl LimitedModule for EndProcessBlockFilter {
    type StreamCache = ();
    type RunCache = ();
    type LumiCache = ();
    type RunSummary = ();
    type LumiSummary = ();

    fn label(&self) -> &str {
        &self.label
    }

    fn abilities(&self) -> Abilities {
        Abilities::none().with(Ability::EndProcessBlockProducer)
    }

    fn filter(&self, _ctx: &StreamContext<'_, Self>, _cache: &mut (), _event: &Event) -> Result<bool> {
        self.count.bump();
        Ok(true)
    }

    fn end_process_block_produce(&self, block: &mut ProcessBlock<'_>) -> Result<()> {
        let seen = self.count.bump();
        if seen != self.transitions {
            return Err(ContractViolation::expected("transitions", seen, self.transitions).into());
        }
        block.produce("end", END_VALUE)?;
        check_artifact(block, self.consumes.as_deref(), END_VALUE)
    }

    fn end_job(&self, _ctx: &EndJobContext) -> Result<()> {
        self.count.expect(self.transitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViolationKind;
    use crate::process_block::ProcessBlockStore;

    #[test]
    fn test_begin_producer_round_trip() {
        let mut store = ProcessBlockStore::new("TEST");
        let producer = BeginProcessBlockFilter::new("p", 11).consumes(Some("begin".to_string()));
        producer.begin_process_block_produce(&mut store.current()).unwrap();

        let watcher = ProcessBlockIntFilter::new("w", 12).consumes_begin(Some("begin".to_string()));
        watcher.begin_process_block(&store.view("TEST")).unwrap();
        assert_eq!(*store.view("TEST").get::<u32>("begin").unwrap(), 31);
    }

    #[test]
    fn test_watcher_without_producer_reports_missing_artifact() {
        let store = ProcessBlockStore::new("TEST");
        let watcher = ProcessBlockIntFilter::new("w", 12).consumes_begin(Some("begin".to_string()));
        let err = watcher.begin_process_block(&store.view("TEST")).unwrap_err();
        assert!(err.is_violation(ViolationKind::MissingArtifact));
    }

    #[test]
    fn test_second_begin_produce_rejected() {
        let mut store = ProcessBlockStore::new("TEST");
        let producer = BeginProcessBlockFilter::new("p", 11);
        producer.begin_process_block_produce(&mut store.current()).unwrap();
        let err = producer.begin_process_block_produce(&mut store.current()).unwrap_err();
        assert!(err.to_string().contains("transitions 1 but it was supposed to be 0"));
    }

    #[test]
    fn test_empty_consumes_key_ignored() {
        let watcher = ProcessBlockIntFilter::new("w", 2).consumes_begin(Some(String::new()));
        let store = ProcessBlockStore::new("TEST");
        watcher.begin_process_block(&store.view("TEST")).unwrap();
    }
}
