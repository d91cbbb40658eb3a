//! Process-scope artifacts.
//!
//! The `ProcessBlockStore` lives for one job and holds named artifacts keyed
//! by (stage name, key). The current job's own stage is writable through a
//! `ProcessBlock` view during begin/end process block; upstream stages are
//! loaded from the job input and are read-only.

use std::any::{Any, type_name};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{ContractViolation, Result};

type Artifact = Arc<dyn Any + Send + Sync>;

/// Job-lifetime store of process-scope artifacts
#[derive(Default)]
pub struct ProcessBlockStore {
    process_name: String,
    stages: HashMap<String, HashMap<String, Artifact>>,
    /// Stage names in order of arrival
    arrival: Vec<String>,
}

impl ProcessBlockStore {
    pub fn new(process_name: impl Into<String>) -> Self {
        let process_name = process_name.into();
        let mut stages = HashMap::new();
        stages.insert(process_name.clone(), HashMap::new());
        Self {
            process_name,
            stages,
            arrival: Vec::new(),
        }
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Load the artifacts of an upstream stage. Integer artifacts from the
    /// job input are stored as `i64`.
    pub fn add_input_stage(&mut self, stage: &str, artifacts: &BTreeMap<String, i64>) -> Result<()> {
        if stage == self.process_name {
            return Err(ContractViolation::ordering(format!(
                "input process block uses the current process name '{}'",
                stage
            ))
            .into());
        }
        let entry = self.stages.entry(stage.to_string()).or_default();
        for (key, value) in artifacts {
            entry.insert(key.clone(), Arc::new(*value));
        }
        if !self.arrival.iter().any(|s| s == stage) {
            self.arrival.push(stage.to_string());
        }
        Ok(())
    }

    /// Upstream stage names in arrival order
    pub fn input_stages(&self) -> &[String] {
        &self.arrival
    }

    /// Writable view on the current process stage
    pub fn current(&mut self) -> ProcessBlock<'_> {
        let stage = self.process_name.clone();
        ProcessBlock {
            store: StoreRef::Mut(self),
            stage,
        }
    }

    /// Read-only view on any stage
    pub fn view(&self, stage: &str) -> ProcessBlock<'_> {
        ProcessBlock {
            store: StoreRef::Shared(self),
            stage: stage.to_string(),
        }
    }

    pub fn contains(&self, stage: &str, key: &str) -> bool {
        self.stages.get(stage).is_some_and(|s| s.contains_key(key))
    }

    pub fn artifact_count(&self) -> usize {
        self.stages.values().map(|s| s.len()).sum()
    }

    fn lookup<T: Any>(&self, stage: &str, key: &str) -> Result<&T> {
        let artifact = self
            .stages
            .get(stage)
            .and_then(|s| s.get(key))
            .ok_or_else(|| {
                ContractViolation::missing_artifact(format!("'{}' read before it was produced", key))
                    .in_scope(format!("process block {}", stage))
            })?;
        artifact.downcast_ref::<T>().ok_or_else(|| {
            ContractViolation::ordering(format!("'{}' is not a {}", key, type_name::<T>()))
                .in_scope(format!("process block {}", stage))
                .into()
        })
    }
}

enum StoreRef<'a> {
    Shared(&'a ProcessBlockStore),
    Mut(&'a mut ProcessBlockStore),
}

impl StoreRef<'_> {
    fn get(&self) -> &ProcessBlockStore {
        match self {
            StoreRef::Shared(s) => s,
            StoreRef::Mut(s) => &**s,
        }
    }
}

/// View of one stage's artifacts, handed to process block hooks
pub struct ProcessBlock<'a> {
    store: StoreRef<'a>,
    stage: String,
}

impl ProcessBlock<'_> {
    /// Name of the stage this block belongs to
    pub fn process_name(&self) -> &str {
        &self.stage
    }

    /// Read an artifact of this stage; absent keys are a contract violation
    pub fn get<T: Any>(&self, key: &str) -> Result<&T> {
        self.store.get().lookup(&self.stage, key)
    }

    /// Read an artifact of another stage
    pub fn get_from<T: Any>(&self, stage: &str, key: &str) -> Result<&T> {
        self.store.get().lookup(stage, key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.get().contains(&self.stage, key)
    }

    /// Produce an artifact into this stage. Only the current process stage
    /// is writable, and each key can be produced once.
    pub fn produce<T: Any + Send + Sync>(&mut self, key: &str, value: T) -> Result<()> {
        let stage = self.stage.clone();
        let store = match &mut self.store {
            StoreRef::Mut(store) => store,
            StoreRef::Shared(_) => {
                return Err(ContractViolation::ordering(format!("'{}' produced into a read-only process block", key))
                    .in_scope(format!("process block {}", stage))
                    .into());
            }
        };
        let artifacts = store.stages.entry(stage.clone()).or_default();
        if artifacts.contains_key(key) {
            return Err(ContractViolation::ordering(format!("'{}' produced twice", key))
                .in_scope(format!("process block {}", stage))
                .into());
        }
        artifacts.insert(key.to_string(), Arc::new(value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViolationKind;

    #[test]
    fn test_produce_then_get_round_trip() {
        let mut store = ProcessBlockStore::new("TEST");
        store.current().produce("beginKey", 31u32).unwrap();
        let block = store.view("TEST");
        assert_eq!(*block.get::<u32>("beginKey").unwrap(), 31);
        assert_eq!(block.process_name(), "TEST");
    }

    #[test]
    fn test_get_before_produce_is_missing_artifact() {
        let mut store = ProcessBlockStore::new("TEST");
        let block = store.current();
        let err = block.get::<u32>("beginKey").unwrap_err();
        assert!(err.is_violation(ViolationKind::MissingArtifact));
        assert!(err.to_string().contains("process block TEST"));
    }

    #[test]
    fn test_produce_twice_rejected() {
        let mut store = ProcessBlockStore::new("TEST");
        let mut block = store.current();
        block.produce("endKey", 41u32).unwrap();
        let err = block.produce("endKey", 41u32).unwrap_err();
        assert!(err.is_violation(ViolationKind::Ordering));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut store = ProcessBlockStore::new("TEST");
        store.current().produce("beginKey", 31u32).unwrap();
        let err = store.view("TEST").get::<i64>("beginKey").unwrap_err();
        assert!(err.is_violation(ViolationKind::Ordering));
    }

    #[test]
    fn test_input_stage_read_only() {
        let mut store = ProcessBlockStore::new("TEST");
        let artifacts = BTreeMap::from([("beginKey".to_string(), 31i64), ("endKey".to_string(), 41)]);
        store.add_input_stage("PROD1", &artifacts).unwrap();

        let block = store.view("PROD1");
        assert_eq!(block.get::<i64>("beginKey").unwrap() + block.get::<i64>("endKey").unwrap(), 72);

        let mut read_only = store.view("PROD1");
        assert!(read_only.produce("x", 1i64).is_err());
        assert_eq!(store.input_stages(), &["PROD1".to_string()]);
    }

    #[test]
    fn test_cross_stage_read() {
        let mut store = ProcessBlockStore::new("TEST");
        store
            .add_input_stage("MERGE", &BTreeMap::from([("beginKeyM".to_string(), 5i64)]))
            .unwrap();
        let block = store.current();
        assert_eq!(*block.get_from::<i64>("MERGE", "beginKeyM").unwrap(), 5);
        assert!(block.get_from::<i64>("PROD1", "beginKeyM").is_err());
        assert_eq!(store.artifact_count(), 1);
    }

    #[test]
    fn test_input_stage_cannot_shadow_current() {
        let mut store = ProcessBlockStore::new("TEST");
        assert!(store.add_input_stage("TEST", &BTreeMap::new()).is_err());
    }
}
