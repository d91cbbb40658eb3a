//! Caches filled from upstream process blocks.
//!
//! A module registers one filler per cache kind. Each filler names the
//! artifact it depends on; when an input process block carrying that
//! artifact arrives, the filler computes a new value from the block and the
//! previous value of the same kind. The resulting `InputCaches` set is exposed
//! read-only to every event that follows, until the enclosing input file is
//! retired. The pool must be empty when the job ends.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::cache::CacheHandle;
use crate::error::{ContractViolation, Result};
use crate::process_block::ProcessBlock;

type ErasedValue = Arc<dyn Any + Send + Sync>;
type ErasedFiller = Box<dyn Fn(&ProcessBlock<'_>, Option<&ErasedValue>) -> Result<ErasedValue> + Send + Sync>;

struct Filler {
    name: String,
    dependency: String,
    fill: ErasedFiller,
}

/// Fillers declared by one module
#[derive(Default)]
pub struct InputCacheRegistry {
    fillers: Vec<Filler>,
}

impl InputCacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filler computing cache `name` from the block artifact
    /// `dependency`. `fill` receives the block and the previous value of the
    /// same cache kind, if one exists in the current input file.
    pub fn register_filler<T, F>(&mut self, name: &str, dependency: &str, fill: F) -> Result<()>
    where
        T: Any + Send + Sync,
        F: Fn(&ProcessBlock<'_>, Option<&Arc<T>>) -> Result<T> + Send + Sync + 'static,
    {
        if self.fillers.iter().any(|f| f.name == name) {
            return Err(ContractViolation::ordering(format!("input cache '{}' registered twice", name)).into());
        }
        let cache_name = name.to_string();
        let erased: ErasedFiller = Box::new(move |block: &ProcessBlock<'_>, previous: Option<&ErasedValue>| {
            let previous = match previous {
                Some(value) => Some(Arc::clone(value).downcast::<T>().map_err(|_| {
                    ContractViolation::ordering(format!("input cache '{}' is not a {}", cache_name, type_name::<T>()))
                })?),
                None => None,
            };
            let value = fill(block, previous.as_ref())?;
            Ok(Arc::new(value) as ErasedValue)
        });
        self.fillers.push(Filler {
            name: name.to_string(),
            dependency: dependency.to_string(),
            fill: erased,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fillers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fillers.is_empty()
    }

    /// Names of registered caches in registration order
    pub fn names(&self) -> Vec<&str> {
        self.fillers.iter().map(|f| f.name.as_str()).collect()
    }
}

/// One filled set of input caches, read-only to events
#[derive(Debug)]
pub struct InputCaches {
    stage: String,
    sequence: usize,
    values: HashMap<String, ErasedValue>,
}

impl InputCaches {
    /// Stage name of the process block that produced this set
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Position of this set in the job's arrival order
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<CacheHandle<T>> {
        let value = self.values.get(name).ok_or_else(|| {
            ContractViolation::ordering(format!("input cache '{}' read before it was filled", name))
                .in_scope(format!("process block {}", self.stage))
        })?;
        let typed = Arc::clone(value).downcast::<T>().map_err(|_| {
            ContractViolation::ordering(format!("input cache '{}' is not a {}", name, type_name::<T>()))
        })?;
        Ok(CacheHandle::new(typed))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// Outcome of filling from one process block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FillOutcome {
    pub filled: usize,
    pub skipped: usize,
}

/// Registry plus the pool of filled sets for one module
pub struct InputCachePool {
    registry: InputCacheRegistry,
    sets: RwLock<Vec<Arc<InputCaches>>>,
    filled_total: std::sync::atomic::AtomicUsize,
}

impl InputCachePool {
    pub fn new(registry: InputCacheRegistry) -> Self {
        Self {
            registry,
            sets: RwLock::new(Vec::new()),
            filled_total: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &InputCacheRegistry {
        &self.registry
    }

    /// Run every filler whose dependency is present in `block`. Fillers
    /// whose dependency is absent carry their previous value forward.
    /// Nothing is added to the pool when no filler ran.
    pub fn fill(&self, block: &ProcessBlock<'_>) -> Result<FillOutcome> {
        let mut sets = self.write()?;
        let previous = sets.last().cloned();
        let mut values = HashMap::new();
        let mut outcome = FillOutcome::default();

        for filler in &self.registry.fillers {
            let prior = previous.as_ref().and_then(|p| p.values.get(&filler.name));
            if block.contains(&filler.dependency) {
                let value = (filler.fill)(block, prior)?;
                values.insert(filler.name.clone(), value);
                outcome.filled += 1;
            } else {
                outcome.skipped += 1;
                if let Some(prior) = prior {
                    values.insert(filler.name.clone(), Arc::clone(prior));
                }
            }
        }

        if outcome.filled > 0 {
            let sequence = self.filled_total.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            sets.push(Arc::new(InputCaches {
                stage: block.process_name().to_string(),
                sequence,
                values,
            }));
        }
        Ok(outcome)
    }

    /// The most recently filled set, seen by subsequent events
    pub fn current(&self) -> Option<Arc<InputCaches>> {
        self.sets.read().ok()?.last().cloned()
    }

    /// Drop every set of the finished input file. A set still referenced
    /// by in-flight work is a leak and the pool keeps every set, so
    /// `cache_size` still reports it at job end.
    pub fn retire(&self) -> Result<usize> {
        let mut sets = self.write()?;
        if let Some(set) = sets.iter().find(|set| Arc::strong_count(set) > 1) {
            return Err(ContractViolation::leak(format!(
                "input cache set from {} still referenced at retirement",
                set.stage
            ))
            .into());
        }
        let retired = sets.len();
        sets.clear();
        Ok(retired)
    }

    /// Number of filled sets currently held
    pub fn cache_size(&self) -> usize {
        self.sets.read().map(|s| s.len()).unwrap_or(0)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<Arc<InputCaches>>>> {
        self.sets
            .write()
            .map_err(|_| ContractViolation::ordering("input cache pool poisoned").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViolationKind;
    use crate::process_block::ProcessBlockStore;
    use std::collections::BTreeMap;

    #[derive(Debug, Default)]
    struct Total {
        value: i64,
    }

    fn store_with(stage: &str, artifacts: &[(&str, i64)]) -> ProcessBlockStore {
        let mut store = ProcessBlockStore::new("TEST");
        let map: BTreeMap<String, i64> = artifacts.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        store.add_input_stage(stage, &map).unwrap();
        store
    }

    fn sum_registry() -> InputCacheRegistry {
        let mut registry = InputCacheRegistry::new();
        registry
            .register_filler::<i64, _>("sum", "beginKey", |block, _previous| {
                Ok(block.get::<i64>("beginKey")? + block.get::<i64>("endKey")?)
            })
            .unwrap();
        registry
            .register_filler::<Total, _>("total", "beginKey", |block, previous| {
                let base = previous.map(|p| p.value).unwrap_or(0);
                Ok(Total {
                    value: base + block.get::<i64>("beginKey")?,
                })
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_fill_multiple_typed_caches() {
        let store = store_with("PROD1", &[("beginKey", 31), ("endKey", 41)]);
        let pool = InputCachePool::new(sum_registry());

        let outcome = pool.fill(&store.view("PROD1")).unwrap();
        assert_eq!(outcome, FillOutcome { filled: 2, skipped: 0 });

        let set = pool.current().unwrap();
        assert_eq!(*set.get::<i64>("sum").unwrap(), 72);
        assert_eq!(set.get::<Total>("total").unwrap().value, 31);
        assert_eq!(set.stage(), "PROD1");
    }

    #[test]
    fn test_previous_cache_handed_back() {
        let mut store = store_with("PROD1", &[("beginKey", 31), ("endKey", 41)]);
        store
            .add_input_stage("PROD2", &BTreeMap::from([("beginKey".to_string(), 10), ("endKey".to_string(), 0)]))
            .unwrap();
        let pool = InputCachePool::new(sum_registry());

        pool.fill(&store.view("PROD1")).unwrap();
        pool.fill(&store.view("PROD2")).unwrap();

        let set = pool.current().unwrap();
        assert_eq!(set.get::<Total>("total").unwrap().value, 41);
        assert_eq!(*set.get::<i64>("sum").unwrap(), 10);
        assert_eq!(pool.cache_size(), 2);
    }

    #[test]
    fn test_missing_dependency_skips_filler() {
        let store = store_with("MERGE", &[("beginKeyM", 1)]);
        let pool = InputCachePool::new(sum_registry());
        let outcome = pool.fill(&store.view("MERGE")).unwrap();
        assert_eq!(outcome, FillOutcome { filled: 0, skipped: 2 });
        assert!(pool.current().is_none());
        assert_eq!(pool.cache_size(), 0);
    }

    #[test]
    fn test_filler_reading_absent_second_artifact_fails() {
        let store = store_with("PROD1", &[("beginKey", 31)]);
        let pool = InputCachePool::new(sum_registry());
        let err = pool.fill(&store.view("PROD1")).unwrap_err();
        assert!(err.is_violation(ViolationKind::MissingArtifact));
    }

    #[test]
    fn test_retire_empties_pool() {
        let store = store_with("PROD1", &[("beginKey", 31), ("endKey", 41)]);
        let pool = InputCachePool::new(sum_registry());
        pool.fill(&store.view("PROD1")).unwrap();
        assert_eq!(pool.retire().unwrap(), 1);
        assert_eq!(pool.cache_size(), 0);
    }

    #[test]
    fn test_retire_with_live_reference_is_leak() {
        let store = store_with("PROD1", &[("beginKey", 31), ("endKey", 41)]);
        let pool = InputCachePool::new(sum_registry());
        pool.fill(&store.view("PROD1")).unwrap();
        let held = pool.current().unwrap();
        let err = pool.retire().unwrap_err();
        assert!(err.is_violation(ViolationKind::Leak));
        assert_eq!(pool.cache_size(), 1);

        drop(held);
        assert_eq!(pool.retire().unwrap(), 1);
        assert_eq!(pool.cache_size(), 0);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = sum_registry();
        let err = registry.register_filler::<i64, _>("sum", "beginKey", |_, _| Ok(0));
        assert!(err.is_err());
        assert_eq!(registry.names(), vec!["sum", "total"]);
    }

    #[test]
    fn test_wrong_type_read_rejected() {
        let store = store_with("PROD1", &[("beginKey", 31), ("endKey", 41)]);
        let pool = InputCachePool::new(sum_registry());
        pool.fill(&store.view("PROD1")).unwrap();
        let set = pool.current().unwrap();
        assert!(set.get::<u32>("sum").is_err());
        assert!(set.get::<i64>("nope").is_err());
    }
}
