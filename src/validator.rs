//! Teardown checks over transition totals.
//!
//! A `TransitionValidator` holds expectations keyed by (ScopeKind,
//! Transition) and reports the first mismatch as a Count violation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::counter::{Transition, TransitionCounts};
use crate::error::{ContractViolation, Result, SchedulerError};
use crate::scope::ScopeKind;
use crate::source::InputTotals;

/// Accepted values for one transition total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Exact(u64),
    Range { min: u64, max: u64 },
}

impl Expectation {
    pub fn admits(self, actual: u64) -> bool {
        match self {
            Expectation::Exact(n) => actual == n,
            Expectation::Range { min, max } => (min..=max).contains(&actual),
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Exact(n) => write!(f, "{}", n),
            Expectation::Range { min, max } => write!(f, "between {} and {}", min, max),
        }
    }
}

/// Expectation as written in a job file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectationSpec {
    pub scope: ScopeKind,
    pub transition: Transition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

impl ExpectationSpec {
    pub fn expectation(&self) -> Result<Expectation> {
        match (self.exact, self.min, self.max) {
            (Some(n), None, None) => Ok(Expectation::Exact(n)),
            (None, Some(min), Some(max)) if min <= max => Ok(Expectation::Range { min, max }),
            (None, Some(min), None) => Ok(Expectation::Range { min, max: u64::MAX }),
            (None, None, Some(max)) => Ok(Expectation::Range { min: 0, max }),
            _ => Err(SchedulerError::Config(format!(
                "expectation for {}.{} needs either 'exact' or a valid 'min'/'max' pair",
                self.scope, self.transition
            ))),
        }
    }
}

#[derive(Debug, Clone)]
enum Check {
    Total {
        scope: ScopeKind,
        transition: Transition,
        expectation: Expectation,
    },
    Equal {
        left: (ScopeKind, Transition),
        right: (ScopeKind, Transition),
    },
}

#[derive(Debug, Clone, Default)]
pub struct TransitionValidator {
    checks: Vec<Check>,
}

impl TransitionValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(mut self, scope: ScopeKind, transition: Transition, expectation: Expectation) -> Self {
        self.checks.push(Check::Total {
            scope,
            transition,
            expectation,
        });
        self
    }

    /// Require two totals to be equal, e.g. stream begin and end lumi
    pub fn expect_equal(mut self, left: (ScopeKind, Transition), right: (ScopeKind, Transition)) -> Self {
        self.checks.push(Check::Equal { left, right });
        self
    }

    /// Expectations every job must meet given its input and stream count.
    ///
    /// Runs are entered by every stream; a lumi is entered only by the
    /// streams that processed at least one of its events.
    pub fn for_job(totals: &InputTotals, streams: usize) -> Self {
        use ScopeKind::*;
        use Transition::*;

        let streams = streams as u64;
        Self::new()
            .expect(Stream, Begin, Expectation::Exact(streams))
            .expect(Stream, End, Expectation::Exact(streams))
            .expect(Stream, Work, Expectation::Exact(totals.events))
            .expect(Run, Begin, Expectation::Exact(totals.runs))
            .expect(Run, End, Expectation::Exact(totals.runs))
            .expect(Run, StreamBegin, Expectation::Exact(totals.runs * streams))
            .expect_equal((Run, StreamBegin), (Run, StreamEnd))
            .expect(LuminosityBlock, Begin, Expectation::Exact(totals.lumis))
            .expect(LuminosityBlock, End, Expectation::Exact(totals.lumis))
            .expect(
                LuminosityBlock,
                StreamBegin,
                Expectation::Range {
                    min: totals.lumis_with_events,
                    max: totals.lumis_with_events * streams,
                },
            )
            .expect_equal((LuminosityBlock, StreamBegin), (LuminosityBlock, StreamEnd))
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Every failed check, in declaration order
    pub fn violations(&self, counts: &TransitionCounts) -> Vec<ContractViolation> {
        self.checks
            .iter()
            .filter_map(|check| match *check {
                Check::Total {
                    scope,
                    transition,
                    expectation,
                } => {
                    let actual = counts.get(scope, transition);
                    (!expectation.admits(actual)).then(|| {
                        ContractViolation::expected(format!("{} {} transitions", scope, transition), actual, expectation)
                    })
                }
                Check::Equal { left, right } => {
                    let l = counts.get(left.0, left.1);
                    let r = counts.get(right.0, right.1);
                    (l != r).then(|| {
                        ContractViolation::count(format!(
                            "{} {} transitions {} does not equal {} {} transitions {}",
                            left.0, left.1, l, right.0, right.1, r
                        ))
                    })
                }
            })
            .collect()
    }

    /// First failed check as an error
    pub fn validate(&self, counts: &TransitionCounts) -> Result<()> {
        match self.violations(counts).into_iter().next() {
            Some(violation) => Err(violation.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::TransitionCounter;
    use crate::error::ViolationKind;
    use crate::source::JobInput;

    fn counts(entries: &[(ScopeKind, Transition, u64)]) -> TransitionCounts {
        let counter = TransitionCounter::new();
        for &(kind, transition, n) in entries {
            for _ in 0..n {
                counter.record(kind, transition);
            }
        }
        counter.snapshot()
    }

    #[test]
    fn test_exact_and_range_admit() {
        assert!(Expectation::Exact(2).admits(2));
        assert!(!Expectation::Exact(2).admits(3));
        let range = Expectation::Range { min: 2, max: 6 };
        assert!(range.admits(2));
        assert!(range.admits(6));
        assert!(!range.admits(7));
        assert_eq!(range.to_string(), "between 2 and 6");
    }

    #[test]
    fn test_mismatch_reported_as_count_violation() {
        let validator =
            TransitionValidator::new().expect(ScopeKind::Run, Transition::Begin, Expectation::Exact(2));
        let err = validator
            .validate(&counts(&[(ScopeKind::Run, Transition::Begin, 3)]))
            .unwrap_err();
        assert!(err.is_violation(ViolationKind::Count));
        assert!(err.to_string().contains("run begin transitions 3 but it was supposed to be 2"));
    }

    #[test]
    fn test_expect_equal() {
        let validator = TransitionValidator::new().expect_equal(
            (ScopeKind::LuminosityBlock, Transition::StreamBegin),
            (ScopeKind::LuminosityBlock, Transition::StreamEnd),
        );
        let ok = counts(&[
            (ScopeKind::LuminosityBlock, Transition::StreamBegin, 4),
            (ScopeKind::LuminosityBlock, Transition::StreamEnd, 4),
        ]);
        validator.validate(&ok).unwrap();

        let bad = counts(&[
            (ScopeKind::LuminosityBlock, Transition::StreamBegin, 4),
            (ScopeKind::LuminosityBlock, Transition::StreamEnd, 3),
        ]);
        assert_eq!(validator.violations(&bad).len(), 1);
    }

    #[test]
    fn test_for_job_lumi_range() {
        let totals = JobInput::uniform(2, 1, 5).totals();
        let validator = TransitionValidator::for_job(&totals, 3);
        let observed = counts(&[
            (ScopeKind::Stream, Transition::Begin, 3),
            (ScopeKind::Stream, Transition::End, 3),
            (ScopeKind::Stream, Transition::Work, 10),
            (ScopeKind::Run, Transition::Begin, 2),
            (ScopeKind::Run, Transition::End, 2),
            (ScopeKind::Run, Transition::StreamBegin, 6),
            (ScopeKind::Run, Transition::StreamEnd, 6),
            (ScopeKind::LuminosityBlock, Transition::Begin, 2),
            (ScopeKind::LuminosityBlock, Transition::End, 2),
            (ScopeKind::LuminosityBlock, Transition::StreamBegin, 5),
            (ScopeKind::LuminosityBlock, Transition::StreamEnd, 5),
        ]);
        validator.validate(&observed).unwrap();
    }

    #[test]
    fn test_spec_parsing() {
        let yaml = "scope: lumi\ntransition: stream_begin\nmin: 2\nmax: 6\n";
        let spec: ExpectationSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.expectation().unwrap(), Expectation::Range { min: 2, max: 6 });

        let bad = ExpectationSpec {
            scope: ScopeKind::Run,
            transition: Transition::Begin,
            exact: Some(1),
            min: Some(1),
            max: None,
        };
        assert!(bad.expectation().is_err());
    }
}
