//! Scenario driver: runs a scripted sequence of requests and checks the
//! counters after each step.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use thiserror::Error;

use crate::counters::{CounterRegistry, CounterSnapshot};
use crate::engine::{Resolution, ResolutionEngine};
use crate::error::ResolveError;
use crate::provider::RawMemoryProvider;
use crate::request::{AllocationRequest, SizeHint};
use crate::slot::EntryPointSlot;
use crate::table::{Handler, OverrideTable};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("step {step}: no live allocation named {handle:?}")]
    UnknownHandle { step: usize, handle: String },

    #[error("step {step}: handle {handle:?} is already live")]
    DuplicateHandle { step: usize, handle: String },

    #[error("override list: {0}")]
    Override(#[source] ResolveError),

    #[error("step {step}: {source}")]
    Resolve {
        step: usize,
        #[source]
        source: ResolveError,
    },

    #[error("invalid scenario file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Expected counter values, keyed by slot. Slots not listed are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expectation(pub BTreeMap<EntryPointSlot, u64>);

impl Expectation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(mut self, slot: EntryPointSlot, count: u64) -> Self {
        self.0.insert(slot, count);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Allocate {
        handle: String,
        #[serde(flatten)]
        request: AllocationRequest,
        #[serde(default, skip_serializing_if = "Expectation::is_empty")]
        expect: Expectation,
    },
    Release {
        handle: String,
        #[serde(default)]
        sized: SizeHint,
        #[serde(default, skip_serializing_if = "Expectation::is_empty")]
        expect: Expectation,
    },
    /// Releases a live handle as if constructing its object had failed.
    Unwind {
        handle: String,
        #[serde(default, skip_serializing_if = "Expectation::is_empty")]
        expect: Expectation,
    },
}

impl Step {
    pub fn handle(&self) -> &str {
        match self {
            Step::Allocate { handle, .. } | Step::Release { handle, .. } | Step::Unwind { handle, .. } => {
                handle
            }
        }
    }

    fn expect(&self) -> &Expectation {
        match self {
            Step::Allocate { expect, .. } | Step::Release { expect, .. } | Step::Unwind { expect, .. } => {
                expect
            }
        }
    }

    fn op_name(&self) -> &'static str {
        match self {
            Step::Allocate { .. } => "allocate",
            Step::Release { .. } => "release",
            Step::Unwind { .. } => "unwind",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Slot names to replace with pass-through user handlers.
    #[serde(default)]
    pub overrides: Vec<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub expect: Expectation,
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub op: String,
    pub handle: String,
    pub resolution: Resolution,
    /// For allocations, whether memory came back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    /// `None` for the scenario's final expectation.
    pub step: Option<usize>,
    pub slot: EntryPointSlot,
    pub expected: u64,
    pub actual: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub description: String,
    pub overrides: Vec<EntryPointSlot>,
    pub steps: Vec<StepOutcome>,
    pub counters: CounterSnapshot,
    pub mismatches: Vec<Mismatch>,
    /// Handles still live when the steps ran out. The driver releases them
    /// after taking the counter snapshot.
    pub outstanding: Vec<String>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

type Live = HashMap<String, (NonNull<u8>, AllocationRequest)>;

/// Runs [`Scenario`]s against a provider, reusing one counter registry and
/// resetting it before every run.
pub struct ScenarioDriver<P> {
    provider: P,
    counters: CounterRegistry,
}

impl<P: RawMemoryProvider> ScenarioDriver<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            counters: CounterRegistry::new(),
        }
    }

    pub fn counters(&self) -> &CounterRegistry {
        &self.counters
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn run(&self, scenario: &Scenario) -> Result<ScenarioReport, ScenarioError> {
        let table = override_table(&scenario.overrides)?;
        self.counters.reset();
        tracing::debug!(
            scenario = %scenario.name,
            overrides = scenario.overrides.len(),
            steps = scenario.steps.len(),
            "running scenario"
        );

        let engine = ResolutionEngine::new(&table, &self.counters, &self.provider);
        let mut live = Live::new();
        let result = execute(&engine, scenario, &mut live);

        // Live memory goes back whatever happened. These releases are not
        // part of the report.
        for (handle, (ptr, request)) in live.drain() {
            // SAFETY: `ptr` came from this engine for exactly `request`.
            if let Err(err) = unsafe { engine.resolve_and_invoke_release(ptr, &request.release()) } {
                tracing::warn!(scenario = %scenario.name, %handle, %err, "cleanup release failed");
            }
        }

        let (steps, counters, mismatches, outstanding) = result?;
        let report = ScenarioReport {
            name: scenario.name.clone(),
            description: scenario.description.clone(),
            overrides: table.replaced().collect(),
            steps,
            counters,
            mismatches,
            outstanding,
        };
        if report.passed() {
            tracing::debug!(scenario = %report.name, "scenario passed");
        } else {
            tracing::warn!(
                scenario = %report.name,
                mismatches = report.mismatches.len(),
                "scenario failed"
            );
        }
        Ok(report)
    }
}

fn override_table(names: &[String]) -> Result<OverrideTable, ScenarioError> {
    let mut table = OverrideTable::new();
    for name in names {
        let slot: EntryPointSlot = name
            .parse()
            .map_err(ScenarioError::Override)?;
        table
            .install(slot, Handler::passthrough(slot.operation()))
            .map_err(ScenarioError::Override)?;
    }
    Ok(table)
}

type Executed = (Vec<StepOutcome>, CounterSnapshot, Vec<Mismatch>, Vec<String>);

fn execute<P: RawMemoryProvider>(
    engine: &ResolutionEngine<'_, P>,
    scenario: &Scenario,
    live: &mut Live,
) -> Result<Executed, ScenarioError> {
    let mut outcomes = Vec::with_capacity(scenario.steps.len());
    let mut mismatches = Vec::new();

    for (index, step) in scenario.steps.iter().enumerate() {
        let resolve_err = |source| ScenarioError::Resolve {
            step: index,
            source,
        };

        let (resolution, allocated) = match step {
            Step::Allocate {
                handle, request, ..
            } => {
                if live.contains_key(handle) {
                    return Err(ScenarioError::DuplicateHandle {
                        step: index,
                        handle: handle.clone(),
                    });
                }
                let resolution = engine.resolve_allocate(request).map_err(resolve_err)?;
                let ptr = engine
                    .resolve_and_invoke_allocate(request)
                    .map_err(resolve_err)?;
                if let Some(ptr) = ptr {
                    live.insert(handle.clone(), (ptr, *request));
                }
                (resolution, Some(ptr.is_some()))
            }
            Step::Release { handle, sized, .. } => {
                let (ptr, request) = take(live, index, handle)?;
                let mut release = request.release();
                release.sized = *sized;
                // SAFETY: `ptr` came from this engine for `request`, and it
                // has been removed from `live`, so it is released only once.
                let resolution = unsafe { engine.resolve_and_invoke_release(ptr, &release) }
                    .map_err(resolve_err)?;
                (resolution, None)
            }
            Step::Unwind { handle, .. } => {
                let (ptr, request) = take(live, index, handle)?;
                // SAFETY: as for `Step::Release`.
                let resolution = unsafe { engine.release_after_failed_construction(ptr, &request) }
                    .map_err(resolve_err)?;
                (resolution, None)
            }
        };

        check(step.expect(), engine.counters(), Some(index), &mut mismatches);
        outcomes.push(StepOutcome {
            index,
            op: step.op_name().to_string(),
            handle: step.handle().to_string(),
            resolution,
            allocated,
        });
    }

    check(&scenario.expect, engine.counters(), None, &mut mismatches);
    let mut outstanding: Vec<String> = live.keys().cloned().collect();
    outstanding.sort();

    Ok((outcomes, engine.counters().snapshot(), mismatches, outstanding))
}

fn take(
    live: &mut Live,
    step: usize,
    handle: &str,
) -> Result<(NonNull<u8>, AllocationRequest), ScenarioError> {
    live.remove(handle).ok_or_else(|| ScenarioError::UnknownHandle {
        step,
        handle: handle.to_string(),
    })
}

fn check(
    expect: &Expectation,
    counters: &CounterRegistry,
    step: Option<usize>,
    mismatches: &mut Vec<Mismatch>,
) {
    for (&slot, &expected) in &expect.0 {
        let actual = counters.read(slot);
        if actual != expected {
            mismatches.push(Mismatch {
                step,
                slot,
                expected,
                actual,
            });
        }
    }
}

/// The scenarios every build is checked against.
pub mod builtin {
    use super::{Expectation, Scenario, Step};
    use crate::request::{AllocationRequest, SizeHint};
    use crate::slot::{EntryPointSlot, ObjectKind, DEFAULT_ALIGNMENT};

    /// Element alignment twice the default guarantee.
    pub const OVER_ALIGNED: usize = DEFAULT_ALIGNMENT * 2;

    pub const NAMES: [&str; 3] = ["a", "b", "c"];

    fn untouched_scalar_releases() -> Expectation {
        Expectation::new()
            .slot(EntryPointSlot::ReleaseScalar, 0)
            .slot(EntryPointSlot::ReleaseScalarNothrow, 0)
    }

    /// Two over-aligned elements, allocated and released as an array, with no
    /// overrides installed.
    pub fn scenario_a() -> Scenario {
        let request = AllocationRequest::new(ObjectKind::Array, 2 * OVER_ALIGNED, OVER_ALIGNED);
        Scenario {
            name: "a".into(),
            description: "over-aligned array release stays on the aligned array slot".into(),
            overrides: Vec::new(),
            steps: vec![
                Step::Allocate {
                    handle: "a".into(),
                    request,
                    expect: untouched_scalar_releases()
                        .slot(EntryPointSlot::ReleaseArrayAligned, 0),
                },
                Step::Release {
                    handle: "a".into(),
                    sized: SizeHint::Unsized,
                    expect: untouched_scalar_releases()
                        .slot(EntryPointSlot::ReleaseArrayAligned, 1),
                },
            ],
            expect: untouched_scalar_releases()
                .slot(EntryPointSlot::AllocArrayAligned, 1)
                .slot(EntryPointSlot::ReleaseArrayAligned, 1)
                .slot(EntryPointSlot::ReleaseArray, 0),
        }
    }

    /// Scenario A with default-aligned elements.
    pub fn scenario_b() -> Scenario {
        let request =
            AllocationRequest::new(ObjectKind::Array, 2 * DEFAULT_ALIGNMENT, DEFAULT_ALIGNMENT);
        Scenario {
            name: "b".into(),
            description: "default-aligned array release uses the default array slot".into(),
            overrides: Vec::new(),
            steps: vec![
                Step::Allocate {
                    handle: "b".into(),
                    request,
                    expect: Expectation::new().slot(EntryPointSlot::ReleaseArray, 0),
                },
                Step::Release {
                    handle: "b".into(),
                    sized: SizeHint::Unsized,
                    expect: Expectation::new()
                        .slot(EntryPointSlot::ReleaseArray, 1)
                        .slot(EntryPointSlot::ReleaseArrayAligned, 0),
                },
            ],
            expect: untouched_scalar_releases()
                .slot(EntryPointSlot::AllocArray, 1)
                .slot(EntryPointSlot::ReleaseArray, 1)
                .slot(EntryPointSlot::ReleaseArrayAligned, 0),
        }
    }

    /// Only the unsized scalar release is replaced, then one scalar pair.
    pub fn scenario_c() -> Scenario {
        let request = AllocationRequest::scalar::<u64>();
        let expect = EntryPointSlot::ALL
            .into_iter()
            .filter(|slot| slot.operation() == crate::slot::Operation::Release)
            .fold(Expectation::new(), |expect, slot| {
                let count = u64::from(slot == EntryPointSlot::ReleaseScalar);
                expect.slot(slot, count)
            })
            .slot(EntryPointSlot::AllocScalar, 1);
        Scenario {
            name: "c".into(),
            description: "a lone scalar release override fires only for scalar releases".into(),
            overrides: vec![EntryPointSlot::ReleaseScalar.name().into()],
            steps: vec![
                Step::Allocate {
                    handle: "c".into(),
                    request,
                    expect: Expectation::new().slot(EntryPointSlot::ReleaseScalar, 0),
                },
                Step::Release {
                    handle: "c".into(),
                    sized: SizeHint::Unsized,
                    expect: Expectation::new().slot(EntryPointSlot::ReleaseScalar, 1),
                },
            ],
            expect,
        }
    }

    pub fn all() -> Vec<Scenario> {
        vec![scenario_a(), scenario_b(), scenario_c()]
    }

    pub fn by_name(name: &str) -> Option<Scenario> {
        match name {
            "a" => Some(scenario_a()),
            "b" => Some(scenario_b()),
            "c" => Some(scenario_c()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HandlerSource;
    use crate::provider::{BudgetProvider, SystemProvider};
    use crate::slot::ObjectKind;

    #[test]
    fn builtin_scenarios_pass() {
        let driver = ScenarioDriver::new(SystemProvider);
        for scenario in builtin::all() {
            let report = driver.run(&scenario).unwrap();
            assert!(report.passed(), "{}: {:?}", report.name, report.mismatches);
            assert!(report.outstanding.is_empty());
            assert_eq!(report.counters.total(), scenario.steps.len() as u64);
        }
    }

    #[test]
    fn scenario_c_release_runs_the_user_override() {
        let report = ScenarioDriver::new(SystemProvider)
            .run(&builtin::scenario_c())
            .unwrap();
        assert_eq!(report.overrides, vec![EntryPointSlot::ReleaseScalar]);
        assert_eq!(report.steps[0].resolution.source, HandlerSource::Default);
        assert_eq!(report.steps[1].resolution.source, HandlerSource::User);
        assert_eq!(report.steps[1].resolution.slot, EntryPointSlot::ReleaseScalar);
    }

    #[test]
    fn wrong_expectation_is_reported_not_raised() {
        let mut scenario = builtin::scenario_b();
        scenario.expect = Expectation::new().slot(EntryPointSlot::ReleaseArrayAligned, 1);

        let report = ScenarioDriver::new(SystemProvider).run(&scenario).unwrap();
        assert!(!report.passed());
        assert_eq!(
            report.mismatches,
            vec![Mismatch {
                step: None,
                slot: EntryPointSlot::ReleaseArrayAligned,
                expected: 1,
                actual: 0,
            }]
        );
    }

    #[test]
    fn counters_reset_between_runs() {
        let driver = ScenarioDriver::new(SystemProvider);
        driver.run(&builtin::scenario_a()).unwrap();
        let report = driver.run(&builtin::scenario_a()).unwrap();
        assert!(report.passed());
        assert_eq!(report.counters.get(EntryPointSlot::ReleaseArrayAligned), 1);
    }

    #[test]
    fn unknown_override_is_an_invalid_slot() {
        let mut scenario = builtin::scenario_c();
        scenario.overrides = vec!["release_scalar_sized".into()];

        let err = ScenarioDriver::new(SystemProvider).run(&scenario).unwrap_err();
        assert!(matches!(
            err,
            ScenarioError::Override(ResolveError::InvalidSlot(_))
        ));
    }

    #[test]
    fn releasing_unknown_handle_fails_and_frees_live_memory() {
        let scenario = Scenario {
            name: "dangling".into(),
            description: String::new(),
            overrides: Vec::new(),
            steps: vec![
                Step::Allocate {
                    handle: "x".into(),
                    request: AllocationRequest::scalar::<u32>(),
                    expect: Expectation::new(),
                },
                Step::Release {
                    handle: "y".into(),
                    sized: SizeHint::Sized,
                    expect: Expectation::new(),
                },
            ],
            expect: Expectation::new(),
        };

        let driver = ScenarioDriver::new(SystemProvider);
        let err = driver.run(&scenario).unwrap_err();
        assert!(matches!(err, ScenarioError::UnknownHandle { step: 1, .. }));
        // The cleanup release of "x" went through the engine.
        assert_eq!(driver.counters().read(EntryPointSlot::ReleaseScalar), 1);
    }

    #[test]
    fn outstanding_handles_are_reported() {
        let scenario = Scenario {
            name: "leak".into(),
            description: String::new(),
            overrides: Vec::new(),
            steps: vec![Step::Allocate {
                handle: "kept".into(),
                request: AllocationRequest::array::<u8>(3),
                expect: Expectation::new(),
            }],
            expect: Expectation::new().slot(EntryPointSlot::AllocArray, 1),
        };
        let report = ScenarioDriver::new(SystemProvider).run(&scenario).unwrap();
        assert!(report.passed());
        assert_eq!(report.outstanding, vec!["kept".to_string()]);
        assert_eq!(report.counters.get(EntryPointSlot::ReleaseArray), 0);
    }

    #[test]
    fn outstanding_handles_are_released_after_the_snapshot() {
        let scenario = Scenario {
            name: "leak".into(),
            description: String::new(),
            overrides: vec!["release_array".into()],
            steps: vec![Step::Allocate {
                handle: "kept".into(),
                request: AllocationRequest::array::<u16>(5),
                expect: Expectation::new(),
            }],
            expect: Expectation::new(),
        };
        let driver = ScenarioDriver::new(BudgetProvider::new(SystemProvider, 64));
        let report = driver.run(&scenario).unwrap();

        assert_eq!(report.counters.get(EntryPointSlot::ReleaseArray), 0);
        assert_eq!(driver.counters().read(EntryPointSlot::ReleaseArray), 1);
        assert_eq!(driver.provider().live_bytes(), 0);
    }

    #[test]
    fn parses_json_scenario() {
        let json = r#"{
            "name": "unwind",
            "overrides": ["release_array_nothrow"],
            "steps": [
                {"op": "allocate", "handle": "n", "kind": "array", "size": 24, "align": 8,
                 "failure_mode": "reporting"},
                {"op": "unwind", "handle": "n",
                 "expect": {"release_array_nothrow": 1, "release_array": 0}}
            ],
            "expect": {"alloc_array_nothrow": 1}
        }"#;
        let scenario = Scenario::from_json(json).unwrap();
        assert_eq!(
            scenario.steps[0],
            Step::Allocate {
                handle: "n".into(),
                request: AllocationRequest::new(ObjectKind::Array, 24, 8).reporting(),
                expect: Expectation::new(),
            }
        );

        let report = ScenarioDriver::new(SystemProvider).run(&scenario).unwrap();
        assert!(report.passed(), "{:?}", report.mismatches);
        assert_eq!(report.steps[1].resolution.source, HandlerSource::User);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = Scenario::from_json(r#"{"name": "x", "steps": [{"op": "free"}]}"#).unwrap_err();
        assert!(matches!(err, ScenarioError::Parse(_)));
    }
}
