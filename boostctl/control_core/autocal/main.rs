use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    config::{CalibrationConfig, SafetyLimits},
    error::CommandError,
    store::{BucketKey, CalibrationStore},
};

/// Calibration phase; advances strictly forward or aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CalibrationPhase {
    /// Conservative ceiling, first run-sets.
    Bootstrapping,
    /// Ceiling and target stepping up.
    Expanding,
    /// Repeating the requested point until confidence is accepted.
    Validating,
    /// Requested point accepted.
    Complete,
    /// Stopped by a safety event, a command or lack of convergence.
    Aborted,
}

/// Requested operating point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRequest {
    /// Engine speed to calibrate at.
    pub target_rpm: f32,
    /// Boost to calibrate up to, psi.
    pub target_boost: f32,
}

/// Session state published in the status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStatus {
    /// Session identifier.
    pub id: String,
    /// Requested point.
    pub request: CalibrationRequest,
    /// Current phase.
    pub phase: CalibrationPhase,
    /// Boost the current step calibrates, psi.
    pub step_target_psi: f32,
    /// Boost commanded for runs at the current ceiling, psi.
    pub run_target_psi: f32,
    /// Overboost ceiling in force, psi.
    pub ceiling_psi: f32,
    /// Successful runs in the current run-set.
    pub run_count: u32,
    /// Runs needed to accept a run-set.
    pub required_runs: u32,
    /// Confidence of the point being calibrated.
    pub confidence: f32,
    /// Index of the current step.
    pub step: usize,
    /// Steps in the plan.
    pub steps: usize,
    /// Failed runs so far.
    pub failures: u32,
}

/// Final word on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Session identifier.
    pub id: String,
    /// Requested point.
    pub request: CalibrationRequest,
    /// `Complete` or `Aborted`.
    pub phase: CalibrationPhase,
    /// Why the session ended.
    pub reason: String,
    /// Confidence reached.
    pub confidence: f32,
    /// Ceiling in force at the end, psi.
    pub ceiling_psi: f32,
    /// Loop time the session ended.
    pub at_ms: u64,
}

/// Measurements handed to the engine each cycle.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationTick {
    /// Engine speed.
    pub rpm: f32,
    /// Fused boost, when valid.
    pub measured_psi: Option<f32>,
    /// Duty fraction applied in the previous cycle.
    pub applied_duty: f32,
    /// Cycle time.
    pub now_ms: u64,
}

/// Notable transition during a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalibrationEvent {
    /// Phase moved forward.
    PhaseChanged {
        /// Previous phase.
        from: CalibrationPhase,
        /// New phase.
        to: CalibrationPhase,
    },
    /// A run-set was accepted and written to the store.
    Committed {
        /// Bucket written.
        key: BucketKey,
        /// Mean duty of the run-set.
        duty: f32,
        /// Confidence after the write.
        confidence: f32,
    },
    /// The ceiling was raised.
    CeilingRaised {
        /// New ceiling, psi.
        ceiling_psi: f32,
    },
    /// The session ended.
    Finished(CalibrationReport),
}

/// Output of one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStep {
    /// Target boost for this cycle; zero while resting or off-rpm.
    pub target_psi: f32,
    /// Transitions that happened this tick.
    pub events: Vec<CalibrationEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RunState {
    Resting {
        until_ms: u64,
    },
    Waiting,
    Running {
        started_ms: u64,
        settled_since: Option<u64>,
        duty_sum: f32,
        samples: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PlanStep {
    key: BucketKey,
    psi: f32,
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    request: CalibrationRequest,
    plan: Vec<PlanStep>,
    step: usize,
    phase: CalibrationPhase,
    ceiling_psi: f32,
    run: RunState,
    staged: Vec<(f32, u32)>,
    failures: u32,
    validation_sets: u32,
    confidence: f32,
}

impl Session {
    fn current(&self) -> Option<PlanStep> {
        self.plan.get(self.step).copied()
    }

    fn run_target(&self, limits: &SafetyLimits, config: &CalibrationConfig) -> f32 {
        let Some(step) = self.current() else {
            return 0.0;
        };
        if self.ceiling_psi >= limits.overboost_limit {
            step.psi
        } else {
            step.psi
                .min(self.ceiling_psi - config.ceiling_headroom_psi)
                .max(0.0)
        }
    }

    fn run_count(&self) -> u32 {
        u32::try_from(self.staged.len()).unwrap_or(u32::MAX)
    }
}

/// Drives bounded test points to populate the store safely.
///
/// Runs are staged in the session and written to the store only as a whole
/// accepted run-set, so an abort never leaves a bucket half-written.
/// Ceilings reduced by aborts are remembered per bucket across sessions.
#[derive(Debug, Clone)]
pub struct AutoCalibrationEngine {
    config: CalibrationConfig,
    session: Option<Session>,
    ceilings: BTreeMap<BucketKey, f32>,
    last_report: Option<CalibrationReport>,
}

impl AutoCalibrationEngine {
    /// Creates an idle engine.
    #[must_use]
    pub const fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            session: None,
            ceilings: BTreeMap::new(),
            last_report: None,
        }
    }

    /// Whether a session owns the target.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Ceiling in force for the active session.
    #[must_use]
    pub fn ceiling_psi(&self) -> Option<f32> {
        self.session.as_ref().map(|session| session.ceiling_psi)
    }

    /// Remembered ceiling for a bucket.
    #[must_use]
    pub fn remembered_ceiling(&self, key: BucketKey) -> Option<f32> {
        self.ceilings.get(&key).copied()
    }

    /// Report of the last finished session.
    #[must_use]
    pub const fn last_report(&self) -> Option<&CalibrationReport> {
        self.last_report.as_ref()
    }

    /// Checks a request without starting it.
    pub fn check_request(
        request: &CalibrationRequest,
        limits: &SafetyLimits,
    ) -> Result<(), CommandError> {
        let CalibrationRequest {
            target_rpm,
            target_boost,
        } = *request;
        if !target_rpm.is_finite() || !(1000.0..=7000.0).contains(&target_rpm) {
            return Err(CommandError::invalid(
                "target_rpm",
                target_rpm,
                "must be within 1000..=7000",
            ));
        }
        if !target_boost.is_finite()
            || target_boost <= limits.spring_pressure
            || target_boost > limits.max_boost_psi
        {
            return Err(CommandError::invalid(
                "target_boost",
                target_boost,
                format!(
                    "must be above spring {} and at most max boost {}",
                    limits.spring_pressure, limits.max_boost_psi
                ),
            ));
        }
        Ok(())
    }

    /// Starts a session at Bootstrapping.
    pub fn start(
        &mut self,
        request: CalibrationRequest,
        limits: &SafetyLimits,
        store: &CalibrationStore,
        now_ms: u64,
    ) -> Result<CalibrationStatus, CommandError> {
        if self.session.is_some() {
            return Err(CommandError::CalibrationInProgress);
        }
        Self::check_request(&request, limits)?;
        let plan = build_plan(store, &request, limits.spring_pressure);
        let Some(first) = plan.first().copied() else {
            return Err(CommandError::invalid(
                "target_boost",
                request.target_boost,
                "no calibration bucket above spring pressure",
            ));
        };
        let mut ceiling = (limits.spring_pressure + self.config.initial_ceiling_above_spring)
            .min(limits.overboost_limit);
        if let Some(remembered) = self.ceilings.get(&first.key) {
            ceiling = ceiling.min(*remembered);
        }
        let session = Session {
            id: format!("cal-{}", Uuid::new_v4()),
            request,
            plan,
            step: 0,
            phase: CalibrationPhase::Bootstrapping,
            ceiling_psi: ceiling,
            run: RunState::Resting {
                until_ms: now_ms + self.config.rest_ms,
            },
            staged: Vec::new(),
            failures: 0,
            validation_sets: 0,
            confidence: store.point(first.key).map_or(0.0, |point| point.confidence),
        };
        info!(id = %session.id, ceiling_psi = ceiling, steps = session.plan.len(), "calibration started");
        self.session = Some(session);
        self.status(limits)
            .ok_or(CommandError::NoCalibrationSession)
    }

    /// Status of the active session.
    #[must_use]
    pub fn status(&self, limits: &SafetyLimits) -> Option<CalibrationStatus> {
        let session = self.session.as_ref()?;
        let step = session.current()?;
        Some(CalibrationStatus {
            id: session.id.clone(),
            request: session.request,
            phase: session.phase,
            step_target_psi: step.psi,
            run_target_psi: session.run_target(limits, &self.config),
            ceiling_psi: session.ceiling_psi,
            run_count: session.run_count(),
            required_runs: self.config.required_runs,
            confidence: session.confidence,
            step: session.step,
            steps: session.plan.len(),
            failures: session.failures,
        })
    }

    /// Advances the active session by one cycle.
    #[allow(clippy::cast_precision_loss)]
    pub fn tick(
        &mut self,
        tick: &CalibrationTick,
        limits: &SafetyLimits,
        store: &mut CalibrationStore,
    ) -> Option<CalibrationStep> {
        let config = self.config;
        let session = self.session.as_mut()?;
        let mut events = Vec::new();
        let rpm_ok = tick.rpm.is_finite()
            && (tick.rpm - session.request.target_rpm).abs() <= config.rpm_tolerance;
        let run_target = session.run_target(limits, &config);

        let mut run_finished = None;
        let target_psi = match session.run {
            RunState::Resting { until_ms } => {
                if tick.now_ms >= until_ms {
                    session.run = RunState::Waiting;
                }
                0.0
            }
            RunState::Waiting => {
                if rpm_ok {
                    session.run = RunState::Running {
                        started_ms: tick.now_ms,
                        settled_since: None,
                        duty_sum: 0.0,
                        samples: 0,
                    };
                    run_target
                } else {
                    0.0
                }
            }
            RunState::Running { .. } if !rpm_ok => {
                session.run = RunState::Waiting;
                0.0
            }
            RunState::Running {
                started_ms,
                settled_since,
                duty_sum,
                samples,
            } => {
                let in_tolerance = tick
                    .measured_psi
                    .is_some_and(|psi| (psi - run_target).abs() <= config.boost_tolerance_psi);
                if in_tolerance {
                    let since = settled_since.unwrap_or(tick.now_ms);
                    let duty_sum = duty_sum + tick.applied_duty;
                    let samples = samples + 1;
                    if tick.now_ms.saturating_sub(since) >= config.hold_ms {
                        run_finished = Some(Ok((duty_sum / samples as f32, samples)));
                    } else {
                        session.run = RunState::Running {
                            started_ms,
                            settled_since: Some(since),
                            duty_sum,
                            samples,
                        };
                    }
                } else if tick.now_ms.saturating_sub(started_ms) >= config.max_run_ms {
                    run_finished = Some(Err(()));
                } else {
                    session.run = RunState::Running {
                        started_ms,
                        settled_since: None,
                        duty_sum: 0.0,
                        samples: 0,
                    };
                }
                run_target
            }
        };

        if let Some(outcome) = run_finished {
            session.run = RunState::Resting {
                until_ms: tick.now_ms + config.rest_ms,
            };
            match outcome {
                Ok(run) => {
                    session.staged.push(run);
                    if session.run_count() >= config.required_runs {
                        Self::accept_run_set(
                            session,
                            &config,
                            limits,
                            store,
                            &self.ceilings,
                            run_target,
                            tick.now_ms,
                            &mut events,
                        );
                    }
                }
                Err(()) => {
                    session.staged.clear();
                    session.failures += 1;
                    if session.failures >= config.max_failures {
                        session.phase = CalibrationPhase::Aborted;
                    }
                }
            }
        }

        let reason = match session.phase {
            CalibrationPhase::Complete => Some("requested point accepted".to_string()),
            CalibrationPhase::Aborted if session.failures >= config.max_failures => Some(format!(
                "stopped after {} failed runs",
                session.failures
            )),
            CalibrationPhase::Aborted => Some("validation did not converge".to_string()),
            _ => None,
        };
        if let Some(reason) = reason {
            let report = self.finish(tick.now_ms, reason);
            events.push(CalibrationEvent::Finished(report));
            return Some(CalibrationStep {
                target_psi: 0.0,
                events,
            });
        }
        Some(CalibrationStep { target_psi, events })
    }

    #[allow(clippy::too_many_arguments, clippy::cast_precision_loss)]
    fn accept_run_set(
        session: &mut Session,
        config: &CalibrationConfig,
        limits: &SafetyLimits,
        store: &mut CalibrationStore,
        ceilings: &BTreeMap<BucketKey, f32>,
        run_target: f32,
        now_ms: u64,
        events: &mut Vec<CalibrationEvent>,
    ) {
        let runs = std::mem::take(&mut session.staged);
        let samples: u32 = runs.iter().map(|(_, samples)| samples).sum();
        let duty = runs.iter().map(|(duty, _)| duty).sum::<f32>() / runs.len().max(1) as f32;
        let Some(step) = session.current() else {
            return;
        };
        let from = session.phase;

        if session.phase == CalibrationPhase::Validating {
            session.validation_sets += 1;
            if let Some(confidence) = store.validate_point(
                step.key,
                duty,
                config.validation_step,
                config.validation_duty_tolerance,
                now_ms,
            ) {
                session.confidence = confidence;
                events.push(CalibrationEvent::Committed {
                    key: step.key,
                    duty,
                    confidence,
                });
            }
            if session.confidence + 1e-4 >= config.acceptance_confidence {
                session.phase = CalibrationPhase::Complete;
            } else if session.validation_sets >= config.max_validation_sets {
                session.phase = CalibrationPhase::Aborted;
            }
        } else {
            if run_target + 1e-3 >= step.psi
                && store.commit_calibration(step.key, duty, config.commit_confidence, samples, now_ms)
            {
                session.confidence = config.commit_confidence;
                events.push(CalibrationEvent::Committed {
                    key: step.key,
                    duty,
                    confidence: session.confidence,
                });
                if session.step + 1 < session.plan.len() {
                    session.step += 1;
                    if let Some(remembered) = session.current().and_then(|next| ceilings.get(&next.key)) {
                        session.ceiling_psi = session.ceiling_psi.min(*remembered);
                    }
                } else {
                    session.phase = CalibrationPhase::Validating;
                }
            }
            if session.phase != CalibrationPhase::Validating {
                session.phase = CalibrationPhase::Expanding;
                let needed = session
                    .current()
                    .map_or(0.0, |next| next.psi + config.ceiling_headroom_psi);
                if session.ceiling_psi < needed && session.ceiling_psi < limits.overboost_limit {
                    session.ceiling_psi = (session.ceiling_psi + config.ceiling_step_psi)
                        .min(limits.overboost_limit);
                    events.push(CalibrationEvent::CeilingRaised {
                        ceiling_psi: session.ceiling_psi,
                    });
                }
            }
        }

        if session.phase != from {
            info!(id = %session.id, ?from, to = ?session.phase, "calibration phase");
            events.push(CalibrationEvent::PhaseChanged {
                from,
                to: session.phase,
            });
        }
    }

    /// Aborts because the governor cut during the session. The staged runs
    /// are dropped, the store is not touched and the ceiling remembered for
    /// the current bucket is lowered.
    pub fn abort_on_safety(
        &mut self,
        reason: &str,
        limits: &SafetyLimits,
        now_ms: u64,
    ) -> Option<CalibrationReport> {
        let session = self.session.as_mut()?;
        if let Some(step) = session.current() {
            let floor = limits.spring_pressure + self.config.min_ceiling_above_spring;
            let reduced = (session.ceiling_psi - self.config.ceiling_reduction_psi).max(floor);
            let remembered = self.ceilings.entry(step.key).or_insert(reduced);
            *remembered = remembered.min(reduced);
            session.ceiling_psi = *remembered;
        }
        session.phase = CalibrationPhase::Aborted;
        Some(self.finish(now_ms, format!("safety cut: {reason}")))
    }

    /// Aborts on user request.
    pub fn abort(&mut self, now_ms: u64) -> Result<CalibrationReport, CommandError> {
        let session = self
            .session
            .as_mut()
            .ok_or(CommandError::NoCalibrationSession)?;
        session.phase = CalibrationPhase::Aborted;
        Ok(self.finish(now_ms, "aborted by command".into()))
    }

    fn finish(&mut self, now_ms: u64, reason: String) -> CalibrationReport {
        let report = self.session.take().map_or_else(
            || CalibrationReport {
                id: String::new(),
                request: CalibrationRequest {
                    target_rpm: 0.0,
                    target_boost: 0.0,
                },
                phase: CalibrationPhase::Aborted,
                reason: reason.clone(),
                confidence: 0.0,
                ceiling_psi: 0.0,
                at_ms: now_ms,
            },
            |session| CalibrationReport {
                id: session.id,
                request: session.request,
                phase: session.phase,
                reason: reason.clone(),
                confidence: session.confidence,
                ceiling_psi: session.ceiling_psi,
                at_ms: now_ms,
            },
        );
        info!(id = %report.id, phase = ?report.phase, reason = %report.reason, "calibration finished");
        self.last_report = Some(report.clone());
        report
    }
}

/// Boost buckets strictly between spring and the request, then the request
/// itself, all at the requested RPM bucket.
fn build_plan(store: &CalibrationStore, request: &CalibrationRequest, spring: f32) -> Vec<PlanStep> {
    let target_key = store.nearest(request.target_rpm, request.target_boost);
    let mut plan: Vec<PlanStep> = store
        .boost_buckets()
        .iter()
        .enumerate()
        .filter(|(_, psi)| **psi > spring && **psi < request.target_boost)
        .map(|(boost, psi)| PlanStep {
            key: BucketKey {
                rpm: target_key.rpm,
                boost,
            },
            psi: *psi,
        })
        .filter(|step| step.key != target_key)
        .collect();
    plan.push(PlanStep {
        key: target_key,
        psi: request.target_boost,
    });
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridConfig;

    fn setup() -> (AutoCalibrationEngine, SafetyLimits, CalibrationStore) {
        let limits = SafetyLimits::default();
        let store = CalibrationStore::new(&GridConfig::default(), limits.spring_pressure).unwrap();
        (
            AutoCalibrationEngine::new(CalibrationConfig::default()),
            limits,
            store,
        )
    }

    fn request(boost: f32) -> CalibrationRequest {
        CalibrationRequest {
            target_rpm: 3500.0,
            target_boost: boost,
        }
    }

    #[test]
    fn start_validates_request() {
        let (mut engine, limits, store) = setup();
        let low_rpm = CalibrationRequest {
            target_rpm: 500.0,
            target_boost: 7.0,
        };
        assert!(matches!(
            engine.start(low_rpm, &limits, &store, 0),
            Err(CommandError::InvalidRange {
                field: "target_rpm",
                ..
            })
        ));
        assert!(engine.start(request(4.0), &limits, &store, 0).is_err());
        assert!(engine.start(request(12.0), &limits, &store, 0).is_err());
        let status = engine.start(request(7.0), &limits, &store, 0).unwrap();
        assert_eq!(status.phase, CalibrationPhase::Bootstrapping);
        assert!((status.ceiling_psi - 6.0).abs() < f32::EPSILON);
        assert_eq!(
            engine.start(request(7.0), &limits, &store, 0),
            Err(CommandError::CalibrationInProgress)
        );
    }

    #[test]
    fn ideal_plant_progresses_to_complete() {
        let (mut engine, limits, mut store) = setup();
        engine.start(request(7.0), &limits, &store, 0).unwrap();
        let mut measured = limits.spring_pressure;
        let mut phases = vec![CalibrationPhase::Bootstrapping];
        let mut report = None;
        for cycle in 1..20_000u64 {
            let step = engine
                .tick(
                    &CalibrationTick {
                        rpm: 3500.0,
                        measured_psi: Some(measured),
                        applied_duty: 0.3,
                        now_ms: cycle * 10,
                    },
                    &limits,
                    &mut store,
                )
                .unwrap();
            // Ideal plant: boost follows the target, never below spring.
            measured = step.target_psi.max(limits.spring_pressure);
            for event in step.events {
                match event {
                    CalibrationEvent::PhaseChanged { to, .. } => phases.push(to),
                    CalibrationEvent::Finished(done) => report = Some(done),
                    _ => {}
                }
            }
            if report.is_some() {
                break;
            }
        }
        let report = report.unwrap();
        assert_eq!(report.phase, CalibrationPhase::Complete);
        assert_eq!(
            phases,
            vec![
                CalibrationPhase::Bootstrapping,
                CalibrationPhase::Expanding,
                CalibrationPhase::Validating,
                CalibrationPhase::Complete,
            ]
        );
        let key = store.nearest(3500.0, 7.0);
        let point = store.point(key).unwrap();
        assert!(point.confidence >= 0.8 - 1e-4);
        assert!((point.baseline_duty - 0.3).abs() < 1e-4);
        assert!(!engine.is_active());
    }

    #[test]
    fn safety_abort_leaves_store_and_lowers_ceiling() {
        let (mut engine, limits, mut store) = setup();
        engine.start(request(7.0), &limits, &store, 0).unwrap();
        let before = store.to_bytes().unwrap();
        let first = store.nearest(3500.0, 6.0);
        // Rest, then a run that gets one in-tolerance sample staged.
        for cycle in 1..=160u64 {
            engine.tick(
                &CalibrationTick {
                    rpm: 3500.0,
                    measured_psi: Some(5.25),
                    applied_duty: 0.1,
                    now_ms: cycle * 10,
                },
                &limits,
                &mut store,
            );
        }
        let report = engine.abort_on_safety("overboost", &limits, 1_610).unwrap();
        assert_eq!(report.phase, CalibrationPhase::Aborted);
        assert!(report.reason.contains("overboost"));
        assert!(!engine.is_active());
        assert_eq!(store.to_bytes().unwrap(), before);
        let remembered = engine.remembered_ceiling(first).unwrap();
        assert!(remembered < limits.spring_pressure + 1.0);
        // A new session starts from the remembered, lower ceiling.
        let status = engine.start(request(7.0), &limits, &store, 2_000).unwrap();
        assert!((status.ceiling_psi - remembered).abs() < f32::EPSILON);
        assert_eq!(status.phase, CalibrationPhase::Bootstrapping);
    }

    #[test]
    fn unreachable_target_gives_up() {
        let (mut engine, limits, mut store) = setup();
        let config = CalibrationConfig::default();
        engine.start(request(7.0), &limits, &store, 0).unwrap();
        let mut finished = None;
        for cycle in 1..100_000u64 {
            let step = engine
                .tick(
                    &CalibrationTick {
                        rpm: 3500.0,
                        measured_psi: Some(0.0),
                        applied_duty: 0.0,
                        now_ms: cycle * 10,
                    },
                    &limits,
                    &mut store,
                )
                .unwrap();
            if let Some(CalibrationEvent::Finished(report)) = step.events.last() {
                finished = Some(report.clone());
                break;
            }
        }
        let report = finished.unwrap();
        assert_eq!(report.phase, CalibrationPhase::Aborted);
        assert!(report.reason.contains(&config.max_failures.to_string()));
    }

    #[test]
    fn off_rpm_commands_zero() {
        let (mut engine, limits, mut store) = setup();
        engine.start(request(7.0), &limits, &store, 0).unwrap();
        for cycle in 1..500u64 {
            let step = engine
                .tick(
                    &CalibrationTick {
                        rpm: 2000.0,
                        measured_psi: Some(5.0),
                        applied_duty: 0.0,
                        now_ms: cycle * 10,
                    },
                    &limits,
                    &mut store,
                )
                .unwrap();
            assert!(step.target_psi.abs() < f32::EPSILON);
        }
    }

    #[test]
    fn abort_without_session_is_an_error() {
        let (mut engine, _, _) = setup();
        assert_eq!(engine.abort(0), Err(CommandError::NoCalibrationSession));
    }
}
