use std::time::{Duration, Instant};

use tokio::{
    sync::{mpsc, oneshot, watch},
    time::MissedTickBehavior,
};
use tracing::{info, warn};

use crate::{
    controller::{BoostController, Command, CommandOutcome, CycleReport, StatusBoard, StatusSnapshot},
    error::CommandError,
    sample::SampleExchange,
};

const COMMAND_QUEUE: usize = 32;

/// Monotonic loop clock shared with the producers stamping frames.
#[derive(Debug, Clone, Copy)]
pub struct LoopClock {
    start: Instant,
}

impl LoopClock {
    /// Starts a clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Milliseconds since the clock started.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for LoopClock {
    fn default() -> Self {
        Self::new()
    }
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<CommandOutcome, CommandError>>,
}

/// Client side of a running control loop.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Request>,
    board: StatusBoard,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl ControllerHandle {
    /// Validates `command` and waits for it to be applied at the next cycle
    /// boundary.
    pub async fn send(&self, command: Command) -> Result<CommandOutcome, CommandError> {
        command.validate()?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { command, reply })
            .await
            .map_err(|_| CommandError::Closed)?;
        rx.await.map_err(|_| CommandError::Closed)?
    }

    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        self.board.snapshot()
    }
}

/// Fixed-rate control loop around a [`BoostController`].
#[derive(Debug)]
pub struct ControlRuntime {
    controller: BoostController,
    exchange: SampleExchange,
    commands: mpsc::Receiver<Request>,
    board: StatusBoard,
    clock: LoopClock,
    period: Duration,
}

impl ControlRuntime {
    /// Wraps a controller reading inputs from `exchange`. Producers must
    /// stamp frames with `clock`.
    #[must_use]
    pub fn new(
        controller: BoostController,
        exchange: SampleExchange,
        clock: LoopClock,
        loop_hz: u32,
    ) -> (Self, ControllerHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let board = StatusBoard::new();
        let handle = ControllerHandle {
            tx,
            board: board.clone(),
        };
        let runtime = Self {
            controller,
            exchange,
            commands,
            board,
            clock,
            period: Duration::from_secs(1) / loop_hz.max(1),
        };
        (runtime, handle)
    }

    /// Applies queued commands, runs one cycle and publishes status.
    pub fn step(&mut self, now_ms: u64) -> CycleReport {
        while let Ok(Request { command, reply }) = self.commands.try_recv() {
            let outcome = self.controller.apply(command, now_ms);
            let _ = reply.send(outcome);
        }
        let inputs = self.exchange.snapshot();
        let report = self.controller.run_cycle(&inputs, now_ms);
        self.board.publish(self.controller.status());
        report
    }

    /// Ticks until `shutdown` flips, then stages every record and returns
    /// the controller.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> BoostController {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let overrun = self.period.mul_f32(1.5);
        info!(period_ms = self.period.as_millis(), "control loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let started = Instant::now();
            let report = self.step(self.clock.now_ms());
            let elapsed = started.elapsed();
            if elapsed > overrun {
                warn!(
                    cycle = report.cycle,
                    elapsed_us = elapsed.as_micros(),
                    period_us = self.period.as_micros(),
                    "control cycle overran"
                );
            }
        }
        self.controller.stage_all();
        info!("control loop stopped");
        self.controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ControllerConfig,
        fault::FaultState,
        fusion::psi_to_millivolts,
        sample::{BusTelemetry, RawSensorFrame},
    };

    fn runtime() -> (ControlRuntime, ControllerHandle, SampleExchange) {
        let controller = BoostController::builder(ControllerConfig::default())
            .build()
            .unwrap();
        let exchange = SampleExchange::new();
        let (runtime, handle) =
            ControlRuntime::new(controller, exchange.clone(), LoopClock::new(), 100);
        (runtime, handle, exchange)
    }

    fn publish(exchange: &SampleExchange, now_ms: u64) {
        exchange.publish_bus(BusTelemetry {
            rpm: 3000.0,
            desired_torque: 300.0,
            actual_torque: 300.0,
            map_kpa: None,
            intake_air_temp_c: None,
            baro_kpa: None,
            timestamp_ms: now_ms,
            stale: false,
        });
        exchange.publish_sensors(RawSensorFrame {
            manifold_mv: psi_to_millivolts(1.0),
            dome_input_mv: psi_to_millivolts(15.0),
            dome_upper_mv: psi_to_millivolts(0.0),
            timestamp_ms: now_ms,
        });
    }

    #[tokio::test]
    async fn commands_apply_at_the_next_step() {
        let (mut runtime, handle, exchange) = runtime();
        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(Command::SetAggression { value: 0.8 }).await }
        });
        tokio::task::yield_now().await;
        publish(&exchange, 10);
        runtime.step(10);
        let outcome = pending.await.unwrap();
        assert_eq!(outcome, Ok(CommandOutcome::Applied));
        let status = handle.status();
        assert!((status.aggression - 0.8).abs() < f32::EPSILON);
        assert_eq!(status.fault_state, FaultState::Nominal);
        assert_eq!(status.cycle, 1);
    }

    #[tokio::test]
    async fn invalid_commands_fail_before_queueing() {
        let (_runtime, handle, _exchange) = runtime();
        let err = handle
            .send(Command::SetAggression { value: -0.1 })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn closed_runtime_reports_closed() {
        let (runtime, handle, _exchange) = runtime();
        drop(runtime);
        assert_eq!(
            handle.send(Command::ResetTrims).await,
            Err(CommandError::Closed)
        );
    }

    #[tokio::test]
    async fn run_loop_ticks_until_shutdown() {
        let (runtime, handle, exchange) = runtime();
        let clock = runtime.clock;
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(runtime.run(shutdown));
        for _ in 0..10 {
            publish(&exchange, clock.now_ms());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.send(true).unwrap();
        let controller = task.await.unwrap();
        assert!(handle.status().cycle > 0);
        assert_eq!(controller.governor().state(), crate::governor::GovernorState::Armed);
    }
}
