// src/controller/cycle.rs - Pick/place cycle executor
//
// State machine: Idle -> Running -> {Paused, Stopping} -> Idle. Pause and
// stop are cooperative flags read at hook boundaries only; a pick/place
// sequence in flight always runs to completion, because the firmware exposes
// no mid-move abort. Whatever way the loop exits, suction is shut off and the
// arm is sent home.

use super::{ArmController, ControllerError};
use crate::protocol;
use std::sync::atomic::Ordering;
use tokio::time::sleep;

/// Events published by a running cycle. Front ends subscribe via
/// [`ArmController::events`] instead of handing callbacks into the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleEvent {
    /// A labeled step inside a pick or place sequence.
    Status(String),
    /// One pick/place pair finished.
    Progress { completed: usize, total: usize },
    /// The cycle honored a stop request at a hook boundary.
    Stopped,
    /// The cycle is over and cleanup has run, whatever the outcome.
    Finished,
}

impl ArmController {
    /// Run one pick/place pass over every taught hook in order.
    ///
    /// Aborts the loop on the first failed pick or place; cleanup (suction
    /// off, home) runs unconditionally before the error is returned.
    pub async fn run_full_cycle(&mut self) -> Result<(), ControllerError> {
        self.begin_run()?;
        tracing::info!("Starting full cycle over {} hooks", self.store.taught().hooks.len());
        let result = self.cycle_loop().await;
        self.cleanup_after_cycle(true).await;
        self.running.store(false, Ordering::SeqCst);
        self.emit(CycleEvent::Finished);
        if let Err(e) = &result {
            tracing::warn!("Cycle aborted: {}", e);
        }
        result
    }

    /// Run exactly one pick/place pair against the given hook. Cleanup turns
    /// suction off but does not force a home.
    pub async fn test_single_hook(&mut self, index: usize) -> Result<(), ControllerError> {
        self.begin_run()?;
        self.emit(CycleEvent::Status(format!("testing hook {index}")));
        let result = self.single_pair(index).await;
        self.cleanup_after_cycle(false).await;
        self.running.store(false, Ordering::SeqCst);
        self.emit(CycleEvent::Finished);
        result
    }

    fn begin_run(&mut self) -> Result<(), ControllerError> {
        if !self.is_connected() {
            return Err(ControllerError::NotConnected);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ControllerError::Busy);
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn cycle_loop(&mut self) -> Result<(), ControllerError> {
        // Smoothed straight-line interpolation for the transit moves.
        self.send_acked(protocol::STRAIGHT_LINE_MODE).await?;

        let total = self.store.taught().hooks.len();
        for index in 0..total {
            if self.stop_boundary() {
                break;
            }
            // Paused: spin at a bounded poll interval until resumed or
            // stopped. No work is in flight while we sit here.
            while self.pause_requested.load(Ordering::SeqCst) {
                if self.stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                sleep(self.config.timing.pause_poll()).await;
            }
            if self.stop_boundary() {
                break;
            }

            self.emit(CycleEvent::Status(format!("blade {}/{}", index + 1, total)));
            self.single_pair(index).await?;
            self.emit(CycleEvent::Progress {
                completed: index + 1,
                total,
            });
        }
        Ok(())
    }

    fn stop_boundary(&mut self) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) {
            tracing::info!("Stop requested, halting at hook boundary");
            self.emit(CycleEvent::Stopped);
            true
        } else {
            false
        }
    }

    async fn single_pair(&mut self, index: usize) -> Result<(), ControllerError> {
        self.pick_blade().await?;
        self.place_blade(index).await
    }

    /// Pick sequence. The ordering is mechanically load-bearing: suction must
    /// already be pulling before the nozzle touches the blade, and every move
    /// is fenced with `M400` so the next step starts from a resting arm.
    pub(crate) async fn pick_blade(&mut self) -> Result<(), ControllerError> {
        let pick = self.store.taught().pick.clone().ok_or(ControllerError::PickNotSet)?;
        let safe_z = self.store.taught().safe_z;

        self.emit(CycleEvent::Status("pick".to_string()));

        self.emit(CycleEvent::Status("moving above pick".to_string()));
        self.move_to(pick.x, pick.y, safe_z).await?;
        self.wait_for_motion().await?;

        self.emit(CycleEvent::Status("suction on".to_string()));
        self.suction_grab().await?;

        self.emit(CycleEvent::Status("lowering".to_string()));
        self.move_z(pick.z).await?;
        self.wait_for_motion().await?;
        sleep(self.config.timing.suction_grab_delay()).await;

        self.emit(CycleEvent::Status("lifting".to_string()));
        self.move_z(safe_z).await?;
        self.wait_for_motion().await
    }

    /// Place sequence: air pressure is vented and the pump stopped while the
    /// nozzle is still at hook depth, so the blade hangs on the hook rather
    /// than following the arm up.
    pub(crate) async fn place_blade(&mut self, index: usize) -> Result<(), ControllerError> {
        let hook = self
            .store
            .taught()
            .hooks
            .get(index)
            .cloned()
            .ok_or(ControllerError::NoSuchHook(index))?;
        let safe_z = self.store.taught().safe_z;

        self.emit(CycleEvent::Status(format!("place (hook {index})")));

        self.emit(CycleEvent::Status("moving above hook".to_string()));
        self.move_to(hook.x, hook.y, safe_z).await?;
        self.wait_for_motion().await?;

        self.emit(CycleEvent::Status("lowering".to_string()));
        self.move_z(hook.z).await?;
        self.wait_for_motion().await?;

        self.emit(CycleEvent::Status("releasing".to_string()));
        self.suction_release().await?;
        sleep(self.config.timing.pump_stop_settle()).await;

        self.emit(CycleEvent::Status("lifting".to_string()));
        self.move_z(safe_z).await?;
        self.wait_for_motion().await
    }

    /// Best-effort cleanup after any cycle exit: suction off, optionally
    /// home. Failures are logged, not propagated, so they cannot mask the
    /// error that ended the cycle.
    async fn cleanup_after_cycle(&mut self, home: bool) {
        if let Err(e) = self.suction_off().await {
            tracing::warn!("Cleanup: failed to stop suction pump: {}", e);
        }
        if home {
            if let Err(e) = self.go_home().await {
                tracing::warn!("Cleanup: failed to home the arm: {}", e);
            }
        }
    }
}
