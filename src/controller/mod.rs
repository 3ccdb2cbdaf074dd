// src/controller/mod.rs - Arm controller: connection, motion, teaching, tracking
mod cycle;
#[cfg(test)]
mod cycle_tests;

pub use cycle::CycleEvent;

use crate::config::Config;
use crate::protocol::{self, AckPolicy, Axis};
use crate::store::{Position, PositionStore, StoreError, TaughtSet};
use crate::transport::{SerialLink, SerialTransport, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// The arm's rest pose after `M1112` homing.
const HOME_POSITION: TrackedPosition = TrackedPosition {
    x: 0.0,
    y: 300.0,
    z: 0.0,
};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("not connected to the arm")]
    NotConnected,
    #[error("a cycle is running; teaching and manual motion are locked out")]
    Busy,
    #[error("pick position has not been taught")]
    PickNotSet,
    #[error("no hook at index {0}")]
    NoSuchHook(usize),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Best-known Cartesian position of the arm.
///
/// Optimistically tracked: overwritten after each commanded move, and
/// resynced from hardware via `M114` or the encoder. The two sources are
/// reconciled last-write-wins only; there is no conflict detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for TrackedPosition {
    fn default() -> Self {
        HOME_POSITION
    }
}

/// Cross-task control surface for a running cycle.
///
/// The controller itself is single-owner: exactly one task drives the serial
/// link and the cycle. A second task may hold a handle and set these flags;
/// the cycle reads them at hook boundaries. This is the only concurrent
/// interaction the design supports.
#[derive(Debug, Clone)]
pub struct CycleHandle {
    running: Arc<AtomicBool>,
    pause_requested: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
}

impl CycleHandle {
    pub fn pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    /// Request a stop. Takes effect at the next hook boundary; a pick/place
    /// sequence already in flight always runs to completion because the
    /// protocol exposes no mid-move abort.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }
}

/// Host-side controller for the blade loader arm.
pub struct ArmController {
    config: Config,
    link: Option<Box<dyn SerialLink>>,
    store: PositionStore,
    current: TrackedPosition,
    running: Arc<AtomicBool>,
    pause_requested: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    events: Option<mpsc::UnboundedSender<CycleEvent>>,
}

impl ArmController {
    pub fn new(config: Config) -> Self {
        let store = PositionStore::load(&config.positions_file);
        Self {
            config,
            link: None,
            store,
            current: TrackedPosition::default(),
            running: Arc::new(AtomicBool::new(false)),
            pause_requested: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            events: None,
        }
    }

    // --- Connection ---

    /// Open the serial link. Failure is returned, not fatal; the caller may
    /// pick another port and retry.
    pub async fn connect(&mut self, port: &str) -> Result<(), ControllerError> {
        let transport = SerialTransport::open(port, self.config.serial.baud).await?;
        // The arm resets when the port opens; let it boot before talking.
        sleep(Duration::from_millis(self.config.serial.connect_settle_ms)).await;
        self.link = Some(Box::new(transport));
        tracing::info!("Connected to arm on {}", port);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.link.take().is_some() {
            tracing::info!("Disconnected from arm");
        }
    }

    /// Swap in a non-serial link (simulator, test double).
    pub fn attach_link(&mut self, link: Box<dyn SerialLink>) {
        self.link = Some(link);
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    // --- State accessors ---

    pub fn position(&self) -> TrackedPosition {
        self.current
    }

    pub fn taught(&self) -> &TaughtSet {
        self.store.taught()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Control handle for pausing/resuming/stopping a cycle from another task.
    pub fn handle(&self) -> CycleHandle {
        CycleHandle {
            running: self.running.clone(),
            pause_requested: self.pause_requested.clone(),
            stop_requested: self.stop_requested.clone(),
        }
    }

    /// Subscribe to cycle progress and status events. Replaces any previous
    /// subscriber.
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<CycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub(crate) fn emit(&self, event: CycleEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver just means nobody is listening.
            let _ = tx.send(event);
        }
    }

    // --- Low-level exchange helpers ---

    fn ack_policy(&self) -> AckPolicy {
        AckPolicy {
            timeout: Duration::from_millis(self.config.serial.ack_timeout_ms),
            poll: Duration::from_millis(self.config.serial.ack_poll_ms),
        }
    }

    fn link_mut(&mut self) -> Result<&mut (dyn SerialLink + '_), ControllerError> {
        match self.link.as_mut() {
            Some(link) => Ok(link.as_mut()),
            None => Err(ControllerError::NotConnected),
        }
    }

    /// Send one command and wait for its acknowledgement.
    pub(crate) async fn send_acked(&mut self, command: &str) -> Result<(), ControllerError> {
        let policy = self.ack_policy();
        let link = self.link_mut()?;
        protocol::send(link, command, &policy).await?;
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), ControllerError> {
        if self.is_running() {
            Err(ControllerError::Busy)
        } else {
            Ok(())
        }
    }

    // --- Basic motion ---

    /// Absolute move at the cycle feedrate; tracked position is updated
    /// optimistically once the command is acknowledged.
    pub(crate) async fn move_to(&mut self, x: f64, y: f64, z: f64) -> Result<(), ControllerError> {
        let command = protocol::move_to(self.config.motion.feedrate, x, y, z);
        self.send_acked(&command).await?;
        self.current = TrackedPosition { x, y, z };
        Ok(())
    }

    /// Z-only move, X and Y held.
    pub(crate) async fn move_z(&mut self, z: f64) -> Result<(), ControllerError> {
        let command = protocol::move_z(self.config.motion.feedrate, z);
        self.send_acked(&command).await?;
        self.current.z = z;
        Ok(())
    }

    /// Block until the firmware's motion queue drains. Issued after every
    /// cycle move: the transport has no independent motion-complete event, so
    /// this is the only way to know the arm is physically at rest.
    pub(crate) async fn wait_for_motion(&mut self) -> Result<(), ControllerError> {
        self.send_acked(protocol::WAIT_MOTION_DONE).await
    }

    /// Home the arm and reset the tracked position to the rest pose.
    pub async fn go_home(&mut self) -> Result<(), ControllerError> {
        self.send_acked(protocol::GO_HOME).await?;
        sleep(Duration::from_millis(self.config.timing.home_settle_ms)).await;
        self.current = HOME_POSITION;
        Ok(())
    }

    /// Select the pneumatic front module; suction commands are ignored by the
    /// firmware until this has been sent.
    pub async fn select_pneumatic(&mut self) -> Result<(), ControllerError> {
        let command = protocol::select_module(protocol::MODULE_PNEUMATIC);
        self.send_acked(&command).await?;
        sleep(Duration::from_millis(self.config.timing.module_settle_ms)).await;
        Ok(())
    }

    /// Relative single-axis nudge at the jog feedrate.
    pub async fn jog(&mut self, axis: Axis, distance: f64) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        self.send_acked(protocol::RELATIVE_MODE).await?;
        let command = protocol::jog_axis(self.config.motion.jog_feedrate, axis, distance);
        self.send_acked(&command).await?;
        self.send_acked(protocol::ABSOLUTE_MODE).await?;
        match axis {
            Axis::X => self.current.x += distance,
            Axis::Y => self.current.y += distance,
            Axis::Z => self.current.z += distance,
        }
        Ok(())
    }

    // --- Free-move (hand teaching) ---

    /// Disengage the motors so the arm can be dragged by hand.
    pub async fn enable_free_move(&mut self) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        self.send_acked(protocol::MOTORS_OFF).await
    }

    /// Re-engage the motors, locking the arm in place.
    pub async fn disable_free_move(&mut self) -> Result<(), ControllerError> {
        self.send_acked(protocol::MOTORS_ON).await
    }

    // --- Suction ---

    pub async fn suction_grab(&mut self) -> Result<(), ControllerError> {
        self.send_acked(protocol::SUCTION_ON).await?;
        sleep(self.config.timing.suction_grab_delay()).await;
        Ok(())
    }

    /// Release: vent air pressure first, then stop the pump.
    pub async fn suction_release(&mut self) -> Result<(), ControllerError> {
        self.send_acked(protocol::SUCTION_RELEASE).await?;
        sleep(self.config.timing.suction_release_delay()).await;
        self.send_acked(protocol::SUCTION_PUMP_STOP).await
    }

    pub async fn suction_off(&mut self) -> Result<(), ControllerError> {
        self.send_acked(protocol::SUCTION_PUMP_STOP).await
    }

    // --- Position tracking ---

    /// Resync the tracked position from an `M114` report.
    ///
    /// An unparseable or missing report leaves the tracked position untouched
    /// (stale but safe); only transport faults are surfaced.
    pub async fn sync_cartesian(&mut self) -> Result<(), ControllerError> {
        let policy = self.ack_policy();
        let link = self.link_mut()?;
        let lines = protocol::exchange(link, protocol::REPORT_POSITION, &policy).await?;

        // The report can precede the ack or ride on the same line.
        for line in &lines {
            if let Ok((x, y, z)) = protocol::parse_position_report(line) {
                self.current = TrackedPosition { x, y, z };
                return Ok(());
            }
        }
        // Some firmware builds emit the report just after the ack.
        let poll = policy.poll;
        let link = self.link_mut()?;
        if let Some(line) = link.read_line(poll).await? {
            if let Ok((x, y, z)) = protocol::parse_position_report(&line) {
                self.current = TrackedPosition { x, y, z };
                return Ok(());
            }
        }
        tracing::warn!("Position report unparseable, keeping last known position");
        Ok(())
    }

    /// Query the magnetic encoders via `M893` and return the raw report line.
    ///
    /// Stale input is drained first so an old report cannot satisfy the wait.
    /// Bounded polling: gives up with `EncoderTimeout` instead of hanging on
    /// a quiet line.
    pub async fn read_encoder(&mut self) -> Result<String, ControllerError> {
        let attempts = self.config.timing.encoder_poll_attempts;
        let poll = self.config.timing.encoder_poll();
        let link = self.link_mut()?;

        link.clear_input();
        link.write_line(protocol::REPORT_ENCODER).await?;

        for _ in 0..attempts {
            match link.read_line(poll).await? {
                Some(line) if protocol::is_encoder_report(&line) => return Ok(line),
                Some(line) => {
                    tracing::debug!("Ignoring non-encoder line while waiting: {}", line);
                }
                None => sleep(poll).await,
            }
        }
        Err(protocol::ProtocolError::EncoderTimeout { attempts }.into())
    }

    /// Read the encoders and merge the result into the tracked position.
    /// Axes absent from the report keep their previous value.
    pub async fn sync_from_encoder(&mut self) -> Result<(), ControllerError> {
        match self.read_encoder().await {
            Ok(raw) => {
                let readout = protocol::parse_encoder_report(&raw);
                if let Some(x) = readout.x {
                    self.current.x = x;
                }
                if let Some(y) = readout.y {
                    self.current.y = y;
                }
                if let Some(z) = readout.z {
                    self.current.z = z;
                }
                Ok(())
            }
            Err(ControllerError::Protocol(e)) => {
                tracing::warn!("Encoder sync failed ({}), keeping last known position", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // --- Teaching ---

    /// Capture the current pose as the pick point. Samples `M114` for display
    /// coordinates and the encoder for an exact replay token.
    pub async fn set_pick(&mut self) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        let position = self.sample_position(true).await?;
        self.store.set_pick(position)?;
        tracing::info!("Pick position taught");
        Ok(())
    }

    /// Capture the current Z as the safe transit height. Cartesian only; the
    /// safe height is always revisited as a coordinate, never replayed.
    pub async fn set_safe_z(&mut self) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        self.sync_cartesian().await?;
        self.store.set_safe_z(self.current.z)?;
        tracing::info!("Safe height taught: Z{:.2}", self.current.z);
        Ok(())
    }

    /// Capture the current pose as a new hook and return its index.
    pub async fn add_hook(&mut self) -> Result<usize, ControllerError> {
        self.ensure_idle()?;
        let position = self.sample_position(true).await?;
        let index = self.store.add_hook(position)?;
        tracing::info!("Hook {} taught", index);
        Ok(index)
    }

    pub fn delete_hook(&mut self, index: usize) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        self.store.delete_hook(index)?;
        Ok(())
    }

    pub fn clear_hooks(&mut self) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        self.store.clear_hooks()?;
        Ok(())
    }

    async fn sample_position(&mut self, with_encoder: bool) -> Result<Position, ControllerError> {
        self.sync_cartesian().await?;
        let encoder = if with_encoder {
            // A missed encoder read degrades the waypoint to Cartesian-only
            // rather than failing the teach.
            match self.read_encoder().await {
                Ok(raw) => Some(raw),
                Err(ControllerError::Protocol(e)) => {
                    tracing::warn!("No encoder capture for taught position: {}", e);
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        Ok(Position {
            x: self.current.x,
            y: self.current.y,
            z: self.current.z,
            encoder,
        })
    }

    // --- Revisiting taught positions ---

    /// Move to a taught waypoint. An encoder replay token takes priority over
    /// the Cartesian coordinates because it reproduces the exact joint
    /// configuration captured at teach time.
    pub(crate) async fn go_to_position(&mut self, position: &Position) -> Result<(), ControllerError> {
        let replay = position
            .encoder
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty());
        match replay {
            Some(token) => {
                let command = protocol::normalize_replay(token);
                self.send_acked(&command).await?;
                self.wait_for_motion().await?;
                sleep(Duration::from_millis(self.config.timing.replay_settle_ms)).await;
                // The replay bypasses Cartesian tracking; resync from M114.
                self.sync_cartesian().await
            }
            None => self.move_to(position.x, position.y, position.z).await,
        }
    }

    pub async fn go_to_pick(&mut self) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        let pick = self.store.taught().pick.clone().ok_or(ControllerError::PickNotSet)?;
        self.go_to_position(&pick).await
    }

    pub async fn go_to_hook(&mut self, index: usize) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        let hook = self
            .store
            .taught()
            .hooks
            .get(index)
            .cloned()
            .ok_or(ControllerError::NoSuchHook(index))?;
        self.go_to_position(&hook).await
    }

    /// Lift straight to the safe transit height.
    pub async fn go_to_safe_z(&mut self) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        let safe_z = self.store.taught().safe_z;
        self.move_to(self.current.x, self.current.y, safe_z).await
    }
}

impl std::fmt::Debug for ArmController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmController")
            .field("connected", &self.is_connected())
            .field("running", &self.is_running())
            .field("current", &self.current)
            .finish()
    }
}
