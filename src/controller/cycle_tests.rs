//! Cycle executor tests over a scripted in-memory serial link.

use super::*;
use crate::config::{Config, SerialConfig, TimingConfig};
use crate::protocol;
use crate::store::{Position, TaughtSet};
use crate::transport::{SerialLink, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Clone, Copy)]
enum Trigger {
    Stop,
    Pause,
}

/// Scripted stand-in for the serial port: records every command line and
/// answers the way the arm firmware would. Optionally flips a cycle control
/// flag the first time a given command goes out, which lets tests exercise
/// pause/stop without racing a second thread against the executor.
struct MockLink {
    sent: Arc<Mutex<Vec<String>>>,
    pending: VecDeque<String>,
    trigger: Option<(&'static str, Trigger, CycleHandle)>,
    fired: bool,
    /// Reply to `M893`; `None` simulates a silent encoder.
    encoder_reply: Option<String>,
}

impl MockLink {
    fn new(sent: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            sent,
            pending: VecDeque::new(),
            trigger: None,
            fired: false,
            encoder_reply: Some("M894 X1234 Y2345 Z3456".to_string()),
        }
    }
}

#[async_trait]
impl SerialLink for MockLink {
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(line.to_string());

        if let Some((needle, action, handle)) = &self.trigger {
            if !self.fired && line.contains(needle) {
                match action {
                    Trigger::Stop => handle.stop(),
                    Trigger::Pause => handle.pause(),
                }
                self.fired = true;
            }
        }

        if line.starts_with(protocol::REPORT_POSITION) {
            self.pending.push_back("X:10.00 Y:20.00 Z:5.00 E:0.00".to_string());
            self.pending.push_back("ok".to_string());
        } else if line.starts_with(protocol::REPORT_ENCODER) {
            if let Some(reply) = &self.encoder_reply {
                self.pending.push_back(reply.clone());
            }
        } else {
            self.pending.push_back("ok".to_string());
        }
        Ok(())
    }

    async fn read_line(&mut self, _wait: Duration) -> Result<Option<String>, TransportError> {
        Ok(self.pending.pop_front())
    }

    fn clear_input(&mut self) {
        self.pending.clear();
    }
}

fn fast_config(dir: &tempfile::TempDir) -> Config {
    Config {
        serial: SerialConfig {
            ack_timeout_ms: 500,
            ack_poll_ms: 1,
            connect_settle_ms: 0,
            ..SerialConfig::default()
        },
        timing: TimingConfig {
            suction_grab_delay_ms: 0,
            suction_release_delay_ms: 0,
            pump_stop_settle_ms: 0,
            module_settle_ms: 0,
            home_settle_ms: 0,
            replay_settle_ms: 0,
            encoder_poll_attempts: 3,
            encoder_poll_ms: 1,
            pause_poll_ms: 5,
        },
        positions_file: dir
            .path()
            .join("positions.json")
            .to_string_lossy()
            .into_owned(),
        ..Config::default()
    }
}

fn two_hook_set() -> TaughtSet {
    TaughtSet {
        pick: Some(Position::cartesian(10.0, 20.0, 5.0)),
        safe_z: 50.0,
        hooks: vec![
            Position::cartesian(30.0, 40.0, 5.0),
            Position::cartesian(35.0, 40.0, 5.0),
        ],
    }
}

fn seed_positions(path: &str, set: &TaughtSet) {
    std::fs::write(Path::new(path), serde_json::to_string_pretty(set).unwrap()).unwrap();
}

/// Build a connected controller over a mock link, seeded with `set`.
fn rig(
    dir: &tempfile::TempDir,
    set: &TaughtSet,
    trigger: Option<(&'static str, Trigger)>,
) -> (ArmController, Arc<Mutex<Vec<String>>>) {
    let config = fast_config(dir);
    seed_positions(&config.positions_file, set);

    let mut controller = ArmController::new(config);
    let sent = Arc::new(Mutex::new(Vec::new()));
    let mut link = MockLink::new(sent.clone());
    if let Some((needle, action)) = trigger {
        link.trigger = Some((needle, action, controller.handle()));
    }
    controller.attach_link(Box::new(link));
    (controller, sent)
}

fn sent_lines(sent: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    sent.lock().unwrap().clone()
}

fn drain(rx: &mut UnboundedReceiver<CycleEvent>) -> Vec<CycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn progress_pairs(events: &[CycleEvent]) -> Vec<(usize, usize)> {
    events
        .iter()
        .filter_map(|e| match e {
            CycleEvent::Progress { completed, total } => Some((*completed, *total)),
            _ => None,
        })
        .collect()
}

fn pick_place_pair(hook_x: f64, hook_y: f64) -> Vec<String> {
    vec![
        // pick
        "G1 F3000 X10.00 Y20.00 Z50.00".to_string(),
        "M400".to_string(),
        "M1000".to_string(),
        "G1 F3000 Z5.00".to_string(),
        "M400".to_string(),
        "G1 F3000 Z50.00".to_string(),
        "M400".to_string(),
        // place
        format!("G1 F3000 X{hook_x:.2} Y{hook_y:.2} Z50.00"),
        "M400".to_string(),
        "G1 F3000 Z5.00".to_string(),
        "M400".to_string(),
        "M1002".to_string(),
        "M1003".to_string(),
        "G1 F3000 Z50.00".to_string(),
        "M400".to_string(),
    ]
}

#[tokio::test]
async fn full_cycle_issues_exact_command_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, sent) = rig(&dir, &two_hook_set(), None);

    controller.run_full_cycle().await.unwrap();

    let mut expected = vec!["M2000".to_string()];
    expected.extend(pick_place_pair(30.0, 40.0));
    expected.extend(pick_place_pair(35.0, 40.0));
    expected.push("M1003".to_string());
    expected.push("M1112".to_string());
    assert_eq!(sent_lines(&sent), expected);
}

#[tokio::test]
async fn suction_ordering_within_a_pair() {
    let dir = tempfile::tempdir().unwrap();
    let set = TaughtSet {
        hooks: vec![Position::cartesian(30.0, 40.0, 5.0)],
        ..two_hook_set()
    };
    let (mut controller, sent) = rig(&dir, &set, None);

    controller.run_full_cycle().await.unwrap();

    let lines = sent_lines(&sent);
    let suction_on = lines.iter().position(|l| l == "M1000").unwrap();
    let first_lower = lines.iter().position(|l| l == "G1 F3000 Z5.00").unwrap();
    assert!(suction_on < first_lower, "suction must engage before lowering");

    let release = lines.iter().position(|l| l == "M1002").unwrap();
    let last_raise = lines.iter().rposition(|l| l == "G1 F3000 Z50.00").unwrap();
    assert!(release < last_raise, "air must vent before lifting off the hook");
}

#[tokio::test]
async fn progress_reported_per_hook_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let set = TaughtSet {
        hooks: vec![
            Position::cartesian(30.0, 40.0, 5.0),
            Position::cartesian(35.0, 40.0, 5.0),
            Position::cartesian(40.0, 40.0, 5.0),
        ],
        ..two_hook_set()
    };
    let (mut controller, sent) = rig(&dir, &set, None);
    let mut events = controller.events();

    controller.run_full_cycle().await.unwrap();

    let events = drain(&mut events);
    assert_eq!(progress_pairs(&events), vec![(1, 3), (2, 3), (3, 3)]);
    assert_eq!(events.last(), Some(&CycleEvent::Finished));
    assert!(!events.contains(&CycleEvent::Stopped));

    // Three pairs: 6 Cartesian moves each.
    let moves = sent_lines(&sent)
        .iter()
        .filter(|l| l.starts_with("G1"))
        .count();
    assert_eq!(moves, 18);
}

#[tokio::test]
async fn stop_mid_pair_finishes_sequence_then_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    // Stop lands while the first place sequence is venting air: the pair must
    // still finish, and hook 2 must never start.
    let (mut controller, sent) = rig(&dir, &two_hook_set(), Some(("M1002", Trigger::Stop)));
    let mut events = controller.events();

    controller.run_full_cycle().await.unwrap();

    let lines = sent_lines(&sent);
    let moves = lines.iter().filter(|l| l.starts_with("G1")).count();
    assert_eq!(moves, 6, "only the first pick/place pair may run");
    assert_eq!(&lines[lines.len() - 2..], &["M1003", "M1112"]);

    let events = drain(&mut events);
    assert_eq!(progress_pairs(&events), vec![(1, 2)]);
    assert!(events.contains(&CycleEvent::Stopped));
    assert_eq!(events.last(), Some(&CycleEvent::Finished));
}

#[tokio::test]
async fn stop_before_first_hook_still_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, sent) = rig(&dir, &two_hook_set(), Some(("M2000", Trigger::Stop)));
    let mut events = controller.events();

    controller.run_full_cycle().await.unwrap();

    let lines = sent_lines(&sent);
    assert!(!lines.iter().any(|l| l.starts_with("G1")));
    assert_eq!(lines, vec!["M2000", "M1003", "M1112"]);

    let events = drain(&mut events);
    assert!(progress_pairs(&events).is_empty());
    assert!(events.contains(&CycleEvent::Stopped));
}

#[tokio::test]
async fn paused_cycle_waits_for_resume() {
    let dir = tempfile::tempdir().unwrap();
    // Pause lands mid-pair one; the boundary before pair two must block until
    // another task resumes.
    let (mut controller, sent) = rig(&dir, &two_hook_set(), Some(("M1002", Trigger::Pause)));
    let handle = controller.handle();
    let mut events = controller.events();

    let resume_after = Duration::from_millis(150);
    tokio::spawn(async move {
        tokio::time::sleep(resume_after).await;
        handle.resume();
    });

    let started = tokio::time::Instant::now();
    controller.run_full_cycle().await.unwrap();

    assert!(
        started.elapsed() >= Duration::from_millis(100),
        "cycle should have idled at the paused boundary"
    );
    let moves = sent_lines(&sent)
        .iter()
        .filter(|l| l.starts_with("G1"))
        .count();
    assert_eq!(moves, 12, "both pairs run after resume");
    assert_eq!(progress_pairs(&drain(&mut events)), vec![(1, 2), (2, 2)]);
}

#[tokio::test]
async fn test_single_hook_skips_home() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, sent) = rig(&dir, &two_hook_set(), None);

    controller.test_single_hook(1).await.unwrap();

    let lines = sent_lines(&sent);
    assert_eq!(lines, pick_place_pair(35.0, 40.0).into_iter().chain(["M1003".to_string()]).collect::<Vec<_>>());
    assert!(!lines.contains(&"M1112".to_string()));
}

#[tokio::test]
async fn test_single_hook_out_of_range_fails_but_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, sent) = rig(&dir, &two_hook_set(), None);

    let err = controller.test_single_hook(7).await.unwrap_err();
    assert!(matches!(err, ControllerError::NoSuchHook(7)));

    let lines = sent_lines(&sent);
    // Pick ran, the place was refused, suction still shut off.
    assert_eq!(lines.last().unwrap(), "M1003");
    assert!(!lines.contains(&"M1112".to_string()));
    assert!(!controller.is_running());
}

#[tokio::test]
async fn cycle_without_taught_pick_aborts_but_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let set = TaughtSet {
        pick: None,
        ..two_hook_set()
    };
    let (mut controller, sent) = rig(&dir, &set, None);

    let err = controller.run_full_cycle().await.unwrap_err();
    assert!(matches!(err, ControllerError::PickNotSet));

    let lines = sent_lines(&sent);
    assert!(!lines.contains(&"M1000".to_string()));
    assert_eq!(&lines[lines.len() - 2..], &["M1003", "M1112"]);
    assert!(!controller.is_running());
}

#[tokio::test]
async fn revisit_prefers_encoder_replay_over_cartesian() {
    let dir = tempfile::tempdir().unwrap();
    let set = TaughtSet {
        pick: Some(Position {
            x: 10.0,
            y: 20.0,
            z: 5.0,
            encoder: Some("M894 X100  Y200 Z300".to_string()),
        }),
        ..two_hook_set()
    };
    let (mut controller, sent) = rig(&dir, &set, None);

    controller.go_to_pick().await.unwrap();

    let lines = sent_lines(&sent);
    assert_eq!(lines[0], "M894 X100 Y200 Z300");
    assert_eq!(lines[1], "M400");
    assert_eq!(lines[2], "M114");
    assert!(!lines.iter().any(|l| l.starts_with("G1")));
    // Tracked position resynced from the M114 report.
    assert_eq!(
        controller.position(),
        TrackedPosition {
            x: 10.0,
            y: 20.0,
            z: 5.0
        }
    );
}

#[tokio::test]
async fn revisit_without_token_moves_cartesian() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, sent) = rig(&dir, &two_hook_set(), None);

    controller.go_to_hook(0).await.unwrap();

    let lines = sent_lines(&sent);
    assert_eq!(lines, vec!["G1 F3000 X30.00 Y40.00 Z5.00"]);
}

#[tokio::test]
async fn set_pick_samples_cartesian_and_encoder() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, _sent) = rig(&dir, &TaughtSet::default(), None);

    controller.set_pick().await.unwrap();

    let pick = controller.taught().pick.clone().unwrap();
    assert_eq!((pick.x, pick.y, pick.z), (10.0, 20.0, 5.0));
    assert_eq!(pick.encoder.as_deref(), Some("M894 X1234 Y2345 Z3456"));

    // Persisted synchronously: a fresh store sees the same set.
    let reloaded = crate::store::PositionStore::load(dir.path().join("positions.json"));
    assert_eq!(reloaded.taught(), controller.taught());
}

#[tokio::test]
async fn encoder_sync_merges_partial_axes() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, sent) = rig(&dir, &TaughtSet::default(), None);
    // Arm reports only X and Z this time.
    let mut link = MockLink::new(sent);
    link.encoder_reply = Some("M894 X5 Z7".to_string());
    controller.attach_link(Box::new(link));

    controller.sync_from_encoder().await.unwrap();
    let pos = controller.position();
    assert_eq!(pos.x, 5.0);
    assert_eq!(pos.y, 300.0, "unreported axis keeps its prior value");
    assert_eq!(pos.z, 7.0);
}

#[tokio::test]
async fn encoder_silence_keeps_last_position() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, sent) = rig(&dir, &TaughtSet::default(), None);
    let mut link = MockLink::new(sent);
    link.encoder_reply = None;
    controller.attach_link(Box::new(link));

    let before = controller.position();
    let err = controller.read_encoder().await.unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Protocol(protocol::ProtocolError::EncoderTimeout { .. })
    ));

    // The merging variant tolerates the timeout.
    controller.sync_from_encoder().await.unwrap();
    assert_eq!(controller.position(), before);
}

#[tokio::test]
async fn teaching_refused_without_connection() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(&dir);
    let mut controller = ArmController::new(config);

    let err = controller.set_pick().await.unwrap_err();
    assert!(matches!(err, ControllerError::NotConnected));
    let err = controller.run_full_cycle().await.unwrap_err();
    assert!(matches!(err, ControllerError::NotConnected));
}
