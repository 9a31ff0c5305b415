//! The orchestrator (`spec.md` §4.3): "the heart of the design". Runs a
//! 50 ms tick, assembles one frame per wall-clock second from whichever
//! imager outputs have arrived, fans the assembled record out to the file
//! recorder and command responder, and drives the recording and shutdown
//! state machines.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::context::CoreContext;
use crate::events::OrchestratorEvent;
use crate::record::{gain_mode_label, ImageRecord, Metadata};
use crate::store::{PersistentStore, StoreCommand};
use crate::time::Clock;

pub const TICK: Duration = Duration::from_millis(50);
/// "Elapsed >= ~800 ms: run frame assembly with whatever has arrived"
/// (`spec.md` §4.3).
pub const ASSEMBLY_DEADLINE: Duration = Duration::from_millis(800);
/// Top-of-second to back-in-WaitTOS deadline checked by `spec.md` §8.
pub const CYCLE_DEADLINE: Duration = Duration::from_millis(950);
pub const SHUTDOWN_PAINT_DELAY: Duration = Duration::from_millis(1500);
/// Defensive bound on consecutive auto-resume-into-immediate-fault cycles
/// before giving up and staying IDLE (`spec.md` §9 open question 3,
/// `SPEC_FULL.md` §E.3 — the specification permits but does not mandate
/// this; an unbounded boot loop is worse than a documented deviation).
pub const MAX_AUTO_RESUME_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pending,
    Received,
    Failed,
}

#[derive(Default)]
struct ImagerTracker {
    /// Gates a new frame request: only request once the previous frame has
    /// been consumed by the display (`spec.md` §4.3 WaitTOS).
    consumed_by_display: bool,
    outcome: Outcome,
}

impl Default for Outcome {
    fn default() -> Self {
        Outcome::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Starting,
    Recording,
    Stopping,
    /// `spec.md` §4.3: a file-write fault escalates to a device reboot with
    /// the persistent "was recording" flag preserved for auto-resume.
    Reboot,
}

enum Phase {
    WaitTos,
    WaitImage { entered_at: Instant },
}

pub struct Orchestrator {
    phase: Phase,
    last_second: i64,
    thermal: ImagerTracker,
    visual: ImagerTracker,
    pub recording: RecordingState,
    sequence: u32,
    interval_countdown: u32,
    pending_image_request: bool,
    card_present: bool,
    /// Mirrors the persisted `PersistentStore::auto_resume_retries` so the
    /// bound survives a reboot instead of resetting to 0 on every
    /// `Orchestrator::new` (`spec.md` §9 open question 3).
    auto_resume_retries: u32,
    pub shutting_down: bool,
}

impl Orchestrator {
    /// `spec.md` §4.3: "on boot, if [was_recording] set, the orchestrator
    /// self-sends a start-record signal". Consumed image trackers start
    /// `true` so the very first WaitTOS cycle issues both requests.
    pub fn new(store: &PersistentStore) -> Self {
        let mut orch = Self {
            phase: Phase::WaitTos,
            last_second: i64::MIN,
            thermal: ImagerTracker {
                consumed_by_display: true,
                outcome: Outcome::Pending,
            },
            visual: ImagerTracker {
                consumed_by_display: true,
                outcome: Outcome::Pending,
            },
            recording: RecordingState::Idle,
            sequence: 0,
            interval_countdown: 0,
            pending_image_request: false,
            card_present: false,
            auto_resume_retries: store.auto_resume_retries,
            shutting_down: false,
        };
        if store.was_recording {
            orch.recording = RecordingState::Starting;
        }
        orch
    }

    fn recording_active(&self) -> bool {
        matches!(self.recording, RecordingState::Recording)
    }

    /// One 50 ms tick: advance the WaitTOS/WaitImage state machine.
    pub fn on_tick(&mut self, ctx: &CoreContext, now: Instant, wall_second: i64) {
        match self.phase {
            Phase::WaitTos => {
                if wall_second != self.last_second {
                    self.last_second = wall_second;
                    self.phase = Phase::WaitImage { entered_at: now };
                    self.thermal.outcome = Outcome::Pending;
                    self.visual.outcome = Outcome::Pending;
                    if self.thermal.consumed_by_display {
                        ctx.thermal_request.set(crate::events::ThermalRequest::AcquireFrame);
                    }
                    if self.visual.consumed_by_display {
                        ctx.visual_request.set(crate::events::VisualRequest::AcquireFrame);
                    }
                }
            }
            Phase::WaitImage { entered_at } => {
                let elapsed = now.saturating_duration_since(entered_at);
                // A failed imager still counts as settled: otherwise one faulted
                // imager would stall every cycle to ASSEMBLY_DEADLINE instead of
                // assembling early with whatever the other imager produced.
                let both_settled = self.thermal.outcome != Outcome::Pending
                    && self.visual.outcome != Outcome::Pending;
                let consumer_ready = self.recording_active() || self.pending_image_request;
                if (both_settled && consumer_ready) || elapsed >= ASSEMBLY_DEADLINE {
                    if elapsed > CYCLE_DEADLINE {
                        warn!(?elapsed, "orchestrator: assembly deadline exceeded");
                    }
                    self.assemble_and_dispatch(ctx);
                    self.phase = Phase::WaitTos;
                }
            }
        }
    }

    /// Apply one orchestrator-signal bit. The caller drains the whole set
    /// observed from `ctx.orchestrator_signals` and calls this per bit.
    pub fn handle_event(&mut self, ctx: &CoreContext, event: OrchestratorEvent) {
        use OrchestratorEvent::*;
        match event {
            Shutdown => self.begin_shutdown(ctx),
            NewWifi => info!("orchestrator: wifi configuration changed"),
            CardPresent => {
                self.card_present = true;
            }
            CardMissing => {
                self.card_present = false;
            }
            RecordButton | CmdStartRecord => self.try_start_recording(ctx),
            CmdStopRecord => self.try_stop_recording(ctx),
            ThermalFrame => self.thermal.outcome = Outcome::Received,
            ThermalFail => self.thermal.outcome = Outcome::Failed,
            VisualFrame => self.visual.outcome = Outcome::Received,
            VisualFail => self.visual.outcome = Outcome::Failed,
            DisplayThermalDone => self.thermal.consumed_by_display = true,
            DisplayVisualDone => self.visual.consumed_by_display = true,
            FileRecordStarted => {
                self.recording = RecordingState::Recording;
                self.auto_resume_retries = 0;
                let _ = ctx.store_tx.send(StoreCommand::SetWasRecording(true));
                let _ = ctx.store_tx.send(StoreCommand::SetAutoResumeRetries(0));
            }
            FileRecordStartFailed => {
                warn!("orchestrator: file recorder failed to start");
                self.recording = RecordingState::Idle;
            }
            FileRecordWriteFailed => {
                error!("orchestrator: fatal write failure, rebooting (auto-resume flag preserved)");
                self.recording = RecordingState::Reboot;
            }
            FileRecordImageDone => {}
            FileRecordStopped => self.on_recorder_stopped(),
            CmdImageRequest => self.pending_image_request = true,
            CmdImageDone => self.pending_image_request = false,
            RecordParametersUpdated => {}
        }
    }

    fn try_start_recording(&mut self, ctx: &CoreContext) {
        if self.recording != RecordingState::Idle {
            return;
        }
        if !self.card_present {
            warn!("orchestrator: record-on refused, no card present");
            return;
        }
        self.recording = RecordingState::Starting;
        ctx.recorder_signals.set(crate::events::RecorderEvent::StartRecording);
    }

    /// Boot-time auto-resume, bounded per `MAX_AUTO_RESUME_RETRIES`
    /// (`spec.md` §9 open question 3). The bound counts actual resume
    /// attempts handed to the recorder, not ticks spent merely waiting for
    /// the card, and is persisted so it survives the reboot it bounds.
    pub fn try_auto_resume(&mut self, ctx: &CoreContext) {
        if self.recording != RecordingState::Starting {
            return;
        }
        if self.auto_resume_retries >= MAX_AUTO_RESUME_RETRIES {
            error!("orchestrator: auto-resume retry bound reached, staying IDLE");
            self.recording = RecordingState::Idle;
            return;
        }
        if !self.card_present {
            return; // wait for CardPresent before attempting
        }
        self.auto_resume_retries += 1;
        let _ = ctx
            .store_tx
            .send(StoreCommand::SetAutoResumeRetries(self.auto_resume_retries));
        ctx.recorder_signals.set(crate::events::RecorderEvent::StartRecording);
    }

    fn try_stop_recording(&mut self, ctx: &CoreContext) {
        if self.recording != RecordingState::Recording {
            return;
        }
        self.recording = RecordingState::Stopping;
        let _ = ctx.store_tx.send(StoreCommand::SetWasRecording(false));
        ctx.recorder_signals.set(crate::events::RecorderEvent::StopRecording);
    }

    pub fn on_recorder_stopped(&mut self) {
        if self.recording == RecordingState::Stopping {
            self.recording = RecordingState::Idle;
        }
    }

    /// `spec.md` §4.3 frame assembly: build the composite record, dispatch
    /// to the recorder (if recording and the interval elapsed) and to the
    /// responder (if a remote request is pending).
    fn assemble_and_dispatch(&mut self, ctx: &CoreContext) {
        let store = ctx.store_snapshot.lock().clone();
        self.sequence += 1;

        let thermal_included = self.thermal.outcome == Outcome::Received
            && (!self.recording_active() || store.lepton_enable);
        let visual_included = self.visual.outcome == Outcome::Received
            && (!self.recording_active() || store.arducam_enable);

        let thermal_guard = ctx.thermal_buffer.lock();
        let visual_guard = ctx.visual_buffer.lock();
        let thermal_ref = thermal_included.then(|| &thermal_guard.frame);
        let visual_ref = visual_included.then_some(&*visual_guard);

        let metadata = self.build_metadata(ctx, &store, thermal_ref);
        let record = ImageRecord::new(metadata, visual_ref, thermal_ref);
        drop(thermal_guard);
        drop(visual_guard);

        let json = match record.to_json() {
            Ok(j) => j,
            Err(e) => {
                error!(error = %e, "orchestrator: failed to serialise image record");
                return;
            }
        };

        if self.recording_active() {
            if self.interval_countdown == 0 {
                *ctx.record_buffer.lock() = json.clone().into_bytes();
                ctx.recorder_signals.set(crate::events::RecorderEvent::ImageReady);
                self.interval_countdown = store.record_interval_secs.saturating_sub(1);
            } else {
                self.interval_countdown -= 1;
            }
        }

        if self.pending_image_request {
            let framed = crate::activities::responder::frame(&json);
            *ctx.response_buffer.lock() = framed;
            ctx.responder_signals.set(crate::events::ResponderEvent::ImageReady);
            ctx.orchestrator_signals.set(OrchestratorEvent::CmdImageDone);
            self.pending_image_request = false;
        }
    }

    fn build_metadata(
        &self,
        ctx: &CoreContext,
        store: &PersistentStore,
        thermal: Option<&crate::buffers::ThermalFrame>,
    ) -> Metadata {
        let now = crate::time::SystemClock.now();
        let unknown_gain = !store.lepton_enable;
        let battery = *ctx.battery_snapshot.lock();
        Metadata {
            camera: store.wifi.ap_ssid.as_str().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            sequence_number: if self.pending_image_request && !self.recording_active() {
                0
            } else {
                self.sequence
            },
            time: crate::time::format_time(&now),
            date: crate::time::format_date(&now),
            battery_volts: battery.volts,
            charge: battery.charge,
            fpa_temp_c: thermal.map(|t| t.telemetry.fpa_temp_celsius()),
            aux_temp_c: None,
            lens_temp_c: None,
            lepton_gain_mode: gain_mode_label(store.gain_mode, unknown_gain),
            lepton_resolution: thermal
                .map(|t| match t.telemetry.resolution() {
                    crate::buffers::ThermalResolution::Centi => "0.01".to_string(),
                    crate::buffers::ThermalResolution::Deci => "0.1".to_string(),
                    crate::buffers::ThermalResolution::Unknown => "0.01".to_string(),
                })
                .unwrap_or_else(|| "0.01".to_string()),
        }
    }

    /// `spec.md` §4.3 shutdown sequence: abort recording without setting
    /// auto-resume, tell the display, delay for the poweroff screen to
    /// paint, then signal done (the binary drives the hold line and spins).
    fn begin_shutdown(&mut self, ctx: &CoreContext) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        if self.recording_active() {
            let _ = ctx.store_tx.send(StoreCommand::SetWasRecording(false));
            ctx.recorder_signals.set(crate::events::RecorderEvent::StopRecording);
        }
        self.recording = RecordingState::Idle;
        ctx.display_signals.set(crate::events::DisplayEvent::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CoreContext {
        let (tx, _rx) = channellib::unbounded();
        CoreContext::new(tx, PersistentStore::default())
    }

    #[test]
    fn wait_tos_requests_both_imagers_on_second_change() {
        let context = ctx();
        let mut orch = Orchestrator::new(&PersistentStore::default());
        let now = Instant::now();
        orch.on_tick(&context, now, 1);
        assert!(context
            .thermal_request
            .take()
            .contains(crate::events::ThermalRequest::AcquireFrame));
        assert!(context
            .visual_request
            .take()
            .contains(crate::events::VisualRequest::AcquireFrame));
    }

    #[test]
    fn does_not_rerequest_within_same_second() {
        let context = ctx();
        let mut orch = Orchestrator::new(&PersistentStore::default());
        let now = Instant::now();
        orch.on_tick(&context, now, 1);
        context.thermal_request.take();
        context.visual_request.take();
        orch.on_tick(&context, now + TICK, 1);
        assert!(context.thermal_request.take().is_empty());
    }

    #[test]
    fn assembly_deadline_runs_with_partial_results() {
        let context = ctx();
        let mut orch = Orchestrator::new(&PersistentStore::default());
        let now = Instant::now();
        orch.on_tick(&context, now, 1); // enters WaitImage
        orch.handle_event(&context, OrchestratorEvent::VisualFrame);
        // thermal never arrives; deadline forces assembly.
        orch.on_tick(&context, now + ASSEMBLY_DEADLINE, 1);
        assert!(matches!(orch.phase, Phase::WaitTos));
    }

    #[test]
    fn auto_resume_retry_bound_gives_up_eventually() {
        let mut store = PersistentStore::default();
        store.was_recording = true;
        let context = ctx();
        let mut orch = Orchestrator::new(&store);
        assert_eq!(orch.recording, RecordingState::Starting);
        orch.handle_event(&context, OrchestratorEvent::CardPresent);
        for _ in 0..MAX_AUTO_RESUME_RETRIES {
            orch.try_auto_resume(&context);
        }
        assert_eq!(orch.recording, RecordingState::Idle);
    }

    #[test]
    fn auto_resume_does_not_count_ticks_spent_waiting_for_card() {
        let mut store = PersistentStore::default();
        store.was_recording = true;
        let context = ctx();
        let mut orch = Orchestrator::new(&store);
        // No CardPresent yet: waiting for the card must never burn retries.
        for _ in 0..(MAX_AUTO_RESUME_RETRIES * 3) {
            orch.try_auto_resume(&context);
        }
        assert_eq!(orch.recording, RecordingState::Starting);
        orch.handle_event(&context, OrchestratorEvent::CardPresent);
        orch.try_auto_resume(&context);
        assert_eq!(orch.recording, RecordingState::Starting);
    }

    #[test]
    fn auto_resume_retry_bound_is_persisted_across_reboot() {
        let mut store = PersistentStore::default();
        store.was_recording = true;
        store.auto_resume_retries = MAX_AUTO_RESUME_RETRIES;
        let context = ctx();
        let mut orch = Orchestrator::new(&store);
        assert_eq!(orch.recording, RecordingState::Starting);
        orch.handle_event(&context, OrchestratorEvent::CardPresent);
        orch.try_auto_resume(&context);
        assert_eq!(orch.recording, RecordingState::Idle);
    }

    #[test]
    fn write_failure_escalates_to_reboot_state() {
        let context = ctx();
        let mut orch = Orchestrator::new(&PersistentStore::default());
        orch.recording = RecordingState::Recording;
        orch.handle_event(&context, OrchestratorEvent::FileRecordWriteFailed);
        assert_eq!(orch.recording, RecordingState::Reboot);
    }

    #[test]
    fn file_record_stopped_event_completes_stopping_to_idle() {
        let context = ctx();
        let mut orch = Orchestrator::new(&PersistentStore::default());
        orch.recording = RecordingState::Stopping;
        orch.handle_event(&context, OrchestratorEvent::FileRecordStopped);
        assert_eq!(orch.recording, RecordingState::Idle);
    }

    #[test]
    fn record_on_is_refused_while_stopping_and_allowed_once_stopped() {
        let context = ctx();
        let mut orch = Orchestrator::new(&PersistentStore::default());
        orch.handle_event(&context, OrchestratorEvent::CardPresent);
        orch.recording = RecordingState::Stopping;
        orch.handle_event(&context, OrchestratorEvent::CmdStartRecord);
        assert_eq!(orch.recording, RecordingState::Stopping);
        orch.handle_event(&context, OrchestratorEvent::FileRecordStopped);
        assert_eq!(orch.recording, RecordingState::Idle);
        orch.handle_event(&context, OrchestratorEvent::CmdStartRecord);
        assert_eq!(orch.recording, RecordingState::Starting);
    }

    #[test]
    fn shutdown_signals_display_and_is_idempotent() {
        let context = ctx();
        let mut orch = Orchestrator::new(&PersistentStore::default());
        orch.handle_event(&context, OrchestratorEvent::Shutdown);
        assert!(context
            .display_signals
            .take()
            .contains(crate::events::DisplayEvent::Shutdown));
        orch.handle_event(&context, OrchestratorEvent::Shutdown);
        assert!(context.display_signals.take().is_empty());
    }
}
