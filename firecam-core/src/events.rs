//! The per-activity event-kind enums (`spec.md` §3 "Signal bitsets", §4.3
//! "Signals consumed by the orchestrator"). Bit positions are assigned by
//! declaration order via [`crate::signal_event`].

use crate::signal_event;

signal_event! {
    /// Everything the orchestrator reacts to. 20 variants: comfortably
    /// under the 32-bit budget.
    #[derive(Hash)]
    pub enum OrchestratorEvent {
        Shutdown,
        NewWifi,
        CardPresent,
        CardMissing,
        RecordButton,
        CmdStartRecord,
        CmdStopRecord,
        ThermalFrame,
        ThermalFail,
        VisualFrame,
        VisualFail,
        DisplayThermalDone,
        DisplayVisualDone,
        FileRecordStarted,
        FileRecordStartFailed,
        FileRecordWriteFailed,
        FileRecordImageDone,
        FileRecordStopped,
        CmdImageRequest,
        CmdImageDone,
        RecordParametersUpdated,
    }
}

signal_event! {
    /// Sent to the thermal driver to kick off a frame acquisition.
    #[derive(Hash)]
    pub enum ThermalRequest {
        AcquireFrame,
    }
}

signal_event! {
    /// Sent to the visual driver to kick off a frame capture.
    #[derive(Hash)]
    pub enum VisualRequest {
        AcquireFrame,
    }
}

signal_event! {
    /// Sent to the display activity.
    #[derive(Hash)]
    pub enum DisplayEvent {
        ThermalReady,
        VisualReady,
        Shutdown,
    }
}

signal_event! {
    /// Sent to the file recorder.
    #[derive(Hash)]
    pub enum RecorderEvent {
        StartRecording,
        StopRecording,
        ImageReady,
    }
}

signal_event! {
    /// Sent to the command responder once its pending `get_image` request
    /// has been serviced.
    #[derive(Hash)]
    pub enum ResponderEvent {
        ImageReady,
    }
}
