//! The explicit core-context value (`spec.md` §9: "reframe process-wide
//! globals... as an explicit core context value constructed at boot and
//! threaded into each activity's entry point"). One `CoreContext` is built
//! once in `main` and shared (via `Arc`) across all seven activity threads;
//! each shared buffer is an `Arc<parking_lot::Mutex<_>>` ownership token
//! passed between activities by the notification protocol, not a process
//! global.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::activities::sampler::BatterySnapshot;
use crate::buffers::{ThermalBuffer, VisualBuffer};
use crate::events::{
    DisplayEvent, OrchestratorEvent, RecorderEvent, ResponderEvent, ThermalRequest, VisualRequest,
};
use crate::signals::Signals;
use crate::store::{PersistentStore, StoreCommand};

/// Everything the seven activities share. Construction order doesn't
/// matter; there is no initialization dependency between fields.
pub struct CoreContext {
    pub orchestrator_signals: Signals<OrchestratorEvent>,
    pub thermal_request: Signals<ThermalRequest>,
    pub visual_request: Signals<VisualRequest>,
    pub display_signals: Signals<DisplayEvent>,
    pub recorder_signals: Signals<RecorderEvent>,
    pub responder_signals: Signals<ResponderEvent>,

    pub thermal_buffer: Arc<Mutex<ThermalBuffer>>,
    pub visual_buffer: Arc<Mutex<VisualBuffer>>,
    /// The orchestrator-to-recorder image-text assembly buffer (`spec.md`
    /// §5: "distinct memory regions, each single-producer single-consumer").
    pub record_buffer: Arc<Mutex<Vec<u8>>>,
    /// The orchestrator-to-responder framed response buffer.
    pub response_buffer: Arc<Mutex<Vec<u8>>>,

    /// Commands mutating the store flow to the orchestrator, which owns it
    /// exclusively (`spec.md` §9 re-architecture note on the persistent
    /// store). Other activities hold only the `Sender` half.
    pub store_tx: channellib::Sender<StoreCommand>,
    /// A read-only snapshot the orchestrator republishes after every
    /// applied command, so the command responder can answer `get_config`/
    /// `get_wifi`/`get_status` without round-tripping through the
    /// orchestrator's own event queue.
    pub store_snapshot: Arc<Mutex<PersistentStore>>,
    /// The sensor sampler's latest averaged reading, republished every scan
    /// so the orchestrator's metadata builder and the command responder's
    /// `get_status` can read it without their own collaborator access.
    pub battery_snapshot: Arc<Mutex<BatterySnapshot>>,
}

impl CoreContext {
    pub fn new(store_tx: channellib::Sender<StoreCommand>, initial_store: PersistentStore) -> Self {
        Self {
            orchestrator_signals: Signals::new(),
            thermal_request: Signals::new(),
            visual_request: Signals::new(),
            display_signals: Signals::new(),
            recorder_signals: Signals::new(),
            responder_signals: Signals::new(),
            thermal_buffer: Arc::new(Mutex::new(ThermalBuffer::default())),
            visual_buffer: Arc::new(Mutex::new(VisualBuffer::default())),
            record_buffer: Arc::new(Mutex::new(Vec::new())),
            response_buffer: Arc::new(Mutex::new(Vec::new())),
            store_tx,
            store_snapshot: Arc::new(Mutex::new(initial_store)),
            battery_snapshot: Arc::new(Mutex::new(BatterySnapshot::default())),
        }
    }
}
