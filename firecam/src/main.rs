//! FireCAM binary entry point: argument parsing, logging initialisation,
//! `CoreContext` construction, and one OS thread per activity — mirroring
//! `strand-cam.rs`'s wiring style (thread-per-concern, `anyhow::Result`
//! top-level `main`) rather than an async-task model, since this is a
//! deadline-driven embedded system, not an I/O-bound web server.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};

use firecam_core::activities::{orchestrator, recorder, responder, sampler, thermal, visual};
use firecam_core::context::CoreContext;
use firecam_core::events::{DisplayEvent, OrchestratorEvent, RecorderEvent, ThermalRequest, VisualRequest};
use firecam_core::store::{PersistentStore, StoreCommand, STORE_SIZE};
use firecam_core::time::Clock;

#[derive(Parser, Debug)]
#[command(name = "firecam", about = "FireCAM image-acquisition core")]
struct Args {
    /// Root directory recording sessions are written under.
    #[arg(long, default_value = "./firecam-data")]
    root: PathBuf,

    /// Backing file for the persistent parameter store's byte layout
    /// (stands in for battery-backed SRAM on a development host).
    #[arg(long, default_value = "./firecam-store.bin")]
    store: PathBuf,
}

fn load_or_init_store(path: &std::path::Path) -> PersistentStore {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == STORE_SIZE => {
            let arr: [u8; STORE_SIZE] = bytes.try_into().unwrap();
            PersistentStore::from_bytes(&arr)
        }
        _ => {
            info!("persistent store: no valid backing file, initialising defaults");
            PersistentStore::default_with_mac([0xAB, 0xCD])
        }
    }
}

fn persist_store(path: &std::path::Path, store: &PersistentStore) {
    if let Err(e) = std::fs::write(path, store.to_bytes()) {
        warn!(error = %e, "persistent store: failed to write backing file");
    }
}

fn main() -> anyhow::Result<()> {
    let _guard = env_tracing_logger::init();
    let args = Args::parse();
    std::fs::create_dir_all(&args.root)?;

    let store = load_or_init_store(&args.store);
    persist_store(&args.store, &store);

    let (store_tx, store_rx) = channellib::unbounded::<StoreCommand>();
    let ctx = Arc::new(CoreContext::new(store_tx, store.clone()));

    let mut handles = Vec::new();

    handles.push(spawn_orchestrator(ctx.clone(), store, store_rx, args.store.clone()));
    handles.push(spawn_thermal(ctx.clone()));
    handles.push(spawn_visual(ctx.clone()));
    handles.push(spawn_display(ctx.clone()));
    handles.push(spawn_recorder(ctx.clone(), args.root.clone()));
    handles.push(spawn_responder(ctx.clone()));
    handles.push(spawn_sampler(ctx.clone()));

    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn spawn_orchestrator(
    ctx: Arc<CoreContext>,
    initial_store: PersistentStore,
    store_rx: channellib::Receiver<StoreCommand>,
    store_path: PathBuf,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut orch = orchestrator::Orchestrator::new(&initial_store);
        let mut store = initial_store;
        loop {
            while let Ok(cmd) = store_rx.try_recv() {
                store.apply(cmd);
                *ctx.store_snapshot.lock() = store.clone();
                persist_store(&store_path, &store);
            }
            let observed = ctx.orchestrator_signals.wait_any(Some(orchestrator::TICK));
            if !observed.is_empty() {
                for event in [
                    OrchestratorEvent::Shutdown,
                    OrchestratorEvent::NewWifi,
                    OrchestratorEvent::CardPresent,
                    OrchestratorEvent::CardMissing,
                    OrchestratorEvent::RecordButton,
                    OrchestratorEvent::CmdStartRecord,
                    OrchestratorEvent::CmdStopRecord,
                    OrchestratorEvent::ThermalFrame,
                    OrchestratorEvent::ThermalFail,
                    OrchestratorEvent::VisualFrame,
                    OrchestratorEvent::VisualFail,
                    OrchestratorEvent::DisplayThermalDone,
                    OrchestratorEvent::DisplayVisualDone,
                    OrchestratorEvent::FileRecordStarted,
                    OrchestratorEvent::FileRecordStartFailed,
                    OrchestratorEvent::FileRecordWriteFailed,
                    OrchestratorEvent::FileRecordImageDone,
                    OrchestratorEvent::FileRecordStopped,
                    OrchestratorEvent::CmdImageRequest,
                    OrchestratorEvent::CmdImageDone,
                    OrchestratorEvent::RecordParametersUpdated,
                ] {
                    if observed.contains(event) {
                        orch.handle_event(&ctx, event);
                    }
                }
            }
            if orch.recording == orchestrator::RecordingState::Starting {
                orch.try_auto_resume(&ctx);
            }
            let now = Instant::now();
            let wall_second = chrono::Local::now().timestamp();
            orch.on_tick(&ctx, now, wall_second);
            if orch.shutting_down {
                std::thread::sleep(orchestrator::SHUTDOWN_PAINT_DELAY);
                info!("orchestrator: holding shutdown, waiting for power rail to drop");
                loop {
                    std::thread::sleep(Duration::from_secs(3600));
                }
            }
        }
    })
}

/// No real Lepton is attached on a development host; this stand-in never
/// completes a segment, so the thermal driver reliably reports a stall.
/// A real board swaps this for an SPI/CCI-backed `ThermalSensor`.
struct AbsentThermalSensor;
impl thermal::ThermalSensor for AbsentThermalSensor {
    fn wait_vsync_rise(&mut self, deadline: std::time::Instant) -> bool {
        std::thread::sleep(Duration::from_millis(10));
        std::time::Instant::now() < deadline
    }
    fn read_packet(&mut self, _deadline: std::time::Instant) -> Option<[u8; thermal::PACKET_LEN]> {
        None
    }
}

fn spawn_thermal(ctx: Arc<CoreContext>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut sensor = AbsentThermalSensor;
        loop {
            let observed = ctx.thermal_request.wait_any(None);
            if !observed.contains(ThermalRequest::AcquireFrame) {
                continue;
            }
            match thermal::acquire_frame(&mut sensor) {
                Ok(frame) => {
                    let mut buf = ctx.thermal_buffer.lock();
                    buf.frame = frame;
                    buf.valid = true;
                    drop(buf);
                    ctx.orchestrator_signals.set(OrchestratorEvent::ThermalFrame);
                    ctx.display_signals.set(DisplayEvent::ThermalReady);
                }
                Err(e) => {
                    warn!(error = %e, "thermal driver: acquisition failed");
                    ctx.orchestrator_signals.set(OrchestratorEvent::ThermalFail);
                }
            }
        }
    })
}

struct AbsentVisualSensor;
impl visual::VisualSensor for AbsentVisualSensor {
    fn trigger_capture(&mut self) {}
    fn capture_complete(&mut self) -> bool {
        true
    }
    fn fifo_length(&mut self) -> usize {
        0
    }
    fn drain_fifo(&mut self, _dest: &mut [u8]) -> usize {
        0
    }
}
struct NullBus;
impl visual::SpiBusGuard for NullBus {}

fn spawn_visual(ctx: Arc<CoreContext>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut sensor = AbsentVisualSensor;
        loop {
            let observed = ctx.visual_request.wait_any(None);
            if !observed.contains(VisualRequest::AcquireFrame) {
                continue;
            }
            let mut buf = ctx.visual_buffer.lock();
            match visual::capture_frame(&mut sensor, &NullBus, &mut buf) {
                Ok(()) => {
                    drop(buf);
                    ctx.orchestrator_signals.set(OrchestratorEvent::VisualFrame);
                    ctx.display_signals.set(DisplayEvent::VisualReady);
                }
                Err(e) => {
                    drop(buf);
                    warn!(error = %e, "visual driver: capture failed");
                    ctx.orchestrator_signals.set(OrchestratorEvent::VisualFail);
                }
            }
        }
    })
}

fn spawn_display(ctx: Arc<CoreContext>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut state = firecam_core::display::DisplayState::default();
        loop {
            let keep_running = firecam_core::display::step(
                &mut state,
                &ctx.display_signals,
                &ctx.orchestrator_signals,
                &ctx.thermal_buffer,
                &ctx.visual_buffer,
                Some(Duration::from_millis(200)),
            );
            if !keep_running {
                return;
            }
        }
    })
}

struct HostFilesystem;
struct HostFile(std::fs::File);
impl recorder::RecordFile for HostFile {
    fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        self.0.write_all(data)
    }
}
impl recorder::CardFilesystem for HostFilesystem {
    fn probe_present(&mut self) -> bool {
        true // a host filesystem directory stands in for a removable card
    }
    fn ensure_dir(&mut self, path: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(path)
    }
    fn create_file(&mut self, path: &str) -> std::io::Result<Box<dyn recorder::RecordFile>> {
        let file = std::fs::File::create(path)?;
        Ok(Box::new(HostFile(file)))
    }
}

fn spawn_recorder(ctx: Arc<CoreContext>, root: PathBuf) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut fs = HostFilesystem;
        let mut rec = recorder::FileRecorder::new(root.to_string_lossy().to_string());
        loop {
            if let Some(present) = rec.probe(&mut fs, Instant::now()) {
                let event = if present {
                    OrchestratorEvent::CardPresent
                } else {
                    OrchestratorEvent::CardMissing
                };
                ctx.orchestrator_signals.set(event);
            }
            let observed = ctx
                .recorder_signals
                .wait_any(Some(recorder::CARD_PROBE_INTERVAL));
            if observed.contains(RecorderEvent::StartRecording) {
                let dir = firecam_core::time::session_dir_name(&firecam_core::time::SystemClock.now());
                match rec.start_session(&mut fs, &dir) {
                    Ok(()) => ctx.orchestrator_signals.set(OrchestratorEvent::FileRecordStarted),
                    Err(e) => {
                        warn!(error = %e, "file recorder: failed to start session");
                        ctx.orchestrator_signals.set(OrchestratorEvent::FileRecordStartFailed);
                    }
                }
            }
            if observed.contains(RecorderEvent::StopRecording) {
                rec.stop_session();
                ctx.orchestrator_signals.set(OrchestratorEvent::FileRecordStopped);
            }
            if observed.contains(RecorderEvent::ImageReady) {
                let bytes = ctx.record_buffer.lock().clone();
                match rec.write_record(&mut fs, &bytes) {
                    Ok(_seq) => ctx.orchestrator_signals.set(OrchestratorEvent::FileRecordImageDone),
                    Err(e) => {
                        error!(error = %e, "file recorder: fatal write failure");
                        ctx.orchestrator_signals.set(OrchestratorEvent::FileRecordWriteFailed);
                    }
                }
            }
        }
    })
}

struct TcpConnection<'a>(&'a mut TcpStream);
impl responder::Connection for TcpConnection<'_> {
    fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        self.0.write_all(data)
    }
}

fn handle_client(mut stream: TcpStream, ctx: &Arc<CoreContext>) {
    let mut decoder = responder::FrameDecoder::new();
    let mut buf = [0u8; responder::RECV_BUFFER_CAP];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "command responder: socket error");
                return;
            }
        };
        for json in decoder.feed(&buf[..n]) {
            let store = ctx.store_snapshot.lock().clone();
            let recording = false; // the responder only observes the store, not live recording state
            let battery = *ctx.battery_snapshot.lock();
            let outcome = responder::dispatch(
                &json,
                &store,
                &ctx.store_tx,
                &ctx.orchestrator_signals,
                recording,
                store.wifi.ap_ssid.as_str(),
                env!("CARGO_PKG_VERSION"),
                &firecam_core::time::format_time(&firecam_core::time::SystemClock.now()),
                &firecam_core::time::format_date(&firecam_core::time::SystemClock.now()),
                battery.volts,
                battery.charge,
            );
            match outcome {
                Ok(responder::Dispatch::Immediate(json)) => {
                    let framed = responder::frame(&json);
                    let mut conn = TcpConnection(&mut stream);
                    let _ = responder::send_chunked(&mut conn, &framed);
                }
                Ok(responder::Dispatch::AwaitImage) => {
                    if let Some(framed) =
                        responder::await_image_response(&ctx.responder_signals, &ctx.response_buffer)
                    {
                        let mut conn = TcpConnection(&mut stream);
                        let _ = responder::send_chunked(&mut conn, &framed);
                    }
                }
                Ok(responder::Dispatch::None) => {}
                Err(e) => warn!(error = %e, "command responder: protocol violation"),
            }
        }
    }
}

fn spawn_responder(ctx: Arc<CoreContext>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let listener = match TcpListener::bind(("0.0.0.0", responder::PORT)) {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "command responder: failed to bind port");
                return;
            }
        };
        info!(port = responder::PORT, "command responder: listening");
        // Only one client is served at a time.
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => handle_client(stream, &ctx),
                Err(e) => warn!(error = %e, "command responder: accept failed"),
            }
        }
    })
}

struct AbsentAnalogSource;
impl sampler::AnalogSource for AbsentAnalogSource {
    fn read_channels(&mut self) -> [u16; 6] {
        [3600, 2700, 2700, 2700, 0, 0]
    }
    fn button_pressed(&mut self) -> bool {
        false
    }
}

fn spawn_sampler(ctx: Arc<CoreContext>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut source = AbsentAnalogSource;
        let mut state = sampler::SensorSampler::default();
        loop {
            state.sample_tick(&mut source, Instant::now(), &ctx.orchestrator_signals);
            *ctx.battery_snapshot.lock() = state.snapshot();
            std::thread::sleep(sampler::SAMPLE_PERIOD);
        }
    })
}
