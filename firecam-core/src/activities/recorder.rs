//! File recorder (`spec.md` §4.4). Owns card-presence knowledge, session
//! directory lifecycle, and bounded-write file emission. The SD card and
//! filesystem driver are collaborators, abstracted behind [`CardFilesystem`]
//! so tests can exercise the group/sequence bookkeeping without real I/O.

use std::io;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

pub const CARD_PROBE_INTERVAL: Duration = Duration::from_secs(2);
/// "Chunks of at most ~4 KiB per underlying call" (`spec.md` §4.4).
pub const WRITE_CHUNK_SIZE: usize = 4096;
pub const FILES_PER_GROUP: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("fatal write failure: {0}")]
    Fatal(#[from] io::Error),
}

/// One open destination file. Implementations must make each `write_chunk`
/// call a distinct underlying write so a stalled card is detected promptly
/// rather than after one huge buffered write.
pub trait RecordFile {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;
}

/// The SD card + filesystem collaborator (`spec.md` §1).
pub trait CardFilesystem {
    /// The cheapest command that reliably errors on a removed card
    /// (`spec.md` §4.4).
    fn probe_present(&mut self) -> bool;
    fn ensure_dir(&mut self, path: &str) -> io::Result<()>;
    fn create_file(&mut self, path: &str) -> io::Result<Box<dyn RecordFile>>;
}

/// The active recording session: directory name, next sequence number, and
/// lazily-created group subdirectory tracking (`spec.md` §3 "Recording
/// session").
struct Session {
    dir_name: String,
    next_sequence: u32,
    last_group_created: Option<u32>,
}

pub struct FileRecorder {
    root: String,
    session: Option<Session>,
    card_present: bool,
    last_probe: Instant,
}

impl FileRecorder {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            session: None,
            card_present: false,
            last_probe: Instant::now() - CARD_PROBE_INTERVAL,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Probe card presence if not recording and the probe interval elapsed
    /// (`spec.md` §4.4: "while recording, probing is suspended"). Returns
    /// `Some(new_state)` only on a transition.
    pub fn probe(&mut self, fs: &mut dyn CardFilesystem, now: Instant) -> Option<bool> {
        if self.is_recording() {
            return None;
        }
        if now.duration_since(self.last_probe) < CARD_PROBE_INTERVAL {
            return None;
        }
        self.last_probe = now;
        let present = fs.probe_present();
        if present != self.card_present {
            self.card_present = present;
            Some(present)
        } else {
            None
        }
    }

    /// Create (or reuse) the session directory and reset sequence state
    /// (`spec.md` §4.4 "a pre-existing directory with the same timestamp is
    /// reused without error").
    pub fn start_session(
        &mut self,
        fs: &mut dyn CardFilesystem,
        dir_name: &str,
    ) -> Result<(), RecorderError> {
        let path = format!("{}/{}", self.root, dir_name);
        fs.ensure_dir(&path)?;
        self.session = Some(Session {
            dir_name: dir_name.to_string(),
            next_sequence: 1,
            last_group_created: None,
        });
        info!(session = dir_name, "file recorder: session started");
        Ok(())
    }

    pub fn stop_session(&mut self) {
        if let Some(session) = self.session.take() {
            info!(session = %session.dir_name, "file recorder: session stopped");
        }
    }

    /// Write one image record, creating the `group_NNNN` subdirectory the
    /// first time a sequence number crosses a 100-file boundary
    /// (`spec.md` §3, §4.4).
    pub fn write_record(
        &mut self,
        fs: &mut dyn CardFilesystem,
        bytes: &[u8],
    ) -> Result<u32, RecorderError> {
        let session = self
            .session
            .as_mut()
            .expect("write_record called without an active session");
        let sequence = session.next_sequence;
        let group = (sequence - 1) / FILES_PER_GROUP;
        let group_dir = format!("{}/{}/group_{:04}", self.root, session.dir_name, group);
        if session.last_group_created != Some(group) {
            fs.ensure_dir(&group_dir)?;
            session.last_group_created = Some(group);
        }
        let path = format!("{}/img_{:05}.json", group_dir, sequence);
        let mut file = match fs.create_file(&path) {
            Ok(f) => f,
            Err(e) => {
                error!(path, error = %e, "file recorder: fatal open failure");
                return Err(RecorderError::Fatal(e));
            }
        };
        for chunk in bytes.chunks(WRITE_CHUNK_SIZE) {
            if let Err(e) = file.write_chunk(chunk) {
                error!(path, error = %e, "file recorder: fatal write failure");
                return Err(RecorderError::Fatal(e));
            }
        }
        session.next_sequence += 1;
        Ok(sequence)
    }
}
