//! Persistent parameter store (`spec.md` §3 "Persistent store contents",
//! §6 "Persistent store layout", §9 "Persistent store as ambient state").
//!
//! The byte layout below is a fixed-size, magic-prefixed, checksummed
//! array, exactly as `spec.md` §6 describes. The physical backing medium
//! (battery-backed SRAM behind a DS3232-adjacent chip, on the real
//! hardware) is a collaborator outside this crate's scope; here it is
//! modelled as a `StoreBackend` trait so a host build can back it with a
//! plain file while keeping the exact on-wire byte layout.
//!
//! Per the re-architecture note in §9, the store is owned by a single
//! activity and mutated only via [`StoreCommand`] messages; readers get
//! cheap cloned snapshots. In this implementation the orchestrator thread
//! doubles as the store owner, since it is overwhelmingly the store's own
//! primary mutator (recording state, Wi-Fi reconfiguration, GUI settings
//! all flow through it already).

use crate::wifi::WifiConfig;

pub const MAGIC: [u8; 2] = [0x12, 0x34];
pub const LAYOUT_VERSION: u8 = 3;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 2;
const OFF_AP_SSID: usize = 3;
const OFF_STA_SSID: usize = OFF_AP_SSID + 32;
const OFF_AP_PW: usize = OFF_STA_SSID + 32;
const OFF_STA_PW: usize = OFF_AP_PW + 32;
const OFF_WIFI_FLAGS: usize = OFF_STA_PW + 32;
const OFF_AP_IP: usize = OFF_WIFI_FLAGS + 1;
const OFF_STA_IP: usize = OFF_AP_IP + 4;
const OFF_CUR_IP: usize = OFF_STA_IP + 4;
const OFF_GAIN_MODE: usize = OFF_CUR_IP + 4;
const OFF_PALETTE: usize = OFF_GAIN_MODE + 1;
const OFF_RECORD_INTERVAL: usize = OFF_PALETTE + 1;
const OFF_ARDUCAM_ENABLE: usize = OFF_RECORD_INTERVAL + 4;
const OFF_LEPTON_ENABLE: usize = OFF_ARDUCAM_ENABLE + 1;
const OFF_WAS_RECORDING: usize = OFF_LEPTON_ENABLE + 1;
const OFF_AUTO_RESUME_RETRIES: usize = OFF_WAS_RECORDING + 1;
const OFF_CHECKSUM: usize = OFF_AUTO_RESUME_RETRIES + 4;
pub const STORE_SIZE: usize = OFF_CHECKSUM + 1;

/// A fixed-capacity, nul-padded byte buffer holding a UTF-8 string, for
/// layouts that must be byte-addressable at a known offset.
#[derive(Debug, Clone, Copy)]
pub struct FixedStr<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> FixedStr<N> {
    pub fn from_str(s: &str) -> Self {
        let mut bytes = [0u8; N];
        let src = s.as_bytes();
        let n = src.len().min(N.saturating_sub(1)); // leave room for nul terminator
        bytes[..n].copy_from_slice(&src[..n]);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    pub fn as_str(&self) -> &str {
        let end = self.bytes.iter().position(|&b| b == 0).unwrap_or(N);
        std::str::from_utf8(&self.bytes[..end]).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainModeSetting {
    High,
    Low,
    Auto,
}

impl GainModeSetting {
    fn to_byte(self) -> u8 {
        match self {
            GainModeSetting::High => 0,
            GainModeSetting::Low => 1,
            GainModeSetting::Auto => 2,
        }
    }

    fn from_byte(b: u8) -> Self {
        match b {
            0 => GainModeSetting::High,
            1 => GainModeSetting::Low,
            _ => GainModeSetting::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Palette {
    Grayscale,
    Fusion,
    Rainbow,
    Rainbow2,
    Ironblack,
    Arctic,
}

impl Palette {
    fn to_byte(self) -> u8 {
        match self {
            Palette::Grayscale => 0,
            Palette::Fusion => 1,
            Palette::Rainbow => 2,
            Palette::Rainbow2 => 3,
            Palette::Ironblack => 4,
            Palette::Arctic => 5,
        }
    }

    fn from_byte(b: u8) -> Self {
        match b {
            0 => Palette::Grayscale,
            2 => Palette::Rainbow,
            3 => Palette::Rainbow2,
            4 => Palette::Ironblack,
            5 => Palette::Arctic,
            _ => Palette::Fusion,
        }
    }
}

/// The fixed set of allowed recording intervals (`spec.md` §3, §8).
pub const ALLOWED_RECORD_INTERVALS: [u32; 7] = [1, 5, 30, 60, 300, 1800, 3600];

/// Snap an arbitrary requested interval to the nearest allowed value,
/// defaulting to the first (1s) when the request isn't in the set at all
/// (`spec.md` §8: "rejected and silently snapped to the first valid
/// value").
pub fn validate_record_interval(requested: u32) -> u32 {
    if ALLOWED_RECORD_INTERVALS.contains(&requested) {
        requested
    } else {
        ALLOWED_RECORD_INTERVALS[0]
    }
}

#[derive(Debug, Clone)]
pub struct PersistentStore {
    pub version: u8,
    pub wifi: WifiConfig,
    pub gain_mode: GainModeSetting,
    pub palette: Palette,
    pub record_interval_secs: u32,
    pub arducam_enable: bool,
    pub lepton_enable: bool,
    /// Set on entering RECORDING, cleared on clean stop. Read on boot to
    /// auto-resume recording across a crash/reboot (`spec.md` §4.3, §7.3).
    pub was_recording: bool,
    /// Consecutive auto-resume-into-immediate-fault cycles observed so far,
    /// persisted so the bound in `orchestrator.rs` survives the very
    /// reboots it's meant to bound (`spec.md` §9 open question 3).
    pub auto_resume_retries: u32,
}

impl Default for PersistentStore {
    fn default() -> Self {
        Self {
            version: LAYOUT_VERSION,
            wifi: WifiConfig::default(),
            gain_mode: GainModeSetting::Auto,
            palette: Palette::Fusion,
            record_interval_secs: ALLOWED_RECORD_INTERVALS[0],
            arducam_enable: true,
            lepton_enable: true,
            was_recording: false,
            auto_resume_retries: 0,
        }
    }
}

impl PersistentStore {
    pub fn default_with_mac(mac_last_two_bytes: [u8; 2]) -> Self {
        Self {
            wifi: WifiConfig::with_mac(mac_last_two_bytes),
            ..Self::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; STORE_SIZE] {
        let mut buf = [0u8; STORE_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 2].copy_from_slice(&MAGIC);
        buf[OFF_VERSION] = self.version;
        buf[OFF_AP_SSID..OFF_AP_SSID + 32].copy_from_slice(self.wifi.ap_ssid.as_bytes());
        buf[OFF_STA_SSID..OFF_STA_SSID + 32].copy_from_slice(self.wifi.sta_ssid.as_bytes());
        buf[OFF_AP_PW..OFF_AP_PW + 32].copy_from_slice(self.wifi.ap_pw.as_bytes());
        buf[OFF_STA_PW..OFF_STA_PW + 32].copy_from_slice(self.wifi.sta_pw.as_bytes());
        buf[OFF_WIFI_FLAGS] = self.wifi.flags;
        buf[OFF_AP_IP..OFF_AP_IP + 4].copy_from_slice(&self.wifi.ap_ip.0);
        buf[OFF_STA_IP..OFF_STA_IP + 4].copy_from_slice(&self.wifi.sta_ip.0);
        buf[OFF_CUR_IP..OFF_CUR_IP + 4].copy_from_slice(&self.wifi.cur_ip.0);
        buf[OFF_GAIN_MODE] = self.gain_mode.to_byte();
        buf[OFF_PALETTE] = self.palette.to_byte();
        buf[OFF_RECORD_INTERVAL..OFF_RECORD_INTERVAL + 4]
            .copy_from_slice(&self.record_interval_secs.to_le_bytes());
        buf[OFF_ARDUCAM_ENABLE] = self.arducam_enable as u8;
        buf[OFF_LEPTON_ENABLE] = self.lepton_enable as u8;
        buf[OFF_WAS_RECORDING] = self.was_recording as u8;
        buf[OFF_AUTO_RESUME_RETRIES..OFF_AUTO_RESUME_RETRIES + 4]
            .copy_from_slice(&self.auto_resume_retries.to_le_bytes());
        buf[OFF_CHECKSUM] = checksum(&buf[..OFF_CHECKSUM]);
        buf
    }

    /// Reinitialise from defaults on magic or checksum mismatch
    /// (`spec.md` §6, §7 kind 6 "Persistent store corruption").
    pub fn from_bytes(buf: &[u8; STORE_SIZE]) -> Self {
        if buf[OFF_MAGIC..OFF_MAGIC + 2] != MAGIC
            || buf[OFF_CHECKSUM] != checksum(&buf[..OFF_CHECKSUM])
        {
            return Self::default();
        }
        let mut store = Self {
            version: buf[OFF_VERSION],
            wifi: WifiConfig {
                ap_ssid: FixedStr::from_bytes(buf[OFF_AP_SSID..OFF_AP_SSID + 32].try_into().unwrap()),
                sta_ssid: FixedStr::from_bytes(
                    buf[OFF_STA_SSID..OFF_STA_SSID + 32].try_into().unwrap(),
                ),
                ap_pw: FixedStr::from_bytes(buf[OFF_AP_PW..OFF_AP_PW + 32].try_into().unwrap()),
                sta_pw: FixedStr::from_bytes(buf[OFF_STA_PW..OFF_STA_PW + 32].try_into().unwrap()),
                flags: buf[OFF_WIFI_FLAGS],
                ap_ip: crate::wifi::Ipv4Bytes(buf[OFF_AP_IP..OFF_AP_IP + 4].try_into().unwrap()),
                sta_ip: crate::wifi::Ipv4Bytes(buf[OFF_STA_IP..OFF_STA_IP + 4].try_into().unwrap()),
                cur_ip: crate::wifi::Ipv4Bytes(buf[OFF_CUR_IP..OFF_CUR_IP + 4].try_into().unwrap()),
            },
            gain_mode: GainModeSetting::from_byte(buf[OFF_GAIN_MODE]),
            palette: Palette::from_byte(buf[OFF_PALETTE]),
            record_interval_secs: u32::from_le_bytes(
                buf[OFF_RECORD_INTERVAL..OFF_RECORD_INTERVAL + 4]
                    .try_into()
                    .unwrap(),
            ),
            arducam_enable: buf[OFF_ARDUCAM_ENABLE] != 0,
            lepton_enable: buf[OFF_LEPTON_ENABLE] != 0,
            was_recording: buf[OFF_WAS_RECORDING] != 0,
            auto_resume_retries: u32::from_le_bytes(
                buf[OFF_AUTO_RESUME_RETRIES..OFF_AUTO_RESUME_RETRIES + 4]
                    .try_into()
                    .unwrap(),
            ),
        };
        if store.version < LAYOUT_VERSION {
            store = upgrade_layout(store);
        }
        store
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Additive-only layout upgrade, applied step by step so a store several
/// versions behind still ends up fully initialised (`spec.md` §3 "Layout
/// upgrades are additive").
fn upgrade_layout(mut store: PersistentStore) -> PersistentStore {
    if store.version == 1 {
        store.was_recording = false;
        store.version = 2;
    }
    if store.version == 2 {
        store.auto_resume_retries = 0;
        store.version = 3;
    }
    store
}

/// A change-set sent to the store-owning activity, replacing the "only one
/// task writes" convention with an enforced single-writer message queue
/// (`spec.md` §9).
#[derive(Debug, Clone)]
pub enum StoreCommand {
    SetWifi(Box<WifiConfig>),
    SetGainMode(GainModeSetting),
    SetPalette(Palette),
    SetRecordInterval(u32),
    SetImagerEnables { arducam: bool, lepton: bool },
    SetWasRecording(bool),
    SetAutoResumeRetries(u32),
}

impl PersistentStore {
    pub fn apply(&mut self, cmd: StoreCommand) {
        match cmd {
            StoreCommand::SetWifi(wifi) => self.wifi = *wifi,
            StoreCommand::SetGainMode(mode) => self.gain_mode = mode,
            StoreCommand::SetPalette(palette) => self.palette = palette,
            StoreCommand::SetRecordInterval(secs) => {
                self.record_interval_secs = validate_record_interval(secs)
            }
            StoreCommand::SetImagerEnables { arducam, lepton } => {
                self.arducam_enable = arducam;
                self.lepton_enable = lepton;
            }
            StoreCommand::SetWasRecording(flag) => self.was_recording = flag,
            StoreCommand::SetAutoResumeRetries(count) => self.auto_resume_retries = count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_closure_holds_for_default_store() {
        let store = PersistentStore::default();
        let bytes = store.to_bytes();
        let expected = checksum(&bytes[..STORE_SIZE - 1]);
        assert_eq!(bytes[STORE_SIZE - 1], expected);
    }

    #[test]
    fn write_then_read_is_bit_equal() {
        let mut store = PersistentStore::default_with_mac([0xAB, 0xCD]);
        store.gain_mode = GainModeSetting::Low;
        store.palette = Palette::Ironblack;
        store.record_interval_secs = 300;
        store.was_recording = true;
        store.auto_resume_retries = 3;
        let bytes = store.to_bytes();
        let restored = PersistentStore::from_bytes(&bytes);
        assert_eq!(restored.to_bytes(), bytes);
    }

    #[test]
    fn corrupted_store_reinitialises_from_defaults() {
        let mut bytes = PersistentStore::default().to_bytes();
        bytes[OFF_CHECKSUM] ^= 0xFF; // corrupt checksum
        let restored = PersistentStore::from_bytes(&bytes);
        assert_eq!(restored.to_bytes(), PersistentStore::default().to_bytes());
    }

    #[test]
    fn zeroed_store_reinitialises_from_defaults() {
        let bytes = [0u8; STORE_SIZE];
        let restored = PersistentStore::from_bytes(&bytes);
        assert_eq!(restored.wifi.ap_ip.render(), "192.168.4.1");
    }

    #[test]
    fn record_interval_snaps_to_first_valid_value() {
        assert_eq!(validate_record_interval(7), 1);
        assert_eq!(validate_record_interval(300), 300);
    }

    #[test]
    fn v1_upgrade_is_additive() {
        let mut store = PersistentStore::default();
        store.version = 1;
        store.was_recording = true; // pretend a v1 layout somehow had this set
        let upgraded = upgrade_layout(store.clone());
        assert_eq!(upgraded.version, 3);
        // upgrade initialises from default, not from whatever v1 happened to hold
        assert!(!upgraded.was_recording);
        assert_eq!(upgraded.auto_resume_retries, 0);
    }

    #[test]
    fn v2_upgrade_adds_auto_resume_retries() {
        let mut store = PersistentStore::default();
        store.version = 2;
        store.auto_resume_retries = 99; // pretend a v2 layout somehow had this set
        let upgraded = upgrade_layout(store);
        assert_eq!(upgraded.version, 3);
        assert_eq!(upgraded.auto_resume_retries, 0);
    }
}
