//! Wi-Fi configuration (`spec.md` §3 "Wi-Fi configuration", §6 "IP
//! addresses are rendered and parsed as...").

use std::fmt;

use crate::store::FixedStr;

pub const FLAG_ENABLED: u8 = 1 << 0;
pub const FLAG_INITIALISED: u8 = 1 << 2;
pub const FLAG_CONNECTED: u8 = 1 << 3;
pub const FLAG_STATIC_IP: u8 = 1 << 4;
pub const FLAG_CLIENT_MODE: u8 = 1 << 7;

/// Bits a `set_wifi` command is permitted to change; all others are
/// masked out (`spec.md` §6: "only bits 7, 4, and 0 are user-settable").
pub const FLAG_USER_SETTABLE_MASK: u8 = FLAG_CLIENT_MODE | FLAG_STATIC_IP | FLAG_ENABLED;

/// An IPv4 address stored with the least-significant octet at index 0.
///
/// This is intentionally asymmetric with how it prints and parses: the
/// wire/user-facing form is the conventional `"a.b.c.d"` (most-significant
/// octet first), but the internal array has `a` at index 3 and the
/// least-significant octet at index 0. `spec.md` §6 and §9 call this out
/// explicitly and mandate preserving it exactly for wire compatibility;
/// do not "fix" it to a more natural layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ipv4Bytes(pub [u8; 4]);

#[derive(Debug, thiserror::Error)]
pub enum Ipv4ParseError {
    #[error("expected 4 dot-separated octets, got {0}")]
    WrongOctetCount(usize),
    #[error("octet {0:?} is not a valid u8")]
    BadOctet(String),
}

impl Ipv4Bytes {
    /// Render as `"a.b.c.d"`, reading indices [3][2][1][0].
    pub fn render(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }

    /// Parse `"a.b.c.d"`, writing octets left-to-right into [3][2][1][0].
    pub fn parse(s: &str) -> Result<Self, Ipv4ParseError> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return Err(Ipv4ParseError::WrongOctetCount(parts.len()));
        }
        let mut out = [0u8; 4];
        for (i, part) in parts.iter().enumerate() {
            let octet: u8 = part
                .parse()
                .map_err(|_| Ipv4ParseError::BadOctet(part.to_string()))?;
            out[3 - i] = octet;
        }
        Ok(Ipv4Bytes(out))
    }
}

impl fmt::Display for Ipv4Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone)]
pub struct WifiConfig {
    pub ap_ssid: FixedStr<32>,
    pub sta_ssid: FixedStr<32>,
    pub ap_pw: FixedStr<32>,
    pub sta_pw: FixedStr<32>,
    pub flags: u8,
    pub ap_ip: Ipv4Bytes,
    pub sta_ip: Ipv4Bytes,
    pub cur_ip: Ipv4Bytes,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ap_ssid: FixedStr::from_str("firecam-0000"),
            sta_ssid: FixedStr::from_str(""),
            ap_pw: FixedStr::from_str(""),
            sta_pw: FixedStr::from_str(""),
            flags: FLAG_ENABLED,
            ap_ip: Ipv4Bytes::parse("192.168.4.1").unwrap(),
            sta_ip: Ipv4Bytes::default(),
            cur_ip: Ipv4Bytes::default(),
        }
    }
}

impl WifiConfig {
    /// Default AP SSID: `firecam-<4 hex digits>` derived from the last two
    /// bytes of the soft-AP MAC address (`spec.md` §6).
    pub fn default_ap_ssid(mac_last_two_bytes: [u8; 2]) -> FixedStr<32> {
        FixedStr::from_str(&format!(
            "firecam-{:02x}{:02x}",
            mac_last_two_bytes[0], mac_last_two_bytes[1]
        ))
    }

    pub fn with_mac(mac_last_two_bytes: [u8; 2]) -> Self {
        Self {
            ap_ssid: Self::default_ap_ssid(mac_last_two_bytes),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.flags & FLAG_ENABLED != 0
    }

    pub fn is_client_mode(&self) -> bool {
        self.flags & FLAG_CLIENT_MODE != 0
    }

    pub fn is_static_ip(&self) -> bool {
        self.flags & FLAG_STATIC_IP != 0
    }

    /// Apply a `set_wifi` request, masking `flags` to only the
    /// user-settable bits (`spec.md` §6).
    pub fn apply_set_wifi(
        &mut self,
        ap_ssid: Option<&str>,
        ap_pw: Option<&str>,
        sta_ssid: Option<&str>,
        sta_pw: Option<&str>,
        flags: Option<u8>,
        ap_ip: Option<Ipv4Bytes>,
        sta_ip: Option<Ipv4Bytes>,
    ) {
        if let Some(v) = ap_ssid {
            self.ap_ssid = FixedStr::from_str(v);
        }
        if let Some(v) = ap_pw {
            self.ap_pw = FixedStr::from_str(v);
        }
        if let Some(v) = sta_ssid {
            self.sta_ssid = FixedStr::from_str(v);
        }
        if let Some(v) = sta_pw {
            self.sta_pw = FixedStr::from_str(v);
        }
        if let Some(requested) = flags {
            let kept = self.flags & !FLAG_USER_SETTABLE_MASK;
            let applied = requested & FLAG_USER_SETTABLE_MASK;
            self.flags = kept | applied;
        }
        if let Some(v) = ap_ip {
            self.ap_ip = v;
        }
        if let Some(v) = sta_ip {
            self.sta_ip = v;
        }
    }
}

/// WPA2 requires at least 8 characters; an empty password (open network) is
/// also accepted. `spec.md` §8: "password length 1..7 is rejected... when
/// originating from the on-device keyboard". The on-device keyboard itself
/// is out of scope; this validator is the hook a future keyboard UI calls.
pub fn is_valid_wpa2_password(pw: &str) -> bool {
    pw.is_empty() || pw.len() >= 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_round_trip_all_octets() {
        for a in [0u8, 1, 127, 254, 255] {
            for d in [0u8, 1, 192, 255] {
                let s = format!("{a}.10.20.{d}");
                let bytes = Ipv4Bytes::parse(&s).unwrap();
                assert_eq!(bytes.render(), s);
            }
        }
    }

    #[test]
    fn ipv4_internal_layout_is_reversed() {
        let bytes = Ipv4Bytes::parse("192.168.4.1").unwrap();
        assert_eq!(bytes.0, [1, 4, 168, 192]);
    }

    #[test]
    fn set_wifi_masks_flags_to_user_settable_bits() {
        let mut wifi = WifiConfig::default();
        wifi.apply_set_wifi(
            Some("cam"),
            None,
            None,
            None,
            Some(145), // 0b1001_0001: bits 7,4,0 -> matches spec scenario 6
            None,
            None,
        );
        assert_eq!(wifi.flags, 0x91);
        assert_eq!(wifi.ap_ssid.as_str(), "cam");
    }

    #[test]
    fn wpa2_password_length_boundary() {
        assert!(is_valid_wpa2_password(""));
        assert!(!is_valid_wpa2_password("short1"));
        assert!(is_valid_wpa2_password("longenough"));
    }
}
