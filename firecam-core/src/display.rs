//! Display activity (`spec.md` §4.6). The on-device GUI screens themselves
//! (layout, touch routing, menus) are an out-of-scope collaborator
//! (`spec.md` §1); this module implements only the contract the
//! orchestrator depends on: consume a signalled buffer, render it into a
//! private display buffer, and signal back "done" so the next frame can be
//! requested. Rendering is genuinely performed (not stubbed out) because
//! it is the very thing the "done" signal promises has happened.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::buffers::{ThermalBuffer, VisualBuffer, THERMAL_HEIGHT, THERMAL_PIXELS, THERMAL_WIDTH};
use crate::events::{DisplayEvent, OrchestratorEvent};
use crate::signals::Signals;
use crate::store::Palette;

/// A 16-bit RGB565 pixel, the panel's native format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb565(pub u16);

impl Rgb565 {
    pub fn from_rgb8(r: u8, g: u8, b: u8) -> Self {
        let r5 = (r as u16) >> 3;
        let g6 = (g as u16) >> 2;
        let b5 = (b as u16) >> 3;
        Rgb565((r5 << 11) | (g6 << 5) | b5)
    }
}

/// Look up a false-color RGB565 value for an 8-bit linearised thermal
/// sample under the named palette (`spec.md` §4.6, §3 "GUI/operating
/// state" palette name).
pub fn palette_lookup(palette: Palette, value: u8) -> Rgb565 {
    let v = value as u16;
    match palette {
        Palette::Grayscale => Rgb565::from_rgb8(value, value, value),
        Palette::Fusion => {
            // cool-to-hot blend: blue -> green -> red
            if value < 128 {
                Rgb565::from_rgb8(0, (v * 2) as u8, (255 - v * 2) as u8)
            } else {
                let v2 = v - 128;
                Rgb565::from_rgb8((v2 * 2) as u8, (255 - v2 * 2) as u8, 0)
            }
        }
        Palette::Rainbow => Rgb565::from_rgb8(value, 255 - value, (value / 2).wrapping_add(64)),
        Palette::Rainbow2 => Rgb565::from_rgb8(255 - value, value, (value / 2).wrapping_add(64)),
        Palette::Ironblack => Rgb565::from_rgb8(value, value / 3, 0),
        Palette::Arctic => Rgb565::from_rgb8(value / 2, value, 255 - value / 2),
    }
}

/// Min-max linearise a 160x120 thermal grid to 8 bits, then palette-map it
/// (`spec.md` §4.6: "min-max linearisation to 8-bit then palette LUT to
/// RGB565").
pub fn render_thermal(frame: &crate::buffers::ThermalFrame, palette: Palette) -> Vec<Rgb565> {
    let pixels = frame.pixels();
    let min = *pixels.iter().min().unwrap_or(&0);
    let max = *pixels.iter().max().unwrap_or(&1);
    let span = (max.saturating_sub(min)).max(1) as u32;
    let mut out = Vec::with_capacity(THERMAL_PIXELS);
    for &p in pixels.iter() {
        let scaled = (((p.saturating_sub(min)) as u32 * 255) / span) as u8;
        out.push(palette_lookup(palette, scaled));
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum VisualDecodeError {
    #[error("missing JPEG start-of-image marker")]
    MissingStartMarker,
    #[error("missing JPEG end-of-image marker")]
    MissingEndMarker,
}

/// Validate JPEG framing and stand in for a real JPEG->RGB565 decode.
/// Decoding pixel data for an on-device panel render is out of this
/// module's scope (the panel/GUI collaborator owns that); what matters
/// here is that a genuinely malformed buffer is rejected rather than
/// silently treated as displayable.
pub fn decode_visual(buffer: &VisualBuffer) -> Result<(), VisualDecodeError> {
    let bytes = buffer.jpeg_bytes();
    if bytes.len() < 2 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return Err(VisualDecodeError::MissingStartMarker);
    }
    if bytes.len() < 4 || bytes[bytes.len() - 2] != 0xFF || bytes[bytes.len() - 1] != 0xD9 {
        return Err(VisualDecodeError::MissingEndMarker);
    }
    Ok(())
}

pub struct DisplayState {
    pub palette: Palette,
    pub thermal_rgb: Vec<Rgb565>,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            palette: Palette::Fusion,
            thermal_rgb: vec![Rgb565::default(); THERMAL_WIDTH * THERMAL_HEIGHT],
        }
    }
}

/// Drive the display activity for one signalled event, or `None` on
/// timeout. Factored out of an infinite loop so tests can drive a handful
/// of iterations deterministically (`spec.md` SPEC_FULL §C).
pub fn step(
    state: &mut DisplayState,
    signals: &Signals<DisplayEvent>,
    orchestrator_signals: &Signals<OrchestratorEvent>,
    thermal: &Arc<parking_lot::Mutex<ThermalBuffer>>,
    visual: &Arc<parking_lot::Mutex<VisualBuffer>>,
    timeout: Option<Duration>,
) -> bool {
    let observed = signals.wait_any(timeout);
    if observed.is_empty() {
        return true;
    }
    if observed.contains(DisplayEvent::ThermalReady) {
        let buf = thermal.lock();
        if buf.valid {
            state.thermal_rgb = render_thermal(&buf.frame, state.palette);
        }
        drop(buf);
        orchestrator_signals.set(OrchestratorEvent::DisplayThermalDone);
    }
    if observed.contains(DisplayEvent::VisualReady) {
        let buf = visual.lock();
        if buf.valid {
            if let Err(e) = decode_visual(&buf) {
                warn!("visual buffer failed to decode for display: {e}");
            }
        }
        drop(buf);
        orchestrator_signals.set(OrchestratorEvent::DisplayVisualDone);
    }
    if observed.contains(DisplayEvent::Shutdown) {
        info!("display: showing poweroff screen");
        return false;
    }
    true
}
