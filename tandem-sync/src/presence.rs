//! Participant identity and cursor presence.
//!
//! The server assigns every connection a color and display name at connect
//! time; both live as long as the connection. Cursor positions are
//! rate-limited at the source with [`CursorThrottle`]; the server relays
//! whatever arrives.

use std::time::{Duration, Instant};

use crate::protocol::{ClientMessage, Participant, ParticipantId};

/// Default minimum spacing between cursor messages (20 per second).
pub const DEFAULT_CURSOR_INTERVAL: Duration = Duration::from_millis(50);

/// Build the roster entry for a fresh connection.
pub fn assign_participant(id: ParticipantId) -> Participant {
    Participant {
        color: participant_color(&id),
        display_name: display_name(&id),
        id,
    }
}

/// Stable, vivid `#rrggbb` color derived from the id.
///
/// The hue comes from an FNV-1a hash of the id; saturation and lightness
/// are fixed so every cursor stays readable on a white canvas.
pub fn participant_color(id: &ParticipantId) -> String {
    let hue = (fnv1a(id.as_str().as_bytes()) % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

/// `Guest-xxxx` from the first alphanumeric characters of the id.
pub fn display_name(id: &ParticipantId) -> String {
    let tag: String = id
        .as_str()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(4)
        .collect();
    format!("Guest-{tag}")
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Source-side rate limiter for cursor messages.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    /// Latest position that was throttled away.
    pending: Option<(f64, f64)>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
        }
    }

    /// Offer a pointer position observed at `now`.
    ///
    /// Returns a `cursor` message when enough time has passed since the last
    /// one; otherwise remembers the position for [`CursorThrottle::flush`].
    pub fn offer(&mut self, x: f64, y: f64, now: Instant) -> Option<ClientMessage> {
        let due = self
            .last_sent
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if !due {
            self.pending = Some((x, y));
            return None;
        }

        self.last_sent = Some(now);
        self.pending = None;
        Some(ClientMessage::Cursor { x, y, color: None })
    }

    /// Emit the last throttled position, if any (e.g. when the pointer stops).
    pub fn flush(&mut self, now: Instant) -> Option<ClientMessage> {
        let (x, y) = self.pending.take()?;
        self.last_sent = Some(now);
        Some(ClientMessage::Cursor { x, y, color: None })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_INTERVAL)
    }
}
