//! Crank-angle helpers.
//!
//! Interrupt-side code works in unsigned Q16.16 degrees over a 720° cycle so
//! no floating point is needed once an event has been armed. Planning code
//! works in `f32` degrees and converts at the scheduler boundary.

use libm::{fmodf, roundf};

/// Unsigned Q16.16 crank angle in degrees, always in `[0, Q_720)`.
pub type AngleQ = u32;

pub const Q_SHIFT: u32 = 16;
pub const Q_ONE: AngleQ = 1 << Q_SHIFT;
pub const Q_180: AngleQ = 180 << Q_SHIFT;
pub const Q_360: AngleQ = 360 << Q_SHIFT;
pub const Q_720: AngleQ = 720 << Q_SHIFT;

/// Converts whole degrees into Q16.16.
#[must_use]
pub const fn deg_to_q(degrees: u32) -> AngleQ {
    (degrees % 720) << Q_SHIFT
}

/// Converts floating degrees into Q16.16, rounding to the nearest step.
///
/// Non-finite and non-positive inputs map to zero; inputs past one cycle are
/// folded back into `[0, 720)`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn angle_deg_to_q(degrees: f32) -> AngleQ {
    if !degrees.is_finite() || degrees <= 0.0 {
        return 0;
    }
    let folded = if degrees >= 720.0 {
        fmodf(degrees, 720.0)
    } else {
        degrees
    };
    let raw = roundf(folded * Q_ONE as f32) as u32;
    raw % Q_720
}

/// Converts Q16.16 back into floating degrees.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn q_to_deg(angle: AngleQ) -> f32 {
    angle as f32 / Q_ONE as f32
}

/// Wraps a Q16.16 value into one engine cycle.
#[must_use]
pub const fn wrap_q720(angle: AngleQ) -> AngleQ {
    angle % Q_720
}

/// Forward angular distance from `from` to `to`, both within one cycle.
#[must_use]
pub const fn forward_distance(from: AngleQ, to: AngleQ) -> AngleQ {
    let from = wrap_q720(from);
    let to = wrap_q720(to);
    if to >= from { to - from } else { to + Q_720 - from }
}

/// Wraps floating degrees into `[0, 720)`.
#[must_use]
pub fn wrap720(degrees: f32) -> f32 {
    wrap_to(degrees, 720.0)
}

/// Wraps floating degrees into `[0, 360)`.
#[must_use]
pub fn wrap360(degrees: f32) -> f32 {
    wrap_to(degrees, 360.0)
}

fn wrap_to(degrees: f32, span: f32) -> f32 {
    if !degrees.is_finite() {
        return 0.0;
    }
    let wrapped = fmodf(degrees, span);
    if wrapped < 0.0 {
        let lifted = wrapped + span;
        if lifted >= span { 0.0 } else { lifted }
    } else {
        wrapped
    }
}
