//! Engine time and OSC time-tag conversion.
//!
//! Engine time is `f64` seconds on the driver's clock. OSC bundles carry
//! 64-bit NTP time-tags; the tag value `1` (zero seconds, fractional one)
//! is the standard "immediate" sentinel.

use rosc::OscTime;

/// Engine time in seconds.
pub type Time = f64;

/// The OSC "immediate" time-tag.
pub const IMMEDIATE: OscTime = OscTime { seconds: 0, fractional: 1 };

const FRAC_PER_SECOND: f64 = 4_294_967_296.0; // 2^32

/// Convert an OSC time-tag to engine seconds.
pub fn osc_to_time(tag: OscTime) -> Time {
    tag.seconds as f64 + tag.fractional as f64 / FRAC_PER_SECOND
}

/// Convert engine seconds to an OSC time-tag.
///
/// Negative times clamp to zero; the result never collides with the
/// immediate sentinel for any time >= 1/2^32.
pub fn time_to_osc(time: Time) -> OscTime {
    let time = time.max(0.0);
    let seconds = time.floor();
    let fractional = ((time - seconds) * FRAC_PER_SECOND).round();
    if fractional >= FRAC_PER_SECOND {
        OscTime { seconds: seconds as u32 + 1, fractional: 0 }
    } else {
        OscTime { seconds: seconds as u32, fractional: fractional as u32 }
    }
}
