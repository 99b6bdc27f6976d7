//! Built-in synth definitions.
//!
//! Each module implements one [`hc_engine::SynthProcessor`] and the crate
//! exposes a single library entry point that registers them all with a
//! [`hc_engine::Host`].

mod dc;
mod done_after;
mod sine;
#[cfg(test)]
mod test_util;

pub use dc::{Dc, DC_URI};
pub use done_after::{DoneAfter, DONE_AFTER_URI};
pub use sine::{Sine, SINE_URI};

use hc_engine::{Host, SynthDef};

/// Library entry: register every built-in definition.
pub fn register_all(host: &mut Host) {
    host.register_synthdef(SynthDef::of::<Sine>());
    host.register_synthdef(SynthDef::of::<Dc>());
    host.register_synthdef(SynthDef::of::<DoneAfter>());
}
