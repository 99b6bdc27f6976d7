//! Sine oscillator.

use std::f64::consts::TAU;

use hc_engine::{PortDescriptor, PortKind, Ports, SynthProcessor, World};

pub const SINE_URI: &str = "helicon:sine";

/// Control inputs: 0 = frequency in Hz, 1 = amplitude. Port 2 is the audio
/// output.
pub struct Sine {
    phase: f64,
}

impl SynthProcessor for Sine {
    type Options = ();
    const URI: &'static str = SINE_URI;

    fn port(_options: &(), index: usize) -> Option<PortDescriptor> {
        match index {
            0 | 1 => Some(PortDescriptor::new(PortKind::ControlInput)),
            2 => Some(PortDescriptor::new(PortKind::AudioOutput)),
            _ => None,
        }
    }

    fn new(_world: &World, _options: &()) -> Self {
        Self { phase: 0.0 }
    }

    fn process(&mut self, world: &World, ports: &mut Ports, num_frames: usize) {
        let freq = ports.control(0) as f64;
        let amp = ports.control(1);
        let increment = TAU * freq / world.sample_rate();

        let out = ports.audio(2);
        for sample in out[..num_frames].iter_mut() {
            *sample = self.phase.sin() as f32 * amp;
            self.phase += increment;
            if self.phase >= TAU {
                self.phase -= TAU;
            }
        }
    }
}
