//! Constant (DC) source.

use hc_engine::{PortDescriptor, PortKind, Ports, SynthProcessor, World};

pub const DC_URI: &str = "helicon:dc";

/// Control input 0 is the level; port 1 is the audio output.
pub struct Dc;

impl SynthProcessor for Dc {
    type Options = ();
    const URI: &'static str = DC_URI;

    fn port(_options: &(), index: usize) -> Option<PortDescriptor> {
        match index {
            0 => Some(PortDescriptor::new(PortKind::ControlInput)),
            1 => Some(PortDescriptor::new(PortKind::AudioOutput)),
            _ => None,
        }
    }

    fn new(_world: &World, _options: &()) -> Self {
        Dc
    }

    fn process(&mut self, _world: &World, ports: &mut Ports, num_frames: usize) {
        let level = ports.control(0);
        ports.audio(1)[..num_frames].fill(level);
    }
}
