//! Silent synth that signals done after a fixed duration.
//!
//! Useful as a timer: attach it to a group and watch for the node to
//! disappear. It also exercises the done-signal round trip through the
//! worker.

use hc_engine::{PortDescriptor, Ports, Result, SynthOptions, SynthProcessor, World};
use rosc::OscType;

pub const DONE_AFTER_URI: &str = "helicon:done-after";

#[derive(Clone, Copy)]
pub struct DoneAfterOptions {
    seconds: f32,
}

impl SynthOptions for DoneAfterOptions {
    fn from_args(args: &[OscType]) -> Result<Self> {
        let seconds = match args.first() {
            Some(OscType::Float(value)) => *value,
            Some(OscType::Int(value)) => *value as f32,
            _ => 0.0,
        };
        Ok(Self { seconds: seconds.max(0.0) })
    }
}

pub struct DoneAfter {
    frames_left: f64,
    done: bool,
}

impl SynthProcessor for DoneAfter {
    type Options = DoneAfterOptions;
    const URI: &'static str = DONE_AFTER_URI;

    fn port(_options: &DoneAfterOptions, _index: usize) -> Option<PortDescriptor> {
        None
    }

    fn new(world: &World, options: &DoneAfterOptions) -> Self {
        Self {
            frames_left: options.seconds as f64 * world.sample_rate(),
            done: false,
        }
    }

    fn process(&mut self, world: &World, _ports: &mut Ports, num_frames: usize) {
        if self.done {
            return;
        }
        self.frames_left -= num_frames as f64;
        if self.frames_left <= 0.0 {
            self.done = true;
            world.synth_done();
        }
    }
}
