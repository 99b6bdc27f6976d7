//! Synth nodes: DSP instances attached to the tree.
//!
//! A synth owns arena-allocated storage (its control values, its per-port
//! audio scratch, and the DSP instance itself) plus index-based connection
//! tables mapping audio ports to buses. Per block it pulls mapped buses
//! into scratch, hands port pointers to the instance, runs it, and pushes
//! scratch back out under the bus write rule.

use std::ptr::NonNull;
use std::sync::Arc;

use arrayvec::ArrayVec;
use hc_proto::{AudioBusId, ErrorKind, InputKind, NodeId, OutputKind};
use rosc::OscType;

use crate::arena::RtArena;
use crate::bus::{AudioBus, BusBank, Epoch};
use crate::error::{EngineError, Result};
use crate::node::NodeHeader;
use crate::synthdef::{PortKind, SynthDef, World, MAX_SYNTH_PORTS};

/// Hard cap on audio connections per direction.
pub const MAX_AUDIO_CONNECTIONS: usize = 8;

/// A bus address: which bus space, and the index within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusRef {
    pub external: bool,
    pub index: AudioBusId,
}

/// Mapping state of one audio input port.
#[derive(Clone, Copy, Debug)]
pub struct AudioInputConnection {
    pub port: usize,
    pub bus: Option<BusRef>,
    pub kind: InputKind,
}

/// Mapping state of one audio output port.
#[derive(Clone, Copy, Debug)]
pub struct AudioOutputConnection {
    pub port: usize,
    pub bus: Option<BusRef>,
    pub kind: OutputKind,
}

/// Resolved placement of one definition port: its kind and its ordinal
/// among ports of that kind.
#[derive(Clone, Copy)]
struct PortSlot {
    kind: PortKind,
    slot: usize,
}

pub struct Synth {
    pub(crate) header: NodeHeader,
    def: Arc<SynthDef>,
    instance: NonNull<u8>,
    /// One arena block: control inputs, control outputs, then one
    /// block-length scratch buffer per audio port.
    buffers: NonNull<f32>,
    ports: ArrayVec<PortSlot, MAX_SYNTH_PORTS>,
    num_control_inputs: usize,
    num_control_outputs: usize,
    inputs: ArrayVec<AudioInputConnection, MAX_AUDIO_CONNECTIONS>,
    outputs: ArrayVec<AudioOutputConnection, MAX_AUDIO_CONNECTIONS>,
    block_size: usize,
    sample_offset: usize,
    active: bool,
    done_sent: bool,
    released: bool,
}

impl Synth {
    /// Decode options, size the port layout, and placement-construct the
    /// DSP instance in realtime memory. Audio-thread only.
    pub(crate) fn construct(
        world: &World,
        arena: &RtArena,
        def: Arc<SynthDef>,
        id: NodeId,
        controls: &[f32],
        options_args: &[OscType],
        block_size: usize,
    ) -> Result<Self> {
        let options_layout = def.options_layout();
        let options = if options_layout.size() == 0 {
            NonNull::dangling()
        } else {
            arena
                .alloc_aligned(options_layout.align(), options_layout.size())
                .ok_or_else(|| EngineError::with_message(ErrorKind::AllocFailure, "synth options"))?
        };
        let free_options = |arena: &RtArena| {
            if options_layout.size() > 0 {
                unsafe { arena.free(options) };
            }
        };

        if let Err(err) = def.configure(options_args, options) {
            free_options(arena);
            return Err(err);
        }

        // Enumerate the port layout; it may depend on the decoded options.
        let mut ports: ArrayVec<PortSlot, MAX_SYNTH_PORTS> = ArrayVec::new();
        let mut counts = [0usize; 4];
        loop {
            let index = ports.len();
            let Some(descriptor) = def.port_descriptor(options, index) else { break };
            let group = match descriptor.kind {
                PortKind::ControlInput => 0,
                PortKind::ControlOutput => 1,
                PortKind::AudioInput => 2,
                PortKind::AudioOutput => 3,
            };
            let slot = counts[group];
            counts[group] += 1;
            if ports.try_push(PortSlot { kind: descriptor.kind, slot }).is_err() {
                free_options(arena);
                return Err(EngineError::with_message(ErrorKind::ArgumentRange, "too many ports"));
            }
        }
        let [num_control_inputs, num_control_outputs, num_audio_inputs, num_audio_outputs] = counts;
        if num_audio_inputs > MAX_AUDIO_CONNECTIONS || num_audio_outputs > MAX_AUDIO_CONNECTIONS {
            free_options(arena);
            return Err(EngineError::with_message(ErrorKind::ArgumentRange, "too many audio ports"));
        }

        let total_samples = num_control_inputs
            + num_control_outputs
            + (num_audio_inputs + num_audio_outputs) * block_size;
        let Some(buffers) = arena.alloc_samples(total_samples.max(1)) else {
            free_options(arena);
            return Err(EngineError::with_message(ErrorKind::AllocFailure, "synth buffers"));
        };

        let instance_layout = def.instance_layout();
        let Some(instance) = arena.alloc_aligned(instance_layout.align(), instance_layout.size())
        else {
            unsafe { arena.free(buffers.cast()) };
            free_options(arena);
            return Err(EngineError::with_message(ErrorKind::AllocFailure, "synth instance"));
        };

        def.construct(world, options, instance);
        free_options(arena);

        let mut synth = Self {
            header: NodeHeader::new(id, None),
            def,
            instance,
            buffers,
            ports,
            num_control_inputs,
            num_control_outputs,
            inputs: (0..num_audio_inputs)
                .map(|port| AudioInputConnection { port, bus: None, kind: InputKind::In })
                .collect(),
            outputs: (0..num_audio_outputs)
                .map(|port| AudioOutputConnection { port, bus: None, kind: OutputKind::Out })
                .collect(),
            block_size,
            sample_offset: 0,
            active: false,
            done_sent: false,
            released: false,
        };

        for (index, value) in controls.iter().take(num_control_inputs).enumerate() {
            unsafe { synth.control_ptr(index).write(*value) };
        }

        Ok(synth)
    }

    pub fn id(&self) -> NodeId {
        self.header.id
    }

    pub fn num_audio_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_audio_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn num_control_inputs(&self) -> usize {
        self.num_control_inputs
    }

    pub fn num_control_outputs(&self) -> usize {
        self.num_control_outputs
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Begin producing audio, silent for the first `sample_offset` samples
    /// of the next processed block.
    pub fn activate(&mut self, sample_offset: usize) {
        self.active = true;
        self.sample_offset = sample_offset;
    }

    pub fn control_input(&self, index: usize) -> Result<f32> {
        self.check_control(index)?;
        Ok(unsafe { self.control_ptr(index).read() })
    }

    pub fn set_control_input(&mut self, index: usize, value: f32) -> Result<()> {
        self.check_control(index)?;
        unsafe { self.control_ptr(index).write(value) };
        Ok(())
    }

    pub fn map_input(&mut self, port: usize, bus: Option<BusRef>, kind: InputKind) -> Result<()> {
        let connection = self.inputs.get_mut(port).ok_or_else(|| {
            EngineError::with_message(ErrorKind::ArgumentRange, "input port out of range")
        })?;
        connection.bus = bus;
        connection.kind = kind;
        Ok(())
    }

    pub fn map_output(&mut self, port: usize, bus: Option<BusRef>, kind: OutputKind) -> Result<()> {
        let connection = self.outputs.get_mut(port).ok_or_else(|| {
            EngineError::with_message(ErrorKind::ArgumentRange, "output port out of range")
        })?;
        connection.bus = bus;
        connection.kind = kind;
        Ok(())
    }

    /// Process one block: pull inputs, run the instance, push outputs,
    /// relay a done signal.
    pub(crate) fn process(
        &mut self,
        world: &World,
        buses: &BusBank,
        epoch: Epoch,
        num_frames: usize,
    ) {
        if !self.active {
            return;
        }
        let offset = self.sample_offset.min(num_frames);
        self.sample_offset = 0;

        for connection in &self.inputs {
            let scratch = self.audio_scratch(AUDIO_IN, connection.port);
            let dst = unsafe { std::slice::from_raw_parts_mut(scratch, num_frames) };
            match connection.bus.as_ref().and_then(|b| resolve_input(buses, b)) {
                Some(bus) => {
                    let lag = match connection.kind {
                        InputKind::In => 0,
                        InputKind::InFeedback => 1,
                    };
                    bus.read_into(dst, epoch, lag);
                }
                None => dst.fill(0.0),
            }
        }

        for (index, port) in self.ports.iter().enumerate() {
            let data = match port.kind {
                PortKind::ControlInput => self.control_ptr(port.slot),
                PortKind::ControlOutput => self.control_ptr(self.num_control_inputs + port.slot),
                PortKind::AudioInput => {
                    unsafe { self.audio_scratch(AUDIO_IN, port.slot).add(offset) }
                }
                PortKind::AudioOutput => {
                    unsafe { self.audio_scratch(AUDIO_OUT, port.slot).add(offset) }
                }
            };
            self.def.connect(self.instance, index, data);
        }

        self.def.process(world, self.instance, num_frames - offset);

        for connection in &self.outputs {
            let scratch = self.audio_scratch(AUDIO_OUT, connection.port);
            let out = unsafe { std::slice::from_raw_parts_mut(scratch, num_frames) };
            out[..offset].fill(0.0);
            if let Some(bus) = connection.bus.as_ref().and_then(|b| resolve_output(buses, b)) {
                bus.write_from(out, epoch, connection.kind == OutputKind::ReplaceOut);
            }
        }

        if world.take_done() && !self.done_sent {
            self.done_sent = true;
            world.send_node_done(self.header.id);
        }
    }

    /// Destroy the DSP instance and return all storage to the arena.
    /// Called exactly once, on the audio thread, when the node is removed.
    pub(crate) fn release_resources(&mut self, arena: &RtArena) {
        if self.released {
            return;
        }
        self.released = true;
        self.def.destroy(self.instance);
        unsafe {
            arena.free(self.instance);
            arena.free(self.buffers.cast());
        }
    }

    fn check_control(&self, index: usize) -> Result<()> {
        if index < self.num_control_inputs {
            Ok(())
        } else {
            Err(EngineError::with_message(ErrorKind::ArgumentRange, "control index out of range"))
        }
    }

    fn control_ptr(&self, index: usize) -> *mut f32 {
        debug_assert!(index < self.num_control_inputs + self.num_control_outputs);
        unsafe { self.buffers.as_ptr().add(index) }
    }

    fn audio_scratch(&self, direction: usize, slot: usize) -> *mut f32 {
        let controls = self.num_control_inputs + self.num_control_outputs;
        let audio_index = if direction == AUDIO_IN { slot } else { self.inputs.len() + slot };
        unsafe { self.buffers.as_ptr().add(controls + audio_index * self.block_size) }
    }
}

const AUDIO_IN: usize = 0;
const AUDIO_OUT: usize = 1;

fn resolve_input<'a>(buses: &'a BusBank, bus: &BusRef) -> Option<&'a AudioBus> {
    if bus.external {
        buses.external_input(bus.index as usize)
    } else {
        buses.internal(bus.index as usize)
    }
}

fn resolve_output<'a>(buses: &'a BusBank, bus: &BusRef) -> Option<&'a AudioBus> {
    if bus.external {
        buses.external_output(bus.index as usize)
    } else {
        buses.internal(bus.index as usize)
    }
}
