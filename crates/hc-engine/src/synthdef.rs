//! The SynthDef plugin contract.
//!
//! A [`SynthDef`] is an immutable descriptor registered by a plugin:
//! instance and options layouts plus function pointers for configure,
//! port enumeration, placement construction, port connection, block
//! processing, and destruction. Instances are placement-constructed into
//! arena storage on the audio thread, so the raw surface is
//! pointer-based; the [`SynthClass`]-style adapter [`SynthDef::of`] lifts a
//! safe [`SynthProcessor`] implementation into that surface and keeps all
//! the unsafety in this module.
//!
//! [`World`] is the capability handle plugins see during construction and
//! processing: sample rate, block size, realtime alloc/free, the worker
//! command hook, and the done signal.

use std::alloc::Layout;
use std::cell::Cell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_channel::Sender;
use hc_proto::{ErrorKind, NodeId};
use rosc::OscType;

use crate::arena::RtArena;
use crate::error::{EngineError, Result};
use crate::worker::{Command, HostPerformFn};

/// Hard cap on ports per synth definition.
pub const MAX_SYNTH_PORTS: usize = 16;

/// What a port carries and which way it flows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortKind {
    AudioInput,
    AudioOutput,
    ControlInput,
    ControlOutput,
}

/// Description of one port of a synth definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortDescriptor {
    pub kind: PortKind,
}

impl PortDescriptor {
    pub const fn new(kind: PortKind) -> Self {
        Self { kind }
    }
}

/// Constructor options decoded from the OSC argument stream of a
/// `/synth/new` message.
///
/// Decoding runs on the audio thread, hence the `Copy` bound: options are
/// plain data and never own heap storage.
pub trait SynthOptions: Copy + 'static {
    fn from_args(args: &[OscType]) -> Result<Self>;
}

/// Option-less synth definitions.
impl SynthOptions for () {
    fn from_args(_args: &[OscType]) -> Result<Self> {
        Ok(())
    }
}

/// Safe face of the plugin contract. Implementations describe their ports,
/// construct from decoded options, and fill buffers one block at a time.
pub trait SynthProcessor: Sized + 'static {
    type Options: SynthOptions;

    /// Registry key for this definition.
    const URI: &'static str;

    /// Enumerate ports; `None` past the last port. Port layout may depend
    /// on the decoded options.
    fn port(options: &Self::Options, index: usize) -> Option<PortDescriptor>;

    fn new(world: &World, options: &Self::Options) -> Self;

    fn process(&mut self, world: &World, ports: &mut Ports, num_frames: usize);
}

/// Per-process view of the buffers connected to each port.
pub struct Ports<'a> {
    bufs: &'a [*mut f32; MAX_SYNTH_PORTS],
    num_frames: usize,
}

impl Ports<'_> {
    /// Audio buffer connected to `port`, one block long.
    pub fn audio(&mut self, port: usize) -> &mut [f32] {
        let ptr = self.bufs[port];
        debug_assert!(!ptr.is_null(), "audio port {} not connected", port);
        unsafe { std::slice::from_raw_parts_mut(ptr, self.num_frames) }
    }

    /// Current value of a control port.
    pub fn control(&self, port: usize) -> f32 {
        let ptr = self.bufs[port];
        debug_assert!(!ptr.is_null(), "control port {} not connected", port);
        unsafe { *ptr }
    }

    /// Write a control output.
    pub fn set_control(&mut self, port: usize, value: f32) {
        let ptr = self.bufs[port];
        debug_assert!(!ptr.is_null(), "control port {} not connected", port);
        unsafe { *ptr = value }
    }
}

type ConfigureFn = fn(&[OscType], NonNull<u8>) -> Result<()>;
type PortFn = fn(NonNull<u8>, usize) -> Option<PortDescriptor>;
type ConstructFn = fn(&World, NonNull<u8>, NonNull<u8>);
type ConnectFn = fn(NonNull<u8>, usize, *mut f32);
type ProcessFn = fn(&World, NonNull<u8>, usize);
type DestroyFn = fn(NonNull<u8>);

/// A registered synth definition. Immutable once registered; lives for the
/// engine's lifetime.
#[derive(Debug)]
pub struct SynthDef {
    uri: &'static str,
    instance_layout: Layout,
    options_layout: Layout,
    configure: ConfigureFn,
    port_descriptor: PortFn,
    construct: ConstructFn,
    connect: ConnectFn,
    process: ProcessFn,
    destroy: Option<DestroyFn>,
}

impl SynthDef {
    /// Build the descriptor for a [`SynthProcessor`] implementation.
    pub fn of<P: SynthProcessor>() -> Self {
        Self {
            uri: P::URI,
            instance_layout: Layout::new::<Instance<P>>(),
            options_layout: Layout::new::<P::Options>(),
            configure: raw_configure::<P>,
            port_descriptor: raw_port::<P>,
            construct: raw_construct::<P>,
            connect: raw_connect::<P>,
            process: raw_process::<P>,
            destroy: Some(raw_destroy::<P>),
        }
    }

    pub fn uri(&self) -> &'static str {
        self.uri
    }

    pub fn instance_layout(&self) -> Layout {
        self.instance_layout
    }

    pub fn options_layout(&self) -> Layout {
        self.options_layout
    }

    /// Decode constructor arguments into `options` storage.
    pub(crate) fn configure(&self, args: &[OscType], options: NonNull<u8>) -> Result<()> {
        (self.configure)(args, options)
    }

    pub(crate) fn port_descriptor(&self, options: NonNull<u8>, index: usize) -> Option<PortDescriptor> {
        (self.port_descriptor)(options, index)
    }

    pub(crate) fn construct(&self, world: &World, options: NonNull<u8>, instance: NonNull<u8>) {
        (self.construct)(world, options, instance)
    }

    pub(crate) fn connect(&self, instance: NonNull<u8>, port: usize, data: *mut f32) {
        (self.connect)(instance, port, data)
    }

    pub(crate) fn process(&self, world: &World, instance: NonNull<u8>, num_frames: usize) {
        (self.process)(world, instance, num_frames)
    }

    pub(crate) fn destroy(&self, instance: NonNull<u8>) {
        if let Some(destroy) = self.destroy {
            destroy(instance)
        }
    }
}

/// Arena-resident wrapper around a processor: the connected-port table
/// plus the processor state.
struct Instance<P: SynthProcessor> {
    ports: [*mut f32; MAX_SYNTH_PORTS],
    processor: P,
}

fn raw_configure<P: SynthProcessor>(args: &[OscType], out: NonNull<u8>) -> Result<()> {
    let options = P::Options::from_args(args)?;
    unsafe { out.cast::<P::Options>().as_ptr().write(options) };
    Ok(())
}

fn raw_port<P: SynthProcessor>(options: NonNull<u8>, index: usize) -> Option<PortDescriptor> {
    P::port(unsafe { options.cast::<P::Options>().as_ref() }, index)
}

fn raw_construct<P: SynthProcessor>(world: &World, options: NonNull<u8>, instance: NonNull<u8>) {
    let processor = P::new(world, unsafe { options.cast::<P::Options>().as_ref() });
    unsafe {
        instance.cast::<Instance<P>>().as_ptr().write(Instance {
            ports: [std::ptr::null_mut(); MAX_SYNTH_PORTS],
            processor,
        });
    }
}

fn raw_connect<P: SynthProcessor>(instance: NonNull<u8>, port: usize, data: *mut f32) {
    debug_assert!(port < MAX_SYNTH_PORTS);
    unsafe { instance.cast::<Instance<P>>().as_mut().ports[port] = data };
}

fn raw_process<P: SynthProcessor>(world: &World, instance: NonNull<u8>, num_frames: usize) {
    let Instance { ports, processor } = unsafe { instance.cast::<Instance<P>>().as_mut() };
    let mut ports = Ports { bufs: ports, num_frames };
    processor.process(world, &mut ports, num_frames);
}

fn raw_destroy<P: SynthProcessor>(instance: NonNull<u8>) {
    unsafe { std::ptr::drop_in_place(instance.cast::<Instance<P>>().as_ptr()) };
}

/// Registry of synth definitions keyed by URI. Written during startup or
/// worker-mediated registration; the audio thread only reads it.
pub struct SynthDefRegistry {
    defs: HashMap<&'static str, Arc<SynthDef>>,
}

impl SynthDefRegistry {
    pub fn new() -> Self {
        Self { defs: HashMap::new() }
    }

    pub fn insert(&mut self, def: SynthDef) {
        let uri = def.uri();
        if self.defs.insert(uri, Arc::new(def)).is_some() {
            log::warn!(target: "engine", "synthdef {} re-registered, replacing", uri);
        }
    }

    pub fn lookup(&self, uri: &str) -> Result<Arc<SynthDef>> {
        self.defs
            .get(uri)
            .cloned()
            .ok_or_else(|| EngineError::with_message(ErrorKind::SynthDefNotFound, uri))
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

impl Default for SynthDefRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Interface to an external sound-file decoder, registered by plugins and
/// looked up by MIME type. Decoding itself lives outside the engine.
pub trait SoundFileApi: Send + Sync {
    fn mime_type(&self) -> &str;
}

/// Capability handle passed to plugin code on the audio thread.
pub struct World<'a> {
    sample_rate: f64,
    block_size: usize,
    arena: &'a RtArena,
    to_worker: &'a Sender<Command>,
    done: Cell<bool>,
}

impl<'a> World<'a> {
    pub(crate) fn new(
        sample_rate: f64,
        block_size: usize,
        arena: &'a RtArena,
        to_worker: &'a Sender<Command>,
    ) -> Self {
        Self { sample_rate, block_size, arena, to_worker, done: Cell::new(false) }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Realtime allocation; `None` when the arena is exhausted.
    pub fn rt_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.arena.alloc(size)
    }

    pub fn rt_alloc_aligned(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        self.arena.alloc_aligned(align, size)
    }

    /// # Safety
    ///
    /// `ptr` must come from this world's realtime allocator.
    pub unsafe fn rt_free(&self, ptr: NonNull<u8>) {
        self.arena.free(ptr)
    }

    /// Forward a callback to the worker thread. This is the only way for
    /// plugin code to do non-realtime work.
    pub fn perform_command(&self, f: HostPerformFn, data: *mut ()) {
        if self.to_worker.try_send(Command::PerformHost { f, data }).is_err() {
            // Queue full: the callback is dropped rather than blocking the
            // audio thread.
            debug_assert!(false, "worker queue full");
        }
    }

    /// Signal that this synth has finished and should be freed.
    pub fn synth_done(&self) {
        self.done.set(true);
    }

    pub(crate) fn take_done(&self) -> bool {
        self.done.replace(false)
    }

    pub(crate) fn send_node_done(&self, node_id: NodeId) {
        if self.to_worker.try_send(Command::NodeDone { node_id }).is_err() {
            // Retried implicitly: the synth stays done and inert until a
            // later block gets the command through.
            debug_assert!(false, "worker queue full");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    /// Doubles its control input onto its audio output.
    struct Doubler;

    impl SynthProcessor for Doubler {
        type Options = ();
        const URI: &'static str = "helicon:test:doubler";

        fn port(_options: &(), index: usize) -> Option<PortDescriptor> {
            match index {
                0 => Some(PortDescriptor::new(PortKind::ControlInput)),
                1 => Some(PortDescriptor::new(PortKind::AudioOutput)),
                _ => None,
            }
        }

        fn new(_world: &World, _options: &()) -> Self {
            Doubler
        }

        fn process(&mut self, _world: &World, ports: &mut Ports, num_frames: usize) {
            let value = ports.control(0) * 2.0;
            ports.audio(1)[..num_frames].fill(value);
        }
    }

    #[test]
    fn adapter_round_trips_through_the_raw_surface() {
        let def = SynthDef::of::<Doubler>();
        assert_eq!(def.uri(), "helicon:test:doubler");

        let arena = RtArena::new(64 * 1024);
        let (tx, _rx) = bounded(16);
        let world = World::new(48_000.0, 64, &arena, &tx);

        let options = NonNull::<u8>::dangling();
        def.configure(&[], options).unwrap();
        assert_eq!(def.port_descriptor(options, 0).unwrap().kind, PortKind::ControlInput);
        assert_eq!(def.port_descriptor(options, 1).unwrap().kind, PortKind::AudioOutput);
        assert!(def.port_descriptor(options, 2).is_none());

        let instance = arena
            .alloc_aligned(def.instance_layout().align(), def.instance_layout().size())
            .unwrap();
        def.construct(&world, options, instance);

        let mut control = 0.75f32;
        let mut audio = [0.0f32; 64];
        def.connect(instance, 0, &mut control);
        def.connect(instance, 1, audio.as_mut_ptr());
        def.process(&world, instance, 64);

        assert!(audio.iter().all(|&s| s == 1.5));

        def.destroy(instance);
        unsafe { arena.free(instance) };
    }

    #[test]
    fn registry_lookup_by_uri() {
        let mut registry = SynthDefRegistry::new();
        assert!(registry.is_empty());
        registry.insert(SynthDef::of::<Doubler>());
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.lookup("helicon:test:doubler").unwrap().uri(), Doubler::URI);
        let err = registry.lookup("helicon:test:missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SynthDefNotFound);
    }

    #[test]
    fn world_done_flag_is_take_once() {
        let arena = RtArena::new(1024);
        let (tx, _rx) = bounded(4);
        let world = World::new(48_000.0, 64, &arena, &tx);

        assert!(!world.take_done());
        world.synth_done();
        assert!(world.take_done());
        assert!(!world.take_done());
    }

    #[test]
    fn world_realtime_allocation_round_trips() {
        let arena = RtArena::new(64 * 1024);
        let (tx, _rx) = bounded(4);
        let world = World::new(48_000.0, 64, &arena, &tx);

        let plain = world.rt_alloc(128).unwrap();
        let aligned = world.rt_alloc_aligned(64, 256).unwrap();
        assert_ne!(plain.as_ptr(), aligned.as_ptr());
        assert_eq!(aligned.as_ptr() as usize % 64, 0);
        unsafe {
            world.rt_free(plain);
            world.rt_free(aligned);
        }
        // Freed storage is reusable through the same handle.
        assert!(world.rt_alloc(128).is_some());
    }
}
