//! The engine environment: one instance per engine, no process-wide state.
//!
//! Everything the audio callback touches lives here. The per-block loop
//! is: drain client requests, run the scheduler up to the end of this
//! block, drain worker-originated commands, wire the driver's channel
//! buffers to the external buses, process the node tree, silence any
//! output bus nothing wrote, and advance the epoch. Every step is bounded
//! by a construction-time capacity, so the callback's runtime does not
//! depend on client behavior.

use std::sync::Arc;

use crossbeam_channel::Sender;
use hc_proto::{
    AddAction, AudioBusId, ErrorKind, InputKind, NodeId, OutputKind, RequestId, Time,
    NOTIFICATION, ROOT_NODE_ID,
};
use rosc::{OscPacket, OscType};

use crate::arena::RtArena;
use crate::bus::{BusBank, Epoch};
use crate::dispatch;
use crate::error::{EngineError, Result};
use crate::node::{link_node, unlink_node, Group, Node};
use crate::registry::NodeRegistry;
use crate::request::{request_queue, Request, RequestQueue, RequestSender};
use crate::scheduler::Scheduler;
use crate::synth::{BusRef, Synth};
use crate::synthdef::{SoundFileApi, SynthDef, SynthDefRegistry, World};
use crate::worker::{Command, PacketHandler, RtPerformFn, WorkerPool};

/// Capacity of the request queue and each worker channel.
pub(crate) const QUEUE_SIZE: usize = 8192;

/// Worker-originated commands performed per block, at most.
const MAX_WORKER_COMMANDS_PER_BLOCK: usize = 128;

/// Construction-time options, fixed for the engine's lifetime.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub sample_rate: f64,
    pub block_size: usize,
    pub num_hardware_input_channels: usize,
    pub num_hardware_output_channels: usize,
    pub max_num_nodes: usize,
    pub max_num_audio_buses: usize,
    pub realtime_memory_size: usize,
    pub scheduler_capacity: usize,
    pub num_worker_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            block_size: 64,
            num_hardware_input_channels: 2,
            num_hardware_output_channels: 2,
            max_num_nodes: 1024,
            max_num_audio_buses: 128,
            realtime_memory_size: 1 << 20,
            scheduler_capacity: QUEUE_SIZE,
            num_worker_threads: 2,
        }
    }
}

/// Clonable client-side handle: builds requests off the audio thread and
/// enqueues them without blocking.
#[derive(Clone)]
pub struct ClientHandle {
    sender: Arc<RequestSender>,
    to_worker: Sender<Command>,
}

impl ClientHandle {
    /// Decode and enqueue an encoded OSC packet.
    pub fn send(&self, request_id: RequestId, bytes: &[u8]) -> Result<()> {
        let request = Request::new(request_id, bytes, self.to_worker.clone())?;
        self.sender.send(request)
    }

    /// Encode and enqueue a packet built with the `hc-proto` helpers.
    pub fn send_packet(&self, request_id: RequestId, packet: &OscPacket) -> Result<()> {
        let bytes = rosc::encoder::encode(packet)
            .map_err(|_| EngineError::with_message(ErrorKind::ArgumentRange, "unencodable packet"))?;
        self.send(request_id, &bytes)
    }
}

/// Capability handle passed to plugin library entry points.
pub struct Host<'a> {
    env: &'a mut Environment,
}

impl Host<'_> {
    pub fn register_synthdef(&mut self, def: SynthDef) {
        self.env.synthdefs.insert(def);
    }

    pub fn register_soundfile_api(&mut self, api: Arc<dyn SoundFileApi>) {
        self.env.soundfile_apis.push(api);
    }

    /// Sound-file API for `mime_type`; see [`Environment::soundfile_api`].
    pub fn soundfile_api(&self, mime_type: &str) -> Option<Arc<dyn SoundFileApi>> {
        self.env.soundfile_api(mime_type)
    }

    pub fn sample_rate(&self) -> f64 {
        self.env.config.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.env.config.block_size
    }

    /// Queue a callback for the audio thread's next worker drain.
    pub fn perform_command(&self, f: RtPerformFn, data: *mut ()) {
        if self.env.to_rt.try_send(Command::PerformRt { f, data }).is_err() {
            log::error!(target: "engine", "audio-bound command queue full, callback dropped");
        }
    }
}

pub struct Environment {
    config: EngineConfig,
    epoch: Epoch,
    arena: RtArena,
    buses: BusBank,
    nodes: NodeRegistry,
    synthdefs: SynthDefRegistry,
    soundfile_apis: Vec<Arc<dyn SoundFileApi>>,
    scheduler: Scheduler,
    requests: RequestQueue,
    to_worker: Sender<Command>,
    to_rt: Sender<Command>,
    workers: WorkerPool,
}

// The environment is built on a control thread and then moved to the audio
// thread, which owns it exclusively from the first callback on.
unsafe impl Send for Environment {}

impl Environment {
    /// Build an engine. Replies go to `handler` (invoked on a worker
    /// thread); the returned [`ClientHandle`] is the request path in.
    pub fn new(handler: PacketHandler, config: EngineConfig) -> (Self, ClientHandle) {
        let workers = WorkerPool::spawn(config.num_worker_threads, QUEUE_SIZE, handler);
        let (sender, requests) = request_queue(QUEUE_SIZE);

        let mut nodes = NodeRegistry::new(config.max_num_nodes);
        nodes
            .insert(ROOT_NODE_ID, Node::Group(Group::new(ROOT_NODE_ID, None)))
            .map_err(|(err, _)| err)
            .expect("root group insert");

        let epoch: Epoch = 0;
        let env = Self {
            buses: BusBank::new(
                config.block_size,
                config.max_num_audio_buses,
                config.num_hardware_input_channels,
                config.num_hardware_output_channels,
                epoch,
            ),
            arena: RtArena::new(config.realtime_memory_size),
            nodes,
            synthdefs: SynthDefRegistry::new(),
            soundfile_apis: Vec::new(),
            scheduler: Scheduler::new(config.scheduler_capacity),
            requests,
            to_worker: workers.to_worker.clone(),
            to_rt: workers.to_rt.clone(),
            workers,
            epoch,
            config,
        };
        let handle = ClientHandle {
            sender: Arc::new(sender),
            to_worker: env.to_worker.clone(),
        };
        (env, handle)
    }

    /// Run a plugin library entry point. Call before the driver starts;
    /// registrations become visible to the audio thread with the engine.
    pub fn load_plugin(&mut self, entry: fn(&mut Host)) {
        let mut host = Host { env: self };
        entry(&mut host);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn num_synthdefs(&self) -> usize {
        self.synthdefs.len()
    }

    /// Sound-file API for `mime_type`. An exact MIME match wins over
    /// registration order; with no match, the first registered API is the
    /// fallback.
    pub fn soundfile_api(&self, mime_type: &str) -> Option<Arc<dyn SoundFileApi>> {
        self.soundfile_apis
            .iter()
            .find(|api| api.mime_type() == mime_type)
            .or_else(|| self.soundfile_apis.first())
            .cloned()
    }

    /// One driver callback's worth of work.
    pub fn process(
        &mut self,
        current_time: Time,
        num_frames: usize,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) {
        debug_assert!(num_frames <= self.config.block_size, "num_frames exceeds block size");
        let num_frames = num_frames.min(self.config.block_size);

        while let Some(request) = self.requests.next() {
            dispatch::drain_request(self, &request, current_time);
        }

        let block_end = current_time + num_frames as f64 / self.config.sample_rate;
        while let Some(time) = self.scheduler.peek_time() {
            if time > block_end {
                break;
            }
            let (schedule_time, request) = self.scheduler.pop().expect("peeked item");
            dispatch::dispatch_scheduled(self, &request, schedule_time, current_time);
        }

        let inbox = self.workers.rt_inbox.clone();
        for _ in 0..MAX_WORKER_COMMANDS_PER_BLOCK {
            match inbox.try_recv() {
                Ok(command) => self.perform_rt_command(command),
                Err(_) => break,
            }
        }

        let epoch = self.epoch;
        for (i, input) in inputs.iter().enumerate().take(self.buses.num_external_inputs()) {
            let bus = self.buses.external_input(i).expect("external input bus");
            bus.set_external_data(input.as_ptr() as *mut f32, num_frames.min(input.len()));
            bus.set_epoch(epoch);
        }
        for (i, output) in outputs.iter_mut().enumerate().take(self.buses.num_external_outputs()) {
            let bus = self.buses.external_output(i).expect("external output bus");
            bus.set_external_data(output.as_mut_ptr(), num_frames.min(output.len()));
        }

        self.process_node_tree(num_frames);

        for (i, output) in outputs.iter_mut().enumerate().take(self.buses.num_external_outputs()) {
            let bus = self.buses.external_output(i).expect("external output bus");
            if bus.epoch() != epoch {
                let n = num_frames.min(output.len());
                output[..n].fill(0.0);
            }
            bus.set_external_data(std::ptr::null_mut(), 0);
        }
        for i in 0..self.buses.num_external_inputs() {
            let bus = self.buses.external_input(i).expect("external input bus");
            bus.set_external_data(std::ptr::null_mut(), 0);
        }

        self.epoch = self.epoch.wrapping_add(1);
    }

    // --- graph mutations (audio thread, called from dispatch) ---

    pub(crate) fn create_group(
        &mut self,
        node_id: NodeId,
        target_id: NodeId,
        action: AddAction,
    ) -> Result<()> {
        let group_id = self.target_group(target_id)?;
        self.check_node_slot(node_id)?;
        self.nodes
            .insert(node_id, Node::Group(Group::new(node_id, None)))
            .map_err(|(err, _)| err)?;
        link_node(&mut self.nodes, group_id, node_id, action);
        Ok(())
    }

    pub(crate) fn create_synth(
        &mut self,
        def_name: &str,
        node_id: NodeId,
        target_id: NodeId,
        action: AddAction,
        controls: &[f32],
        options: &[OscType],
    ) -> Result<()> {
        let def = self.synthdefs.lookup(def_name)?;
        let group_id = self.target_group(target_id)?;
        self.check_node_slot(node_id)?;

        let world = World::new(
            self.config.sample_rate,
            self.config.block_size,
            &self.arena,
            &self.to_worker,
        );
        let synth = Synth::construct(
            &world,
            &self.arena,
            def,
            node_id,
            controls,
            options,
            self.config.block_size,
        )?;

        if let Err((err, rejected)) = self.nodes.insert(node_id, Node::Synth(synth)) {
            if let Node::Synth(mut synth) = rejected {
                synth.release_resources(&self.arena);
            }
            return Err(err);
        }
        link_node(&mut self.nodes, group_id, node_id, action);
        Ok(())
    }

    pub(crate) fn activate_synth(&mut self, node_id: NodeId, sample_offset: usize) -> Result<()> {
        self.with_synth(node_id, |synth| {
            synth.activate(sample_offset);
            Ok(())
        })
    }

    pub(crate) fn free_node(&mut self, node_id: NodeId) -> Result<()> {
        if node_id == ROOT_NODE_ID {
            return Err(EngineError::with_message(ErrorKind::NodeIdError, "cannot free root"));
        }
        if !self.nodes.contains(node_id) {
            return Err(EngineError::new(ErrorKind::NodeIdError));
        }
        unlink_node(&mut self.nodes, node_id);
        self.free_subtree(node_id);
        Ok(())
    }

    pub(crate) fn set_node_control(
        &mut self,
        node_id: NodeId,
        index: i32,
        value: f32,
    ) -> Result<()> {
        if index < 0 {
            return Err(EngineError::with_message(ErrorKind::ArgumentRange, "negative index"));
        }
        self.with_synth(node_id, |synth| synth.set_control_input(index as usize, value))
    }

    pub(crate) fn map_synth_input(
        &mut self,
        node_id: NodeId,
        port: usize,
        bus: Option<BusRef>,
        kind: InputKind,
    ) -> Result<()> {
        self.check_bus(bus, false)?;
        self.with_synth(node_id, |synth| synth.map_input(port, bus, kind))
    }

    pub(crate) fn map_synth_output(
        &mut self,
        node_id: NodeId,
        port: usize,
        bus: Option<BusRef>,
        kind: OutputKind,
    ) -> Result<()> {
        self.check_bus(bus, true)?;
        self.with_synth(node_id, |synth| synth.map_output(port, bus, kind))
    }

    pub(crate) fn schedule(&mut self, time: Time, request: Request) -> Result<()> {
        self.scheduler.push(time, request)
    }

    // --- replies ---

    pub(crate) fn reply_error(&self, request_id: RequestId, err: &EngineError) {
        let mut message = arrayvec::ArrayString::new();
        let _ = std::fmt::Write::write_fmt(&mut message, format_args!("{}", err));
        let command = Command::Error { request_id, kind: err.kind(), message };
        if self.to_worker.try_send(command).is_err() {
            debug_assert!(false, "worker queue full, error reply dropped");
        }
    }

    pub(crate) fn reply_ack_node(&self, request_id: RequestId, node_id: NodeId) {
        if request_id == NOTIFICATION {
            return;
        }
        let command = Command::AckNode { request_id, node_id };
        if self.to_worker.try_send(command).is_err() {
            debug_assert!(false, "worker queue full, ack dropped");
        }
    }

    // --- diagnostics ---

    /// Raw contents of an internal bus, regardless of epoch.
    pub fn internal_bus_contents(&self, bus_id: AudioBusId) -> Option<Vec<f32>> {
        let bus = self.buses.internal(bus_id as usize)?;
        let mut data = vec![0.0; self.config.block_size];
        bus.snapshot(&mut data);
        Some(data)
    }

    pub fn node_exists(&self, node_id: NodeId) -> bool {
        self.nodes.contains(node_id)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    // --- internals ---

    fn process_node_tree(&mut self, num_frames: usize) {
        let Environment { nodes, buses, arena, to_worker, config, epoch, .. } = self;
        let world = World::new(config.sample_rate, config.block_size, arena, to_worker);
        process_group_children(nodes, buses, &world, *epoch, ROOT_NODE_ID, num_frames);
    }

    fn perform_rt_command(&mut self, command: Command) {
        match command {
            Command::FreeNode { node_id } => {
                // The node may already have been freed explicitly.
                let _ = self.free_node(node_id);
            }
            Command::PerformRt { f, data } => {
                let Environment { arena, to_worker, config, .. } = self;
                let world = World::new(config.sample_rate, config.block_size, arena, to_worker);
                f(&world, data);
            }
            _ => debug_assert!(false, "worker-bound command on audio queue"),
        }
    }

    fn free_subtree(&mut self, node_id: NodeId) {
        match self.nodes.remove(node_id) {
            Some(Node::Group(group)) => {
                let mut cur = group.first_child;
                while let Some(child) = cur {
                    cur = self.nodes.lookup(child).and_then(|n| n.header().next);
                    self.free_subtree(child);
                }
            }
            Some(Node::Synth(mut synth)) => synth.release_resources(&self.arena),
            None => {}
        }
    }

    fn target_group(&self, target_id: NodeId) -> Result<NodeId> {
        let node = self
            .nodes
            .lookup(target_id)
            .ok_or_else(|| EngineError::new(ErrorKind::NodeIdError))?;
        match node {
            Node::Group(_) => Ok(target_id),
            Node::Synth(synth) => synth
                .header
                .parent
                .ok_or_else(|| EngineError::with_message(ErrorKind::NodeIdError, "orphan target")),
        }
    }

    fn check_node_slot(&self, node_id: NodeId) -> Result<()> {
        if self.nodes.contains(node_id) {
            return Err(EngineError::with_message(ErrorKind::NodeIdError, "duplicate node id"));
        }
        if self.nodes.len() >= self.nodes.capacity() {
            return Err(EngineError::with_message(ErrorKind::AllocFailure, "node registry full"));
        }
        Ok(())
    }

    fn check_bus(&self, bus: Option<BusRef>, output: bool) -> Result<()> {
        let Some(bus) = bus else { return Ok(()) };
        let count = if bus.external {
            if output {
                self.buses.num_external_outputs()
            } else {
                self.buses.num_external_inputs()
            }
        } else {
            self.buses.num_internal()
        };
        if (bus.index as usize) < count {
            Ok(())
        } else {
            Err(EngineError::with_message(ErrorKind::ArgumentRange, "bus index out of range"))
        }
    }

    fn with_synth<R>(
        &mut self,
        node_id: NodeId,
        f: impl FnOnce(&mut Synth) -> Result<R>,
    ) -> Result<R> {
        match self.nodes.lookup_mut(node_id) {
            None => Err(EngineError::new(ErrorKind::NodeIdError)),
            Some(Node::Group(_)) => Err(EngineError::new(ErrorKind::NodeTypeError)),
            Some(Node::Synth(synth)) => f(synth),
        }
    }
}

fn process_group_children(
    nodes: &mut NodeRegistry,
    buses: &BusBank,
    world: &World,
    epoch: Epoch,
    group_id: NodeId,
    num_frames: usize,
) {
    let mut cur = nodes
        .lookup(group_id)
        .and_then(Node::as_group)
        .and_then(|group| group.first_child);
    while let Some(node_id) = cur {
        cur = nodes.lookup(node_id).and_then(|node| node.header().next);
        let is_group = nodes.lookup(node_id).map(Node::is_group).unwrap_or(false);
        if is_group {
            process_group_children(nodes, buses, world, epoch, node_id, num_frames);
        } else if let Some(Node::Synth(synth)) = nodes.lookup_mut(node_id) {
            synth.process(world, buses, epoch, num_frames);
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        // Pending requests go to the workers for freeing before the
        // workers are told to quit.
        self.scheduler.clear();
        while self.requests.next().is_some() {}
        self.workers.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use hc_proto::{bundle, map_output, node_free, node_set, synth_new, time_to_osc, flags};

    use crate::synthdef::{PortDescriptor, PortKind, Ports, SynthProcessor};

    /// Constant source: control 0 is the level, port 1 the audio output.
    struct Dc;

    impl SynthProcessor for Dc {
        type Options = ();
        const URI: &'static str = "helicon:test:dc";

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

    fn register_dc(host: &mut Host) {
        host.register_synthdef(SynthDef::of::<Dc>());
    }

    type ReplyLog = Arc<Mutex<Vec<(RequestId, OscPacket)>>>;

    fn test_env() -> (Environment, ClientHandle, ReplyLog) {
        let replies: ReplyLog = Arc::new(Mutex::new(Vec::new()));
        let sink = replies.clone();
        let handler: PacketHandler = Arc::new(move |id, bytes| {
            let (_, packet) = rosc::decoder::decode_udp(bytes).unwrap();
            sink.lock().unwrap().push((id, packet));
        });
        let (mut env, handle) = Environment::new(handler, EngineConfig::default());
        env.load_plugin(register_dc);
        (env, handle, replies)
    }

    fn run_block(env: &mut Environment, time: Time) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0f32; 64];
        let mut right = vec![0.0f32; 64];
        {
            let mut outputs: Vec<&mut [f32]> = vec![&mut left, &mut right];
            env.process(time, 64, &[], &mut outputs);
        }
        (left, right)
    }

    fn wait_for_reply(replies: &ReplyLog) -> (RequestId, OscPacket) {
        for _ in 0..200 {
            if let Some(reply) = replies.lock().unwrap().first().cloned() {
                return reply;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        panic!("no reply arrived");
    }

    fn error_text(packet: &OscPacket) -> String {
        match packet {
            OscPacket::Message(msg) if msg.addr == "/error" => match &msg.args[1] {
                OscType::String(text) => text.clone(),
                other => panic!("unexpected error payload {:?}", other),
            },
            other => panic!("expected /error, got {:?}", other),
        }
    }

    #[test]
    fn silent_engine_advances_epoch_and_outputs_zeros() {
        let (mut env, _handle, _) = test_env();
        assert_eq!(env.epoch(), 0);
        for block in 0..3u64 {
            let (left, right) = run_block(&mut env, block as f64 * 64.0 / 48_000.0);
            assert!(left.iter().all(|&s| s == 0.0));
            assert!(right.iter().all(|&s| s == 0.0));
            assert_eq!(env.epoch(), block + 1);
        }
    }

    #[test]
    fn immediate_synth_sounds_in_its_first_block() {
        let (mut env, handle, _) = test_env();
        let packet = bundle(
            hc_proto::IMMEDIATE,
            vec![
                synth_new("helicon:test:dc", 2, 0, AddAction::Tail, &[0.5], &[]),
                map_output(2, 0, Some(0), flags::EXTERNAL),
            ],
        );
        handle.send_packet(1, &packet).unwrap();

        let (left, right) = run_block(&mut env, 0.0);
        assert!(left.iter().all(|&s| s == 0.5), "left channel should carry the synth");
        assert!(right.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn scheduled_synth_waits_for_its_block() {
        let (mut env, handle, _) = test_env();
        let block = 64.0 / 48_000.0;
        // Start of the third block.
        let start = 2.0 * block;
        let packet = bundle(
            time_to_osc(start),
            vec![
                synth_new("helicon:test:dc", 2, 0, AddAction::Tail, &[1.0], &[]),
                map_output(2, 0, Some(0), flags::EXTERNAL),
            ],
        );
        handle.send_packet(1, &packet).unwrap();

        let (left, _) = run_block(&mut env, 0.0);
        assert!(left.iter().all(|&s| s == 0.0), "not yet due");
        let (left, _) = run_block(&mut env, block);
        assert!(left.iter().all(|&s| s == 0.0), "still not due");
        let (left, _) = run_block(&mut env, 2.0 * block);
        assert!(left.iter().all(|&s| s == 1.0), "due this block");
    }

    #[test]
    fn mid_block_schedule_offsets_first_samples() {
        let (mut env, handle, _) = test_env();
        let packet = bundle(
            time_to_osc(32.0 / 48_000.0),
            vec![
                synth_new("helicon:test:dc", 2, 0, AddAction::Tail, &[1.0], &[]),
                map_output(2, 0, Some(0), flags::EXTERNAL),
            ],
        );
        handle.send_packet(1, &packet).unwrap();

        let (left, _) = run_block(&mut env, 0.0);
        assert!(left[..32].iter().all(|&s| s == 0.0), "first half silent");
        assert!(left[32..].iter().all(|&s| s == 1.0), "second half audible");
    }

    #[test]
    fn two_writers_mix_on_an_internal_bus() {
        let (mut env, handle, _) = test_env();
        let packet = bundle(
            hc_proto::IMMEDIATE,
            vec![
                synth_new("helicon:test:dc", 2, 0, AddAction::Tail, &[0.5], &[]),
                map_output(2, 0, Some(7), 0),
                synth_new("helicon:test:dc", 3, 0, AddAction::Tail, &[0.25], &[]),
                map_output(3, 0, Some(7), 0),
            ],
        );
        handle.send_packet(1, &packet).unwrap();
        run_block(&mut env, 0.0);

        let bus = env.internal_bus_contents(7).unwrap();
        assert!(bus.iter().all(|&s| (s - 0.75).abs() < 1e-6), "0.5 + 0.25 must mix to 0.75");
    }

    #[test]
    fn replace_out_erases_prior_accumulation() {
        let (mut env, handle, _) = test_env();
        let packet = bundle(
            hc_proto::IMMEDIATE,
            vec![
                synth_new("helicon:test:dc", 2, 0, AddAction::Tail, &[0.5], &[]),
                map_output(2, 0, Some(7), 0),
                synth_new("helicon:test:dc", 3, 0, AddAction::Tail, &[0.25], &[]),
                map_output(3, 0, Some(7), flags::REPLACE),
            ],
        );
        handle.send_packet(1, &packet).unwrap();
        run_block(&mut env, 0.0);

        let bus = env.internal_bus_contents(7).unwrap();
        assert!(bus.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn freeing_a_node_silences_it_and_its_children() {
        let (mut env, handle, _) = test_env();
        let packet = bundle(
            hc_proto::IMMEDIATE,
            vec![
                synth_new("helicon:test:dc", 2, 0, AddAction::Tail, &[1.0], &[]),
                map_output(2, 0, Some(0), flags::EXTERNAL),
            ],
        );
        handle.send_packet(1, &packet).unwrap();
        let (left, _) = run_block(&mut env, 0.0);
        assert!(left.iter().all(|&s| s == 1.0));

        handle.send_packet(2, &node_free(2)).unwrap();
        let (left, _) = run_block(&mut env, 64.0 / 48_000.0);
        assert!(left.iter().all(|&s| s == 0.0), "freed synth must fall silent");
        assert!(!env.node_exists(2));
    }

    #[test]
    fn node_set_changes_a_control_input() {
        let (mut env, handle, _) = test_env();
        let packet = bundle(
            hc_proto::IMMEDIATE,
            vec![
                synth_new("helicon:test:dc", 2, 0, AddAction::Tail, &[0.5], &[]),
                map_output(2, 0, Some(0), flags::EXTERNAL),
            ],
        );
        handle.send_packet(1, &packet).unwrap();
        run_block(&mut env, 0.0);

        handle.send_packet(2, &node_set(2, 0, 0.125)).unwrap();
        let (left, _) = run_block(&mut env, 64.0 / 48_000.0);
        assert!(left.iter().all(|&s| s == 0.125));
    }

    #[test]
    fn unknown_node_id_replies_with_error_and_engine_survives() {
        let (mut env, handle, replies) = test_env();
        handle.send_packet(5, &node_set(999, 0, 1.0)).unwrap();
        run_block(&mut env, 0.0);

        let (id, packet) = wait_for_reply(&replies);
        assert_eq!(id, 5);
        assert!(error_text(&packet).starts_with("NodeIdError"));

        // Still alive.
        run_block(&mut env, 64.0 / 48_000.0);
        assert_eq!(env.epoch(), 2);
    }

    #[test]
    fn root_cannot_be_freed() {
        let (mut env, handle, replies) = test_env();
        handle.send_packet(3, &node_free(0)).unwrap();
        run_block(&mut env, 0.0);

        let (id, packet) = wait_for_reply(&replies);
        assert_eq!(id, 3);
        assert!(error_text(&packet).starts_with("NodeIdError"));
        assert!(env.node_exists(0));
    }

    #[test]
    fn missing_synthdef_is_reported() {
        let (mut env, handle, replies) = test_env();
        handle
            .send_packet(4, &synth_new("helicon:test:nope", 2, 0, AddAction::Tail, &[], &[]))
            .unwrap();
        run_block(&mut env, 0.0);

        let (_, packet) = wait_for_reply(&replies);
        assert!(error_text(&packet).starts_with("SynthDefNotFound"));
        assert!(!env.node_exists(2));
    }

    #[test]
    fn successful_creation_acks_with_the_node_id() {
        let (mut env, handle, replies) = test_env();
        handle
            .send_packet(9, &synth_new("helicon:test:dc", 2, 0, AddAction::Tail, &[], &[]))
            .unwrap();
        run_block(&mut env, 0.0);

        let (id, packet) = wait_for_reply(&replies);
        assert_eq!(id, 9);
        match packet {
            OscPacket::Message(msg) => {
                assert_eq!(msg.addr, "/ack");
                assert_eq!(msg.args, vec![OscType::Int(9), OscType::Int(2)]);
            }
            other => panic!("expected /ack, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_node_id_is_refused() {
        let (mut env, handle, replies) = test_env();
        handle
            .send_packet(1, &synth_new("helicon:test:dc", 2, 0, AddAction::Tail, &[], &[]))
            .unwrap();
        run_block(&mut env, 0.0);
        // Let the creation ack land before watching for the error.
        wait_for_reply(&replies);
        replies.lock().unwrap().clear();

        handle
            .send_packet(2, &synth_new("helicon:test:dc", 2, 0, AddAction::Tail, &[], &[]))
            .unwrap();
        run_block(&mut env, 64.0 / 48_000.0);

        let (_, packet) = wait_for_reply(&replies);
        assert!(error_text(&packet).starts_with("NodeIdError"));
    }

    #[test]
    fn scheduler_overflow_surfaces_as_queue_overflow() {
        let replies: ReplyLog = Arc::new(Mutex::new(Vec::new()));
        let sink = replies.clone();
        let handler: PacketHandler = Arc::new(move |id, bytes| {
            let (_, packet) = rosc::decoder::decode_udp(bytes).unwrap();
            sink.lock().unwrap().push((id, packet));
        });
        let config = EngineConfig { scheduler_capacity: 1, ..EngineConfig::default() };
        let (mut env, handle) = Environment::new(handler, config);
        env.load_plugin(register_dc);

        let far = time_to_osc(100.0);
        handle.send_packet(1, &bundle(far, vec![node_free(50)])).unwrap();
        handle.send_packet(2, &bundle(far, vec![node_free(51)])).unwrap();
        run_block(&mut env, 0.0);

        let reply = wait_for_reply(&replies);
        assert_eq!(reply.0, 2);
        assert!(error_text(&reply.1).starts_with("QueueOverflow"));
    }

    #[test]
    fn ties_dispatch_in_arrival_order() {
        let (mut env, handle, _) = test_env();
        let t = 64.0 / 48_000.0;
        // Two bundles for the same instant: creation must precede the
        // control change for the value to stick.
        handle
            .send_packet(
                1,
                &bundle(
                    time_to_osc(t),
                    vec![
                        synth_new("helicon:test:dc", 2, 0, AddAction::Tail, &[0.5], &[]),
                        map_output(2, 0, Some(0), flags::EXTERNAL),
                    ],
                ),
            )
            .unwrap();
        handle.send_packet(2, &bundle(time_to_osc(t), vec![node_set(2, 0, 0.25)])).unwrap();

        run_block(&mut env, 0.0);
        let (left, _) = run_block(&mut env, t);
        assert!(left.iter().all(|&s| s == 0.25), "set must follow creation at the same time");
    }

    fn counter_at(data: *mut ()) -> &'static std::sync::atomic::AtomicU32 {
        unsafe { &*(data as *const std::sync::atomic::AtomicU32) }
    }

    fn host_hop(ctx: &crate::worker::HostContext, data: *mut ()) {
        counter_at(data).fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        // Bounce back to the audio thread, the way a plugin finishes
        // non-realtime work.
        ctx.perform_command(rt_hop, data);
    }

    fn rt_hop(world: &World, data: *mut ()) {
        let scratch = world.rt_alloc(64).expect("rt alloc");
        let aligned = world.rt_alloc_aligned(64, 128).expect("rt alloc aligned");
        assert_eq!(aligned.as_ptr() as usize % 64, 0);
        unsafe {
            world.rt_free(scratch);
            world.rt_free(aligned);
        }
        counter_at(data).fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    #[test]
    fn perform_command_round_trips_through_the_worker() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let (mut env, _handle, _) = test_env();
        let counter = Box::into_raw(Box::new(AtomicU32::new(0)));

        {
            // The same view of the engine a synth gets while processing.
            let world = World::new(
                env.config.sample_rate,
                env.config.block_size,
                &env.arena,
                &env.to_worker,
            );
            world.perform_command(host_hop, counter as *mut ());
        }

        // One hop runs on the worker; the bounced callback lands at a
        // later block's drain point.
        for _ in 0..200 {
            run_block(&mut env, 0.0);
            if counter_at(counter as *mut ()).load(Ordering::SeqCst) == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let hops = counter_at(counter as *mut ()).load(Ordering::SeqCst);
        unsafe { drop(Box::from_raw(counter)) };
        assert_eq!(hops, 2, "both sides of the command hook must run");
    }

    #[test]
    fn host_perform_command_lands_at_the_drain_point() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let (mut env, _handle, _) = test_env();
        let counter = Box::into_raw(Box::new(AtomicU32::new(0)));

        {
            let host = Host { env: &mut env };
            host.perform_command(rt_hop, counter as *mut ());
        }

        // The command is already queued, so one block suffices.
        run_block(&mut env, 0.0);
        let hops = counter_at(counter as *mut ()).load(Ordering::SeqCst);
        unsafe { drop(Box::from_raw(counter)) };
        assert_eq!(hops, 1);
    }

    struct FakeApi {
        mime: &'static str,
    }

    impl SoundFileApi for FakeApi {
        fn mime_type(&self) -> &str {
            self.mime
        }
    }

    fn register_fake_soundfile_apis(host: &mut Host) {
        host.register_soundfile_api(Arc::new(FakeApi { mime: "audio/wav" }));
        host.register_soundfile_api(Arc::new(FakeApi { mime: "audio/flac" }));
    }

    #[test]
    fn soundfile_lookup_prefers_exact_match_over_registration_order() {
        let (mut env, _handle, _) = test_env();
        env.load_plugin(register_fake_soundfile_apis);
        assert_eq!(env.soundfile_api("audio/flac").unwrap().mime_type(), "audio/flac");
        assert_eq!(env.soundfile_api("audio/wav").unwrap().mime_type(), "audio/wav");
    }

    #[test]
    fn soundfile_lookup_falls_back_to_first_registered() {
        let (mut env, _handle, _) = test_env();
        env.load_plugin(register_fake_soundfile_apis);
        assert_eq!(env.soundfile_api("audio/ogg").unwrap().mime_type(), "audio/wav");
    }

    #[test]
    fn soundfile_lookup_is_none_with_nothing_registered() {
        let (env, _handle, _) = test_env();
        assert!(env.soundfile_api("audio/wav").is_none());
    }

    #[test]
    fn group_tree_processes_nested_synths() {
        let (mut env, handle, _) = test_env();
        let packet = bundle(
            hc_proto::IMMEDIATE,
            vec![
                hc_proto::group_new(10, 0, AddAction::Tail),
                synth_new("helicon:test:dc", 11, 10, AddAction::Tail, &[0.5], &[]),
                map_output(11, 0, Some(0), flags::EXTERNAL),
            ],
        );
        handle.send_packet(1, &packet).unwrap();
        let (left, _) = run_block(&mut env, 0.0);
        assert!(left.iter().all(|&s| s == 0.5));

        // Freeing the group frees the nested synth too.
        handle.send_packet(2, &node_free(10)).unwrap();
        let (left, _) = run_block(&mut env, 64.0 / 48_000.0);
        assert!(left.iter().all(|&s| s == 0.0));
        assert!(!env.node_exists(10));
        assert!(!env.node_exists(11));
    }
}
