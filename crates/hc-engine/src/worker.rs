//! The audio-thread / worker handshake.
//!
//! Commands are plain values sent over a pair of bounded channels. The
//! audio thread only ever `try_send`s; workers block on `recv` and perform
//! each command against a [`HostContext`]. Anything that needs to mutate
//! engine state (freeing a node after its synth signalled done) is bounced
//! back and performed at the audio thread's per-block drain point.

use std::sync::Arc;
use std::thread::JoinHandle;

use arrayvec::ArrayString;
use crossbeam_channel::{bounded, Receiver, Sender};
use hc_proto::{address, ErrorKind, NodeId, RequestId};
use rosc::{OscMessage, OscPacket, OscType};

use crate::error::MAX_ERROR_MESSAGE;
use crate::request::RequestStorage;
use crate::synthdef::World;

/// Callback handed packets the engine sends back to its client.
pub type PacketHandler = Arc<dyn Fn(RequestId, &[u8]) + Send + Sync>;

/// A callback performed on the audio thread at the worker drain point.
pub type RtPerformFn = fn(&World, *mut ());

/// A callback performed on a worker thread.
pub type HostPerformFn = fn(&HostContext, *mut ());

/// One unit of cross-thread work. Ownership of any payload moves with the
/// command.
pub enum Command {
    // audio thread -> worker
    /// Acknowledge a request.
    Ack { request_id: RequestId },
    /// Acknowledge a request that allocated a node.
    AckNode { request_id: RequestId, node_id: NodeId },
    /// Report a failed request.
    Error { request_id: RequestId, kind: ErrorKind, message: ArrayString<MAX_ERROR_MESSAGE> },
    /// Free the storage of a fully-dropped request.
    FreeRequest(RequestStorage),
    /// A synth signalled done; bounce a free back to the audio thread.
    NodeDone { node_id: NodeId },
    /// Plugin callback to run on the worker.
    PerformHost { f: HostPerformFn, data: *mut () },

    // worker -> audio thread
    /// Remove a done node from the registry.
    FreeNode { node_id: NodeId },
    /// Plugin callback to run on the audio thread.
    PerformRt { f: RtPerformFn, data: *mut () },

    /// Shut one worker thread down.
    Quit,
}

// Raw callback payloads move between exactly two cooperating threads;
// ownership transfers with the command.
unsafe impl Send for Command {}

/// Worker-side view of the engine: reply emission and the path back to the
/// audio thread.
pub struct HostContext {
    handler: PacketHandler,
    to_rt: Sender<Command>,
}

impl HostContext {
    /// Encode a reply packet and hand it to the client's packet handler.
    pub fn reply(&self, request_id: RequestId, packet: &OscPacket) {
        match rosc::encoder::encode(packet) {
            Ok(bytes) => (self.handler)(request_id, &bytes),
            Err(err) => log::error!(target: "worker", "reply encoding failed: {:?}", err),
        }
    }

    /// Queue a callback for the audio thread's next drain point.
    pub fn perform_command(&self, f: RtPerformFn, data: *mut ()) {
        if self.to_rt.try_send(Command::PerformRt { f, data }).is_err() {
            log::error!(target: "worker", "audio-bound command queue full, callback dropped");
        }
    }
}

/// Worker threads plus both channel endpoints the environment needs.
pub(crate) struct WorkerPool {
    pub(crate) to_worker: Sender<Command>,
    pub(crate) to_rt: Sender<Command>,
    pub(crate) rt_inbox: Receiver<Command>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_threads` workers over bounded channels of `capacity`.
    pub(crate) fn spawn(num_threads: usize, capacity: usize, handler: PacketHandler) -> Self {
        let (to_worker, worker_inbox) = bounded::<Command>(capacity);
        let (to_rt, rt_inbox) = bounded::<Command>(capacity);

        let threads = (0..num_threads.max(1))
            .map(|i| {
                let inbox = worker_inbox.clone();
                let ctx = HostContext { handler: handler.clone(), to_rt: to_rt.clone() };
                std::thread::Builder::new()
                    .name(format!("hc-worker-{}", i))
                    .spawn(move || worker_loop(inbox, ctx))
                    .expect("spawn worker thread")
            })
            .collect();

        Self { to_worker, to_rt, rt_inbox, threads }
    }

    /// Stop and join every worker.
    pub(crate) fn shutdown(&mut self) {
        for _ in &self.threads {
            let _ = self.to_worker.send(Command::Quit);
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker_loop(inbox: Receiver<Command>, ctx: HostContext) {
    while let Ok(command) = inbox.recv() {
        match command {
            Command::Ack { request_id } => {
                ctx.reply(request_id, &ack_packet(request_id, None));
            }
            Command::AckNode { request_id, node_id } => {
                ctx.reply(request_id, &ack_packet(request_id, Some(node_id)));
            }
            Command::Error { request_id, kind, message } => {
                log::debug!(target: "worker", "request {} failed: {}", request_id, message);
                ctx.reply(request_id, &error_packet(request_id, kind, &message));
            }
            Command::FreeRequest(storage) => storage.release(),
            Command::NodeDone { node_id } => {
                if ctx.to_rt.try_send(Command::FreeNode { node_id }).is_err() {
                    log::error!(target: "worker", "node {} done but free queue is full", node_id);
                }
            }
            Command::PerformHost { f, data } => f(&ctx, data),
            Command::Quit => break,
            // Audio-bound commands never arrive here.
            Command::FreeNode { .. } | Command::PerformRt { .. } => {
                debug_assert!(false, "audio-bound command on worker queue");
            }
        }
    }
}

fn ack_packet(request_id: RequestId, node_id: Option<NodeId>) -> OscPacket {
    let mut args = vec![OscType::Int(request_id)];
    if let Some(node_id) = node_id {
        args.push(OscType::Int(node_id as i32));
    }
    OscPacket::Message(OscMessage { addr: address::ACK.into(), args })
}

fn error_packet(request_id: RequestId, kind: ErrorKind, message: &str) -> OscPacket {
    let text = if message.is_empty() { kind.as_str().to_string() } else { message.to_string() };
    OscPacket::Message(OscMessage {
        addr: address::ERROR.into(),
        args: vec![OscType::Int(request_id), OscType::String(text)],
    })
}
