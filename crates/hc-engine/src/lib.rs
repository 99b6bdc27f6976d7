//! Realtime audio scheduler and node graph runtime for helicon.
//!
//! The engine evaluates a tree of synth and group nodes once per driver
//! block, mixing their outputs onto shared epoch-tagged buses. Control
//! arrives as timestamped OSC requests through a lock-free queue; anything
//! that must allocate, free, or block is handed to worker threads over a
//! bounded command channel. The audio thread itself never touches the
//! system allocator after construction.

mod arena;
mod bus;
mod dispatch;
mod env;
mod error;
mod node;
mod registry;
mod request;
mod scheduler;
mod synth;
mod synthdef;
mod worker;

pub use hc_proto::Time;

pub use arena::RtArena;
pub use bus::{AudioBus, BusBank, Epoch};
pub use env::{ClientHandle, EngineConfig, Environment, Host};
pub use error::{EngineError, Result, MAX_ERROR_MESSAGE};
pub use node::{Group, Node, NodeHeader};
pub use registry::NodeRegistry;
pub use request::{request_queue, Request, RequestQueue, RequestSender};
pub use scheduler::Scheduler;
pub use synth::{
    AudioInputConnection, AudioOutputConnection, BusRef, Synth, MAX_AUDIO_CONNECTIONS,
};
pub use synthdef::{
    PortDescriptor, PortKind, Ports, SoundFileApi, SynthDef, SynthDefRegistry, SynthOptions,
    SynthProcessor, World, MAX_SYNTH_PORTS,
};
pub use worker::{HostContext, HostPerformFn, PacketHandler, RtPerformFn};
