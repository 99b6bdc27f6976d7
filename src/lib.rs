//! helicon, a realtime audio synthesis engine controlled over OSC.
//!
//! The engine evaluates a tree of synth and group nodes each audio block,
//! mixes their outputs onto shared epoch-tagged buses, and mutates the
//! graph from a stream of timestamped OSC requests. See `hc-engine` for
//! the runtime, `hc-proto` for the protocol, `hc-plugins` for the
//! built-in synth definitions, and `hc-audio` for driver backends.

pub use hc_audio as audio;
pub use hc_engine as engine;
pub use hc_plugins as plugins;
pub use hc_proto as proto;
