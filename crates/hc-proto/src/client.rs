//! Client-side builders for the recognized request messages.
//!
//! These produce `rosc` packets ready for `rosc::encoder::encode`. They are
//! the client half of the protocol; the engine's dispatcher is the server
//! half.

use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};

use crate::{address, AddAction, AudioBusId, NodeId};

/// `/group/new (nodeId, targetId, addAction)`
pub fn group_new(node_id: NodeId, target_id: NodeId, action: AddAction) -> OscPacket {
    OscPacket::Message(OscMessage {
        addr: address::GROUP_NEW.into(),
        args: vec![
            OscType::Int(node_id as i32),
            OscType::Int(target_id as i32),
            OscType::Int(action.to_i32()),
        ],
    })
}

/// `/synth/new (defName, nodeId, targetId, addAction, [controls], [args])`
pub fn synth_new(
    def_name: &str,
    node_id: NodeId,
    target_id: NodeId,
    action: AddAction,
    controls: &[f32],
    options: &[OscType],
) -> OscPacket {
    OscPacket::Message(OscMessage {
        addr: address::SYNTH_NEW.into(),
        args: vec![
            OscType::String(def_name.into()),
            OscType::Int(node_id as i32),
            OscType::Int(target_id as i32),
            OscType::Int(action.to_i32()),
            OscType::Array(rosc::OscArray {
                content: controls.iter().map(|&c| OscType::Float(c)).collect(),
            }),
            OscType::Array(rosc::OscArray { content: options.to_vec() }),
        ],
    })
}

/// `/node/free (nodeId)`
pub fn node_free(node_id: NodeId) -> OscPacket {
    OscPacket::Message(OscMessage {
        addr: address::NODE_FREE.into(),
        args: vec![OscType::Int(node_id as i32)],
    })
}

/// `/node/set (nodeId, index, value)`
pub fn node_set(node_id: NodeId, index: i32, value: f32) -> OscPacket {
    OscPacket::Message(OscMessage {
        addr: address::NODE_SET.into(),
        args: vec![OscType::Int(node_id as i32), OscType::Int(index), OscType::Float(value)],
    })
}

/// `/synth/map/input (nodeId, portIndex, busId, flags)`
///
/// Pass a negative `bus_id` to unmap the port.
pub fn map_input(node_id: NodeId, port: i32, bus_id: Option<AudioBusId>, flags: i32) -> OscPacket {
    OscPacket::Message(OscMessage {
        addr: address::MAP_INPUT.into(),
        args: vec![
            OscType::Int(node_id as i32),
            OscType::Int(port),
            OscType::Int(bus_id.map_or(-1, |b| b as i32)),
            OscType::Int(flags),
        ],
    })
}

/// `/synth/map/output (nodeId, portIndex, busId, flags)`
pub fn map_output(node_id: NodeId, port: i32, bus_id: Option<AudioBusId>, flags: i32) -> OscPacket {
    OscPacket::Message(OscMessage {
        addr: address::MAP_OUTPUT.into(),
        args: vec![
            OscType::Int(node_id as i32),
            OscType::Int(port),
            OscType::Int(bus_id.map_or(-1, |b| b as i32)),
            OscType::Int(flags),
        ],
    })
}

/// Wrap packets in a bundle with the given time-tag.
pub fn bundle(timetag: OscTime, content: Vec<OscPacket>) -> OscPacket {
    OscPacket::Bundle(OscBundle { timetag, content })
}
