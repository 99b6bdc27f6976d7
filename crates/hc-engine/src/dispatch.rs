//! The request dispatcher: OSC messages to graph mutations.
//!
//! Dispatch is a two-phase protocol. Phase A runs once when a request is
//! first drained and performs the structural work (node creation) that
//! later time-ordered dispatch depends on. Phase B runs at the request's
//! scheduled time (or immediately, for non-bundle messages and
//! immediate-tagged bundles) and performs activations and mutations.
//!
//! Nested bundles are flattened; each message dispatches at the time of
//! its innermost enclosing bundle. No failure aborts the block: every
//! message is interpreted under an error boundary that converts failures
//! into `/error` replies.

use arrayvec::ArrayVec;
use hc_proto::{
    address, flags, osc_to_time, AddAction, ErrorKind, InputKind, NodeId, OutputKind, RequestId,
    Time, IMMEDIATE,
};
use rosc::{OscBundle, OscMessage, OscPacket, OscType};

use crate::env::Environment;
use crate::error::{EngineError, Result};
use crate::request::Request;
use crate::synth::BusRef;

/// Most control initialisers accepted by `/synth/new`.
pub const MAX_CONTROL_INIT: usize = 32;

/// Process one freshly-drained request: Phase A, then either immediate
/// Phase B or insertion into the scheduler.
pub(crate) fn drain_request(env: &mut Environment, request: &Request, current_time: Time) {
    match request.packet() {
        OscPacket::Message(msg) => {
            if phase_a_message(env, request.id(), msg) {
                phase_b_message(env, request.id(), msg, current_time, current_time);
            }
        }
        OscPacket::Bundle(bundle) => {
            if phase_a_bundle(env, request.id(), bundle) {
                if bundle.timetag == IMMEDIATE {
                    phase_b_bundle(env, request.id(), bundle, current_time, current_time);
                } else {
                    let time = osc_to_time(bundle.timetag);
                    if let Err(err) = env.schedule(time, request.clone()) {
                        env.reply_error(request.id(), &err);
                    }
                }
            }
        }
    }
}

/// Phase B entry for requests popped from the scheduler.
pub(crate) fn dispatch_scheduled(
    env: &mut Environment,
    request: &Request,
    schedule_time: Time,
    current_time: Time,
) {
    match request.packet() {
        OscPacket::Message(msg) => {
            phase_b_message(env, request.id(), msg, schedule_time, current_time)
        }
        OscPacket::Bundle(bundle) => {
            phase_b_bundle(env, request.id(), bundle, schedule_time, current_time)
        }
    }
}

fn phase_a_bundle(env: &mut Environment, id: RequestId, bundle: &OscBundle) -> bool {
    let mut needs_scheduling = false;
    for packet in &bundle.content {
        needs_scheduling |= match packet {
            OscPacket::Message(msg) => phase_a_message(env, id, msg),
            OscPacket::Bundle(inner) => phase_a_bundle(env, id, inner),
        };
    }
    needs_scheduling
}

fn phase_a_message(env: &mut Environment, id: RequestId, msg: &OscMessage) -> bool {
    match try_phase_a(env, id, msg) {
        Ok(needs_scheduling) => needs_scheduling,
        Err(err) => {
            env.reply_error(id, &err);
            // Phase B still runs so a partially-failed bundle keeps its
            // time-ordered messages; they fail individually if their node
            // is missing.
            true
        }
    }
}

fn try_phase_a(env: &mut Environment, id: RequestId, msg: &OscMessage) -> Result<bool> {
    match msg.addr.as_str() {
        address::GROUP_NEW => {
            let node_id = node_arg(msg, 0)?;
            let target_id = node_arg(msg, 1)?;
            let action = action_arg(msg, 2)?;
            env.create_group(node_id, target_id, action)?;
            env.reply_ack_node(id, node_id);
            Ok(false)
        }
        address::SYNTH_NEW => {
            let def_name = str_arg(msg, 0)?;
            let node_id = node_arg(msg, 1)?;
            let target_id = node_arg(msg, 2)?;
            let action = action_arg(msg, 3)?;
            let controls = controls_arg(msg, 4)?;
            let options = array_arg(msg, 5);
            env.create_synth(def_name, node_id, target_id, action, &controls, options)?;
            env.reply_ack_node(id, node_id);
            // The synth stays inactive until its timed Phase B.
            Ok(true)
        }
        _ => Ok(true),
    }
}

fn phase_b_bundle(
    env: &mut Environment,
    id: RequestId,
    bundle: &OscBundle,
    schedule_time: Time,
    current_time: Time,
) {
    for packet in &bundle.content {
        match packet {
            OscPacket::Message(msg) => phase_b_message(env, id, msg, schedule_time, current_time),
            OscPacket::Bundle(inner) => {
                // Flattened; the innermost time-tag wins.
                let inner_time = if inner.timetag == IMMEDIATE {
                    schedule_time
                } else {
                    osc_to_time(inner.timetag)
                };
                phase_b_bundle(env, id, inner, inner_time, current_time);
            }
        }
    }
}

fn phase_b_message(
    env: &mut Environment,
    id: RequestId,
    msg: &OscMessage,
    schedule_time: Time,
    current_time: Time,
) {
    if let Err(err) = try_phase_b(env, msg, schedule_time, current_time) {
        env.reply_error(id, &err);
    }
}

fn try_phase_b(
    env: &mut Environment,
    msg: &OscMessage,
    schedule_time: Time,
    current_time: Time,
) -> Result<()> {
    match msg.addr.as_str() {
        address::SYNTH_NEW => {
            let node_id = node_arg(msg, 1)?;
            let offset = ((schedule_time - current_time) * env.config().sample_rate)
                .round()
                .max(0.0) as usize;
            env.activate_synth(node_id, offset)
        }
        address::NODE_FREE => env.free_node(node_arg(msg, 0)?),
        address::NODE_SET => {
            let node_id = node_arg(msg, 0)?;
            let index = int_arg(msg, 1)?;
            let value = float_arg(msg, 2)?;
            env.set_node_control(node_id, index, value)
        }
        address::MAP_INPUT => {
            let (node_id, port, bus, mapping) = mapping_args(msg)?;
            let kind = if mapping & flags::FEEDBACK != 0 {
                InputKind::InFeedback
            } else {
                InputKind::In
            };
            env.map_synth_input(node_id, port, bus, kind)
        }
        address::MAP_OUTPUT => {
            let (node_id, port, bus, mapping) = mapping_args(msg)?;
            let kind = if mapping & flags::REPLACE != 0 {
                OutputKind::ReplaceOut
            } else {
                OutputKind::Out
            };
            env.map_synth_output(node_id, port, bus, kind)
        }
        // Structural-only and unrecognized messages have no timed effect.
        _ => Ok(()),
    }
}

fn mapping_args(msg: &OscMessage) -> Result<(NodeId, usize, Option<BusRef>, i32)> {
    let node_id = node_arg(msg, 0)?;
    let port = int_arg(msg, 1)?;
    if port < 0 {
        return Err(EngineError::with_message(ErrorKind::ArgumentRange, "negative port index"));
    }
    let bus_index = int_arg(msg, 2)?;
    let mapping = int_arg(msg, 3)?;
    let bus = if bus_index < 0 {
        None
    } else {
        Some(BusRef { external: mapping & flags::EXTERNAL != 0, index: bus_index as u32 })
    };
    Ok((node_id, port as usize, bus, mapping))
}

fn arg(msg: &OscMessage, index: usize) -> Result<&OscType> {
    msg.args
        .get(index)
        .ok_or_else(|| EngineError::with_message(ErrorKind::ArgumentRange, "missing argument"))
}

fn int_arg(msg: &OscMessage, index: usize) -> Result<i32> {
    match arg(msg, index)? {
        OscType::Int(value) => Ok(*value),
        _ => Err(EngineError::with_message(ErrorKind::ArgumentRange, "expected int argument")),
    }
}

fn float_arg(msg: &OscMessage, index: usize) -> Result<f32> {
    match arg(msg, index)? {
        OscType::Float(value) => Ok(*value),
        OscType::Int(value) => Ok(*value as f32),
        _ => Err(EngineError::with_message(ErrorKind::ArgumentRange, "expected float argument")),
    }
}

fn str_arg(msg: &OscMessage, index: usize) -> Result<&str> {
    match arg(msg, index)? {
        OscType::String(value) => Ok(value),
        _ => Err(EngineError::with_message(ErrorKind::ArgumentRange, "expected string argument")),
    }
}

fn node_arg(msg: &OscMessage, index: usize) -> Result<NodeId> {
    let value = int_arg(msg, index)?;
    if value < 0 {
        return Err(EngineError::with_message(ErrorKind::NodeIdError, "negative node id"));
    }
    Ok(value as NodeId)
}

fn action_arg(msg: &OscMessage, index: usize) -> Result<AddAction> {
    let value = int_arg(msg, index)?;
    AddAction::from_i32(value)
        .ok_or_else(|| EngineError::with_message(ErrorKind::ArgumentRange, "unknown add action"))
}

/// Empty when the argument is absent; arrays are optional on the wire.
fn array_arg(msg: &OscMessage, index: usize) -> &[OscType] {
    match msg.args.get(index) {
        Some(OscType::Array(array)) => &array.content,
        _ => &[],
    }
}

fn controls_arg(msg: &OscMessage, index: usize) -> Result<ArrayVec<f32, MAX_CONTROL_INIT>> {
    let mut controls = ArrayVec::new();
    for value in array_arg(msg, index) {
        let value = match value {
            OscType::Float(v) => *v,
            OscType::Int(v) => *v as f32,
            _ => {
                return Err(EngineError::with_message(
                    ErrorKind::ArgumentRange,
                    "controls must be numeric",
                ))
            }
        };
        if controls.try_push(value).is_err() {
            return Err(EngineError::with_message(
                ErrorKind::ArgumentRange,
                "too many control initialisers",
            ));
        }
    }
    Ok(controls)
}
