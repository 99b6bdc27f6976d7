//! helicon server: engine on the default output device, controlled over
//! UDP OSC.
//!
//! Usage:
//!   helicon [--port N] [--block N] [--buses N] [--memory BYTES]
//!
//! Replies go back to the address of the most recent sender.

use std::net::UdpSocket;
use std::sync::{Arc, Mutex};

use hc_audio::{CpalDriver, Driver};
use hc_engine::{EngineConfig, Environment, PacketHandler};
use hc_proto::RequestId;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let port = flag_value(&args, "--port").unwrap_or(57210);
    let block_size = flag_value(&args, "--block").unwrap_or(64);
    let buses = flag_value(&args, "--buses").unwrap_or(128);
    let memory = flag_value(&args, "--memory").unwrap_or(1 << 20);

    let mut driver = CpalDriver::new(block_size).unwrap_or_else(|e| {
        eprintln!("Failed to open audio device: {}", e);
        std::process::exit(1);
    });

    let config = EngineConfig {
        sample_rate: driver.sample_rate(),
        block_size: driver.buffer_size(),
        num_hardware_input_channels: driver.num_inputs(),
        num_hardware_output_channels: driver.num_outputs(),
        max_num_audio_buses: buses,
        realtime_memory_size: memory,
        ..EngineConfig::default()
    };

    log::info!(target: "server", "starting helicon engine");
    log::info!(target: "server", "  sampleRate = {}", config.sample_rate);
    log::info!(target: "server", "  numOutputs = {}", config.num_hardware_output_channels);
    log::info!(target: "server", "  blockSize  = {}", config.block_size);

    let socket = UdpSocket::bind(("0.0.0.0", port as u16)).unwrap_or_else(|e| {
        eprintln!("Failed to bind UDP port {}: {}", port, e);
        std::process::exit(1);
    });
    let reply_socket = socket.try_clone().expect("clone UDP socket");
    let client_addr = Arc::new(Mutex::new(None));

    let handler: PacketHandler = {
        let client_addr = client_addr.clone();
        Arc::new(move |_, bytes: &[u8]| {
            if let Some(addr) = *client_addr.lock().unwrap() {
                if let Err(err) = reply_socket.send_to(bytes, addr) {
                    log::warn!(target: "server", "reply to {} failed: {}", addr, err);
                }
            }
        })
    };

    let (mut env, handle) = Environment::new(handler, config);
    env.load_plugin(hc_plugins::register_all);

    driver.set_process_callback(Box::new(move |time, num_frames, inputs, outputs| {
        env.process(time, num_frames, inputs, outputs);
    }));
    driver.start().unwrap_or_else(|e| {
        eprintln!("Failed to start audio stream: {}", e);
        std::process::exit(1);
    });

    println!("helicon listening on udp port {}", port);

    let mut buf = [0u8; 65536];
    // Each datagram gets its own request id so acks reach the client; the
    // notification sentinel stays reserved for engine-initiated replies.
    let mut next_request_id: RequestId = 0;
    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, addr)) => {
                *client_addr.lock().unwrap() = Some(addr);
                let request_id = next_request_id;
                next_request_id = next_request_id.wrapping_add(1).max(0);
                if let Err(err) = handle.send(request_id, &buf[..len]) {
                    log::warn!(target: "server", "request from {} rejected: {}", addr, err);
                }
            }
            Err(err) => {
                log::error!(target: "server", "socket receive failed: {}", err);
                break;
            }
        }
    }

    let _ = driver.stop();
}

/// Parse `--flag value` pairs; malformed values fall back to the default.
fn flag_value(args: &[String], flag: &str) -> Option<usize> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}
