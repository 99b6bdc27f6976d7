//! Shared fixtures for plugin tests: a stereo engine with every built-in
//! definition registered, driven block by block.

use std::sync::Arc;

use hc_engine::{ClientHandle, EngineConfig, Environment, PacketHandler, Time};

pub fn test_env() -> (Environment, ClientHandle) {
    let handler: PacketHandler = Arc::new(|_, _| {});
    let (mut env, handle) = Environment::new(handler, EngineConfig::default());
    env.load_plugin(crate::register_all);
    (env, handle)
}

/// Process one 64-frame block and return both output channels.
pub fn run_block(env: &mut Environment, time: Time) -> (Vec<f32>, Vec<f32>) {
    let mut left = vec![0.0f32; 64];
    let mut right = vec![0.0f32; 64];
    {
        let mut outputs: Vec<&mut [f32]> = vec![&mut left, &mut right];
        env.process(time, 64, &[], &mut outputs);
    }
    (left, right)
}
