#![allow(dead_code)]

use std::sync::Arc;

use nbd_client::{Handle, ShutdownFlags};
use nbd_sim::{Backend, MemoryBackend, ServerConfig, ServerThread, SimServer, init_tracing, spawn_server};

pub const EXPORT_BYTES: u64 = 1 << 20;

pub fn memory() -> Arc<dyn Backend> {
    Arc::new(MemoryBackend::new(EXPORT_BYTES))
}

pub fn server(config: ServerConfig) -> SimServer {
    SimServer::new(memory(), EXPORT_BYTES, config)
}

/// Connect `handle` to `server`, running the handshake to completion (or to
/// the option-haggling idle state in opt mode).
pub fn connect(mut handle: Handle, server: SimServer) -> (Handle, ServerThread) {
    init_tracing();
    let (stream, thread) = spawn_server(server).unwrap();
    handle.connect_transport(Box::new(stream)).unwrap();
    (handle, thread)
}

/// Disconnect cleanly and check the server saw a clean end of session.
pub fn finish(mut handle: Handle, server: ServerThread) {
    handle.shutdown(ShutdownFlags::default()).unwrap();
    assert!(handle.aio_is_closed().unwrap());
    server.join().unwrap();
}
