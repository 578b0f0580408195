mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use nbd_client::protocol::{CONTEXT_BASE_ALLOCATION, NBD_STATE_HOLE, NBD_STATE_ZERO};
use nbd_client::{CommandFlags, Extent, ExtentCallback, Handle};
use nbd_sim::{MemoryBackend, ServerConfig, SimServer};

use common::{EXPORT_BYTES, connect, finish, server};

type Seen = Arc<Mutex<Vec<(String, u64, Vec<(u32, u32)>)>>>;

fn recorder() -> (Seen, ExtentCallback) {
    let seen: Seen = Arc::default();
    let sink = Arc::clone(&seen);
    let callback: ExtentCallback = Box::new(move |context, offset, extents: &[Extent], _| {
        let runs = extents.iter().map(|e| (e.length, e.status)).collect();
        sink.lock().push((context.to_string(), offset, runs));
        Ok(())
    });
    (seen, callback)
}

fn layout_server(config: ServerConfig) -> SimServer {
    let backend = MemoryBackend::new(65536).with_layout(vec![
        (8192, 0),
        (8192, NBD_STATE_HOLE),
        (16384, NBD_STATE_HOLE | NBD_STATE_ZERO),
        (16384, NBD_STATE_ZERO),
        (16384, 0),
    ]);
    SimServer::new(Arc::new(backend), 65536, config)
}

fn base_allocation_handle() -> Handle {
    let mut handle = Handle::new();
    handle.add_meta_context(CONTEXT_BASE_ALLOCATION).unwrap();
    handle
}

#[test]
fn decodes_full_layout() {
    let (mut handle, thread) = connect(base_allocation_handle(), layout_server(ServerConfig::default()));

    let (seen, callback) = recorder();
    handle
        .block_status(65536, 0, callback, CommandFlags::NONE)
        .unwrap();
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, CONTEXT_BASE_ALLOCATION);
    assert_eq!(seen[0].1, 0);
    assert_eq!(
        seen[0].2,
        vec![(8192, 0), (8192, 1), (16384, 3), (16384, 2), (16384, 0)]
    );

    finish(handle, thread);
}

#[test]
fn req_one_returns_a_single_extent() {
    let (mut handle, thread) = connect(base_allocation_handle(), layout_server(ServerConfig::default()));

    let (seen, callback) = recorder();
    handle
        .block_status(1024, 32256, callback, CommandFlags::REQ_ONE)
        .unwrap();
    assert_eq!(
        seen.lock().as_slice(),
        &[(CONTEXT_BASE_ALLOCATION.to_string(), 32256, vec![(512, 3)])]
    );

    let (seen, callback) = recorder();
    handle
        .block_status(1024, 32256, callback, CommandFlags::NONE)
        .unwrap();
    assert_eq!(seen.lock()[0].2, vec![(512, 3), (512, 2)]);

    finish(handle, thread);
}

#[test]
fn replies_for_unrequested_contexts_are_skipped() {
    let config = ServerConfig {
        spurious_context_id: Some(77),
        ..Default::default()
    };
    let (mut handle, thread) = connect(base_allocation_handle(), layout_server(config));

    let (seen, callback) = recorder();
    handle
        .block_status(8192, 0, callback, CommandFlags::NONE)
        .unwrap();
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, CONTEXT_BASE_ALLOCATION);

    finish(handle, thread);
}

#[test]
fn one_callback_per_negotiated_context() {
    let dirty = "qemu:dirty-bitmap:backup";
    let config = ServerConfig {
        meta_contexts: vec![CONTEXT_BASE_ALLOCATION.to_string(), dirty.to_string()],
        ..Default::default()
    };
    let mut handle = base_allocation_handle();
    handle.add_meta_context(dirty).unwrap();
    let (mut handle, thread) = connect(handle, server(config));
    assert!(handle.can_meta_context(dirty).unwrap());

    handle.pwrite(&[1u8; 4096], 4096, CommandFlags::NONE).unwrap();
    let (seen, callback) = recorder();
    handle
        .block_status(3 * 4096, 0, callback, CommandFlags::NONE)
        .unwrap();

    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            (
                CONTEXT_BASE_ALLOCATION.to_string(),
                0,
                vec![(4096, 3), (4096, 0), (4096, 3)]
            ),
            (dirty.to_string(), 0, vec![(3 * 4096, 0)]),
        ]
    );

    finish(handle, thread);
}

#[test]
fn out_of_range_query_is_rejected_locally() {
    let (mut handle, thread) = connect(base_allocation_handle(), server(ServerConfig::default()));
    let (seen, callback) = recorder();
    assert!(
        handle
            .block_status(4096, EXPORT_BYTES - 1024, callback, CommandFlags::NONE)
            .is_err()
    );
    assert!(seen.lock().is_empty());
    finish(handle, thread);
}
