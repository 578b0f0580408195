//! NBD protocol-level simulation harness.
//!
//! Drives an [`nbd_client::Handle`] against a [`SimServer`] backed by a
//! [`MemoryBackend`] and checks every read and block status answer against a
//! byte-level oracle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use nbd_client::protocol::{CONTEXT_BASE_ALLOCATION, NBD_STATE_ZERO};
use nbd_client::{Buffer, CommandFlags, Extent, Handle, ShutdownFlags};

use super::SimulationError;
use crate::backend::MemoryBackend;
use crate::server::{ServerConfig, ServerThread, SimServer, spawn_server};

/// Actions that can be performed in NBD simulation.
#[derive(Debug, Clone)]
pub enum NbdAction {
    Read { offset: u64, length: u32 },
    Write { offset: u64, data: Vec<u8> },
    Trim { offset: u64, length: u32 },
    WriteZeroes { offset: u64, length: u32 },
    Flush,
    BlockStatus { offset: u64, length: u32 },
    /// Disjoint writes submitted together and collected in any order.
    Burst { writes: Vec<(u64, Vec<u8>)> },
}

/// Byte-level oracle for NBD verification.
pub struct NbdOracle {
    data: HashMap<u64, u8>,
}

impl NbdOracle {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    pub fn read(&self, offset: u64, length: u32) -> Vec<u8> {
        let mut result = vec![0u8; length as usize];
        for (i, byte) in result.iter_mut().enumerate() {
            if let Some(&b) = self.data.get(&(offset + i as u64)) {
                *byte = b;
            }
        }
        result
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let pos = offset + i as u64;
            if byte == 0 {
                self.data.remove(&pos);
            } else {
                self.data.insert(pos, byte);
            }
        }
    }

    pub fn trim(&mut self, offset: u64, length: u32) {
        for pos in offset..offset + length as u64 {
            self.data.remove(&pos);
        }
    }

    pub fn write_zeroes(&mut self, offset: u64, length: u32) {
        self.trim(offset, length);
    }

    pub fn is_zero(&self, offset: u64, length: u64) -> bool {
        (offset..offset + length).all(|pos| !self.data.contains_key(&pos))
    }
}

impl Default for NbdOracle {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct NbdStats {
    pub operations: u64,
    pub reads: u64,
    pub writes: u64,
    pub trims: u64,
    pub write_zeroes: u64,
    pub flushes: u64,
    pub block_status: u64,
    pub bursts: u64,
}

/// NBD protocol-level simulation harness.
pub struct NbdHarness {
    rng: SmallRng,
    handle: Option<Handle>,
    server: Option<ServerThread>,
    oracle: NbdOracle,
    size_bytes: u64,
    stats: NbdStats,
}

impl NbdHarness {
    pub fn new(seed: u64, size_bytes: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            handle: None,
            server: None,
            oracle: NbdOracle::new(),
            size_bytes,
            stats: NbdStats::default(),
        }
    }

    /// Start a server with a seed-chosen reply style and connect to it.
    pub fn init(&mut self) -> Result<(), SimulationError> {
        let config = ServerConfig {
            reply_window: if self.rng.random_bool(0.5) { 1 } else { 4 },
            read_chunk_bytes: self
                .rng
                .random_bool(0.5)
                .then(|| self.rng.random_range(512..8192)),
            reverse_chunks: self.rng.random_bool(0.3),
            sparse_reads: self.rng.random_bool(0.5),
            ..Default::default()
        };
        info!(
            reply_window = config.reply_window,
            read_chunk_bytes = ?config.read_chunk_bytes,
            reverse_chunks = config.reverse_chunks,
            sparse_reads = config.sparse_reads,
            "starting simulated server"
        );
        let backend = Arc::new(MemoryBackend::new(self.size_bytes));
        let server = SimServer::new(backend, self.size_bytes, config);
        let (stream, thread) = spawn_server(server)?;

        let mut handle = Handle::new();
        handle.add_meta_context(CONTEXT_BASE_ALLOCATION)?;
        handle.connect_transport(Box::new(stream))?;
        if !handle.can_meta_context(CONTEXT_BASE_ALLOCATION)? {
            return Err(SimulationError::Mismatch {
                context: "server did not grant base:allocation".into(),
            });
        }

        self.handle = Some(handle);
        self.server = Some(thread);
        Ok(())
    }

    fn handle(&mut self) -> Result<&mut Handle, SimulationError> {
        self.handle.as_mut().ok_or(SimulationError::NotInitialized)
    }

    /// Run the simulation for a given number of operations.
    pub fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            debug!(?action, "executing");
            self.execute(action)?;
            self.stats.operations += 1;
        }
        Ok(())
    }

    /// Disconnect and wait for the server to finish.
    pub fn finish(&mut self) -> Result<(), SimulationError> {
        if let Some(mut handle) = self.handle.take() {
            handle.shutdown(ShutdownFlags::default())?;
            handle.close()?;
        }
        if let Some(server) = self.server.take() {
            server.join()?;
        }
        Ok(())
    }

    fn sample_range(&mut self, max_len: u64) -> (u64, u32) {
        let max_len = max_len.min(self.size_bytes);
        let length = self.rng.random_range(1..=max_len);
        let max_offset = self.size_bytes.saturating_sub(length);
        let offset = if max_offset > 0 {
            self.rng.random_range(0..max_offset)
        } else {
            0
        };
        (offset, length as u32)
    }

    fn sample_data(&mut self, length: u32) -> Vec<u8> {
        (0..length).map(|_| self.rng.random()).collect()
    }

    fn sample_action(&mut self) -> NbdAction {
        let choice = self.rng.random_range(0..100);
        match choice {
            0..35 => {
                let (offset, length) = self.sample_range(32 * 1024);
                NbdAction::Read { offset, length }
            }
            35..65 => {
                let (offset, length) = self.sample_range(32 * 1024);
                let data = self.sample_data(length);
                NbdAction::Write { offset, data }
            }
            65..72 => {
                let (offset, length) = self.sample_range(64 * 1024);
                NbdAction::Trim { offset, length }
            }
            72..79 => {
                let (offset, length) = self.sample_range(64 * 1024);
                NbdAction::WriteZeroes { offset, length }
            }
            79..88 => {
                let (offset, length) = self.sample_range(64 * 1024);
                NbdAction::BlockStatus { offset, length }
            }
            88..95 => {
                let count = self.rng.random_range(2..=8u64);
                let (start, length) = self.sample_range(count * 4096);
                let piece = (length as u64).div_ceil(count);
                let mut writes = Vec::new();
                let mut offset = start;
                while offset < start + length as u64 {
                    let len = piece.min(start + length as u64 - offset) as u32;
                    let data = self.sample_data(len);
                    writes.push((offset, data));
                    offset += len as u64;
                }
                NbdAction::Burst { writes }
            }
            _ => NbdAction::Flush,
        }
    }

    /// Execute a single action.
    pub fn execute(&mut self, action: NbdAction) -> Result<(), SimulationError> {
        match action {
            NbdAction::Read { offset, length } => {
                self.stats.reads += 1;
                let expected = self.oracle.read(offset, length);
                let mut actual = vec![0u8; length as usize];
                self.handle()?
                    .pread(&mut actual, offset, CommandFlags::NONE)?;

                if actual != expected {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "read(offset={}, len={}): first diff at byte {}",
                            offset,
                            length,
                            find_diff(&expected, &actual)
                        ),
                    });
                }
            }
            NbdAction::Write { offset, data } => {
                self.stats.writes += 1;
                self.oracle.write(offset, &data);
                self.handle()?.pwrite(&data, offset, CommandFlags::NONE)?;
            }
            NbdAction::Trim { offset, length } => {
                self.stats.trims += 1;
                self.oracle.trim(offset, length);
                self.handle()?
                    .trim(length as u64, offset, CommandFlags::NONE)?;
            }
            NbdAction::WriteZeroes { offset, length } => {
                self.stats.write_zeroes += 1;
                self.oracle.write_zeroes(offset, length);
                self.handle()?
                    .zero(length as u64, offset, CommandFlags::NONE)?;
            }
            NbdAction::Flush => {
                self.stats.flushes += 1;
                self.handle()?.flush(CommandFlags::NONE)?;
            }
            NbdAction::BlockStatus { offset, length } => {
                self.stats.block_status += 1;
                self.check_block_status(offset, length)?;
            }
            NbdAction::Burst { writes } => {
                self.stats.bursts += 1;
                self.burst(writes)?;
            }
        }
        Ok(())
    }

    /// Extents flagged as zero must read back as zeroes.
    fn check_block_status(&mut self, offset: u64, length: u32) -> Result<(), SimulationError> {
        let seen: Arc<Mutex<Vec<(u64, Vec<Extent>)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        self.handle()?.block_status(
            length as u64,
            offset,
            Box::new(move |context, start, extents, _| {
                if context == CONTEXT_BASE_ALLOCATION {
                    sink.lock().push((start, extents.to_vec()));
                }
                Ok(())
            }),
            CommandFlags::NONE,
        )?;

        let seen = seen.lock();
        if seen.len() != 1 {
            return Err(SimulationError::Mismatch {
                context: format!("block_status(offset={offset}): {} replies", seen.len()),
            });
        }
        let (start, extents) = &seen[0];
        let mut pos = *start;
        for extent in extents {
            if extent.status & NBD_STATE_ZERO != 0
                && !self.oracle.is_zero(pos, extent.length as u64)
            {
                return Err(SimulationError::Mismatch {
                    context: format!(
                        "block_status(offset={offset}): extent at {pos}+{} marked zero",
                        extent.length
                    ),
                });
            }
            pos += extent.length as u64;
        }
        if pos < offset + length as u64 {
            return Err(SimulationError::Mismatch {
                context: format!("block_status(offset={offset}): extents end at {pos}"),
            });
        }
        Ok(())
    }

    fn burst(&mut self, writes: Vec<(u64, Vec<u8>)>) -> Result<(), SimulationError> {
        let mut cookies = Vec::with_capacity(writes.len());
        for (offset, data) in &writes {
            self.oracle.write(*offset, data);
            let buffer = Buffer::from_slice(data);
            let cookie = self
                .handle()?
                .aio_pwrite(&buffer, *offset, None, CommandFlags::NONE)?;
            cookies.push(cookie);
        }
        let handle = self.handle()?;
        while handle.aio_in_flight()? > 0 {
            handle.poll(-1)?;
        }
        for cookie in cookies {
            if !handle.aio_command_completed(cookie)? {
                return Err(SimulationError::Mismatch {
                    context: format!("cookie {cookie} not complete after drain"),
                });
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> &NbdStats {
        &self.stats
    }
}

fn find_diff(expected: &[u8], actual: &[u8]) -> usize {
    for (i, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        if e != a {
            return i;
        }
    }
    expected.len().min(actual.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_read_unwritten_returns_zeros() {
        let oracle = NbdOracle::new();
        let data = oracle.read(0, 100);
        assert_eq!(data.len(), 100);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn oracle_partial_read_spanning_written_and_unwritten() {
        let mut oracle = NbdOracle::new();

        // Write at offset 5
        oracle.write(5, &[0xAA, 0xBB, 0xCC]);

        // Read spanning before, during, and after
        let data = oracle.read(3, 8);
        assert_eq!(data, vec![0, 0, 0xAA, 0xBB, 0xCC, 0, 0, 0]);
    }

    #[test]
    fn oracle_trim_removes_bytes() {
        let mut oracle = NbdOracle::new();

        oracle.write(0, &[1, 2, 3, 4, 5]);
        oracle.trim(1, 3);

        assert_eq!(oracle.read(0, 5), vec![1, 0, 0, 0, 5]);
        assert!(oracle.is_zero(1, 3));
        assert!(!oracle.is_zero(0, 2));
    }

    #[test]
    fn burst_pieces_cover_range_without_overlap() {
        let mut harness = NbdHarness::new(7, 1 << 20);
        for _ in 0..200 {
            if let NbdAction::Burst { writes } = harness.sample_action() {
                let mut end = writes[0].0;
                for (offset, data) in &writes {
                    assert_eq!(*offset, end);
                    assert!(!data.is_empty());
                    end += data.len() as u64;
                }
                assert!(end <= 1 << 20);
            }
        }
    }

    #[test]
    fn find_diff_reports_first_mismatch() {
        assert_eq!(find_diff(&[1, 2, 3], &[1, 9, 3]), 1);
        assert_eq!(find_diff(&[1, 2], &[1, 2, 3]), 2);
    }
}
