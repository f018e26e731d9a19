//! In-memory storage nodes with fault injection, for tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cadapter::client::DataClient;
use crate::chunk::model::BlockMd;
use crate::error::{Error, Result};

#[derive(Default)]
struct Faults {
    down_for_writes: HashSet<String>,
    down_for_reads: HashSet<String>,
    failing_blocks: HashSet<String>,
    fail_next_writes: usize,
    stall: Option<Duration>,
    stalled_nodes: HashMap<String, Duration>,
}

#[derive(Default)]
pub struct MemoryNodes {
    blocks: Mutex<HashMap<(String, String), Bytes>>,
    faults: Mutex<Faults>,
    writes: AtomicUsize,
    reads: AtomicUsize,
}

impl MemoryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write addressed to `address` fails.
    pub fn fail_writes_to(&self, address: &str) {
        self.faults.lock().unwrap().down_for_writes.insert(address.to_string());
    }

    /// Every read addressed to `address` fails.
    pub fn fail_reads_from(&self, address: &str) {
        self.faults.lock().unwrap().down_for_reads.insert(address.to_string());
    }

    /// Reads and writes of this block id fail wherever it lives.
    pub fn fail_block(&self, block_id: &str) {
        self.faults.lock().unwrap().failing_blocks.insert(block_id.to_string());
    }

    /// The next `n` writes fail regardless of address.
    pub fn fail_next_writes(&self, n: usize) {
        self.faults.lock().unwrap().fail_next_writes = n;
    }

    /// Every call sleeps this long before answering.
    pub fn stall(&self, delay: Duration) {
        self.faults.lock().unwrap().stall = Some(delay);
    }

    /// Calls addressed to `address` sleep this long before answering.
    pub fn stall_node(&self, address: &str, delay: Duration) {
        self.faults
            .lock()
            .unwrap()
            .stalled_nodes
            .insert(address.to_string(), delay);
    }

    pub fn heal(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn stored_blocks(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    /// Overwrites a stored block in place, bypassing fault injection.
    pub fn corrupt(&self, block: &BlockMd, data: Bytes) {
        self.blocks
            .lock()
            .unwrap()
            .insert((block.address.clone(), block.id.clone()), data);
    }

    fn stall_for(&self, address: &str) -> Option<Duration> {
        let faults = self.faults.lock().unwrap();
        faults.stalled_nodes.get(address).copied().or(faults.stall)
    }
}

#[async_trait]
impl DataClient for MemoryNodes {
    async fn write_block(&self, block: &BlockMd, data: Bytes) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.stall_for(&block.address) {
            tokio::time::sleep(delay).await;
        }
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.fail_next_writes > 0 {
                faults.fail_next_writes -= 1;
                return Err(Error::Transport(format!("injected write failure on {}", block.id)));
            }
            if faults.down_for_writes.contains(&block.address)
                || faults.failing_blocks.contains(&block.id)
            {
                return Err(Error::Transport(format!("node {} refused write", block.address)));
            }
        }
        self.blocks
            .lock()
            .unwrap()
            .insert((block.address.clone(), block.id.clone()), data);
        Ok(())
    }

    async fn read_block(&self, block: &BlockMd) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.stall_for(&block.address) {
            tokio::time::sleep(delay).await;
        }
        {
            let faults = self.faults.lock().unwrap();
            if faults.down_for_reads.contains(&block.address)
                || faults.failing_blocks.contains(&block.id)
            {
                return Err(Error::Transport(format!("node {} refused read", block.address)));
            }
        }
        self.blocks
            .lock()
            .unwrap()
            .get(&(block.address.clone(), block.id.clone()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("block {}@{}", block.id, block.address)))
    }
}
