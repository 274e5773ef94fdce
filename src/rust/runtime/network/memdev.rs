// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Memory-backed driver. Ports are plain in-process queues: packets are injected into per-lane receive queues and
//! transmitted payloads are captured verbatim. This is the backend used by the test suites and by programs that want
//! to exercise a graph without hardware.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::collections::ring::Ring;
use crate::runtime::{
    fail::{
        Fail,
        FailKind,
    },
    memory::{
        mbuf_data_len,
        mbuf_data_ptr,
        mbuf_pool_id,
        mbuf_set_data_len,
        MbufHandle,
        Mempool,
    },
    network::{
        types::MacAddress,
        PacketDriver,
    },
};
use ::parking_lot::Mutex;
use ::std::sync::{
    atomic::{
        AtomicBool,
        AtomicU64,
        AtomicUsize,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Capacity of every emulated receive queue, in packets.
const RX_QUEUE_CAPACITY: usize = 4096;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One emulated port.
struct MemPort {
    /// One receive queue per receive-side-scaling lane.
    rx: Vec<Ring>,
    /// Payloads transmitted on this port, in completion order.
    tx: Mutex<Vec<Vec<u8>>>,
    /// Whether resources were acquired for this port.
    created: AtomicBool,
    /// MAC address of this port.
    mac: MacAddress,
    /// Whether a kernel-bridge device exists on this port.
    kni_created: AtomicBool,
    /// Receive queue of the kernel-bridge device.
    kni_rx: Ring,
    /// Payloads handed to the kernel-bridge device.
    kni_tx: Mutex<Vec<Vec<u8>>>,
}

/// Memory-backed [PacketDriver].
pub struct MemoryDriver {
    /// Emulated ports.
    ports: Vec<MemPort>,
    /// Receive-side-scaling lanes advertised per port.
    rss_lanes: usize,
    /// Every mempool created through this driver, indexed by pool identifier.
    pools: Mutex<Vec<Arc<Mempool>>>,
    /// Pool that backs injected packets.
    inject_pool: Mutex<Option<Arc<Mempool>>>,
    /// Number of mbufs per created mempool.
    mbuf_number: AtomicUsize,
    /// Count of mbufs released through the synchronous free path.
    direct_freed: AtomicU64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl MemoryDriver {
    /// Creates a driver exposing `ports_number` ports with `rss_lanes` receive lanes each.
    pub fn new(ports_number: usize, rss_lanes: usize) -> Result<Arc<Self>, Fail> {
        if ports_number == 0 || rss_lanes == 0 {
            return Err(Fail::new(
                FailKind::BadArgument,
                "memory driver needs at least one port and one lane",
            ));
        }
        let mut ports: Vec<MemPort> = Vec::with_capacity(ports_number);
        for p in 0..ports_number {
            let mut rx: Vec<Ring> = Vec::with_capacity(rss_lanes);
            for _ in 0..rss_lanes {
                rx.push(Ring::new(RX_QUEUE_CAPACITY)?);
            }
            ports.push(MemPort {
                rx,
                tx: Mutex::new(Vec::new()),
                created: AtomicBool::new(false),
                mac: MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, p as u8]),
                kni_created: AtomicBool::new(false),
                kni_rx: Ring::new(RX_QUEUE_CAPACITY)?,
                kni_tx: Mutex::new(Vec::new()),
            });
        }
        Ok(Arc::new(Self {
            ports,
            rss_lanes,
            pools: Mutex::new(Vec::new()),
            inject_pool: Mutex::new(None),
            mbuf_number: AtomicUsize::new(0),
            direct_freed: AtomicU64::new(0),
        }))
    }

    /// Makes `payload` appear on a receive lane of `port`. Fails when the lane queue is full; callers feeding a
    /// running graph should retry, the receive worker drains the queue continuously.
    pub fn inject(&self, port: u16, lane: usize, payload: &[u8]) -> Result<(), Fail> {
        let p: &MemPort = self.port(port)?;
        if lane >= p.rx.len() {
            return Err(Fail::new(FailKind::BadArgument, "lane out of range"));
        }
        let pool: Arc<Mempool> = match &*self.inject_pool.lock() {
            Some(pool) => pool.clone(),
            None => return Err(Fail::new(FailKind::BadArgument, "driver is not initialized")),
        };
        let handle: MbufHandle = pool.alloc_one()?;
        unsafe { mbuf_data_ptr(handle).copy_from_nonoverlapping(payload.as_ptr(), payload.len()) };
        mbuf_set_data_len(handle, payload.len())?;
        if p.rx[lane].enqueue_burst(&[handle]) == 0 {
            pool.free_bulk(&[handle]);
            return Err(Fail::new(FailKind::BadArgument, "receive queue is full"));
        }
        Ok(())
    }

    /// Returns a snapshot of the payloads transmitted on `port`.
    pub fn transmitted(&self, port: u16) -> Vec<Vec<u8>> {
        self.ports[port as usize].tx.lock().clone()
    }

    /// Returns the number of payloads transmitted on `port`.
    pub fn transmitted_count(&self, port: u16) -> usize {
        self.ports[port as usize].tx.lock().len()
    }

    /// Makes `payload` appear on the kernel-bridge device of `port`.
    pub fn inject_kni(&self, port: u16, payload: &[u8]) -> Result<(), Fail> {
        let p: &MemPort = self.port(port)?;
        let pool: Arc<Mempool> = match &*self.inject_pool.lock() {
            Some(pool) => pool.clone(),
            None => return Err(Fail::new(FailKind::BadArgument, "driver is not initialized")),
        };
        let handle: MbufHandle = pool.alloc_one()?;
        unsafe { mbuf_data_ptr(handle).copy_from_nonoverlapping(payload.as_ptr(), payload.len()) };
        mbuf_set_data_len(handle, payload.len())?;
        if p.kni_rx.enqueue_burst(&[handle]) == 0 {
            pool.free_bulk(&[handle]);
            return Err(Fail::new(FailKind::BadArgument, "kernel-bridge queue is full"));
        }
        Ok(())
    }

    /// Returns a snapshot of the payloads handed to the kernel-bridge device of `port`.
    pub fn kni_transmitted(&self, port: u16) -> Vec<Vec<u8>> {
        self.ports[port as usize].kni_tx.lock().clone()
    }

    /// Returns the number of mbufs released through the synchronous free path.
    pub fn direct_freed(&self) -> u64 {
        self.direct_freed.load(Ordering::Relaxed)
    }

    fn port(&self, port: u16) -> Result<&MemPort, Fail> {
        match self.ports.get(port as usize) {
            Some(p) => Ok(p),
            None => Err(Fail::new(FailKind::PortOutOfRange, "port out of range")),
        }
    }

    fn release(&self, bufs: &[MbufHandle]) {
        let pools = self.pools.lock();
        for handle in bufs {
            let pool_id: usize = mbuf_pool_id(*handle) as usize;
            match pools.get(pool_id) {
                Some(pool) => pool.free_bulk(&[*handle]),
                None => warn!("release(): dropping mbuf of unknown pool (pool_id={})", pool_id),
            }
        }
    }

    fn capture(&self, log: &Mutex<Vec<Vec<u8>>>, bufs: &[MbufHandle]) {
        let mut log = log.lock();
        for handle in bufs {
            let len: usize = mbuf_data_len(*handle);
            let payload: &[u8] = unsafe { ::std::slice::from_raw_parts(mbuf_data_ptr(*handle), len) };
            log.push(payload.to_vec());
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl PacketDriver for MemoryDriver {
    fn initialize(
        &self,
        args: &[String],
        _burst_size: usize,
        mbuf_number: usize,
        _mbuf_cache_size: usize,
        _kni_number: i32,
    ) -> Result<(), Fail> {
        if !args.is_empty() {
            trace!("initialize(): ignoring driver arguments {:?}", args);
        }
        self.mbuf_number.store(mbuf_number, Ordering::Relaxed);
        let pool: Arc<Mempool> = self.create_mempool("receive injection")?;
        *self.inject_pool.lock() = Some(pool);
        Ok(())
    }

    fn finalize(&self) {
        self.free_mempools();
    }

    fn ports_number(&self) -> u16 {
        self.ports.len() as u16
    }

    fn port_rss_count(&self, _port: u16) -> i32 {
        self.rss_lanes as i32
    }

    fn check_hw_tx_checksum_capability(&self, _port: u16) -> bool {
        true
    }

    fn create_port(
        &self,
        port: u16,
        _will_receive: bool,
        _tx_queues: u16,
        _hw_tx_checksum: bool,
        _in_index: i32,
    ) -> Result<(), Fail> {
        self.port(port)?.created.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop_port(&self, port: u16) {
        if let Ok(p) = self.port(port) {
            p.created.store(false, Ordering::Relaxed);
        }
    }

    fn port_mac_address(&self, port: u16) -> MacAddress {
        match self.port(port) {
            Ok(p) => p.mac,
            Err(_) => MacAddress::nil(),
        }
    }

    fn receive_burst(&self, port: u16, lane: usize, bufs: &mut [MbufHandle]) -> usize {
        match self.port(port) {
            Ok(p) if lane < p.rx.len() => p.rx[lane].dequeue_burst(bufs),
            _ => 0,
        }
    }

    fn send_burst(&self, port: u16, _queue: u16, bufs: &[MbufHandle]) -> usize {
        match self.port(port) {
            Ok(p) => {
                self.capture(&p.tx, bufs);
                self.release(bufs);
                bufs.len()
            },
            Err(_) => 0,
        }
    }

    fn create_kni(&self, port: u16, _core: usize, name: &str) -> Result<(), Fail> {
        let p: &MemPort = self.port(port)?;
        p.kni_created.store(true, Ordering::Relaxed);
        trace!("create_kni(): created kernel-bridge device (port={}, name={})", port, name);
        Ok(())
    }

    fn free_kni(&self, port: u16) -> Result<(), Fail> {
        let p: &MemPort = self.port(port)?;
        p.kni_created.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn kni_receive_burst(&self, port: u16, bufs: &mut [MbufHandle]) -> usize {
        match self.port(port) {
            Ok(p) => p.kni_rx.dequeue_burst(bufs),
            Err(_) => 0,
        }
    }

    fn kni_send_burst(&self, port: u16, bufs: &[MbufHandle]) -> usize {
        match self.port(port) {
            Ok(p) => {
                self.capture(&p.kni_tx, bufs);
                self.release(bufs);
                bufs.len()
            },
            Err(_) => 0,
        }
    }

    fn create_mempool(&self, name: &str) -> Result<Arc<Mempool>, Fail> {
        let mut pools = self.pools.lock();
        let pool_id: u32 = pools.len() as u32;
        let mbuf_number: usize = self.mbuf_number.load(Ordering::Relaxed).max(1);
        let pool: Arc<Mempool> = Mempool::new(name, pool_id, mbuf_number)?;
        pools.push(pool.clone());
        Ok(pool)
    }

    fn free_mempools(&self) {
        self.pools.lock().clear();
        *self.inject_pool.lock() = None;
    }

    fn free_mbufs(&self, bufs: &[MbufHandle]) {
        self.release(bufs);
        self.direct_freed.fetch_add(bufs.len() as u64, Ordering::Relaxed);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::MemoryDriver;
    use crate::runtime::{
        memory::MbufHandle,
        network::PacketDriver,
    };
    use ::anyhow::Result;
    use ::std::sync::Arc;

    #[test]
    fn inject_then_receive() -> Result<()> {
        let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 2)?;
        driver.initialize(&[], 32, 64, 0, 0)?;

        driver.inject(0, 1, &[1, 2, 3])?;
        let mut bufs: [MbufHandle; 32] = [0; 32];
        crate::ensure_eq!(driver.receive_burst(0, 0, &mut bufs), 0);
        crate::ensure_eq!(driver.receive_burst(0, 1, &mut bufs), 1);
        Ok(())
    }

    #[test]
    fn send_captures_payload_and_recycles() -> Result<()> {
        let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
        driver.initialize(&[], 32, 8, 0, 0)?;

        driver.inject(0, 0, &[0xaa, 0xbb])?;
        let mut bufs: [MbufHandle; 32] = [0; 32];
        let count: usize = driver.receive_burst(0, 0, &mut bufs);
        crate::ensure_eq!(count, 1);
        crate::ensure_eq!(driver.send_burst(0, 0, &bufs[..count]), 1);
        crate::ensure_eq!(driver.transmitted(0), vec![vec![0xaa, 0xbb]]);

        // The mbuf went back to its pool, so the pool never runs dry.
        for _ in 0..64 {
            driver.inject(0, 0, &[0x01])?;
            let count: usize = driver.receive_burst(0, 0, &mut bufs);
            crate::ensure_eq!(count, 1);
            driver.free_mbufs(&bufs[..count]);
        }
        crate::ensure_eq!(driver.direct_freed(), 64);
        Ok(())
    }

    #[test]
    fn kernel_bridge_roundtrip() -> Result<()> {
        let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
        driver.initialize(&[], 32, 8, 0, 1)?;
        driver.create_kni(0, 0, "vEth0")?;

        driver.inject_kni(0, &[9, 9])?;
        let mut bufs: [MbufHandle; 32] = [0; 32];
        let count: usize = driver.kni_receive_burst(0, &mut bufs);
        crate::ensure_eq!(count, 1);
        crate::ensure_eq!(driver.kni_send_burst(0, &bufs[..count]), 1);
        crate::ensure_eq!(driver.kni_transmitted(0), vec![vec![9, 9]]);
        driver.free_kni(0)?;
        Ok(())
    }
}
