// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod consts;
pub mod memdev;
pub mod types;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::{
        MbufHandle,
        Mempool,
    },
    network::types::MacAddress,
};
use ::std::sync::Arc;

//======================================================================================================================
// Traits
//======================================================================================================================

/// Contract against the underlying poll-mode driver. The graph runtime is written entirely against this trait; a
/// backend provides ports with per-lane receive queues, transmit queues, kernel-bridge taps and mempools. All methods
/// may be called concurrently from pinned worker threads; burst operations never block.
pub trait PacketDriver: Send + Sync {
    /// Brings the driver up. Called once, before any other method. `args` is the user's argv pass-through; what it
    /// means is up to the backend.
    fn initialize(
        &self,
        args: &[String],
        burst_size: usize,
        mbuf_number: usize,
        mbuf_cache_size: usize,
        kni_number: i32,
    ) -> Result<(), Fail>;

    /// Tears the driver down. No driver method may be called afterwards.
    fn finalize(&self);

    /// Returns the number of ports exposed by the driver.
    fn ports_number(&self) -> u16;

    /// Returns the number of receive-side-scaling queues the hardware advertises for `port`.
    fn port_rss_count(&self, port: u16) -> i32;

    /// Checks whether `port` can compute TCP/UDP checksums in hardware on transmit.
    fn check_hw_tx_checksum_capability(&self, port: u16) -> bool;

    /// Acquires queues and buffers for `port`.
    fn create_port(
        &self,
        port: u16,
        will_receive: bool,
        tx_queues: u16,
        hw_tx_checksum: bool,
        in_index: i32,
    ) -> Result<(), Fail>;

    /// Releases the resources of `port`.
    fn stop_port(&self, port: u16);

    /// Returns the MAC address of `port`.
    fn port_mac_address(&self, port: u16) -> MacAddress;

    /// Receives up to `bufs.len()` packets from one receive-side-scaling lane of `port`.
    fn receive_burst(&self, port: u16, lane: usize, bufs: &mut [MbufHandle]) -> usize;

    /// Transmits a burst on one transmit queue of `port`. Returns the number of mbufs accepted; accepted mbufs are
    /// owned (and eventually freed) by the driver.
    fn send_burst(&self, port: u16, queue: u16, bufs: &[MbufHandle]) -> usize;

    /// Creates a kernel-bridge device on `port`, serviced from the given core.
    fn create_kni(&self, port: u16, core: usize, name: &str) -> Result<(), Fail>;

    /// Releases the kernel-bridge device of `port`.
    fn free_kni(&self, port: u16) -> Result<(), Fail>;

    /// Receives up to `bufs.len()` packets from the kernel-bridge device of `port`.
    fn kni_receive_burst(&self, port: u16, bufs: &mut [MbufHandle]) -> usize;

    /// Passes a burst to the kernel-bridge device of `port`. Accepted mbufs are owned by the driver.
    fn kni_send_burst(&self, port: u16, bufs: &[MbufHandle]) -> usize;

    /// Creates a mempool. The pool stays alive until `free_mempools`.
    fn create_mempool(&self, name: &str) -> Result<Arc<Mempool>, Fail>;

    /// Releases every mempool created through this driver.
    fn free_mempools(&self);

    /// Synchronously frees a burst of mbufs, returning each to the pool it came from.
    fn free_mbufs(&self, bufs: &[MbufHandle]);
}
