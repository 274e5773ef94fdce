// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod pcap;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::{
        mbuf_data_len,
        mbuf_data_ptr,
        mbuf_set_data_len,
        MbufHandle,
    },
};
use ::std::{
    slice,
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Whether transmit checksums are delegated to hardware.
static HW_TX_CHECKSUM: AtomicBool = AtomicBool::new(false);

//======================================================================================================================
// Structures
//======================================================================================================================

/// A view over the payload of one mbuf. Packets are extracted from mbuf handles flowing through rings; the mbuf
/// storage outlives every extracted view because pools are only torn down after all workers retire.
pub struct Packet {
    mbuf: MbufHandle,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Packet {
    /// Materializes a packet view over `mbuf`.
    pub fn extract(mbuf: MbufHandle) -> Packet {
        debug_assert_ne!(mbuf, 0);
        Packet { mbuf }
    }

    /// Materializes views over the first `count` handles of `bufs` into `dst`.
    pub fn extract_packets(dst: &mut Vec<Packet>, bufs: &[MbufHandle], count: usize) {
        dst.clear();
        dst.extend(bufs[..count].iter().map(|h: &MbufHandle| Packet::extract(*h)));
    }

    /// Returns the handle of the underlying mbuf.
    pub fn mbuf(&self) -> MbufHandle {
        self.mbuf
    }

    /// Returns the number of payload bytes in the target packet.
    pub fn len(&self) -> usize {
        mbuf_data_len(self.mbuf)
    }

    /// Checks whether the target packet carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the payload of the target packet.
    pub fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(mbuf_data_ptr(self.mbuf), self.len()) }
    }

    /// Returns the payload of the target packet for modification.
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(mbuf_data_ptr(self.mbuf), self.len()) }
    }

    /// Re-sizes the payload of the target packet. Contents beyond the previous length are unspecified until written.
    pub fn set_len(&mut self, len: usize) -> Result<(), Fail> {
        mbuf_set_data_len(self.mbuf, len)
    }

    /// Builds the payload of the target packet from `bytes`.
    pub fn generate_from_bytes(&mut self, bytes: &[u8]) -> Result<(), Fail> {
        mbuf_set_data_len(self.mbuf, bytes.len())?;
        unsafe { mbuf_data_ptr(self.mbuf).copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) };
        Ok(())
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Enables or disables hardware transmit checksum calculation.
pub fn set_hw_tx_checksum_flag(use_hw: bool) {
    HW_TX_CHECKSUM.store(use_hw, Ordering::Relaxed);
}

/// Returns whether transmit checksums are delegated to hardware.
pub fn hw_tx_checksum_flag() -> bool {
    HW_TX_CHECKSUM.load(Ordering::Relaxed)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Packet;
    use crate::runtime::memory::{
        MbufHandle,
        Mempool,
    };
    use ::anyhow::Result;
    use ::std::sync::Arc;

    #[test]
    fn build_and_read_back() -> Result<()> {
        let pool: Arc<Mempool> = Mempool::new("test", 0, 2)?;
        let handle: MbufHandle = pool.alloc_one()?;

        let mut packet: Packet = Packet::extract(handle);
        packet.generate_from_bytes(&[1, 2, 3, 4, 5])?;
        crate::ensure_eq!(packet.len(), 5);
        crate::ensure_eq!(packet.data(), &[1, 2, 3, 4, 5]);

        packet.data_mut()[0] = 9;
        crate::ensure_eq!(packet.data(), &[9, 2, 3, 4, 5]);

        pool.free_bulk(&[handle]);
        Ok(())
    }

    #[test]
    fn bulk_extract() -> Result<()> {
        let pool: Arc<Mempool> = Mempool::new("test", 0, 4)?;
        let mut bufs: [MbufHandle; 4] = [0; 4];
        pool.alloc_bulk(&mut bufs)?;

        let mut packets: Vec<Packet> = Vec::new();
        Packet::extract_packets(&mut packets, &bufs, 3);
        crate::ensure_eq!(packets.len(), 3);
        for (packet, handle) in packets.iter().zip(bufs.iter()) {
            crate::ensure_eq!(packet.mbuf(), *handle);
        }

        pool.free_bulk(&bufs);
        Ok(())
    }
}
