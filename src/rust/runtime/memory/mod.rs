// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::collections::raw_array::RawArray;
use crate::runtime::fail::{
    Fail,
    FailKind,
};
use ::parking_lot::Mutex;
use ::std::{
    mem,
    sync::Arc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of payload bytes that fit in one mbuf.
pub const MBUF_BODY_SIZE: usize = 2048;

/// Size of the metadata header that precedes the payload of every mbuf.
const MBUF_HEADER_SIZE: usize = mem::size_of::<MbufHeader>();

/// Total footprint of one mbuf, in 64-bit words. Keeping the storage in words keeps every header aligned.
const MBUF_TOTAL_WORDS: usize = (MBUF_HEADER_SIZE + MBUF_BODY_SIZE) / mem::size_of::<u64>();

//======================================================================================================================
// Structures
//======================================================================================================================

/// Opaque pointer-sized identifier for a buffer holding one packet. Zero is never a valid handle. The handle is the
/// address of the mbuf's metadata header; the payload follows it.
pub type MbufHandle = usize;

/// Metadata header stored in front of every mbuf payload.
#[repr(C)]
struct MbufHeader {
    /// Pool the mbuf belongs to. Any thread may free an mbuf by routing it back through this identifier.
    pool_id: u32,
    /// Number of valid payload bytes.
    data_len: u32,
    /// Number of payload bytes that fit in this mbuf.
    capacity: u32,
    _reserved: u32,
}

/// A pool of fixed-size mbufs carved from a single allocation. Pools live from creation until driver teardown, so an
/// outstanding handle always points into live storage.
pub struct Mempool {
    /// Name of the pool, used in diagnostics.
    name: String,
    /// Identifier recorded in the header of every mbuf of this pool.
    pool_id: u32,
    /// Backing storage for all mbufs.
    storage: RawArray<u64>,
    /// Handles that are currently free.
    free: Mutex<Vec<MbufHandle>>,
    /// Total number of mbufs in the pool.
    capacity: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Mempool {
    /// Creates a pool holding `mbuf_number` mbufs.
    pub fn new(name: &str, pool_id: u32, mbuf_number: usize) -> Result<Arc<Self>, Fail> {
        if mbuf_number == 0 {
            return Err(Fail::new(FailKind::BadArgument, "cannot create an empty mempool"));
        }
        let storage: RawArray<u64> = RawArray::new(mbuf_number * MBUF_TOTAL_WORDS)?;
        let base: usize = storage.as_ptr() as usize;
        let mut free: Vec<MbufHandle> = Vec::with_capacity(mbuf_number);
        for i in 0..mbuf_number {
            let handle: MbufHandle = base + i * MBUF_TOTAL_WORDS * mem::size_of::<u64>();
            unsafe {
                let header: *mut MbufHeader = handle as *mut MbufHeader;
                (*header).pool_id = pool_id;
                (*header).data_len = 0;
                (*header).capacity = MBUF_BODY_SIZE as u32;
                (*header)._reserved = 0;
            }
            free.push(handle);
        }
        Ok(Arc::new(Self {
            name: name.to_string(),
            pool_id,
            storage,
            free: Mutex::new(free),
            capacity: mbuf_number,
        }))
    }

    /// Takes one mbuf out of the pool.
    pub fn alloc_one(&self) -> Result<MbufHandle, Fail> {
        match self.free.lock().pop() {
            Some(handle) => {
                unsafe { (*(handle as *mut MbufHeader)).data_len = 0 };
                Ok(handle)
            },
            None => {
                let cause: String = format!("mempool exhausted (name={})", self.name);
                error!("alloc_one(): {}", cause);
                Err(Fail::new(FailKind::OutOfMemory, &cause))
            },
        }
    }

    /// Takes `out.len()` mbufs out of the pool. Either the whole burst is allocated or nothing is.
    pub fn alloc_bulk(&self, out: &mut [MbufHandle]) -> Result<(), Fail> {
        let mut free = self.free.lock();
        if free.len() < out.len() {
            let cause: String = format!("mempool exhausted (name={}, requested={})", self.name, out.len());
            error!("alloc_bulk(): {}", cause);
            return Err(Fail::new(FailKind::OutOfMemory, &cause));
        }
        for slot in out.iter_mut() {
            let handle: MbufHandle = free.pop().expect("length was checked above");
            unsafe { (*(handle as *mut MbufHeader)).data_len = 0 };
            *slot = handle;
        }
        Ok(())
    }

    /// Returns a burst of mbufs to the pool.
    pub fn free_bulk(&self, bufs: &[MbufHandle]) {
        let mut free = self.free.lock();
        for handle in bufs {
            debug_assert_eq!(mbuf_pool_id(*handle), self.pool_id);
            free.push(*handle);
        }
    }

    /// Returns the number of mbufs currently free in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Returns the total number of mbufs in the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the identifier of the pool.
    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    /// Returns the name of the pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks whether `handle` points into the storage of this pool.
    pub fn owns(&self, handle: MbufHandle) -> bool {
        let base: usize = self.storage.as_ptr() as usize;
        let end: usize = base + self.capacity * MBUF_TOTAL_WORDS * mem::size_of::<u64>();
        handle >= base && handle < end
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns the pool the target mbuf belongs to.
pub fn mbuf_pool_id(handle: MbufHandle) -> u32 {
    debug_assert_ne!(handle, 0);
    unsafe { (*(handle as *const MbufHeader)).pool_id }
}

/// Returns the number of valid payload bytes in the target mbuf.
pub fn mbuf_data_len(handle: MbufHandle) -> usize {
    debug_assert_ne!(handle, 0);
    unsafe { (*(handle as *const MbufHeader)).data_len as usize }
}

/// Sets the number of valid payload bytes in the target mbuf.
pub fn mbuf_set_data_len(handle: MbufHandle, len: usize) -> Result<(), Fail> {
    debug_assert_ne!(handle, 0);
    let capacity: usize = unsafe { (*(handle as *const MbufHeader)).capacity as usize };
    if len > capacity {
        return Err(Fail::new(FailKind::BadArgument, "packet length exceeds mbuf capacity"));
    }
    unsafe { (*(handle as *mut MbufHeader)).data_len = len as u32 };
    Ok(())
}

/// Returns a pointer to the first payload byte of the target mbuf.
pub fn mbuf_data_ptr(handle: MbufHandle) -> *mut u8 {
    debug_assert_ne!(handle, 0);
    (handle + MBUF_HEADER_SIZE) as *mut u8
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        mbuf_data_len,
        mbuf_data_ptr,
        mbuf_pool_id,
        mbuf_set_data_len,
        MbufHandle,
        Mempool,
        MBUF_BODY_SIZE,
    };
    use ::anyhow::Result;
    use ::std::sync::Arc;

    #[test]
    fn alloc_and_free_roundtrip() -> Result<()> {
        let pool: Arc<Mempool> = Mempool::new("test", 7, 8)?;
        crate::ensure_eq!(pool.available(), 8);

        let mut bufs: [MbufHandle; 4] = [0; 4];
        pool.alloc_bulk(&mut bufs)?;
        crate::ensure_eq!(pool.available(), 4);
        for handle in &bufs {
            crate::ensure_eq!(mbuf_pool_id(*handle), 7);
            crate::ensure_eq!(mbuf_data_len(*handle), 0);
            crate::ensure_eq!(pool.owns(*handle), true);
        }

        pool.free_bulk(&bufs);
        crate::ensure_eq!(pool.available(), 8);
        Ok(())
    }

    #[test]
    fn bulk_alloc_is_all_or_nothing() -> Result<()> {
        let pool: Arc<Mempool> = Mempool::new("test", 0, 4)?;
        let mut bufs: [MbufHandle; 8] = [0; 8];
        crate::ensure_eq!(pool.alloc_bulk(&mut bufs).is_err(), true);
        crate::ensure_eq!(pool.available(), 4);
        Ok(())
    }

    #[test]
    fn payload_write_and_read_back() -> Result<()> {
        let pool: Arc<Mempool> = Mempool::new("test", 0, 1)?;
        let handle: MbufHandle = pool.alloc_one()?;

        let payload: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];
        unsafe {
            let data: *mut u8 = mbuf_data_ptr(handle);
            data.copy_from_nonoverlapping(payload.as_ptr(), payload.len());
        }
        mbuf_set_data_len(handle, payload.len())?;
        crate::ensure_eq!(mbuf_data_len(handle), payload.len());

        let read_back: &[u8] = unsafe { ::std::slice::from_raw_parts(mbuf_data_ptr(handle), 4) };
        crate::ensure_eq!(read_back, &payload[..]);

        crate::ensure_eq!(mbuf_set_data_len(handle, MBUF_BODY_SIZE + 1).is_err(), true);
        pool.free_bulk(&[handle]);
        Ok(())
    }
}
