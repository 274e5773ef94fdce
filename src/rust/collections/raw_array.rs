// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::{
    Fail,
    FailKind,
};
use ::core::{
    alloc::Layout,
    ptr,
    slice,
};
use ::std::alloc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A fixed-size array of raw memory. Rings and mempools use this as their backing storage; callers must initialize a
/// slot before reading it back.
pub struct RawArray<T> {
    /// Capacity of the array.
    cap: usize,
    /// Pointer to the underlying data.
    ptr: ptr::NonNull<T>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated functions.
impl<T> RawArray<T> {
    /// Creates a raw array.
    pub fn new(cap: usize) -> Result<RawArray<T>, Fail> {
        // Check if capacity is invalid.
        if cap == 0 {
            return Err(Fail::new(
                FailKind::BadArgument,
                "cannot create a raw array with zero capacity",
            ));
        }

        // Allocate underlying memory.
        let layout: Layout = match Layout::array::<T>(cap) {
            Ok(layout) => layout,
            Err(_) => {
                return Err(Fail::new(
                    FailKind::BadArgument,
                    "failed to create memory layout for raw array",
                ))
            },
        };
        let ptr: ptr::NonNull<T> = {
            let ptr: *mut u8 = unsafe { alloc::alloc(layout) };
            match ptr::NonNull::new(ptr as *mut T) {
                Some(p) => p,
                None => alloc::handle_alloc_error(layout),
            }
        };

        Ok(RawArray { ptr, cap })
    }

    /// Gets a mutable slice to the underlying data in the target raw array.
    ///
    /// # Safety
    ///
    /// The caller must guarantee exclusive access to the slots it touches.
    pub unsafe fn get_mut(&self) -> &mut [T] {
        slice::from_raw_parts_mut(self.ptr.as_ptr(), self.cap)
    }

    /// Returns the capacity of the target raw array.
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Returns a pointer to the first element of the target raw array.
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Drop trait implementation.
impl<T> Drop for RawArray<T> {
    fn drop(&mut self) {
        let layout: Layout = Layout::array::<T>(self.cap).expect("layout was checked at construction");
        unsafe {
            alloc::dealloc(self.ptr.as_ptr() as *mut u8, layout);
        }
    }
}

unsafe impl<T: Send> Send for RawArray<T> {}
unsafe impl<T: Send> Sync for RawArray<T> {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::RawArray;
    use ::anyhow::Result;

    const ARRAY_LENGTH: usize = 4;

    /// Tests if we succeed to create a raw array.
    #[test]
    fn new() -> Result<()> {
        let array: RawArray<u8> = match RawArray::<u8>::new(ARRAY_LENGTH) {
            Ok(a) => a,
            Err(_) => anyhow::bail!("creating raw arrays should be possible"),
        };
        crate::ensure_eq!(array.capacity(), ARRAY_LENGTH);
        Ok(())
    }

    /// Tests if we fail to create a raw array with zero capacity.
    #[test]
    fn bad_new() -> Result<()> {
        match RawArray::<u8>::new(0) {
            Ok(_) => anyhow::bail!("creating raw arrays with zero capacity should fail"),
            Err(_) => Ok(()),
        }
    }

    /// Tests if we succeed to access and modify a raw array.
    #[test]
    fn read_back() -> Result<()> {
        let array: RawArray<u8> = RawArray::<u8>::new(ARRAY_LENGTH)?;

        for i in 0..array.capacity() {
            unsafe {
                let data: &mut [u8] = array.get_mut();
                data[i] = (i + 1) as u8;
            }
        }

        for i in 0..array.capacity() {
            unsafe {
                let data: &mut [u8] = array.get_mut();
                crate::ensure_eq!(data[i], (i + 1) as u8);
            }
        }

        Ok(())
    }
}
