use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use gpu_graph::{DeviceMemory, DevicePtr, GraphError, GraphResult};

use crate::driver::RefDriver;

const BASE_ADDRESS: usize = 0x10_0000;
const ALIGNMENT: usize = 256;

/// Simulated device memory.
///
/// Allocations get distinct, non-zero, 256-byte aligned addresses that are
/// never reused, so stale pointers fail instead of aliasing new buffers.
#[derive(Debug)]
pub struct DeviceHeap {
    allocations: BTreeMap<usize, Vec<u8>>,
    next_address: usize,
}

impl DeviceHeap {
    pub(crate) fn new() -> Self {
        Self {
            allocations: BTreeMap::new(),
            next_address: BASE_ADDRESS,
        }
    }

    pub(crate) fn alloc(&mut self, bytes: usize) -> DevicePtr {
        let address = self.next_address;
        let span = bytes.max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        self.next_address += span;
        self.allocations.insert(address, vec![0; bytes]);
        DevicePtr::from_raw(address)
    }

    pub(crate) fn free(&mut self, ptr: DevicePtr) -> bool {
        self.allocations.remove(&ptr.as_raw()).is_some()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Finds the allocation holding `[ptr, ptr + len)`.
    fn locate(&self, ptr: DevicePtr, len: usize) -> GraphResult<(usize, usize)> {
        let address = ptr.as_raw();
        let (base, data) = self
            .allocations
            .range(..=address)
            .next_back()
            .ok_or_else(|| invalid_access(ptr, len))?;
        let offset = address - base;
        offset
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| invalid_access(ptr, len))?;
        Ok((*base, offset))
    }

    /// Checks that `[ptr, ptr + len)` lies inside one allocation.
    pub fn validate(&self, ptr: DevicePtr, len: usize) -> GraphResult<()> {
        self.locate(ptr, len).map(|_| ())
    }

    pub fn read(&self, ptr: DevicePtr, len: usize) -> GraphResult<Vec<u8>> {
        let (base, offset) = self.locate(ptr, len)?;
        Ok(self.allocations[&base][offset..offset + len].to_vec())
    }

    pub fn write(&mut self, ptr: DevicePtr, bytes: &[u8]) -> GraphResult<()> {
        let (base, offset) = self.locate(ptr, bytes.len())?;
        let data = self
            .allocations
            .get_mut(&base)
            .ok_or_else(|| invalid_access(ptr, bytes.len()))?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn copy(&mut self, dst: DevicePtr, src: DevicePtr, len: usize) -> GraphResult<()> {
        let bytes = self.read(src, len)?;
        self.write(dst, &bytes)
    }

    pub fn read_u32(&self, ptr: DevicePtr) -> GraphResult<u32> {
        let bytes = self.read(ptr, 4)?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&mut self, ptr: DevicePtr, value: u32) -> GraphResult<()> {
        self.write(ptr, &value.to_ne_bytes())
    }
}

fn invalid_access(ptr: DevicePtr, len: usize) -> GraphError {
    GraphError::driver(
        "device memory access",
        format!("invalid device address range {ptr}+{len}"),
    )
}

/// Device allocation owned by the reference driver; freed on drop.
pub struct RefBuffer {
    pub(crate) driver: Arc<RefDriver>,
    pub(crate) ptr: DevicePtr,
    pub(crate) bytes: usize,
}

impl RefBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn read_to_vec(&self) -> GraphResult<Vec<u8>> {
        self.driver.download(self.ptr, self.bytes)
    }
}

impl DeviceMemory for RefBuffer {
    fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    fn size_bytes(&self) -> usize {
        self.bytes
    }
}

impl fmt::Debug for RefBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefBuffer")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for RefBuffer {
    fn drop(&mut self) {
        self.driver.free(self.ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_never_reused() {
        let mut heap = DeviceHeap::new();
        let a = heap.alloc(10);
        let b = heap.alloc(0);
        assert_eq!(a.as_raw() % ALIGNMENT, 0);
        assert_ne!(a, b);
        assert!(heap.free(a));
        let c = heap.alloc(10);
        assert_ne!(a, c);
        assert!(heap.read(a, 1).is_err());
    }

    #[test]
    fn accesses_are_bounds_checked() {
        let mut heap = DeviceHeap::new();
        let ptr = heap.alloc(8);
        heap.write_u32(DevicePtr::from_raw(ptr.as_raw() + 4), 9).unwrap();
        assert_eq!(
            heap.read_u32(DevicePtr::from_raw(ptr.as_raw() + 4)).unwrap(),
            9
        );
        assert!(heap.read(ptr, 9).is_err());
        assert!(heap.write(DevicePtr::from_raw(ptr.as_raw() + 8), &[1]).is_err());
        assert!(heap.validate(ptr, 8).is_ok());
        assert!(heap.read(DevicePtr::from_raw(1), 1).is_err());
    }

    #[test]
    fn huge_lengths_are_rejected_without_overflow() {
        let mut heap = DeviceHeap::new();
        let ptr = heap.alloc(8);
        let inner = DevicePtr::from_raw(ptr.as_raw() + 1);
        assert!(heap.validate(inner, usize::MAX).is_err());
        assert!(heap.read(inner, usize::MAX).is_err());
    }

    #[test]
    fn copy_moves_bytes_between_allocations() {
        let mut heap = DeviceHeap::new();
        let src = heap.alloc(4);
        let dst = heap.alloc(4);
        heap.write(src, &[1, 2, 3, 4]).unwrap();
        heap.copy(dst, src, 4).unwrap();
        assert_eq!(heap.read(dst, 4).unwrap(), vec![1, 2, 3, 4]);
    }
}
