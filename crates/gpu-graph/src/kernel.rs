use std::ffi::c_void;
use std::fmt;

use crate::driver::opaque_handle;
use crate::memory::{DeviceMemory, DevicePtr};

opaque_handle!(
    /// Platform-native handle of a loaded kernel function.
    FunctionHandle,
    "FunctionHandle"
);

/// Threads per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl ThreadDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn count(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }
}

impl Default for ThreadDim {
    fn default() -> Self {
        Self::linear(1)
    }
}

/// Blocks per grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BlockDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn count(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }
}

impl Default for BlockDim {
    fn default() -> Self {
        Self::linear(1)
    }
}

/// Kernel that has been loaded on the device and can be referenced by nodes.
pub trait GraphKernel {
    fn name(&self) -> &str;

    fn function_handle(&self) -> FunctionHandle;
}

impl<K: GraphKernel + ?Sized> GraphKernel for &K {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn function_handle(&self) -> FunctionHandle {
        (**self).function_handle()
    }
}

/// Packed kernel arguments.
///
/// Each argument is copied into its own 8-byte aligned slot so the slot
/// addresses can be handed to the driver as the `void**` parameter array.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct KernelArgs {
    slots: Vec<ArgSlot>,
    shared_memory_bytes: u32,
}

#[derive(Clone, PartialEq, Eq)]
struct ArgSlot {
    words: Box<[u64]>,
    len: usize,
}

impl ArgSlot {
    fn from_bytes(bytes: &[u8]) -> Self {
        let mut words = vec![0u64; bytes.len().div_ceil(8).max(1)];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks(8)) {
            let mut raw = [0u8; 8];
            raw[..chunk.len()].copy_from_slice(chunk);
            *word = u64::from_ne_bytes(raw);
        }
        Self {
            words: words.into_boxed_slice(),
            len: bytes.len(),
        }
    }

    fn bytes(&self) -> Vec<u8> {
        let mut out: Vec<u8> = self.words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        out.truncate(self.len);
        out
    }
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shared_memory_bytes(mut self, bytes: u32) -> Self {
        self.shared_memory_bytes = bytes;
        self
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.slots.push(ArgSlot::from_bytes(bytes));
        self
    }

    pub fn push_u32(&mut self, value: u32) -> &mut Self {
        self.push_bytes(&value.to_ne_bytes())
    }

    pub fn push_u64(&mut self, value: u64) -> &mut Self {
        self.push_bytes(&value.to_ne_bytes())
    }

    pub fn push_f32(&mut self, value: f32) -> &mut Self {
        self.push_bytes(&value.to_ne_bytes())
    }

    pub fn push_device_ptr(&mut self, ptr: DevicePtr) -> &mut Self {
        self.push_u64(ptr.as_raw() as u64)
    }

    pub fn push_buffer(&mut self, buffer: &dyn DeviceMemory) -> &mut Self {
        self.push_device_ptr(buffer.device_ptr())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn shared_memory_bytes(&self) -> u32 {
        self.shared_memory_bytes
    }

    /// Byte value of argument `index` as it was pushed.
    pub fn argument_bytes(&self, index: usize) -> Option<Vec<u8>> {
        self.slots.get(index).map(ArgSlot::bytes)
    }

    /// Addresses of the argument slots, in push order.
    ///
    /// The pointers stay valid while `self` is alive and unmodified; drivers
    /// only read through them.
    pub fn argument_addresses(&self) -> Vec<*mut c_void> {
        self.slots
            .iter()
            .map(|slot| slot.words.as_ptr().cast::<c_void>().cast_mut())
            .collect()
    }
}

impl fmt::Debug for KernelArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelArgs")
            .field("count", &self.slots.len())
            .field(
                "sizes",
                &self.slots.iter().map(|slot| slot.len).collect::<Vec<_>>(),
            )
            .field("shared_memory_bytes", &self.shared_memory_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_arguments_keep_their_byte_values() {
        let mut args = KernelArgs::new().with_shared_memory_bytes(128);
        args.push_device_ptr(DevicePtr::from_raw(0x1000))
            .push_u32(7)
            .push_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);

        assert_eq!(args.len(), 3);
        assert_eq!(args.shared_memory_bytes(), 128);
        assert_eq!(
            args.argument_bytes(0).unwrap(),
            0x1000u64.to_ne_bytes().to_vec()
        );
        assert_eq!(args.argument_bytes(1).unwrap(), 7u32.to_ne_bytes().to_vec());
        assert_eq!(
            args.argument_bytes(2).unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9]
        );
        assert!(args.argument_bytes(3).is_none());
    }

    #[test]
    fn argument_addresses_are_aligned_and_distinct() {
        let mut args = KernelArgs::new();
        args.push_u32(1).push_u32(2);
        let addresses = args.argument_addresses();
        assert_eq!(addresses.len(), 2);
        assert_ne!(addresses[0], addresses[1]);
        for address in addresses {
            assert_eq!(address as usize % std::mem::align_of::<u64>(), 0);
        }
    }

    #[test]
    fn dims_count_threads_and_blocks() {
        assert_eq!(ThreadDim::new(8, 4, 2).count(), 64);
        assert_eq!(BlockDim::linear(3).count(), 3);
        assert_eq!(ThreadDim::default(), ThreadDim::new(1, 1, 1));
    }
}
