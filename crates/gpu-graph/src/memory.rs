use crate::driver::opaque_handle;

opaque_handle!(
    /// Device address as seen by the driver.
    DevicePtr,
    "DevicePtr"
);

/// Region of device memory addressable by graph nodes.
pub trait DeviceMemory {
    fn device_ptr(&self) -> DevicePtr;

    fn size_bytes(&self) -> usize;
}

impl<M: DeviceMemory + ?Sized> DeviceMemory for &M {
    fn device_ptr(&self) -> DevicePtr {
        (**self).device_ptr()
    }

    fn size_bytes(&self) -> usize {
        (**self).size_bytes()
    }
}

impl<M: DeviceMemory + ?Sized> DeviceMemory for std::sync::Arc<M> {
    fn device_ptr(&self) -> DevicePtr {
        (**self).device_ptr()
    }

    fn size_bytes(&self) -> usize {
        (**self).size_bytes()
    }
}
