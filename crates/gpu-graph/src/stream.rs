use crate::driver::opaque_handle;

opaque_handle!(
    /// Platform-native stream identifier handed to the driver.
    StreamHandle,
    "StreamHandle"
);

/// Stream (queue) that sequences device work and can be put in capture mode.
pub trait GraphStream {
    fn native_handle(&self) -> StreamHandle;

    /// Human-readable identifier used in log lines.
    fn debug_id(&self) -> String {
        format!("stream {}", self.native_handle())
    }
}

impl<S: GraphStream + ?Sized> GraphStream for &S {
    fn native_handle(&self) -> StreamHandle {
        (**self).native_handle()
    }

    fn debug_id(&self) -> String {
        (**self).debug_id()
    }
}
