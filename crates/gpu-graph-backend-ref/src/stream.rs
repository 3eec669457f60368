use std::fmt;
use std::sync::Arc;

use gpu_graph::{GraphStream, StreamHandle};

use crate::driver::RefDriver;

/// In-order stream of the reference driver. Destroyed on drop.
pub struct RefStream {
    pub(crate) driver: Arc<RefDriver>,
    pub(crate) handle: StreamHandle,
}

impl GraphStream for RefStream {
    fn native_handle(&self) -> StreamHandle {
        self.handle
    }

    fn debug_id(&self) -> String {
        format!("ref-stream {}", self.handle)
    }
}

impl fmt::Debug for RefStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefStream").field(&self.handle).finish()
    }
}

impl Drop for RefStream {
    fn drop(&mut self) {
        self.driver.destroy_stream(self.handle);
    }
}
