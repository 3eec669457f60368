use std::fmt;
use std::sync::Arc;

use gpu_graph::{GraphStream, StreamHandle};

use crate::device::{CUstream, CudaDriver};

/// Non-blocking CUDA stream, destroyed on drop.
pub struct CudaStream {
    pub(crate) driver: Arc<CudaDriver>,
    pub(crate) stream: usize,
}

impl CudaStream {
    fn stream_ptr(&self) -> CUstream {
        self.stream as CUstream
    }
}

impl GraphStream for CudaStream {
    fn native_handle(&self) -> StreamHandle {
        StreamHandle::from_raw(self.stream)
    }

    fn debug_id(&self) -> String {
        format!("cuda-stream {:#x}", self.stream)
    }
}

impl fmt::Debug for CudaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CudaStream").field(&self.stream).finish()
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        if self.stream != 0 {
            // SAFETY: Stream was created by this driver and is destroyed once.
            let _ = unsafe { (self.driver.fns.cu_stream_destroy_v2)(self.stream_ptr()) };
            self.stream = 0;
        }
    }
}
