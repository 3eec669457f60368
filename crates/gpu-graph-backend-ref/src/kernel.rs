use std::fmt;
use std::sync::Arc;

use gpu_graph::{
    BlockDim, DevicePtr, FunctionHandle, GraphError, GraphKernel, GraphResult, ThreadDim,
};

use crate::memory::DeviceHeap;

/// Host implementation of a device kernel.
pub type HostKernelFn = dyn Fn(&mut DeviceHeap, &KernelLaunch<'_>) -> GraphResult<()> + Send + Sync;

/// Launch configuration and argument values seen by a host kernel.
#[derive(Debug, Clone, Copy)]
pub struct KernelLaunch<'a> {
    pub blocks: BlockDim,
    pub threads: ThreadDim,
    pub shared_memory_bytes: u32,
    pub args: &'a [Vec<u8>],
}

impl KernelLaunch<'_> {
    /// Linear global thread ids covered by the launch.
    pub fn global_threads(&self) -> std::ops::Range<u64> {
        0..self.blocks.count() * self.threads.count()
    }

    fn arg(&self, index: usize, width: usize) -> GraphResult<&[u8]> {
        match self.args.get(index) {
            Some(bytes) if bytes.len() == width => Ok(bytes),
            Some(bytes) => Err(GraphError::driver(
                "kernel launch",
                format!(
                    "argument {index} has {} bytes, expected {width}",
                    bytes.len()
                ),
            )),
            None => Err(GraphError::driver(
                "kernel launch",
                format!("missing argument {index} ({} provided)", self.args.len()),
            )),
        }
    }

    pub fn arg_u32(&self, index: usize) -> GraphResult<u32> {
        let bytes = self.arg(index, 4)?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn arg_u64(&self, index: usize) -> GraphResult<u64> {
        let bytes = self.arg(index, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_ne_bytes(raw))
    }

    pub fn arg_ptr(&self, index: usize) -> GraphResult<DevicePtr> {
        Ok(DevicePtr::from_raw(self.arg_u64(index)? as usize))
    }
}

pub(crate) struct RegisteredKernel {
    pub(crate) name: String,
    pub(crate) body: Arc<HostKernelFn>,
}

/// Kernel registered with a [`crate::RefDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefKernel {
    pub(crate) name: String,
    pub(crate) function: FunctionHandle,
}

impl GraphKernel for RefKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn function_handle(&self) -> FunctionHandle {
        self.function
    }
}

impl fmt::Debug for RegisteredKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredKernel")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
