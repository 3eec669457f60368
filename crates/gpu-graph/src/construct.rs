//! Explicit graph construction.

use std::sync::Arc;

use tracing::trace;

use crate::driver::{ContextHandle, GraphDriver, GraphNodeHandle, GraphNodeKind, KernelNodeParams};
use crate::error::{GraphError, GraphResult};
use crate::graph::OwnedGraph;
use crate::kernel::{BlockDim, GraphKernel, KernelArgs, ThreadDim};
use crate::memory::DeviceMemory;

/// Allocates a new empty graph.
pub fn create_graph(driver: &Arc<dyn GraphDriver>) -> GraphResult<OwnedGraph> {
    let handle = driver.create_graph()?;
    trace!(graph = %handle, driver = driver.name(), "created gpu graph");
    Ok(OwnedGraph::from_raw(Arc::clone(driver), handle))
}

/// Inserts a kernel launch of `blocks` x `threads` into `graph`.
///
/// The node depends on exactly `deps`; no ordering is inferred.
pub fn add_kernel_node(
    graph: &OwnedGraph,
    deps: &[GraphNodeHandle],
    threads: ThreadDim,
    blocks: BlockDim,
    kernel: &dyn GraphKernel,
    args: &KernelArgs,
) -> GraphResult<GraphNodeHandle> {
    let (driver, handle) = graph.live_parts()?;
    let params = KernelNodeParams {
        name: kernel.name(),
        function: kernel.function_handle(),
        blocks,
        threads,
        args,
    };
    let node = driver.add_kernel_node(handle, deps, &params)?;
    trace!(
        graph = %handle,
        node = %node,
        kernel = kernel.name(),
        deps = deps.len(),
        "added kernel node"
    );
    Ok(node)
}

/// Inserts a device-to-device copy of `dst.size_bytes()` bytes into `graph`.
///
/// Only drivers that list [`GraphNodeKind::MemcpyDeviceToDevice`] accept this
/// node; others fail with [`GraphError::Unsupported`] before any driver call.
pub fn add_memcpy_d2d_node(
    context: ContextHandle,
    graph: &OwnedGraph,
    deps: &[GraphNodeHandle],
    dst: &dyn DeviceMemory,
    src: &dyn DeviceMemory,
) -> GraphResult<GraphNodeHandle> {
    let (driver, handle) = graph.live_parts()?;
    if !driver.supports_node_kind(GraphNodeKind::MemcpyDeviceToDevice) {
        return Err(GraphError::unsupported(
            driver.name(),
            GraphNodeKind::MemcpyDeviceToDevice,
        ));
    }
    let bytes = dst.size_bytes();
    let node = driver.add_memcpy_d2d_node(
        context,
        handle,
        deps,
        dst.device_ptr(),
        src.device_ptr(),
        bytes,
    )?;
    trace!(graph = %handle, node = %node, bytes, "added memcpy d2d node");
    Ok(node)
}
