//! Ownership, capture and replay of device-executable graphs.
//!
//! A graph is recorded either by inserting nodes explicitly or by capturing
//! the work issued on a stream, then instantiated once into an executable
//! graph that can be launched repeatedly and refreshed in place with
//! [`OwnedGraphExec::update`]. The device driver, streams, kernels and device
//! memory are collaborators described by the traits in [`driver`],
//! [`stream`], [`kernel`] and [`memory`].

pub mod capture;
pub mod construct;
pub mod counters;
pub mod driver;
mod env;
pub mod error;
pub mod exec;
pub mod graph;
pub mod kernel;
pub mod memory;
pub mod stream;

pub use capture::{capture_graph, capture_graph_with_options};
pub use construct::{add_kernel_node, add_memcpy_d2d_node, create_graph};
pub use counters::{GraphExecCounters, GraphExecStats};
pub use driver::{
    ContextHandle, GraphDriver, GraphExecHandle, GraphExecUpdateResult, GraphExecUpdateResultInfo,
    GraphHandle, GraphInstantiateFlags, GraphNodeHandle, GraphNodeKind, KernelNodeParams,
    StreamCaptureMode, StreamCaptureStatus,
};
pub use env::{GraphDebugOptions, DEBUG_DIRECTORY_ENV};
pub use error::{GraphError, GraphResult};
pub use exec::{instantiate_graph, instantiate_graph_with_flags, is_stream_capturing};
pub use graph::{OwnedGraph, OwnedGraphExec};
pub use kernel::{BlockDim, FunctionHandle, GraphKernel, KernelArgs, ThreadDim};
pub use memory::{DeviceMemory, DevicePtr};
pub use stream::{GraphStream, StreamHandle};
