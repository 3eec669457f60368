//! Device driver contract for graph creation, capture and execution.

use std::fmt;
use std::path::Path;

use crate::error::{GraphError, GraphResult};
use crate::kernel::{BlockDim, FunctionHandle, KernelArgs, ThreadDim};
use crate::memory::DevicePtr;
use crate::stream::StreamHandle;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        // Raw driver pointers are stored as usize so handles stay Send/Sync.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            pub const fn from_raw(raw: usize) -> Self {
                Self(raw)
            }

            pub const fn as_raw(self) -> usize {
                self.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, concat!($label, "({:#x})"), self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

pub(crate) use opaque_handle;

opaque_handle!(
    /// Captured, not yet executable dependency graph.
    GraphHandle,
    "GraphHandle"
);
opaque_handle!(
    /// Instantiated, launchable graph.
    GraphExecHandle,
    "GraphExecHandle"
);
opaque_handle!(
    /// Node inside one graph; used as a dependency edge for later insertions.
    GraphNodeHandle,
    "GraphNodeHandle"
);
opaque_handle!(
    /// Device context that owns memory referenced by copy nodes.
    ContextHandle,
    "ContextHandle"
);

/// Node kinds a driver may support for explicit insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphNodeKind {
    Kernel,
    MemcpyDeviceToDevice,
}

impl GraphNodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GraphNodeKind::Kernel => "kernel",
            GraphNodeKind::MemcpyDeviceToDevice => "memcpy-d2d",
        }
    }
}

impl fmt::Display for GraphNodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which API calls are prohibited while a stream is being captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamCaptureMode {
    Global,
    #[default]
    ThreadLocal,
    Relaxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCaptureStatus {
    None,
    Active,
    /// Capture is still open but an error broke it; ending it yields no graph.
    Invalidated,
}

/// Options accepted by graph instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphInstantiateFlags {
    /// Release allocations made inside the graph before every relaunch.
    pub auto_free_on_launch: bool,
    /// Upload the executable to the device as part of instantiation.
    pub upload: bool,
    /// Allow launching the executable from device code.
    pub device_launch: bool,
    /// Honor per-node priorities instead of the launching stream's priority.
    pub use_node_priority: bool,
}

/// Outcome of an in-place executable update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphExecUpdateResult {
    Success,
    Error,
    TopologyChanged,
    NodeTypeChanged,
    FunctionChanged,
    ParametersChanged,
    NotSupported,
    UnsupportedFunctionChange,
    AttributesChanged,
}

impl GraphExecUpdateResult {
    pub fn as_str(self) -> &'static str {
        match self {
            GraphExecUpdateResult::Success => "success",
            GraphExecUpdateResult::Error => "error",
            GraphExecUpdateResult::TopologyChanged => "topology changed",
            GraphExecUpdateResult::NodeTypeChanged => "node type changed",
            GraphExecUpdateResult::FunctionChanged => "function changed",
            GraphExecUpdateResult::ParametersChanged => "parameters changed",
            GraphExecUpdateResult::NotSupported => "not supported",
            GraphExecUpdateResult::UnsupportedFunctionChange => "unsupported function change",
            GraphExecUpdateResult::AttributesChanged => "attributes changed",
        }
    }

    /// Every non-success outcome means the executable has to be re-instantiated.
    pub fn requires_reinstantiation(self) -> bool {
        self != GraphExecUpdateResult::Success
    }
}

/// Structured result reported by the driver for an executable update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphExecUpdateResultInfo {
    pub result: GraphExecUpdateResult,
    /// Node of the new graph that caused the rejection, when the driver knows it.
    pub error_node: Option<GraphNodeHandle>,
    /// Matching node in the graph the executable was built from.
    pub error_from_node: Option<GraphNodeHandle>,
}

impl GraphExecUpdateResultInfo {
    pub fn success() -> Self {
        Self::new(GraphExecUpdateResult::Success)
    }

    pub fn new(result: GraphExecUpdateResult) -> Self {
        Self {
            result,
            error_node: None,
            error_from_node: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == GraphExecUpdateResult::Success
    }
}

impl fmt::Display for GraphExecUpdateResultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "update result: {}", self.result.as_str())?;
        if let Some(node) = self.error_node {
            write!(f, " (node {node}")?;
            if let Some(from) = self.error_from_node {
                write!(f, ", previously {from}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Parameters of a kernel node, resolved to driver-level values.
#[derive(Debug, Clone, Copy)]
pub struct KernelNodeParams<'a> {
    pub name: &'a str,
    pub function: FunctionHandle,
    /// Number of blocks in the grid.
    pub blocks: BlockDim,
    /// Number of threads in each block.
    pub threads: ThreadDim,
    pub args: &'a KernelArgs,
}

/// Device driver operations the graph layer is built on.
///
/// Implementations report failures as [`GraphError::Driver`] carrying the
/// driver's own diagnostic text.
pub trait GraphDriver: Send + Sync {
    /// Returns a human-readable driver identifier (e.g. `"cuda"`, `"reference"`).
    fn name(&self) -> &str;

    /// Node kinds accepted by the explicit insertion calls.
    fn supported_node_kinds(&self) -> &[GraphNodeKind];

    fn supports_node_kind(&self, kind: GraphNodeKind) -> bool {
        self.supported_node_kinds().contains(&kind)
    }

    fn current_context(&self) -> GraphResult<ContextHandle>;

    fn create_graph(&self) -> GraphResult<GraphHandle>;

    fn destroy_graph(&self, graph: GraphHandle) -> GraphResult<()>;

    fn destroy_graph_exec(&self, exec: GraphExecHandle) -> GraphResult<()>;

    /// Inserts a kernel node depending on exactly `deps`.
    fn add_kernel_node(
        &self,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        params: &KernelNodeParams<'_>,
    ) -> GraphResult<GraphNodeHandle>;

    /// Inserts a device-to-device copy of `bytes` bytes depending on exactly `deps`.
    fn add_memcpy_d2d_node(
        &self,
        context: ContextHandle,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
    ) -> GraphResult<GraphNodeHandle> {
        let _ = (context, graph, deps, dst, src, bytes);
        Err(GraphError::unsupported(
            self.name(),
            GraphNodeKind::MemcpyDeviceToDevice,
        ))
    }

    fn begin_capture(&self, stream: StreamHandle, mode: StreamCaptureMode) -> GraphResult<()>;

    /// Ends capture on `stream` and returns the recorded graph.
    fn end_capture(&self, stream: StreamHandle) -> GraphResult<GraphHandle>;

    fn instantiate(
        &self,
        graph: GraphHandle,
        flags: GraphInstantiateFlags,
    ) -> GraphResult<GraphExecHandle>;

    /// Refreshes `exec` from `graph` in place. A rejected update is reported
    /// through the returned info rather than as an error when the driver can
    /// tell the two apart.
    fn exec_update(
        &self,
        exec: GraphExecHandle,
        graph: GraphHandle,
    ) -> GraphResult<GraphExecUpdateResultInfo>;

    /// Enqueues `exec` on `stream` without waiting for completion.
    fn launch(&self, exec: GraphExecHandle, stream: StreamHandle) -> GraphResult<()>;

    fn capture_status(&self, stream: StreamHandle) -> GraphResult<StreamCaptureStatus>;

    /// Writes a graphviz description of `graph` to `path`.
    fn debug_dot_print(&self, graph: GraphHandle, path: &Path) -> GraphResult<()> {
        let _ = (graph, path);
        Err(GraphError::driver(
            "graph_debug_dot_print",
            format!("not supported by the {} driver", self.name()),
        ))
    }
}
