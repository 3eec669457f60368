use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gpu_graph::{
    BlockDim, ContextHandle, DeviceMemory, DevicePtr, FunctionHandle, GraphDriver, GraphError,
    GraphExecHandle, GraphExecUpdateResultInfo, GraphHandle, GraphInstantiateFlags,
    GraphNodeHandle, GraphNodeKind, GraphResult, GraphStream, KernelArgs, KernelNodeParams,
    StreamCaptureMode, StreamCaptureStatus, StreamHandle, ThreadDim,
};
use tracing::trace;

use crate::graph::{RefGraph, RefOp};
use crate::kernel::{HostKernelFn, KernelLaunch, RefKernel, RegisteredKernel};
use crate::memory::{DeviceHeap, RefBuffer};
use crate::stream::RefStream;

const REF_CONTEXT: ContextHandle = ContextHandle::from_raw(1);

/// Driver entry points that can be made to fail with [`RefDriver::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    CreateGraph,
    DestroyGraph,
    DestroyGraphExec,
    AddKernelNode,
    AddMemcpyNode,
    BeginCapture,
    EndCapture,
    Instantiate,
    ExecUpdate,
    Launch,
    CaptureStatus,
    DebugDotPrint,
}

impl DriverOp {
    pub fn symbol(self) -> &'static str {
        match self {
            DriverOp::CreateGraph => "ref_graph_create",
            DriverOp::DestroyGraph => "ref_graph_destroy",
            DriverOp::DestroyGraphExec => "ref_graph_exec_destroy",
            DriverOp::AddKernelNode => "ref_graph_add_kernel_node",
            DriverOp::AddMemcpyNode => "ref_graph_add_memcpy_node",
            DriverOp::BeginCapture => "ref_stream_begin_capture",
            DriverOp::EndCapture => "ref_stream_end_capture",
            DriverOp::Instantiate => "ref_graph_instantiate",
            DriverOp::ExecUpdate => "ref_graph_exec_update",
            DriverOp::Launch => "ref_graph_launch",
            DriverOp::CaptureStatus => "ref_stream_is_capturing",
            DriverOp::DebugDotPrint => "ref_graph_debug_dot_print",
        }
    }
}

/// Host reference implementation of [`GraphDriver`].
#[derive(Debug)]
pub struct RefDriver {
    node_kinds: Vec<GraphNodeKind>,
    state: Mutex<RefState>,
}

#[derive(Debug)]
struct RefState {
    next_handle: usize,
    heap: DeviceHeap,
    kernels: HashMap<FunctionHandle, Arc<RegisteredKernel>>,
    streams: HashMap<StreamHandle, StreamState>,
    graphs: HashMap<GraphHandle, RefGraph>,
    execs: HashMap<GraphExecHandle, RefGraph>,
    injected_failures: Vec<DriverOp>,
    graph_launches: u64,
}

#[derive(Debug, Default)]
struct StreamState {
    capture: Option<CaptureState>,
}

#[derive(Debug)]
struct CaptureState {
    graph: RefGraph,
    tail: Option<GraphNodeHandle>,
    mode: StreamCaptureMode,
    invalidated: Option<String>,
}

impl RefState {
    fn next_handle(&mut self) -> usize {
        self.next_handle += 1;
        self.next_handle
    }

    fn take_failure(&mut self, op: DriverOp) -> GraphResult<()> {
        match self.injected_failures.iter().position(|pending| *pending == op) {
            Some(idx) => {
                self.injected_failures.remove(idx);
                Err(GraphError::driver(op.symbol(), "injected failure"))
            }
            None => Ok(()),
        }
    }

    fn stream_mut(&mut self, stream: StreamHandle, op: &'static str) -> GraphResult<&mut StreamState> {
        self.streams
            .get_mut(&stream)
            .ok_or_else(|| GraphError::driver(op, format!("unknown stream {stream}")))
    }

    fn graph_mut(&mut self, graph: GraphHandle, op: &'static str) -> GraphResult<&mut RefGraph> {
        self.graphs
            .get_mut(&graph)
            .ok_or_else(|| GraphError::driver(op, format!("unknown graph {graph}")))
    }

    fn validate(&self, op: &RefOp) -> GraphResult<()> {
        match op {
            RefOp::Kernel { function, name, .. } => {
                if self.kernels.contains_key(function) {
                    Ok(())
                } else {
                    Err(GraphError::driver(
                        "kernel launch",
                        format!("function {function} ({name}) is not registered"),
                    ))
                }
            }
            RefOp::MemcpyD2D { dst, src, bytes } => {
                self.heap.validate(*src, *bytes)?;
                self.heap.validate(*dst, *bytes)
            }
        }
    }
}

fn run_op(
    heap: &mut DeviceHeap,
    kernels: &HashMap<FunctionHandle, Arc<RegisteredKernel>>,
    op: &RefOp,
) -> GraphResult<()> {
    match op {
        RefOp::Kernel {
            name,
            function,
            blocks,
            threads,
            shared_memory_bytes,
            args,
        } => {
            let kernel = kernels.get(function).ok_or_else(|| {
                GraphError::driver(
                    "kernel launch",
                    format!("function {function} ({name}) is not registered"),
                )
            })?;
            let launch = KernelLaunch {
                blocks: *blocks,
                threads: *threads,
                shared_memory_bytes: *shared_memory_bytes,
                args,
            };
            (kernel.body)(heap, &launch)
        }
        RefOp::MemcpyD2D { dst, src, bytes } => heap.copy(*dst, *src, *bytes),
    }
}

impl RefDriver {
    /// Driver supporting every node kind.
    pub fn new() -> Self {
        Self::with_node_kinds(&[GraphNodeKind::Kernel, GraphNodeKind::MemcpyDeviceToDevice])
    }

    /// Driver that only accepts the listed node kinds for explicit insertion,
    /// mirroring platforms without copy nodes.
    pub fn with_node_kinds(kinds: &[GraphNodeKind]) -> Self {
        Self {
            node_kinds: kinds.to_vec(),
            state: Mutex::new(RefState {
                next_handle: 0,
                heap: DeviceHeap::new(),
                kernels: HashMap::new(),
                streams: HashMap::new(),
                graphs: HashMap::new(),
                execs: HashMap::new(),
                injected_failures: Vec::new(),
                graph_launches: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call of `op` fail with a driver error.
    pub fn fail_next(&self, op: DriverOp) {
        self.lock().injected_failures.push(op);
    }

    pub fn live_graphs(&self) -> usize {
        self.lock().graphs.len()
    }

    pub fn live_graph_execs(&self) -> usize {
        self.lock().execs.len()
    }

    pub fn live_streams(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().heap.allocation_count()
    }

    /// Executable graph launches performed so far.
    pub fn graph_launches(&self) -> u64 {
        self.lock().graph_launches
    }

    pub fn graph_node_count(&self, graph: GraphHandle) -> Option<usize> {
        self.lock().graphs.get(&graph).map(|g| g.nodes.len())
    }

    pub fn exec_node_count(&self, exec: GraphExecHandle) -> Option<usize> {
        self.lock().execs.get(&exec).map(|g| g.nodes.len())
    }

    /// Dependencies of `node` inside `graph`, as inserted.
    pub fn node_dependencies(
        &self,
        graph: GraphHandle,
        node: GraphNodeHandle,
    ) -> Option<Vec<GraphNodeHandle>> {
        let state = self.lock();
        let graph = state.graphs.get(&graph)?;
        graph
            .nodes
            .iter()
            .find(|candidate| candidate.handle == node)
            .map(|found| found.deps.clone())
    }

    /// Mode of the capture currently open on `stream`.
    pub fn capture_mode(&self, stream: &dyn GraphStream) -> Option<StreamCaptureMode> {
        let state = self.lock();
        let stream = state.streams.get(&stream.native_handle())?;
        stream.capture.as_ref().map(|capture| capture.mode)
    }

    pub fn register_kernel<F>(&self, name: impl Into<String>, body: F) -> RefKernel
    where
        F: Fn(&mut DeviceHeap, &KernelLaunch<'_>) -> GraphResult<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let body: Arc<HostKernelFn> = Arc::new(body);
        let mut state = self.lock();
        let function = FunctionHandle::from_raw(state.next_handle());
        state.kernels.insert(
            function,
            Arc::new(RegisteredKernel {
                name: name.clone(),
                body,
            }),
        );
        RefKernel { name, function }
    }

    pub fn create_stream(self: &Arc<Self>) -> RefStream {
        let mut state = self.lock();
        let handle = StreamHandle::from_raw(state.next_handle());
        state.streams.insert(handle, StreamState::default());
        RefStream {
            driver: Arc::clone(self),
            handle,
        }
    }

    pub(crate) fn destroy_stream(&self, stream: StreamHandle) {
        self.lock().streams.remove(&stream);
    }

    /// Allocates zero-initialized device memory.
    pub fn alloc(self: &Arc<Self>, bytes: usize) -> RefBuffer {
        let ptr = self.lock().heap.alloc(bytes);
        RefBuffer {
            driver: Arc::clone(self),
            ptr,
            bytes,
        }
    }

    pub fn alloc_and_upload(self: &Arc<Self>, bytes: &[u8]) -> GraphResult<RefBuffer> {
        let buffer = self.alloc(bytes.len());
        self.lock().heap.write(buffer.ptr, bytes)?;
        Ok(buffer)
    }

    pub fn upload(&self, dst: &dyn DeviceMemory, bytes: &[u8]) -> GraphResult<()> {
        self.lock().heap.write(dst.device_ptr(), bytes)
    }

    pub fn download(&self, ptr: DevicePtr, bytes: usize) -> GraphResult<Vec<u8>> {
        self.lock().heap.read(ptr, bytes)
    }

    pub(crate) fn free(&self, ptr: DevicePtr) {
        self.lock().heap.free(ptr);
    }

    /// Launches `kernel` on `stream`, or records it when the stream is capturing.
    pub fn launch_kernel(
        &self,
        stream: &dyn GraphStream,
        kernel: &RefKernel,
        threads: ThreadDim,
        blocks: BlockDim,
        args: &KernelArgs,
    ) -> GraphResult<()> {
        let params = KernelNodeParams {
            name: &kernel.name,
            function: kernel.function,
            blocks,
            threads,
            args,
        };
        self.issue(stream.native_handle(), RefOp::kernel(&params))
    }

    /// Copies `dst.size_bytes()` bytes from `src` to `dst` on `stream`, or
    /// records the copy when the stream is capturing.
    pub fn memcpy_d2d(
        &self,
        stream: &dyn GraphStream,
        dst: &dyn DeviceMemory,
        src: &dyn DeviceMemory,
    ) -> GraphResult<()> {
        self.issue(
            stream.native_handle(),
            RefOp::MemcpyD2D {
                dst: dst.device_ptr(),
                src: src.device_ptr(),
                bytes: dst.size_bytes(),
            },
        )
    }

    /// Work runs eagerly, so this only checks that the stream is usable.
    pub fn synchronize(&self, stream: &dyn GraphStream) -> GraphResult<()> {
        let mut state = self.lock();
        let stream = state.stream_mut(stream.native_handle(), "ref_stream_synchronize")?;
        if stream.capture.is_some() {
            return Err(GraphError::driver(
                "ref_stream_synchronize",
                "operation not permitted when stream is capturing",
            ));
        }
        Ok(())
    }

    fn issue(&self, stream: StreamHandle, op: RefOp) -> GraphResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let validation = state.validate(&op);
        let node_id = GraphNodeHandle::from_raw(state.next_handle());
        let stream_state = state.streams.get_mut(&stream).ok_or_else(|| {
            GraphError::driver("ref_stream_enqueue", format!("unknown stream {stream}"))
        })?;

        let Some(capture) = stream_state.capture.as_mut() else {
            validation?;
            return run_op(&mut state.heap, &state.kernels, &op);
        };
        if let Some(reason) = &capture.invalidated {
            return Err(GraphError::driver(
                "ref_stream_enqueue",
                format!("stream capture was invalidated: {reason}"),
            ));
        }
        if let Err(err) = validation {
            capture.invalidated = Some(err.to_string());
            return Err(err);
        }
        let deps: Vec<_> = capture.tail.into_iter().collect();
        capture.graph.push(node_id, &deps, op)?;
        capture.tail = Some(node_id);
        Ok(())
    }
}

impl Default for RefDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphDriver for RefDriver {
    fn name(&self) -> &str {
        "reference"
    }

    fn supported_node_kinds(&self) -> &[GraphNodeKind] {
        &self.node_kinds
    }

    fn current_context(&self) -> GraphResult<ContextHandle> {
        Ok(REF_CONTEXT)
    }

    fn create_graph(&self) -> GraphResult<GraphHandle> {
        let mut state = self.lock();
        state.take_failure(DriverOp::CreateGraph)?;
        let handle = GraphHandle::from_raw(state.next_handle());
        state.graphs.insert(handle, RefGraph::default());
        Ok(handle)
    }

    fn destroy_graph(&self, graph: GraphHandle) -> GraphResult<()> {
        let mut state = self.lock();
        state.take_failure(DriverOp::DestroyGraph)?;
        state
            .graphs
            .remove(&graph)
            .map(|_| ())
            .ok_or_else(|| GraphError::driver(DriverOp::DestroyGraph.symbol(), format!("unknown graph {graph}")))
    }

    fn destroy_graph_exec(&self, exec: GraphExecHandle) -> GraphResult<()> {
        let mut state = self.lock();
        state.take_failure(DriverOp::DestroyGraphExec)?;
        state.execs.remove(&exec).map(|_| ()).ok_or_else(|| {
            GraphError::driver(
                DriverOp::DestroyGraphExec.symbol(),
                format!("unknown executable graph {exec}"),
            )
        })
    }

    fn add_kernel_node(
        &self,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        params: &KernelNodeParams<'_>,
    ) -> GraphResult<GraphNodeHandle> {
        let op_name = DriverOp::AddKernelNode.symbol();
        let mut state = self.lock();
        state.take_failure(DriverOp::AddKernelNode)?;
        let op = RefOp::kernel(params);
        state
            .validate(&op)
            .map_err(|err| GraphError::driver(op_name, err.to_string()))?;
        let node = GraphNodeHandle::from_raw(state.next_handle());
        state.graph_mut(graph, op_name)?.push(node, deps, op)?;
        Ok(node)
    }

    fn add_memcpy_d2d_node(
        &self,
        context: ContextHandle,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
    ) -> GraphResult<GraphNodeHandle> {
        let op_name = DriverOp::AddMemcpyNode.symbol();
        if !self.supports_node_kind(GraphNodeKind::MemcpyDeviceToDevice) {
            return Err(GraphError::unsupported(
                self.name(),
                GraphNodeKind::MemcpyDeviceToDevice,
            ));
        }
        let mut state = self.lock();
        state.take_failure(DriverOp::AddMemcpyNode)?;
        if context != REF_CONTEXT {
            return Err(GraphError::driver(op_name, format!("invalid context {context}")));
        }
        let op = RefOp::MemcpyD2D { dst, src, bytes };
        state
            .validate(&op)
            .map_err(|err| GraphError::driver(op_name, err.to_string()))?;
        let node = GraphNodeHandle::from_raw(state.next_handle());
        state.graph_mut(graph, op_name)?.push(node, deps, op)?;
        Ok(node)
    }

    fn begin_capture(&self, stream: StreamHandle, mode: StreamCaptureMode) -> GraphResult<()> {
        let op_name = DriverOp::BeginCapture.symbol();
        let mut state = self.lock();
        state.take_failure(DriverOp::BeginCapture)?;
        let stream_state = state.stream_mut(stream, op_name)?;
        if stream_state.capture.is_some() {
            return Err(GraphError::driver(
                op_name,
                format!("stream {stream} is already capturing"),
            ));
        }
        stream_state.capture = Some(CaptureState {
            graph: RefGraph::default(),
            tail: None,
            mode,
            invalidated: None,
        });
        Ok(())
    }

    fn end_capture(&self, stream: StreamHandle) -> GraphResult<GraphHandle> {
        let op_name = DriverOp::EndCapture.symbol();
        let mut state = self.lock();
        let capture = state
            .stream_mut(stream, op_name)?
            .capture
            .take()
            .ok_or_else(|| GraphError::driver(op_name, format!("stream {stream} is not capturing")))?;
        state.take_failure(DriverOp::EndCapture)?;
        if let Some(reason) = capture.invalidated {
            return Err(GraphError::driver(
                op_name,
                format!("stream capture was invalidated: {reason}"),
            ));
        }
        let handle = GraphHandle::from_raw(state.next_handle());
        trace!(graph = %handle, nodes = capture.graph.nodes.len(), "ended reference capture");
        state.graphs.insert(handle, capture.graph);
        Ok(handle)
    }

    fn instantiate(
        &self,
        graph: GraphHandle,
        _flags: GraphInstantiateFlags,
    ) -> GraphResult<GraphExecHandle> {
        let op_name = DriverOp::Instantiate.symbol();
        let mut state = self.lock();
        state.take_failure(DriverOp::Instantiate)?;
        let snapshot = state.graph_mut(graph, op_name)?.clone();
        let exec = GraphExecHandle::from_raw(state.next_handle());
        state.execs.insert(exec, snapshot);
        Ok(exec)
    }

    fn exec_update(
        &self,
        exec: GraphExecHandle,
        graph: GraphHandle,
    ) -> GraphResult<GraphExecUpdateResultInfo> {
        let op_name = DriverOp::ExecUpdate.symbol();
        let mut guard = self.lock();
        guard.take_failure(DriverOp::ExecUpdate)?;
        let state = &mut *guard;
        let new = state
            .graphs
            .get(&graph)
            .ok_or_else(|| GraphError::driver(op_name, format!("unknown graph {graph}")))?;
        let current = state.execs.get_mut(&exec).ok_or_else(|| {
            GraphError::driver(op_name, format!("unknown executable graph {exec}"))
        })?;
        let info = current.update_compatibility(new);
        if info.is_success() {
            current.apply_parameters(new);
        }
        Ok(info)
    }

    fn launch(&self, exec: GraphExecHandle, stream: StreamHandle) -> GraphResult<()> {
        let op_name = DriverOp::Launch.symbol();
        let mut guard = self.lock();
        guard.take_failure(DriverOp::Launch)?;
        let state = &mut *guard;
        if !state.execs.contains_key(&exec) {
            return Err(GraphError::driver(
                op_name,
                format!("unknown executable graph {exec}"),
            ));
        }
        let stream_state = state.stream_mut(stream, op_name)?;
        if let Some(capture) = stream_state.capture.as_mut() {
            let reason = "graph launches cannot be captured by the reference driver";
            capture.invalidated = Some(reason.to_string());
            return Err(GraphError::driver(op_name, reason));
        }

        let nodes = &state.execs[&exec].nodes;
        for node in nodes {
            run_op(&mut state.heap, &state.kernels, &node.op)?;
        }
        state.graph_launches += 1;
        trace!(exec = %exec, stream = %stream, nodes = nodes.len(), "ran reference graph");
        Ok(())
    }

    fn capture_status(&self, stream: StreamHandle) -> GraphResult<StreamCaptureStatus> {
        let op_name = DriverOp::CaptureStatus.symbol();
        let mut state = self.lock();
        state.take_failure(DriverOp::CaptureStatus)?;
        let stream_state = state.stream_mut(stream, op_name)?;
        Ok(match &stream_state.capture {
            None => StreamCaptureStatus::None,
            Some(capture) if capture.invalidated.is_some() => StreamCaptureStatus::Invalidated,
            Some(_) => StreamCaptureStatus::Active,
        })
    }

    fn debug_dot_print(&self, graph: GraphHandle, path: &Path) -> GraphResult<()> {
        let op_name = DriverOp::DebugDotPrint.symbol();
        let mut state = self.lock();
        state.take_failure(DriverOp::DebugDotPrint)?;
        let dot = state.graph_mut(graph, op_name)?.render_dot(graph);
        std::fs::write(path, dot)
            .map_err(|err| GraphError::driver(op_name, format!("{}: {err}", path.display())))
    }
}
