use std::ffi::CString;
use std::path::Path;

use gpu_graph::{
    ContextHandle, DevicePtr, GraphDriver, GraphError, GraphExecHandle, GraphExecUpdateResult,
    GraphExecUpdateResultInfo, GraphHandle, GraphInstantiateFlags, GraphNodeHandle,
    GraphNodeKind, GraphResult, KernelNodeParams, StreamCaptureMode, StreamCaptureStatus,
    StreamHandle,
};

use crate::device::{
    CUcontext, CUgraph, CUgraphExec, CUgraphNode, CUstream, CuGraphExecUpdateResultInfo,
    CudaDriver, CudaKernelNodeParams, CudaMemcpy3d, CUDA_ERROR_GRAPH_EXEC_UPDATE_FAILURE,
    CUDA_SUCCESS,
};

const NODE_KINDS: &[GraphNodeKind] = &[GraphNodeKind::Kernel, GraphNodeKind::MemcpyDeviceToDevice];

const CU_STREAM_CAPTURE_MODE_GLOBAL: u32 = 0;
const CU_STREAM_CAPTURE_MODE_THREAD_LOCAL: u32 = 1;
const CU_STREAM_CAPTURE_MODE_RELAXED: u32 = 2;

const CU_STREAM_CAPTURE_STATUS_NONE: u32 = 0;
const CU_STREAM_CAPTURE_STATUS_ACTIVE: u32 = 1;

const CUDA_GRAPH_INSTANTIATE_FLAG_AUTO_FREE_ON_LAUNCH: u64 = 1;
const CUDA_GRAPH_INSTANTIATE_FLAG_UPLOAD: u64 = 2;
const CUDA_GRAPH_INSTANTIATE_FLAG_DEVICE_LAUNCH: u64 = 4;
const CUDA_GRAPH_INSTANTIATE_FLAG_USE_NODE_PRIORITY: u64 = 8;

const CU_GRAPH_DEBUG_DOT_FLAGS_VERBOSE: u32 = 1;

fn capture_mode(mode: StreamCaptureMode) -> u32 {
    match mode {
        StreamCaptureMode::Global => CU_STREAM_CAPTURE_MODE_GLOBAL,
        StreamCaptureMode::ThreadLocal => CU_STREAM_CAPTURE_MODE_THREAD_LOCAL,
        StreamCaptureMode::Relaxed => CU_STREAM_CAPTURE_MODE_RELAXED,
    }
}

fn capture_status(raw: u32) -> StreamCaptureStatus {
    match raw {
        CU_STREAM_CAPTURE_STATUS_NONE => StreamCaptureStatus::None,
        CU_STREAM_CAPTURE_STATUS_ACTIVE => StreamCaptureStatus::Active,
        _ => StreamCaptureStatus::Invalidated,
    }
}

fn instantiate_flags(flags: GraphInstantiateFlags) -> u64 {
    let mut raw = 0;
    if flags.auto_free_on_launch {
        raw |= CUDA_GRAPH_INSTANTIATE_FLAG_AUTO_FREE_ON_LAUNCH;
    }
    if flags.upload {
        raw |= CUDA_GRAPH_INSTANTIATE_FLAG_UPLOAD;
    }
    if flags.device_launch {
        raw |= CUDA_GRAPH_INSTANTIATE_FLAG_DEVICE_LAUNCH;
    }
    if flags.use_node_priority {
        raw |= CUDA_GRAPH_INSTANTIATE_FLAG_USE_NODE_PRIORITY;
    }
    raw
}

fn update_result(raw: u32) -> GraphExecUpdateResult {
    match raw {
        0 => GraphExecUpdateResult::Success,
        2 => GraphExecUpdateResult::TopologyChanged,
        3 => GraphExecUpdateResult::NodeTypeChanged,
        4 => GraphExecUpdateResult::FunctionChanged,
        5 => GraphExecUpdateResult::ParametersChanged,
        6 => GraphExecUpdateResult::NotSupported,
        7 => GraphExecUpdateResult::UnsupportedFunctionChange,
        8 => GraphExecUpdateResult::AttributesChanged,
        _ => GraphExecUpdateResult::Error,
    }
}

fn node_handle(node: CUgraphNode) -> Option<GraphNodeHandle> {
    (!node.is_null()).then(|| GraphNodeHandle::from_raw(node as usize))
}

fn raw_deps(deps: &[GraphNodeHandle]) -> Vec<CUgraphNode> {
    deps.iter().map(|dep| dep.as_raw() as CUgraphNode).collect()
}

fn graph_ptr(graph: GraphHandle) -> CUgraph {
    graph.as_raw() as CUgraph
}

fn exec_ptr(exec: GraphExecHandle) -> CUgraphExec {
    exec.as_raw() as CUgraphExec
}

fn stream_ptr(stream: StreamHandle) -> CUstream {
    stream.as_raw() as CUstream
}

impl GraphDriver for CudaDriver {
    fn name(&self) -> &str {
        "cuda"
    }

    fn supported_node_kinds(&self) -> &[GraphNodeKind] {
        NODE_KINDS
    }

    fn current_context(&self) -> GraphResult<ContextHandle> {
        Ok(ContextHandle::from_raw(self.ctx_ptr() as usize))
    }

    fn create_graph(&self) -> GraphResult<GraphHandle> {
        self.ensure_current()?;
        let mut graph: CUgraph = std::ptr::null_mut();
        // SAFETY: `graph` is a valid out pointer.
        unsafe {
            self.check(
                (self.fns.cu_graph_create)(&mut graph as *mut CUgraph, 0),
                "cuGraphCreate",
            )?;
        }
        Ok(GraphHandle::from_raw(graph as usize))
    }

    fn destroy_graph(&self, graph: GraphHandle) -> GraphResult<()> {
        self.ensure_current()?;
        // SAFETY: graph handle is owned by the caller and destroyed once.
        unsafe { self.check((self.fns.cu_graph_destroy)(graph_ptr(graph)), "cuGraphDestroy") }
    }

    fn destroy_graph_exec(&self, exec: GraphExecHandle) -> GraphResult<()> {
        self.ensure_current()?;
        // SAFETY: executable handle is owned by the caller and destroyed once.
        unsafe {
            self.check(
                (self.fns.cu_graph_exec_destroy)(exec_ptr(exec)),
                "cuGraphExecDestroy",
            )
        }
    }

    fn add_kernel_node(
        &self,
        graph: GraphHandle,
        deps: &[GraphNodeHandle],
        params: &KernelNodeParams<'_>,
    ) -> GraphResult<GraphNodeHandle> {
        self.ensure_current()?;
        let deps = raw_deps(deps);
        let mut arguments = params.args.argument_addresses();
        let node_params = CudaKernelNodeParams {
            func: params.function.as_raw() as *mut _,
            grid_dim_x: params.blocks.x,
            grid_dim_y: params.blocks.y,
            grid_dim_z: params.blocks.z,
            block_dim_x: params.threads.x,
            block_dim_y: params.threads.y,
            block_dim_z: params.threads.z,
            shared_mem_bytes: params.args.shared_memory_bytes(),
            kernel_params: arguments.as_mut_ptr(),
            extra: std::ptr::null_mut(),
        };
        let mut node: CUgraphNode = std::ptr::null_mut();
        // SAFETY: argument values are copied by the driver before the call returns; all
        // pointers stay valid for its duration.
        unsafe {
            self.check(
                (self.fns.cu_graph_add_kernel_node)(
                    &mut node as *mut CUgraphNode,
                    graph_ptr(graph),
                    deps.as_ptr(),
                    deps.len(),
                    &node_params as *const CudaKernelNodeParams,
                ),
                "cuGraphAddKernelNode",
            )?;
        }
        Ok(GraphNodeHandle::from_raw(node as usize))
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
        self.ensure_current()?;
        let deps = raw_deps(deps);
        let copy = CudaMemcpy3d::device_to_device(dst.as_raw() as u64, src.as_raw() as u64, bytes);
        let mut node: CUgraphNode = std::ptr::null_mut();
        // SAFETY: copy descriptor and dependency array outlive the call.
        unsafe {
            self.check(
                (self.fns.cu_graph_add_memcpy_node)(
                    &mut node as *mut CUgraphNode,
                    graph_ptr(graph),
                    deps.as_ptr(),
                    deps.len(),
                    &copy as *const CudaMemcpy3d,
                    context.as_raw() as CUcontext,
                ),
                "cuGraphAddMemcpyNode",
            )?;
        }
        Ok(GraphNodeHandle::from_raw(node as usize))
    }

    fn begin_capture(&self, stream: StreamHandle, mode: StreamCaptureMode) -> GraphResult<()> {
        self.ensure_current()?;
        // SAFETY: stream handle comes from a live stream.
        unsafe {
            self.check(
                (self.fns.cu_stream_begin_capture_v2)(stream_ptr(stream), capture_mode(mode)),
                "cuStreamBeginCapture_v2",
            )
        }
    }

    fn end_capture(&self, stream: StreamHandle) -> GraphResult<GraphHandle> {
        self.ensure_current()?;
        let mut graph: CUgraph = std::ptr::null_mut();
        // SAFETY: stream handle comes from a live stream; `graph` is a valid out pointer.
        let code =
            unsafe { (self.fns.cu_stream_end_capture)(stream_ptr(stream), &mut graph as *mut CUgraph) };
        if code != CUDA_SUCCESS && !graph.is_null() {
            // An invalidated capture can still hand back a graph.
            // SAFETY: the graph was created by the failed capture and is owned by nobody else.
            let _ = unsafe { (self.fns.cu_graph_destroy)(graph) };
        }
        self.check(code, "cuStreamEndCapture")?;
        Ok(GraphHandle::from_raw(graph as usize))
    }

    fn instantiate(
        &self,
        graph: GraphHandle,
        flags: GraphInstantiateFlags,
    ) -> GraphResult<GraphExecHandle> {
        self.ensure_current()?;
        let mut exec: CUgraphExec = std::ptr::null_mut();
        // SAFETY: graph handle is live; `exec` is a valid out pointer.
        unsafe {
            self.check(
                (self.fns.cu_graph_instantiate_with_flags)(
                    &mut exec as *mut CUgraphExec,
                    graph_ptr(graph),
                    instantiate_flags(flags),
                ),
                "cuGraphInstantiateWithFlags",
            )?;
        }
        Ok(GraphExecHandle::from_raw(exec as usize))
    }

    fn exec_update(
        &self,
        exec: GraphExecHandle,
        graph: GraphHandle,
    ) -> GraphResult<GraphExecUpdateResultInfo> {
        self.ensure_current()?;
        let mut info = CuGraphExecUpdateResultInfo {
            result: 0,
            error_node: std::ptr::null_mut(),
            error_from_node: std::ptr::null_mut(),
        };
        // SAFETY: both handles are live; `info` is a valid out pointer.
        let code = unsafe {
            (self.fns.cu_graph_exec_update_v2)(
                exec_ptr(exec),
                graph_ptr(graph),
                &mut info as *mut CuGraphExecUpdateResultInfo,
            )
        };
        if code != CUDA_ERROR_GRAPH_EXEC_UPDATE_FAILURE {
            self.check(code, "cuGraphExecUpdate_v2")?;
        }
        Ok(GraphExecUpdateResultInfo {
            result: update_result(info.result),
            error_node: node_handle(info.error_node),
            error_from_node: node_handle(info.error_from_node),
        })
    }

    fn launch(&self, exec: GraphExecHandle, stream: StreamHandle) -> GraphResult<()> {
        self.ensure_current()?;
        // SAFETY: both handles are live.
        unsafe {
            self.check(
                (self.fns.cu_graph_launch)(exec_ptr(exec), stream_ptr(stream)),
                "cuGraphLaunch",
            )
        }
    }

    fn capture_status(&self, stream: StreamHandle) -> GraphResult<StreamCaptureStatus> {
        self.ensure_current()?;
        let mut status = CU_STREAM_CAPTURE_STATUS_NONE;
        // SAFETY: stream handle is live; `status` is a valid out pointer.
        unsafe {
            self.check(
                (self.fns.cu_stream_is_capturing)(stream_ptr(stream), &mut status as *mut u32),
                "cuStreamIsCapturing",
            )?;
        }
        Ok(capture_status(status))
    }

    fn debug_dot_print(&self, graph: GraphHandle, path: &Path) -> GraphResult<()> {
        let c_path = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| {
            GraphError::driver("cuGraphDebugDotPrint", "path contains NUL byte")
        })?;
        self.ensure_current()?;
        // SAFETY: graph handle is live and `c_path` is NUL terminated.
        unsafe {
            self.check(
                (self.fns.cu_graph_debug_dot_print)(
                    graph_ptr(graph),
                    c_path.as_ptr(),
                    CU_GRAPH_DEBUG_DOT_FLAGS_VERBOSE,
                ),
                "cuGraphDebugDotPrint",
            )
        }
    }
}
