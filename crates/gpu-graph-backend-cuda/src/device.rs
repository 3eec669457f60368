use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::sync::{Arc, OnceLock};

use gpu_graph::{
    BlockDim, DeviceMemory, DevicePtr, GraphError, GraphResult, GraphStream, KernelArgs,
    ThreadDim,
};
use libloading::Library;
use tracing::debug;

use crate::kernel::{CudaKernel, CudaModule};
use crate::stream::CudaStream;

/// Overrides the driver library probed at startup.
pub const CUDA_LIBRARY_ENV: &str = "GPU_GRAPH_CUDA_LIBRARY";

pub(crate) type CUresult = i32;
type CUdevice = i32;
pub(crate) type CUcontext = *mut c_void;
pub(crate) type CUdeviceptr = u64;
pub(crate) type CUmodule = *mut c_void;
pub(crate) type CUfunction = *mut c_void;
pub(crate) type CUstream = *mut c_void;
pub(crate) type CUgraph = *mut c_void;
pub(crate) type CUgraphExec = *mut c_void;
pub(crate) type CUgraphNode = *mut c_void;

pub(crate) const CUDA_SUCCESS: CUresult = 0;
pub(crate) const CUDA_ERROR_GRAPH_EXEC_UPDATE_FAILURE: CUresult = 910;
const CU_STREAM_NON_BLOCKING: u32 = 1;

#[repr(C)]
pub(crate) struct CudaKernelNodeParams {
    pub(crate) func: CUfunction,
    pub(crate) grid_dim_x: u32,
    pub(crate) grid_dim_y: u32,
    pub(crate) grid_dim_z: u32,
    pub(crate) block_dim_x: u32,
    pub(crate) block_dim_y: u32,
    pub(crate) block_dim_z: u32,
    pub(crate) shared_mem_bytes: u32,
    pub(crate) kernel_params: *mut *mut c_void,
    pub(crate) extra: *mut *mut c_void,
}

pub(crate) const CU_MEMORYTYPE_DEVICE: u32 = 2;

#[repr(C)]
pub(crate) struct CudaMemcpy3d {
    pub(crate) src_x_in_bytes: usize,
    pub(crate) src_y: usize,
    pub(crate) src_z: usize,
    pub(crate) src_lod: usize,
    pub(crate) src_memory_type: u32,
    pub(crate) src_host: *const c_void,
    pub(crate) src_device: CUdeviceptr,
    pub(crate) src_array: *mut c_void,
    pub(crate) reserved0: *mut c_void,
    pub(crate) src_pitch: usize,
    pub(crate) src_height: usize,
    pub(crate) dst_x_in_bytes: usize,
    pub(crate) dst_y: usize,
    pub(crate) dst_z: usize,
    pub(crate) dst_lod: usize,
    pub(crate) dst_memory_type: u32,
    pub(crate) dst_host: *mut c_void,
    pub(crate) dst_device: CUdeviceptr,
    pub(crate) dst_array: *mut c_void,
    pub(crate) reserved1: *mut c_void,
    pub(crate) dst_pitch: usize,
    pub(crate) dst_height: usize,
    pub(crate) width_in_bytes: usize,
    pub(crate) height: usize,
    pub(crate) depth: usize,
}

impl CudaMemcpy3d {
    /// Linear device-to-device copy of `bytes`.
    pub(crate) fn device_to_device(dst: CUdeviceptr, src: CUdeviceptr, bytes: usize) -> Self {
        Self {
            src_x_in_bytes: 0,
            src_y: 0,
            src_z: 0,
            src_lod: 0,
            src_memory_type: CU_MEMORYTYPE_DEVICE,
            src_host: std::ptr::null(),
            src_device: src,
            src_array: std::ptr::null_mut(),
            reserved0: std::ptr::null_mut(),
            src_pitch: 0,
            src_height: 0,
            dst_x_in_bytes: 0,
            dst_y: 0,
            dst_z: 0,
            dst_lod: 0,
            dst_memory_type: CU_MEMORYTYPE_DEVICE,
            dst_host: std::ptr::null_mut(),
            dst_device: dst,
            dst_array: std::ptr::null_mut(),
            reserved1: std::ptr::null_mut(),
            dst_pitch: 0,
            dst_height: 0,
            width_in_bytes: bytes,
            height: 1,
            depth: 1,
        }
    }
}

#[repr(C)]
pub(crate) struct CuGraphExecUpdateResultInfo {
    pub(crate) result: u32,
    pub(crate) error_node: CUgraphNode,
    pub(crate) error_from_node: CUgraphNode,
}

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuGetErrorStringFn = unsafe extern "C" fn(error: CUresult, msg: *mut *const c_char) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoDAsyncV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuModuleLoadDataExFn = unsafe extern "C" fn(
    module: *mut CUmodule,
    image: *const c_void,
    num_options: u32,
    options: *mut u32,
    option_values: *mut *mut c_void,
) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyV2Fn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
pub(crate) type CuGraphCreateFn = unsafe extern "C" fn(graph: *mut CUgraph, flags: u32) -> CUresult;
pub(crate) type CuGraphDestroyFn = unsafe extern "C" fn(graph: CUgraph) -> CUresult;
pub(crate) type CuGraphExecDestroyFn = unsafe extern "C" fn(exec: CUgraphExec) -> CUresult;
pub(crate) type CuGraphAddKernelNodeFn = unsafe extern "C" fn(
    node: *mut CUgraphNode,
    graph: CUgraph,
    deps: *const CUgraphNode,
    num_deps: usize,
    params: *const CudaKernelNodeParams,
) -> CUresult;
pub(crate) type CuGraphAddMemcpyNodeFn = unsafe extern "C" fn(
    node: *mut CUgraphNode,
    graph: CUgraph,
    deps: *const CUgraphNode,
    num_deps: usize,
    params: *const CudaMemcpy3d,
    ctx: CUcontext,
) -> CUresult;
pub(crate) type CuStreamBeginCaptureV2Fn =
    unsafe extern "C" fn(stream: CUstream, mode: u32) -> CUresult;
pub(crate) type CuStreamEndCaptureFn =
    unsafe extern "C" fn(stream: CUstream, graph: *mut CUgraph) -> CUresult;
pub(crate) type CuStreamIsCapturingFn =
    unsafe extern "C" fn(stream: CUstream, status: *mut u32) -> CUresult;
pub(crate) type CuGraphInstantiateWithFlagsFn =
    unsafe extern "C" fn(exec: *mut CUgraphExec, graph: CUgraph, flags: u64) -> CUresult;
pub(crate) type CuGraphExecUpdateV2Fn = unsafe extern "C" fn(
    exec: CUgraphExec,
    graph: CUgraph,
    info: *mut CuGraphExecUpdateResultInfo,
) -> CUresult;
pub(crate) type CuGraphLaunchFn =
    unsafe extern "C" fn(exec: CUgraphExec, stream: CUstream) -> CUresult;
pub(crate) type CuGraphDebugDotPrintFn =
    unsafe extern "C" fn(graph: CUgraph, path: *const c_char, flags: u32) -> CUresult;

pub(crate) struct DriverFns {
    cu_init: CuInitFn,
    cu_get_error_string: CuGetErrorStringFn,
    cu_device_get: CuDeviceGetFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    cu_memcpy_dto_d_async_v2: CuMemcpyDtoDAsyncV2Fn,
    cu_module_load_data_ex: CuModuleLoadDataExFn,
    pub(crate) cu_module_unload: CuModuleUnloadFn,
    cu_module_get_function: CuModuleGetFunctionFn,
    cu_launch_kernel: CuLaunchKernelFn,
    cu_stream_create: CuStreamCreateFn,
    pub(crate) cu_stream_destroy_v2: CuStreamDestroyV2Fn,
    cu_stream_synchronize: CuStreamSynchronizeFn,
    pub(crate) cu_graph_create: CuGraphCreateFn,
    pub(crate) cu_graph_destroy: CuGraphDestroyFn,
    pub(crate) cu_graph_exec_destroy: CuGraphExecDestroyFn,
    pub(crate) cu_graph_add_kernel_node: CuGraphAddKernelNodeFn,
    pub(crate) cu_graph_add_memcpy_node: CuGraphAddMemcpyNodeFn,
    pub(crate) cu_stream_begin_capture_v2: CuStreamBeginCaptureV2Fn,
    pub(crate) cu_stream_end_capture: CuStreamEndCaptureFn,
    pub(crate) cu_stream_is_capturing: CuStreamIsCapturingFn,
    pub(crate) cu_graph_instantiate_with_flags: CuGraphInstantiateWithFlagsFn,
    pub(crate) cu_graph_exec_update_v2: CuGraphExecUpdateV2Fn,
    pub(crate) cu_graph_launch: CuGraphLaunchFn,
    pub(crate) cu_graph_debug_dot_print: CuGraphDebugDotPrintFn,
}

/// CUDA driver API bound at runtime, owning a dedicated context on device 0.
pub struct CudaDriver {
    _lib: Library,
    pub(crate) fns: DriverFns,
    // Stored as usize so CudaDriver is Send + Sync.
    ctx: usize,
}

impl fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaDriver")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if self.ctx != 0 {
            // SAFETY: Context is owned by this driver instance and destroyed once on drop.
            let _ = unsafe { (self.fns.cu_ctx_destroy_v2)(self.ctx_ptr()) };
            self.ctx = 0;
        }
    }
}

/// Device allocation freed on drop.
pub struct DeviceBuffer {
    driver: Arc<CudaDriver>,
    ptr: CUdeviceptr,
    bytes: usize,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl DeviceBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn read_to_vec(&self) -> GraphResult<Vec<u8>> {
        self.driver.download(self.ptr, self.bytes)
    }
}

impl DeviceMemory for DeviceBuffer {
    fn device_ptr(&self) -> DevicePtr {
        DevicePtr::from_raw(self.ptr as usize)
    }

    fn size_bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        // SAFETY: Device pointer was allocated by this driver and is released once on drop.
        let _ = unsafe { (self.driver.fns.cu_mem_free_v2)(self.ptr) };
    }
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide driver, initialized on first use.
pub fn driver() -> GraphResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(GraphError::driver(
            "cuda driver init",
            format!("CUDA driver unavailable: {msg}"),
        )),
    }
}

impl CudaDriver {
    fn new() -> GraphResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_get_error_string: load_symbol(&lib, b"cuGetErrorString\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_memcpy_dto_d_async_v2: load_symbol(&lib, b"cuMemcpyDtoDAsync_v2\0")?,
            cu_module_load_data_ex: load_symbol(&lib, b"cuModuleLoadDataEx\0")?,
            cu_module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy_v2: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_synchronize: load_symbol(&lib, b"cuStreamSynchronize\0")?,
            cu_graph_create: load_symbol(&lib, b"cuGraphCreate\0")?,
            cu_graph_destroy: load_symbol(&lib, b"cuGraphDestroy\0")?,
            cu_graph_exec_destroy: load_symbol(&lib, b"cuGraphExecDestroy\0")?,
            cu_graph_add_kernel_node: load_symbol(&lib, b"cuGraphAddKernelNode\0")?,
            cu_graph_add_memcpy_node: load_symbol(&lib, b"cuGraphAddMemcpyNode\0")?,
            cu_stream_begin_capture_v2: load_symbol(&lib, b"cuStreamBeginCapture_v2\0")?,
            cu_stream_end_capture: load_symbol(&lib, b"cuStreamEndCapture\0")?,
            cu_stream_is_capturing: load_symbol(&lib, b"cuStreamIsCapturing\0")?,
            cu_graph_instantiate_with_flags: load_symbol(&lib, b"cuGraphInstantiateWithFlags\0")?,
            cu_graph_exec_update_v2: load_symbol(&lib, b"cuGraphExecUpdate_v2\0")?,
            cu_graph_launch: load_symbol(&lib, b"cuGraphLaunch\0")?,
            cu_graph_debug_dot_print: load_symbol(&lib, b"cuGraphDebugDotPrint\0")?,
        };

        // SAFETY: Calls are made with valid pointers and follow CUDA driver API contract.
        unsafe {
            check_cuda(&fns, (fns.cu_init)(0), "cuInit")?;
            let mut dev: CUdevice = 0;
            check_cuda(
                &fns,
                (fns.cu_device_get)(&mut dev as *mut CUdevice, 0),
                "cuDeviceGet",
            )?;
            let mut ctx: CUcontext = std::ptr::null_mut();
            check_cuda(
                &fns,
                (fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, dev),
                "cuCtxCreate_v2",
            )?;
            check_cuda(&fns, (fns.cu_ctx_set_current)(ctx), "cuCtxSetCurrent")?;
            debug!(device = dev, "initialized CUDA context");
            Ok(Self {
                _lib: lib,
                fns,
                ctx: ctx as usize,
            })
        }
    }

    pub fn alloc_and_upload(self: &Arc<Self>, bytes: &[u8]) -> GraphResult<DeviceBuffer> {
        let buffer = self.alloc(bytes.len())?;
        if !bytes.is_empty() {
            self.ensure_current()?;
            // SAFETY: Destination is a valid allocated device pointer and source host slice is valid.
            unsafe {
                self.check(
                    (self.fns.cu_memcpy_hto_d_v2)(
                        buffer.ptr,
                        bytes.as_ptr() as *const c_void,
                        bytes.len(),
                    ),
                    "cuMemcpyHtoD_v2",
                )?;
            }
        }
        Ok(buffer)
    }

    pub fn download(&self, ptr: CUdeviceptr, bytes: usize) -> GraphResult<Vec<u8>> {
        self.ensure_current()?;
        let mut out = vec![0u8; bytes];
        if bytes != 0 {
            // SAFETY: Source device pointer is valid for `bytes`; destination host buffer is valid and writable.
            unsafe {
                self.check(
                    (self.fns.cu_memcpy_dto_h_v2)(out.as_mut_ptr() as *mut c_void, ptr, bytes),
                    "cuMemcpyDtoH_v2",
                )?;
            }
        }
        Ok(out)
    }

    pub fn alloc(self: &Arc<Self>, bytes: usize) -> GraphResult<DeviceBuffer> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer for CUDA allocation.
        unsafe {
            self.check(
                (self.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, bytes.max(1)),
                "cuMemAlloc_v2",
            )?;
        }
        Ok(DeviceBuffer {
            driver: Arc::clone(self),
            ptr,
            bytes,
        })
    }

    pub fn load_ptx_module(self: &Arc<Self>, ptx: &str) -> GraphResult<Arc<CudaModule>> {
        self.ensure_current()?;
        let c_ptx = CString::new(ptx)
            .map_err(|_| GraphError::driver("cuModuleLoadDataEx", "ptx source contains NUL byte"))?;
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: pointer arguments are valid for cuModuleLoadDataEx.
        unsafe {
            self.check(
                (self.fns.cu_module_load_data_ex)(
                    &mut module as *mut CUmodule,
                    c_ptx.as_ptr() as *const c_void,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                ),
                "cuModuleLoadDataEx",
            )?;
        }
        Ok(Arc::new(CudaModule {
            driver: Arc::clone(self),
            module: module as usize,
        }))
    }

    pub fn get_function(&self, module: &Arc<CudaModule>, symbol: &str) -> GraphResult<CudaKernel> {
        self.ensure_current()?;
        let c_symbol = CString::new(symbol)
            .map_err(|_| GraphError::driver("cuModuleGetFunction", "kernel symbol contains NUL byte"))?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: module and output pointers are valid.
        unsafe {
            self.check(
                (self.fns.cu_module_get_function)(
                    &mut function as *mut CUfunction,
                    module.module_ptr(),
                    c_symbol.as_ptr(),
                ),
                "cuModuleGetFunction",
            )?;
        }

        Ok(CudaKernel {
            module: Arc::clone(module),
            name: symbol.to_string(),
            func: function as usize,
        })
    }

    pub fn create_stream(self: &Arc<Self>) -> GraphResult<CudaStream> {
        self.ensure_current()?;
        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: `stream` is a valid out pointer.
        unsafe {
            self.check(
                (self.fns.cu_stream_create)(&mut stream as *mut CUstream, CU_STREAM_NON_BLOCKING),
                "cuStreamCreate",
            )?;
        }
        Ok(CudaStream {
            driver: Arc::clone(self),
            stream: stream as usize,
        })
    }

    pub fn synchronize(&self, stream: &dyn GraphStream) -> GraphResult<()> {
        self.ensure_current()?;
        // SAFETY: stream handle was created by this driver.
        unsafe {
            self.check(
                (self.fns.cu_stream_synchronize)(stream_ptr(stream)),
                "cuStreamSynchronize",
            )
        }
    }

    /// Enqueues `kernel` on `stream`; captured when the stream is capturing.
    pub fn launch_kernel(
        &self,
        stream: &dyn GraphStream,
        kernel: &CudaKernel,
        threads: ThreadDim,
        blocks: BlockDim,
        args: &KernelArgs,
    ) -> GraphResult<()> {
        self.ensure_current()?;
        let mut params = args.argument_addresses();
        // SAFETY: function and parameter pointers are valid for kernel launch; `args`
        // outlives the call.
        unsafe {
            self.check(
                (self.fns.cu_launch_kernel)(
                    kernel.func_ptr(),
                    blocks.x,
                    blocks.y,
                    blocks.z,
                    threads.x,
                    threads.y,
                    threads.z,
                    args.shared_memory_bytes(),
                    stream_ptr(stream),
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
        }
    }

    /// Enqueues a copy of `dst.size_bytes()` bytes from `src` to `dst`.
    pub fn memcpy_d2d(
        &self,
        stream: &dyn GraphStream,
        dst: &dyn DeviceMemory,
        src: &dyn DeviceMemory,
    ) -> GraphResult<()> {
        let bytes = dst.size_bytes();
        if bytes == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: src/dst pointers are valid CUDA allocations and byte range is provided by caller.
        unsafe {
            self.check(
                (self.fns.cu_memcpy_dto_d_async_v2)(
                    dst.device_ptr().as_raw() as CUdeviceptr,
                    src.device_ptr().as_raw() as CUdeviceptr,
                    bytes,
                    stream_ptr(stream),
                ),
                "cuMemcpyDtoDAsync_v2",
            )
        }
    }

    pub fn ensure_current(&self) -> GraphResult<()> {
        // SAFETY: Context was created by this driver and remains valid until drop.
        unsafe { self.check((self.fns.cu_ctx_set_current)(self.ctx_ptr()), "cuCtxSetCurrent") }
    }

    pub(crate) fn ctx_ptr(&self) -> CUcontext {
        self.ctx as CUcontext
    }

    pub(crate) fn check(&self, code: CUresult, op: &'static str) -> GraphResult<()> {
        check_cuda(&self.fns, code, op)
    }
}

fn stream_ptr(stream: &dyn GraphStream) -> CUstream {
    stream.native_handle().as_raw() as CUstream
}

fn load_cuda_library() -> GraphResult<Library> {
    let configured = std::env::var(CUDA_LIBRARY_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    if let Some(path) = configured {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        return unsafe { Library::new(&path) }.map_err(|err| {
            GraphError::driver(
                "cuda driver init",
                format!("failed to load CUDA driver library {path} from {CUDA_LIBRARY_ENV}: {err}"),
            )
        });
    }

    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];
    for candidate in candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(GraphError::driver(
        "cuda driver init",
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> GraphResult<T> {
    // SAFETY: Caller provides expected symbol type from CUDA driver API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        GraphError::driver(
            "cuda driver init",
            format!(
                "failed to resolve CUDA symbol {}: {err}",
                String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
            ),
        )
    })?;
    Ok(*sym)
}

fn check_cuda(fns: &DriverFns, code: CUresult, op: &'static str) -> GraphResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(GraphError::driver(op, describe_error(fns, code)))
    }
}

fn describe_error(fns: &DriverFns, code: CUresult) -> String {
    let mut msg: *const c_char = std::ptr::null();
    // SAFETY: `msg` is a valid out pointer; the driver returns a static string or leaves it null.
    let described = unsafe { (fns.cu_get_error_string)(code, &mut msg as *mut *const c_char) };
    if described != CUDA_SUCCESS || msg.is_null() {
        return format!("CUDA error {code}");
    }
    // SAFETY: Non-null strings from cuGetErrorString are NUL terminated and static.
    let text = unsafe { CStr::from_ptr(msg) }.to_string_lossy();
    format!("CUDA error {code}: {text}")
}
