use std::fmt;
use std::sync::Arc;

use gpu_graph::{FunctionHandle, GraphKernel, GraphResult};

use crate::device::{CUfunction, CUmodule, CudaDriver};

/// Entry point of [`FILL_U32_PTX`].
pub const FILL_U32_SYMBOL: &str = "gpu_graph_fill_u32";

/// `gpu_graph_fill_u32(u32* out, u32 value, u32 n)`: writes `value` to
/// `out[i]` for every global thread `i < n`.
pub const FILL_U32_PTX: &str = r#"
.version 6.0
.target sm_50
.address_size 64

.visible .entry gpu_graph_fill_u32(
    .param .u64 out,
    .param .u32 value,
    .param .u32 n
)
{
    .reg .pred %p<2>;
    .reg .b32 %r<7>;
    .reg .b64 %rd<5>;

    ld.param.u64 %rd1, [out];
    ld.param.u32 %r1, [value];
    ld.param.u32 %r2, [n];
    mov.u32 %r3, %ctaid.x;
    mov.u32 %r4, %ntid.x;
    mov.u32 %r5, %tid.x;
    mad.lo.s32 %r6, %r3, %r4, %r5;
    setp.ge.u32 %p1, %r6, %r2;
    @%p1 bra EXIT;
    cvta.to.global.u64 %rd2, %rd1;
    mul.wide.u32 %rd3, %r6, 4;
    add.s64 %rd4, %rd2, %rd3;
    st.global.u32 [%rd4], %r1;
EXIT:
    ret;
}
"#;

/// Loaded PTX module; unloaded when the last kernel referencing it drops.
pub struct CudaModule {
    pub(crate) driver: Arc<CudaDriver>,
    pub(crate) module: usize,
}

impl CudaModule {
    pub(crate) fn module_ptr(&self) -> CUmodule {
        self.module as CUmodule
    }
}

impl Drop for CudaModule {
    fn drop(&mut self) {
        if self.module != 0 {
            // SAFETY: Module belongs to this driver and is unloaded once.
            let _ = unsafe { (self.driver.fns.cu_module_unload)(self.module_ptr()) };
            self.module = 0;
        }
    }
}

#[derive(Clone)]
pub struct CudaKernel {
    pub(crate) module: Arc<CudaModule>,
    pub(crate) name: String,
    pub(crate) func: usize,
}

impl CudaKernel {
    pub(crate) fn func_ptr(&self) -> CUfunction {
        self.func as CUfunction
    }

    /// Module the kernel was resolved from.
    pub fn module(&self) -> &Arc<CudaModule> {
        &self.module
    }
}

impl GraphKernel for CudaKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn function_handle(&self) -> FunctionHandle {
        FunctionHandle::from_raw(self.func)
    }
}

impl fmt::Debug for CudaKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaKernel")
            .field("name", &self.name)
            .field("func", &self.func)
            .finish()
    }
}

/// Loads [`FILL_U32_PTX`] and resolves its entry point.
pub fn fill_u32_kernel(driver: &Arc<CudaDriver>) -> GraphResult<CudaKernel> {
    let module = driver.load_ptx_module(FILL_U32_PTX)?;
    driver.get_function(&module, FILL_U32_SYMBOL)
}
