//! CUDA implementation of [`gpu_graph::GraphDriver`].
//!
//! `libcuda` is loaded on first use through [`driver`]; set
//! [`CUDA_LIBRARY_ENV`] to point at a specific library. Machines without a
//! driver report `false` from [`is_available`].

mod device;
mod graph;
mod kernel;
mod stream;

pub use device::{driver, is_available, CudaDriver, DeviceBuffer, CUDA_LIBRARY_ENV};
pub use kernel::{fill_u32_kernel, CudaKernel, CudaModule, FILL_U32_PTX, FILL_U32_SYMBOL};
pub use stream::CudaStream;
