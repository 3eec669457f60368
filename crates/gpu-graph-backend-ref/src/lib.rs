//! Host reference driver for `gpu-graph`.
//!
//! Device memory, streams, graphs and executables are simulated on the host
//! so graph lifecycles can be exercised without a GPU. Kernels are host
//! closures registered with [`RefDriver::register_kernel`]. Work issued on a
//! stream runs immediately unless the stream is capturing, in which case it
//! is recorded as graph nodes instead.

mod driver;
mod graph;
mod kernel;
mod memory;
mod stream;

pub use driver::{DriverOp, RefDriver};
pub use kernel::{HostKernelFn, KernelLaunch, RefKernel};
pub use memory::{DeviceHeap, RefBuffer};
pub use stream::RefStream;
