use std::sync::Arc;

use gpu_graph::{
    BlockDim, DeviceMemory, GraphDriver, GraphKernel, GraphStream, KernelArgs, ThreadDim,
};
use tracing_subscriber::EnvFilter;

pub mod invariants;
pub mod smoke;

pub use anyhow;

/// Threads per block used by the fill kernel in every suite.
pub const FILL_BLOCK_THREADS: u32 = 64;

/// What a driver must provide to run the shared suites.
///
/// The fill kernel has the signature `fill_u32(out: *mut u32, value: u32, n: u32)`
/// and writes `value` to `out[i]` for every global thread `i < n`.
pub trait GraphTestHarness {
    type Buffer: DeviceMemory;
    type Stream: GraphStream;
    type Kernel: GraphKernel;

    fn driver(&self) -> Arc<dyn GraphDriver>;

    fn create_stream(&self) -> anyhow::Result<Self::Stream>;

    fn upload_u32(&self, values: &[u32]) -> anyhow::Result<Self::Buffer>;

    fn download_u32(&self, buffer: &Self::Buffer) -> anyhow::Result<Vec<u32>>;

    fn fill_kernel(&self) -> anyhow::Result<Self::Kernel>;

    /// Enqueues a kernel launch on `stream`; recorded when the stream captures.
    fn launch_on_stream(
        &self,
        stream: &Self::Stream,
        kernel: &Self::Kernel,
        threads: ThreadDim,
        blocks: BlockDim,
        args: &KernelArgs,
    ) -> anyhow::Result<()>;

    /// Enqueues a full-size device copy on `stream`.
    fn memcpy_on_stream(
        &self,
        stream: &Self::Stream,
        dst: &Self::Buffer,
        src: &Self::Buffer,
    ) -> anyhow::Result<()>;

    fn synchronize(&self, stream: &Self::Stream) -> anyhow::Result<()>;
}

/// Arguments for the fill kernel covering every element of `buffer`.
pub fn fill_args(buffer: &dyn DeviceMemory, value: u32) -> KernelArgs {
    let len = (buffer.size_bytes() / std::mem::size_of::<u32>()) as u32;
    let mut args = KernelArgs::new();
    args.push_buffer(buffer).push_u32(value).push_u32(len);
    args
}

/// Launch shape for the fill kernel over `len` elements.
pub fn fill_dims(len: usize) -> (ThreadDim, BlockDim) {
    let blocks = (len as u32).div_ceil(FILL_BLOCK_THREADS).max(1);
    (ThreadDim::linear(FILL_BLOCK_THREADS), BlockDim::linear(blocks))
}

/// Routes `tracing` output through the test writer, filtered by `RUST_LOG`.
pub fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

#[macro_export]
macro_rules! define_driver_tests {
    ($module:ident, $harness_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::{invariants, smoke};

            macro_rules! driver_test {
                ($name:ident, $func:path) => {
                    #[test]
                    fn $name() -> $crate::anyhow::Result<()> {
                        $crate::init_test_logging();
                        let Some(harness) = ($harness_ctor)() else {
                            eprintln!(concat!(
                                "skipping ",
                                stringify!($name),
                                ": graph driver unavailable"
                            ));
                            return Ok(());
                        };
                        $func(&harness)
                    }
                };
            }

            driver_test!(smoke_captured_kernel_runs_on_launch, smoke::captured_kernel_runs_on_launch);
            driver_test!(smoke_explicit_kernel_node_runs_on_launch, smoke::explicit_kernel_node_runs_on_launch);
            driver_test!(smoke_captured_memcpy_copies_on_launch, smoke::captured_memcpy_copies_on_launch);
            driver_test!(smoke_explicit_memcpy_node_follows_kernel, smoke::explicit_memcpy_node_follows_kernel);
            driver_test!(smoke_update_refreshes_kernel_parameters, smoke::update_refreshes_kernel_parameters);
            driver_test!(smoke_update_rejects_topology_change, smoke::update_rejects_topology_change);
            driver_test!(invariants_counters_track_alive_and_allocated, invariants::counters_track_alive_and_allocated);
            driver_test!(invariants_back_to_back_captures_get_distinct_ids, invariants::back_to_back_captures_get_distinct_ids);
            driver_test!(invariants_empty_capture_is_instantiable, invariants::empty_capture_is_instantiable);
            driver_test!(invariants_failed_capture_ends_capture, invariants::failed_capture_ends_capture);
            driver_test!(invariants_stream_reports_capture_only_inside_body, invariants::stream_reports_capture_only_inside_body);
            driver_test!(invariants_launch_count_resets_on_update, invariants::launch_count_resets_on_update);
            driver_test!(invariants_take_moves_ownership, invariants::take_moves_ownership);
        }
    };
}
