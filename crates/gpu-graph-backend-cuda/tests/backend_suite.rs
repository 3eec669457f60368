use std::sync::Arc;

use anyhow::Result;
use gpu_graph::{
    capture_graph_with_options, BlockDim, GraphDebugOptions, GraphDriver, GraphError, KernelArgs,
    ThreadDim,
};
use gpu_graph_backend_cuda::{fill_u32_kernel, CudaDriver, CudaKernel, CudaStream, DeviceBuffer};
use gpu_graph_backend_tests::{define_driver_tests, GraphTestHarness};

struct CudaHarness {
    driver: Arc<CudaDriver>,
}

fn harness_or_skip() -> Option<CudaHarness> {
    match gpu_graph_backend_cuda::driver() {
        Ok(driver) => Some(CudaHarness { driver }),
        Err(err) => {
            eprintln!("skipping cuda graph test: CUDA runtime unavailable ({err})");
            None
        }
    }
}

impl GraphTestHarness for CudaHarness {
    type Buffer = DeviceBuffer;
    type Stream = CudaStream;
    type Kernel = CudaKernel;

    fn driver(&self) -> Arc<dyn GraphDriver> {
        let driver: Arc<dyn GraphDriver> = self.driver.clone();
        driver
    }

    fn create_stream(&self) -> Result<CudaStream> {
        Ok(self.driver.create_stream()?)
    }

    fn upload_u32(&self, values: &[u32]) -> Result<DeviceBuffer> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Ok(self.driver.alloc_and_upload(&bytes)?)
    }

    fn download_u32(&self, buffer: &DeviceBuffer) -> Result<Vec<u32>> {
        let bytes = buffer.read_to_vec()?;
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    fn fill_kernel(&self) -> Result<CudaKernel> {
        Ok(fill_u32_kernel(&self.driver)?)
    }

    fn launch_on_stream(
        &self,
        stream: &CudaStream,
        kernel: &CudaKernel,
        threads: ThreadDim,
        blocks: BlockDim,
        args: &KernelArgs,
    ) -> Result<()> {
        Ok(self.driver.launch_kernel(stream, kernel, threads, blocks, args)?)
    }

    fn memcpy_on_stream(
        &self,
        stream: &CudaStream,
        dst: &DeviceBuffer,
        src: &DeviceBuffer,
    ) -> Result<()> {
        Ok(self.driver.memcpy_d2d(stream, dst, src)?)
    }

    fn synchronize(&self, stream: &CudaStream) -> Result<()> {
        Ok(self.driver.synchronize(stream)?)
    }
}

define_driver_tests!(cuda, harness_or_skip);

#[test]
fn captured_graph_dumps_verbose_dot() -> Result<()> {
    let Some(harness) = harness_or_skip() else {
        return Ok(());
    };
    let driver = harness.driver();
    let stream = harness.create_stream()?;
    let kernel = harness.fill_kernel()?;
    let buffer = harness.upload_u32(&[0; 32])?;
    let (threads, blocks) = gpu_graph_backend_tests::fill_dims(32);
    let args = gpu_graph_backend_tests::fill_args(&buffer, 1);
    let dir = tempfile::tempdir()?;
    let options = GraphDebugOptions::default().with_dot_directory(dir.path());

    capture_graph_with_options(&driver, &stream, &options, || {
        harness.launch_on_stream(&stream, &kernel, threads, blocks, &args)
    })?;

    let dumps: Vec<_> = std::fs::read_dir(dir.path())?.collect::<std::io::Result<_>>()?;
    assert_eq!(dumps.len(), 1);
    let dot = std::fs::read_to_string(dumps[0].path())?;
    assert!(dot.contains("digraph"), "{dot}");
    Ok(())
}

#[test]
fn unavailable_driver_reports_a_driver_error() {
    if gpu_graph_backend_cuda::is_available() {
        return;
    }
    let err = gpu_graph_backend_cuda::driver().expect_err("driver unavailable");
    assert!(matches!(err, GraphError::Driver { .. }), "{err}");
    assert!(err.to_string().contains("CUDA driver unavailable"), "{err}");
}
