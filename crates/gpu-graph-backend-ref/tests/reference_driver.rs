use std::sync::Arc;

use anyhow::Result;
use gpu_graph::{
    capture_graph_with_options, create_graph, instantiate_graph, is_stream_capturing,
    BlockDim, DeviceMemory, DevicePtr, GraphDebugOptions, GraphDriver, GraphError, GraphExecCounters,
    GraphExecUpdateResult, GraphInstantiateFlags, GraphStream, KernelArgs, StreamCaptureMode,
    StreamCaptureStatus, ThreadDim,
};
use gpu_graph_backend_ref::{DriverOp, RefDriver, RefKernel};

fn setup() -> (Arc<RefDriver>, Arc<dyn GraphDriver>) {
    gpu_graph_backend_tests::init_test_logging();
    let reference = Arc::new(RefDriver::new());
    let driver: Arc<dyn GraphDriver> = reference.clone();
    (reference, driver)
}

fn counting_kernel(driver: &RefDriver, name: &str) -> RefKernel {
    driver.register_kernel(name, |heap, launch| {
        let counter = launch.arg_ptr(0)?;
        let current = heap.read_u32(counter)?;
        heap.write_u32(counter, current + launch.arg_u32(1)?)
    })
}

fn counter_args(counter: &dyn DeviceMemory, step: u32) -> KernelArgs {
    let mut args = KernelArgs::new();
    args.push_buffer(counter).push_u32(step);
    args
}

#[test]
fn stream_work_runs_immediately_outside_capture() -> Result<()> {
    let (reference, _) = setup();
    let stream = reference.create_stream();
    let kernel = counting_kernel(&reference, "add");
    let counter = reference.alloc(4);

    let args = counter_args(&counter, 5);
    reference.launch_kernel(&stream, &kernel, ThreadDim::linear(1), BlockDim::linear(1), &args)?;
    reference.launch_kernel(&stream, &kernel, ThreadDim::linear(1), BlockDim::linear(1), &args)?;

    assert_eq!(counter.read_to_vec()?, 10u32.to_ne_bytes().to_vec());
    Ok(())
}

#[test]
fn capture_chains_stream_work_in_issue_order() -> Result<()> {
    let (reference, driver) = setup();
    let stream = reference.create_stream();
    let kernel = counting_kernel(&reference, "add");
    let counter = reference.alloc(4);
    let args = counter_args(&counter, 1);

    let graph = capture_graph_with_options(&driver, &stream, &GraphDebugOptions::default(), || {
        assert_eq!(reference.capture_mode(&stream), Some(StreamCaptureMode::ThreadLocal));
        for _ in 0..3 {
            reference.launch_kernel(&stream, &kernel, ThreadDim::linear(1), BlockDim::linear(1), &args)?;
        }
        Ok::<(), GraphError>(())
    })?;
    let handle = graph.handle().expect("captured graph");
    assert_eq!(reference.graph_node_count(handle), Some(3));
    assert_eq!(reference.capture_mode(&stream), None);
    assert_eq!(counter.read_to_vec()?, vec![0; 4]);

    let counters = GraphExecCounters::shared();
    let mut exec = instantiate_graph(graph, &counters)?;
    assert_eq!(reference.live_graphs(), 0);
    exec.launch(&stream)?;
    exec.launch(&stream)?;
    assert_eq!(counter.read_to_vec()?, 6u32.to_ne_bytes().to_vec());
    assert_eq!(reference.graph_launches(), 2);
    Ok(())
}

#[test]
fn begin_capture_failure_skips_the_body() -> Result<()> {
    let (reference, driver) = setup();
    let stream = reference.create_stream();
    reference.fail_next(DriverOp::BeginCapture);

    let mut ran = false;
    let err = capture_graph_with_options(&driver, &stream, &GraphDebugOptions::default(), || {
        ran = true;
        Ok::<(), GraphError>(())
    })
    .expect_err("begin capture was made to fail");

    assert!(!ran);
    assert!(err.is_driver(), "{err}");
    assert!(err.to_string().contains("ref_stream_begin_capture"), "{err}");
    assert!(!is_stream_capturing(driver.as_ref(), &stream)?);
    Ok(())
}

#[test]
fn invalidated_capture_yields_no_graph() -> Result<()> {
    let (reference, driver) = setup();
    let stream = reference.create_stream();
    let small = reference.alloc(4);
    let large = reference.alloc(64);

    let err = capture_graph_with_options(&driver, &stream, &GraphDebugOptions::default(), || {
        // Copying 64 bytes out of a 4 byte buffer invalidates the capture.
        let copied = reference.memcpy_d2d(&stream, &large, &small);
        assert!(copied.is_err());
        assert_eq!(
            driver.capture_status(stream.native_handle()).ok(),
            Some(StreamCaptureStatus::Invalidated)
        );
        assert!(!is_stream_capturing(driver.as_ref(), &stream)?);
        copied
    })
    .expect_err("invalidated capture");

    assert!(err.is_driver(), "{err}");
    assert!(err.to_string().contains("invalidated"), "{err}");
    assert_eq!(reference.live_graphs(), 0);
    assert!(!is_stream_capturing(driver.as_ref(), &stream)?);
    Ok(())
}

#[test]
fn launching_into_a_capturing_stream_is_rejected() -> Result<()> {
    let (reference, driver) = setup();
    let stream = reference.create_stream();
    let counters = GraphExecCounters::shared();
    let mut exec = instantiate_graph(create_graph(&driver)?, &counters)?;

    let err = capture_graph_with_options(&driver, &stream, &GraphDebugOptions::default(), || {
        exec.launch(&stream)
    })
    .expect_err("nested graph launch");
    assert!(err.is_driver(), "{err}");
    assert!(
        err.to_string().contains("graph launches cannot be captured"),
        "{err}"
    );
    assert_eq!(exec.launch_count(), 1);
    assert_eq!(reference.graph_launches(), 0);
    Ok(())
}

#[test]
fn update_results_follow_device_rules() -> Result<()> {
    let (reference, driver) = setup();
    let add = counting_kernel(&reference, "add");
    let other = counting_kernel(&reference, "other");
    let counter = reference.alloc(4);
    let args = counter_args(&counter, 1);
    let dims = (ThreadDim::linear(1), BlockDim::linear(1));

    let graph_with = |kernel: &RefKernel| -> Result<gpu_graph::GraphHandle> {
        let graph = driver.create_graph()?;
        let params = gpu_graph::KernelNodeParams {
            name: "node",
            function: gpu_graph::GraphKernel::function_handle(kernel),
            blocks: dims.1,
            threads: dims.0,
            args: &args,
        };
        driver.add_kernel_node(graph, &[], &params)?;
        Ok(graph)
    };

    let base = graph_with(&add)?;
    let exec = driver.instantiate(base, GraphInstantiateFlags::default())?;

    let same = graph_with(&add)?;
    assert!(driver.exec_update(exec, same)?.is_success());

    let changed = graph_with(&other)?;
    let info = driver.exec_update(exec, changed)?;
    assert_eq!(info.result, GraphExecUpdateResult::FunctionChanged);
    assert!(info.result.requires_reinstantiation());
    assert!(info.error_node.is_some());

    let empty = driver.create_graph()?;
    assert_eq!(
        driver.exec_update(exec, empty)?.result,
        GraphExecUpdateResult::TopologyChanged
    );

    for graph in [base, same, changed, empty] {
        driver.destroy_graph(graph)?;
    }
    driver.destroy_graph_exec(exec)?;
    assert_eq!(reference.live_graphs(), 0);
    assert_eq!(reference.live_graph_execs(), 0);
    Ok(())
}

#[test]
fn injected_failures_fire_once() -> Result<()> {
    let (reference, driver) = setup();
    reference.fail_next(DriverOp::CreateGraph);

    let err = create_graph(&driver).expect_err("injected failure");
    assert_eq!(err.to_string(), "ref_graph_create failed: injected failure");
    let graph = create_graph(&driver)?;
    assert!(!graph.is_empty());
    Ok(())
}

#[test]
fn dot_export_describes_nodes_and_edges() -> Result<()> {
    let (reference, driver) = setup();
    let stream = reference.create_stream();
    let kernel = counting_kernel(&reference, "add");
    let a = reference.alloc(4);
    let b = reference.alloc(4);
    let args = counter_args(&a, 1);

    let graph = capture_graph_with_options(&driver, &stream, &GraphDebugOptions::default(), || {
        reference.launch_kernel(&stream, &kernel, ThreadDim::linear(1), BlockDim::linear(1), &args)?;
        reference.memcpy_d2d(&stream, &b, &a)
    })?;
    let handle = graph.handle().expect("captured graph");

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("graph.dot");
    driver.debug_dot_print(handle, &path)?;
    let dot = std::fs::read_to_string(&path)?;

    assert!(dot.starts_with(&format!("digraph gpu_graph_{:x} {{", handle.as_raw())));
    assert!(dot.contains("kernel add"), "{dot}");
    assert!(dot.contains("memcpy d2d"), "{dot}");
    assert!(dot.contains("n0 -> n1;"), "{dot}");
    Ok(())
}

#[test]
fn out_of_range_downloads_are_driver_errors() -> Result<()> {
    let (reference, _) = setup();
    let buffer = reference.alloc(16);
    let inner = DevicePtr::from_raw(buffer.device_ptr().as_raw() + 1);

    let err = reference
        .download(inner, usize::MAX)
        .expect_err("range overflows the allocation");
    assert!(err.is_driver(), "{err}");
    assert_eq!(reference.download(inner, 15)?.len(), 15);
    Ok(())
}
