use anyhow::{ensure, Result};
use gpu_graph::{
    add_kernel_node, add_memcpy_d2d_node, capture_graph_with_options, create_graph,
    instantiate_graph, GraphDebugOptions, GraphError, GraphExecCounters, GraphNodeKind,
};

use crate::{fill_args, fill_dims, GraphTestHarness};

const LEN: usize = 300;

pub fn captured_kernel_runs_on_launch<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let counters = GraphExecCounters::shared();
    let stream = harness.create_stream()?;
    let kernel = harness.fill_kernel()?;
    let buffer = harness.upload_u32(&[0; LEN])?;
    let (threads, blocks) = fill_dims(LEN);
    let args = fill_args(&buffer, 7);

    let graph = capture_graph_with_options(&driver, &stream, &GraphDebugOptions::default(), || {
        harness.launch_on_stream(&stream, &kernel, threads, blocks, &args)
    })?;
    harness.synchronize(&stream)?;
    ensure!(
        harness.download_u32(&buffer)?.iter().all(|v| *v == 0),
        "captured work must not run before launch"
    );

    let mut exec = instantiate_graph(graph, &counters)?;
    exec.launch(&stream)?;
    harness.synchronize(&stream)?;

    assert_eq!(harness.download_u32(&buffer)?, vec![7; LEN]);
    assert_eq!(exec.launch_count(), 1);
    Ok(())
}

pub fn explicit_kernel_node_runs_on_launch<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let counters = GraphExecCounters::shared();
    let stream = harness.create_stream()?;
    let kernel = harness.fill_kernel()?;
    let buffer = harness.upload_u32(&[0; LEN])?;
    let (threads, blocks) = fill_dims(LEN);

    let graph = create_graph(&driver)?;
    add_kernel_node(&graph, &[], threads, blocks, &kernel, &fill_args(&buffer, 11))?;
    let mut exec = instantiate_graph(graph, &counters)?;
    exec.launch(&stream)?;
    exec.launch(&stream)?;
    harness.synchronize(&stream)?;

    assert_eq!(harness.download_u32(&buffer)?, vec![11; LEN]);
    assert_eq!(exec.launch_count(), 2);
    Ok(())
}

pub fn captured_memcpy_copies_on_launch<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let counters = GraphExecCounters::shared();
    let stream = harness.create_stream()?;
    let expected: Vec<u32> = (0..LEN as u32).map(|i| i * 3 + 1).collect();
    let src = harness.upload_u32(&expected)?;
    let dst = harness.upload_u32(&[0; LEN])?;

    let graph = capture_graph_with_options(&driver, &stream, &GraphDebugOptions::default(), || {
        harness.memcpy_on_stream(&stream, &dst, &src)
    })?;
    let mut exec = instantiate_graph(graph, &counters)?;
    exec.launch(&stream)?;
    harness.synchronize(&stream)?;

    assert_eq!(harness.download_u32(&dst)?, expected);
    Ok(())
}

/// Builds `fill(src) -> copy(dst <- src)` explicitly. Drivers without copy
/// nodes must reject the copy with `Unsupported`.
pub fn explicit_memcpy_node_follows_kernel<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let counters = GraphExecCounters::shared();
    let stream = harness.create_stream()?;
    let kernel = harness.fill_kernel()?;
    let src = harness.upload_u32(&[0; LEN])?;
    let dst = harness.upload_u32(&[0; LEN])?;
    let (threads, blocks) = fill_dims(LEN);

    let graph = create_graph(&driver)?;
    let fill = add_kernel_node(&graph, &[], threads, blocks, &kernel, &fill_args(&src, 5))?;
    let context = driver.current_context()?;
    let copied = add_memcpy_d2d_node(context, &graph, &[fill], &dst, &src);

    if !driver.supports_node_kind(GraphNodeKind::MemcpyDeviceToDevice) {
        ensure!(
            matches!(copied, Err(GraphError::Unsupported { .. })),
            "expected unsupported copy node, got {copied:?}"
        );
        return Ok(());
    }
    copied?;

    let mut exec = instantiate_graph(graph, &counters)?;
    exec.launch(&stream)?;
    harness.synchronize(&stream)?;

    assert_eq!(harness.download_u32(&src)?, vec![5; LEN]);
    assert_eq!(harness.download_u32(&dst)?, vec![5; LEN]);
    Ok(())
}

pub fn update_refreshes_kernel_parameters<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let counters = GraphExecCounters::shared();
    let stream = harness.create_stream()?;
    let kernel = harness.fill_kernel()?;
    let buffer = harness.upload_u32(&[0; LEN])?;
    let (threads, blocks) = fill_dims(LEN);
    let options = GraphDebugOptions::default();

    let capture_fill = |value: u32| {
        let args = fill_args(&buffer, value);
        capture_graph_with_options(&driver, &stream, &options, || {
            harness.launch_on_stream(&stream, &kernel, threads, blocks, &args)
        })
    };

    let mut exec = instantiate_graph(capture_fill(1)?, &counters)?;
    exec.launch(&stream)?;
    harness.synchronize(&stream)?;
    assert_eq!(harness.download_u32(&buffer)?, vec![1; LEN]);

    exec.update(capture_fill(2)?)?;
    exec.launch(&stream)?;
    harness.synchronize(&stream)?;
    assert_eq!(harness.download_u32(&buffer)?, vec![2; LEN]);

    assert_eq!(exec.update_count(), 1);
    assert_eq!(exec.launch_count(), 1);
    assert_eq!(counters.allocated(), 1);
    Ok(())
}

pub fn update_rejects_topology_change<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let counters = GraphExecCounters::shared();
    let kernel = harness.fill_kernel()?;
    let buffer = harness.upload_u32(&[0; LEN])?;
    let (threads, blocks) = fill_dims(LEN);

    let single = create_graph(&driver)?;
    add_kernel_node(&single, &[], threads, blocks, &kernel, &fill_args(&buffer, 1))?;
    let mut exec = instantiate_graph(single, &counters)?;

    let double = create_graph(&driver)?;
    let first = add_kernel_node(&double, &[], threads, blocks, &kernel, &fill_args(&buffer, 1))?;
    add_kernel_node(&double, &[first], threads, blocks, &kernel, &fill_args(&buffer, 2))?;

    let err = exec
        .update(double)
        .expect_err("adding a node cannot be applied in place");
    assert!(err.is_internal(), "{err}");
    assert!(
        err.to_string().contains("failed to update gpu graph"),
        "{err}"
    );
    assert_eq!(exec.update_count(), 1);
    assert!(!exec.is_empty());
    Ok(())
}
