use anyhow::{anyhow, ensure, Result};
use gpu_graph::{
    capture_graph_with_options, create_graph, instantiate_graph, is_stream_capturing,
    GraphDebugOptions, GraphError, GraphExecCounters,
};

use crate::{fill_args, fill_dims, GraphTestHarness};

pub fn counters_track_alive_and_allocated<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let counters = GraphExecCounters::shared();

    let mut execs = Vec::new();
    for _ in 0..3 {
        execs.push(instantiate_graph(create_graph(&driver)?, &counters)?);
    }
    let ids: Vec<_> = execs.iter().filter_map(|exec| exec.id()).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(counters.allocated(), 3);
    assert_eq!(counters.alive(), 3);

    drop(execs.remove(1));
    assert_eq!(counters.allocated(), 3);
    assert_eq!(counters.alive(), 2);

    execs.push(instantiate_graph(create_graph(&driver)?, &counters)?);
    assert_eq!(execs[2].id(), Some(3));

    drop(execs);
    assert_eq!(counters.allocated(), 4);
    assert_eq!(counters.alive(), 0);
    Ok(())
}

pub fn back_to_back_captures_get_distinct_ids<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let counters = GraphExecCounters::shared();
    let stream = harness.create_stream()?;
    let options = GraphDebugOptions::default();

    let first = capture_graph_with_options(&driver, &stream, &options, || Ok::<(), GraphError>(()))?;
    let second = capture_graph_with_options(&driver, &stream, &options, || Ok::<(), GraphError>(()))?;
    let first = instantiate_graph(first, &counters)?;
    let second = instantiate_graph(second, &counters)?;

    assert_ne!(first.id(), second.id());
    assert_ne!(first.handle(), second.handle());
    assert_eq!(counters.alive(), 2);
    Ok(())
}

pub fn empty_capture_is_instantiable<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let counters = GraphExecCounters::shared();
    let stream = harness.create_stream()?;

    let graph = capture_graph_with_options(
        &driver,
        &stream,
        &GraphDebugOptions::default(),
        || Ok::<(), GraphError>(()),
    )?;
    ensure!(!graph.is_empty(), "an empty capture still yields a graph");

    let mut exec = instantiate_graph(graph, &counters)?;
    exec.launch(&stream)?;
    harness.synchronize(&stream)?;
    assert_eq!(exec.launch_count(), 1);
    Ok(())
}

/// A failing body is reported as an internal error carrying its message, and
/// the stream leaves capture mode so it can be captured again.
pub fn failed_capture_ends_capture<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let stream = harness.create_stream()?;
    let kernel = harness.fill_kernel()?;
    let buffer = harness.upload_u32(&[0; 64])?;
    let (threads, blocks) = fill_dims(64);
    let args = fill_args(&buffer, 3);
    let options = GraphDebugOptions::default();

    let err = capture_graph_with_options(&driver, &stream, &options, || {
        harness.launch_on_stream(&stream, &kernel, threads, blocks, &args)?;
        Err(anyhow!("body failed after one launch"))
    })
    .expect_err("a failing body must fail the capture");

    assert!(err.is_internal(), "{err}");
    assert!(
        err.to_string()
            .contains("failed to capture gpu graph: body failed after one launch"),
        "{err}"
    );
    assert!(!is_stream_capturing(driver.as_ref(), &stream)?);

    let retry = capture_graph_with_options(&driver, &stream, &options, || Ok::<(), GraphError>(()))?;
    assert!(!retry.is_empty());
    Ok(())
}

pub fn stream_reports_capture_only_inside_body<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let stream = harness.create_stream()?;

    assert!(!is_stream_capturing(driver.as_ref(), &stream)?);
    let mut seen_inside = None;
    capture_graph_with_options(&driver, &stream, &GraphDebugOptions::default(), || {
        seen_inside = Some(is_stream_capturing(driver.as_ref(), &stream)?);
        Ok::<(), GraphError>(())
    })?;
    assert_eq!(seen_inside, Some(true));
    assert!(!is_stream_capturing(driver.as_ref(), &stream)?);
    Ok(())
}

pub fn launch_count_resets_on_update<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let counters = GraphExecCounters::shared();
    let stream = harness.create_stream()?;

    let mut exec = instantiate_graph(create_graph(&driver)?, &counters)?;
    exec.launch(&stream)?;
    assert_eq!(exec.launch_count(), 1);
    exec.launch(&stream)?;
    exec.launch(&stream)?;
    assert_eq!(exec.launch_count(), 3);
    harness.synchronize(&stream)?;

    exec.update(create_graph(&driver)?)?;
    assert_eq!(exec.launch_count(), 0);
    assert_eq!(exec.update_count(), 1);

    exec.launch(&stream)?;
    harness.synchronize(&stream)?;
    assert_eq!(exec.launch_count(), 1);
    assert_eq!(exec.update_count(), 1);
    Ok(())
}

pub fn take_moves_ownership<H: GraphTestHarness>(harness: &H) -> Result<()> {
    let driver = harness.driver();
    let counters = GraphExecCounters::shared();
    let stream = harness.create_stream()?;

    let mut graph = create_graph(&driver)?;
    let moved_graph = graph.take();
    assert!(graph.is_empty());
    assert!(!moved_graph.is_empty());
    drop(graph);

    let mut exec = instantiate_graph(moved_graph, &counters)?;
    exec.launch(&stream)?;
    let id = exec.id();
    let mut moved = exec.take();

    assert!(exec.is_empty());
    assert_eq!(exec.id(), None);
    assert_eq!(moved.id(), id);
    assert_eq!(moved.launch_count(), 1);
    assert!(matches!(
        exec.launch(&stream),
        Err(GraphError::EmptyHandle { .. })
    ));

    drop(exec);
    assert_eq!(counters.alive(), 1);

    moved.launch(&stream)?;
    harness.synchronize(&stream)?;
    drop(moved);
    assert_eq!(counters.alive(), 0);
    assert_eq!(counters.allocated(), 1);
    Ok(())
}
