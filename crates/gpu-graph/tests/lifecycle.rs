use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use gpu_graph::{
    add_kernel_node, add_memcpy_d2d_node, capture_graph_with_options, create_graph,
    instantiate_graph, is_stream_capturing, BlockDim, GraphDebugOptions, GraphDriver,
    GraphError, GraphExecCounters, GraphNodeKind, KernelArgs, OwnedGraph, ThreadDim,
};
use gpu_graph_backend_ref::{DriverOp, RefDriver, RefKernel};
use serde_json::json;

fn reference() -> (Arc<RefDriver>, Arc<dyn GraphDriver>) {
    let reference = Arc::new(RefDriver::new());
    let driver: Arc<dyn GraphDriver> = reference.clone();
    (reference, driver)
}

fn noop_kernel(driver: &RefDriver) -> RefKernel {
    driver.register_kernel("noop", |_, _| Ok(()))
}

#[test]
fn explicit_nodes_depend_on_exactly_the_given_nodes() -> Result<()> {
    let (reference, driver) = reference();
    let kernel = noop_kernel(&reference);
    let args = KernelArgs::new();
    let one = (ThreadDim::linear(1), BlockDim::linear(1));

    let graph = create_graph(&driver)?;
    let a = add_kernel_node(&graph, &[], one.0, one.1, &kernel, &args)?;
    let b = add_kernel_node(&graph, &[], one.0, one.1, &kernel, &args)?;
    let joined = add_kernel_node(&graph, &[a, b], one.0, one.1, &kernel, &args)?;

    let handle = graph.handle().expect("live graph");
    assert_eq!(reference.graph_node_count(handle), Some(3));
    assert_eq!(reference.node_dependencies(handle, b), Some(vec![]));
    assert_eq!(reference.node_dependencies(handle, joined), Some(vec![a, b]));
    Ok(())
}

#[test]
fn unsupported_copy_node_is_rejected_before_the_driver() -> Result<()> {
    let reference = Arc::new(RefDriver::with_node_kinds(&[GraphNodeKind::Kernel]));
    let driver: Arc<dyn GraphDriver> = reference.clone();
    reference.fail_next(DriverOp::AddMemcpyNode);
    let src = reference.alloc(16);
    let dst = reference.alloc(16);

    let graph = create_graph(&driver)?;
    let context = driver.current_context()?;
    let err = add_memcpy_d2d_node(context, &graph, &[], &dst, &src).expect_err("no copy nodes");

    assert!(matches!(
        err,
        GraphError::Unsupported {
            kind: GraphNodeKind::MemcpyDeviceToDevice,
            ..
        }
    ));
    assert_eq!(
        err.to_string(),
        "reference driver does not support memcpy-d2d graph nodes"
    );
    assert_eq!(reference.graph_node_count(graph.handle().expect("live graph")), Some(0));
    Ok(())
}

#[test]
fn copy_node_transfers_destination_size() -> Result<()> {
    let (reference, driver) = reference();
    let counters = GraphExecCounters::shared();
    let stream = reference.create_stream();
    let src = reference.alloc_and_upload(&[1, 2, 3, 4, 5, 6, 7, 8])?;
    let dst = reference.alloc(4);

    let graph = create_graph(&driver)?;
    add_memcpy_d2d_node(driver.current_context()?, &graph, &[], &dst, &src)?;
    instantiate_graph(graph, &counters)?.launch(&stream)?;

    assert_eq!(dst.read_to_vec()?, vec![1, 2, 3, 4]);
    Ok(())
}

#[test]
fn instantiation_consumes_the_graph() -> Result<()> {
    let (reference, driver) = reference();
    let counters = GraphExecCounters::shared();

    let exec = instantiate_graph(create_graph(&driver)?, &counters)?;
    assert_eq!(reference.live_graphs(), 0);
    assert_eq!(reference.live_graph_execs(), 1);

    drop(exec);
    assert_eq!(reference.live_graph_execs(), 0);
    Ok(())
}

#[test]
fn empty_owners_are_rejected_and_drop_quietly() -> Result<()> {
    let (reference, driver) = reference();
    let counters = GraphExecCounters::shared();

    let err = instantiate_graph(OwnedGraph::empty(), &counters).expect_err("empty graph");
    assert!(matches!(err, GraphError::EmptyHandle { .. }));
    assert_eq!(counters.allocated(), 0);

    let mut exec = instantiate_graph(create_graph(&driver)?, &counters)?;
    let mut empty = exec.take();
    let live = empty.take();
    assert!(exec.is_empty() && empty.is_empty());
    let err = exec.update(create_graph(&driver)?).expect_err("empty exec");
    assert!(matches!(err, GraphError::EmptyHandle { .. }));
    assert_eq!(reference.live_graphs(), 0);

    drop(exec);
    drop(empty);
    assert_eq!(counters.alive(), 1);
    drop(live);
    assert_eq!(counters.alive(), 0);
    Ok(())
}

#[test]
fn failed_update_still_destroys_the_graph() -> Result<()> {
    let (reference, driver) = reference();
    let counters = GraphExecCounters::shared();
    let mut exec = instantiate_graph(create_graph(&driver)?, &counters)?;

    reference.fail_next(DriverOp::ExecUpdate);
    let err = exec.update(create_graph(&driver)?).expect_err("injected failure");

    assert!(err.is_internal(), "{err}");
    assert_eq!(
        err.to_string(),
        "internal: failed to update gpu graph: ref_graph_exec_update failed: injected failure"
    );
    assert_eq!(reference.live_graphs(), 0);
    assert_eq!(exec.update_count(), 1);
    Ok(())
}

#[test]
fn rejected_update_names_the_result() -> Result<()> {
    let (reference, driver) = reference();
    let counters = GraphExecCounters::shared();
    let kernel = noop_kernel(&reference);
    let args = KernelArgs::new();

    let mut exec = instantiate_graph(create_graph(&driver)?, &counters)?;
    let grown = create_graph(&driver)?;
    add_kernel_node(&grown, &[], ThreadDim::linear(1), BlockDim::linear(1), &kernel, &args)?;

    let err = exec.update(grown).expect_err("topology changed");
    assert!(err.is_internal());
    assert_eq!(
        err.to_string(),
        "internal: failed to update gpu graph: update result: topology changed"
    );
    assert_eq!(reference.live_graphs(), 0);
    Ok(())
}

#[test]
fn failed_capture_destroys_the_captured_graph() -> Result<()> {
    let (reference, driver) = reference();
    let stream = reference.create_stream();
    let kernel = noop_kernel(&reference);
    let args = KernelArgs::new();

    let err = capture_graph_with_options(&driver, &stream, &GraphDebugOptions::default(), || {
        reference.launch_kernel(&stream, &kernel, ThreadDim::linear(1), BlockDim::linear(1), &args)?;
        Err(GraphError::internal("not ready"))
    })
    .expect_err("body failed");

    assert_eq!(
        err.to_string(),
        "internal: failed to capture gpu graph: internal: not ready"
    );
    assert_eq!(reference.live_graphs(), 0);
    Ok(())
}

#[test]
fn panicking_capture_body_still_ends_capture() -> Result<()> {
    let (reference, driver) = reference();
    let stream = reference.create_stream();
    let kernel = noop_kernel(&reference);
    let args = KernelArgs::new();

    let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
        let options = GraphDebugOptions::default();
        capture_graph_with_options(&driver, &stream, &options, || -> Result<(), GraphError> {
            reference.launch_kernel(&stream, &kernel, ThreadDim::linear(1), BlockDim::linear(1), &args)?;
            panic!("capture body panicked")
        })
    }));

    assert!(unwound.is_err());
    assert!(!is_stream_capturing(driver.as_ref(), &stream)?);
    assert_eq!(reference.live_graphs(), 0);
    let graph = capture_graph_with_options(&driver, &stream, &GraphDebugOptions::default(), || {
        Ok::<(), GraphError>(())
    })?;
    assert!(!graph.is_empty());
    Ok(())
}

#[test]
#[should_panic(expected = "failed to destroy executable gpu graph #0")]
fn exec_destroy_failure_is_fatal() {
    let (reference, driver) = reference();
    let counters = GraphExecCounters::shared();
    let exec = instantiate_graph(create_graph(&driver).unwrap(), &counters).unwrap();

    reference.fail_next(DriverOp::DestroyGraphExec);
    drop(exec);
}

#[test]
#[should_panic(expected = "failed to destroy gpu graph")]
fn graph_destroy_failure_is_fatal() {
    let (reference, driver) = reference();
    let graph = create_graph(&driver).unwrap();

    reference.fail_next(DriverOp::DestroyGraph);
    drop(graph);
}

#[test]
fn capture_dumps_dot_into_configured_directory() -> Result<()> {
    let (reference, driver) = reference();
    let stream = reference.create_stream();
    let kernel = noop_kernel(&reference);
    let args = KernelArgs::new();
    let dir = tempfile::tempdir()?;
    let options = GraphDebugOptions::default().with_dot_directory(dir.path());

    for _ in 0..2 {
        capture_graph_with_options(&driver, &stream, &options, || {
            reference.launch_kernel(&stream, &kernel, ThreadDim::linear(1), BlockDim::linear(1), &args)
        })?;
    }

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir.path())? {
        let path = entry?.path();
        let contents = std::fs::read_to_string(&path)?;
        assert!(contents.contains("kernel noop"), "{contents}");
        names.push(path.file_name().unwrap().to_string_lossy().into_owned());
    }
    assert_eq!(names.len(), 2);
    for name in &names {
        assert!(name.starts_with("gpu-graph-") && name.ends_with(".dot"), "{name}");
    }
    Ok(())
}

#[test]
fn dot_dump_failures_do_not_fail_the_capture() -> Result<()> {
    let (reference, driver) = reference();
    let stream = reference.create_stream();
    let dir = tempfile::tempdir()?;

    reference.fail_next(DriverOp::DebugDotPrint);
    let options = GraphDebugOptions::default().with_dot_directory(dir.path());
    let graph = capture_graph_with_options(&driver, &stream, &options, || Ok::<(), GraphError>(()))?;
    assert!(!graph.is_empty());
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0, "failed dump left a file behind");

    let missing = GraphDebugOptions::default().with_dot_directory(dir.path().join("missing"));
    let graph = capture_graph_with_options(&driver, &stream, &missing, || Ok::<(), GraphError>(()))?;
    assert!(!graph.is_empty());
    Ok(())
}

#[test]
fn concurrent_instantiation_hands_out_unique_ids() -> Result<()> {
    let (_reference, driver) = reference();
    let counters = GraphExecCounters::shared();

    let ids: Vec<usize> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| -> Result<Vec<usize>> {
                    let mut ids = Vec::new();
                    for _ in 0..25 {
                        let exec = instantiate_graph(create_graph(&driver)?, &counters)?;
                        ids.extend(exec.id());
                    }
                    Ok(ids)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("worker panicked"))
            .collect::<Result<Vec<_>>>()
    })?
    .into_iter()
    .flatten()
    .collect();

    let unique: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(unique.len(), 100);
    assert_eq!(counters.allocated(), 100);
    assert_eq!(counters.alive(), 0);
    Ok(())
}

#[test]
fn counter_snapshot_serializes() -> Result<()> {
    let (_reference, driver) = reference();
    let counters = GraphExecCounters::shared();
    let kept = instantiate_graph(create_graph(&driver)?, &counters)?;
    drop(instantiate_graph(create_graph(&driver)?, &counters)?);

    let value = serde_json::to_value(counters.snapshot())?;
    assert_eq!(value, json!({ "allocated": 2, "alive": 1 }));
    assert_eq!(kept.id(), Some(0));
    Ok(())
}
