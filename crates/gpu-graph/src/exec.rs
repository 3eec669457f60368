//! Instantiation and capture-state queries.

use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::counters::GraphExecCounters;
use crate::driver::{GraphDriver, GraphInstantiateFlags, StreamCaptureStatus};
use crate::error::GraphResult;
use crate::graph::{OwnedGraph, OwnedGraphExec};
use crate::stream::GraphStream;

/// Instantiates `graph` with default flags.
pub fn instantiate_graph(
    graph: OwnedGraph,
    counters: &Arc<GraphExecCounters>,
) -> GraphResult<OwnedGraphExec> {
    instantiate_graph_with_flags(graph, counters, GraphInstantiateFlags::default())
}

/// Instantiates `graph`, consuming it, and assigns the executable a fresh id
/// from `counters`.
///
/// Instantiation is far more expensive than a launch; prefer
/// [`OwnedGraphExec::update`] when the topology is unchanged.
pub fn instantiate_graph_with_flags(
    graph: OwnedGraph,
    counters: &Arc<GraphExecCounters>,
    flags: GraphInstantiateFlags,
) -> GraphResult<OwnedGraphExec> {
    let (driver, handle) = graph.live_parts()?;

    let start = Instant::now();
    let exec = driver.instantiate(handle, flags)?;
    let elapsed_us = start.elapsed().as_micros() as u64;

    let id = counters.notify_created();
    trace!(
        id,
        exec = %exec,
        elapsed_us,
        alive = counters.alive(),
        "instantiated gpu graph exec"
    );
    Ok(OwnedGraphExec::new(
        Arc::clone(driver),
        Arc::clone(counters),
        id,
        exec,
    ))
}

/// Returns `true` while `stream` has an active capture. An invalidated
/// capture reports `false`.
pub fn is_stream_capturing(
    driver: &dyn GraphDriver,
    stream: &dyn GraphStream,
) -> GraphResult<bool> {
    let status = driver.capture_status(stream.native_handle())?;
    Ok(status == StreamCaptureStatus::Active)
}
