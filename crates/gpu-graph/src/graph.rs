//! Exclusively owned graph and executable-graph handles.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::counters::GraphExecCounters;
use crate::driver::{GraphDriver, GraphExecHandle, GraphHandle};
use crate::error::{GraphError, GraphResult};
use crate::stream::GraphStream;

/// Captured graph owned by exactly one value.
///
/// Dropping a non-empty `OwnedGraph` destroys the device graph. A failing
/// destroy means the driver state can no longer be trusted and panics.
pub struct OwnedGraph {
    live: Option<LiveGraph>,
}

struct LiveGraph {
    driver: Arc<dyn GraphDriver>,
    handle: GraphHandle,
}

impl OwnedGraph {
    /// Takes ownership of `handle`, which must have been created by `driver`
    /// and must not be owned elsewhere.
    pub fn from_raw(driver: Arc<dyn GraphDriver>, handle: GraphHandle) -> Self {
        Self {
            live: Some(LiveGraph { driver, handle }),
        }
    }

    /// An owner that holds nothing.
    pub fn empty() -> Self {
        Self { live: None }
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_none()
    }

    pub fn handle(&self) -> Option<GraphHandle> {
        self.live.as_ref().map(|live| live.handle)
    }

    pub fn driver(&self) -> Option<&Arc<dyn GraphDriver>> {
        self.live.as_ref().map(|live| &live.driver)
    }

    /// Moves the graph out, leaving `self` empty.
    pub fn take(&mut self) -> OwnedGraph {
        OwnedGraph {
            live: self.live.take(),
        }
    }

    pub(crate) fn live_parts(&self) -> GraphResult<(&Arc<dyn GraphDriver>, GraphHandle)> {
        self.live
            .as_ref()
            .map(|live| (&live.driver, live.handle))
            .ok_or(GraphError::EmptyHandle { what: "gpu graph" })
    }
}

impl Drop for OwnedGraph {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            if let Err(err) = live.driver.destroy_graph(live.handle) {
                panic!("failed to destroy gpu graph {}: {err}", live.handle);
            }
        }
    }
}

impl fmt::Debug for OwnedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.live {
            Some(live) => f
                .debug_struct("OwnedGraph")
                .field("driver", &live.driver.name())
                .field("handle", &live.handle)
                .finish(),
            None => f.write_str("OwnedGraph(empty)"),
        }
    }
}

/// Instantiated graph owned by exactly one value.
///
/// Carries the id assigned at instantiation and counts launches since the
/// last update and updates since creation. Dropping a non-empty instance
/// decrements the alive counter and destroys the executable; an empty
/// instance (see [`OwnedGraphExec::take`]) does neither.
///
/// `launch` and `update` take `&mut self`, so an update can never overlap a
/// launch call on the same instance. Work already enqueued on a stream is the
/// caller's to order against an update.
pub struct OwnedGraphExec {
    live: Option<LiveGraphExec>,
    launch_count: u64,
    update_count: u64,
}

struct LiveGraphExec {
    driver: Arc<dyn GraphDriver>,
    counters: Arc<GraphExecCounters>,
    handle: GraphExecHandle,
    id: usize,
}

impl OwnedGraphExec {
    pub(crate) fn new(
        driver: Arc<dyn GraphDriver>,
        counters: Arc<GraphExecCounters>,
        id: usize,
        handle: GraphExecHandle,
    ) -> Self {
        Self {
            live: Some(LiveGraphExec {
                driver,
                counters,
                handle,
                id,
            }),
            launch_count: 0,
            update_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_none()
    }

    pub fn id(&self) -> Option<usize> {
        self.live.as_ref().map(|live| live.id)
    }

    pub fn handle(&self) -> Option<GraphExecHandle> {
        self.live.as_ref().map(|live| live.handle)
    }

    /// Launches since creation or since the last update.
    pub fn launch_count(&self) -> u64 {
        self.launch_count
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// Moves the executable out, leaving `self` empty. Counters travel with
    /// the executable.
    pub fn take(&mut self) -> OwnedGraphExec {
        OwnedGraphExec {
            live: self.live.take(),
            launch_count: std::mem::take(&mut self.launch_count),
            update_count: std::mem::take(&mut self.update_count),
        }
    }

    /// Enqueues the executable on `stream`. Driver failures are returned as-is.
    pub fn launch(&mut self, stream: &dyn GraphStream) -> GraphResult<()> {
        let live = self.live.as_ref().ok_or(GraphError::EmptyHandle {
            what: "gpu graph exec",
        })?;
        self.launch_count += 1;
        debug!(
            exec = %live.handle,
            id = live.id,
            stream = %stream.debug_id(),
            launch = self.launch_count,
            "launch gpu graph"
        );
        live.driver.launch(live.handle, stream.native_handle())
    }

    /// Refreshes the executable in place from `graph`.
    ///
    /// `graph` is destroyed when this returns, whatever the outcome. A rejected
    /// update is reported as [`GraphError::Internal`]; falling back to a fresh
    /// instantiation is up to the caller.
    pub fn update(&mut self, graph: OwnedGraph) -> GraphResult<()> {
        let live = self.live.as_ref().ok_or(GraphError::EmptyHandle {
            what: "gpu graph exec",
        })?;
        let (_, graph_handle) = graph.live_parts()?;

        debug!(
            exec = %live.handle,
            id = live.id,
            launches = self.launch_count,
            update = self.update_count,
            "update gpu graph exec with a new graph"
        );
        self.launch_count = 0;
        self.update_count += 1;

        let start = Instant::now();
        let outcome = live.driver.exec_update(live.handle, graph_handle);
        trace!(
            id = live.id,
            elapsed_us = start.elapsed().as_micros() as u64,
            "updated gpu graph exec"
        );

        match outcome {
            Ok(info) if info.is_success() => Ok(()),
            Ok(info) => Err(GraphError::internal(format!(
                "failed to update gpu graph: {info}"
            ))),
            Err(err) => Err(GraphError::internal(format!(
                "failed to update gpu graph: {err}"
            ))),
        }
    }
}

impl Drop for OwnedGraphExec {
    fn drop(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        let remaining = live.counters.notify_destroyed();
        trace!(id = live.id, remaining, "destroy gpu graph exec");
        if let Err(err) = live.driver.destroy_graph_exec(live.handle) {
            panic!(
                "failed to destroy executable gpu graph #{} ({}): {err}",
                live.id, live.handle
            );
        }
    }
}

impl fmt::Debug for OwnedGraphExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.live {
            Some(live) => f
                .debug_struct("OwnedGraphExec")
                .field("driver", &live.driver.name())
                .field("handle", &live.handle)
                .field("id", &live.id)
                .field("launch_count", &self.launch_count)
                .field("update_count", &self.update_count)
                .finish(),
            None => f.write_str("OwnedGraphExec(empty)"),
        }
    }
}
