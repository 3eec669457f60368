//! Stream capture into graphs.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::driver::{GraphDriver, GraphHandle, StreamCaptureMode};
use crate::env::GraphDebugOptions;
use crate::error::{GraphError, GraphResult};
use crate::graph::OwnedGraph;
use crate::stream::{GraphStream, StreamHandle};

const DOT_FILE_PREFIX: &str = "gpu-graph-";
const DOT_FILE_SUFFIX: &str = ".dot";

/// Records the work `capture` issues on `stream` into a new graph.
///
/// Debug dumps follow [`GraphDebugOptions::from_env`].
pub fn capture_graph<F, E>(
    driver: &Arc<dyn GraphDriver>,
    stream: &dyn GraphStream,
    capture: F,
) -> GraphResult<OwnedGraph>
where
    F: FnOnce() -> Result<(), E>,
    E: Display,
{
    capture_graph_with_options(driver, stream, &GraphDebugOptions::from_env(), capture)
}

/// Records the work `capture` issues on `stream` into a new graph.
///
/// Capture is always ended before a failure of `capture` is reported, so the
/// stream never stays in capture mode. Any graph the driver hands back for a
/// failed capture is destroyed. A panicking `capture` ends the capture while
/// unwinding.
pub fn capture_graph_with_options<F, E>(
    driver: &Arc<dyn GraphDriver>,
    stream: &dyn GraphStream,
    options: &GraphDebugOptions,
    capture: F,
) -> GraphResult<OwnedGraph>
where
    F: FnOnce() -> Result<(), E>,
    E: Display,
{
    debug!(stream = %stream.debug_id(), "capture gpu graph");
    let start = Instant::now();
    let native = stream.native_handle();

    driver.begin_capture(native, StreamCaptureMode::ThreadLocal)?;
    let guard = CaptureGuard {
        driver,
        stream: native,
        active: true,
    };

    let captured = capture();

    // Ending the capture comes before looking at `captured`.
    let handle = match guard.end() {
        Ok(handle) => handle,
        Err(err) => {
            if let Err(body) = &captured {
                warn!(stream = %stream.debug_id(), "gpu graph capture body failed: {body}");
            }
            return Err(err);
        }
    };
    let graph = OwnedGraph::from_raw(Arc::clone(driver), handle);

    if let Err(err) = captured {
        return Err(GraphError::internal(format!(
            "failed to capture gpu graph: {err}"
        )));
    }

    let handle = graph.live_parts()?.1;
    trace!(
        graph = %handle,
        elapsed_us = start.elapsed().as_micros() as u64,
        "captured operations into the gpu graph"
    );

    if let Some(directory) = options.dot_directory() {
        dump_debug_dot(driver.as_ref(), handle, directory);
    }

    Ok(graph)
}

fn dump_debug_dot(driver: &dyn GraphDriver, graph: GraphHandle, directory: &Path) {
    let Some(path) = unique_dot_path(directory) else {
        warn!(
            directory = %directory.display(),
            "cannot create unique filename, won't enable gpu graph debugging"
        );
        return;
    };
    trace!(graph = %graph, path = %path.display(), "print gpu graph debug dot file");
    if let Err(err) = driver.debug_dot_print(graph, &path) {
        warn!(graph = %graph, path = %path.display(), "failed to print gpu graph debug dot file: {err}");
        if let Err(err) = fs::remove_file(&path) {
            warn!(path = %path.display(), "failed to remove gpu graph debug dot file: {err}");
        }
    }
}

/// Ends an active capture if the body unwinds, destroying whatever graph the
/// driver returns.
struct CaptureGuard<'a> {
    driver: &'a Arc<dyn GraphDriver>,
    stream: StreamHandle,
    active: bool,
}

impl CaptureGuard<'_> {
    fn end(mut self) -> GraphResult<GraphHandle> {
        self.active = false;
        self.driver.end_capture(self.stream)
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match self.driver.end_capture(self.stream) {
            Ok(handle) => drop(OwnedGraph::from_raw(Arc::clone(self.driver), handle)),
            Err(err) => warn!(
                stream = %self.stream,
                "failed to end gpu graph capture after panic: {err}"
            ),
        }
    }
}

fn unique_dot_path(directory: &Path) -> Option<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix(DOT_FILE_PREFIX)
        .suffix(DOT_FILE_SUFFIX)
        .tempfile_in(directory)
        .ok()?;
    let (_, path) = file.keep().ok()?;
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_dot_paths_follow_the_naming_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_dot_path(dir.path()).unwrap();
        let second = unique_dot_path(dir.path()).unwrap();
        assert_ne!(first, second);
        for path in [&first, &second] {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with(DOT_FILE_PREFIX), "{name}");
            assert!(name.ends_with(DOT_FILE_SUFFIX), "{name}");
            assert!(path.exists());
        }
    }

    #[test]
    fn missing_directory_yields_no_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(unique_dot_path(&dir.path().join("missing")).is_none());
    }
}
