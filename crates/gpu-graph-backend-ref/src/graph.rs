use std::collections::HashMap;
use std::fmt::Write as _;

use gpu_graph::{
    BlockDim, DevicePtr, FunctionHandle, GraphError, GraphExecUpdateResult,
    GraphExecUpdateResultInfo, GraphHandle, GraphNodeHandle, GraphNodeKind, GraphResult,
    KernelNodeParams, ThreadDim,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RefOp {
    Kernel {
        name: String,
        function: FunctionHandle,
        blocks: BlockDim,
        threads: ThreadDim,
        shared_memory_bytes: u32,
        args: Vec<Vec<u8>>,
    },
    MemcpyD2D {
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
    },
}

impl RefOp {
    pub(crate) fn kernel(params: &KernelNodeParams<'_>) -> Self {
        let args = (0..params.args.len())
            .filter_map(|index| params.args.argument_bytes(index))
            .collect();
        RefOp::Kernel {
            name: params.name.to_string(),
            function: params.function,
            blocks: params.blocks,
            threads: params.threads,
            shared_memory_bytes: params.args.shared_memory_bytes(),
            args,
        }
    }

    pub(crate) fn kind(&self) -> GraphNodeKind {
        match self {
            RefOp::Kernel { .. } => GraphNodeKind::Kernel,
            RefOp::MemcpyD2D { .. } => GraphNodeKind::MemcpyDeviceToDevice,
        }
    }

    fn dot_label(&self) -> String {
        match self {
            RefOp::Kernel {
                name,
                blocks,
                threads,
                shared_memory_bytes,
                ..
            } => format!(
                "kernel {name}\\nblocks=({},{},{}) threads=({},{},{}) smem={shared_memory_bytes}",
                blocks.x, blocks.y, blocks.z, threads.x, threads.y, threads.z
            ),
            RefOp::MemcpyD2D { dst, src, bytes } => {
                format!("memcpy d2d\\n{src} -> {dst} ({bytes} bytes)")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RefNode {
    pub(crate) handle: GraphNodeHandle,
    pub(crate) deps: Vec<GraphNodeHandle>,
    pub(crate) op: RefOp,
}

/// Nodes in insertion order. Dependencies always point at earlier nodes, so
/// insertion order is a valid execution order.
#[derive(Debug, Clone, Default)]
pub(crate) struct RefGraph {
    pub(crate) nodes: Vec<RefNode>,
}

impl RefGraph {
    pub(crate) fn contains(&self, node: GraphNodeHandle) -> bool {
        self.nodes.iter().any(|existing| existing.handle == node)
    }

    pub(crate) fn push(
        &mut self,
        handle: GraphNodeHandle,
        deps: &[GraphNodeHandle],
        op: RefOp,
    ) -> GraphResult<()> {
        if let Some(missing) = deps.iter().find(|dep| !self.contains(**dep)) {
            return Err(GraphError::driver(
                "graph add node",
                format!("dependency {missing} is not a node of this graph"),
            ));
        }
        self.nodes.push(RefNode {
            handle,
            deps: deps.to_vec(),
            op,
        });
        Ok(())
    }

    fn positions(&self) -> HashMap<GraphNodeHandle, usize> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.handle, idx))
            .collect()
    }

    fn dep_positions(node: &RefNode, positions: &HashMap<GraphNodeHandle, usize>) -> Vec<usize> {
        let mut deps: Vec<usize> = node
            .deps
            .iter()
            .filter_map(|dep| positions.get(dep).copied())
            .collect();
        deps.sort_unstable();
        deps
    }

    /// Checks whether an executable built from `self` can take the
    /// parameters of `new` in place.
    pub(crate) fn update_compatibility(&self, new: &RefGraph) -> GraphExecUpdateResultInfo {
        if self.nodes.len() != new.nodes.len() {
            return GraphExecUpdateResultInfo::new(GraphExecUpdateResult::TopologyChanged);
        }
        let old_positions = self.positions();
        let new_positions = new.positions();
        for (old, updated) in self.nodes.iter().zip(&new.nodes) {
            let rejected = |result| GraphExecUpdateResultInfo {
                result,
                error_node: Some(updated.handle),
                error_from_node: Some(old.handle),
            };
            if old.op.kind() != updated.op.kind() {
                return rejected(GraphExecUpdateResult::NodeTypeChanged);
            }
            if Self::dep_positions(old, &old_positions)
                != Self::dep_positions(updated, &new_positions)
            {
                return rejected(GraphExecUpdateResult::TopologyChanged);
            }
            if let (
                RefOp::Kernel { function: before, .. },
                RefOp::Kernel { function: after, .. },
            ) = (&old.op, &updated.op)
            {
                if before != after {
                    return rejected(GraphExecUpdateResult::FunctionChanged);
                }
            }
        }
        GraphExecUpdateResultInfo::success()
    }

    /// Takes the node parameters of a compatible graph, keeping node handles.
    pub(crate) fn apply_parameters(&mut self, new: &RefGraph) {
        for (node, updated) in self.nodes.iter_mut().zip(&new.nodes) {
            node.op = updated.op.clone();
        }
    }

    pub(crate) fn render_dot(&self, handle: GraphHandle) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph gpu_graph_{:x} {{", handle.as_raw());
        let positions = self.positions();
        for (idx, node) in self.nodes.iter().enumerate() {
            let _ = writeln!(out, "  n{idx} [label=\"{}\"];", node.op.dot_label());
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            for dep in Self::dep_positions(node, &positions) {
                let _ = writeln!(out, "  n{dep} -> n{idx};");
            }
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy(bytes: usize) -> RefOp {
        RefOp::MemcpyD2D {
            dst: DevicePtr::from_raw(0x200),
            src: DevicePtr::from_raw(0x100),
            bytes,
        }
    }

    fn kernel(function: usize) -> RefOp {
        RefOp::Kernel {
            name: "k".to_string(),
            function: FunctionHandle::from_raw(function),
            blocks: BlockDim::linear(1),
            threads: ThreadDim::linear(32),
            shared_memory_bytes: 0,
            args: vec![],
        }
    }

    fn node(id: usize) -> GraphNodeHandle {
        GraphNodeHandle::from_raw(id)
    }

    fn chain(ops: Vec<RefOp>, first_id: usize) -> RefGraph {
        let mut graph = RefGraph::default();
        let mut prev: Option<GraphNodeHandle> = None;
        for (offset, op) in ops.into_iter().enumerate() {
            let handle = node(first_id + offset);
            let deps: Vec<_> = prev.into_iter().collect();
            graph.push(handle, &deps, op).unwrap();
            prev = Some(handle);
        }
        graph
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut graph = RefGraph::default();
        let err = graph.push(node(1), &[node(9)], copy(4)).unwrap_err();
        assert!(err.to_string().contains("dependency 0x9"));
    }

    #[test]
    fn parameter_only_changes_are_compatible() {
        let mut old = chain(vec![kernel(1), copy(4)], 10);
        let new = chain(vec![kernel(1), copy(8)], 20);
        assert!(old.update_compatibility(&new).is_success());
        old.apply_parameters(&new);
        assert_eq!(old.nodes[1].op, copy(8));
        assert_eq!(old.nodes[1].handle, node(11));
    }

    #[test]
    fn structural_changes_are_classified() {
        let old = chain(vec![kernel(1), copy(4)], 10);

        let longer = chain(vec![kernel(1), copy(4), copy(4)], 20);
        assert_eq!(
            old.update_compatibility(&longer).result,
            GraphExecUpdateResult::TopologyChanged
        );

        let swapped = chain(vec![copy(4), kernel(1)], 20);
        let info = old.update_compatibility(&swapped);
        assert_eq!(info.result, GraphExecUpdateResult::NodeTypeChanged);
        assert_eq!(info.error_node, Some(node(20)));
        assert_eq!(info.error_from_node, Some(node(10)));

        let other_function = chain(vec![kernel(2), copy(4)], 20);
        assert_eq!(
            old.update_compatibility(&other_function).result,
            GraphExecUpdateResult::FunctionChanged
        );

        let mut unchained = RefGraph::default();
        unchained.push(node(20), &[], kernel(1)).unwrap();
        unchained.push(node(21), &[], copy(4)).unwrap();
        assert_eq!(
            old.update_compatibility(&unchained).result,
            GraphExecUpdateResult::TopologyChanged
        );
    }

    #[test]
    fn dot_output_lists_nodes_and_edges() {
        let graph = chain(vec![kernel(1), copy(4)], 10);
        let dot = graph.render_dot(GraphHandle::from_raw(0xab));
        assert!(dot.starts_with("digraph gpu_graph_ab {"));
        assert!(dot.contains("n0 [label=\"kernel k"));
        assert!(dot.contains("n1 [label=\"memcpy d2d"));
        assert!(dot.contains("n0 -> n1;"));
    }
}
