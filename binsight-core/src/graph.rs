//! Graph Substrate
//!
//! This module provides the directed multigraph used by every analysis of the
//! core: the CFG and CG of a file as well as data-dependency graphs are all
//! instances of [`Graph`]. Self-loops and parallel edges are permitted.
//!
//! # Memory Layout
//! - Nodes and edges live in `Vec` arenas addressed by `NodeId` / `EdgeId`
//!   (`u32` handles, 4 bytes instead of pointers)
//! - Each node keeps its incoming and outgoing edge lists in insertion order
//! - Removed edges stay in the arena as detached tombstones so handles in
//!   side tables never dangle
//!
//! # Connected-Component Index
//! The graph maintains a node → CC and edge → CC index together with the set
//! of entry nodes of each CC. `add_node` creates a singleton CC whose only
//! entry is the new node; `add_edge` merges the two components, the surviving
//! CC inheriting nodes, edges and both entry sets. Pruning an entry (for a
//! distance-0 dependency landing on a node) is the caller's call through
//! [`Graph::remove_cc_entry`]. Edge removal marks the index dirty and every
//! public reader rebuilds it first; a rebuilt entry set contains the nodes
//! without incoming live edges.
//!
//! # Traversals
//! DFS and backward DFS take a caller-supplied mark set so several interleaved
//! traversals can share a graph. Path enumeration returns maximal simple
//! paths (a path ends when every successor is already on it) and is capped;
//! cycle enumeration yields each elementary cycle exactly once by rooting it
//! at its smallest node.

use std::collections::HashSet;

/// Handle on a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Handle on a graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);

/// Handle on a connected component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CcId(pub u32);

/// Graph node: payload plus adjacency lists in insertion order.
#[derive(Debug, Clone)]
pub struct GraphNode<N> {
    pub data: N,
    pub incoming: Vec<EdgeId>,
    pub outgoing: Vec<EdgeId>,
}

/// Graph edge: payload plus both endpoints.
#[derive(Debug, Clone)]
pub struct GraphEdge<E> {
    pub data: E,
    pub from: NodeId,
    pub to: NodeId,
    detached: bool,
}

impl<E> GraphEdge<E> {
    /// True once the edge has been removed from its endpoint lists.
    pub fn is_detached(&self) -> bool {
        self.detached
    }
}

/// Weakly connected component view.
#[derive(Debug, Clone, Default)]
pub struct ConnectedComponent {
    pub nodes: Vec<NodeId>,
    pub edges: Vec<EdgeId>,
    pub entry_nodes: Vec<NodeId>,
    merged: bool,
}

/// Directed multigraph with a maintained connected-component index.
#[derive(Debug, Clone, Default)]
pub struct Graph<N, E> {
    nodes: Vec<GraphNode<N>>,
    edges: Vec<GraphEdge<E>>,
    node_cc: Vec<CcId>,
    edge_cc: Vec<CcId>,
    ccs: Vec<ConnectedComponent>,
    cc_dirty: bool,
}

impl<N, E> Graph<N, E> {
    pub fn new() -> Self {
        Graph {
            nodes: Vec::new(),
            edges: Vec::new(),
            node_cc: Vec::new(),
            edge_cc: Vec::new(),
            ccs: Vec::new(),
            cc_dirty: false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &GraphNode<N> {
        &self.nodes[id.0 as usize]
    }

    pub fn edge(&self, id: EdgeId) -> &GraphEdge<E> {
        &self.edges[id.0 as usize]
    }

    pub fn edge_data_mut(&mut self, id: EdgeId) -> &mut E {
        &mut self.edges[id.0 as usize].data
    }

    /// Live (non-detached) edge handles.
    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.detached)
            .map(|(i, _)| EdgeId(i as u32))
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// Adds a node. O(1). The node forms a new singleton component and is an
    /// entry of it.
    pub fn add_node(&mut self, data: N) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(GraphNode {
            data,
            incoming: Vec::new(),
            outgoing: Vec::new(),
        });
        let cc = CcId(self.ccs.len() as u32);
        self.ccs.push(ConnectedComponent {
            nodes: vec![id],
            edges: Vec::new(),
            entry_nodes: vec![id],
            merged: false,
        });
        self.node_cc.push(cc);
        id
    }

    /// Adds an edge. O(1) amortized. Parallel edges and self-loops are
    /// allowed. Merges the endpoint components when they differ.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, data: E) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(GraphEdge {
            data,
            from,
            to,
            detached: false,
        });
        self.nodes[from.0 as usize].outgoing.push(id);
        self.nodes[to.0 as usize].incoming.push(id);

        let cc_from = self.cc_root(self.node_cc[from.0 as usize]);
        let cc_to = self.cc_root(self.node_cc[to.0 as usize]);
        let survivor = if cc_from != cc_to {
            self.merge_ccs(cc_from, cc_to)
        } else {
            cc_from
        };
        self.ccs[survivor.0 as usize].edges.push(id);
        self.edge_cc.push(survivor);
        id
    }

    /// Adds an edge only if no live edge `from → to` already exists.
    /// Returns `Some` when an edge was actually created.
    pub fn add_unique_edge(&mut self, from: NodeId, to: NodeId, data: E) -> Option<EdgeId> {
        let exists = self.nodes[from.0 as usize]
            .outgoing
            .iter()
            .any(|&e| !self.edges[e.0 as usize].detached && self.edges[e.0 as usize].to == to);
        if exists {
            None
        } else {
            Some(self.add_edge(from, to, data))
        }
    }

    /// Detaches an edge from both endpoint lists. The payload stays in the
    /// arena; the CC index is rebuilt lazily on the next read.
    pub fn remove_edge(&mut self, id: EdgeId) {
        let (from, to) = {
            let e = &self.edges[id.0 as usize];
            if e.detached {
                return;
            }
            (e.from, e.to)
        };
        self.nodes[from.0 as usize].outgoing.retain(|&e| e != id);
        self.nodes[to.0 as usize].incoming.retain(|&e| e != id);
        self.edges[id.0 as usize].detached = true;
        self.cc_dirty = true;
    }

    pub fn successors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id.0 as usize]
            .outgoing
            .iter()
            .map(|&e| self.edges[e.0 as usize].to)
    }

    pub fn predecessors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id.0 as usize]
            .incoming
            .iter()
            .map(|&e| self.edges[e.0 as usize].from)
    }

    pub fn out_edges(&self, id: NodeId) -> &[EdgeId] {
        &self.nodes[id.0 as usize].outgoing
    }

    pub fn in_edges(&self, id: NodeId) -> &[EdgeId] {
        &self.nodes[id.0 as usize].incoming
    }

    // -------------------------------------------------------------------
    // Connected-component index

    fn cc_root(&self, mut cc: CcId) -> CcId {
        // Merged components are emptied and point at their survivor through
        // node_cc of their former nodes; the merged flag alone is enough
        // because merge rewrites node_cc eagerly.
        while self.ccs[cc.0 as usize].merged {
            // A merged CC keeps a single forwarding node in `nodes`.
            let fwd = self.ccs[cc.0 as usize].nodes[0];
            cc = self.node_cc[fwd.0 as usize];
        }
        cc
    }

    fn merge_ccs(&mut self, a: CcId, b: CcId) -> CcId {
        // Keep the larger side to bound rewriting work.
        let (keep, gone) =
            if self.ccs[a.0 as usize].nodes.len() >= self.ccs[b.0 as usize].nodes.len() {
                (a, b)
            } else {
                (b, a)
            };
        let mut moved = std::mem::take(&mut self.ccs[gone.0 as usize]);
        for &n in &moved.nodes {
            self.node_cc[n.0 as usize] = keep;
        }
        for &e in &moved.edges {
            self.edge_cc[e.0 as usize] = keep;
        }
        let kept = &mut self.ccs[keep.0 as usize];
        kept.nodes.append(&mut moved.nodes);
        kept.edges.append(&mut moved.edges);
        kept.entry_nodes.append(&mut moved.entry_nodes);
        // Leave a forwarding stub behind.
        let fwd = kept.nodes[0];
        self.ccs[gone.0 as usize] = ConnectedComponent {
            nodes: vec![fwd],
            edges: Vec::new(),
            entry_nodes: Vec::new(),
            merged: true,
        };
        keep
    }

    /// Removes a node from the entry set of its component.
    pub fn remove_cc_entry(&mut self, node: NodeId) {
        let cc = self.cc_root(self.node_cc[node.0 as usize]);
        self.ccs[cc.0 as usize].entry_nodes.retain(|&n| n != node);
    }

    /// Rebuilds the CC index after edge removals. Entries become the nodes
    /// with no incoming live edge.
    fn rebuild_ccs(&mut self) {
        self.ccs.clear();
        self.node_cc.clear();
        self.node_cc.resize(self.nodes.len(), CcId(u32::MAX));
        let mut visited: HashSet<NodeId> = HashSet::new();
        for start in 0..self.nodes.len() {
            let start = NodeId(start as u32);
            if visited.contains(&start) {
                continue;
            }
            let cc = CcId(self.ccs.len() as u32);
            let mut comp = ConnectedComponent::default();
            let mut stack = vec![start];
            visited.insert(start);
            while let Some(n) = stack.pop() {
                self.node_cc[n.0 as usize] = cc;
                comp.nodes.push(n);
                if self.nodes[n.0 as usize].incoming.is_empty() {
                    comp.entry_nodes.push(n);
                }
                let mut neighbours: Vec<NodeId> = Vec::new();
                neighbours.extend(self.successors(n));
                neighbours.extend(self.predecessors(n));
                for m in neighbours {
                    if visited.insert(m) {
                        stack.push(m);
                    }
                }
            }
            self.ccs.push(comp);
        }
        for e in 0..self.edges.len() {
            if self.edges[e].detached {
                continue;
            }
            let cc = self.node_cc[self.edges[e].from.0 as usize];
            self.edge_cc[e] = cc;
            self.ccs[cc.0 as usize].edges.push(EdgeId(e as u32));
        }
        self.cc_dirty = false;
    }

    fn ensure_ccs(&mut self) {
        if self.cc_dirty {
            self.rebuild_ccs();
        }
    }

    /// Live connected components, index consistent with the current edges.
    pub fn connected_components(&mut self) -> Vec<&ConnectedComponent> {
        self.ensure_ccs();
        self.ccs.iter().filter(|cc| !cc.merged).collect()
    }

    pub fn component_of(&mut self, node: NodeId) -> &ConnectedComponent {
        self.ensure_ccs();
        let cc = self.cc_root(self.node_cc[node.0 as usize]);
        &self.ccs[cc.0 as usize]
    }

    // -------------------------------------------------------------------
    // Traversals

    /// Forward DFS from `root`. Each node is visited at most once according
    /// to the caller-supplied mark set, so interleaved traversals can share
    /// marks or keep them separate.
    pub fn dfs<Pre, Post>(
        &self,
        root: NodeId,
        marks: &mut HashSet<NodeId>,
        pre: &mut Pre,
        post: &mut Post,
    ) where
        Pre: FnMut(NodeId),
        Post: FnMut(NodeId),
    {
        if !marks.insert(root) {
            return;
        }
        pre(root);
        let succs: Vec<NodeId> = self.successors(root).collect();
        for s in succs {
            self.dfs(s, marks, pre, post);
        }
        post(root);
    }

    /// Backward DFS from `root` (follows predecessors).
    pub fn back_dfs<Pre, Post>(
        &self,
        root: NodeId,
        marks: &mut HashSet<NodeId>,
        pre: &mut Pre,
        post: &mut Post,
    ) where
        Pre: FnMut(NodeId),
        Post: FnMut(NodeId),
    {
        if !marks.insert(root) {
            return;
        }
        pre(root);
        let preds: Vec<NodeId> = self.predecessors(root).collect();
        for p in preds {
            self.back_dfs(p, marks, pre, post);
        }
        post(root);
    }

    /// Enumerates the maximal simple paths starting at `root`, calling
    /// `callback` once per path. Stops after `max` paths and reports whether
    /// the enumeration ran to completion.
    pub fn enumerate_paths<F>(&self, root: NodeId, max: usize, callback: &mut F) -> bool
    where
        F: FnMut(&[NodeId]),
    {
        let mut path: Vec<NodeId> = Vec::new();
        let mut on_path: HashSet<NodeId> = HashSet::new();
        let mut emitted = 0usize;
        self.paths_rec(root, max, &mut path, &mut on_path, &mut emitted, callback)
    }

    fn paths_rec<F>(
        &self,
        node: NodeId,
        max: usize,
        path: &mut Vec<NodeId>,
        on_path: &mut HashSet<NodeId>,
        emitted: &mut usize,
        callback: &mut F,
    ) -> bool
    where
        F: FnMut(&[NodeId]),
    {
        path.push(node);
        on_path.insert(node);
        let nexts: Vec<NodeId> = self
            .successors(node)
            .filter(|s| !on_path.contains(s))
            .collect();
        let mut complete = true;
        if nexts.is_empty() {
            if *emitted >= max {
                complete = false;
            } else {
                *emitted += 1;
                callback(path);
            }
        } else {
            for s in nexts {
                if !self.paths_rec(s, max, path, on_path, emitted, callback) {
                    complete = false;
                    break;
                }
            }
        }
        on_path.remove(&node);
        path.pop();
        complete
    }

    /// Counts the maximal simple paths starting at `root` without storing
    /// them. Counting stops at `max`, so a result equal to `max` means
    /// "`max` or more".
    pub fn count_paths(&self, root: NodeId, max: usize) -> usize {
        let mut count = 0usize;
        let mut cb = |_: &[NodeId]| count += 1;
        self.enumerate_paths(root, max, &mut cb);
        count
    }

    /// Enumerates elementary cycles, each exactly once. Only edges accepted
    /// by `edge_filter` are followed. Returns `false` if the `max` cap was
    /// hit.
    pub fn enumerate_cycles<Filt, F>(&self, max: usize, edge_filter: &Filt, callback: &mut F) -> bool
    where
        Filt: Fn(&GraphEdge<E>) -> bool,
        F: FnMut(&[EdgeId]),
    {
        let mut emitted = 0usize;
        for start in self.node_ids() {
            let mut stack: Vec<EdgeId> = Vec::new();
            let mut on_path: HashSet<NodeId> = HashSet::new();
            if !self.cycles_rec(
                start,
                start,
                max,
                edge_filter,
                &mut stack,
                &mut on_path,
                &mut emitted,
                callback,
            ) {
                return false;
            }
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn cycles_rec<Filt, F>(
        &self,
        start: NodeId,
        node: NodeId,
        max: usize,
        edge_filter: &Filt,
        stack: &mut Vec<EdgeId>,
        on_path: &mut HashSet<NodeId>,
        emitted: &mut usize,
        callback: &mut F,
    ) -> bool
    where
        Filt: Fn(&GraphEdge<E>) -> bool,
        F: FnMut(&[EdgeId]),
    {
        on_path.insert(node);
        for &e in &self.nodes[node.0 as usize].outgoing {
            let edge = &self.edges[e.0 as usize];
            if edge.detached || !edge_filter(edge) {
                continue;
            }
            let to = edge.to;
            if to == start {
                if *emitted >= max {
                    on_path.remove(&node);
                    return false;
                }
                stack.push(e);
                *emitted += 1;
                callback(stack);
                stack.pop();
            } else if to > start && !on_path.contains(&to) {
                // Rooting each cycle at its smallest node keeps every
                // elementary cycle unique across start nodes.
                stack.push(e);
                let ok = self.cycles_rec(
                    start, to, max, edge_filter, stack, on_path, emitted, callback,
                );
                stack.pop();
                if !ok {
                    on_path.remove(&node);
                    return false;
                }
            }
        }
        on_path.remove(&node);
        true
    }
}
