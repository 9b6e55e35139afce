/**
 * @file zen-distill/src/data/graph.rs
 * @brief Graph structures and sparse propagation operators
 *
 * Node features are stored as a dense `[num_nodes, feature_dim]` matrix and
 * connectivity as a directed edge list. Messages flow along edges from
 * `source` to `target`, so aggregation at a node reads its incoming neighbors.
 *
 * ## Key Data Structures:
 *
 * - **GraphData**: features plus connectivity, validated on construction
 * - **AdjacencyList**: edge list with forward and backward neighbor lookup
 * - **SparseMatrix**: CSR operator used for GCN/SAGE/APPNP/SGC propagation
 *
 * Normalized operators are built once per model and reused every epoch.
 */

use std::collections::{HashSet, VecDeque};

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::errors::{DistillError, Result};

// === TYPE ALIASES FOR CLARITY ===

/// Node feature matrix type: [num_nodes, node_feature_dim]
pub type NodeFeatures = Array2<f32>;

/// Node indices type for adjacency lists
pub type NodeIndex = usize;

// === CORE DATA STRUCTURES ===

/**
 * Complete graph used for transductive node classification.
 *
 * The whole graph is processed in every forward pass; train/val/test
 * membership is expressed through index sets, never by slicing the graph.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphData {
    /// Node feature matrix: [num_nodes, node_feature_dim]
    pub node_features: NodeFeatures,

    /// Directed connectivity
    pub adjacency_list: AdjacencyList,
}

/**
 * Adjacency list with forward and backward neighbor lookup.
 *
 * Neighbor lists keep the insertion order of the edge list so that every
 * operator derived from it is deterministic.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjacencyList {
    /// List of edges as (source, target) pairs
    pub edges: Vec<(NodeIndex, NodeIndex)>,

    /// Forward adjacency: node_id -> outgoing neighbors
    pub forward_adj: Vec<Vec<NodeIndex>>,

    /// Backward adjacency: node_id -> incoming neighbors
    pub backward_adj: Vec<Vec<NodeIndex>>,

    /// Total number of nodes in the graph
    pub num_nodes: usize,
}

/// Compressed sparse row matrix of f32 values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseMatrix {
    pub n_rows: usize,
    pub n_cols: usize,
    pub indptr: Vec<usize>,
    pub indices: Vec<usize>,
    pub values: Vec<f32>,
}

// === IMPLEMENTATION ===

impl GraphData {
    /**
     * Create a new graph with validation.
     *
     * @param node_features Node feature matrix [num_nodes, node_feature_dim]
     * @param edges List of (source, target) pairs defining connectivity
     *
     * # Examples
     *
     * ```rust
     * use ndarray::Array2;
     * use zen_distill::data::GraphData;
     *
     * let features = Array2::<f32>::zeros((3, 4));
     * let graph = GraphData::new(features, vec![(0, 1), (1, 2), (2, 0)]).unwrap();
     *
     * assert_eq!(graph.num_nodes(), 3);
     * assert_eq!(graph.num_edges(), 3);
     * ```
     */
    pub fn new(node_features: NodeFeatures, edges: Vec<(NodeIndex, NodeIndex)>) -> Result<Self> {
        let num_nodes = node_features.nrows();
        if num_nodes == 0 {
            return Err(DistillError::InvalidInput(
                "Graph must contain at least one node".to_string(),
            ));
        }

        for &(source, target) in &edges {
            if source >= num_nodes || target >= num_nodes {
                return Err(DistillError::InvalidInput(format!(
                    "Invalid edge ({}, {}): node indices must be in range [0, {}]",
                    source,
                    target,
                    num_nodes - 1
                )));
            }
        }

        let adjacency_list = AdjacencyList::new(edges, num_nodes);

        Ok(Self {
            node_features,
            adjacency_list,
        })
    }

    /// Get number of nodes in the graph
    pub fn num_nodes(&self) -> usize {
        self.node_features.nrows()
    }

    /// Get number of (directed) edges in the graph
    pub fn num_edges(&self) -> usize {
        self.adjacency_list.edges.len()
    }

    /// Get node feature dimension
    pub fn node_feature_dim(&self) -> usize {
        self.node_features.ncols()
    }

    /// Edge list as (source, target) pairs
    pub fn edges(&self) -> &[(NodeIndex, NodeIndex)] {
        &self.adjacency_list.edges
    }

    /// Get node features for a specific node
    pub fn node_features_for(&self, node_idx: NodeIndex) -> Result<ArrayView1<'_, f32>> {
        if node_idx >= self.num_nodes() {
            return Err(DistillError::InvalidInput(format!(
                "Node index {} out of bounds (max: {})",
                node_idx,
                self.num_nodes() - 1
            )));
        }
        Ok(self.node_features.row(node_idx))
    }

    /// Outgoing neighbors of a node
    pub fn neighbors(&self, node_idx: NodeIndex) -> &[NodeIndex] {
        &self.adjacency_list.forward_adj[node_idx]
    }

    /// Incoming neighbors of a node
    pub fn incoming_neighbors(&self, node_idx: NodeIndex) -> &[NodeIndex] {
        &self.adjacency_list.backward_adj[node_idx]
    }

    /// Number of incoming edges of a node
    pub fn in_degree(&self, node_idx: NodeIndex) -> usize {
        self.incoming_neighbors(node_idx).len()
    }

    /**
     * Undirected, simple version of this graph.
     *
     * Every edge is mirrored, self-loops are dropped and duplicates removed.
     * Edges are sorted so the result does not depend on input order.
     */
    pub fn standardized(&self) -> GraphData {
        let mut edge_set = HashSet::new();
        for &(source, target) in self.edges() {
            if source != target {
                edge_set.insert((source, target));
                edge_set.insert((target, source));
            }
        }
        let mut edges: Vec<_> = edge_set.into_iter().collect();
        edges.sort_unstable();

        GraphData {
            node_features: self.node_features.clone(),
            adjacency_list: AdjacencyList::new(edges, self.num_nodes()),
        }
    }

    /// Weakly connected components, each sorted, ordered by smallest member
    pub fn connected_components(&self) -> Vec<Vec<NodeIndex>> {
        let num_nodes = self.num_nodes();
        let mut visited = vec![false; num_nodes];
        let mut components = Vec::new();

        for start in 0..num_nodes {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut component = vec![start];
            let mut queue = VecDeque::from([start]);

            while let Some(node) = queue.pop_front() {
                let adj = &self.adjacency_list;
                for &next in adj.forward_adj[node].iter().chain(adj.backward_adj[node].iter()) {
                    if !visited[next] {
                        visited[next] = true;
                        component.push(next);
                        queue.push_back(next);
                    }
                }
            }

            component.sort_unstable();
            components.push(component);
        }

        components
    }

    /// Nodes of the largest weakly connected component (first one on ties)
    pub fn largest_component(&self) -> Vec<NodeIndex> {
        self.connected_components()
            .into_iter()
            .fold(Vec::new(), |best, component| {
                if component.len() > best.len() {
                    component
                } else {
                    best
                }
            })
    }

    /// Clone the graph with a subset of nodes, renumbered in the given order
    pub fn subgraph(&self, node_indices: &[NodeIndex]) -> Result<GraphData> {
        let mut node_mapping = vec![None; self.num_nodes()];
        for (new_idx, &old_idx) in node_indices.iter().enumerate() {
            if old_idx >= self.num_nodes() {
                return Err(DistillError::InvalidInput(format!(
                    "Node index {} out of bounds for subgraph extraction",
                    old_idx
                )));
            }
            node_mapping[old_idx] = Some(new_idx);
        }

        let node_features = self.node_features.select(ndarray::Axis(0), node_indices);

        let edges = self
            .edges()
            .iter()
            .filter_map(|&(source, target)| match (node_mapping[source], node_mapping[target]) {
                (Some(s), Some(t)) => Some((s, t)),
                _ => None,
            })
            .collect();

        Self::new(node_features, edges)
    }

    /// Divide every feature row by its L1 norm (rows of zeros stay zero)
    pub fn row_normalize_features(&mut self) {
        for mut row in self.node_features.rows_mut() {
            let sum: f32 = row.iter().map(|v| v.abs()).sum();
            if sum > 0.0 {
                row.mapv_inplace(|v| v / sum);
            }
        }
    }

    // === PROPAGATION OPERATORS ===

    /// Edge list with one self-loop added per node (existing self-loops kept once)
    pub fn edges_with_self_loops(&self) -> Vec<(NodeIndex, NodeIndex)> {
        let mut edges: Vec<_> = self
            .edges()
            .iter()
            .copied()
            .filter(|(source, target)| source != target)
            .collect();
        edges.extend((0..self.num_nodes()).map(|node| (node, node)));
        edges
    }

    /**
     * Symmetrically normalized adjacency with self-loops.
     *
     * `Â[t, s] = 1 / sqrt(out_deg(s) · in_deg(t))` for every edge `s → t` of
     * `A + I`, which reduces to `D^{-1/2} (A + I) D^{-1/2}` on undirected graphs.
     */
    pub fn gcn_normalized(&self) -> SparseMatrix {
        let num_nodes = self.num_nodes();
        let edges = self.edges_with_self_loops();

        let mut out_degree = vec![0.0f32; num_nodes];
        let mut in_degree = vec![0.0f32; num_nodes];
        for &(source, target) in &edges {
            out_degree[source] += 1.0;
            in_degree[target] += 1.0;
        }

        let triplets = edges.iter().map(|&(source, target)| {
            let norm = 1.0 / (out_degree[source] * in_degree[target]).sqrt();
            (target, source, norm)
        });

        SparseMatrix::from_triplets(num_nodes, num_nodes, triplets)
    }

    /// Mean over incoming neighbors; isolated nodes aggregate to zero
    pub fn mean_aggregator(&self) -> SparseMatrix {
        let num_nodes = self.num_nodes();
        let triplets = self.edges().iter().map(|&(source, target)| {
            let degree = self.in_degree(target) as f32;
            (target, source, 1.0 / degree)
        });
        SparseMatrix::from_triplets(num_nodes, num_nodes, triplets)
    }

    /// Mean over incoming neighbors and the node itself (`gcn` SAGE aggregator)
    pub fn gcn_aggregator(&self) -> SparseMatrix {
        let num_nodes = self.num_nodes();
        let edges = self.edges_with_self_loops();

        let mut in_degree = vec![0.0f32; num_nodes];
        for &(_, target) in &edges {
            in_degree[target] += 1.0;
        }

        let triplets = edges
            .iter()
            .map(|&(source, target)| (target, source, 1.0 / in_degree[target]));
        SparseMatrix::from_triplets(num_nodes, num_nodes, triplets)
    }
}

impl AdjacencyList {
    /// Build forward and backward lookup tables from an edge list
    pub fn new(edges: Vec<(NodeIndex, NodeIndex)>, num_nodes: usize) -> Self {
        let mut forward_adj = vec![Vec::new(); num_nodes];
        let mut backward_adj = vec![Vec::new(); num_nodes];

        for &(source, target) in &edges {
            forward_adj[source].push(target);
            backward_adj[target].push(source);
        }

        Self {
            edges,
            forward_adj,
            backward_adj,
            num_nodes,
        }
    }

    /// Get maximum node ID referenced in the adjacency list
    pub fn max_node_id(&self) -> Option<NodeIndex> {
        self.edges
            .iter()
            .flat_map(|(source, target)| [*source, *target])
            .max()
    }

    /// Check if the graph is undirected (every edge has a reverse edge)
    pub fn is_undirected(&self) -> bool {
        self.edges
            .iter()
            .all(|&(source, target)| self.forward_adj[target].contains(&source))
    }
}

impl SparseMatrix {
    /// Build a CSR matrix from (row, col, value) triplets; duplicates are summed
    pub fn from_triplets<I>(n_rows: usize, n_cols: usize, triplets: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize, f32)>,
    {
        let mut rows: Vec<Vec<(usize, f32)>> = vec![Vec::new(); n_rows];
        for (row, col, value) in triplets {
            rows[row].push((col, value));
        }

        let mut indptr = Vec::with_capacity(n_rows + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        indptr.push(0);

        for mut entries in rows {
            entries.sort_by_key(|&(col, _)| col);
            let mut iter = entries.into_iter().peekable();
            while let Some((col, mut value)) = iter.next() {
                while let Some(&(next_col, next_value)) = iter.peek() {
                    if next_col != col {
                        break;
                    }
                    value += next_value;
                    iter.next();
                }
                indices.push(col);
                values.push(value);
            }
            indptr.push(indices.len());
        }

        Self {
            n_rows,
            n_cols,
            indptr,
            indices,
            values,
        }
    }

    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Sparse-dense product `self · dense`
    pub fn spmm(&self, dense: &Array2<f32>) -> Result<Array2<f32>> {
        if dense.nrows() != self.n_cols {
            return Err(DistillError::DimensionMismatch(format!(
                "Sparse operator has {} columns but dense input has {} rows",
                self.n_cols,
                dense.nrows()
            )));
        }

        let mut output = Array2::zeros((self.n_rows, dense.ncols()));
        for row in 0..self.n_rows {
            let mut out_row = output.row_mut(row);
            for entry in self.indptr[row]..self.indptr[row + 1] {
                out_row.scaled_add(self.values[entry], &dense.row(self.indices[entry]));
            }
        }
        Ok(output)
    }

    /// Transposed copy, used for backward passes through propagation
    pub fn transpose(&self) -> SparseMatrix {
        let triplets = (0..self.n_rows).flat_map(|row| {
            (self.indptr[row]..self.indptr[row + 1])
                .map(move |entry| (self.indices[entry], row, self.values[entry]))
        });
        SparseMatrix::from_triplets(self.n_cols, self.n_rows, triplets)
    }

    /// Dense copy, mostly for inspection in tests
    pub fn to_dense(&self) -> Array2<f32> {
        let mut dense = Array2::zeros((self.n_rows, self.n_cols));
        for row in 0..self.n_rows {
            for entry in self.indptr[row]..self.indptr[row + 1] {
                dense[[row, self.indices[entry]]] += self.values[entry];
            }
        }
        dense
    }
}

// === TESTS ===

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn path_graph() -> GraphData {
        let features = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        GraphData::new(features, vec![(0, 1), (1, 0), (1, 2), (2, 1)]).unwrap()
    }

    #[test]
    fn test_graph_data_creation() {
        let graph = path_graph();
        assert_eq!(graph.num_nodes(), 3);
        assert_eq!(graph.num_edges(), 4);
        assert_eq!(graph.node_feature_dim(), 2);
        assert_eq!(graph.neighbors(1), &[0, 2]);
        assert_eq!(graph.incoming_neighbors(1), &[0, 2]);
        assert!(graph.adjacency_list.is_undirected());
        assert_eq!(graph.adjacency_list.max_node_id(), Some(2));
    }

    #[test]
    fn test_error_handling() {
        let result = GraphData::new(Array2::zeros((2, 2)), vec![(0, 3)]);
        assert!(matches!(result, Err(DistillError::InvalidInput(_))));

        let result = GraphData::new(Array2::zeros((0, 2)), vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn test_standardized_graph() {
        let graph = GraphData::new(Array2::zeros((3, 1)), vec![(0, 1), (0, 1), (1, 1), (2, 1)]).unwrap();
        let simple = graph.standardized();
        assert_eq!(simple.edges(), &[(0, 1), (1, 0), (1, 2), (2, 1)]);
        assert!(simple.adjacency_list.is_undirected());
    }

    #[test]
    fn test_gcn_normalization_on_path() {
        let norm = path_graph().gcn_normalized().to_dense();
        // degrees with self-loops: 2, 3, 2
        assert_abs_diff_eq!(norm[[0, 0]], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(norm[[1, 1]], 1.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(norm[[0, 1]], 1.0 / 6.0f32.sqrt(), epsilon = 1e-6);
        assert_abs_diff_eq!(norm[[1, 0]], norm[[0, 1]], epsilon = 1e-6);
        assert_abs_diff_eq!(norm[[0, 2]], 0.0);
    }

    #[test]
    fn test_mean_aggregator_rows_sum_to_one() {
        let mean = path_graph().mean_aggregator().to_dense();
        assert_abs_diff_eq!(mean.row(1).sum(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(mean[[1, 0]], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(mean[[1, 1]], 0.0);
    }

    #[test]
    fn test_spmm_and_transpose() {
        let matrix = SparseMatrix::from_triplets(2, 3, vec![(0, 1, 2.0), (1, 0, 1.0), (1, 2, 3.0), (1, 2, 1.0)]);
        assert_eq!(matrix.nnz(), 3);

        let dense = array![[1.0f32], [2.0], [3.0]];
        let product = matrix.spmm(&dense).unwrap();
        assert_abs_diff_eq!(product[[0, 0]], 4.0);
        assert_abs_diff_eq!(product[[1, 0]], 13.0);

        let transposed = matrix.transpose().to_dense();
        assert_eq!(transposed, matrix.to_dense().t().to_owned());

        assert!(matrix.spmm(&array![[1.0f32]]).is_err());
    }

    #[test]
    fn test_components_and_subgraph() {
        let graph = GraphData::new(
            Array2::from_shape_fn((5, 1), |(i, _)| i as f32),
            vec![(0, 1), (2, 3), (3, 4)],
        )
        .unwrap();

        assert_eq!(graph.connected_components(), vec![vec![0, 1], vec![2, 3, 4]]);
        assert_eq!(graph.largest_component(), vec![2, 3, 4]);

        let sub = graph.subgraph(&[2, 3, 4]).unwrap();
        assert_eq!(sub.num_nodes(), 3);
        assert_eq!(sub.edges(), &[(0, 1), (1, 2)]);
        assert_abs_diff_eq!(sub.node_features[[0, 0]], 2.0);
    }

    #[test]
    fn test_row_normalize_features() {
        let mut graph = GraphData::new(array![[1.0f32, 3.0], [0.0, 0.0]], vec![]).unwrap();
        graph.row_normalize_features();
        assert_abs_diff_eq!(graph.node_features[[0, 1]], 0.75);
        assert_abs_diff_eq!(graph.node_features[[1, 0]], 0.0);
    }
}
