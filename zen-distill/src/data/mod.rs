//! Graph datasets: structures, loading, labels and stratified splitting

pub mod graph;
pub mod labels;
pub mod loader;
pub mod split;
pub mod synthetic;

pub use graph::{AdjacencyList, GraphData, NodeFeatures, NodeIndex, SparseMatrix};
pub use labels::{IndexSet, LabelVector};
pub use loader::{load_dataset, standardize_dataset, Dataset, DatasetSource, LoadOptions, SYNTHETIC};
pub use split::{split, DatasetSplit, SplitPolicy};
pub use synthetic::SyntheticConfig;
