//! Dataset loading and standardization
//!
//! Supported sources:
//! - Planetoid citation benchmarks in the LINQS `<name>.content` / `<name>.cites` layout
//! - Tensor directories (`features.tsv`, `labels.tsv`, `edges.tsv`) as exported
//!   for the provenance-graph datasets
//! - Seeded synthetic block-model graphs

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::graph::GraphData;
use super::labels::LabelVector;
use super::synthetic::{self, SyntheticConfig};
use crate::errors::{DistillError, Result};

/// Where a dataset comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSource {
    Planetoid { dir: PathBuf, name: String },
    Tensor { dir: PathBuf },
    Synthetic(SyntheticConfig),
}

/// Name that selects the built-in synthetic dataset
pub const SYNTHETIC: &str = "synthetic";

impl DatasetSource {
    /**
     * Find dataset `name` under `data_dir`.
     *
     * `<data_dir>/<name>/<name>.content` selects the Planetoid layout and
     * `<data_dir>/<name>/features.tsv` the tensor layout; the name
     * `synthetic` selects the default block-model graph.
     */
    pub fn locate(data_dir: &Path, name: &str) -> Result<Self> {
        if name == SYNTHETIC {
            return Ok(DatasetSource::Synthetic(SyntheticConfig::default()));
        }
        let dir = data_dir.join(name);
        if dir.join(format!("{}.content", name)).is_file() {
            Ok(DatasetSource::Planetoid {
                dir,
                name: name.to_string(),
            })
        } else if dir.join("features.tsv").is_file() {
            Ok(DatasetSource::Tensor { dir })
        } else {
            Err(DistillError::Dataset(format!(
                "No dataset '{}' under {}",
                name,
                data_dir.display()
            )))
        }
    }
}

/// Post-load processing applied before any split is drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Keep only the largest connected component
    #[serde(default)]
    pub largest_component: bool,
    /// Divide every feature row by its L1 norm
    #[serde(default)]
    pub row_normalize: bool,
}

/// A standardized graph with one label per node
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub graph: GraphData,
    pub labels: LabelVector,
}

impl Dataset {
    pub fn new(name: impl Into<String>, graph: GraphData, labels: LabelVector) -> Result<Self> {
        if graph.num_nodes() != labels.len() {
            return Err(DistillError::DimensionMismatch(format!(
                "Graph has {} nodes but {} labels were given",
                graph.num_nodes(),
                labels.len()
            )));
        }
        Ok(Self {
            name: name.into(),
            graph,
            labels,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.labels.num_classes()
    }

    pub fn feature_dim(&self) -> usize {
        self.graph.node_feature_dim()
    }

    /// Log the shape summary printed at the start of every run
    pub fn log_summary(&self) {
        info!(
            "Dataset {}: features {}x{}, {} classes, {} nodes, {} edges",
            self.name,
            self.graph.num_nodes(),
            self.graph.node_feature_dim(),
            self.num_classes(),
            self.graph.num_nodes(),
            self.graph.num_edges()
        );
    }
}

/// Load and standardize a dataset
pub fn load_dataset(source: &DatasetSource, options: &LoadOptions) -> Result<Dataset> {
    let raw = match source {
        DatasetSource::Planetoid { dir, name } => load_planetoid(dir, name)?,
        DatasetSource::Tensor { dir } => load_tensor_dir(dir)?,
        DatasetSource::Synthetic(config) => {
            let (graph, labels) = synthetic::generate(config)?;
            Dataset::new("synthetic", graph, labels)?
        }
    };
    standardize_dataset(raw, options)
}

/**
 * Make the graph undirected and simple, then apply the load options.
 *
 * Largest-component extraction renumbers nodes in ascending original order and
 * carries labels along.
 */
pub fn standardize_dataset(dataset: Dataset, options: &LoadOptions) -> Result<Dataset> {
    let Dataset {
        name,
        graph,
        labels,
    } = dataset;

    let mut graph = graph.standardized();
    let mut labels = labels;

    if options.largest_component {
        let keep = graph.largest_component();
        if keep.len() < graph.num_nodes() {
            debug!(
                "Keeping largest component: {} of {} nodes",
                keep.len(),
                graph.num_nodes()
            );
            graph = graph.subgraph(&keep)?;
            labels = labels.select(&keep)?;
        }
    }

    if options.row_normalize {
        graph.row_normalize_features();
    }

    Dataset::new(name, graph, labels)
}

// === PLANETOID ===

fn load_planetoid(dir: &Path, name: &str) -> Result<Dataset> {
    let content_path = dir.join(format!("{}.content", name));
    let cites_path = dir.join(format!("{}.cites", name));
    let content = fs::read_to_string(&content_path)?;
    let cites = fs::read_to_string(&cites_path)?;

    let mut paper_ids: HashMap<String, usize> = HashMap::new();
    let mut rows: Vec<Vec<f32>> = Vec::new();
    let mut raw_labels: Vec<String> = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 3 {
            return Err(DistillError::Dataset(format!(
                "{}:{}: expected id, features and label",
                content_path.display(),
                line_no + 1
            )));
        }
        let features = fields[1..fields.len() - 1]
            .iter()
            .map(|value| parse_value::<f32>(value, &content_path, line_no))
            .collect::<Result<Vec<_>>>()?;

        paper_ids.insert(fields[0].to_string(), rows.len());
        rows.push(features);
        raw_labels.push(fields[fields.len() - 1].to_string());
    }

    let classes: BTreeMap<&str, usize> = {
        let mut names: Vec<&str> = raw_labels.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        names.into_iter().enumerate().map(|(id, name)| (name, id)).collect()
    };
    let labels: Vec<usize> = raw_labels.iter().map(|label| classes[label.as_str()]).collect();

    let mut edges = Vec::new();
    let mut dangling = 0usize;
    for line in cites.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            continue;
        }
        match (paper_ids.get(fields[1]), paper_ids.get(fields[0])) {
            (Some(&citing), Some(&cited)) => edges.push((citing, cited)),
            _ => dangling += 1,
        }
    }
    if dangling > 0 {
        warn!("{}: skipped {} citations to unknown papers", cites_path.display(), dangling);
    }

    let features = stack_rows(rows, &content_path)?;
    Dataset::new(name, GraphData::new(features, edges)?, LabelVector::new(labels)?)
}

// === TENSOR DIRECTORY ===

fn load_tensor_dir(dir: &Path) -> Result<Dataset> {
    let features_path = dir.join("features.tsv");
    let labels_path = dir.join("labels.tsv");
    let edges_path = dir.join("edges.tsv");

    let rows = read_table::<f32>(&features_path)?;
    let raw_labels: Vec<usize> = read_table::<usize>(&labels_path)?
        .into_iter()
        .map(|row| row.first().copied())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| DistillError::Dataset(format!("{}: empty label row", labels_path.display())))?;

    // dense class ids in ascending raw-id order
    let classes: BTreeMap<usize, usize> = {
        let mut ids = raw_labels.clone();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter().enumerate().map(|(id, raw)| (raw, id)).collect()
    };
    if classes.keys().enumerate().any(|(id, &raw)| id != raw) {
        debug!(
            "{}: renumbered {} sparse class ids",
            labels_path.display(),
            classes.len()
        );
    }
    let labels: Vec<usize> = raw_labels.iter().map(|raw| classes[raw]).collect();

    let edges = read_table::<usize>(&edges_path)?
        .into_iter()
        .enumerate()
        .map(|(line_no, row)| match row.as_slice() {
            [source, target, ..] => Ok((*source, *target)),
            _ => Err(DistillError::Dataset(format!(
                "{}:{}: expected source and target",
                edges_path.display(),
                line_no + 1
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tensor".to_string());

    let features = stack_rows(rows, &features_path)?;
    Dataset::new(name, GraphData::new(features, edges)?, LabelVector::new(labels)?)
}

fn read_table<T: std::str::FromStr>(path: &Path) -> Result<Vec<Vec<T>>> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line_no, line)| {
            line.split_whitespace()
                .map(|value| parse_value(value, path, line_no))
                .collect()
        })
        .collect()
}

fn parse_value<T: std::str::FromStr>(value: &str, path: &Path, line_no: usize) -> Result<T> {
    value.parse().map_err(|_| {
        DistillError::Dataset(format!(
            "{}:{}: cannot parse '{}'",
            path.display(),
            line_no + 1,
            value
        ))
    })
}

fn stack_rows(rows: Vec<Vec<f32>>, path: &Path) -> Result<Array2<f32>> {
    let num_rows = rows.len();
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if let Some(bad) = rows.iter().position(|row| row.len() != width) {
        return Err(DistillError::Dataset(format!(
            "{}: row {} has {} features, expected {}",
            path.display(),
            bad + 1,
            rows[bad].len(),
            width
        )));
    }
    Ok(Array2::from_shape_vec(
        (num_rows, width),
        rows.into_iter().flatten().collect(),
    )?)
}
