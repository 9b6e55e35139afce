//! Result tables and persisted run outputs
//!
//! Tables render in three formats: `github` (pipe tables), `plain`
//! (space-aligned columns) and `tsv`. A [`ResultTable`] groups repeated runs
//! of the same variant and shows the mean ± standard deviation of their test
//! accuracy.
//!
//! [`write_outputs`] persists one finished run as plain delimited text. The
//! per-node files hold one row per test node, in ascending node order:
//!
//! | file | content |
//! |---|---|
//! | `test_nodes.txt` | node index of each test row |
//! | `preds.txt` | predicted class per test node |
//! | `labels.txt` | true class per test node |
//! | `output.txt` | class probabilities per test node, `%.4f`, tab separated |
//! | `test_acc.txt` | test accuracy, `%.4f` |
//! | `attention_weight.txt` | `src\tdst\tweight` per edge (attention models only) |
//! | `history.tsv` | one row per epoch |
//! | `cascade/<i>.txt` | probabilities of every node after epoch `i + 1` (when kept) |

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use log::{debug, info};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::data::{GraphData, IndexSet, LabelVector};
use crate::errors::{DistillError, Result};
use crate::training::{predictions, EpochRecord, TrainingOutcome};

// === TABLE FORMATTING ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    #[default]
    Github,
    Plain,
    Tsv,
}

impl fmt::Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableFormat::Github => "github",
            TableFormat::Plain => "plain",
            TableFormat::Tsv => "tsv",
        };
        f.write_str(name)
    }
}

impl FromStr for TableFormat {
    type Err = DistillError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(TableFormat::Github),
            "plain" => Ok(TableFormat::Plain),
            "tsv" => Ok(TableFormat::Tsv),
            other => Err(DistillError::InvalidConfiguration(format!(
                "Unknown table format '{}' (expected github, plain or tsv)",
                other
            ))),
        }
    }
}

/// Render `rows` under `headers`; numeric-looking columns are right aligned
pub fn render_table(headers: &[String], rows: &[Vec<String>], format: TableFormat) -> String {
    if format == TableFormat::Tsv {
        let mut out = headers.join("\t");
        for row in rows {
            out.push('\n');
            out.push_str(&row.join("\t"));
        }
        return out;
    }

    let widths: Vec<usize> = (0..headers.len())
        .map(|col| {
            rows.iter()
                .filter_map(|row| row.get(col))
                .chain(std::iter::once(&headers[col]))
                .map(|cell| cell.chars().count())
                .max()
                .unwrap_or(0)
        })
        .collect();
    let numeric: Vec<bool> = (0..headers.len())
        .map(|col| {
            !rows.is_empty()
                && rows.iter().all(|row| {
                    row.get(col)
                        .and_then(|cell| cell.split_whitespace().next())
                        .map_or(false, |head| head.parse::<f64>().is_ok())
                })
        })
        .collect();

    let pad = |cell: &str, col: usize| {
        let fill = widths[col].saturating_sub(cell.chars().count());
        if numeric[col] {
            format!("{}{}", " ".repeat(fill), cell)
        } else {
            format!("{}{}", cell, " ".repeat(fill))
        }
    };
    let line = |cells: &[String]| -> String {
        let padded: Vec<String> = (0..headers.len())
            .map(|col| pad(cells.get(col).map(String::as_str).unwrap_or(""), col))
            .collect();
        match format {
            TableFormat::Github => format!("| {} |", padded.join(" | ")),
            _ => padded.join("  ").trim_end().to_string(),
        }
    };

    let mut lines = vec![line(headers)];
    if format == TableFormat::Github {
        let rule: Vec<String> = widths
            .iter()
            .zip(&numeric)
            .map(|(&width, &right)| {
                if right {
                    format!("{}:", "-".repeat(width + 1))
                } else {
                    "-".repeat(width + 2)
                }
            })
            .collect();
        lines.push(format!("|{}|", rule.join("|")));
    }
    lines.extend(rows.iter().map(|row| line(row.as_slice())));
    lines.join("\n")
}

/// Mean and population standard deviation; `(0, 0)` for no values
pub fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean as f32, var.sqrt() as f32)
}

// === RESULT TABLE ===

/// Test accuracies grouped by variant, in first-seen order
#[derive(Debug, Clone, Default)]
pub struct ResultTable {
    columns: Vec<String>,
    rows: Vec<(Vec<String>, Vec<f32>)>,
}

impl ResultTable {
    /// `columns` name the variant fields, e.g. `["dataset", "model"]`
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn record(&mut self, variant: Vec<String>, test_accuracy: f32) {
        match self.rows.iter_mut().find(|(key, _)| *key == variant) {
            Some((_, values)) => values.push(test_accuracy),
            None => self.rows.push((variant, vec![test_accuracy])),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Accuracies recorded for `variant`
    pub fn values(&self, variant: &[String]) -> Option<&[f32]> {
        self.rows
            .iter()
            .find(|(key, _)| key.as_slice() == variant)
            .map(|(_, values)| values.as_slice())
    }

    pub fn render(&self, format: TableFormat) -> String {
        let mut headers = self.columns.clone();
        headers.push("runs".to_string());
        headers.push("test_acc".to_string());

        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|(variant, values)| {
                let (mean, std) = mean_std(values);
                let mut row = variant.clone();
                row.push(values.len().to_string());
                row.push(format!("{:.4} ± {:.4}", mean, std));
                row
            })
            .collect();
        render_table(&headers, &rows, format)
    }
}

/// Per-epoch history as a table
pub fn history_table(history: &[EpochRecord], format: TableFormat) -> String {
    let headers: Vec<String> = [
        "epoch",
        "train_loss",
        "train_acc",
        "val_loss",
        "val_acc",
        "test_acc",
        "phase",
        "time_s",
    ]
    .iter()
    .map(|h| h.to_string())
    .collect();

    let rows: Vec<Vec<String>> = history
        .iter()
        .map(|record| {
            vec![
                record.epoch.to_string(),
                format!("{:.4}", record.train_loss),
                format!("{:.4}", record.train_acc),
                format!("{:.4}", record.val_loss),
                format!("{:.4}", record.val_acc),
                format!("{:.4}", record.test_acc),
                format!("{:?}", record.phase),
                format!("{:.4}", record.elapsed.as_secs_f64()),
            ]
        })
        .collect();
    render_table(&headers, &rows, format)
}

/// Per-class split sizes with a total row
pub fn split_table(breakdown: &[(usize, usize, usize)], format: TableFormat) -> String {
    let headers: Vec<String> = ["class", "train", "val", "test"].iter().map(|h| h.to_string()).collect();
    let mut rows: Vec<Vec<String>> = breakdown
        .iter()
        .enumerate()
        .map(|(class, &(train, val, test))| {
            vec![class.to_string(), train.to_string(), val.to_string(), test.to_string()]
        })
        .collect();
    let total = breakdown
        .iter()
        .fold((0, 0, 0), |acc, row| (acc.0 + row.0, acc.1 + row.1, acc.2 + row.2));
    rows.push(vec![
        "total".to_string(),
        total.0.to_string(),
        total.1.to_string(),
        total.2.to_string(),
    ]);
    render_table(&headers, &rows, format)
}

// === PERSISTED OUTPUTS ===

fn create(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path)?))
}

fn write_matrix(path: &Path, matrix: &Array2<f32>) -> Result<()> {
    let mut out = create(path)?;
    for row in matrix.rows() {
        let cells: Vec<String> = row.iter().map(|v| format!("{:.4}", v)).collect();
        writeln!(out, "{}", cells.join("\t"))?;
    }
    out.flush()?;
    Ok(())
}

fn write_column(path: &Path, values: &[usize]) -> Result<()> {
    let mut out = create(path)?;
    for value in values {
        writeln!(out, "{}", value)?;
    }
    out.flush()?;
    Ok(())
}

/**
 * Persist a finished run under `dir` (created if needed).
 *
 * Predictions, labels and probabilities are written for the `test` nodes
 * only. Probabilities are the exponentiated log-probabilities of the restored
 * model. Attention rows follow `graph.edges_with_self_loops()`.
 */
pub fn write_outputs(
    dir: &Path,
    graph: &GraphData,
    labels: &LabelVector,
    test: &IndexSet,
    outcome: &TrainingOutcome,
) -> Result<()> {
    let num_rows = outcome.log_probs.nrows().min(labels.len());
    if let Some(&node) = test.iter().find(|&&node| node >= num_rows) {
        return Err(DistillError::DimensionMismatch(format!(
            "Test node {} out of range for {} output rows",
            node, num_rows
        )));
    }

    fs::create_dir_all(dir)?;

    let test_log_probs = outcome.log_probs.select(Axis(0), test);
    let test_labels: Vec<usize> = test.iter().map(|&node| labels.as_slice()[node]).collect();
    write_column(&dir.join("test_nodes.txt"), test)?;
    write_column(&dir.join("preds.txt"), &predictions(&test_log_probs))?;
    write_column(&dir.join("labels.txt"), &test_labels)?;
    write_matrix(&dir.join("output.txt"), &test_log_probs.mapv(f32::exp))?;
    fs::write(dir.join("test_acc.txt"), format!("{:.4}\n", outcome.test_accuracy))?;

    if let Some(attention) = &outcome.attention {
        let edges = graph.edges_with_self_loops();
        if edges.len() != attention.len() {
            return Err(DistillError::DimensionMismatch(format!(
                "{} attention weights for {} edges",
                attention.len(),
                edges.len()
            )));
        }
        info!("Saving attention weights");
        let mut out = create(&dir.join("attention_weight.txt"))?;
        for (&(src, dst), weight) in edges.iter().zip(attention.iter()) {
            writeln!(out, "{}\t{}\t{:.4}", src, dst, weight)?;
        }
        out.flush()?;
    }

    fs::write(
        dir.join("history.tsv"),
        history_table(&outcome.history, TableFormat::Tsv) + "\n",
    )?;

    if !outcome.cascade.is_empty() {
        let cascade_dir = dir.join("cascade");
        fs::create_dir_all(&cascade_dir)?;
        for (i, probabilities) in outcome.cascade.iter().enumerate() {
            write_matrix(&cascade_dir.join(format!("{}.txt", i)), probabilities)?;
        }
    }

    debug!("Wrote outputs to {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_mean_std() {
        let (mean, std) = mean_std(&[0.8, 0.9, 1.0]);
        assert_abs_diff_eq!(mean, 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(std, 0.08165, epsilon = 1e-4);
        assert_eq!(mean_std(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_result_table_groups_variants() {
        let mut table = ResultTable::new(&["dataset", "model"]);
        let cora_gcn = vec!["cora".to_string(), "GCN".to_string()];
        table.record(cora_gcn.clone(), 0.8);
        table.record(vec!["cora".to_string(), "GAT".to_string()], 0.7);
        table.record(cora_gcn.clone(), 0.6);
        assert_eq!(table.len(), 2);
        assert_eq!(table.values(&cora_gcn), Some(&[0.8, 0.6][..]));

        let tsv = table.render(TableFormat::Tsv);
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines[0], "dataset\tmodel\truns\ttest_acc");
        assert_eq!(lines[1], "cora\tGCN\t2\t0.7000 ± 0.1000");
    }

    #[test]
    fn test_github_and_plain_layouts() {
        let headers = vec!["name".to_string(), "value".to_string()];
        let rows = vec![
            vec!["a".to_string(), "1.5".to_string()],
            vec!["long".to_string(), "10.25".to_string()],
        ];

        let github = render_table(&headers, &rows, TableFormat::Github);
        let lines: Vec<&str> = github.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "| name | value |");
        assert_eq!(lines[1], "|------|------:|");
        assert_eq!(lines[2], "| a    |   1.5 |");

        let plain = render_table(&headers, &rows, TableFormat::Plain);
        assert_eq!(plain.lines().nth(2), Some("long  10.25"));
    }

    #[test]
    fn test_split_table_totals() {
        let table = split_table(&[(3, 0, 0), (2, 1, 0), (2, 0, 1)], TableFormat::Tsv);
        assert_eq!(table.lines().last(), Some("total\t7\t1\t1"));
    }

    #[test]
    fn test_table_format_parsing() {
        assert_eq!("GitHub".parse::<TableFormat>().unwrap(), TableFormat::Github);
        assert_eq!(TableFormat::Tsv.to_string(), "tsv");
        assert!("latex".parse::<TableFormat>().is_err());
    }
}
