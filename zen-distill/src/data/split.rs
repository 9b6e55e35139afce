/**
 * @file zen-distill/src/data/split.rs
 * @brief Stratified train/validation/test splitting of node indices
 *
 * Two policies are supported:
 *
 * - **PerClassCount**: a fixed number of train and validation nodes per class
 *   (the classic Planetoid split), with every other node eligible for test.
 * - **Ratio**: two stratified draws without replacement. Train takes
 *   `⌊train_ratio · N⌋` nodes apportioned across classes by largest remainder;
 *   the residual is divided into validation and test with the effective
 *   fraction `val_ratio / (1 − train_ratio)`.
 *
 * ## Small classes
 *
 * In ratio mode every non-empty class receives at least one train node, so a
 * class with a single member always places it in train. The extra nodes are
 * added on top of the train target and come out of the residual.
 *
 * Splitting is a pure function of `(labels, policy, seed)`: classes are
 * visited in ascending id order and each class is shuffled once by a
 * `ChaCha8Rng` owned by the call.
 */

use log::debug;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::labels::{IndexSet, LabelVector};
use crate::errors::{DistillError, Result};

/// Slack used when flooring fractional counts
const COUNT_EPSILON: f64 = 1e-9;

// === POLICY ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SplitPolicy {
    PerClassCount {
        train_per_class: usize,
        val_per_class: usize,
        #[serde(default)]
        max_test: Option<usize>,
    },
    Ratio {
        train_ratio: f64,
        val_ratio: f64,
    },
}

impl SplitPolicy {
    /// Reject ratios outside `0 < train, 0 < val, train + val < 1`
    pub fn validate(&self) -> Result<()> {
        match *self {
            SplitPolicy::PerClassCount { .. } => Ok(()),
            SplitPolicy::Ratio {
                train_ratio,
                val_ratio,
            } => {
                if !(train_ratio > 0.0 && val_ratio > 0.0 && train_ratio + val_ratio < 1.0) {
                    return Err(DistillError::InvalidConfiguration(format!(
                        "Split ratios must satisfy 0 < train, 0 < val, train + val < 1 (got train={}, val={})",
                        train_ratio, val_ratio
                    )));
                }
                Ok(())
            }
        }
    }

    /// Short label used in output directory names
    pub fn label_rate(&self) -> String {
        match *self {
            SplitPolicy::PerClassCount { train_per_class, .. } => train_per_class.to_string(),
            SplitPolicy::Ratio { train_ratio, .. } => format!("{}", train_ratio),
        }
    }
}

/// Disjoint train/validation/test node sets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSplit {
    pub train: IndexSet,
    pub val: IndexSet,
    pub test: IndexSet,
}

impl DatasetSplit {
    /// Per-class sizes of each set, as `(train, val, test)` rows
    pub fn class_breakdown(&self, labels: &LabelVector) -> Vec<(usize, usize, usize)> {
        let mut rows = vec![(0, 0, 0); labels.num_classes()];
        let count = |set: &IndexSet, rows: &mut Vec<(usize, usize, usize)>, slot: usize| {
            for &node in set.iter() {
                if let Some(class) = labels.get(node) {
                    let row = &mut rows[class];
                    match slot {
                        0 => row.0 += 1,
                        1 => row.1 += 1,
                        _ => row.2 += 1,
                    }
                }
            }
        };
        count(&self.train, &mut rows, 0);
        count(&self.val, &mut rows, 1);
        count(&self.test, &mut rows, 2);
        rows
    }
}

// === SPLITTING ===

/**
 * Partition node indices under `policy`, deterministically in `seed`.
 *
 * # Errors
 *
 * - `InvalidInput` if `labels` is empty
 * - `InvalidConfiguration` for ratios outside the valid range
 * - `InsufficientClassSamples` in per-class mode when a class cannot supply
 *   `train_per_class + val_per_class` nodes
 *
 * # Examples
 *
 * ```rust
 * use zen_distill::data::{split, LabelVector, SplitPolicy};
 *
 * let labels = LabelVector::new(vec![0, 0, 0, 1, 1, 1, 2, 2, 2]).unwrap();
 * let policy = SplitPolicy::Ratio { train_ratio: 0.8, val_ratio: 0.1 };
 * let parts = split(&labels, &policy, 0).unwrap();
 *
 * assert_eq!(parts.train.len() + parts.val.len() + parts.test.len(), 9);
 * ```
 */
pub fn split(labels: &LabelVector, policy: &SplitPolicy, seed: u64) -> Result<DatasetSplit> {
    if labels.is_empty() {
        return Err(DistillError::InvalidInput(
            "Cannot split an empty label vector".to_string(),
        ));
    }
    policy.validate()?;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let shuffled: Vec<Vec<usize>> = (0..labels.num_classes())
        .map(|class| {
            let mut members = labels.class_members(class);
            members.shuffle(&mut rng);
            members
        })
        .collect();

    let parts = match *policy {
        SplitPolicy::PerClassCount {
            train_per_class,
            val_per_class,
            max_test,
        } => split_per_class(&shuffled, train_per_class, val_per_class, max_test, &mut rng)?,
        SplitPolicy::Ratio {
            train_ratio,
            val_ratio,
        } => split_by_ratio(&shuffled, labels.len(), train_ratio, val_ratio),
    };

    debug!(
        "Split {} nodes into train={} val={} test={} (seed {})",
        labels.len(),
        parts.train.len(),
        parts.val.len(),
        parts.test.len(),
        seed
    );

    Ok(parts)
}

fn split_per_class(
    shuffled: &[Vec<usize>],
    train_per_class: usize,
    val_per_class: usize,
    max_test: Option<usize>,
    rng: &mut ChaCha8Rng,
) -> Result<DatasetSplit> {
    let required = train_per_class + val_per_class;
    let mut train = Vec::new();
    let mut val = Vec::new();
    let mut test = Vec::new();

    for (class, members) in shuffled.iter().enumerate() {
        if members.len() < required {
            return Err(DistillError::InsufficientClassSamples {
                class,
                available: members.len(),
                required,
            });
        }
        train.extend_from_slice(&members[..train_per_class]);
        val.extend_from_slice(&members[train_per_class..required]);
        test.extend_from_slice(&members[required..]);
    }

    if let Some(limit) = max_test {
        test.shuffle(rng);
        test.truncate(limit);
    }

    Ok(DatasetSplit {
        train: train.into_iter().collect(),
        val: val.into_iter().collect(),
        test: test.into_iter().collect(),
    })
}

fn split_by_ratio(
    shuffled: &[Vec<usize>],
    num_nodes: usize,
    train_ratio: f64,
    val_ratio: f64,
) -> DatasetSplit {
    let class_sizes: Vec<usize> = shuffled.iter().map(Vec::len).collect();

    let train_target = floor_count(train_ratio * num_nodes as f64);
    let mut train_counts = apportion(train_target, &class_sizes);
    for (count, &size) in train_counts.iter_mut().zip(&class_sizes) {
        if size > 0 && *count == 0 {
            *count = 1;
        }
    }

    let residual_sizes: Vec<usize> = class_sizes
        .iter()
        .zip(&train_counts)
        .map(|(size, count)| size - count)
        .collect();
    let residual: usize = residual_sizes.iter().sum();

    let effective_val = val_ratio / (1.0 - train_ratio);
    let mut val_target = floor_count(effective_val * residual as f64);
    if residual >= 2 {
        val_target = val_target.clamp(1, residual - 1);
    } else {
        val_target = val_target.min(residual);
    }
    let val_counts = apportion(val_target, &residual_sizes);

    let mut train = Vec::with_capacity(train_target);
    let mut val = Vec::with_capacity(val_target);
    let mut test = Vec::with_capacity(residual.saturating_sub(val_target));

    for ((members, &n_train), &n_val) in shuffled.iter().zip(&train_counts).zip(&val_counts) {
        train.extend_from_slice(&members[..n_train]);
        val.extend_from_slice(&members[n_train..n_train + n_val]);
        test.extend_from_slice(&members[n_train + n_val..]);
    }

    DatasetSplit {
        train: train.into_iter().collect(),
        val: val.into_iter().collect(),
        test: test.into_iter().collect(),
    }
}

fn floor_count(value: f64) -> usize {
    (value + COUNT_EPSILON).floor().max(0.0) as usize
}

/**
 * Largest-remainder apportionment of `total` across groups of `sizes`.
 *
 * Each group receives `⌊total · size / Σsize⌋` plus at most one extra unit;
 * extras go to the largest fractional remainders, lower group id first on
 * ties. No group receives more than its size.
 */
pub(crate) fn apportion(total: usize, sizes: &[usize]) -> Vec<usize> {
    let grand: usize = sizes.iter().sum();
    if grand == 0 || total == 0 {
        return vec![0; sizes.len()];
    }
    let total = total.min(grand);

    let quotas: Vec<f64> = sizes
        .iter()
        .map(|&size| total as f64 * size as f64 / grand as f64)
        .collect();
    let mut counts: Vec<usize> = quotas
        .iter()
        .zip(sizes)
        .map(|(&quota, &size)| floor_count(quota).min(size))
        .collect();

    let assigned: usize = counts.iter().sum();
    let mut order: Vec<usize> = (0..sizes.len()).filter(|&g| counts[g] < sizes[g]).collect();
    order.sort_by(|&a, &b| {
        let rem_a = quotas[a] - counts[a] as f64;
        let rem_b = quotas[b] - counts[b] as f64;
        rem_b.total_cmp(&rem_a).then(a.cmp(&b))
    });

    for &group in order.iter().take(total.saturating_sub(assigned)) {
        counts[group] += 1;
    }
    counts
}

// === TESTS ===

#[cfg(test)]
mod tests {
    use super::*;

    fn nine_nodes() -> LabelVector {
        LabelVector::new(vec![0, 0, 0, 1, 1, 1, 2, 2, 2]).unwrap()
    }

    fn assert_partition(parts: &DatasetSplit, num_nodes: usize) {
        assert!(parts.train.is_disjoint(&parts.val));
        assert!(parts.train.is_disjoint(&parts.test));
        assert!(parts.val.is_disjoint(&parts.test));
        assert_eq!(parts.train.len() + parts.val.len() + parts.test.len(), num_nodes);
    }

    #[test]
    fn test_apportion_largest_remainder() {
        assert_eq!(apportion(7, &[3, 3, 3]), vec![3, 2, 2]);
        assert_eq!(apportion(1, &[0, 1, 1]), vec![0, 1, 0]);
        assert_eq!(apportion(5, &[6, 3, 1]), vec![3, 2, 0]);
        assert_eq!(apportion(0, &[4, 4]), vec![0, 0]);
        assert_eq!(apportion(20, &[2, 2]), vec![2, 2]);
    }

    #[test]
    fn test_nine_node_fallback_scenario() {
        let labels = nine_nodes();
        let policy = SplitPolicy::Ratio {
            train_ratio: 0.8,
            val_ratio: 0.1,
        };
        let parts = split(&labels, &policy, 42).unwrap();

        assert_partition(&parts, 9);
        assert_eq!(parts.class_breakdown(&labels), vec![(3, 0, 0), (2, 1, 0), (2, 0, 1)]);
        assert_eq!(parts, split(&labels, &policy, 42).unwrap());
    }

    #[test]
    fn test_single_member_class_goes_to_train() {
        let labels = LabelVector::new(vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 1]).unwrap();
        let policy = SplitPolicy::Ratio {
            train_ratio: 0.2,
            val_ratio: 0.2,
        };
        let parts = split(&labels, &policy, 3).unwrap();

        assert!(parts.train.contains(9));
        assert_partition(&parts, 10);
    }

    #[test]
    fn test_per_class_counts() {
        let labels = LabelVector::new((0..30).map(|i| i % 3).collect()).unwrap();
        let policy = SplitPolicy::PerClassCount {
            train_per_class: 2,
            val_per_class: 3,
            max_test: Some(7),
        };
        let parts = split(&labels, &policy, 1).unwrap();

        assert_eq!(parts.train.len(), 6);
        assert_eq!(parts.val.len(), 9);
        assert_eq!(parts.test.len(), 7);
        assert!(parts.train.is_disjoint(&parts.test));
        assert!(parts.val.is_disjoint(&parts.test));
        for (train, val, _) in parts.class_breakdown(&labels) {
            assert_eq!((train, val), (2, 3));
        }
    }

    #[test]
    fn test_per_class_insufficient_samples() {
        let labels = LabelVector::new(vec![0, 0, 0, 0, 1, 1]).unwrap();
        let policy = SplitPolicy::PerClassCount {
            train_per_class: 2,
            val_per_class: 1,
            max_test: None,
        };
        match split(&labels, &policy, 0) {
            Err(DistillError::InsufficientClassSamples {
                class,
                available,
                required,
            }) => assert_eq!((class, available, required), (1, 2, 3)),
            other => panic!("expected InsufficientClassSamples, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_ratios_rejected() {
        let labels = nine_nodes();
        for (train_ratio, val_ratio) in [(0.0, 0.1), (0.5, 0.5), (0.9, 0.0), (0.7, 0.4)] {
            let policy = SplitPolicy::Ratio {
                train_ratio,
                val_ratio,
            };
            assert!(matches!(
                split(&labels, &policy, 0),
                Err(DistillError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn test_policy_serde_and_label_rate() {
        let policy: SplitPolicy =
            serde_json::from_str(r#"{"mode":"per_class_count","train_per_class":20,"val_per_class":30}"#)
                .unwrap();
        assert_eq!(
            policy,
            SplitPolicy::PerClassCount {
                train_per_class: 20,
                val_per_class: 30,
                max_test: None
            }
        );
        assert_eq!(policy.label_rate(), "20");
        assert_eq!(
            SplitPolicy::Ratio {
                train_ratio: 0.6,
                val_ratio: 0.2
            }
            .label_rate(),
            "0.6"
        );
    }
}
