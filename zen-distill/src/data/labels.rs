//! Node labels and node index sets

use std::collections::BTreeSet;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::errors::{DistillError, Result};

/// Class id of every node, indexed by node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelVector {
    labels: Vec<usize>,
    num_classes: usize,
}

impl LabelVector {
    /// Wrap a label sequence; the class count is `max(label) + 1`
    pub fn new(labels: Vec<usize>) -> Result<Self> {
        let num_classes = match labels.iter().max() {
            Some(&max) => max.checked_add(1).ok_or_else(|| {
                DistillError::InvalidInput(format!("Class id {} is out of range", max))
            })?,
            None => {
                return Err(DistillError::InvalidInput(
                    "Label vector must contain at least one node".to_string(),
                ))
            }
        };
        Ok(Self { labels, num_classes })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn get(&self, node: usize) -> Option<usize> {
        self.labels.get(node).copied()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.labels
    }

    /// Members of class `class` in ascending node order
    pub fn class_members(&self, class: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(node, &label)| (label == class).then_some(node))
            .collect()
    }

    /// Number of nodes per class
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_classes];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }

    /// Restrict to a subset of nodes, renumbered in the given order
    pub fn select(&self, nodes: &[usize]) -> Result<LabelVector> {
        let labels = nodes
            .iter()
            .map(|&node| {
                self.get(node).ok_or_else(|| {
                    DistillError::InvalidInput(format!("Node index {} out of bounds for labels", node))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        LabelVector::new(labels)
    }
}

/// Sorted, duplicate-free set of node indices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSet(Vec<usize>);

impl IndexSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn contains(&self, node: usize) -> bool {
        self.0.binary_search(&node).is_ok()
    }

    pub fn is_disjoint(&self, other: &IndexSet) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => return false,
            }
        }
        true
    }

    pub fn into_vec(self) -> Vec<usize> {
        self.0
    }
}

impl FromIterator<usize> for IndexSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let set: BTreeSet<usize> = iter.into_iter().collect();
        Self(set.into_iter().collect())
    }
}

impl Deref for IndexSet {
    type Target = [usize];

    fn deref(&self) -> &[usize] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_vector() {
        let labels = LabelVector::new(vec![2, 0, 2, 1, 0]).unwrap();
        assert_eq!(labels.len(), 5);
        assert_eq!(labels.num_classes(), 3);
        assert_eq!(labels.class_members(2), vec![0, 2]);
        assert_eq!(labels.class_counts(), vec![2, 1, 2]);
        assert_eq!(labels.select(&[3, 4]).unwrap().as_slice(), &[1, 0]);
        assert!(labels.select(&[9]).is_err());
        assert!(LabelVector::new(vec![]).is_err());
        assert!(matches!(
            LabelVector::new(vec![0, usize::MAX]),
            Err(DistillError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_index_set_sorted_and_deduplicated() {
        let set: IndexSet = vec![5, 1, 3, 1].into_iter().collect();
        assert_eq!(&*set, &[1, 3, 5]);
        assert!(set.contains(3));
        assert!(!set.contains(2));

        let other: IndexSet = vec![0, 2, 4].into_iter().collect();
        assert!(set.is_disjoint(&other));
        let overlapping: IndexSet = vec![5].into_iter().collect();
        assert!(!set.is_disjoint(&overlapping));
    }
}
