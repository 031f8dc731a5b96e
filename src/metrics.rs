//! Binary classification metrics for churn probabilities

use serde::{Deserialize, Serialize};

use crate::error::{ChurnError, ChurnResult};

/// Area under the ROC curve via the rank-sum (Mann-Whitney) statistic
///
/// Tied scores receive their average rank, which matches the trapezoidal
/// area of the ROC curve.
pub fn roc_auc(labels: &[usize], scores: &[f64]) -> ChurnResult<f64> {
    if labels.len() != scores.len() {
        return Err(ChurnError::LabelMismatch {
            rows: scores.len(),
            labels: labels.len(),
        });
    }

    let positives = labels.iter().filter(|&&label| label == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(ChurnError::MissingClasses {
            positives,
            negatives,
        });
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // ranks are 1-based; the tie group start..end shares the mean rank
        let average_rank = (start + end + 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            if labels[idx] == 1 {
                positive_rank_sum += average_rank;
            }
        }
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Threshold-dependent metrics for hard predictions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Accuracy, precision, recall and F1 for hard 0/1 predictions
pub fn threshold_metrics(labels: &[usize], predictions: &[usize]) -> ThresholdMetrics {
    let mut tp = 0.0;
    let mut fp = 0.0;
    let mut fn_count = 0.0;
    let mut correct = 0.0;

    for (&label, &predicted) in labels.iter().zip(predictions.iter()) {
        if label == predicted {
            correct += 1.0;
        }
        match (label, predicted) {
            (1, 1) => tp += 1.0,
            (0, 1) => fp += 1.0,
            (1, 0) => fn_count += 1.0,
            _ => {}
        }
    }

    let total = labels.len().min(predictions.len()) as f64;
    let accuracy = if total > 0.0 { correct / total } else { 0.0 };
    let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
    let recall = if tp + fn_count > 0.0 { tp / (tp + fn_count) } else { 0.0 };
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    ThresholdMetrics {
        accuracy,
        precision,
        recall,
        f1,
    }
}

/// Round to three decimals for the training confirmation line
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_ranking() {
        let auc = roc_auc(&[0, 0, 1, 1], &[0.1, 0.2, 0.8, 0.9]).unwrap();
        assert!((auc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_ranking() {
        let auc = roc_auc(&[1, 1, 0, 0], &[0.1, 0.2, 0.8, 0.9]).unwrap();
        assert!(auc.abs() < 1e-12);
    }

    #[test]
    fn test_known_value() {
        // one of the four positive/negative pairs is misordered
        let auc = roc_auc(&[0, 1, 0, 1], &[0.1, 0.35, 0.4, 0.8]).unwrap();
        assert!((auc - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_ties_count_half() {
        let auc = roc_auc(&[0, 1], &[0.5, 0.5]).unwrap();
        assert!((auc - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_single_class_is_an_error() {
        assert!(matches!(
            roc_auc(&[1, 1, 1], &[0.2, 0.4, 0.6]),
            Err(ChurnError::MissingClasses { positives: 3, negatives: 0 })
        ));
    }

    #[test]
    fn test_threshold_metrics() {
        let metrics = threshold_metrics(&[1, 0, 1, 0, 1], &[1, 1, 0, 0, 1]);
        assert!((metrics.accuracy - 0.6).abs() < 1e-12);
        assert!((metrics.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((metrics.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((metrics.f1 - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_round3() {
        assert_eq!(round3(0.87654), 0.877);
        assert_eq!(round3(0.5), 0.5);
    }
}
