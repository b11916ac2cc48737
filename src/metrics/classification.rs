// Token-level classification metrics for a batch of generated answers
//
// Both metrics are computed per sample over non-pad target positions and then
// averaged over samples.

use std::collections::BTreeSet;

fn scored_positions<'a>(
    preds: &'a [u32],
    targets: &'a [u32],
    pad: u32,
) -> impl Iterator<Item = (u32, u32)> + 'a {
    preds
        .iter()
        .zip(targets)
        .filter(move |(_, &t)| t != pad)
        .map(|(&p, &t)| (p, t))
}

fn sample_accuracy(preds: &[u32], targets: &[u32], pad: u32) -> Option<f64> {
    let (mut correct, mut total) = (0usize, 0usize);
    for (p, t) in scored_positions(preds, targets, pad) {
        total += 1;
        if p == t {
            correct += 1;
        }
    }
    (total > 0).then(|| correct as f64 / total as f64)
}

fn sample_f1(preds: &[u32], targets: &[u32], pad: u32) -> Option<f64> {
    let pairs: Vec<(u32, u32)> = scored_positions(preds, targets, pad).collect();
    if pairs.is_empty() {
        return None;
    }

    let classes: BTreeSet<u32> = pairs.iter().flat_map(|&(p, t)| [p, t]).collect();
    let total: f64 = classes
        .iter()
        .map(|&class| {
            let tp = pairs.iter().filter(|&&(p, t)| p == class && t == class).count();
            let fp = pairs.iter().filter(|&&(p, t)| p == class && t != class).count();
            let fn_ = pairs.iter().filter(|&&(p, t)| p != class && t == class).count();
            let denom = 2 * tp + fp + fn_;
            if denom == 0 {
                0.0
            } else {
                (2 * tp) as f64 / denom as f64
            }
        })
        .sum();
    Some(total / classes.len() as f64)
}

fn average(values: impl Iterator<Item = Option<f64>>) -> f64 {
    let (sum, count) = values
        .flatten()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Sample-averaged top-1 accuracy; rows are samples
pub fn batch_accuracy(preds: &[Vec<u32>], targets: &[Vec<u32>], pad: u32) -> f64 {
    average(
        preds
            .iter()
            .zip(targets)
            .map(|(p, t)| sample_accuracy(p, t, pad)),
    )
}

/// Sample-averaged macro F1 over the classes present in each sample
pub fn batch_f1(preds: &[Vec<u32>], targets: &[Vec<u32>], pad: u32) -> f64 {
    average(preds.iter().zip(targets).map(|(p, t)| sample_f1(p, t, pad)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy_skips_padding() {
        let preds = vec![vec![5, 6, 9], vec![7, 1, 1]];
        let targets = vec![vec![5, 6, 0], vec![7, 8, 0]];
        // sample 0: 2/2, sample 1: 1/2
        assert!((batch_accuracy(&preds, &targets, 0) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_all_padding_scores_zero() {
        let preds = vec![vec![1, 2]];
        let targets = vec![vec![0, 0]];
        assert_eq!(batch_accuracy(&preds, &targets, 0), 0.0);
        assert_eq!(batch_f1(&preds, &targets, 0), 0.0);
    }

    #[test]
    fn test_f1_perfect_and_partial() {
        let perfect = batch_f1(&[vec![3, 4, 2]], &[vec![3, 4, 2]], 0);
        assert!((perfect - 1.0).abs() < 1e-9);

        // classes {3, 4}: class 3 f1 = 2/3, class 4 f1 = 0
        let partial = batch_f1(&[vec![3, 3]], &[vec![3, 4]], 0);
        assert!((partial - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_stay_in_unit_interval() {
        let preds = vec![vec![1, 2, 3, 4], vec![4, 3, 2, 1], vec![9, 9, 9, 9]];
        let targets = vec![vec![1, 2, 0, 0], vec![1, 2, 3, 4], vec![9, 8, 7, 0]];
        for value in [batch_accuracy(&preds, &targets, 0), batch_f1(&preds, &targets, 0)] {
            assert!((0.0..=1.0).contains(&value));
        }
    }
}
