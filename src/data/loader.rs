// Batch loading - fixed-size batches, optional shuffling, padding collation

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

use super::dataset::{VqaDataset, VqaSample, BOX_DIM};
use crate::errors::VqaError;

/// A collated batch on the training device
#[derive(Debug, Clone)]
pub struct VqaBatch {
    /// (N, Lq) u32
    pub input_ids: Tensor,
    /// (N, B, D) f32
    pub feats: Tensor,
    /// (N, B, 4) f32
    pub boxes: Tensor,
    /// (N, Lq) u32, 1 for real tokens
    pub attention_mask: Tensor,
    /// (L, N) u32, sequence-first like the logits
    pub targets: Tensor,
    /// (L, N) u32, 1 for real tokens
    pub target_mask: Tensor,
}

impl VqaBatch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims()[0]
    }

    pub fn target_len(&self) -> usize {
        self.targets.dims()[0]
    }
}

/// Pad a list of samples into one batch
pub fn collate(samples: &[VqaSample], pad_id: u32, device: &Device) -> Result<VqaBatch> {
    let first = samples
        .first()
        .ok_or_else(|| VqaError::invalid("cannot collate an empty batch"))?;
    let n = samples.len();
    let num_boxes = first.num_boxes;
    let feature_dim = first.feature_dim();

    for sample in samples {
        if sample.num_boxes != num_boxes
            || sample.feature_dim() != feature_dim
            || sample.boxes.len() != sample.num_boxes * BOX_DIM
        {
            return Err(VqaError::malformed(
                "<batch>",
                format!(
                    "region features differ within a batch: {}x{} vs {}x{}",
                    sample.num_boxes,
                    sample.feature_dim(),
                    num_boxes,
                    feature_dim
                ),
            )
            .into());
        }
    }

    let max_q = samples.iter().map(|s| s.input_ids.len()).max().unwrap_or(0).max(1);
    let mut input_ids = Vec::with_capacity(n * max_q);
    let mut attention_mask = Vec::with_capacity(n * max_q);
    for sample in samples {
        input_ids.extend_from_slice(&sample.input_ids);
        attention_mask.extend(std::iter::repeat(1u32).take(sample.input_ids.len()));
        let pad = max_q - sample.input_ids.len();
        input_ids.extend(std::iter::repeat(pad_id).take(pad));
        attention_mask.extend(std::iter::repeat(0u32).take(pad));
    }

    let max_t = samples.iter().map(|s| s.target_ids.len()).max().unwrap_or(0).max(1);
    let mut targets = Vec::with_capacity(max_t * n);
    let mut target_mask = Vec::with_capacity(max_t * n);
    for t in 0..max_t {
        for sample in samples {
            match sample.target_ids.get(t) {
                Some(&id) => {
                    targets.push(id);
                    target_mask.push(1u32);
                }
                None => {
                    targets.push(pad_id);
                    target_mask.push(0u32);
                }
            }
        }
    }

    let feats: Vec<f32> = samples.iter().flat_map(|s| s.feats.iter().copied()).collect();
    let boxes: Vec<f32> = samples.iter().flat_map(|s| s.boxes.iter().copied()).collect();

    Ok(VqaBatch {
        input_ids: Tensor::from_vec(input_ids, (n, max_q), device)?,
        feats: Tensor::from_vec(feats, (n, num_boxes, feature_dim), device)?,
        boxes: Tensor::from_vec(boxes, (n, num_boxes, BOX_DIM), device)?,
        attention_mask: Tensor::from_vec(attention_mask, (n, max_q), device)?,
        targets: Tensor::from_vec(targets, (max_t, n), device)?,
        target_mask: Tensor::from_vec(target_mask, (max_t, n), device)?,
    })
}

/// Fixed-size batches over a dataset; the trailing partial batch is dropped
pub struct BatchLoader {
    dataset: Arc<dyn VqaDataset>,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    pad_id: u32,
    device: Device,
}

impl BatchLoader {
    pub fn new(
        dataset: Arc<dyn VqaDataset>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        pad_id: u32,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(VqaError::invalid("batch_size must be positive").into());
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            pad_id,
            device,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    /// Sample indices for each batch of one epoch
    pub fn epoch_plan(&mut self) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        order
            .chunks_exact(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Fetch and collate the samples at `indices`
    pub fn load(&self, indices: &[usize]) -> Result<VqaBatch> {
        let samples = indices
            .iter()
            .map(|&i| self.dataset.get(i))
            .collect::<Result<Vec<_>>>()
            .context("Failed to fetch batch samples")?;
        collate(&samples, self.pad_id, &self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::InMemoryDataset;

    fn sample(question: &[u32], target: &[u32]) -> VqaSample {
        VqaSample {
            input_ids: question.to_vec(),
            feats: vec![0.5; 2 * 3],
            boxes: vec![0.0; 2 * BOX_DIM],
            num_boxes: 2,
            target_ids: target.to_vec(),
        }
    }

    #[test]
    fn test_collate_pads_and_masks() -> Result<()> {
        let batch = collate(
            &[sample(&[5, 6, 7], &[8, 2]), sample(&[9], &[10, 11, 2])],
            0,
            &Device::Cpu,
        )?;

        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.input_ids.to_vec2::<u32>()?, vec![vec![5, 6, 7], vec![9, 0, 0]]);
        assert_eq!(
            batch.attention_mask.to_vec2::<u32>()?,
            vec![vec![1, 1, 1], vec![1, 0, 0]]
        );
        // Sequence-first targets
        assert_eq!(
            batch.targets.to_vec2::<u32>()?,
            vec![vec![8, 10], vec![2, 11], vec![0, 2]]
        );
        assert_eq!(
            batch.target_mask.to_vec2::<u32>()?,
            vec![vec![1, 1], vec![1, 1], vec![0, 1]]
        );
        assert_eq!(batch.feats.dims(), &[2, 2, 3]);
        assert_eq!(batch.boxes.dims(), &[2, 2, 4]);
        Ok(())
    }

    #[test]
    fn test_collate_rejects_mismatched_regions() {
        let mut odd = sample(&[1], &[2]);
        odd.num_boxes = 1;
        odd.feats = vec![0.0; 3];
        odd.boxes = vec![0.0; BOX_DIM];

        let err = collate(&[sample(&[1], &[2]), odd], 0, &Device::Cpu).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VqaError>(),
            Some(VqaError::MalformedInput { .. })
        ));
    }

    #[test]
    fn test_loader_drops_partial_batch() -> Result<()> {
        let samples = (0..7).map(|i| sample(&[i + 4], &[2])).collect();
        let dataset = Arc::new(InMemoryDataset::new(samples));
        let mut loader = BatchLoader::new(dataset, 3, false, 0, 0, Device::Cpu)?;

        assert_eq!(loader.num_batches(), 2);
        let plan = loader.epoch_plan();
        assert_eq!(plan, vec![vec![0, 1, 2], vec![3, 4, 5]]);

        let batch = loader.load(&plan[1])?;
        assert_eq!(batch.input_ids.to_vec2::<u32>()?, vec![vec![7], vec![8], vec![9]]);
        Ok(())
    }

    #[test]
    fn test_shuffled_plan_covers_full_batches() {
        let samples = (0..10).map(|i| sample(&[i + 4], &[2])).collect();
        let dataset = Arc::new(InMemoryDataset::new(samples));
        let mut loader = BatchLoader::new(dataset, 4, true, 7, 0, Device::Cpu).unwrap();

        let plan = loader.epoch_plan();
        assert_eq!(plan.len(), 2);
        let mut seen: Vec<usize> = plan.concat();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dataset = Arc::new(InMemoryDataset::default());
        assert!(BatchLoader::new(dataset, 0, false, 0, 0, Device::Cpu).is_err());
    }
}
