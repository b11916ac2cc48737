// GenVQA dataset - samples served from a sampled-subset cache
//
// Each sample pairs an encoded question with region features of its image and
// the encoded first answer as the generation target.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::fsvqa::{read_subset, Annotation, Question};
use crate::errors::VqaError;
use crate::models::tokenizer::TextCodec;

/// Number of box coordinates per region
pub const BOX_DIM: usize = 4;

/// One training example before collation
#[derive(Debug, Clone, PartialEq)]
pub struct VqaSample {
    pub input_ids: Vec<u32>,
    /// Row-major (num_boxes, feature_dim)
    pub feats: Vec<f32>,
    /// Row-major (num_boxes, 4)
    pub boxes: Vec<f32>,
    pub num_boxes: usize,
    /// Answer ids terminated by the end id
    pub target_ids: Vec<u32>,
}

impl VqaSample {
    pub fn feature_dim(&self) -> usize {
        if self.num_boxes == 0 {
            0
        } else {
            self.feats.len() / self.num_boxes
        }
    }
}

pub trait VqaDataset: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<VqaSample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory dataset, mostly for tests and tiny experiments
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<VqaSample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<VqaSample>) -> Self {
        Self { samples }
    }
}

impl VqaDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<VqaSample> {
        self.samples
            .get(index)
            .cloned()
            .with_context(|| format!("Sample index {} out of range ({})", index, self.len()))
    }
}

/// Dataset over a cache directory written by the sampler
pub struct GenVqaDataset {
    annotations: Vec<Annotation>,
    questions: BTreeMap<u64, Question>,
    image_dir: PathBuf,
    codec: Arc<dyn TextCodec>,
    max_answer_len: usize,
}

impl GenVqaDataset {
    pub fn open(
        cache_dir: &Path,
        image_dir: &Path,
        codec: Arc<dyn TextCodec>,
        max_answer_len: usize,
    ) -> Result<Self> {
        if max_answer_len < 2 {
            return Err(VqaError::invalid("max_answer_len must be at least 2").into());
        }

        let subset = read_subset(cache_dir)
            .with_context(|| format!("Failed to open dataset cache {:?}", cache_dir))?;

        tracing::info!(
            cache = %cache_dir.display(),
            images = %image_dir.display(),
            samples = subset.annotations.len(),
            "Opened GenVQA dataset"
        );

        Ok(Self {
            annotations: subset.annotations,
            questions: subset.questions,
            image_dir: image_dir.to_path_buf(),
            codec,
            max_answer_len,
        })
    }

    fn feature_path(&self, image_id: u64) -> PathBuf {
        self.image_dir.join(format!("{}.safetensors", image_id))
    }
}

impl VqaDataset for GenVqaDataset {
    fn len(&self) -> usize {
        self.annotations.len()
    }

    fn get(&self, index: usize) -> Result<VqaSample> {
        let ann = self
            .annotations
            .get(index)
            .with_context(|| format!("Sample index {} out of range ({})", index, self.len()))?;
        let question = self
            .questions
            .get(&ann.question_id)
            .ok_or(VqaError::MissingReference {
                question_id: ann.question_id,
            })?;

        let input_ids = self.codec.encode(&question.question)?;

        let mut target_ids = self.codec.encode(ann.primary_answer().unwrap_or_default())?;
        target_ids.truncate(self.max_answer_len - 1);
        target_ids.push(self.codec.special_tokens().eos);

        let (feats, boxes, num_boxes) = load_region_features(&self.feature_path(ann.image_id))?;

        Ok(VqaSample {
            input_ids,
            feats,
            boxes,
            num_boxes,
            target_ids,
        })
    }
}

/// Read `feats` (B, D) and `boxes` (B, 4) from a safetensors file
pub fn load_region_features(path: &Path) -> Result<(Vec<f32>, Vec<f32>, usize)> {
    if !path.exists() {
        return Err(VqaError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "image feature file not found"),
        )
        .into());
    }

    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("Failed to read image features {:?}", path))?;

    let feats = tensors
        .get("feats")
        .ok_or_else(|| VqaError::malformed(path, "missing tensor `feats`"))?;
    let boxes = tensors
        .get("boxes")
        .ok_or_else(|| VqaError::malformed(path, "missing tensor `boxes`"))?;

    let (num_boxes, _) = feats
        .dims2()
        .map_err(|_| VqaError::malformed(path, format!("`feats` has shape {:?}", feats.dims())))?;
    if boxes.dims() != [num_boxes, BOX_DIM] {
        return Err(VqaError::malformed(
            path,
            format!(
                "`boxes` has shape {:?}, expected [{}, {}]",
                boxes.dims(),
                num_boxes,
                BOX_DIM
            ),
        )
        .into());
    }

    let feats = feats.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let boxes = boxes.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok((feats, boxes, num_boxes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fsvqa::{Answer, SampledSubset};
    use crate::data::sampler::save_subset;
    use crate::models::tokenizer::WordCodec;
    use candle_core::Tensor;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn write_features(dir: &Path, image_id: u64, num_boxes: usize, dim: usize) {
        let feats = Tensor::ones((num_boxes, dim), DType::F32, &Device::Cpu).unwrap();
        let boxes = Tensor::zeros((num_boxes, BOX_DIM), DType::F32, &Device::Cpu).unwrap();
        let tensors: HashMap<String, Tensor> =
            [("feats".to_string(), feats), ("boxes".to_string(), boxes)].into();
        candle_core::safetensors::save(&tensors, dir.join(format!("{}.safetensors", image_id)))
            .unwrap();
    }

    #[test]
    fn test_get_encodes_question_answer_and_features() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("cache");
        let images = tmp.path().join("img");
        std::fs::create_dir_all(&images).unwrap();

        let subset = SampledSubset {
            annotations: vec![Annotation {
                question_id: 1,
                image_id: 9,
                answers: vec![Answer {
                    answer: "there is a red double decker bus".to_string(),
                    answer_id: Some(1),
                }],
                answer_type: None,
                question_type: None,
            }],
            questions: [(
                1,
                Question {
                    question_id: 1,
                    image_id: 9,
                    question: "what is on the street".to_string(),
                },
            )]
            .into(),
        };
        save_subset(&subset, &cache).unwrap();
        write_features(&images, 9, 3, 5);

        let codec = Arc::new(WordCodec::from_texts([
            "what is on the street",
            "there is a red double decker bus",
        ]));
        let dataset = GenVqaDataset::open(&cache, &images, codec.clone(), 4).unwrap();
        assert_eq!(dataset.len(), 1);

        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.input_ids, codec.encode("what is on the street").unwrap());
        assert_eq!(sample.target_ids.len(), 4);
        assert_eq!(*sample.target_ids.last().unwrap(), WordCodec::EOS);
        assert_eq!(sample.num_boxes, 3);
        assert_eq!(sample.feature_dim(), 5);
        assert_eq!(sample.boxes.len(), 3 * BOX_DIM);
    }

    #[test]
    fn test_missing_feature_file_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = load_region_features(&tmp.path().join("404.safetensors")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VqaError>(),
            Some(VqaError::Io { .. })
        ));
    }

    #[test]
    fn test_bad_box_shape_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let feats = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let boxes = Tensor::zeros((2, 5), DType::F32, &Device::Cpu).unwrap();
        let tensors: HashMap<String, Tensor> =
            [("feats".to_string(), feats), ("boxes".to_string(), boxes)].into();
        let path = tmp.path().join("1.safetensors");
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let err = load_region_features(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VqaError>(),
            Some(VqaError::MalformedInput { .. })
        ));
    }
}
