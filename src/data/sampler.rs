// FSVQA subset sampler
//
// Draws K annotations with replacement from the full corpus and caches them,
// together with the questions they reference, for the training datasets.

use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use super::fsvqa::{
    encode, Annotation, AnnotationDocument, Question, QuestionDocument, SampledSubset,
    ANNOTATIONS_FILENAME, QUESTIONS_FILENAME,
};
use crate::errors::{IoContext, VqaError, VqaResult};
use crate::logging::RunLog;

/// Channel used for sampler run-log lines
pub const SAMPLER_CHANNEL: &str = "fsvqa_sampler";

/// Full FSVQA corpus held in memory
pub struct FsvqaSampler {
    annotations: Vec<Annotation>,
    questions: HashMap<u64, Question>,
}

impl FsvqaSampler {
    /// Parse the annotations and questions documents
    pub fn load(annotations_path: &Path, questions_path: &Path) -> VqaResult<Self> {
        let annotations = read_json::<AnnotationDocument>(annotations_path)?.annotations;
        let questions = read_json::<QuestionDocument>(questions_path)?.questions;

        let mut seen = HashSet::with_capacity(annotations.len());
        for ann in &annotations {
            if !seen.insert(ann.question_id) {
                return Err(VqaError::malformed(
                    annotations_path,
                    format!("duplicate question_id {}", ann.question_id),
                ));
            }
        }

        let mut by_id = HashMap::with_capacity(questions.len());
        for question in questions {
            let id = question.question_id;
            if by_id.insert(id, question).is_some() {
                return Err(VqaError::malformed(
                    questions_path,
                    format!("duplicate question_id {}", id),
                ));
            }
        }

        tracing::info!(
            annotations = annotations.len(),
            questions = by_id.len(),
            "Loaded FSVQA corpus"
        );

        Ok(Self::from_parts(annotations, by_id))
    }

    pub fn from_parts(annotations: Vec<Annotation>, questions: HashMap<u64, Question>) -> Self {
        Self {
            annotations,
            questions,
        }
    }

    pub fn annotation_count(&self) -> usize {
        self.annotations.len()
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    /// Draw `k` annotations with replacement and collect their questions
    pub fn sample<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> VqaResult<SampledSubset> {
        if k == 0 {
            return Err(VqaError::invalid("sample size k must be positive"));
        }
        if self.annotations.is_empty() {
            return Err(VqaError::invalid(
                "cannot sample from an empty annotation pool",
            ));
        }

        let mut annotations = Vec::with_capacity(k);
        let mut questions = BTreeMap::new();
        for _ in 0..k {
            let ann = &self.annotations[rng.gen_range(0..self.annotations.len())];
            let question = self
                .questions
                .get(&ann.question_id)
                .ok_or(VqaError::MissingReference {
                    question_id: ann.question_id,
                })?;
            questions
                .entry(ann.question_id)
                .or_insert_with(|| question.clone());
            annotations.push(ann.clone());
        }

        Ok(SampledSubset {
            annotations,
            questions,
        })
    }

    /// Sample `k` instances and persist them under `output_dir`
    pub fn select_and_save<R: Rng + ?Sized>(
        &self,
        k: usize,
        output_dir: &Path,
        rng: &mut R,
        run_log: &dyn RunLog,
    ) -> anyhow::Result<SampledSubset> {
        let subset = self.sample(k, rng)?;
        save_subset(&subset, output_dir)?;

        run_log.log(&format!(
            "Generated new pickle files at {} with {} instances.",
            output_dir.display(),
            k
        ))?;

        Ok(subset)
    }
}

/// Write both cache files as a unit
///
/// Payloads are encoded before anything touches the disk. The stale
/// annotations file is removed first and the new one is renamed into place
/// last, so its presence marks a complete cache.
pub fn save_subset(subset: &SampledSubset, output_dir: &Path) -> VqaResult<()> {
    subset.check_references()?;

    let annotations_path = output_dir.join(ANNOTATIONS_FILENAME);
    let questions_path = output_dir.join(QUESTIONS_FILENAME);
    let annotation_bytes = encode(&subset.annotations, &annotations_path)?;
    let question_bytes = encode(&subset.questions, &questions_path)?;

    fs::create_dir_all(output_dir).at_path(output_dir)?;

    let annotations_tmp = write_temp(output_dir, &annotation_bytes)?;
    let questions_tmp = write_temp(output_dir, &question_bytes)?;

    match fs::remove_file(&annotations_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(VqaError::io(&annotations_path, e)),
    }
    questions_tmp
        .persist(&questions_path)
        .map_err(|e| VqaError::io(&questions_path, e.error))?;
    annotations_tmp
        .persist(&annotations_path)
        .map_err(|e| VqaError::io(&annotations_path, e.error))?;

    tracing::info!(
        dir = %output_dir.display(),
        annotations = subset.annotations.len(),
        questions = subset.questions.len(),
        "Saved sampled subset"
    );
    Ok(())
}

fn write_temp(dir: &Path, bytes: &[u8]) -> VqaResult<NamedTempFile> {
    let mut file = NamedTempFile::new_in(dir).at_path(dir)?;
    file.write_all(bytes).at_path(file.path())?;
    file.as_file().sync_all().at_path(file.path())?;
    Ok(file)
}

fn read_json<T: for<'de> serde::Deserialize<'de>>(path: &Path) -> VqaResult<T> {
    let contents = fs::read_to_string(path).at_path(path)?;
    serde_json::from_str(&contents).map_err(|e| VqaError::malformed(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn corpus(n: u64) -> FsvqaSampler {
        let annotations = (0..n)
            .map(|id| Annotation {
                question_id: id,
                image_id: id * 10,
                answers: vec![],
                answer_type: None,
                question_type: None,
            })
            .collect();
        let questions = (0..n)
            .map(|id| {
                (
                    id,
                    Question {
                        question_id: id,
                        image_id: id * 10,
                        question: format!("question {}", id),
                    },
                )
            })
            .collect();
        FsvqaSampler::from_parts(annotations, questions)
    }

    #[test]
    fn test_sample_collapses_duplicate_questions() {
        let sampler = corpus(3);
        let mut rng = StdRng::seed_from_u64(1);
        let subset = sampler.sample(50, &mut rng).unwrap();

        assert_eq!(subset.annotations.len(), 50);
        let referenced: std::collections::BTreeSet<u64> =
            subset.annotations.iter().map(|a| a.question_id).collect();
        let keys: std::collections::BTreeSet<u64> = subset.questions.keys().copied().collect();
        assert_eq!(referenced, keys);
    }

    #[test]
    fn test_sample_rejects_zero_k() {
        let sampler = corpus(3);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            sampler.sample(0, &mut rng),
            Err(VqaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_sample_rejects_empty_pool() {
        let sampler = FsvqaSampler::from_parts(vec![], HashMap::new());
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            sampler.sample(4, &mut rng),
            Err(VqaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_sample_is_deterministic_for_seed() {
        let sampler = corpus(20);
        let a = sampler.sample(8, &mut StdRng::seed_from_u64(8956)).unwrap();
        let b = sampler.sample(8, &mut StdRng::seed_from_u64(8956)).unwrap();
        assert_eq!(a, b);
    }
}
