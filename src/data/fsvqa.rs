// FSVQA records and the sampled-subset cache format

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::errors::{IoContext, VqaError, VqaResult};

/// Sampled annotations file inside a cache directory (written last)
pub const ANNOTATIONS_FILENAME: &str = "annotations.pickle";
/// Question mapping file inside a cache directory
pub const QUESTIONS_FILENAME: &str = "questions.pickle";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    #[serde(default)]
    pub answer_id: Option<u32>,
}

/// One annotated instance: image, question reference, ground-truth answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub question_id: u64,
    pub image_id: u64,
    #[serde(default)]
    pub answers: Vec<Answer>,
    #[serde(default)]
    pub answer_type: Option<String>,
    #[serde(default)]
    pub question_type: Option<String>,
}

impl Annotation {
    /// First ground-truth answer, used as the generation target
    pub fn primary_answer(&self) -> Option<&str> {
        self.answers.first().map(|a| a.answer.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question_id: u64,
    pub image_id: u64,
    pub question: String,
}

/// Top-level shape of the annotations JSON
#[derive(Debug, Deserialize)]
pub(crate) struct AnnotationDocument {
    pub annotations: Vec<Annotation>,
}

/// Top-level shape of the questions JSON
#[derive(Debug, Deserialize)]
pub(crate) struct QuestionDocument {
    pub questions: Vec<Question>,
}

/// K annotations drawn with replacement plus the questions they reference
#[derive(Debug, Clone, PartialEq)]
pub struct SampledSubset {
    pub annotations: Vec<Annotation>,
    pub questions: BTreeMap<u64, Question>,
}

impl SampledSubset {
    /// Every annotation must resolve in the question mapping
    pub fn check_references(&self) -> VqaResult<()> {
        match self
            .annotations
            .iter()
            .find(|a| !self.questions.contains_key(&a.question_id))
        {
            Some(missing) => Err(VqaError::MissingReference {
                question_id: missing.question_id,
            }),
            None => Ok(()),
        }
    }
}

pub(crate) fn encode<T: Serialize>(value: &T, path: &Path) -> VqaResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| {
        VqaError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        )
    })
}

fn decode<T: for<'de> Deserialize<'de>>(path: &Path) -> VqaResult<T> {
    let bytes = fs::read(path).at_path(path)?;
    bincode::deserialize(&bytes).map_err(|e| VqaError::malformed(path, e))
}

/// Read a cache directory written by the sampler
///
/// A directory without `annotations.pickle` is an incomplete cache and fails
/// with an I/O error, even if `questions.pickle` is present.
pub fn read_subset(dir: &Path) -> VqaResult<SampledSubset> {
    let annotations: Vec<Annotation> = decode(&dir.join(ANNOTATIONS_FILENAME))?;
    let questions: BTreeMap<u64, Question> = decode(&dir.join(QUESTIONS_FILENAME))?;

    let subset = SampledSubset {
        annotations,
        questions,
    };
    subset.check_references()?;
    Ok(subset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_json_ignores_unknown_fields() {
        let json = r#"{
            "question_id": 42, "image_id": 7,
            "answers": [{"answer": "a red bus", "answer_id": 1, "answer_confidence": "yes"}],
            "multiple_choice_answer": "bus"
        }"#;
        let ann: Annotation = serde_json::from_str(json).unwrap();
        assert_eq!(ann.question_id, 42);
        assert_eq!(ann.primary_answer(), Some("a red bus"));
        assert_eq!(ann.answer_type, None);
    }

    #[test]
    fn test_check_references_reports_first_missing_id() {
        let subset = SampledSubset {
            annotations: vec![Annotation {
                question_id: 3,
                image_id: 1,
                answers: vec![],
                answer_type: None,
                question_type: None,
            }],
            questions: BTreeMap::new(),
        };
        match subset.check_references() {
            Err(VqaError::MissingReference { question_id }) => assert_eq!(question_id, 3),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
