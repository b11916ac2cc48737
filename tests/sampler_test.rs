// Integration tests for FSVQA sampling and the cache round trip

use anyhow::Result;
use genvqa::data::{
    read_subset, FsvqaSampler, ANNOTATIONS_FILENAME, QUESTIONS_FILENAME, SAMPLER_CHANNEL,
};
use genvqa::logging::{FileRunLog, TracingRunLog};
use genvqa::VqaError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write an FSVQA-shaped corpus with `n` annotations; `orphans` reference missing questions
fn write_corpus(dir: &Path, n: u64, orphans: &[u64]) -> Result<(PathBuf, PathBuf)> {
    let annotations: Vec<_> = (1..=n)
        .map(|id| {
            json!({
                "question_id": id,
                "image_id": 1000 + id,
                "answers": [{"answer": format!("answer number {}", id), "answer_id": 1}],
                "answer_type": "other",
                "question_type": "what is"
            })
        })
        .collect();
    let questions: Vec<_> = (1..=n)
        .filter(|id| !orphans.contains(id))
        .map(|id| {
            json!({
                "question_id": id,
                "image_id": 1000 + id,
                "question": format!("what is in picture {}?", id)
            })
        })
        .collect();

    let ann_path = dir.join("annotations.json");
    let q_path = dir.join("questions.json");
    fs::write(&ann_path, serde_json::to_vec(&json!({ "annotations": annotations }))?)?;
    fs::write(&q_path, serde_json::to_vec(&json!({ "questions": questions }))?)?;
    Ok((ann_path, q_path))
}

#[test]
fn test_sample_five_of_ten() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ann, q) = write_corpus(tmp.path(), 10, &[])?;
    let out = tmp.path().join("subset");

    let sampler = FsvqaSampler::load(&ann, &q)?;
    assert_eq!(sampler.annotation_count(), 10);
    assert_eq!(sampler.question_count(), 10);
    let mut rng = StdRng::seed_from_u64(8956);
    let subset = sampler.select_and_save(5, &out, &mut rng, &TracingRunLog::new(SAMPLER_CHANNEL))?;

    assert_eq!(subset.annotations.len(), 5);
    assert!((1..=5).contains(&subset.questions.len()));

    // Keys are exactly the distinct referenced ids
    let mut referenced: Vec<u64> = subset.annotations.iter().map(|a| a.question_id).collect();
    referenced.sort_unstable();
    referenced.dedup();
    let keys: Vec<u64> = subset.questions.keys().copied().collect();
    assert_eq!(keys, referenced);

    // Every id resolves after the round trip
    let restored = read_subset(&out)?;
    assert_eq!(restored, subset);
    for ann in &restored.annotations {
        assert_eq!(restored.questions[&ann.question_id].question_id, ann.question_id);
    }
    Ok(())
}

#[test]
fn test_zero_k_writes_nothing() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ann, q) = write_corpus(tmp.path(), 10, &[])?;
    let out = tmp.path().join("subset");

    let sampler = FsvqaSampler::load(&ann, &q)?;
    let mut rng = StdRng::seed_from_u64(1);
    let err = sampler
        .select_and_save(0, &out, &mut rng, &TracingRunLog::new(SAMPLER_CHANNEL))
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<VqaError>(),
        Some(VqaError::InvalidArgument(_))
    ));
    assert!(!out.join(ANNOTATIONS_FILENAME).exists());
    assert!(!out.join(QUESTIONS_FILENAME).exists());
    Ok(())
}

#[test]
fn test_missing_question_reference() -> Result<()> {
    let tmp = TempDir::new()?;
    // Every annotation is an orphan, so any draw hits a missing reference
    let (ann, q) = write_corpus(tmp.path(), 3, &[1, 2, 3])?;
    let out = tmp.path().join("subset");

    let sampler = FsvqaSampler::load(&ann, &q)?;
    let mut rng = StdRng::seed_from_u64(3);
    let err = sampler
        .select_and_save(2, &out, &mut rng, &TracingRunLog::new(SAMPLER_CHANNEL))
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<VqaError>(),
        Some(VqaError::MissingReference { .. })
    ));
    assert!(!out.join(ANNOTATIONS_FILENAME).exists());
    assert!(!out.join(QUESTIONS_FILENAME).exists());
    Ok(())
}

#[test]
fn test_same_seed_same_sample() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ann, q) = write_corpus(tmp.path(), 50, &[])?;
    let sampler = FsvqaSampler::load(&ann, &q)?;

    let draw = |seed| sampler.sample(20, &mut StdRng::seed_from_u64(seed));
    assert_eq!(draw(42)?, draw(42)?);
    Ok(())
}

#[test]
fn test_resampling_replaces_cache_and_logs() -> Result<()> {
    let tmp = TempDir::new()?;
    let (ann, q) = write_corpus(tmp.path(), 10, &[])?;
    let out = tmp.path().join("subset");
    let log = FileRunLog::new(&tmp.path().join("logs"), SAMPLER_CHANNEL)?;

    let sampler = FsvqaSampler::load(&ann, &q)?;
    sampler.select_and_save(8, &out, &mut StdRng::seed_from_u64(1), &log)?;
    let second = sampler.select_and_save(3, &out, &mut StdRng::seed_from_u64(2), &log)?;

    assert_eq!(read_subset(&out)?, second);

    let lines = fs::read_to_string(log.path())?;
    assert_eq!(lines.lines().count(), 2);
    assert!(lines.contains("with 3 instances"));
    Ok(())
}

#[test]
fn test_malformed_corpus_rejected() -> Result<()> {
    let tmp = TempDir::new()?;
    let (_, q) = write_corpus(tmp.path(), 2, &[])?;
    let bad = tmp.path().join("bad.json");
    fs::write(&bad, r#"{"annotations": [{"image_id": 1}]}"#)?;

    let err = FsvqaSampler::load(&bad, &q).err().expect("schema error");
    assert!(matches!(err, VqaError::MalformedInput { .. }));
    Ok(())
}
