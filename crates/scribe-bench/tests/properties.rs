//! Property-based tests for metrics, unit planning and record persistence

use proptest::prelude::*;

use scribe_bench::metrics::{bleu, length_ratio, perplexity};
use scribe_bench::{plan_units, BatchBenchmark, BatchStatus, BenchmarkTemplate};

fn sentence() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{1,6}", 1..12).prop_map(|words| words.join(" "))
}

proptest! {
    #[test]
    fn bleu_is_bounded(candidate in sentence(), reference in sentence()) {
        let score = bleu(&candidate, &reference);
        prop_assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn bleu_of_identical_text_is_one(text in sentence()) {
        prop_assert!((bleu(&text, &text) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn length_ratio_counts_words(candidate in sentence(), reference in sentence()) {
        let expected = candidate.split(' ').count() as f64 / reference.split(' ').count() as f64;
        prop_assert_eq!(length_ratio(&candidate, &reference), Some(expected));
    }

    #[test]
    fn perplexity_of_constant_logprob(lp in -10.0f32..0.0, n in 1usize..64) {
        let value = perplexity(&vec![lp; n]).unwrap();
        prop_assert!((value - f64::from(-lp).exp()).abs() < 1e-6 * value.max(1.0));
        prop_assert!(value >= 1.0);
    }

    #[test]
    fn plan_covers_every_pair_in_order(
        prompts in prop::collection::vec("[a-z]{1,8}", 0..6),
        model_count in 1usize..5,
    ) {
        let models: Vec<String> = (0..model_count).map(|i| format!("model-{i}")).collect();
        let template = BenchmarkTemplate::new("t", prompts.clone());
        let batch = BatchBenchmark::new("b", &template.id, models.clone());

        let units = plan_units(&batch, &template);
        prop_assert_eq!(units.len(), prompts.len() * model_count);
        for (i, unit) in units.iter().enumerate() {
            let model = &models[i / prompts.len().max(1)];
            prop_assert_eq!(&unit.model_id, model);
            prop_assert_eq!(unit.prompt_index, i % prompts.len().max(1));
            prop_assert_eq!(&unit.prompt, &prompts[unit.prompt_index]);
        }
    }

    #[test]
    fn template_survives_json(
        prompts in prop::collection::vec(".{0,40}", 0..5),
        with_references in any::<bool>(),
        runs in 1u32..10,
        temperature in 0.0f32..2.0,
        tags in prop::collection::btree_set("[a-z]{1,5}", 0..4),
    ) {
        let mut template = BenchmarkTemplate::new("t", prompts.clone())
            .with_num_runs(runs)
            .with_sampling(temperature, 0.9)
            .with_tags(tags);
        if with_references {
            template = template.with_reference_texts(prompts.iter().map(|p| p.to_uppercase()).collect());
        }

        let restored = BenchmarkTemplate::from_json(template.to_json().unwrap()).unwrap();
        prop_assert_eq!(restored, template);
    }

    #[test]
    fn batch_survives_json(
        models in prop::collection::vec("[a-z0-9-]{1,12}", 1..4),
        parallel in any::<bool>(),
        workers in 1usize..16,
        status in prop::sample::select(vec![
            BatchStatus::Pending,
            BatchStatus::Running,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Cancelled,
        ]),
    ) {
        let mut batch = BatchBenchmark::new("b", "template", models)
            .with_parallelism(parallel, workers);
        batch.status = status;
        let value = batch.to_json().unwrap();
        prop_assert_eq!(&value["status"], &serde_json::json!(status.as_str()));
        prop_assert_eq!(BatchBenchmark::from_json(value).unwrap(), batch);
    }
}
