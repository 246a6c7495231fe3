use dpresnet::data::SyntheticDataset;
use dpresnet::nn::NormKind;
use dpresnet::{check_consistency, fit, ExperimentRecord, StemChoice, TrainConfig};

fn smoke_config() -> TrainConfig {
    let mut config = TrainConfig {
        step_size: 1e-2,
        epochs: 2,
        batch_size: 20,
        max_physical_batch_size: 8,
        clipping_threshold: 1.0,
        epsilon: 50.0,
        log_every: 1,
        eval_batch_size: 10,
        ..TrainConfig::default()
    };
    config.model.base_width = 2;
    config.model.blocks = vec![1, 1];
    config.model.stem = StemChoice::Cifar;
    config.model.num_classes = 2;
    config
}

fn data() -> (SyntheticDataset, SyntheticDataset) {
    let train = SyntheticDataset::new(60, 2, 3, 8, 0.3, 7).expect("valid dims");
    let test = SyntheticDataset::new(10, 2, 3, 8, 0.3, 7).expect("valid dims");
    (train, test)
}

#[test]
fn synthetic_run_trains_privately() {
    let config = smoke_config();
    let (train, test) = data();
    let run = fit(&config, &train, &test, false).expect("training succeeds");

    // BatchNorm in the config is swapped for GroupNorm before training.
    assert_eq!(run.model.config().norm, NormKind::GroupNorm { groups: 32 });

    let record = &run.record;
    assert_eq!(record.history.len(), 2);
    assert!(record.history.iter().all(|m| m.steps == 3));
    assert!(record.test_loss.is_finite() && record.test_loss > 0.0);
    assert!((0.0..=100.0).contains(&record.test_accuracy));

    let sigma = record.noise_multiplier.expect("calibrated");
    assert!(sigma > 0.0);
    let spent = record.spent_epsilon.expect("accounted");
    assert!(spent > 0.0 && spent <= config.epsilon);
    assert!(record.history[0].epsilon < record.history[1].epsilon);
}

#[test]
fn runs_are_deterministic_for_a_seed() {
    let config = smoke_config();
    let (train, test) = data();
    let a = fit(&config, &train, &test, false).expect("training succeeds");
    let b = fit(&config, &train, &test, false).expect("training succeeds");
    assert_eq!(a.record, b.record);
    assert_eq!(a.model.params(), b.model.params());
}

#[test]
fn record_survives_json_and_passes_checks() {
    let config = smoke_config();
    let (train, test) = data();
    let run = fit(&config, &train, &test, false).expect("training succeeds");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("record.json");
    run.record.write_json(&path).expect("write");
    let back = ExperimentRecord::read_json(&path).expect("read");
    assert_eq!(back, run.record);

    if run.record.test_accuracy > 0.0 && run.record.test_accuracy < 100.0 {
        check_consistency(std::slice::from_ref(&back)).expect("single run is consistent");
    }
}

#[test]
fn invalid_config_is_rejected_before_training() {
    let mut config = smoke_config();
    config.delta = 0.0;
    let (train, test) = data();
    assert!(fit(&config, &train, &test, false).is_err());
}
