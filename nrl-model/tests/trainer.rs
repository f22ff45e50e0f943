use nrl_model::{
    trainer::{read_epoch_file, EPOCH_FILE, TRAINING_LOG},
    Dataset, JointLimits, Network, NetworkConfig, Trainer, TrainingConfig,
};
use std::path::PathBuf;

fn dataset() -> Dataset {
    let limits = JointLimits::generic(vec![0.0], vec![40.0]).unwrap();
    let mut data = Dataset::new(&limits, &[], 10.0, 0.2).unwrap();
    for offset in [5.0, 20.0] {
        let sample = (0..6).map(|t| vec![offset + 2.0 * t as f32]).collect();
        data.push_primitive(vec![sample]).unwrap();
    }
    data
}

fn network(data: &Dataset) -> Network {
    Network::new(
        NetworkConfig {
            d: vec![4],
            z: vec![1],
            tau: vec![2.0],
            w: vec![0.01],
            w1: vec![],
            gen_time_thres: 2,
            seed: 8,
            noise: true,
        },
        data.shape(),
    )
    .unwrap()
}

fn model_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("nrl_model_trainer_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[test]
fn test_training_writes_log_and_checkpoint() {
    let data = dataset();
    let mut net = network(&data);
    let dir = model_dir("log");
    let mut trainer = Trainer::new(
        TrainingConfig {
            epochs: 6,
            greedy: false,
            log_interval: 2,
            ..Default::default()
        },
        Some(dir.clone()),
        1,
    );
    let reports = trainer.train(&mut net, &data.encoded()).unwrap();
    assert_eq!(reports.iter().map(|r| r.epoch).collect::<Vec<_>>(), vec![2, 4, 6]);
    assert!(reports.iter().all(|r| r.saved && r.loss.is_finite() && r.rec_gen.is_finite()));

    let log = std::fs::read_to_string(dir.join(TRAINING_LOG)).unwrap();
    assert_eq!(log.lines().count(), 3);
    assert!(log.lines().last().unwrap().starts_with("6, "));

    let (step, loss) = read_epoch_file(&dir).unwrap();
    assert_eq!(step, 6);
    assert_eq!(loss, reports[2].loss);
    assert!(dir.join(EPOCH_FILE).exists());
    assert!(dir.join("L0_au_p.d").exists());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_retraining_resumes_step_counter() {
    let data = dataset();
    let dir = model_dir("resume");
    let mut first = Trainer::new(
        TrainingConfig {
            epochs: 3,
            greedy: false,
            ..Default::default()
        },
        Some(dir.clone()),
        1,
    );
    let mut net = network(&data);
    first.train(&mut net, &data.encoded()).unwrap();

    let mut resumed = Trainer::new(
        TrainingConfig {
            epochs: 2,
            greedy: false,
            retrain: true,
            ..Default::default()
        },
        Some(dir.clone()),
        1,
    );
    let mut fresh = network(&data);
    let reports = resumed.train(&mut fresh, &data.encoded()).unwrap();
    assert_eq!(reports.first().map(|r| r.epoch), Some(4));
    assert_eq!(resumed.step(), 5);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_retraining_without_checkpoint_fails() {
    let data = dataset();
    let mut net = network(&data);
    let mut trainer = Trainer::new(
        TrainingConfig {
            retrain: true,
            ..Default::default()
        },
        Some(model_dir("empty")),
        1,
    );
    assert!(trainer.train(&mut net, &data.encoded()).is_err());

    let mut detached = Trainer::new(
        TrainingConfig {
            retrain: true,
            ..Default::default()
        },
        None,
        1,
    );
    assert!(detached.resume(&mut net).is_err());
}

#[test]
fn test_greedy_saves_only_improvements() {
    let data = dataset();
    let mut net = network(&data);
    let mut trainer = Trainer::new(
        TrainingConfig {
            epochs: 5,
            ..Default::default()
        },
        None,
        1,
    );
    let reports = trainer.train(&mut net, &data.encoded()).unwrap();
    assert_eq!(reports.len(), 5);
    assert!(reports.iter().all(|r| !r.saved));
    let best = reports.iter().map(|r| r.loss).fold(f32::INFINITY, f32::min);
    assert_eq!(trainer.best_loss(), best);
}
