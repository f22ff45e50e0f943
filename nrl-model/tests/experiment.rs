use nrl_model::{
    Dataset, ErrorRegression, ErrorRegressionConfig, JointLimits, ModelError, Network,
    NetworkConfig, OnlineSession, Sequence, Slot, Trainer, TrainingConfig,
};
use nrl_utils::read_rows;

fn dataset() -> Dataset {
    let limits = JointLimits::generic(vec![0.0, -10.0], vec![30.0, 10.0]).unwrap();
    let mut data = Dataset::new(&limits, &[], 10.0, 0.2).unwrap();
    let sample: Vec<Vec<f32>> = (0..8)
        .map(|t| {
            let t = t as f32;
            vec![15.0 + 10.0 * (t * 0.7).sin(), 8.0 * (t * 0.5).cos()]
        })
        .collect();
    data.push_primitive(vec![sample]).unwrap();
    data
}

fn trained_network(data: &Dataset) -> Network {
    let config = NetworkConfig {
        d: vec![4, 3],
        z: vec![2, 1],
        tau: vec![2.0, 5.0],
        w: vec![0.01, 0.01],
        w1: vec![],
        gen_time_thres: 3,
        seed: 21,
        noise: false,
    };
    let mut net = Network::new(config, data.shape()).unwrap();
    let encoded = data.encoded();
    let mut trainer = Trainer::new(
        TrainingConfig {
            epochs: 30,
            adam: nrl_model::Adam::new(0.01, 0.9, 0.999),
            ..Default::default()
        },
        None,
        0,
    );
    for _ in 0..30 {
        trainer.run_epoch(&mut net, &encoded).unwrap();
    }
    net
}

fn regression_config(store: bool) -> ErrorRegressionConfig {
    ErrorRegressionConfig {
        primitive: 0,
        window: 5,
        epochs: 20,
        w: vec![0.01, 0.01],
        num_times: 3,
        store_gen: store,
        store_inference: store,
        ..Default::default()
    }
}

fn observed(data: &Dataset) -> Sequence {
    data.encoded()[0][0].clone()
}

#[test]
fn test_postdiction_trace_and_window_shift() {
    let data = dataset();
    let mut net = trained_network(&data);
    let targets: Sequence = observed(&data)[..5].to_vec();
    let shared = net
        .params()
        .iter()
        .map(|(_, p)| p.export(Slot::Value))
        .collect::<Vec<_>>();

    let mut regression = ErrorRegression::new(regression_config(false));
    regression.enable(&mut net).unwrap();
    for _ in 0..4 {
        net.e_generate().unwrap();
    }
    assert_eq!(regression.postdict(&mut net, &targets).unwrap(), None);
    net.e_generate().unwrap();

    let report = regression.postdict(&mut net, &targets).unwrap().unwrap();
    assert_eq!(report.trace.len(), 20);
    assert_eq!(report.step, 21);
    assert!(report.best.is_finite());
    assert!(report.trace.windows(2).all(|w| w[1] <= w[0]));
    assert_eq!(report.trace.last().copied(), Some(report.best.loss));

    for layer in net.layers() {
        let (au, al) = layer.e_adaptive().unwrap();
        let (au_best, al_best) = layer.e_best_adaptive().unwrap();
        for i in 0..4 {
            assert_eq!(au.row(i), au_best.row(i + 1));
            assert_eq!(al.row(i), al_best.row(i + 1));
        }
        assert!(au.row(4).iter().all(|&v| v == 0.0));
        assert!(al.row(4).iter().all(|&v| v == 0.0));
    }

    let after = net
        .params()
        .iter()
        .map(|(_, p)| p.export(Slot::Value))
        .collect::<Vec<_>>();
    assert_eq!(shared, after);
}

#[test]
fn test_postdiction_requires_enabled_window() {
    let data = dataset();
    let mut net = trained_network(&data);
    let mut regression = ErrorRegression::new(regression_config(false));
    assert_eq!(
        regression.postdict(&mut net, &observed(&data)),
        Err(ModelError::ExperimentDisabled)
    );
    assert_eq!(net.e_generate(), Err(ModelError::ExperimentDisabled));

    regression.enable(&mut net).unwrap();
    for _ in 0..5 {
        net.e_generate().unwrap();
    }
    let too_long = observed(&data);
    assert!(matches!(
        regression.postdict(&mut net, &too_long),
        Err(ModelError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_oversized_window_fails_cleanly() {
    let data = dataset();
    let mut net = trained_network(&data);
    let mut config = regression_config(false);
    config.window = usize::MAX / 8;
    let mut regression = ErrorRegression::new(config);
    assert!(matches!(
        regression.enable(&mut net),
        Err(ModelError::AllocationFailed { .. })
    ));
    assert!(!net.e_enabled());
    assert!(net.layers().iter().all(|layer| !layer.e_enabled()));
}

#[test]
fn test_online_session_stores_states() {
    let data = dataset();
    let mut net = trained_network(&data);
    let frames = observed(&data);
    let mut session = OnlineSession::start(&mut net, regression_config(true)).unwrap();

    for (t, frame) in frames.iter().enumerate() {
        let predicted = session.predict(&mut net).unwrap();
        assert_eq!(predicted.len(), 2);
        let report = session.observe(&mut net, frame.clone()).unwrap();
        assert_eq!(report.is_some(), t >= 4, "step {}", t);
    }
    assert_eq!(session.regression().step(), 1 + 4 * 20);

    let state = net.e_state().unwrap();
    assert_eq!(state.len(), net.state_dim());

    let dir = std::env::temp_dir().join(format!("nrl_model_estore_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    net.e_save(&dir).unwrap();
    for layer in net.layers() {
        for name in ["gen", "inf"] {
            let rows = read_rows(dir.join(format!("L{}_e_{}.d", layer.id(), name))).unwrap();
            assert_eq!(rows.len(), 3);
            assert!(rows.iter().all(|row| row.len() == layer.state_dim()));
        }
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_prediction_from_saved_state() {
    let data = dataset();
    let mut net = trained_network(&data);
    let frames = observed(&data);
    let mut session = OnlineSession::start(&mut net, regression_config(false)).unwrap();
    for frame in &frames[..6] {
        session.predict(&mut net).unwrap();
        session.observe(&mut net, frame.clone()).unwrap();
    }
    let state = net.e_state().unwrap();
    net.e_disable();

    assert!(matches!(
        net.a_init(&state[1..]),
        Err(ModelError::DimensionMismatch { .. })
    ));
    net.a_init(&state).unwrap();
    let predicted = net.a_predict(6);
    assert_eq!(predicted.len(), 6);
    for frame in &predicted {
        for dist in frame {
            assert!((dist.sum() - 1.0).abs() < 1e-5);
        }
    }
    let decoded = data.decode_frame(&predicted[0]);
    assert_eq!(decoded.len(), 2);
    assert!(decoded[0] >= 0.0 && decoded[0] <= 30.0);
    assert!(decoded[1] >= -10.0 && decoded[1] <= 10.0);
}
