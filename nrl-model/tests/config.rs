use nrl_model::{ErrorRegressionConfig, ModelConfig, ModelError, Network, NetworkConfig};
use nrl_utils::Properties;
use std::path::PathBuf;

const PROPERTIES: &str = "
# model
modelpath = out/model
datapath = data/set1
network = PVRNN
robot = generic
epochs = 200
greedy = 0
shuffle = true
d = 20, 10
z = 2, 1
t = 2, 8
w = 0.01, 0.005   # KL weights
jmin = -1, -1
jmax = 1, 1
";

#[test]
fn test_properties_fill_the_configuration() {
    let props = Properties::parse(PROPERTIES).unwrap();
    let config = ModelConfig::from_properties(&props).unwrap();
    assert_eq!(config.modelpath, PathBuf::from("out/model"));
    assert_eq!(config.datapath, PathBuf::from("data/set1"));
    assert_eq!(config.epochs, 200);
    assert!(!config.greedy);
    assert!(config.shuffle);
    assert_eq!(config.d, vec![20, 10]);
    assert_eq!(config.t, vec![2.0, 8.0]);
    assert_eq!(config.w, vec![0.01, 0.005]);
    assert_eq!(config.alpha, 0.001);
    assert_eq!(config.gen_time_thres, 3);

    let net_config = config.network_config().unwrap();
    assert_eq!(net_config.tau, vec![2.0, 8.0]);
    assert!(net_config.w1.is_empty());

    let training = config.training_config();
    assert_eq!(training.epochs, 200);
    assert_eq!(training.adam.beta2, 0.999);

    let data = config.dataset().unwrap();
    assert_eq!(data.n_units_per_dim(), vec![1, 1]);
}

#[test]
fn test_malformed_values_name_the_key() {
    let props = Properties::parse("epochs = many\n").unwrap();
    match ModelConfig::from_properties(&props) {
        Err(ModelError::InvalidConfig { key, .. }) => assert_eq!(key, "epochs"),
        other => panic!("unexpected {:?}", other),
    }
    let props = Properties::parse("noise = maybe\n").unwrap();
    assert!(ModelConfig::from_properties(&props).is_err());
}

#[test]
fn test_unsupported_network_is_rejected() {
    let config = ModelConfig {
        network: "lstm".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        config.network_config(),
        Err(ModelError::InvalidConfig { .. })
    ));
}

#[test]
fn test_layer_lists_must_agree() {
    let props = Properties::parse(&PROPERTIES.replace("t = 2, 8", "t = 2")).unwrap();
    let config = ModelConfig::from_properties(&props).unwrap();
    let mut data = config.dataset().unwrap();
    data.push_primitive(vec![vec![vec![0.0, 0.0]; 4]]).unwrap();
    assert_eq!(
        Network::new(config.network_config().unwrap(), data.shape()).err(),
        Some(ModelError::ChecksumMismatch {
            key: "t".to_string(),
            expected: 2,
            actual: 1
        })
    );
}

#[test]
fn test_json_configuration() {
    let path = std::env::temp_dir().join(format!("nrl_model_config_{}.json", std::process::id()));
    std::fs::write(&path, r#"{"d": [4], "z": [1], "t": [2.0], "w": [0.1], "robot": "cartesian"}"#)
        .unwrap();
    let config = ModelConfig::load(path.to_str().unwrap()).unwrap();
    assert_eq!(config.d, vec![4]);
    assert_eq!(config.joint_limits().unwrap().dof(), 3);
    assert_eq!(config.epochs, 1000);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_serde_defaults() {
    let er: ErrorRegressionConfig = serde_json::from_str(r#"{"window": 4, "w": [0.1]}"#).unwrap();
    assert_eq!(er.window, 4);
    assert_eq!(er.epochs, 50);
    assert_eq!(er.adam.alpha, 0.1);

    let net: NetworkConfig = serde_json::from_str(
        r#"{"d": [2], "z": [1], "tau": [2.0], "w": [0.1], "gen_time_thres": 3, "seed": 0, "noise": true}"#,
    )
    .unwrap();
    assert!(net.w1.is_empty());
}
