use nrl_model::{dataset::DEFAULT_PREFIX, Dataset, JointLimits, ModelError};

#[test]
fn test_units_per_dim_follow_range() {
    let limits = JointLimits::generic(vec![0.0, -5.0], vec![30.0, 0.0]).unwrap();
    let data = Dataset::new(&limits, &[], 10.0, 0.2).unwrap();
    assert_eq!(data.n_units_per_dim(), vec![3, 1]);
    assert_eq!(data.active_joints(), &[0, 1]);

    let torobo = Dataset::new(&JointLimits::torobo(), &[0, 12], 10.0, 0.2).unwrap();
    assert_eq!(torobo.n_units_per_dim(), vec![31, 15]);
}

#[test]
fn test_encoding_is_a_distribution() {
    let limits = JointLimits::cartesian();
    let data = Dataset::new(&limits, &[], 10.0, 0.1).unwrap();
    for x in [-50.0, -12.5, 0.0, 33.0, 50.0] {
        let frame = data.encode_frame(&[x, x, x]);
        assert_eq!(frame.len(), 3);
        for dist in &frame {
            assert_eq!(dist.len(), 10);
            assert!((dist.sum() - 1.0).abs() < 1e-5);
            assert!(dist.iter().all(|&p| p >= 0.0));
        }
    }
}

#[test]
fn test_decode_recovers_interior_values() {
    let limits = JointLimits::generic(vec![0.0], vec![100.0]).unwrap();
    let data = Dataset::new(&limits, &[], 2.0, 0.05).unwrap();
    for x in [30.0, 47.3, 55.0, 70.0] {
        let frame = data.encode_frame(&[x]);
        let decoded = data.decode_frame(&frame);
        assert!((decoded[0] - x).abs() < 0.5, "{} decoded as {}", x, decoded[0]);
    }
}

#[test]
fn test_rows_select_active_joints() {
    let limits = JointLimits::cartesian();
    let mut data = Dataset::new(&limits, &[0, 2], 10.0, 0.2).unwrap();
    data.push_primitive(vec![vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]])
        .unwrap();
    data.push_primitive(vec![vec![vec![7.0, 9.0], vec![10.0, 12.0]]])
        .unwrap();
    assert_eq!(data.raw(0).unwrap()[0], vec![vec![1.0, 3.0], vec![4.0, 6.0]]);
    assert_eq!(data.raw(1).unwrap()[0], vec![vec![7.0, 9.0], vec![10.0, 12.0]]);
    assert_eq!(data.shape().prim_num, 2);
    assert_eq!(data.shape().prim_len, 2);

    assert!(matches!(
        data.push_primitive(vec![vec![vec![1.0], vec![2.0]]]),
        Err(ModelError::InvalidDataset { .. })
    ));
    assert!(matches!(
        data.push_primitive(vec![vec![vec![1.0, 2.0]]]),
        Err(ModelError::InvalidDataset { .. })
    ));
    assert!(data.encode_softmax(&[vec![1.0]]).is_err());
}

#[test]
fn test_load_dir_reads_every_primitive() {
    let dir = std::env::temp_dir().join(format!("nrl_model_dataset_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    for p in 0..2 {
        for s in 0..2 {
            let text = format!("{0},1,2\n{0} 3 4\n{0},5,6\n", p * 10 + s);
            std::fs::write(dir.join(format!("{}_{}_{}.csv", DEFAULT_PREFIX, p, s)), text).unwrap();
        }
    }
    let limits = JointLimits::cartesian();
    let mut data = Dataset::new(&limits, &[], 10.0, 0.2).unwrap();
    data.load_dir(&dir, DEFAULT_PREFIX, 2).unwrap();
    assert_eq!(data.n_prim(), 2);
    assert_eq!(data.prim_length(), 3);
    let encoded = data.encoded();
    assert_eq!(encoded.len(), 2);
    assert_eq!(encoded[1].len(), 2);
    assert_eq!(encoded[1][1][2].len(), 3);

    let mut empty = Dataset::new(&limits, &[], 10.0, 0.2).unwrap();
    assert!(matches!(
        empty.load_dir(&dir, "missing", 1),
        Err(ModelError::InvalidDataset { .. })
    ));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_robot_limits() {
    assert_eq!(JointLimits::torobo().dof(), 16);
    assert_eq!(JointLimits::cartesian().range(1), 100.0);
    assert!(JointLimits::by_name("TOROBO", &[], &[]).is_ok());
    assert!(JointLimits::by_name("unknown", &[], &[]).is_err());
    assert!(JointLimits::generic(vec![1.0], vec![1.0]).is_err());
    assert!(JointLimits::generic(vec![0.0, 0.0], vec![1.0]).is_err());
    assert!(Dataset::new(&JointLimits::cartesian(), &[3], 10.0, 0.2).is_err());
}
