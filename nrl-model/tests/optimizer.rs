use ndarray::{array, Array1};
use nrl_model::{
    utils::{kl_divergence, kl_divergence_units, softmax, try_zeros, Noise},
    Adam, ModelError, Optimizable, Param, Slot,
};

#[test]
fn test_adam_ignores_zero_gradients() {
    let adam = Adam::default();
    let mut param = Param::new(array![[0.5f32, -1.0], [2.0, 0.0]]);
    let before = param.value.clone();
    for step in 1..=5 {
        param.adam_step(&adam, step);
    }
    assert_eq!(param.value, before);
    assert!(param.m.iter().all(|&m| m == 0.0));
    assert!(param.v.iter().all(|&v| v == 0.0));
}

#[test]
fn test_adam_first_step_moves_by_alpha() {
    let adam = Adam::new(0.1, 0.9, 0.999);
    let mut param = Param::new(array![1.0f32, 1.0, 1.0]);
    param.grad = array![3.0, -0.5, 0.0];
    param.adam_step(&adam, 1);
    assert!((param.value[0] - 0.9).abs() < 1e-6);
    assert!((param.value[1] - 1.1).abs() < 1e-6);
    assert_eq!(param.value[2], 1.0);

    param.zero_grad();
    assert_eq!(param.gradient(), vec![0.0; 3]);
    assert_eq!(param.export(Slot::FirstMoment).len(), 3);
    assert_eq!(param.row_len(), 3);
}

#[test]
fn test_kl_of_identical_gaussians_is_zero() {
    let u = array![0.3f32, -0.7, 0.0];
    let s = array![0.5f32, 1.0, 2.0];
    assert_eq!(kl_divergence(u.view(), s.view(), u.view(), s.view()), 0.0);

    let per_unit = kl_divergence_units(
        array![0.0f32].view(),
        array![1.0f32].view(),
        array![1.0f32].view(),
        array![1.0f32].view(),
    );
    assert!((per_unit[0] - 0.5).abs() < 1e-6);
    assert!(kl_divergence(u.view(), s.view(), (&u + 0.1).view(), s.view()) > 0.0);
}

#[test]
fn test_softmax_is_stable() {
    let p = softmax(&array![1000.0f32, 1000.0, -1000.0]);
    assert!((p.sum() - 1.0).abs() < 1e-6);
    assert!((p[0] - 0.5).abs() < 1e-6);
    assert_eq!(p[2], 0.0);
}

#[test]
fn test_disabled_noise_is_zero() {
    let mut noise = Noise::disabled(1);
    assert_eq!(noise.sample(4), Array1::<f32>::zeros(4));
    noise.set_enabled(true);
    let a = Noise::new(9).sample(8);
    let b = Noise::new(9).sample(8);
    assert_eq!(a, b);
    assert!(a.iter().any(|&v| v != 0.0));
}

#[test]
fn test_impossible_allocation_is_reported() {
    assert!(matches!(
        try_zeros("test buffer", usize::MAX / 2),
        Err(ModelError::AllocationFailed { .. })
    ));
    assert_eq!(try_zeros("small", 3).unwrap(), vec![0.0; 3]);
}
