use std::sync::Arc;

use horde::{
    HordeConfig, HordeError, Hyperparams, Orchestrator, OrchestratorBuilder,
    compute::{HostDevice, HostPlatform, HostStats},
    demon::{
        ConstantGamma, ConstantOutcome, ConstantReward, Demon, DemonWeights, ObservationReward,
        RewardFunction, UniformPolicy,
    },
};
use rand::Rng;

const F: usize = 3;
const KERNELS: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/kernels/horde.cl");

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> HordeConfig {
    HordeConfig {
        kernel_path: KERNELS.into(),
        ..HordeConfig::default()
    }
}

fn demon(reward: Arc<dyn RewardFunction<usize>>) -> Demon<usize> {
    let policy = Arc::new(UniformPolicy::new(2));
    Demon::new(
        policy.clone(),
        policy,
        reward,
        Arc::new(ConstantGamma(0.9)),
        Arc::new(ConstantOutcome(0.)),
    )
}

fn constant_demons(n: usize) -> Vec<Demon<usize>> {
    (0..n).map(|_| demon(Arc::new(ConstantReward(0.1)))).collect()
}

fn devices(n: usize) -> Vec<HostDevice> {
    (0..n)
        .map(|i| HostDevice::with_memory(&format!("host-{i}"), 1 << 24, 1 << 22))
        .collect()
}

fn horde(
    demons: Vec<Demon<usize>>,
    devices: Vec<HostDevice>,
) -> (Orchestrator<HostDevice, usize>, Vec<Arc<HostStats>>) {
    init_logger();
    let stats = devices.iter().map(HostDevice::stats).collect();
    let platform = HostPlatform::new("host", devices);

    let horde = OrchestratorBuilder::new(F)
        .demons(demons)
        .config(config())
        .build(&[platform])
        .unwrap();
    (horde, stats)
}

fn one_hot(rng: &mut impl Rng) -> [f64; F] {
    let mut x = [0.; F];
    x[rng.random_range(0..F)] = 1.;
    x
}

#[test]
fn one_update_learns_the_reward() {
    let mut rng = rand::rng();
    let (mut horde, _) = horde(constant_demons(4), devices(1));
    let prev = one_hot(&mut rng);
    let next = one_hot(&mut rng);

    horde.update(None, Some(&prev), &0, &next).unwrap();

    let theta = horde.theta().unwrap();
    let predictions = horde.predictions(Some(&prev)).unwrap();
    assert_eq!(predictions.len(), 4);

    for (i, prediction) in predictions.iter().enumerate() {
        let demon_theta = &theta[i * F..(i + 1) * F];
        let dot: f32 = demon_theta.iter().zip(&prev).map(|(t, x)| t * *x as f32).sum();

        assert!((prediction - dot).abs() < 1e-6);
        // alpha * reward with a one-hot, zero-initialized learner.
        assert!((prediction - 0.01).abs() < 1e-6);
    }

    horde.check_for_nan().unwrap();
    assert!(horde.w().unwrap().iter().all(|w| w.is_finite()));
}

#[test]
fn first_tick_resets_traces_without_learning() {
    let (mut horde, stats) = horde(constant_demons(4), devices(1));

    horde.update(None, Some(&[1., 0., 0.]), &0, &[0., 1., 0.]).unwrap();
    let theta = horde.theta().unwrap();
    let w = horde.w().unwrap();
    assert!(horde.trace().unwrap().iter().any(|&e| e != 0.));

    horde.update(None, None, &0, &[0., 0., 1.]).unwrap();

    assert!(horde.trace().unwrap().iter().all(|&e| e == 0.));
    assert_eq!(horde.theta().unwrap(), theta);
    assert_eq!(horde.w().unwrap(), w);
    assert_eq!(stats[0].dispatches("traceReset"), 1);
    assert_eq!(stats[0].dispatches("vec_updateGTDLambda"), 1);
}

#[test]
fn identical_predictions_dispatch_once() {
    let (mut horde, stats) = horde(constant_demons(6), devices(2));
    let x = [0., 1., 0.];

    let first = horde.predictions(Some(&x)).unwrap();
    let second = horde.predictions(Some(&x)).unwrap();

    assert_eq!(first, second);
    for stats in &stats {
        assert_eq!(stats.dispatches("vec_predict"), 1);
    }
}

#[test]
fn uploaded_weights_are_saved_back() {
    let mut rng = rand::rng();
    let (mut horde, _) = horde(constant_demons(7), devices(3));

    let uploaded: Vec<DemonWeights> = (0..7)
        .map(|_| {
            let mut vector = || Some((0..F).map(|_| rng.random::<f32>()).collect());
            DemonWeights {
                theta: vector(),
                w: vector(),
                trace: vector(),
            }
        })
        .collect();

    for (i, weights) in uploaded.iter().enumerate() {
        horde.demon_mut(i).restore_weights(weights.clone());
    }
    horde.upload_weights().unwrap();

    let theta: Vec<f32> = uploaded.iter().flat_map(|w| w.theta.clone().unwrap()).collect();
    assert_eq!(horde.theta().unwrap(), theta);

    for i in 0..7 {
        horde.demon_mut(i).restore_weights(DemonWeights::default());
    }
    horde.save_weights().unwrap();

    let saved: Vec<_> = horde.demons().map(|d| d.snapshot_weights().clone()).collect();
    assert_eq!(saved, uploaded);
}

#[test]
fn partial_snapshots_keep_device_values() {
    let (mut horde, _) = horde(constant_demons(2), devices(1));

    horde.demon_mut(1).restore_weights(DemonWeights {
        theta: Some(vec![1., 2., 3.]),
        ..DemonWeights::default()
    });
    horde.upload_weights().unwrap();

    assert_eq!(horde.theta().unwrap(), [0., 0., 0., 1., 2., 3.]);
    assert_eq!(horde.w().unwrap(), [0.; 2 * F]);
}

#[test]
fn uploaded_weights_invalidate_cached_predictions() {
    let (mut horde, stats) = horde(constant_demons(2), devices(1));
    let x = [1., 0., 0.];

    assert_eq!(horde.predictions(Some(&x)).unwrap(), [0., 0.]);

    horde.demon_mut(0).restore_weights(DemonWeights {
        theta: Some(vec![5., 0., 0.]),
        ..DemonWeights::default()
    });
    horde.upload_weights().unwrap();

    assert_eq!(horde.predictions(Some(&x)).unwrap(), [5., 0.]);
    assert_eq!(stats[0].dispatches("vec_predict"), 2);
}

#[test]
fn aggregate_memory_shortage_allocates_nothing() {
    init_logger();
    let device = HostDevice::with_memory("tiny", 1 << 20, 1 << 20);
    let stats = device.stats();
    let platform = HostPlatform::new("host", vec![device]);

    let result = OrchestratorBuilder::new(100)
        .demons(constant_demons(1000))
        .config(config())
        .build(&[platform]);

    assert!(matches!(result, Err(HordeError::InsufficientMemory { .. })));
    assert_eq!(stats.allocations(), 0);
}

#[test]
fn oversized_block_names_the_device() {
    init_logger();
    let small = HostDevice::with_memory("small", 1 << 24, 1 << 10);
    let stats = small.stats();
    let platform = HostPlatform::new("host", vec![devices(1).remove(0), small]);

    let result = OrchestratorBuilder::new(F)
        .demons(constant_demons(400))
        .config(config())
        .build(&[platform]);

    match result {
        Err(HordeError::AllocationTooLarge { device, .. }) => assert_eq!(device, "small"),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("partition should have been rejected"),
    }
    assert_eq!(stats.allocations(), 0);
}

#[test]
fn padded_block_is_checked_before_any_device_allocates() {
    init_logger();
    let big = devices(1).remove(0);
    // One unpadded weight array of 4000 bytes fits, the padded one doesn't.
    let small = HostDevice::with_memory("small", 1 << 24, 8000);
    let stats = [big.stats(), small.stats()];
    let platform = HostPlatform::new("host", vec![big, small]);

    let result = OrchestratorBuilder::new(1000)
        .demons(constant_demons(2))
        .config(config())
        .build(&[platform]);

    match result {
        Err(HordeError::AllocationTooLarge {
            device,
            required,
            available,
        }) => {
            assert_eq!(device, "small");
            assert_eq!(required, 4 * 1000 * 256);
            assert_eq!(available, 8000);
        }
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("partition should have been rejected"),
    }
    for stats in &stats {
        assert_eq!(stats.allocations(), 0);
    }
}

#[test]
fn padding_covers_every_device() {
    let (horde, _) = horde(constant_demons(130), devices(3));

    for worker in horde.workers() {
        let padded = worker.padded_count().unwrap();
        let group = worker.vector_width().unwrap() * worker.work_group_size().unwrap();

        assert_eq!(padded % group, 0);
        assert!(padded >= worker.local_count());
    }

    let counts: Vec<_> = horde.workers().iter().map(|w| w.local_count()).collect();
    assert_eq!(counts, [44, 43, 43]);
}

#[test]
fn predictions_follow_global_order_across_devices() {
    let demons = (0..10)
        .map(|i| demon(Arc::new(ConstantReward(i as f64))))
        .collect();
    let (mut horde, _) = horde(demons, devices(3));

    horde.update(None, Some(&[0., 0., 1.]), &1, &[1., 0., 0.]).unwrap();
    let predictions = horde.predictions(None).unwrap();

    assert_eq!(predictions.len(), 10);
    for (i, prediction) in predictions.iter().enumerate() {
        assert!((prediction - 0.1 * i as f32).abs() < 1e-5);
    }

    assert_eq!(horde.device_index(4), 1);
    assert_eq!(horde.local_index(4), 0);
    assert_eq!(horde.demon(9).slot_id(), Some(2));
}

#[test]
fn shared_functions_update_once_per_tick() {
    let reward: Arc<dyn RewardFunction<usize>> = Arc::new(ObservationReward::new(0));
    let demons = (0..5).map(|_| demon(reward.clone())).collect::<Vec<_>>();
    init_logger();

    let platform = HostPlatform::new("host", devices(2));
    let mut horde = OrchestratorBuilder::new(F)
        .demons(demons)
        .reward_functions([reward])
        .config(config())
        .build(&[platform])
        .unwrap();

    horde
        .update(Some(&[0.5]), Some(&[1., 0., 0.]), &0, &[0., 1., 0.])
        .unwrap();

    for prediction in horde.predictions(None).unwrap() {
        assert!((prediction - 0.05).abs() < 1e-6);
    }
}

#[test]
fn set_params_recompiles_targeted_devices() {
    let (mut horde, stats) = horde(constant_demons(4), devices(2));
    let built: Vec<_> = stats.iter().map(|s| s.programs_built()).collect();

    horde.set_device_params(1, Hyperparams::new(0.5, 0.1, 0.5)).unwrap();
    assert_eq!(stats[0].programs_built(), built[0]);
    assert_eq!(stats[1].programs_built(), built[1] + 1);

    horde.set_params(Hyperparams::new(0.2, 0.1, 0.5)).unwrap();
    assert_eq!(stats[0].programs_built(), built[0] + 1);

    assert!(matches!(
        horde.set_device_params(2, Hyperparams::default()),
        Err(HordeError::DeviceIndex {
            index: 2,
            devices: 2
        })
    ));
}

#[test]
fn new_hyperparams_change_the_step_size() {
    let (mut horde, _) = horde(constant_demons(1), devices(1));
    horde.set_params(Hyperparams::new(0.5, 0.01, 0.9)).unwrap();

    horde.update(None, Some(&[1., 0., 0.]), &0, &[0., 1., 0.]).unwrap();

    let prediction = horde.predictions(None).unwrap()[0];
    assert!((prediction - 0.05).abs() < 1e-6);
}

#[test]
fn wrong_feature_dimension_is_rejected() {
    let (mut horde, _) = horde(constant_demons(2), devices(1));

    assert!(matches!(
        horde.update(None, None, &0, &[1., 0.]),
        Err(HordeError::FeatureDimension {
            expected: F,
            got: 2
        })
    ));
    assert!(matches!(
        horde.predictions(Some(&[1.; 4])),
        Err(HordeError::FeatureDimension { .. })
    ));
}

#[test]
fn shutdown_stops_the_fan_out() {
    let (mut horde, _) = horde(constant_demons(2), devices(2));
    horde.update(None, Some(&[1., 0., 0.]), &0, &[0., 1., 0.]).unwrap();

    horde.shutdown();

    assert!(matches!(
        horde.update(None, None, &0, &[1., 0., 0.]),
        Err(HordeError::ShutDown)
    ));
    assert!(matches!(horde.predictions(None), Err(HordeError::ShutDown)));
    // Weight reads don't go through the pool.
    assert_eq!(horde.theta().unwrap().len(), 2 * F);
}

#[test]
fn missing_kernel_source_is_fatal() {
    init_logger();
    let platform = HostPlatform::new("host", devices(1));
    let config = HordeConfig {
        kernel_path: "no/such/kernel.cl".into(),
        ..HordeConfig::default()
    };

    let result = OrchestratorBuilder::new(F)
        .demons(constant_demons(2))
        .config(config)
        .build(&[platform]);

    assert!(matches!(result, Err(HordeError::KernelSource { .. })));
}

#[test]
fn discovery_failures_are_fatal() {
    init_logger();
    let none: [HostPlatform; 0] = [];
    let result = OrchestratorBuilder::new(F)
        .demons(constant_demons(2))
        .config(config())
        .build(&none);
    assert!(matches!(result, Err(HordeError::NoPlatform)));

    let empty = HostPlatform::new("empty", Vec::new());
    let result = OrchestratorBuilder::new(F)
        .demons(constant_demons(2))
        .config(config())
        .build(&[empty]);
    assert!(matches!(result, Err(HordeError::NoDevice)));
}
