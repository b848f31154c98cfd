use glidepath::api::{ControlFile, EstimationChoice};
use glidepath::core::{
    DensitySelector, Engine, GlidePath, build_gradient, build_hessian, evaluate, lower_bound,
    optimize,
};

fn assert_close(actual: f64, expected: f64, tol: f64) {
    assert!(
        (actual - expected).abs() <= tol,
        "expected {expected}, got {actual}, tolerance {tol}"
    );
}

fn assert_feasible(path: &GlidePath, lower: f64) {
    for a in path.as_slice() {
        assert!(*a >= lower && *a <= 1.0, "allocation {a} outside [{lower}, 1]");
    }
}

fn small_control() -> ControlFile {
    ControlFile {
        horizon: 5,
        withdrawal_rate: 0.2,
        convergence_threshold: 1e-6,
        precision: 60,
        rf_max: 3.0,
        workers: Some(2),
        max_iterations: 100,
        ..ControlFile::default()
    }
}

#[test]
fn optimized_path_is_feasible_and_not_worse_than_start() {
    let control = small_control();
    let config = control.build_config().expect("valid config");
    let start = GlidePath::constant(5, 0.5);
    let before = evaluate(&config, &start, false).expect("evaluation");

    let result = optimize(&config, &start).expect("optimization");
    let lower = lower_bound(&config.parameters);
    for record in &result.iterations {
        assert_feasible(&record.glide_path, lower);
    }
    assert_feasible(&result.glide_path, lower);
    assert!(result.max_effective_gradient <= config.convergence_threshold);
    assert!(result.success_probability >= before.success_probability - 1e-9);
    assert!(result.success_probability > 0.0 && result.success_probability < 1.0);
}

#[test]
fn derivatives_at_reference_settings_with_all_stock_final_year() {
    let control = ControlFile {
        horizon: 4,
        workers: Some(2),
        ..ControlFile::default()
    };
    let config = control.build_config().expect("valid config");
    let engine = Engine::new(&config).expect("engine");
    let path = GlidePath::new(vec![0.8, 0.9, 1.0, 1.0]);

    let baseline = engine
        .success_probability(&path, DensitySelector::standard())
        .expect("baseline");
    let gradient = build_gradient(&engine, &path, baseline).expect("gradient");
    assert_eq!(gradient.components.len(), 4);
    assert!(gradient.components.iter().all(|g| g.is_finite()));

    let hessian = build_hessian(&engine, &path, &gradient).expect("hessian");
    assert_eq!(hessian.nrows(), 4);
    assert!(hessian.iter().all(|h| h.is_finite()));
    assert_eq!(hessian, hessian.transpose());
}

#[test]
fn optimizing_an_optimum_changes_nothing() {
    let config = small_control().build_config().expect("valid config");
    let first = optimize(&config, &GlidePath::constant(5, 0.5)).expect("first run");
    let second = optimize(&config, &first.glide_path).expect("second run");

    assert!(second.iterations.is_empty());
    for (a, b) in first
        .glide_path
        .as_slice()
        .iter()
        .zip(second.glide_path.as_slice())
    {
        assert_close(*a, *b, config.convergence_threshold);
    }
    assert_close(second.success_probability, first.success_probability, 1e-12);
}

#[test]
fn simulation_agrees_with_dynamic_programming() {
    let path = GlidePath::new(vec![0.8, 0.7, 0.6, 0.5, 0.4]);
    let mut control = small_control();
    control.precision = 200;
    let exact = evaluate(&control.build_config().expect("dp config"), &path, false)
        .expect("dp evaluation");

    control.estimation = EstimationChoice::Simulation;
    control.sample_size = 400_000;
    control.workers = Some(4);
    let sampled = evaluate(&control.build_config().expect("mc config"), &path, false)
        .expect("mc evaluation");

    let p = exact.success_probability;
    let se = (p * (1.0 - p) / sampled.samples as f64).sqrt();
    assert_close(sampled.success_probability, p, 3.0 * se + 1e-3);
}

#[test]
fn simulated_optimization_is_reproducible() {
    let control = ControlFile {
        horizon: 3,
        withdrawal_rate: 0.3,
        estimation: EstimationChoice::Simulation,
        sample_size: 20_000,
        convergence_threshold: 1e-3,
        algorithm: glidepath::api::AlgorithmChoice::Gradient,
        workers: Some(2),
        max_iterations: 200,
        seed: 5,
        ..ControlFile::default()
    };
    let config = control.build_config().expect("valid config");
    let start = GlidePath::constant(3, 0.5);
    let first = optimize(&config, &start);
    let second = optimize(&config, &start);
    match (first, second) {
        (Ok(a), Ok(b)) => {
            assert_eq!(a.glide_path, b.glide_path);
            assert_eq!(a.success_probability, b.success_probability);
        }
        (Err(a), Err(b)) => assert_eq!(a, b),
        (a, b) => panic!("runs diverged: {a:?} vs {b:?}"),
    }
}

#[test]
#[ignore = "full-scale reference run, takes minutes"]
fn reference_scenario_converges() {
    let control = ControlFile::default();
    let config = control.build_config().expect("valid defaults");
    let result = optimize(&config, &control.initial_path().expect("path")).expect("optimization");

    assert!(result.max_effective_gradient <= 1e-5);
    assert!(result.success_probability > 0.9 && result.success_probability < 1.0);
    let lower = lower_bound(&config.parameters);
    for record in &result.iterations {
        assert_feasible(&record.glide_path, lower);
    }
    assert_feasible(&result.glide_path, lower);
}
