//! Closure tests: fit Poisson pseudo-data generated from known attenuation length
//! and normalizations.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use wc_core::ParameterSpace;
use wc_inference::{
    CalibrationLayout, FitConfig, FitDriver, FitState, LbfgsbOptimizer, ParameterSeed, ToyTruth,
    generate_hits,
};
use wc_model::{GeometryRecord, SampleConfig, SensorMask, SensorType};

const N_SENSORS: u32 = 20_000;
const TRUE_ALPHA: f64 = 10_000.0;
const TRUE_NORMS: [f64; 2] = [2.0, 1.0];

// Half of the sensors in each polar-angle bin, all module angles in the upper bin.
fn geometry(seed: u64) -> Vec<GeometryRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..N_SENSORS)
        .map(|i| {
            let costh =
                if i < N_SENSORS / 2 { rng.gen_range(0.55..0.70) } else { rng.gen_range(0.80..0.95) };
            GeometryRecord {
                distance: rng.gen_range(1000.0..5000.0),
                costh,
                cosths: 0.9,
                collector_costh: Some(0.9),
                sensor_id: i,
            }
        })
        .collect()
}

fn layout() -> CalibrationLayout {
    CalibrationLayout::uniform(2, 0.5, 1.0)
        .with_norm_composite(ParameterSeed::new(1.5, 0.01, Some(0.0), None))
}

fn build_driver(config: FitConfig, mask: Option<&SensorMask>) -> FitDriver {
    let layout = layout();
    let geom = geometry(11);
    let scale: Vec<f64> =
        geom.iter().map(|g| if g.costh < 0.75 { TRUE_NORMS[0] } else { TRUE_NORMS[1] }).collect();
    let truth = ToyTruth { alpha: TRUE_ALPHA, reference_distance: layout.reference_distance, scale };
    let hits = generate_hits(&geom, &truth, 2024).unwrap();

    let mut composite =
        SampleConfig::per_sensor("composite", SensorType::Composite, N_SENSORS as usize);
    composite.cuts = layout.sample_cuts(SensorType::Composite);

    let mut driver = FitDriver::new(config);
    let c = driver.add_sample(composite).unwrap();
    // No direct-view records at all.
    driver.add_sample(SampleConfig::per_sensor("direct", SensorType::Direct, 0)).unwrap();
    driver.apply_layout(&layout).unwrap();
    driver.load_sample_records(c, &hits, &geom, mask).unwrap();
    driver.build_event_maps().unwrap();
    driver
}

#[test]
fn test_recovers_attenuation_and_normalizations() {
    let mut driver = build_driver(FitConfig::default(), None);
    let fixed = driver.fix_unconstrained().unwrap();
    // norm_direct_1, norm_direct_2, correction_1 (no records), correction_2 (anchor)
    assert_eq!(fixed, vec![3, 4, 5, 6]);

    let result = driver.minimize(&LbfgsbOptimizer::default()).unwrap();
    println!("{result}");

    assert!(result.converged(), "status {}: {}", result.status, result.message);
    assert_eq!(driver.state(), FitState::Converged);
    assert_eq!(result.n_free(), 3);

    let (alpha, alpha_err) = result.get("alpha").unwrap();
    assert!((alpha - TRUE_ALPHA).abs() < 0.05 * TRUE_ALPHA, "alpha = {alpha} +/- {alpha_err}");
    assert!(alpha_err > 0.0);
    assert!((alpha - TRUE_ALPHA).abs() < 5.0 * alpha_err, "alpha = {alpha} +/- {alpha_err}");

    for (i, truth) in TRUE_NORMS.iter().enumerate() {
        let name = format!("norm_composite_{}", i + 1);
        let (v, err) = result.get(&name).unwrap();
        assert!((v - truth).abs() < 0.10 * truth, "{name} = {v} +/- {err}");
        assert!((v - truth).abs() < 5.0 * err, "{name} = {v} +/- {err}");
    }

    for name in ["norm_direct_1", "norm_direct_2", "correction_1", "correction_2"] {
        let i = result.names.iter().position(|n| n == name).unwrap();
        assert!(result.fixed[i], "{name} should be fixed");
        assert_eq!(result.uncertainties[i], 0.0);
    }
    assert_eq!(result.get("norm_direct_1").unwrap().0, 5000.0);
    assert_eq!(result.get("correction_2").unwrap().0, 1.0);

    assert_eq!(result.hesse_ok, Some(true));
    let rho = result.correlation(0, 1).unwrap();
    assert!(rho.abs() < 1.0);
}

#[test]
fn test_parallel_reweight_matches_serial() {
    let mut serial = build_driver(FitConfig::default(), None);
    let mut parallel = build_driver(FitConfig { parallel: true, ..FitConfig::default() }, None);
    let mut p = serial.context().parameter_init();
    p[0] = 9500.0;
    p[1] = 1.8;
    p[2] = 1.1;

    let a = serial.evaluate(&p).unwrap();
    let b = parallel.evaluate(&p).unwrap();
    assert_eq!(a, b);
    assert_eq!(
        serial.context().samples()[0].pred_hist().content,
        parallel.context().samples()[0].pred_hist().content
    );
    assert_eq!(serial.evaluate(&p).unwrap(), a);
}

#[test]
fn test_masked_modules_drop_records() {
    let mask = SensorMask::uniform_modules(300, N_SENSORS as usize, 19);
    let driver = build_driver(FitConfig::default(), Some(&mask));
    let sample = &driver.context().samples()[0];
    let kept = sample.exposures().len();
    assert_eq!(kept, N_SENSORS as usize - mask.n_masked());
    assert!(kept < N_SENSORS as usize);
    assert!(
        sample.exposures().iter().all(|e| !mask.is_masked(e.sensor_id())),
        "masked sensor left in the sample"
    );
}
