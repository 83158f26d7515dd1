//! An isolation-with-migration history: an ancestral population at equilibrium splits
//! into two populations of unequal size that exchange migrants while growing apart.

use nalgebra::DMatrix;
use popmoments::core::{SizeSchedule, Spectrum};
use popmoments::integration::IntegrationOptions;
use popmoments::numerics::one_dim::steady_state_1d;

fn main() {
    env_logger::init();

    let (n1, n2) = (20, 13);
    let (nu1, nu2, t_split) = (2.0, 0.6, 0.45);
    let (m12, m21) = (5.0, 0.3);

    let ancestral = steady_state_1d(n1 + n2, 1.0).unwrap();
    let mut fs = ancestral.split(0, n1, n2).unwrap();

    let opts = IntegrationOptions {
        migration: Some(DMatrix::from_row_slice(2, 2, &[0.0, m12, m21, 0.0])),
        ..Default::default()
    };
    // exponential size change from the ancestral size toward (nu1, nu2)
    let schedule = SizeSchedule::from_fn(move |t| {
        let f = t / t_split;
        vec![nu1_path(1.0, nu1, f), nu1_path(1.0, nu2, f)]
    });
    fs.integrate(&schedule, t_split, &opts).unwrap();

    let marginal1 = fs.marginalize(&[1], true).unwrap();
    let marginal2 = fs.marginalize(&[0], true).unwrap();
    println!("joint spectrum mass: {:.6}", fs.sum());
    println!("population 1 marginal: {:?}", marginal1.data());
    println!("population 2 marginal: {:?}", marginal2.data());
}

fn nu1_path(from: f64, to: f64, fraction: f64) -> f64 {
    from * (to / from).powf(fraction.clamp(0.0, 1.0))
}
