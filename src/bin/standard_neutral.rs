//! Integrate the standard neutral model to equilibrium and print the spectrum against
//! the analytical expectation theta / k.

use popmoments::core::{SizeSchedule, Spectrum};
use popmoments::integration::IntegrationOptions;

fn main() {
    env_logger::init();

    let n = 20;
    let mut fs = Spectrum::zeros(&[n], true).unwrap();
    let opts = IntegrationOptions {
        dt_fac: 0.01,
        verbose: true,
        ..Default::default()
    };
    fs.integrate(&SizeSchedule::constant(vec![1.0]), 10.0, &opts)
        .unwrap();

    println!("{:>4} {:>12} {:>12}", "k", "phi_k", "1/k");
    for k in 1..n {
        println!(
            "{:>4} {:>12.6} {:>12.6}",
            k,
            fs.data()[[k]],
            1.0 / k as f64
        );
    }
}
