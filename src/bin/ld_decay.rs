//! The decay of sigma_d^2 with recombination distance at stationarity, against the
//! classical (10 + rho) / (22 + 13 rho + rho^2).

use popmoments::ld::LdStats;

fn main() {
    env_logger::init();

    println!("{:>8} {:>12} {:>12}", "rho", "sigma_d^2", "classical");
    for &rho in &[0.0, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0] {
        let y = LdStats::steady_state(rho, 0.001).unwrap();
        let sigma = y.stat("DD_1_1").unwrap() / y.stat("pi2_1_1_1_1").unwrap();
        let classical = (10.0 + rho) / (22.0 + 13.0 * rho + rho * rho);
        println!("{:>8.1} {:>12.6} {:>12.6}", rho, sigma, classical);
    }
}
