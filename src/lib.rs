//! Moment-based computation of expected site frequency spectra, two-locus haplotype
//! spectra and linkage-disequilibrium statistics under demographic models: piecewise or
//! continuously varying population sizes, splits up to five populations, migration,
//! selection with dominance, reversible mutation and frozen (ancient) samples. The
//! spectra are advanced by deterministic integration of linear moment ODEs, not by
//! simulation.
//!
//! A short tour:
//!
//! ```no_run
//! use popmoments::core::SizeSchedule;
//! use popmoments::integration::IntegrationOptions;
//! use popmoments::numerics::one_dim::steady_state_1d;
//!
//! // the ancestral population at equilibrium, split in two, drifting apart
//! let fs = steady_state_1d(40, 1.0).unwrap();
//! let mut joint = fs.split(0, 20, 20).unwrap();
//! joint
//!     .integrate(
//!         &SizeSchedule::constant(vec![1.0, 0.5]),
//!         0.1,
//!         &IntegrationOptions::default(),
//!     )
//!     .unwrap();
//! ```

pub mod core;
pub mod integration;
pub mod ld;
pub mod manips;
pub mod numerics;
pub mod two_locus;
pub mod utils;

pub use crate::core::{MomentError, SizeSchedule, Spectrum};
pub use crate::integration::{integrate, IntegrationOptions, Theta};
pub use crate::ld::{LdOptions, LdStats};
pub use crate::two_locus::{TwoLocusOptions, TwoLocusSpectrum};
