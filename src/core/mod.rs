pub mod error;
pub mod schedule;
pub mod spectrum;

pub use error::MomentError;
pub use schedule::{FrozenSchedule, SizeSchedule, FROZEN_SIZE};
pub use spectrum::Spectrum;
