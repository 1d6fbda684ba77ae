//! Value types shared across the crate.

mod clock_rate;

pub use clock_rate::ClockRate;
