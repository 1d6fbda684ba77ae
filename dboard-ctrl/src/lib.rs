//! Daughterboard hardware control.
//!
//! The contract a radio mainboard offers the daughterboard drivers plugged
//! into it ([`hw_trait`]), an in-process mainboard implementing it
//! ([`mainboard`]), and a control protocol that carries it over a serial
//! link ([`mgmt_protocol`]).

pub mod config;
pub mod error;
pub mod gpio_bank;
pub mod hw_trait;
pub mod mainboard;
pub mod mgmt_protocol;
pub mod tracing;
pub mod types;
