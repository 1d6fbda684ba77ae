//! Register model of one daughterboard GPIO bank.
//!
//! A bank is 16 pins. Each pin's level is composed from three registers and
//! the level the daughterboard drives onto it:
//!
//! ```text
//! DDR bit = 0 (input)   -> level driven externally
//! DDR bit = 1 (output)  -> ATR mask bit = 1 -> tx_value/rx_value bit per mode
//!                          ATR mask bit = 0 -> manual output register bit
//! ```
//!
//! All updates are mask-qualified: bits outside the mask keep their value.

use strum::Display;

/// Whether the radio is currently transmitting or receiving, which selects
/// the ATR value driven onto ATR-controlled pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum AtrMode {
    #[default]
    #[strum(to_string = "receive")]
    Receive,
    #[strum(to_string = "transmit")]
    Transmit,
}

/// Replace the bits of `current` selected by `mask` with those of `value`.
pub fn apply_masked(current: u16, value: u16, mask: u16) -> u16 {
    (current & !mask) | (value & mask)
}

/// Automatic TX/RX switching registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtrRegister {
    /// Levels driven while transmitting
    pub tx_value: u16,
    /// Levels driven while receiving
    pub rx_value: u16,
    /// Pins under ATR control
    pub mask: u16,
}

impl AtrRegister {
    /// Put the pins in `mask` under ATR control with the given levels.
    ///
    /// Pins outside `mask` keep both their values and their ATR membership.
    pub fn update(&mut self, tx_value: u16, rx_value: u16, mask: u16) {
        self.tx_value = apply_masked(self.tx_value, tx_value, mask);
        self.rx_value = apply_masked(self.rx_value, rx_value, mask);
        self.mask |= mask;
    }

    /// Levels the ATR block drives in `mode`, before masking.
    pub fn value_for(&self, mode: AtrMode) -> u16 {
        match mode {
            AtrMode::Transmit => self.tx_value,
            AtrMode::Receive => self.rx_value,
        }
    }
}

/// Complete state of one GPIO bank.
///
/// The default is the power-on state: every pin an input, nothing under
/// ATR control, manual outputs low, inputs pulled low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BankRegisters {
    /// Data direction, 1 = output
    pub ddr: u16,
    /// Manual output levels
    pub output: u16,
    pub atr: AtrRegister,
    /// Levels the daughterboard drives into input pins
    pub external: u16,
}

impl BankRegisters {
    pub fn set_atr(&mut self, tx_value: u16, rx_value: u16, mask: u16) {
        self.atr.update(tx_value, rx_value, mask);
    }

    pub fn set_ddr(&mut self, value: u16, mask: u16) {
        self.ddr = apply_masked(self.ddr, value, mask);
    }

    pub fn write_output(&mut self, value: u16, mask: u16) {
        self.output = apply_masked(self.output, value, mask);
    }

    pub fn drive_inputs(&mut self, value: u16) {
        self.external = value;
    }

    /// Live pin levels in `mode`.
    pub fn level(&self, mode: AtrMode) -> u16 {
        let driven = apply_masked(self.output, self.atr.value_for(mode), self.atr.mask);
        apply_masked(self.external, driven, self.ddr)
    }
}
