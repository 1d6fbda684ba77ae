//! Record of bus transactions seen by the emulated mainboard.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;

use crate::hw_trait::{Edge, I2cAddress, SpiDevice};

/// Where a transaction went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusTarget {
    I2c(I2cAddress),
    /// SPI device and the host-side edge (push for writes, latch for reads)
    Spi { device: SpiDevice, edge: Edge },
}

impl fmt::Display for BusTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusTarget::I2c(address) => write!(f, "i2c {}", address),
            BusTarget::Spi { device, edge } => write!(f, "spi {} ({})", device, edge),
        }
    }
}

/// One bus transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusTransaction {
    pub target: BusTarget,
    pub is_read: bool,
    /// Bytes sent by the host, or bytes delivered to it for reads
    pub data: Vec<u8>,
    /// Whether the transaction completed without a bus error
    pub completed: bool,
}

/// Bounded ring of the most recent transactions.
pub struct BusTrace {
    capacity: usize,
    transactions: Mutex<VecDeque<BusTransaction>>,
}

impl BusTrace {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            transactions: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, transaction: BusTransaction) {
        if self.capacity == 0 {
            return;
        }
        let mut transactions = self.transactions.lock();
        if transactions.len() == self.capacity {
            transactions.pop_front();
        }
        transactions.push_back(transaction);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<BusTransaction> {
        self.transactions.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.transactions.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_to(address: u8, byte: u8) -> BusTransaction {
        BusTransaction {
            target: BusTarget::I2c(I2cAddress::new(address).unwrap()),
            is_read: false,
            data: vec![byte],
            completed: true,
        }
    }

    #[test]
    fn test_ring_drops_oldest() {
        let trace = BusTrace::new(2);
        trace.record(write_to(0x20, 1));
        trace.record(write_to(0x20, 2));
        trace.record(write_to(0x20, 3));
        let data: Vec<u8> = trace.snapshot().iter().map(|t| t.data[0]).collect();
        assert_eq!(data, vec![2, 3]);
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let trace = BusTrace::new(0);
        trace.record(write_to(0x20, 1));
        assert!(trace.snapshot().is_empty());
    }

    #[test]
    fn test_target_display() {
        let target = BusTarget::Spi {
            device: SpiDevice::Tx,
            edge: Edge::Rising,
        };
        assert_eq!(target.to_string(), "spi TX (rising)");
        assert_eq!(write_to(0x50, 0).target.to_string(), "i2c 0x50");
    }
}
