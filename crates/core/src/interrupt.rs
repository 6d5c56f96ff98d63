//! Interrupt arbitration.
//!
//! Peripherals raise and clear candidate vectors as their flag-and-mask
//! conditions change. Each cycle the engine asks for the winning vector:
//! the lowest-numbered candidate, which is the highest hardware priority.
//! Entry only happens with the global I flag set; otherwise candidates wait.

use serde::{Deserialize, Serialize};

use crate::dispatch::PeripheralId;
use crate::error::DispatchError;

/// Arbitration state for the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrqState {
    Idle,
    Candidate(u8),
    Dispatching(u8),
}

pub struct InterruptUnit {
    /// Bit n set = vector n is a candidate
    pending: u64,
    vector_count: u8,
    acks: Vec<Option<PeripheralId>>,
    state: IrqState,
}

impl InterruptUnit {
    pub fn new(vector_count: usize) -> Self {
        let vector_count = vector_count.min(64);
        InterruptUnit {
            pending: 0,
            vector_count: vector_count as u8,
            acks: vec![None; vector_count],
            state: IrqState::Idle,
        }
    }

    fn valid(&self, vector: u8) -> bool {
        vector != 0 && vector < self.vector_count
    }

    pub fn raise(&mut self, vector: u8) {
        if !self.valid(vector) {
            log::warn!("ignoring raise of vector {} (model has {})", vector, self.vector_count);
            return;
        }
        self.pending |= 1u64 << vector;
    }

    pub fn clear(&mut self, vector: u8) {
        if vector < 64 {
            self.pending &= !(1u64 << vector);
        }
    }

    pub fn is_pending(&self, vector: u8) -> bool {
        vector < 64 && self.pending & (1u64 << vector) != 0
    }

    pub fn any_pending(&self) -> bool {
        self.pending != 0
    }

    /// Raw candidate mask.
    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub(crate) fn set_pending(&mut self, mask: u64) {
        self.pending = mask;
    }

    /// Lowest-numbered candidate.
    pub fn highest(&self) -> Option<u8> {
        if self.pending == 0 {
            None
        } else {
            Some(self.pending.trailing_zeros() as u8)
        }
    }

    /// Per-cycle evaluation after peripherals have clocked.
    pub fn evaluate(&mut self) -> IrqState {
        self.state = match self.highest() {
            Some(v) => IrqState::Candidate(v),
            None => IrqState::Idle,
        };
        self.state
    }

    /// Enter `vector`; returns the plugin to acknowledge, if any.
    pub fn begin_dispatch(&mut self, vector: u8) -> Option<PeripheralId> {
        self.state = IrqState::Dispatching(vector);
        self.acks.get(vector as usize).copied().flatten()
    }

    pub fn state(&self) -> IrqState {
        self.state
    }

    /// Bind an acknowledge hook to a vector.
    pub fn register_ack(&mut self, vector: u8, id: PeripheralId) -> Result<(), DispatchError> {
        if !self.valid(vector) {
            return Err(DispatchError::BadVector(vector));
        }
        let slot = &mut self.acks[vector as usize];
        if slot.is_some() {
            return Err(DispatchError::AckTaken(vector));
        }
        *slot = Some(id);
        Ok(())
    }

    /// Drop all candidates; acknowledge bindings survive a reset.
    pub fn reset(&mut self) {
        self.pending = 0;
        self.state = IrqState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_vector_wins() {
        let mut irq = InterruptUnit::new(26);
        irq.raise(16);
        irq.raise(3);
        irq.raise(20);
        assert_eq!(irq.highest(), Some(3));
        assert_eq!(irq.evaluate(), IrqState::Candidate(3));
        irq.clear(3);
        assert_eq!(irq.highest(), Some(16));
        irq.clear(16);
        irq.clear(20);
        assert_eq!(irq.evaluate(), IrqState::Idle);
    }

    #[test]
    fn test_invalid_vectors_ignored() {
        let mut irq = InterruptUnit::new(19);
        irq.raise(0);
        irq.raise(19);
        assert!(!irq.any_pending());
    }

    #[test]
    fn test_ack_registration() {
        let mut irq = InterruptUnit::new(26);
        irq.register_ack(16, PeripheralId(2)).unwrap();
        assert_eq!(irq.register_ack(16, PeripheralId(3)), Err(DispatchError::AckTaken(16)));
        assert_eq!(irq.register_ack(40, PeripheralId(3)), Err(DispatchError::BadVector(40)));
        assert_eq!(irq.begin_dispatch(16), Some(PeripheralId(2)));
        assert_eq!(irq.state(), IrqState::Dispatching(16));
        assert_eq!(irq.begin_dispatch(5), None);
    }
}
