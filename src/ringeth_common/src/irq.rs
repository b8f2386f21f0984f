/*
Copyright 2025 The Ringeth Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use alloc::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Interrupt causes as they appear in `INT_STATUS` and `INT_ENABLE`.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct IntCause: u32 {
        const TX_DONE0 = 1 << 0;
        const TX_DONE1 = 1 << 1;
        const TX_DONE2 = 1 << 2;
        const TX_DONE3 = 1 << 3;
        const RX_DONE  = 1 << 16;
        /// Coalesced TX completion (delay interrupt).
        const TX_DELAY = 1 << 28;
        /// Coalesced RX completion (delay interrupt).
        const RX_DELAY = 1 << 30;
    }
}

impl IntCause {
    /// Completion cause of TX ring `ring`.
    pub fn tx_done(ring: usize) -> Self {
        IntCause::from_bits_truncate(1 << ring.min(3))
    }

    /// Completion causes of the first `rings` TX rings.
    pub fn tx_done_rings(rings: usize) -> Self {
        (0..rings.min(4)).fold(IntCause::empty(), |acc, r| acc | Self::tx_done(r))
    }

    /// Every cause that means "the RX ring has completions".
    pub fn rx_causes() -> Self {
        IntCause::RX_DONE | IntCause::RX_DELAY
    }

    /// Every cause that means "a TX ring has completions".
    pub fn tx_causes() -> Self {
        IntCause::tx_done_rings(4) | IntCause::TX_DELAY
    }
}

/// Top-half callback run when the line asserts.
///
/// It runs in interrupt context: it must not block and must not sleep.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    #[error("Interrupt line already has a handler")]
    Busy,
    #[error("Interrupt line is not available")]
    Unavailable,
}

/// Registration of a device interrupt line.
///
/// Unmasking a cause that is already pending is not required to re-assert the
/// line. Drivers re-check their rings after unmasking instead.
pub trait IrqLine: Send + Sync {
    /// Install `handler` for this line.
    fn on_interrupt(&self, handler: IrqHandler) -> Result<(), IrqError>;

    /// Remove the handler. Once this returns the handler is not running and will
    /// not be called again.
    fn free(&self);
}

impl<L: IrqLine + ?Sized> IrqLine for Arc<L> {
    fn on_interrupt(&self, handler: IrqHandler) -> Result<(), IrqError> {
        (**self).on_interrupt(handler)
    }

    fn free(&self) {
        (**self).free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_done_maps_rings_to_bits() {
        assert_eq!(IntCause::tx_done(0), IntCause::TX_DONE0);
        assert_eq!(IntCause::tx_done(3), IntCause::TX_DONE3);
        assert_eq!(
            IntCause::tx_done_rings(2),
            IntCause::TX_DONE0 | IntCause::TX_DONE1
        );
    }

    #[test]
    fn cause_groups_are_disjoint() {
        assert!(IntCause::rx_causes().intersection(IntCause::tx_causes()).is_empty());
    }
}
