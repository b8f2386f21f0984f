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

use std::error::Error;
use std::sync::{MutexGuard, PoisonError};
use std::time::Duration;

use ringeth_common::dma::{AllocError, RingError};
use ringeth_common::frame::MacAddress;
use ringeth_common::irq::IrqError;
use thiserror::Error;

use crate::mem::DmaAccessError;

/// The error type for ringeth operations
#[derive(Error, Debug)]
pub enum RingEthError {
    /// DMA memory for descriptor tables or buffers could not be obtained
    #[error("Out of DMA memory: {0}")]
    OutOfMemory(String),

    /// The device reported a received frame length that cannot be valid
    #[error("Received descriptor claims {len} bytes, accepted range is 1..={max}")]
    RxFrameError { len: usize, max: usize },

    /// The TX ring has no room; retry after the stack is told to resume
    #[error("TX ring {ring} is full")]
    TxBackpressure { ring: usize },

    /// A frame could not be copied into DMA memory
    #[error("Failed to map a {len} byte frame for DMA: {source}")]
    TxMapError {
        len: usize,
        #[source]
        source: AllocError,
    },

    /// The device claims completions the host never observes
    #[error("TX ring {ring} is wedged: {pending} frames stuck for {stuck_for:?}")]
    DeviceWedged {
        ring: usize,
        pending: usize,
        stuck_for: Duration,
    },

    /// Frame longer than the configured maximum frame length
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Access outside the DMA region
    #[error("DMA access failed: {0}")]
    DmaAccess(#[from] DmaAccessError),

    /// Configuration that cannot be brought up
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// MTU outside the supported range
    #[error("MTU {mtu} is outside {min}..={max}")]
    InvalidMtu { mtu: usize, min: usize, max: usize },

    /// Not usable as a station address
    #[error("Invalid MAC address {0}")]
    InvalidMacAddress(MacAddress),

    /// Operation only allowed while the device is closed
    #[error("Device is running, cannot {0}")]
    DeviceBusy(&'static str),

    /// Operation only allowed while the device is open
    #[error("Device is not running")]
    NotRunning,

    /// open() on an open device
    #[error("Device is already open")]
    AlreadyOpen,

    /// TX ring index beyond the configured ring count
    #[error("TX ring {0} does not exist")]
    NoSuchRing(usize),

    /// Descriptor ring error
    #[error("Descriptor ring error: {0}")]
    Ring(#[from] RingError),

    /// DMA allocator error
    #[error("DMA allocator error: {0}")]
    Alloc(#[from] AllocError),

    /// Interrupt registration error
    #[error("Interrupt registration failed: {0}")]
    Irq(#[from] IrqError),

    /// An attempt to get a lock from a Mutex failed.
    #[error("Unable to lock resource")]
    LockAttemptFailed(String),

    /// The bottom half stopped accepting work
    #[error("Bottom-half work queue is closed")]
    WorkQueueClosed,

    /// Spawning the bottom-half thread failed
    #[error("Cannot start the bottom-half worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),
}

impl From<&str> for RingEthError {
    fn from(s: &str) -> Self {
        RingEthError::Error(s.to_string())
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for RingEthError {
    // PoisonError borrows the guard, so only its message can be kept
    fn from(e: PoisonError<MutexGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => e.to_string(),
        };
        RingEthError::LockAttemptFailed(source)
    }
}

impl RingEthError {
    /// Whether the device keeps working after this error.
    ///
    /// Frame-level errors only cost the frame. Everything else needs the device
    /// to be reset, reconfigured or reopened.
    pub fn is_recoverable(&self) -> bool {
        // no wildcard: new variants must be classified here
        match self {
            RingEthError::RxFrameError { .. }
            | RingEthError::TxBackpressure { .. }
            | RingEthError::TxMapError { .. }
            | RingEthError::FrameTooLarge { .. }
            | RingEthError::InvalidMtu { .. }
            | RingEthError::InvalidMacAddress(_)
            | RingEthError::DeviceBusy(_)
            | RingEthError::NoSuchRing(_) => true,

            RingEthError::OutOfMemory(_)
            | RingEthError::DeviceWedged { .. }
            | RingEthError::DmaAccess(_)
            | RingEthError::InvalidConfig(_)
            | RingEthError::NotRunning
            | RingEthError::AlreadyOpen
            | RingEthError::Ring(_)
            | RingEthError::Alloc(_)
            | RingEthError::Irq(_)
            | RingEthError::LockAttemptFailed(_)
            | RingEthError::WorkQueueClosed
            | RingEthError::WorkerSpawn(_)
            | RingEthError::Error(_) => false,
        }
    }
}

/// Creates a `RingEthError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::RingEthError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::RingEthError::Error(__err_msg)
    }};
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn frame_level_errors_are_recoverable() {
        assert!(RingEthError::TxBackpressure { ring: 0 }.is_recoverable());
        assert!(
            RingEthError::TxMapError {
                len: 60,
                source: AllocError::OutOfMemory
            }
            .is_recoverable()
        );
        assert!(RingEthError::RxFrameError { len: 0, max: 1536 }.is_recoverable());
    }

    #[test]
    fn device_level_errors_are_not_recoverable() {
        assert!(!RingEthError::OutOfMemory("rx ring".into()).is_recoverable());
        assert!(
            !RingEthError::DeviceWedged {
                ring: 1,
                pending: 3,
                stuck_for: Duration::from_millis(40)
            }
            .is_recoverable()
        );
    }

    #[test]
    fn spawn_failures_name_the_worker() {
        let e: RingEthError = std::io::Error::other("no threads left").into();
        assert!(matches!(e, RingEthError::WorkerSpawn(_)));
        assert_eq!(
            e.to_string(),
            "Cannot start the bottom-half worker thread: no threads left"
        );
        assert!(!e.is_recoverable());
    }

    #[test]
    fn new_error_formats_arguments() {
        let e = new_error!("slot {} has no buffer", 7);
        assert_eq!(e.to_string(), "slot 7 has no buffer");
        let e = new_error!("plain message");
        assert!(matches!(e, RingEthError::Error(ref m) if m == "plain message"));
    }

    #[test]
    fn poisoned_mutex_maps_to_lock_attempt_failed() {
        let m = Arc::new(Mutex::new(0u32));
        let m2 = m.clone();
        let _ = std::thread::spawn(move || {
            let _g = m2.lock().unwrap();
            panic!("poison");
        })
        .join();
        let err: RingEthError = m.lock().unwrap_err().into();
        assert!(matches!(err, RingEthError::LockAttemptFailed(_)));
    }
}
