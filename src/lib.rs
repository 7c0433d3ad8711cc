//! A device-side transfer engine for ChipIdea-style USB controllers
//!
//! `chipidea-usbd` drives the dual-role ChipIdea core found in many
//! application processors in device (peripheral) mode. It owns the
//! hardware queue heads and transfer descriptors, implements the safe
//! hand-off protocol for appending work to a live endpoint, runs the
//! endpoint 0 control state machine, and classifies the far end of the
//! cable as a USB host or a dedicated charger.
//!
//! The crate is split along the contexts it runs in:
//!
//! - [`Driver`] is the owned controller value. [`Driver::poll`] services
//!   the interrupt status word; it never sleeps and all of its hardware
//!   handshakes are bounded.
//! - Work that needs millisecond-scale delays (classifier timeouts,
//!   suspend settling, charger notifications) is deferred through a
//!   bounded event queue and drained by [`Driver::run_deferred`] from a
//!   context that may sleep.
//! - [`Udc`] wraps the driver in a critical-section mutex so both
//!   contexts can share it.
//!
//! Gadget function drivers implement [`UsbFunction`]; the battery
//! charging collaborator implements [`ChargerControl`]; the platform
//! supplies a [`TimerService`] for the connection classifier.
//!
//! To interface the hardware, you must define a safe implementation of
//! [`Peripherals`]. See the trait documentation for more information.

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;

mod buffer;
mod bus;
mod chain;
mod classifier;
mod control;
mod device;
mod driver;
mod error;
mod event;
mod function;
mod pool;
mod qh;
mod queue;
mod ral;
mod request;
mod state;
mod td;
mod vcell;

#[cfg(test)]
mod mock;

pub use buffer::{Buffer, EndpointMemory};
pub use bus::Udc;
pub use chain::Chain;
pub use classifier::{Classification, TimerToken};
pub use control::{ControlState, SetupPacket};
pub use device::{BusState, ResumeState, Speed};
pub use driver::{Driver, CHARGER_CURRENT_MA, CLASSIFY_TIMEOUT_MS, VBUS_DRAW_UNCONFIGURED_MA};
pub use error::{ControlError, Error, Handshake, TransferStatus};
pub use function::{ChargerControl, EndpointSetup, SetupResponse, TimerService, UsbFunction};
pub use pool::TdHandle;
pub use queue::{EndpointKind, REQUESTS_PER_ENDPOINT};
pub use request::Request;
pub use state::DeviceState;

/// Eight endpoints, two directions.
pub const QH_COUNT: usize = 8 * 2;

/// Size of the transfer descriptor arena.
///
/// Descriptors are shared between all endpoints; a single large bulk
/// transfer may consume several of them at once.
pub const TD_COUNT: usize = 32;

/// Produces an index into the QH, queue, and endpoint collections
pub(crate) fn qh_index(ep_addr: usb_device::endpoint::EndpointAddress) -> usize {
    (ep_addr.index() * 2) + (usb_device::UsbDirection::In == ep_addr.direction()) as usize
}

/// A type that owns the USB register block
///
/// An implementation of `Peripherals` is expected to own the device-mode
/// operational registers of one ChipIdea controller instance. PHY and
/// SoC-side setup (clocks, pin muxing) is the platform's business and
/// must be finished before the driver touches the core.
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the
/// controller register block. The pointer returned by [`core`](Peripherals::core)
/// is assumed to be valid for the life of the program, and will be cast
/// to a register definition.
pub unsafe trait Peripherals {
    /// Returns the address of the device-mode operational registers
    /// for this controller instance
    fn core(&self) -> *const ();
}
