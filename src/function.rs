//! Collaborator interfaces
//!
//! The engine sits between three collaborators: the gadget function
//! driver above it ([`UsbFunction`]), the battery charging logic below
//! it ([`ChargerControl`]), and the platform timer the classifier
//! borrows ([`TimerService`]).

use usb_device::endpoint::EndpointAddress;

use crate::{
    buffer::Buffer,
    classifier::TimerToken,
    control::SetupPacket,
    error::{ControlError, Error},
    queue::EndpointKind,
    request::Request,
};

/// A gadget function driver.
///
/// One implementation per gadget function (serial, storage, ...). All
/// callbacks run inside the controller's critical section; they must
/// not call back into the driver.
pub trait UsbFunction {
    /// The function is being attached to the engine.
    ///
    /// Declare endpoints and allocate transfer buffers here; endpoints
    /// cannot be added after the device is pulled up.
    fn bind(&mut self, endpoints: &mut dyn EndpointSetup) -> Result<(), Error>;

    /// The function is being detached from the engine.
    fn unbind(&mut self) {}

    /// Decode a control request the engine doesn't handle itself.
    ///
    /// Return [`SetupResponse::In`] to send a reply (the engine copies
    /// it out before returning), [`SetupResponse::Out`] to accept a
    /// host-to-device data stage, or [`SetupResponse::Ack`] for
    /// no-data requests. Any error stalls endpoint 0.
    fn setup(&mut self, setup: &SetupPacket) -> Result<SetupResponse<'_>, ControlError>;

    /// Data from a host-to-device control data stage.
    ///
    /// Rejecting the payload stalls the status phase.
    fn control_data(&mut self, setup: &SetupPacket, data: &[u8]) -> Result<(), ControlError> {
        let _ = (setup, data);
        Ok(())
    }

    /// A queued request retired; ownership returns to the function.
    fn complete(&mut self, endpoint: EndpointAddress, request: Request);

    /// The host vanished: bus reset while owned, or cable removal.
    fn disconnect(&mut self) {}

    /// The bus suspended. Runs in the deferred context.
    fn suspend(&mut self) {}

    /// The bus resumed. Runs in the deferred context.
    fn resume(&mut self) {}
}

/// The function driver's answer to a delegated setup packet.
pub enum SetupResponse<'a> {
    /// No data stage; go straight to the status phase.
    Ack,
    /// Device-to-host data stage carrying these bytes.
    In(&'a [u8]),
    /// Host-to-device data stage of at most this many bytes; the
    /// payload arrives through [`UsbFunction::control_data`].
    Out(usize),
}

/// Endpoint declaration interface handed to [`UsbFunction::bind`].
pub trait EndpointSetup {
    /// Enable an endpoint with the given type and max packet size.
    fn enable_endpoint(
        &mut self,
        addr: EndpointAddress,
        kind: EndpointKind,
        max_packet: u16,
    ) -> Result<(), Error>;

    /// Carve a transfer buffer out of the endpoint memory.
    fn allocate_buffer(&mut self, size: usize) -> Option<Buffer>;
}

/// The battery charging collaborator.
///
/// All calls arrive from the deferred context, never from the
/// interrupt handler.
pub trait ChargerControl {
    /// The peer's negotiated (or assumed) current budget changed.
    fn set_current_limit(&mut self, milliamps: u16);

    /// The classifier decided the peer is a dedicated charger.
    fn notify_charger_present(&mut self) {}

    /// The cable was removed.
    fn notify_disconnected(&mut self) {}
}

/// Platform one-shot timer used by the connection classifier.
///
/// When an armed timer expires, call
/// [`Driver::classifier_timeout`](crate::Driver::classifier_timeout)
/// with the same token. Tokens are generation-counted, so firing or
/// cancelling a stale token is harmless.
pub trait TimerService {
    /// Arm a one-shot timer.
    fn arm(&mut self, token: TimerToken, milliseconds: u32);

    /// Cancel an armed timer. Cancelling an expired or unknown token
    /// is a no-op.
    fn cancel(&mut self, token: TimerToken);
}
