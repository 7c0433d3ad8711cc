//! Endpoint 0 control transfer state machine
//!
//! The machine tracks the Setup/Data/Status phases and decodes the
//! standard requests the engine answers itself. Everything else is
//! delegated to the function driver. The driver module owns the
//! hardware effects; this module owns the states, the transitions, and
//! the decode, so both stay testable on their own.

use usb_device::{
    control,
    endpoint::EndpointAddress,
    UsbDirection,
};

/// The 8-byte header of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Unpack the little-endian setup buffer captured by the QH.
    pub(crate) fn from_raw(raw: u64) -> Self {
        let bytes = raw.to_le_bytes();
        SetupPacket {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Direction of the data stage, or of the request when there is
    /// no data.
    pub fn direction(&self) -> UsbDirection {
        if self.request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub fn request_type(&self) -> control::RequestType {
        match (self.request_type >> 5) & 0x3 {
            0 => control::RequestType::Standard,
            1 => control::RequestType::Class,
            2 => control::RequestType::Vendor,
            _ => control::RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> control::Recipient {
        match self.request_type & 0x1F {
            0 => control::Recipient::Device,
            1 => control::Recipient::Interface,
            2 => control::Recipient::Endpoint,
            3 => control::Recipient::Other,
            _ => control::Recipient::Reserved,
        }
    }

    /// The endpoint a recipient-endpoint request targets.
    pub fn endpoint(&self) -> EndpointAddress {
        EndpointAddress::from(self.index as u8)
    }
}

/// Phase of the current control exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// Idle; the next event of interest is a setup packet.
    WaitForSetup,
    /// A device-to-host data stage is on the IN queue.
    DataIn,
    /// A host-to-device data stage is on the OUT queue.
    DataOut,
    /// The zero-length status transaction is outstanding.
    WaitForStatus,
    /// Both directions of endpoint 0 are stalled; the next setup
    /// packet recovers.
    Stalled,
}

/// What an engine-handled (non-delegated) request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decoded {
    SetAddress(u8),
    SetConfiguration(u8),
    GetStatusDevice,
    GetStatusInterface,
    GetStatusEndpoint(EndpointAddress),
    GetConfiguration,
    SetEndpointHalt(EndpointAddress, bool),
    SetRemoteWakeup(bool),
    /// Anything the engine doesn't answer itself.
    Delegate,
    /// Recognized as standard, but malformed or unanswerable.
    Unsupported,
}

/// Classify a setup packet into engine-handled and delegated requests.
///
/// Class and vendor requests always delegate. Standard requests the
/// engine owns are address, configuration, status, and feature
/// handling; descriptors and interface state belong to the function
/// driver.
pub(crate) fn decode(setup: &SetupPacket) -> Decoded {
    use control::{Recipient, Request, RequestType};

    if setup.request_type() != RequestType::Standard {
        return Decoded::Delegate;
    }

    match (setup.request, setup.recipient()) {
        (Request::SET_ADDRESS, Recipient::Device) => {
            if setup.value > 127 || setup.length != 0 {
                Decoded::Unsupported
            } else {
                Decoded::SetAddress(setup.value as u8)
            }
        }
        (Request::SET_CONFIGURATION, Recipient::Device) => {
            Decoded::SetConfiguration(setup.value as u8)
        }
        (Request::GET_CONFIGURATION, Recipient::Device) => Decoded::GetConfiguration,
        (Request::GET_STATUS, Recipient::Device) => Decoded::GetStatusDevice,
        (Request::GET_STATUS, Recipient::Interface) => Decoded::GetStatusInterface,
        (Request::GET_STATUS, Recipient::Endpoint) => {
            Decoded::GetStatusEndpoint(setup.endpoint())
        }
        (Request::SET_FEATURE, Recipient::Endpoint)
            if setup.value == Request::FEATURE_ENDPOINT_HALT =>
        {
            Decoded::SetEndpointHalt(setup.endpoint(), true)
        }
        (Request::CLEAR_FEATURE, Recipient::Endpoint)
            if setup.value == Request::FEATURE_ENDPOINT_HALT =>
        {
            Decoded::SetEndpointHalt(setup.endpoint(), false)
        }
        (Request::SET_FEATURE, Recipient::Device)
            if setup.value == Request::FEATURE_DEVICE_REMOTE_WAKEUP =>
        {
            Decoded::SetRemoteWakeup(true)
        }
        (Request::CLEAR_FEATURE, Recipient::Device)
            if setup.value == Request::FEATURE_DEVICE_REMOTE_WAKEUP =>
        {
            Decoded::SetRemoteWakeup(false)
        }
        (Request::SET_FEATURE, _) | (Request::CLEAR_FEATURE, _) => Decoded::Unsupported,
        _ => Decoded::Delegate,
    }
}

/// Which phase an endpoint 0 completion closed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    DataInDone,
    DataOutDone,
    StatusDone,
    /// Completion didn't match the current phase; state unchanged.
    Spurious,
}

#[derive(Clone, Copy)]
pub(crate) struct ControlMachine {
    state: ControlState,
    setup: Option<SetupPacket>,
    /// Address to latch into the bus state once the status phase lands.
    pub(crate) pending_address: Option<u8>,
    /// Configuration to apply once the status phase lands.
    pub(crate) pending_config: Option<u8>,
}

impl ControlMachine {
    pub const fn new() -> Self {
        ControlMachine {
            state: ControlState::WaitForSetup,
            setup: None,
            pending_address: None,
            pending_config: None,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn setup(&self) -> Option<&SetupPacket> {
        self.setup.as_ref()
    }

    /// A new setup packet aborts whatever was in flight and restarts
    /// at decode, from any state.
    pub fn begin(&mut self, setup: SetupPacket) {
        self.setup = Some(setup);
        self.pending_address = None;
        self.pending_config = None;
        self.state = ControlState::WaitForSetup;
    }

    pub fn data_in(&mut self) {
        self.state = ControlState::DataIn;
    }

    pub fn data_out(&mut self) {
        self.state = ControlState::DataOut;
    }

    pub fn await_status(&mut self) {
        self.state = ControlState::WaitForStatus;
    }

    /// Stall both directions of endpoint 0 until the next setup.
    pub fn stall(&mut self) {
        self.state = ControlState::Stalled;
        self.setup = None;
        self.pending_address = None;
        self.pending_config = None;
    }

    /// Return to idle, dropping any half-finished exchange.
    pub fn idle(&mut self) {
        self.state = ControlState::WaitForSetup;
        self.setup = None;
        self.pending_address = None;
        self.pending_config = None;
    }

    /// Fold an endpoint 0 request completion into the machine.
    pub fn on_complete(&mut self, direction: UsbDirection) -> Phase {
        match (self.state, direction) {
            (ControlState::DataIn, UsbDirection::In) => Phase::DataInDone,
            (ControlState::DataOut, UsbDirection::Out) => Phase::DataOutDone,
            (ControlState::WaitForStatus, _) => {
                self.state = ControlState::WaitForSetup;
                self.setup = None;
                Phase::StatusDone
            }
            _ => Phase::Spurious,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{decode, ControlMachine, ControlState, Decoded, Phase, SetupPacket};
    use usb_device::UsbDirection;

    fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
        SetupPacket {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    #[test]
    fn raw_unpack() {
        // GET_DESCRIPTOR(device), wLength = 64
        let raw = u64::from_le_bytes([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00]);
        let setup = SetupPacket::from_raw(raw);
        assert_eq!(setup.request_type, 0x80);
        assert_eq!(setup.request, 0x06);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.index, 0);
        assert_eq!(setup.length, 64);
        assert_eq!(setup.direction(), UsbDirection::In);
    }

    #[test]
    fn standard_requests_decode() {
        assert_eq!(decode(&setup(0x00, 0x05, 9, 0, 0)), Decoded::SetAddress(9));
        assert_eq!(
            decode(&setup(0x00, 0x05, 200, 0, 0)),
            Decoded::Unsupported
        );
        assert_eq!(
            decode(&setup(0x00, 0x09, 1, 0, 0)),
            Decoded::SetConfiguration(1)
        );
        assert_eq!(decode(&setup(0x80, 0x00, 0, 0, 2)), Decoded::GetStatusDevice);
        assert_eq!(decode(&setup(0x80, 0x08, 0, 0, 1)), Decoded::GetConfiguration);
        // GET_DESCRIPTOR belongs to the function driver
        assert_eq!(decode(&setup(0x80, 0x06, 0x0100, 0, 18)), Decoded::Delegate);
        // class requests always delegate
        assert_eq!(decode(&setup(0x21, 0x20, 0, 0, 7)), Decoded::Delegate);
    }

    #[test]
    fn endpoint_halt_targets_endpoint() {
        let decoded = decode(&setup(0x02, 0x03, 0, 0x81, 0));
        match decoded {
            Decoded::SetEndpointHalt(ep, true) => {
                assert_eq!(ep.index(), 1);
                assert_eq!(ep.direction(), UsbDirection::In);
            }
            other => panic!("unexpected decode {:?}", other),
        }
        // unknown feature selector
        assert_eq!(decode(&setup(0x02, 0x03, 7, 0x81, 0)), Decoded::Unsupported);
    }

    #[test]
    fn status_completion_reaches_wait_for_setup() {
        // from every state, each of {status completion, stall, new
        // setup} lands in WaitForSetup (or Stalled, whose next setup
        // recovers) within one transition
        let states: [fn(&mut ControlMachine); 5] = [
            |_| {},
            ControlMachine::data_in,
            ControlMachine::data_out,
            ControlMachine::await_status,
            ControlMachine::stall,
        ];
        for enter in states {
            let mut machine = ControlMachine::new();
            machine.begin(setup(0x80, 0x06, 0, 0, 8));
            enter(&mut machine);

            let mut by_status = machine;
            if by_status.state() == ControlState::WaitForStatus {
                assert_eq!(by_status.on_complete(UsbDirection::In), Phase::StatusDone);
                assert_eq!(by_status.state(), ControlState::WaitForSetup);
            }

            let mut by_setup = machine;
            by_setup.begin(setup(0x00, 0x05, 4, 0, 0));
            assert_eq!(by_setup.state(), ControlState::WaitForSetup);

            let mut by_stall = machine;
            by_stall.stall();
            assert_eq!(by_stall.state(), ControlState::Stalled);
            by_stall.begin(setup(0x00, 0x05, 4, 0, 0));
            assert_eq!(by_stall.state(), ControlState::WaitForSetup);
        }
    }

    #[test]
    fn data_phases_report_direction_match() {
        let mut machine = ControlMachine::new();
        machine.begin(setup(0x80, 0x06, 0, 0, 8));
        machine.data_in();
        assert_eq!(machine.on_complete(UsbDirection::Out), Phase::Spurious);
        assert_eq!(machine.on_complete(UsbDirection::In), Phase::DataInDone);

        machine.data_out();
        assert_eq!(machine.on_complete(UsbDirection::Out), Phase::DataOutDone);

        machine.await_status();
        assert_eq!(machine.on_complete(UsbDirection::In), Phase::StatusDone);
        assert_eq!(machine.state(), ControlState::WaitForSetup);
    }
}
