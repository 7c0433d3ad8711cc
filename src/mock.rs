//! Host-side test support
//!
//! A controller simulated in plain memory: the register block is a
//! zeroed `RegisterBlock` the tests poke directly, standing in for the
//! state transitions real hardware would make. Recording collaborators
//! capture everything the engine tells them.

use std::{boxed::Box, vec::Vec};

use usb_device::endpoint::EndpointAddress;

use crate::{
    buffer::EndpointMemory,
    classifier::TimerToken,
    control::SetupPacket,
    error::{ControlError, Error, TransferStatus},
    function::{ChargerControl, EndpointSetup, SetupResponse, TimerService, UsbFunction},
    queue::EndpointKind,
    ral::usb::RegisterBlock,
    request::Request,
    state::DeviceState,
    Peripherals,
};

/// Everything a `Driver` borrows, owned with stable addresses.
pub struct Harness {
    pub regs: Box<RegisterBlock>,
    pub state: DeviceState,
    pub memory: Box<EndpointMemory<40960>>,
}

impl Harness {
    pub fn new() -> Self {
        Harness {
            regs: Box::new(RegisterBlock::new()),
            state: DeviceState::new(),
            memory: Box::new(EndpointMemory::new()),
        }
    }

    pub fn peripherals(&self) -> MockPeripherals {
        MockPeripherals {
            core: &*self.regs as *const RegisterBlock as *const (),
        }
    }

    /// Hardware accepted the prime: the prime bit clears and the
    /// endpoint reports an active transfer buffer.
    pub fn consume_prime(&self) {
        let pending = self.regs.ENDPTPRIME.read();
        self.regs.ENDPTPRIME.write(0);
        self.regs.ENDPTSTAT.write(self.regs.ENDPTSTAT.read() | pending);
    }

    /// Hardware finished the endpoint's chain and raised a completion.
    pub fn raise_complete(&self, ep_bit: u32) {
        self.regs.ENDPTSTAT.write(self.regs.ENDPTSTAT.read() & !ep_bit);
        self.regs
            .ENDPTCOMPLETE
            .write(self.regs.ENDPTCOMPLETE.read() | ep_bit);
    }

    /// Idle line state typical of a host-side pull-down pair.
    pub fn line_state_host(&self) {
        self.regs.PORTSC1.write(self.regs.PORTSC1.read() & !(0x3 << 10));
    }

    /// Both data lines asserted: shorted, charger-style wiring.
    pub fn line_state_charger(&self) {
        self.regs.PORTSC1.write(self.regs.PORTSC1.read() | (0x3 << 10));
    }
}

pub struct MockPeripherals {
    core: *const (),
}

unsafe impl Peripherals for MockPeripherals {
    fn core(&self) -> *const () {
        self.core
    }
}

/// How the recording function answers delegated setup packets.
pub enum SetupBehavior {
    Stall,
    Ack,
    Reply(Vec<u8>),
    Accept(usize),
}

/// Endpoints declared during `bind`.
pub struct BoundEndpoint {
    pub addr: EndpointAddress,
    pub kind: EndpointKind,
    pub max_packet: u16,
}

/// A function driver that records every callback.
pub struct RecordingFunction {
    pub behavior: SetupBehavior,
    pub endpoints: Vec<BoundEndpoint>,
    pub setups: Vec<SetupPacket>,
    /// (endpoint, tag, status, actual) per completion, in order.
    pub completed: Vec<(EndpointAddress, u32, TransferStatus, usize)>,
    /// ENDPTPRIME snapshot taken inside each completion callback.
    pub prime_at_complete: Vec<u32>,
    pub control_out: Vec<Vec<u8>>,
    pub disconnects: usize,
    pub suspends: usize,
    pub resumes: usize,
    regs: *const RegisterBlock,
}

impl RecordingFunction {
    pub fn new(harness: &Harness) -> Self {
        RecordingFunction {
            behavior: SetupBehavior::Stall,
            endpoints: Vec::new(),
            setups: Vec::new(),
            completed: Vec::new(),
            prime_at_complete: Vec::new(),
            control_out: Vec::new(),
            disconnects: 0,
            suspends: 0,
            resumes: 0,
            regs: &*harness.regs,
        }
    }

    pub fn with_endpoint(mut self, addr: u8, kind: EndpointKind, max_packet: u16) -> Self {
        self.endpoints.push(BoundEndpoint {
            addr: EndpointAddress::from(addr),
            kind,
            max_packet,
        });
        self
    }

    pub fn completed_tags(&self) -> Vec<u32> {
        self.completed.iter().map(|entry| entry.1).collect()
    }
}

impl UsbFunction for RecordingFunction {
    fn bind(&mut self, endpoints: &mut dyn EndpointSetup) -> Result<(), Error> {
        for endpoint in &self.endpoints {
            endpoints.enable_endpoint(endpoint.addr, endpoint.kind, endpoint.max_packet)?;
        }
        Ok(())
    }

    fn setup(&mut self, setup: &SetupPacket) -> Result<SetupResponse<'_>, ControlError> {
        self.setups.push(*setup);
        match &self.behavior {
            SetupBehavior::Stall => Err(ControlError::Unsupported),
            SetupBehavior::Ack => Ok(SetupResponse::Ack),
            SetupBehavior::Reply(bytes) => Ok(SetupResponse::In(bytes)),
            SetupBehavior::Accept(len) => Ok(SetupResponse::Out(*len)),
        }
    }

    fn control_data(&mut self, _setup: &SetupPacket, data: &[u8]) -> Result<(), ControlError> {
        self.control_out.push(data.to_vec());
        Ok(())
    }

    fn complete(&mut self, endpoint: EndpointAddress, request: Request) {
        let status = request.status().unwrap_or(TransferStatus::Success);
        self.completed
            .push((endpoint, request.tag(), status, request.actual()));
        // Safety: the harness outlives the function in every test.
        let prime = unsafe { (*self.regs).ENDPTPRIME.read() };
        self.prime_at_complete.push(prime);
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
    }

    fn suspend(&mut self) {
        self.suspends += 1;
    }

    fn resume(&mut self) {
        self.resumes += 1;
    }
}

/// A charging collaborator that records every notification.
#[derive(Default)]
pub struct RecordingCharger {
    pub limits: Vec<u16>,
    pub charger_present: usize,
    pub disconnected: usize,
}

impl ChargerControl for RecordingCharger {
    fn set_current_limit(&mut self, milliamps: u16) {
        self.limits.push(milliamps);
    }

    fn notify_charger_present(&mut self) {
        self.charger_present += 1;
    }

    fn notify_disconnected(&mut self) {
        self.disconnected += 1;
    }
}

/// A timer service tracking which tokens are still armed.
#[derive(Default)]
pub struct RecordingTimer {
    pub active: Vec<TimerToken>,
    pub arms: Vec<(TimerToken, u32)>,
    pub cancels: Vec<TimerToken>,
}

impl RecordingTimer {
    /// Take the oldest armed token, as if it just expired.
    pub fn fire(&mut self) -> Option<TimerToken> {
        if self.active.is_empty() {
            None
        } else {
            Some(self.active.remove(0))
        }
    }
}

impl TimerService for RecordingTimer {
    fn arm(&mut self, token: TimerToken, milliseconds: u32) {
        self.arms.push((token, milliseconds));
        self.active.push(token);
    }

    fn cancel(&mut self, token: TimerToken) {
        self.cancels.push(token);
        self.active.retain(|armed| *armed != token);
    }
}
