//! The controller engine
//!
//! `Driver` owns every piece of mutable controller state: the hardware
//! queue heads, the descriptor pool, the per-endpoint request queues,
//! and the bus, control, and classifier state machines. It has two
//! entry points per context: [`poll`](Driver::poll) services the
//! coalesced interrupt status word and never blocks unboundedly, while
//! [`run_deferred`](Driver::run_deferred) and
//! [`classifier_timeout`](Driver::classifier_timeout) run from a
//! context that may sleep and own every call into the charging
//! collaborator.

use usb_device::{endpoint::EndpointAddress, UsbDirection};

use crate::{
    buffer::{Allocator, Buffer},
    classifier::{Classifier, ClassifierAction, Classification, TimerToken},
    control::{self, ControlMachine, ControlState, Phase, SetupPacket},
    device::{BusMachine, BusState, Speed},
    error::{Error, Handshake},
    event::{DeferredEvent, EventQueue},
    function::{ChargerControl, EndpointSetup, SetupResponse, TimerService, UsbFunction},
    pool::TdPool,
    qh::Qh,
    queue::{EndpointKind, EndpointQueue, Progress, REQUESTS_PER_ENDPOINT},
    ral, qh_index,
    request::Request,
    state::DeviceState,
    Peripherals, QH_COUNT,
};

/// Current draw allowed before a host configures us.
pub const VBUS_DRAW_UNCONFIGURED_MA: u16 = 100;

/// Fixed draw offered to a dedicated charger that never enumerates.
///
/// Conservative: dumb chargers advertise no budget, and 500 mA is the
/// least any of them supplies.
pub const CHARGER_CURRENT_MA: u16 = 500;

/// Window the classifier waits for protocol activity before retrying.
pub const CLASSIFY_TIMEOUT_MS: u32 = 1000;

/// Iteration ceiling for the setup-capture tripwire.
const SETUP_TRIPWIRE_RETRIES: usize = 10_000;

/// Iteration ceiling for the controller reset to self-clear.
const RESET_RETRIES: usize = 10_000;

/// Iteration ceiling waiting for an in-flight prime during bus reset.
const PRIME_SETTLE_RETRIES: usize = 10_000;

const EP0_MAX_PACKET: u16 = 64;

/// Engine-owned buffer backing each direction of endpoint 0.
const EP0_BUFFER_LEN: usize = 256;

/// Direct index to the OUT control endpoint
const CTRL_OUT: usize = 0;

/// Direct index to the IN control endpoint
const CTRL_IN: usize = 1;

fn endpoint_for(index: usize) -> EndpointAddress {
    let direction = if index % 2 == 1 {
        UsbDirection::In
    } else {
        UsbDirection::Out
    };
    EndpointAddress::from_parts(index / 2, direction)
}

/// The USB device controller engine
///
/// After you allocate a `Driver` with [`new()`](Driver::new), you must
///
/// - call [`initialize()`](Driver::initialize) once
/// - attach your function driver with [`bind()`](Driver::bind)
/// - present the device with [`request_pullup()`](Driver::request_pullup)
pub struct Driver<'a> {
    usb: ral::usb::Instance,
    qhs: &'a [Qh; QH_COUNT],
    pool: TdPool<'a>,
    queues: [EndpointQueue; QH_COUNT],
    allocator: Allocator<'a>,
    /// Taken while an engine-internal IN request is outstanding.
    ep0_in: Option<Buffer>,
    /// Taken while an engine-internal OUT request is outstanding.
    ep0_out: Option<Buffer>,
    control: ControlMachine,
    bus: BusMachine,
    classifier: Classifier,
    deferred: EventQueue,
    self_powered: bool,
    remote_wakeup: bool,
    /// Configured draw reported by the function driver, in mA.
    power_budget_ma: u16,
    /// The charging collaborator took over current-limit ownership.
    charger_owns_limit: bool,
    pullup: bool,
}

impl<'a> Driver<'a> {
    /// Create a new `Driver`
    ///
    /// Creation does nothing except take ownership of the register
    /// block and the shared hardware state. After creating the driver,
    /// call [`initialize()`](Driver::initialize).
    ///
    /// # Panics
    ///
    /// Panics if `state` or `memory` was already assigned to another
    /// driver, or if `memory` is too small for the engine's endpoint 0
    /// buffers.
    pub fn new<P: Peripherals, const SIZE: usize>(
        peripherals: P,
        state: &'a DeviceState,
        memory: &'a crate::buffer::EndpointMemory<SIZE>,
    ) -> Self {
        let usb = ral::instance(peripherals);
        let lists = state.take().expect("Device state already assigned");
        let mut allocator = memory.allocator().expect("Endpoint memory already assigned");
        let ep0_in = allocator
            .allocate(EP0_BUFFER_LEN)
            .expect("Endpoint memory too small for control buffers");
        let ep0_out = allocator
            .allocate(EP0_BUFFER_LEN)
            .expect("Endpoint memory too small for control buffers");
        Driver {
            usb,
            qhs: lists.qhs,
            pool: TdPool::new(lists.tds),
            queues: core::array::from_fn(|index| EndpointQueue::new(endpoint_for(index))),
            allocator,
            ep0_in: Some(ep0_in),
            ep0_out: Some(ep0_out),
            control: ControlMachine::new(),
            bus: BusMachine::new(),
            classifier: Classifier::new(),
            deferred: EventQueue::new(),
            self_powered: false,
            remote_wakeup: false,
            power_budget_ma: 0,
            charger_owns_limit: false,
            pullup: false,
        }
    }

    /// Reset the controller core and set up device-mode operation.
    ///
    /// Assumes the platform finished clock and PHY setup. Call once
    /// before binding a function.
    pub fn initialize(&mut self) -> Result<(), Error> {
        self.controller_reset()?;
        self.configure_controller();
        Ok(())
    }

    /// Issue a core reset and wait, bounded, for it to self-clear.
    fn controller_reset(&mut self) -> Result<(), Error> {
        ral::write_reg!(ral::usb, self.usb, USBCMD, RST: 1);
        for _ in 0..RESET_RETRIES {
            if ral::read_reg!(ral::usb, self.usb, USBCMD, RST == 0) {
                return Ok(());
            }
        }
        warn!("controller reset did not self-clear");
        Err(Error::HardwareTimeout(Handshake::ControllerReset))
    }

    /// Program device mode, interrupts, and the QH list address.
    pub(crate) fn configure_controller(&mut self) {
        // ITC is reset to some non-immediate value. Use the 'immediate'
        // value by default. (Note: this also zeros all other USBCMD fields.)
        ral::write_reg!(ral::usb, self.usb, USBCMD, ITC: 0);

        // Device mode, with setup lockout off; we use the tripwire.
        ral::write_reg!(ral::usb, self.usb, USBMODE, CM: 2, SLOM: 1);

        ral::modify_reg!(ral::usb, self.usb, USBSTS, |usbsts| usbsts);
        ral::write_reg!(ral::usb, self.usb, USBINTR, UE: 1, UEE: 1, PCE: 1, URE: 1, SLE: 1);

        ral::write_reg!(
            ral::usb,
            self.usb,
            ENDPTLISTADDR,
            self.qhs.as_ptr() as usize as u32
        );

        // the control queues are always live
        self.queues[CTRL_OUT].enable(
            &self.usb,
            &self.qhs[CTRL_OUT],
            EndpointKind::Control,
            EP0_MAX_PACKET,
        );
        self.queues[CTRL_IN].enable(
            &self.usb,
            &self.qhs[CTRL_IN],
            EndpointKind::Control,
            EP0_MAX_PACKET,
        );

        if self.pullup {
            ral::modify_reg!(ral::usb, self.usb, USBCMD, RS: 1);
        }
    }

    /// Attach the function driver, letting it declare its endpoints.
    pub fn bind(&mut self, function: &mut dyn UsbFunction) -> Result<(), Error> {
        function.bind(self)?;
        debug!("BIND");
        Ok(())
    }

    /// Detach the function driver, cancelling everything it owns.
    pub fn unbind(&mut self, function: &mut dyn UsbFunction) {
        self.cancel_all(function);
        function.unbind();
        debug!("UNBIND");
    }

    /// Present (`true`) or withdraw (`false`) the device to the host.
    pub fn request_pullup(&mut self, pullup: bool) {
        self.pullup = pullup;
        ral::modify_reg!(ral::usb, self.usb, USBCMD, RS: pullup as u32);
    }

    /// Disable a previously enabled endpoint, cancelling its queue.
    pub fn disable_endpoint(&mut self, addr: EndpointAddress) -> Result<(), Error> {
        let index = self.checked_index(addr)?;
        if index <= CTRL_IN {
            return Err(Error::InvalidEndpoint);
        }
        let _ = self.queues[index].drain(&self.usb, &mut self.pool);
        self.queues[index].disable(&self.usb);
        Ok(())
    }

    /// Queue a request on an endpoint.
    ///
    /// On failure the request comes back in the error; descriptor
    /// exhaustion retires it with
    /// [`TransferStatus::OutOfMemory`](crate::TransferStatus::OutOfMemory)
    /// and leaves the endpoint otherwise untouched. Endpoint 0 is the
    /// engine's; control data flows through
    /// [`UsbFunction::setup`](crate::UsbFunction::setup) instead.
    pub fn queue(
        &mut self,
        addr: EndpointAddress,
        request: Request,
    ) -> Result<(), (Error, Request)> {
        let index = match self.checked_index(addr) {
            Ok(index) if index > CTRL_IN => index,
            Ok(_) => return Err((Error::InvalidEndpoint, request)),
            Err(error) => return Err((error, request)),
        };
        self.queues[index].enqueue(&self.usb, &mut self.pool, &self.qhs[index], request)
    }

    /// Remove one request, identified by tag, from an endpoint queue.
    ///
    /// Returns the request with a `Cancelled` status, or `None` when no
    /// queued request carries the tag.
    pub fn dequeue(&mut self, addr: EndpointAddress, tag: u32) -> Option<Request> {
        let index = self.checked_index(addr).ok()?;
        self.queues[index].dequeue(&self.usb, &mut self.pool, &self.qhs[index], tag)
    }

    /// Cancel every outstanding request on an endpoint.
    ///
    /// Requests come back with a `Cancelled` status, oldest first.
    /// Draining an already-empty endpoint is a no-op and returns an
    /// empty list.
    pub fn dequeue_all(
        &mut self,
        addr: EndpointAddress,
    ) -> heapless::Vec<Request, REQUESTS_PER_ENDPOINT> {
        match self.checked_index(addr) {
            Ok(index) => self.drain_index(index),
            Err(_) => heapless::Vec::new(),
        }
    }

    /// Halt or clear an endpoint. Clearing also resets the data toggle
    /// and restarts a waiting transfer.
    pub fn set_halt(&mut self, addr: EndpointAddress, halt: bool) -> Result<(), Error> {
        let index = self.checked_index(addr)?;
        self.queues[index].set_halt(&self.usb, halt);
        if !halt {
            self.queues[index].start_head(&self.usb, &self.pool, &self.qhs[index]);
        }
        Ok(())
    }

    /// Bytes the endpoint's head request still has in flight.
    pub fn fifo_status(&self, addr: EndpointAddress) -> Result<usize, Error> {
        let index = self.checked_index(addr)?;
        Ok(self.queues[index].fifo_status(&self.pool))
    }

    /// Discard whatever the endpoint FIFO holds.
    pub fn fifo_flush(&mut self, addr: EndpointAddress) -> Result<(), Error> {
        let index = self.checked_index(addr)?;
        self.queues[index].flush(&self.usb)
    }

    /// The current USB frame number.
    pub fn get_frame_number(&self) -> u16 {
        let frindex = ral::read_reg!(ral::usb, self.usb, FRINDEX, FRINDEX);
        // low three bits count microframes
        ((frindex >> 3) & 0x7FF) as u16
    }

    /// Signal remote wakeup to a suspended host.
    ///
    /// Only valid while suspended and after the host enabled the
    /// remote-wakeup feature.
    pub fn request_wakeup(&mut self) -> Result<(), Error> {
        if !self.bus.is_suspended() || !self.remote_wakeup {
            return Err(Error::InvalidState);
        }
        ral::modify_reg!(ral::usb, self.usb, PORTSC1, FPR: 1);
        Ok(())
    }

    /// Report whether the device runs on its own power.
    pub fn set_self_powered(&mut self, self_powered: bool) {
        self.self_powered = self_powered;
    }

    /// Report the configured current draw, in mA, from the selected
    /// configuration's descriptor.
    pub fn report_power_budget(&mut self, milliamps: u16) {
        self.power_budget_ma = milliamps;
        if self.bus.is_configured() {
            self.deferred.push(DeferredEvent::SetCurrentLimit(milliamps));
        }
    }

    /// VBUS appeared or vanished. Drives the connection classifier.
    pub fn notify_vbus_present(&mut self, present: bool, function: &mut dyn UsbFunction) {
        if present {
            self.classify_insertion();
        } else {
            self.handle_removal(function);
        }
    }

    /// Re-run connection classification on request, e.g. from the
    /// charging collaborator.
    pub fn reclassify(&mut self) {
        use crate::classifier::ClassifierState;
        match self.classifier.state() {
            ClassifierState::Idle | ClassifierState::Disconnected => {}
            _ => {
                self.charger_owns_limit = false;
                self.classify_insertion();
            }
        }
    }

    /// The charging collaborator takes over current-limit ownership,
    /// e.g. while we're suspended. The engine stops pushing limits
    /// until resume or reclassification.
    pub fn handle_charging(&mut self) {
        self.charger_owns_limit = true;
    }

    /// Allocate a transfer buffer from the endpoint memory.
    pub fn allocate_buffer(&mut self, size: usize) -> Option<Buffer> {
        self.allocator.allocate(size)
    }

    pub fn bus_state(&self) -> BusState {
        self.bus.state()
    }

    pub fn speed(&self) -> Speed {
        self.bus.speed()
    }

    pub fn control_state(&self) -> ControlState {
        self.control.state()
    }

    pub fn classification(&self) -> Option<Classification> {
        self.classifier.classification()
    }

    /// Service the interrupt status word.
    ///
    /// Call from the USB interrupt handler, or poll it. Performs only
    /// bounded work: reset/suspend bookkeeping, setup capture,
    /// completion retirement, and deferral of everything slow.
    pub fn poll(&mut self, function: &mut dyn UsbFunction) -> Result<(), Error> {
        let usbsts = ral::read_reg!(ral::usb, self.usb, USBSTS);
        ral::write_reg!(ral::usb, self.usb, USBSTS, usbsts);

        use ral::usb::USBSTS;
        if usbsts & USBSTS::URI::mask != 0 {
            self.handle_bus_reset(function)?;
        }
        if usbsts & USBSTS::PCI::mask != 0 {
            self.handle_port_change();
        }
        if usbsts & USBSTS::SLI::mask != 0 && self.bus.suspend() {
            debug!("SUSPEND");
            self.deferred.push(DeferredEvent::Suspended);
        }
        if usbsts & USBSTS::UI::mask != 0 {
            if ral::read_reg!(ral::usb, self.usb, ENDPTSETUPSTAT) & 1 != 0 {
                self.handle_setup(function)?;
            }

            let complete = ral::read_reg!(ral::usb, self.usb, ENDPTCOMPLETE);
            ral::write_reg!(ral::usb, self.usb, ENDPTCOMPLETE, complete);
            for index in 0..QH_COUNT {
                let bit = match index % 2 {
                    0 => 1 << (index / 2),
                    _ => 1 << (16 + index / 2),
                };
                if complete & bit != 0 {
                    self.on_ep_complete(index, function);
                }
            }
        }
        Ok(())
    }

    /// Drain deferred work. Call from a context that may sleep.
    pub fn run_deferred(
        &mut self,
        function: &mut dyn UsbFunction,
        charger: &mut dyn ChargerControl,
        timer: &mut dyn TimerService,
    ) {
        while let Some(event) = self.deferred.pop() {
            match event {
                DeferredEvent::ArmClassifierTimer(token) => timer.arm(token, CLASSIFY_TIMEOUT_MS),
                DeferredEvent::CancelClassifierTimer(token) => timer.cancel(token),
                DeferredEvent::SetCurrentLimit(milliamps) => {
                    if !self.charger_owns_limit {
                        charger.set_current_limit(milliamps);
                    }
                }
                DeferredEvent::ChargerPresent => charger.notify_charger_present(),
                DeferredEvent::PeerDisconnected => charger.notify_disconnected(),
                DeferredEvent::Suspended => {
                    // low-power entry tolerates the settling delay here
                    ral::modify_reg!(ral::usb, self.usb, PORTSC1, PHCD: 1);
                    function.suspend();
                }
                DeferredEvent::Resumed => {
                    ral::modify_reg!(ral::usb, self.usb, PORTSC1, PHCD: 0);
                    self.charger_owns_limit = false;
                    function.resume();
                }
            }
        }
    }

    /// An armed classifier timer expired. Call from the deferred
    /// context with the token the timer was armed with; stale tokens
    /// are ignored.
    pub fn classifier_timeout(
        &mut self,
        token: TimerToken,
        charger: &mut dyn ChargerControl,
        timer: &mut dyn TimerService,
    ) {
        match self.classifier.timeout(token) {
            ClassifierAction::Retry { rearm } => {
                debug!("CLASSIFY RETRY");
                // first recovery policy: nudge the host with a fresh
                // controller, in case enumeration died half-way
                if self.controller_reset().is_err() {
                    warn!("classifier retry: controller stuck in reset");
                }
                self.configure_controller();
                timer.arm(rearm, CLASSIFY_TIMEOUT_MS);
            }
            ClassifierAction::ChargerAssumed => {
                // second, independent recovery policy: stop waiting and
                // take the fixed charger current
                debug!("CHARGER (assumed)");
                if !self.charger_owns_limit {
                    charger.set_current_limit(CHARGER_CURRENT_MA);
                }
                charger.notify_charger_present();
            }
            _ => {}
        }
    }

    fn checked_index(&self, addr: EndpointAddress) -> Result<usize, Error> {
        if addr.index() >= QH_COUNT / 2 {
            return Err(Error::InvalidEndpoint);
        }
        let index = qh_index(addr);
        if self.queues[index].is_enabled() {
            Ok(index)
        } else {
            Err(Error::EndpointDisabled)
        }
    }

    /// Drain one endpoint queue, restoring engine buffers and
    /// returning only the function's requests.
    fn drain_index(&mut self, index: usize) -> heapless::Vec<Request, REQUESTS_PER_ENDPOINT> {
        let cancelled = self.queues[index].drain(&self.usb, &mut self.pool);
        let mut out = heapless::Vec::new();
        for request in cancelled {
            if request.internal {
                self.reclaim_ep0_buffer(index, request);
            } else if out.push(request).is_err() {
                unreachable!("drain capacity");
            }
        }
        out
    }

    fn reclaim_ep0_buffer(&mut self, index: usize, request: Request) {
        let buffer = request.into_buffer();
        match index {
            CTRL_IN => self.ep0_in = Some(buffer),
            CTRL_OUT => self.ep0_out = Some(buffer),
            _ => unreachable!("internal request outside EP0"),
        }
    }

    /// Cancel everything on every endpoint, delivering the function's
    /// requests through its completion callback.
    fn cancel_all(&mut self, function: &mut dyn UsbFunction) {
        for index in 0..QH_COUNT {
            let addr = self.queues[index].address();
            for request in self.drain_index(index) {
                function.complete(addr, request);
            }
        }
    }

    fn classify_insertion(&mut self) {
        let line_state = ral::read_reg!(ral::usb, self.usb, PORTSC1, LS);
        match self.classifier.insertion(line_state) {
            ClassifierAction::ChargerDetected => {
                debug!("CHARGER (line state)");
                self.deferred
                    .push(DeferredEvent::SetCurrentLimit(CHARGER_CURRENT_MA));
                self.deferred.push(DeferredEvent::ChargerPresent);
            }
            ClassifierAction::ArmTimer(token) => {
                self.deferred.push(DeferredEvent::ArmClassifierTimer(token));
            }
            _ => {}
        }
    }

    fn handle_removal(&mut self, function: &mut dyn UsbFunction) {
        match self.classifier.removal() {
            ClassifierAction::Removed { cancel } => {
                debug!("DISCONNECT");
                if let Some(token) = cancel {
                    self.deferred
                        .push(DeferredEvent::CancelClassifierTimer(token));
                }
                self.cancel_all(function);
                self.control.idle();
                self.bus.detached();
                function.disconnect();
                self.deferred.push(DeferredEvent::PeerDisconnected);
            }
            // removal of an absent cable is a no-op
            _ => {}
        }
    }

    /// Protocol activity (reset or setup) proves a host is out there.
    fn observe_activity(&mut self) {
        if let ClassifierAction::HostDetected { cancel } = self.classifier.activity() {
            debug!("HOST");
            self.deferred
                .push(DeferredEvent::CancelClassifierTimer(cancel));
            self.deferred
                .push(DeferredEvent::SetCurrentLimit(VBUS_DRAW_UNCONFIGURED_MA));
        }
    }

    fn handle_bus_reset(&mut self, function: &mut dyn UsbFunction) -> Result<(), Error> {
        self.observe_activity();

        ral::modify_reg!(ral::usb, self.usb, ENDPTSETUPSTAT, |setupstat| setupstat);
        ral::modify_reg!(ral::usb, self.usb, ENDPTCOMPLETE, |complete| complete);
        ral::modify_reg!(ral::usb, self.usb, ENDPTNAK, |nak| nak);
        ral::write_reg!(ral::usb, self.usb, ENDPTNAKEN, 0);

        let mut settled = false;
        for _ in 0..PRIME_SETTLE_RETRIES {
            if ral::read_reg!(ral::usb, self.usb, ENDPTPRIME) == 0 {
                settled = true;
                break;
            }
        }
        if !settled {
            warn!("bus reset with prime still pending");
        }

        self.cancel_all(function);

        let prior = self.bus.reset();
        self.control.idle();
        if matches!(prior, BusState::Address(_) | BusState::Configured(_)) {
            function.disconnect();
        }
        debug!("RESET");
        Ok(())
    }

    fn handle_port_change(&mut self) {
        let resetting = ral::read_reg!(ral::usb, self.usb, PORTSC1, PR == 1);
        if self.bus.is_suspended() {
            if self.bus.resume() {
                debug!("RESUME");
                self.deferred.push(DeferredEvent::Resumed);
            }
        } else if !resetting {
            // end of bus reset: the negotiated speed is now valid, and
            // holds until the next reset
            let pspd = ral::read_reg!(ral::usb, self.usb, PORTSC1, PSPD);
            self.bus.latch_speed(pspd);
            debug!("SPEED {:?}", self.bus.speed());
        }
    }

    /// Capture the setup buffer under the setup tripwire.
    fn read_setup(&mut self) -> Result<u64, Error> {
        // clear the setup bit *before* reading the buffer ("Control
        // Endpoint Operational Model"); the tripwire guards against a
        // new setup overwriting the bytes mid-read
        ral::write_reg!(ral::usb, self.usb, ENDPTSETUPSTAT, 1);
        for _ in 0..SETUP_TRIPWIRE_RETRIES {
            ral::modify_reg!(ral::usb, self.usb, USBCMD, SUTW: 1);
            let setup = self.qhs[CTRL_OUT].setup();
            if ral::read_reg!(ral::usb, self.usb, USBCMD, SUTW == 1) {
                ral::modify_reg!(ral::usb, self.usb, USBCMD, SUTW: 0);
                return Ok(setup);
            }
        }
        ral::modify_reg!(ral::usb, self.usb, USBCMD, SUTW: 0);
        warn!("setup capture tripwire timeout");
        Err(Error::HardwareTimeout(Handshake::SetupTripwire))
    }

    /// Stall both directions of endpoint 0.
    fn ep0_stall(&mut self) {
        self.queues[CTRL_OUT].set_halt(&self.usb, true);
        self.queues[CTRL_IN].set_halt(&self.usb, true);
        self.control.stall();
    }

    /// Queue an engine-internal request on one side of endpoint 0.
    fn queue_internal(
        &mut self,
        direction: UsbDirection,
        len: usize,
        data: Option<&[u8]>,
    ) -> Result<(), Error> {
        let index = match direction {
            UsbDirection::In => CTRL_IN,
            UsbDirection::Out => CTRL_OUT,
        };
        let mut buffer = match direction {
            UsbDirection::In => self.ep0_in.take(),
            UsbDirection::Out => self.ep0_out.take(),
        }
        .ok_or(Error::InvalidState)?;

        let len = len.min(EP0_BUFFER_LEN);
        if let Some(data) = data {
            buffer.volatile_write(&data[..len.min(data.len())]);
        }
        let mut request = Request::new(buffer, len);
        request.internal = true;

        match self.queues[index].enqueue(&self.usb, &mut self.pool, &self.qhs[index], request) {
            Ok(()) => Ok(()),
            Err((error, request)) => {
                self.reclaim_ep0_buffer(index, request);
                Err(error)
            }
        }
    }

    /// Prime the zero-length status transaction.
    fn queue_status(&mut self, direction: UsbDirection) -> Result<(), Error> {
        self.queue_internal(direction, 0, None)?;
        self.control.await_status();
        Ok(())
    }

    /// Short device-to-host reply served from the engine's buffer.
    fn local_reply(&mut self, setup: &SetupPacket, reply: &[u8]) -> Result<(), Error> {
        let len = reply.len().min(setup.length as usize);
        self.queue_internal(UsbDirection::In, len, Some(reply))?;
        self.control.data_in();
        Ok(())
    }

    fn handle_setup(&mut self, function: &mut dyn UsbFunction) -> Result<(), Error> {
        let raw = self.read_setup()?;
        let setup = SetupPacket::from_raw(raw);
        debug!(
            "SETUP {:02X} {:02X} {:04X}",
            setup.request_type, setup.request, setup.value
        );

        self.observe_activity();

        // a new setup aborts any stage in flight
        let _ = self.drain_index(CTRL_IN);
        let _ = self.drain_index(CTRL_OUT);
        self.queues[CTRL_OUT].set_halt(&self.usb, false);
        self.queues[CTRL_IN].set_halt(&self.usb, false);
        self.control.begin(setup);

        let outcome = self.dispatch_setup(&setup, function);
        if outcome.is_err() {
            warn!(
                "EP0 stall for {:02X} {:02X}",
                setup.request_type, setup.request
            );
            self.ep0_stall();
        }
        Ok(())
    }

    /// Decode and execute one setup packet. Any error means "stall".
    fn dispatch_setup(
        &mut self,
        setup: &SetupPacket,
        function: &mut dyn UsbFunction,
    ) -> Result<(), Error> {
        use control::Decoded;
        match control::decode(setup) {
            Decoded::SetAddress(address) => {
                // hardware advances the address only after the status
                // phase completes, so this meets the timing without
                // software help
                ral::write_reg!(ral::usb, self.usb, DEVICEADDR, USBADR: address as u32, USBADRA: 1);
                self.control.pending_address = Some(address);
                self.queue_status(UsbDirection::In)
            }
            Decoded::SetConfiguration(config) => match function.setup(setup) {
                Ok(SetupResponse::Ack) => {
                    self.control.pending_config = Some(config);
                    self.queue_status(UsbDirection::In)
                }
                _ => Err(Error::InvalidState),
            },
            Decoded::GetStatusDevice => {
                let status = self.self_powered as u16 | (self.remote_wakeup as u16) << 1;
                self.local_reply(setup, &status.to_le_bytes())
            }
            Decoded::GetStatusInterface => self.local_reply(setup, &0u16.to_le_bytes()),
            Decoded::GetStatusEndpoint(target) => {
                let index = self.checked_index(target)?;
                let halted = self.queues[index].is_halted(&self.usb);
                self.local_reply(setup, &(halted as u16).to_le_bytes())
            }
            Decoded::GetConfiguration => {
                let config = match self.bus.state() {
                    BusState::Configured(config) => config,
                    _ => 0,
                };
                self.local_reply(setup, &[config])
            }
            Decoded::SetEndpointHalt(target, halt) => {
                // touches only the target endpoint's halt and toggle
                let index = self.checked_index(target)?;
                self.queues[index].set_halt(&self.usb, halt);
                if !halt {
                    self.queues[index].start_head(&self.usb, &self.pool, &self.qhs[index]);
                }
                self.queue_status(UsbDirection::In)
            }
            Decoded::SetRemoteWakeup(enable) => {
                self.remote_wakeup = enable;
                self.queue_status(UsbDirection::In)
            }
            Decoded::Delegate => match function.setup(setup) {
                Ok(SetupResponse::Ack) => {
                    if setup.length == 0 {
                        self.queue_status(UsbDirection::In)
                    } else {
                        // acknowledging a request with a data stage is
                        // a handshake violation
                        Err(Error::InvalidState)
                    }
                }
                Ok(SetupResponse::In(reply)) => {
                    if setup.direction() != UsbDirection::In {
                        return Err(Error::InvalidState);
                    }
                    let reply_len = reply.len().min(setup.length as usize);
                    self.queue_internal(UsbDirection::In, reply_len, Some(reply))?;
                    self.control.data_in();
                    Ok(())
                }
                Ok(SetupResponse::Out(accept)) => {
                    if setup.direction() != UsbDirection::Out || setup.length == 0 {
                        return Err(Error::InvalidState);
                    }
                    let accept = accept.min(setup.length as usize);
                    self.queue_internal(UsbDirection::Out, accept, None)?;
                    self.control.data_out();
                    Ok(())
                }
                Err(_) => Err(Error::InvalidState),
            },
            Decoded::Unsupported => Err(Error::InvalidState),
        }
    }

    fn on_ep_complete(&mut self, index: usize, function: &mut dyn UsbFunction) {
        match self.queues[index].on_complete(&mut self.pool) {
            Progress::Retired(request) => {
                if index <= CTRL_IN {
                    self.on_ep0_complete(index, request, function);
                } else {
                    let addr = self.queues[index].address();
                    trace!("EP{} {:?} retired", addr.index(), addr.direction());
                    // the completion notification fires before the next
                    // request is promoted and primed
                    function.complete(addr, request);
                    self.queues[index].start_head(&self.usb, &self.pool, &self.qhs[index]);
                }
            }
            Progress::Incomplete | Progress::Idle => {}
        }
    }

    fn on_ep0_complete(&mut self, index: usize, request: Request, function: &mut dyn UsbFunction) {
        let direction = if index == CTRL_IN {
            UsbDirection::In
        } else {
            UsbDirection::Out
        };
        let actual = request.actual();
        let failed = request
            .status()
            .map(|status| status.is_error())
            .unwrap_or(true);

        if request.internal {
            self.reclaim_ep0_buffer(index, request);
        } else {
            // not ours; hand it back wherever it came from
            let addr = self.queues[index].address();
            function.complete(addr, request);
        }

        if failed {
            self.ep0_stall();
            return;
        }

        match self.control.on_complete(direction) {
            Phase::DataInDone => {
                if self.queue_status(UsbDirection::Out).is_err() {
                    self.ep0_stall();
                }
            }
            Phase::DataOutDone => {
                let Some(setup) = self.control.setup().copied() else {
                    self.ep0_stall();
                    return;
                };
                let mut scratch = [0u8; EP0_BUFFER_LEN];
                let len = actual.min(EP0_BUFFER_LEN);
                if let Some(buffer) = self.ep0_out.as_ref() {
                    buffer.volatile_read(&mut scratch[..len]);
                }
                let accepted = function.control_data(&setup, &scratch[..len]).is_ok();
                if !accepted || self.queue_status(UsbDirection::In).is_err() {
                    self.ep0_stall();
                }
            }
            Phase::StatusDone => {
                if let Some(address) = self.control.pending_address.take() {
                    self.bus.address_assigned(address);
                    debug!("ADDRESS {}", address);
                }
                if let Some(config) = self.control.pending_config.take() {
                    self.apply_configuration(config);
                }
            }
            Phase::Spurious => {}
        }
    }

    /// The SET_CONFIGURATION status phase landed: bring up the
    /// function's endpoints and report the negotiated power draw.
    fn apply_configuration(&mut self, config: u8) {
        self.bus.configured(config);
        debug!("CONFIGURED {}", config);

        if config != 0 {
            for index in (CTRL_IN + 1)..QH_COUNT {
                if self.queues[index].is_enabled() {
                    let kind = self.queues[index].kind();
                    let max_packet = self.queues[index].max_packet();
                    self.queues[index].enable(&self.usb, &self.qhs[index], kind, max_packet);
                    self.queues[index].start_head(&self.usb, &self.pool, &self.qhs[index]);
                }
            }
            let budget = if self.power_budget_ma > 0 {
                self.power_budget_ma
            } else {
                VBUS_DRAW_UNCONFIGURED_MA
            };
            self.deferred.push(DeferredEvent::SetCurrentLimit(budget));
        } else {
            self.deferred
                .push(DeferredEvent::SetCurrentLimit(VBUS_DRAW_UNCONFIGURED_MA));
        }
    }

    #[cfg(test)]
    pub(crate) fn qh(&self, index: usize) -> &Qh {
        &self.qhs[index]
    }

    #[cfg(test)]
    pub(crate) fn head_chain(&self, index: usize) -> Option<crate::chain::Chain> {
        self.queues[index].head_chain()
    }

    #[cfg(test)]
    pub(crate) fn chains(&self, index: usize) -> std::vec::Vec<crate::chain::Chain> {
        self.queues[index].chains()
    }

    #[cfg(test)]
    pub(crate) fn pool_ref(&self) -> &TdPool<'a> {
        &self.pool
    }

    #[cfg(test)]
    pub(crate) fn pool_mut(&mut self) -> &mut TdPool<'a> {
        &mut self.pool
    }

    #[cfg(test)]
    pub(crate) fn ep0_in_bytes(&self, len: usize) -> std::vec::Vec<u8> {
        let mut bytes = std::vec![0; len];
        if let Some(buffer) = self.ep0_in.as_ref() {
            buffer.volatile_read(&mut bytes);
        }
        bytes
    }
}

impl EndpointSetup for Driver<'_> {
    fn enable_endpoint(
        &mut self,
        addr: EndpointAddress,
        kind: EndpointKind,
        max_packet: u16,
    ) -> Result<(), Error> {
        if addr.index() == 0 || addr.index() >= QH_COUNT / 2 {
            return Err(Error::InvalidEndpoint);
        }
        let index = qh_index(addr);
        self.queues[index].enable(&self.usb, &self.qhs[index], kind, max_packet);
        debug!("ALLOC EP{} {:?} {:?}", addr.index(), addr.direction(), kind);
        Ok(())
    }

    fn allocate_buffer(&mut self, size: usize) -> Option<Buffer> {
        Driver::allocate_buffer(self, size)
    }
}
