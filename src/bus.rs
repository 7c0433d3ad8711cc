//! Shared controller access
//!
//! The interrupt handler and the deferred worker both need the one
//! [`Driver`]. `Udc` wraps it in a critical-section mutex: every
//! operation runs with interrupt delivery suppressed, so an interrupt
//! can never observe a half-updated descriptor chain.

use core::cell::RefCell;

use cortex_m::interrupt::{self, Mutex};
use usb_device::endpoint::EndpointAddress;

use crate::{
    buffer::Buffer,
    classifier::{Classification, TimerToken},
    driver::Driver,
    error::Error,
    function::{ChargerControl, EndpointSetup, TimerService, UsbFunction},
    queue::{EndpointKind, REQUESTS_PER_ENDPOINT},
    request::Request,
    BusState, Speed,
};

/// Interrupt-safe handle to the USB device controller.
pub struct Udc<'a> {
    driver: Mutex<RefCell<Driver<'a>>>,
}

impl<'a> Udc<'a> {
    /// Wrap a configured driver for shared use.
    ///
    /// Make sure you've called [`Driver::initialize`] first.
    pub fn new(driver: Driver<'a>) -> Self {
        Udc {
            driver: Mutex::new(RefCell::new(driver)),
        }
    }

    /// Interrupt-safe, mutable access to the driver
    fn with_driver<R>(&self, func: impl FnOnce(&mut Driver<'a>) -> R) -> R {
        interrupt::free(|cs| {
            let driver = self.driver.borrow(cs);
            let mut driver = driver.borrow_mut();
            func(&mut driver)
        })
    }

    /// Service the interrupt status word. Call from the USB ISR.
    pub fn poll(&self, function: &mut dyn UsbFunction) -> Result<(), Error> {
        self.with_driver(|driver| driver.poll(function))
    }

    /// Drain deferred work. Call from a task that may sleep.
    pub fn run_deferred(
        &self,
        function: &mut dyn UsbFunction,
        charger: &mut dyn ChargerControl,
        timer: &mut dyn TimerService,
    ) {
        self.with_driver(|driver| driver.run_deferred(function, charger, timer))
    }

    /// A classifier timer armed through the [`TimerService`] expired.
    pub fn classifier_timeout(
        &self,
        token: TimerToken,
        charger: &mut dyn ChargerControl,
        timer: &mut dyn TimerService,
    ) {
        self.with_driver(|driver| driver.classifier_timeout(token, charger, timer))
    }

    /// Attach the function driver and let it declare endpoints.
    pub fn bind(&self, function: &mut dyn UsbFunction) -> Result<(), Error> {
        self.with_driver(|driver| driver.bind(function))
    }

    /// Detach the function driver.
    pub fn unbind(&self, function: &mut dyn UsbFunction) {
        self.with_driver(|driver| driver.unbind(function))
    }

    pub fn enable_endpoint(
        &self,
        addr: EndpointAddress,
        kind: EndpointKind,
        max_packet: u16,
    ) -> Result<(), Error> {
        self.with_driver(|driver| EndpointSetup::enable_endpoint(driver, addr, kind, max_packet))
    }

    pub fn disable_endpoint(&self, addr: EndpointAddress) -> Result<(), Error> {
        self.with_driver(|driver| driver.disable_endpoint(addr))
    }

    /// Queue a request on an endpoint.
    pub fn queue(&self, addr: EndpointAddress, request: Request) -> Result<(), (Error, Request)> {
        self.with_driver(|driver| driver.queue(addr, request))
    }

    /// Remove one request, identified by its tag.
    pub fn dequeue(&self, addr: EndpointAddress, tag: u32) -> Option<Request> {
        self.with_driver(|driver| driver.dequeue(addr, tag))
    }

    /// Cancel everything queued on an endpoint.
    pub fn dequeue_all(
        &self,
        addr: EndpointAddress,
    ) -> heapless::Vec<Request, REQUESTS_PER_ENDPOINT> {
        self.with_driver(|driver| driver.dequeue_all(addr))
    }

    pub fn set_halt(&self, addr: EndpointAddress, halt: bool) -> Result<(), Error> {
        self.with_driver(|driver| driver.set_halt(addr, halt))
    }

    pub fn fifo_status(&self, addr: EndpointAddress) -> Result<usize, Error> {
        self.with_driver(|driver| driver.fifo_status(addr))
    }

    pub fn fifo_flush(&self, addr: EndpointAddress) -> Result<(), Error> {
        self.with_driver(|driver| driver.fifo_flush(addr))
    }

    pub fn get_frame_number(&self) -> u16 {
        self.with_driver(|driver| driver.get_frame_number())
    }

    pub fn request_wakeup(&self) -> Result<(), Error> {
        self.with_driver(|driver| driver.request_wakeup())
    }

    pub fn set_self_powered(&self, self_powered: bool) {
        self.with_driver(|driver| driver.set_self_powered(self_powered))
    }

    /// VBUS appeared or vanished; drives the connection classifier.
    pub fn notify_vbus_present(&self, present: bool, function: &mut dyn UsbFunction) {
        self.with_driver(|driver| driver.notify_vbus_present(present, function))
    }

    /// Report the configured current draw from the active
    /// configuration's descriptor.
    pub fn report_power_budget(&self, milliamps: u16) {
        self.with_driver(|driver| driver.report_power_budget(milliamps))
    }

    /// Present (`true`) or withdraw (`false`) the D+ pull-up.
    pub fn request_pullup(&self, pullup: bool) {
        self.with_driver(|driver| driver.request_pullup(pullup))
    }

    /// The charging collaborator takes over current-limit ownership.
    pub fn handle_charging(&self) {
        self.with_driver(|driver| driver.handle_charging())
    }

    /// Re-run connection classification.
    pub fn reclassify(&self) {
        self.with_driver(|driver| driver.reclassify())
    }

    /// Allocate a transfer buffer from the endpoint memory.
    pub fn allocate_buffer(&self, size: usize) -> Option<Buffer> {
        self.with_driver(|driver| driver.allocate_buffer(size))
    }

    pub fn bus_state(&self) -> BusState {
        self.with_driver(|driver| driver.bus_state())
    }

    pub fn speed(&self) -> Speed {
        self.with_driver(|driver| driver.speed())
    }

    pub fn classification(&self) -> Option<Classification> {
        self.with_driver(|driver| driver.classification())
    }
}
