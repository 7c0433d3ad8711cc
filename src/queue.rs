//! Per-endpoint transfer queues
//!
//! Each endpoint direction owns a FIFO of outstanding requests. Only
//! the head request is ever started in hardware; requests behind it
//! are linked into the descriptor chain but not primed until the head
//! retires.
//!
//! Appending to an endpoint the controller may already be draining is
//! the racy part. The hand-off goes: link the new chain after the old
//! tail purely in memory; if the endpoint shows no sign of being
//! primed, republish the queue head and prime it fresh; otherwise run
//! the add-dTD tripwire to learn whether the controller had already
//! consumed the old terminator, and only prime fresh when it had.

use usb_device::{endpoint::EndpointAddress, UsbDirection};

use crate::{
    chain::{self, Chain},
    error::{Error, Handshake, TransferStatus},
    pool::TdPool,
    qh::Qh,
    ral,
    request::Request,
    td,
};

/// Iteration ceiling for the add-dTD tripwire handshake.
///
/// The handshake normally closes in one or two passes; the ceiling
/// exists so a wedged controller surfaces as an error instead of a
/// hang in interrupt context.
const TRIPWIRE_RETRIES: usize = 10_000;

/// Attempts at flushing an endpoint before giving up.
const FLUSH_RETRIES: usize = 100;

/// A dTD can move at most five 4 KiB pages; with an unaligned start
/// that's a safe 16 KiB per descriptor.
const MAX_BYTES_PER_TD: usize = 16 * 1024;

/// Outstanding requests per endpoint direction.
pub const REQUESTS_PER_ENDPOINT: usize = 4;

/// Transfer type of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EndpointKind {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

struct Entry {
    request: Request,
    chain: Chain,
}

/// Result of folding a completion interrupt into the head request.
pub(crate) enum Progress {
    /// Nothing queued.
    Idle,
    /// The head request still has active descriptors.
    Incomplete,
    /// The head request retired; the caller delivers it, then promotes
    /// the next entry with [`EndpointQueue::start_head`].
    Retired(Request),
}

pub(crate) struct EndpointQueue {
    address: EndpointAddress,
    kind: EndpointKind,
    enabled: bool,
    max_packet: u16,
    entries: heapless::Deque<Entry, REQUESTS_PER_ENDPOINT>,
}

impl EndpointQueue {
    pub fn new(address: EndpointAddress) -> Self {
        EndpointQueue {
            address,
            kind: EndpointKind::Bulk,
            enabled: false,
            max_packet: 0,
            entries: heapless::Deque::new(),
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_packet(&self) -> u16 {
        self.max_packet
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    fn mask(&self) -> u32 {
        1 << self.address.index()
    }

    /// Configure the queue head and endpoint control register.
    pub fn enable(&mut self, usb: &ral::usb::Instance, qh: &Qh, kind: EndpointKind, max_packet: u16) {
        self.kind = kind;
        self.enabled = true;

        qh.set_max_packet_len(max_packet as usize);
        // the QH field is narrower than u16; keep our copy in sync
        self.max_packet = qh.max_packet_len() as u16;
        // termination is the chain builder's job
        qh.set_zero_length_termination(false);
        qh.set_interrupt_on_setup(
            kind == EndpointKind::Control && self.address.direction() == UsbDirection::Out,
        );

        // EP0 is always enabled in hardware
        if self.address.index() != 0 {
            let endptctrl = ral::endpoint_control::register(usb, self.address.index());
            match self.address.direction() {
                UsbDirection::In => {
                    ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, TXE: 1, TXR: 1, TXT: self.kind as u32)
                }
                UsbDirection::Out => {
                    ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, RXE: 1, RXR: 1, RXT: self.kind as u32)
                }
            }
        }
    }

    pub fn disable(&mut self, usb: &ral::usb::Instance) {
        self.enabled = false;
        if self.address.index() != 0 {
            let endptctrl = ral::endpoint_control::register(usb, self.address.index());
            match self.address.direction() {
                UsbDirection::In => {
                    ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, TXE: 0)
                }
                UsbDirection::Out => {
                    ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, RXE: 0)
                }
            }
        }
    }

    /// The prime request for this endpoint is still pending.
    fn hw_priming(&self, usb: &ral::usb::Instance) -> bool {
        (match self.address.direction() {
            UsbDirection::In => ral::read_reg!(ral::usb, usb, ENDPTPRIME, PETB),
            UsbDirection::Out => ral::read_reg!(ral::usb, usb, ENDPTPRIME, PERB),
        } & self.mask())
            != 0
    }

    /// The controller holds a transfer buffer for this endpoint.
    fn hw_active(&self, usb: &ral::usb::Instance) -> bool {
        (match self.address.direction() {
            UsbDirection::In => ral::read_reg!(ral::usb, usb, ENDPTSTAT, ETBR),
            UsbDirection::Out => ral::read_reg!(ral::usb, usb, ENDPTSTAT, ERBR),
        } & self.mask())
            != 0
    }

    /// Indicates if the endpoint has (or is acquiring) an active
    /// transfer descriptor.
    pub fn is_primed(&self, usb: &ral::usb::Instance) -> bool {
        self.hw_priming(usb) || self.hw_active(usb)
    }

    /// Republish the queue head and prime the endpoint.
    fn prime(&self, usb: &ral::usb::Instance, qh: &Qh, head_hw_addr: u32) {
        qh.publish(head_hw_addr);
        match self.address.direction() {
            UsbDirection::In => {
                ral::write_reg!(ral::usb, usb, ENDPTPRIME, PETB: self.mask())
            }
            UsbDirection::Out => {
                ral::write_reg!(ral::usb, usb, ENDPTPRIME, PERB: self.mask())
            }
        }
    }

    /// Add-dTD tripwire: without stopping the endpoint, sample whether
    /// the controller is still executing this endpoint's chain. A set
    /// tripwire bit surviving the status read makes the sample valid.
    fn add_tripwire(&self, usb: &ral::usb::Instance) -> Result<bool, Error> {
        for _ in 0..TRIPWIRE_RETRIES {
            ral::modify_reg!(ral::usb, usb, USBCMD, ATDTW: 1);
            let executing = self.hw_active(usb);
            if ral::read_reg!(ral::usb, usb, USBCMD, ATDTW == 1) {
                ral::modify_reg!(ral::usb, usb, USBCMD, ATDTW: 0);
                return Ok(executing);
            }
        }
        ral::modify_reg!(ral::usb, usb, USBCMD, ATDTW: 0);
        Err(Error::HardwareTimeout(Handshake::AddTripwire))
    }

    /// Queue a request, building its descriptor chain and handing it
    /// to hardware without racing an in-flight fetch.
    ///
    /// On failure the request comes back to the caller; descriptor
    /// exhaustion marks it [`TransferStatus::OutOfMemory`] and leaves
    /// the endpoint otherwise untouched.
    pub fn enqueue(
        &mut self,
        usb: &ral::usb::Instance,
        pool: &mut TdPool,
        qh: &Qh,
        mut request: Request,
    ) -> Result<(), (Error, Request)> {
        if !self.enabled {
            return Err((Error::EndpointDisabled, request));
        }
        if self.entries.len() == REQUESTS_PER_ENDPOINT {
            return Err((Error::QueueFull, request));
        }

        let zlt = request.zero() && self.address.direction() == UsbDirection::In;
        let built = if request.is_empty() {
            // a deliberate zero-length transaction still needs one
            // descriptor on the wire
            chain::zero_length(pool, request.buffer().as_ptr())
        } else {
            chain::build(
                pool,
                request.buffer().as_ptr(),
                request.len(),
                MAX_BYTES_PER_TD,
                zlt,
            )
        };
        let chain = match built {
            Ok(chain) => chain,
            Err(error) => {
                request.retire(TransferStatus::OutOfMemory, 0);
                return Err((error, request));
            }
        };
        let Some(head) = chain.head else {
            // both build paths above produce at least one descriptor
            request.retire(TransferStatus::OutOfMemory, 0);
            return Err((Error::OutOfMemory, request));
        };
        let head_addr = pool.td(head).hw_addr();

        let prev_tail = self.entries.back().and_then(|entry| entry.chain.tail);
        if self.entries.push_back(Entry { request, chain }).is_err() {
            // length checked above
            unreachable!("endpoint queue capacity");
        }

        match prev_tail {
            None => {
                // empty queue: a fresh prime can't race anything
                self.prime(usb, qh, head_addr);
            }
            Some(prev_tail) => {
                // (a) link after the old terminator, purely in memory
                pool.link(prev_tail, head);

                // (b) a pending prime will fetch through the new link
                if self.hw_priming(usb) {
                    return Ok(());
                }
                // (c) tripwire: did the controller stop on the old
                // terminator before the link landed?
                match self.add_tripwire(usb) {
                    Ok(true) => {
                        // still executing; the in-memory link suffices
                    }
                    Ok(false) => {
                        // controller already retired the old chain;
                        // start the new one as an independent transfer
                        self.prime(usb, qh, head_addr);
                    }
                    Err(error) => {
                        warn!(
                            "EP{} {:?} tripwire timeout",
                            self.address.index(),
                            self.address.direction()
                        );
                        // undo the append; the new entry is still the back
                        let Some(mut entry) = self.entries.pop_back() else {
                            unreachable!("entry pushed above");
                        };
                        pool.unlink(prev_tail);
                        chain::release(pool, &entry.chain);
                        entry.request.retire(TransferStatus::Cancelled, 0);
                        return Err((error, entry.request));
                    }
                }
            }
        }
        Ok(())
    }

    /// Walk the head request's descriptors after a completion
    /// interrupt.
    ///
    /// The first still-active descriptor stops the walk. Once every
    /// descriptor is terminal, error flags are folded in priority
    /// order, transferred bytes of clean descriptors become the actual
    /// length, descriptors go back to the pool, and the request
    /// retires.
    pub fn on_complete(&mut self, pool: &mut TdPool) -> Progress {
        let Some(entry) = self.entries.front() else {
            return Progress::Idle;
        };

        let mut status = TransferStatus::Success;
        let mut actual = 0;
        let mut handle = entry.chain.head;
        for _ in 0..entry.chain.count {
            let Some(current) = handle else { break };
            let td = pool.td(current);
            let td_status = td.status();
            if td_status.contains(td::Status::ACTIVE) {
                return Progress::Incomplete;
            }
            let decoded = decode_status(td_status);
            if decoded.is_error() {
                if decoded.severity() > status.severity() {
                    status = decoded;
                }
            } else {
                actual += pool.expected(current).saturating_sub(td.bytes_remaining());
            }
            handle = pool.next(current);
        }

        let Some(mut entry) = self.entries.pop_front() else {
            return Progress::Idle;
        };
        chain::release(pool, &entry.chain);
        entry.request.retire(status, actual);
        Progress::Retired(entry.request)
    }

    /// Prime the head entry, if there is one and hardware isn't
    /// already on it.
    pub fn start_head(&mut self, usb: &ral::usb::Instance, pool: &TdPool, qh: &Qh) {
        if self.is_primed(usb) {
            return;
        }
        if let Some(head) = self.entries.front().and_then(|entry| entry.chain.head) {
            self.prime(usb, qh, pool.td(head).hw_addr());
        }
    }

    /// Flush the endpoint's FIFO, retrying while the controller still
    /// reports an active buffer.
    pub fn flush(&self, usb: &ral::usb::Instance) -> Result<(), Error> {
        for _ in 0..FLUSH_RETRIES {
            match self.address.direction() {
                UsbDirection::In => {
                    ral::write_reg!(ral::usb, usb, ENDPTFLUSH, FETB: self.mask())
                }
                UsbDirection::Out => {
                    ral::write_reg!(ral::usb, usb, ENDPTFLUSH, FERB: self.mask())
                }
            }
            if !self.hw_active(usb) {
                return Ok(());
            }
        }
        warn!(
            "EP{} {:?} flush timeout",
            self.address.index(),
            self.address.direction()
        );
        Err(Error::HardwareTimeout(Handshake::Flush))
    }

    /// Cancel every outstanding request.
    ///
    /// Returns the requests with a `Cancelled` status. Draining an
    /// empty queue touches no hardware and returns an empty list.
    pub fn drain(
        &mut self,
        usb: &ral::usb::Instance,
        pool: &mut TdPool,
    ) -> heapless::Vec<Request, REQUESTS_PER_ENDPOINT> {
        let mut cancelled = heapless::Vec::new();
        if self.entries.is_empty() {
            return cancelled;
        }
        // a flush timeout is logged inside flush(); the software queue
        // empties regardless, since the controller is getting reset on
        // that path anyway
        let _ = self.flush(usb);
        while let Some(mut entry) = self.entries.pop_front() {
            chain::release(pool, &entry.chain);
            entry.request.retire(TransferStatus::Cancelled, 0);
            if cancelled.push(entry.request).is_err() {
                unreachable!("drain capacity");
            }
        }
        cancelled
    }

    /// Remove one request by tag.
    ///
    /// Dequeuing the head flushes the endpoint and promotes its
    /// successor; dequeuing from the middle splices the descriptor
    /// chain around the removed request.
    pub fn dequeue(
        &mut self,
        usb: &ral::usb::Instance,
        pool: &mut TdPool,
        qh: &Qh,
        tag: u32,
    ) -> Option<Request> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.request.tag() == tag)?;

        if position == 0 {
            let _ = self.flush(usb);
            let mut entry = self.entries.pop_front()?;
            chain::release(pool, &entry.chain);
            entry.request.retire(TransferStatus::Cancelled, 0);
            self.start_head(usb, pool, qh);
            return Some(entry.request);
        }

        // splice the chain around a queued-but-unstarted request
        let mut leading: heapless::Vec<Entry, REQUESTS_PER_ENDPOINT> = heapless::Vec::new();
        for _ in 0..position {
            let entry = self.entries.pop_front()?;
            if leading.push(entry).is_err() {
                unreachable!("dequeue scratch capacity");
            }
        }
        let mut entry = self.entries.pop_front()?;

        if let Some(prev_tail) = leading.last().and_then(|entry| entry.chain.tail) {
            match self.entries.front().and_then(|entry| entry.chain.head) {
                Some(next_head) => pool.link(prev_tail, next_head),
                None => pool.unlink(prev_tail),
            }
        }

        while let Some(lead) = leading.pop() {
            if self.entries.push_front(lead).is_err() {
                unreachable!("dequeue restore capacity");
            }
        }

        chain::release(pool, &entry.chain);
        entry.request.retire(TransferStatus::Cancelled, 0);
        Some(entry.request)
    }

    /// Bytes the head request still has in flight.
    pub fn fifo_status(&self, pool: &TdPool) -> usize {
        let Some(entry) = self.entries.front() else {
            return 0;
        };
        let mut remaining = 0;
        let mut handle = entry.chain.head;
        for _ in 0..entry.chain.count {
            let Some(current) = handle else { break };
            remaining += pool.td(current).bytes_remaining();
            handle = pool.next(current);
        }
        remaining
    }

    /// Stall or unstall the endpoint. Clearing a halt also resets the
    /// data toggle.
    pub fn set_halt(&self, usb: &ral::usb::Instance, halt: bool) {
        let endptctrl = ral::endpoint_control::register(usb, self.address.index());
        match (self.address.direction(), halt) {
            (UsbDirection::In, true) => {
                ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, TXS: 1)
            }
            (UsbDirection::In, false) => {
                ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, TXS: 0, TXR: 1)
            }
            (UsbDirection::Out, true) => {
                ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, RXS: 1)
            }
            (UsbDirection::Out, false) => {
                ral::modify_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, RXS: 0, RXR: 1)
            }
        }
    }

    /// Indicates if the endpoint is halted.
    pub fn is_halted(&self, usb: &ral::usb::Instance) -> bool {
        let endptctrl = ral::endpoint_control::register(usb, self.address.index());
        match self.address.direction() {
            UsbDirection::In => {
                ral::read_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, TXS == 1)
            }
            UsbDirection::Out => {
                ral::read_reg!(ral::endpoint_control, &endptctrl, ENDPTCTRL, RXS == 1)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn head_chain(&self) -> Option<Chain> {
        self.entries.front().map(|entry| entry.chain)
    }

    #[cfg(test)]
    pub(crate) fn chains(&self) -> std::vec::Vec<Chain> {
        self.entries.iter().map(|entry| entry.chain).collect()
    }
}

/// Fold a descriptor's error flags into a transfer status.
fn decode_status(status: td::Status) -> TransferStatus {
    if status.contains(td::Status::HALTED) {
        TransferStatus::Halted
    } else if status.contains(td::Status::DATA_BUFFER_ERROR) {
        TransferStatus::BufferError
    } else if status.contains(td::Status::TRANSACTION_ERROR) {
        TransferStatus::TransactionError
    } else {
        TransferStatus::Success
    }
}
