//! Client I/O requests
//!
//! A request is owned by exactly one endpoint queue while outstanding.
//! Ownership transfers back to the caller at completion, either through
//! [`UsbFunction::complete`](crate::UsbFunction::complete) or the return
//! value of a dequeue call, with the actual length and final status
//! filled in.

use crate::{buffer::Buffer, error::TransferStatus};

#[derive(Debug)]
pub struct Request {
    buffer: Buffer,
    len: usize,
    actual: usize,
    status: Option<TransferStatus>,
    zero: bool,
    tag: u32,
    /// Set on requests the control machine queues for itself; their
    /// completions never reach the function driver.
    pub(crate) internal: bool,
}

impl Request {
    /// Build a request transferring the first `len` bytes of `buffer`.
    ///
    /// `len` is clamped to the buffer's capacity. For an OUT (receive)
    /// request, `len` is how much the endpoint will accept; for an IN
    /// (transmit) request, fill the buffer before queueing.
    pub fn new(buffer: Buffer, len: usize) -> Self {
        let len = len.min(buffer.len());
        Request {
            buffer,
            len,
            actual: 0,
            status: None,
            zero: false,
            tag: 0,
            internal: false,
        }
    }

    /// Tag the request so its completion can be correlated.
    pub fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Request a closing zero-length packet when the transfer length is
    /// an exact multiple of the endpoint's descriptor limit.
    pub fn set_zero(&mut self, zero: bool) {
        self.zero = zero;
    }

    pub(crate) fn zero(&self) -> bool {
        self.zero
    }

    /// The requested transfer length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes actually transferred. Only completion processing writes
    /// this.
    pub fn actual(&self) -> usize {
        self.actual
    }

    /// Completion status; `None` while the request is outstanding.
    pub fn status(&self) -> Option<TransferStatus> {
        self.status
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Reclaim the buffer from a completed request.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }

    /// Copy received data out of the request, bounded by `actual`.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let size = self.actual.min(dst.len());
        self.buffer.volatile_read(&mut dst[..size])
    }

    pub(crate) fn retire(&mut self, status: TransferStatus, actual: usize) {
        self.status = Some(status);
        self.actual = actual;
    }
}

#[cfg(test)]
mod test {
    use super::Request;
    use crate::{buffer::EndpointMemory, error::TransferStatus};

    #[test]
    fn length_clamped_to_buffer() {
        let memory: EndpointMemory<16> = EndpointMemory::new();
        let mut alloc = memory.allocator().unwrap();
        let request = Request::new(alloc.allocate(8).unwrap(), 100);
        assert_eq!(request.len(), 8);
    }

    #[test]
    fn retire_reports_status_and_actual() {
        let memory: EndpointMemory<16> = EndpointMemory::new();
        let mut alloc = memory.allocator().unwrap();
        let mut request = Request::new(alloc.allocate(8).unwrap(), 8);
        assert!(request.status().is_none());

        request.retire(TransferStatus::Success, 6);
        assert_eq!(request.status(), Some(TransferStatus::Success));
        assert_eq!(request.actual(), 6);
    }
}
