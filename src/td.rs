//! Endpoint transfer descriptors (dTD)
//!
//! A dTD describes one contiguous chunk of a transfer: up to five 4 KiB
//! page pointers, a byte count that the controller decrements as it
//! moves data, a status byte, and a link to the next descriptor. The
//! software-side chain bookkeeping (next handle, expected length) lives
//! in the [`TdPool`](crate::pool::TdPool), not here; hardware only ever
//! sees this 32-byte record.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::{ral, vcell::VCell};

/// Set in `NEXT` to mark the end of a chain.
const TERMINATE: u32 = 1;
/// Hardware requires dTD links to be 32-byte aligned.
const LINK_MASK: u32 = !0x1F;

// No align attribute: the QH embeds a Td as its transfer overlay at
// offset 8. The pool's backing array provides the 32-byte alignment
// hardware needs for linked descriptors.
#[repr(C)]
pub struct Td {
    NEXT: VCell<u32>,
    TOKEN: VCell<u32>,
    BUFFERS: [VCell<u32>; 5],
    // Hardware never touches this word.
    _reserved: u32,
}

// Safety: every field is a volatile cell, and software access is
// serialized by the controller mutex; the other writer is hardware.
unsafe impl Sync for Td {}

bitflags::bitflags! {
    /// dTD token status byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// The descriptor belongs to hardware.
        const ACTIVE = 1 << 7;
        /// Endpoint protocol violation; the endpoint is halted.
        const HALTED = 1 << 6;
        /// Data over- or underrun while filling a buffer page.
        const DATA_BUFFER_ERROR = 1 << 5;
        /// Bit-level transport failure.
        const TRANSACTION_ERROR = 1 << 3;
    }
}

impl Td {
    pub const fn new() -> Self {
        Td {
            NEXT: VCell::new(TERMINATE),
            TOKEN: VCell::new(0),
            BUFFERS: [
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
            ],
            _reserved: 0,
        }
    }

    /// Terminate the chain at this descriptor.
    pub fn set_terminate(&self) {
        self.NEXT.write(TERMINATE);
    }

    /// Link this descriptor to the next one by hardware address.
    pub fn set_next(&self, hw_addr: u32) {
        self.NEXT.write(hw_addr & LINK_MASK);
    }

    /// The hardware address of this descriptor.
    ///
    /// Descriptor memory must sit below the 4 GiB boundary for the
    /// controller to reach it.
    pub fn hw_addr(&self) -> u32 {
        self as *const Td as usize as u32
    }

    pub fn status(&self) -> Status {
        let status = ral::read_reg!(crate::td, self, TOKEN, STATUS);
        Status::from_bits_truncate(status as u8)
    }

    pub fn clear_status(&self) {
        ral::modify_reg!(crate::td, self, TOKEN, STATUS: 0);
    }

    /// Hand the descriptor to hardware.
    pub fn set_active(&self) {
        ral::modify_reg!(crate::td, self, TOKEN, STATUS: Status::ACTIVE.bits() as u32);
    }

    pub fn set_interrupt_on_complete(&self, ioc: bool) {
        ral::modify_reg!(crate::td, self, TOKEN, IOC: ioc as u32);
    }

    /// Bytes the controller has not yet transferred.
    ///
    /// Hardware decrements the token byte count as it moves data, so
    /// once the descriptor retires this is the short-packet residue.
    pub fn bytes_remaining(&self) -> usize {
        ral::read_reg!(crate::td, self, TOKEN, TOTAL_BYTES) as usize
    }

    /// Pretend hardware retired this descriptor.
    #[cfg(test)]
    pub(crate) fn sim_retire(&self, remaining: usize, flags: Status) {
        self.TOKEN
            .write(((remaining as u32) << 16) | flags.bits() as u32);
    }

    #[cfg(test)]
    pub(crate) fn next_raw(&self) -> u32 {
        self.NEXT.read()
    }

    /// Point the descriptor at `len` bytes starting at `ptr`.
    ///
    /// Fills the page pointers for buffers that cross 4 KiB boundaries.
    pub fn set_buffer(&self, ptr: *const u8, len: usize) {
        ral::modify_reg!(crate::td, self, TOKEN, TOTAL_BYTES: len as u32);
        let base = ptr as usize as u32;
        self.BUFFERS[0].write(base);
        let mut page = base & !0xFFF;
        for buffer in self.BUFFERS.iter().skip(1) {
            page = page.wrapping_add(4096);
            buffer.write(page);
        }
    }
}

pub mod NEXT {
    pub mod TERMINATE {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod NEXT_LINK_POINTER {
        pub const offset: u32 = 5;
        pub const mask: u32 = 0x7ffffff << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod TOKEN {
    pub mod STATUS {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod IOC {
        pub const offset: u32 = 15;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod TOTAL_BYTES {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x7FFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Td>() == 32) as usize];
