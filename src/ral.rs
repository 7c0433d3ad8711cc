//! ChipIdea device controller register file
//!
//! The device-mode operational registers are modeled as a `#[repr(C)]`
//! block of volatile cells, accessed through the `ral-registers`
//! macros. Field offsets and masks follow the RAL convention, so the
//! same `read_reg!`/`write_reg!`/`modify_reg!` calls work here and on
//! the descriptor structures.
//!
//! Bit-for-bit SoC integration (PHY trim, clocking) is out of scope;
//! only the fields the transfer engine and classifier consume are
//! defined.

#![allow(non_snake_case, non_upper_case_globals)]

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// Acquire the register instance from the user's peripherals.
pub(crate) fn instance<P: crate::Peripherals>(peripherals: P) -> usb::Instance {
    // Safety: the Peripherals contract guarantees that the pointer
    // names a valid, solely-owned register block.
    let instance = unsafe { usb::Instance::new(peripherals.core()) };
    // The caller handed over ownership; nothing else to keep.
    drop(peripherals);
    instance
}

pub mod usb {
    use crate::vcell::VCell;

    /// Device-mode operational register block.
    #[repr(C)]
    pub struct RegisterBlock {
        pub USBCMD: VCell<u32>,
        pub USBSTS: VCell<u32>,
        pub USBINTR: VCell<u32>,
        pub FRINDEX: VCell<u32>,
        _reserved0: u32,
        pub DEVICEADDR: VCell<u32>,
        pub ENDPTLISTADDR: VCell<u32>,
        _reserved1: u32,
        pub BURSTSIZE: VCell<u32>,
        _reserved2: [u32; 4],
        pub ENDPTNAK: VCell<u32>,
        pub ENDPTNAKEN: VCell<u32>,
        _reserved3: u32,
        pub PORTSC1: VCell<u32>,
        _reserved4: [u32; 7],
        _reserved5: u32,
        pub USBMODE: VCell<u32>,
        pub ENDPTSETUPSTAT: VCell<u32>,
        pub ENDPTPRIME: VCell<u32>,
        pub ENDPTFLUSH: VCell<u32>,
        pub ENDPTSTAT: VCell<u32>,
        pub ENDPTCOMPLETE: VCell<u32>,
        pub ENDPTCTRL0: VCell<u32>,
        pub ENDPTCTRL1: VCell<u32>,
        pub ENDPTCTRL2: VCell<u32>,
        pub ENDPTCTRL3: VCell<u32>,
        pub ENDPTCTRL4: VCell<u32>,
        pub ENDPTCTRL5: VCell<u32>,
        pub ENDPTCTRL6: VCell<u32>,
        pub ENDPTCTRL7: VCell<u32>,
    }

    impl RegisterBlock {
        /// An all-zero register block.
        ///
        /// Only meaningful for simulation; real blocks are borrowed from
        /// the hardware address supplied by `Peripherals`.
        #[cfg(test)]
        pub fn new() -> Self {
            // Safety: every field is a plain (volatile) integer cell, and
            // all-zeros is a valid value for each.
            unsafe { core::mem::MaybeUninit::zeroed().assume_init() }
        }
    }

    /// Owned access to the register block of one controller.
    pub struct Instance {
        ptr: *const RegisterBlock,
    }

    impl Instance {
        /// # Safety
        ///
        /// `ptr` must point at a ChipIdea device-mode register block that
        /// no other code is using.
        pub(crate) const unsafe fn new(ptr: *const ()) -> Self {
            Instance { ptr: ptr.cast() }
        }
    }

    impl core::ops::Deref for Instance {
        type Target = RegisterBlock;
        fn deref(&self) -> &RegisterBlock {
            // Safety: valid for the life of the program, per Instance::new.
            unsafe { &*self.ptr }
        }
    }

    // Safety: the register block is a hardware singleton. The one
    // Instance moves between contexts under the controller mutex.
    unsafe impl Send for Instance {}

    pub mod USBCMD {
        pub mod RS {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod RST {
            pub const offset: u32 = 1;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod SUTW {
            pub const offset: u32 = 13;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod ATDTW {
            pub const offset: u32 = 14;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod ITC {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0xFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod USBSTS {
        pub mod UI {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod UEI {
            pub const offset: u32 = 1;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod PCI {
            pub const offset: u32 = 2;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod URI {
            pub const offset: u32 = 6;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod SLI {
            pub const offset: u32 = 8;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod USBINTR {
        pub mod UE {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod UEE {
            pub const offset: u32 = 1;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod PCE {
            pub const offset: u32 = 2;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod URE {
            pub const offset: u32 = 6;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod SLE {
            pub const offset: u32 = 8;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod FRINDEX {
        pub mod FRINDEX {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x3FFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod DEVICEADDR {
        pub mod USBADRA {
            pub const offset: u32 = 24;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod USBADR {
            pub const offset: u32 = 25;
            pub const mask: u32 = 0x7F << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod PORTSC1 {
        pub mod CCS {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod FPR {
            pub const offset: u32 = 6;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod SUSP {
            pub const offset: u32 = 7;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod PR {
            pub const offset: u32 = 8;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod LS {
            pub const offset: u32 = 10;
            pub const mask: u32 = 0x3 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod PHCD {
            pub const offset: u32 = 23;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod PFSC {
            pub const offset: u32 = 24;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod PSPD {
            pub const offset: u32 = 26;
            pub const mask: u32 = 0x3 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod USBMODE {
        pub mod CM {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x3 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod SLOM {
            pub const offset: u32 = 3;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod SDIS {
            pub const offset: u32 = 4;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod ENDPTSETUPSTAT {
        pub mod ENDPTSETUPSTAT {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod ENDPTPRIME {
        pub mod PERB {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod PETB {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod ENDPTFLUSH {
        pub mod FERB {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod FETB {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod ENDPTSTAT {
        pub mod ERBR {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod ETBR {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod ENDPTCOMPLETE {
        pub mod ERCE {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod ETCE {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod ENDPTNAK {
        pub mod EPRN {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod EPTN {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod ENDPTNAKEN {
        pub mod EPRNE {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod EPTNE {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }
}

/// The RAL API requires us to treat all endpoint control registers as
/// unique. We can make it a little easier with this function, the
/// `EndptCtrl` type, and the helper module.
pub mod endpoint_control {
    use crate::{ral, vcell::VCell};

    #[allow(non_snake_case)]
    pub struct EndptCtrl<'a> {
        pub ENDPTCTRL: &'a VCell<u32>,
    }

    #[allow(non_snake_case, non_upper_case_globals)]
    pub mod ENDPTCTRL {
        pub mod RXS {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod RXT {
            pub const offset: u32 = 2;
            pub const mask: u32 = 0x3 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod RXR {
            pub const offset: u32 = 6;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod RXE {
            pub const offset: u32 = 7;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod TXS {
            pub const offset: u32 = 16;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod TXT {
            pub const offset: u32 = 18;
            pub const mask: u32 = 0x3 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod TXR {
            pub const offset: u32 = 22;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod TXE {
            pub const offset: u32 = 23;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub fn register<'a>(usb: &'a ral::usb::Instance, endpoint: usize) -> EndptCtrl<'a> {
        EndptCtrl {
            ENDPTCTRL: match endpoint {
                0 => &usb.ENDPTCTRL0,
                1 => &usb.ENDPTCTRL1,
                2 => &usb.ENDPTCTRL2,
                3 => &usb.ENDPTCTRL3,
                4 => &usb.ENDPTCTRL4,
                5 => &usb.ENDPTCTRL5,
                6 => &usb.ENDPTCTRL6,
                7 => &usb.ENDPTCTRL7,
                _ => unreachable!("ENDPTCTRL register {} doesn't exist", endpoint),
            },
        }
    }
}
