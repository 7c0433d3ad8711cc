//! Bus state machine
//!
//! Tracks the device's position in the USB device state diagram:
//! attached, default (after reset), addressed, configured, and
//! suspended-with-memory. Bus speed is latched once per reset.

/// USB bus speed, latched at the end of a bus reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Speed {
    #[default]
    Full,
    Low,
    High,
}

impl Speed {
    /// Decode the port speed field.
    pub(crate) fn from_portsc(pspd: u32) -> Self {
        match pspd {
            1 => Speed::Low,
            2 => Speed::High,
            _ => Speed::Full,
        }
    }
}

/// The state a suspended bus resumes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeState {
    Default,
    Address(u8),
    Configured(u8),
}

/// Device state on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Cable present, no reset seen yet.
    Attached,
    /// Reset seen; address 0.
    Default,
    /// Host assigned this address.
    Address(u8),
    /// Host selected this configuration.
    Configured(u8),
    /// Suspended; resumes to the remembered state.
    Suspended(ResumeState),
}

pub(crate) struct BusMachine {
    state: BusState,
    speed: Speed,
    address: u8,
}

impl BusMachine {
    pub const fn new() -> Self {
        BusMachine {
            state: BusState::Attached,
            speed: Speed::Full,
            address: 0,
        }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn is_configured(&self) -> bool {
        matches!(self.state, BusState::Configured(_))
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.state, BusState::Suspended(_))
    }

    /// Bus reset: any state returns to default. The prior state is
    /// handed back so the caller can decide whether the function driver
    /// needs a disconnect notification.
    pub fn reset(&mut self) -> BusState {
        self.address = 0;
        core::mem::replace(&mut self.state, BusState::Default)
    }

    /// Speed is read from hardware once per reset and not re-evaluated
    /// until the next one.
    pub fn latch_speed(&mut self, pspd: u32) {
        self.speed = Speed::from_portsc(pspd);
    }

    /// A SET_ADDRESS status phase completed.
    pub fn address_assigned(&mut self, address: u8) {
        self.address = address;
        self.state = if address == 0 {
            BusState::Default
        } else {
            BusState::Address(address)
        };
    }

    /// A SET_CONFIGURATION status phase completed. Configuration zero
    /// deconfigures, keeping the assigned address.
    pub fn configured(&mut self, config: u8) {
        self.state = if config == 0 {
            if self.address == 0 {
                BusState::Default
            } else {
                BusState::Address(self.address)
            }
        } else {
            BusState::Configured(config)
        };
    }

    /// Suspend signal. Returns false if already suspended or not yet
    /// past a reset.
    pub fn suspend(&mut self) -> bool {
        let prior = match self.state {
            BusState::Default => ResumeState::Default,
            BusState::Address(addr) => ResumeState::Address(addr),
            BusState::Configured(config) => ResumeState::Configured(config),
            BusState::Attached | BusState::Suspended(_) => return false,
        };
        self.state = BusState::Suspended(prior);
        true
    }

    /// Resume signal. Returns false when the bus wasn't suspended.
    pub fn resume(&mut self) -> bool {
        match self.state {
            BusState::Suspended(prior) => {
                self.state = match prior {
                    ResumeState::Default => BusState::Default,
                    ResumeState::Address(addr) => BusState::Address(addr),
                    ResumeState::Configured(config) => BusState::Configured(config),
                };
                true
            }
            _ => false,
        }
    }

    /// Cable removed.
    pub fn detached(&mut self) {
        self.state = BusState::Attached;
    }
}

#[cfg(test)]
mod tests {
    use super::{BusMachine, BusState, ResumeState, Speed};

    #[test]
    fn enumeration_walk() {
        let mut bus = BusMachine::new();
        assert_eq!(bus.state(), BusState::Attached);

        bus.reset();
        assert_eq!(bus.state(), BusState::Default);

        bus.address_assigned(7);
        assert_eq!(bus.state(), BusState::Address(7));

        bus.configured(1);
        assert_eq!(bus.state(), BusState::Configured(1));
        assert!(bus.is_configured());
    }

    #[test]
    fn reset_from_any_state() {
        let mut bus = BusMachine::new();
        bus.reset();
        bus.address_assigned(7);
        bus.configured(1);

        let prior = bus.reset();
        assert_eq!(prior, BusState::Configured(1));
        assert_eq!(bus.state(), BusState::Default);
    }

    #[test]
    fn suspend_remembers_prior_state() {
        let mut bus = BusMachine::new();
        bus.reset();
        bus.address_assigned(7);
        bus.configured(2);

        assert!(bus.suspend());
        assert_eq!(
            bus.state(),
            BusState::Suspended(ResumeState::Configured(2))
        );
        // double suspend is refused
        assert!(!bus.suspend());

        assert!(bus.resume());
        assert_eq!(bus.state(), BusState::Configured(2));
        assert!(!bus.resume());
    }

    #[test]
    fn speed_latch() {
        let mut bus = BusMachine::new();
        assert_eq!(bus.speed(), Speed::Full);
        bus.latch_speed(2);
        assert_eq!(bus.speed(), Speed::High);
        bus.latch_speed(1);
        assert_eq!(bus.speed(), Speed::Low);
        bus.latch_speed(0);
        assert_eq!(bus.speed(), Speed::Full);
    }

    #[test]
    fn deconfigure_returns_to_address() {
        let mut bus = BusMachine::new();
        bus.reset();
        bus.address_assigned(3);
        bus.configured(1);
        bus.configured(0);
        assert_eq!(bus.state(), BusState::Address(3));
    }
}
