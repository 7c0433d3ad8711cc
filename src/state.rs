//! Hardware-shared state 'owned' by a controller instance
//!
//! The queue head table and the transfer descriptor arena must be
//! visible to the controller, correctly aligned, and owned by exactly
//! one driver. `DeviceState` packages both so the user can place them
//! in a `static` and hand them to the driver constructor, which takes
//! them exactly once.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{qh::Qh, td::Td, QH_COUNT, TD_COUNT};

/// The queue head list base must be 2 KiB aligned for `ENDPTLISTADDR`.
#[repr(align(2048))]
struct QhList([Qh; QH_COUNT]);

/// Linked descriptors must land on 32-byte boundaries.
#[repr(align(32))]
struct TdList([Td; TD_COUNT]);

/// Driver state shared with the transfer hardware.
///
/// Allocate a `static` object and supply it to the driver constructor.
/// Make sure states are not shared across controller instances; the
/// constructor panics if the state was already taken.
///
/// ```
/// use chipidea_usbd::DeviceState;
///
/// static DEVICE_STATE: DeviceState = DeviceState::new();
/// ```
pub struct DeviceState {
    qh_list: QhList,
    td_list: TdList,
    taken: AtomicBool,
}

// Safety: all descriptor fields are volatile cells, and the take-once
// flag guarantees a single owner for the whole structure.
unsafe impl Sync for DeviceState {}

impl DeviceState {
    pub const fn new() -> Self {
        const QH: Qh = Qh::new();
        const TD: Td = Td::new();
        DeviceState {
            qh_list: QhList([QH; QH_COUNT]),
            td_list: TdList([TD; TD_COUNT]),
            taken: AtomicBool::new(false),
        }
    }

    /// Take the hardware lists.
    ///
    /// Returns `None` if they were already taken.
    pub(crate) fn take(&self) -> Option<HardwareLists<'_>> {
        (!self.taken.swap(true, Ordering::SeqCst)).then(|| HardwareLists {
            qhs: &self.qh_list.0,
            tds: &self.td_list.0,
        })
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed descriptor memory, released by [`DeviceState::take`].
pub(crate) struct HardwareLists<'a> {
    pub qhs: &'a [Qh; QH_COUNT],
    pub tds: &'a [Td; TD_COUNT],
}

#[cfg(test)]
mod tests {
    use super::DeviceState;

    #[test]
    fn take_once() {
        let state = DeviceState::new();
        assert!(state.take().is_some());
        for _ in 0..10 {
            assert!(state.take().is_none());
        }
    }

    #[test]
    fn list_alignment() {
        let state = DeviceState::new();
        let lists = state.take().unwrap();
        assert_eq!(lists.qhs.as_ptr() as usize % 2048, 0);
        assert_eq!(lists.tds.as_ptr() as usize % 32, 0);
        for td in lists.tds.iter() {
            assert_eq!(td as *const _ as usize % 32, 0);
        }
    }
}
