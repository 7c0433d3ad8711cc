//! Transfer descriptor chain builder
//!
//! Splits one request into an ordered chain of descriptors, each moving
//! at most `max_per_td` bytes. Every descriptor notifies on completion.
//! The chain always ends in an explicit terminator, and the sum of
//! descriptor lengths equals the requested length (the optional
//! zero-length tail contributes nothing).

use crate::{
    error::Error,
    pool::{TdHandle, TdPool},
};

/// An ordered chain of transfer descriptors.
///
/// `head` is `None` only for the empty chain, which a zero-length build
/// produces. Walks are bounded by `count`, so a corrupted link can
/// never cycle.
#[derive(Debug, Clone, Copy)]
pub struct Chain {
    pub(crate) head: Option<TdHandle>,
    pub(crate) tail: Option<TdHandle>,
    pub(crate) count: usize,
    pub(crate) bytes: usize,
}

impl Chain {
    pub(crate) const fn empty() -> Self {
        Chain {
            head: None,
            tail: None,
            count: 0,
            bytes: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Build a chain covering `len` bytes starting at `buffer`.
///
/// When `zero_length_terminate` is set and the final chunk is exactly
/// `max_per_td` bytes, one zero-length descriptor is appended so the
/// host can detect the end of the transfer.
///
/// On descriptor exhaustion the partial chain is released and only this
/// build fails.
pub(crate) fn build(
    pool: &mut TdPool,
    buffer: *const u8,
    len: usize,
    max_per_td: usize,
    zero_length_terminate: bool,
) -> Result<Chain, Error> {
    debug_assert!(max_per_td > 0);
    let mut chain = Chain::empty();

    let mut offset = 0;
    while offset < len {
        let chunk = (len - offset).min(max_per_td);
        // Safety: offset stays within the caller's buffer; the pointer
        // is only stored for hardware, never dereferenced here.
        let chunk_ptr = unsafe { buffer.add(offset) };
        if let Err(error) = append(pool, &mut chain, chunk_ptr, chunk) {
            release(pool, &chain);
            return Err(error);
        }
        offset += chunk;
    }

    if zero_length_terminate && len > 0 && len % max_per_td == 0 {
        if let Err(error) = append(pool, &mut chain, buffer, 0) {
            release(pool, &chain);
            return Err(error);
        }
    }

    Ok(chain)
}

/// A chain holding a single zero-length descriptor.
///
/// Used for status-phase transactions and other deliberate zero-length
/// transfers, which still need one descriptor on the wire.
pub(crate) fn zero_length(pool: &mut TdPool, buffer: *const u8) -> Result<Chain, Error> {
    let mut chain = Chain::empty();
    append(pool, &mut chain, buffer, 0)?;
    Ok(chain)
}

/// Return every descriptor of `chain` to the pool.
pub(crate) fn release(pool: &mut TdPool, chain: &Chain) {
    let mut handle = chain.head;
    for _ in 0..chain.count {
        let Some(current) = handle else { break };
        handle = pool.next(current);
        pool.free(current);
    }
}

fn append(pool: &mut TdPool, chain: &mut Chain, ptr: *const u8, len: usize) -> Result<(), Error> {
    let handle = pool.allocate()?;
    let td = pool.td(handle);
    td.set_terminate();
    td.set_buffer(ptr, len);
    td.set_interrupt_on_complete(true);
    td.set_active();
    pool.set_expected(handle, len);

    match chain.tail {
        Some(tail) => pool.link(tail, handle),
        None => chain.head = Some(handle),
    }
    chain.tail = Some(handle);
    chain.count += 1;
    chain.bytes += len;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{build, release, zero_length};
    use crate::{
        error::Error,
        pool::TdPool,
        state::DeviceState,
        td::Status,
        TD_COUNT,
    };

    const BUF: *const u8 = 0x1000 as *const u8;

    #[test]
    fn chunk_counts() {
        let state = DeviceState::new();
        let lists = state.take().unwrap();
        let mut pool = TdPool::new(lists.tds);

        // (len, max, expected descriptor count)
        let cases = [
            (0, 512, 0),
            (1, 512, 1),
            (512, 512, 1),
            (513, 512, 2),
            (600, 512, 2),
            (64, 64, 1),
            (4096, 512, 8),
        ];
        for (len, max, count) in cases {
            let chain = build(&mut pool, BUF, len, max, false).unwrap();
            assert_eq!(chain.count(), count, "len {} max {}", len, max);
            assert_eq!(chain.bytes(), len);
            release(&mut pool, &chain);
            assert_eq!(pool.in_use(), 0);
        }
    }

    #[test]
    fn lengths_sum_to_request() {
        let state = DeviceState::new();
        let lists = state.take().unwrap();
        let mut pool = TdPool::new(lists.tds);

        let chain = build(&mut pool, BUF, 600, 512, false).unwrap();
        let first = chain.head.unwrap();
        let second = pool.next(first).unwrap();
        assert_eq!(pool.expected(first), 512);
        assert_eq!(pool.expected(second), 88);
        assert!(pool.next(second).is_none());

        // every descriptor notifies, and all are live
        for handle in [first, second] {
            let td = pool.td(handle);
            assert!(td.status().contains(Status::ACTIVE));
        }
        release(&mut pool, &chain);
    }

    #[test]
    fn zero_length_termination() {
        let state = DeviceState::new();
        let lists = state.take().unwrap();
        let mut pool = TdPool::new(lists.tds);

        // exact multiple: one extra zero-length tail
        let chain = build(&mut pool, BUF, 1024, 512, true).unwrap();
        assert_eq!(chain.count(), 3);
        assert_eq!(chain.bytes(), 1024);
        let tail = chain.tail.unwrap();
        assert_eq!(pool.expected(tail), 0);
        release(&mut pool, &chain);

        // short final chunk: the host sees the short packet, no tail
        let chain = build(&mut pool, BUF, 1000, 512, true).unwrap();
        assert_eq!(chain.count(), 2);
        release(&mut pool, &chain);

        // zero-length build produces nothing, even with zlt
        let chain = build(&mut pool, BUF, 0, 512, true).unwrap();
        assert_eq!(chain.count(), 0);
        assert!(chain.head.is_none());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn control_reply_single_descriptor() {
        let state = DeviceState::new();
        let lists = state.take().unwrap();
        let mut pool = TdPool::new(lists.tds);

        let chain = build(&mut pool, BUF, 64, 64, false).unwrap();
        assert_eq!(chain.count(), 1);
        let head = chain.head.unwrap();
        assert_eq!(pool.expected(head), 64);
        assert!(pool.next(head).is_none());
        release(&mut pool, &chain);
    }

    #[test]
    fn explicit_zero_length_chain() {
        let state = DeviceState::new();
        let lists = state.take().unwrap();
        let mut pool = TdPool::new(lists.tds);

        let chain = zero_length(&mut pool, BUF).unwrap();
        assert_eq!(chain.count(), 1);
        assert_eq!(chain.bytes(), 0);
        release(&mut pool, &chain);
    }

    #[test]
    fn exhaustion_releases_partial_chain() {
        let state = DeviceState::new();
        let lists = state.take().unwrap();
        let mut pool = TdPool::new(lists.tds);

        // more chunks than the arena holds
        let result = build(&mut pool, BUF, (TD_COUNT + 4) * 64, 64, false);
        assert_eq!(result.unwrap_err(), Error::OutOfMemory);
        assert_eq!(pool.in_use(), 0);
    }
}
