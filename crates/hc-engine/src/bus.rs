//! Audio buses and the epoch write discipline.
//!
//! Every bus carries the epoch of the block that last wrote it. Readers
//! copy only when the epoch matches the current block (plus one block of
//! lag for feedback taps); writers accumulate when the epoch matches and
//! replace otherwise. That single rule makes the first writer of a block
//! initialize the bus and every later writer mix in, with no explicit mix
//! node.
//!
//! The per-bus shared/exclusive lock is uncontended while the audio thread
//! is the only producer; it exists so node evaluation can go parallel
//! without changing the bus contract.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicU32, Ordering};

/// Block counter. `bus.epoch == env.epoch` iff the bus was written during
/// the current block.
pub type Epoch = u64;

const WRITER_BIT: u32 = 1 << 31;

/// Minimal shared/exclusive spinlock.
struct BusLock(AtomicU32);

impl BusLock {
    const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    fn lock_shared(&self) {
        loop {
            let prev = self.0.fetch_add(1, Ordering::Acquire);
            if prev & WRITER_BIT == 0 {
                return;
            }
            self.0.fetch_sub(1, Ordering::Release);
            while self.0.load(Ordering::Relaxed) & WRITER_BIT != 0 {
                std::hint::spin_loop();
            }
        }
    }

    fn unlock_shared(&self) {
        self.0.fetch_sub(1, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        while self
            .0
            .compare_exchange_weak(0, WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock_exclusive(&self) {
        self.0.store(0, Ordering::Release);
    }
}

enum Storage {
    /// Engine-owned block-length buffer.
    Internal(UnsafeCell<Box<[f32]>>),
    /// Driver-owned channel buffer, re-pointed every block.
    External { ptr: Cell<*mut f32>, len: Cell<usize> },
}

/// One audio bus: sample storage, epoch tag, and lock.
pub struct AudioBus {
    storage: Storage,
    epoch: Cell<Epoch>,
    lock: BusLock,
}

// Buses move to the audio thread with their Environment; the lock guards
// the data for any future parallel producers.
unsafe impl Send for AudioBus {}

impl AudioBus {
    /// Engine-owned bus of `block_size` samples, seeded with a stale epoch.
    pub fn internal(block_size: usize, epoch: Epoch) -> Self {
        Self {
            storage: Storage::Internal(UnsafeCell::new(vec![0.0; block_size].into_boxed_slice())),
            epoch: Cell::new(epoch),
            lock: BusLock::new(),
        }
    }

    /// Driver-backed bus; holds no data until `set_external_data`.
    pub fn external(epoch: Epoch) -> Self {
        Self {
            storage: Storage::External { ptr: Cell::new(std::ptr::null_mut()), len: Cell::new(0) },
            epoch: Cell::new(epoch),
            lock: BusLock::new(),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch.get()
    }

    pub fn set_epoch(&self, epoch: Epoch) {
        self.epoch.set(epoch);
    }

    /// Point an external bus at this block's driver buffer.
    ///
    /// The pointer is only dereferenced until the next callback returns, so
    /// the driver may hand out a different buffer every block.
    pub fn set_external_data(&self, ptr: *mut f32, len: usize) {
        match &self.storage {
            Storage::External { ptr: slot, len: len_slot } => {
                slot.set(ptr);
                len_slot.set(len);
            }
            Storage::Internal(_) => debug_assert!(false, "set_external_data on internal bus"),
        }
    }

    /// Read under the bus rule: copy when the bus was written within
    /// `max_lag` blocks of `current`, silence otherwise. `max_lag` is 0 for
    /// plain inputs and 1 for feedback taps.
    pub fn read_into(&self, dst: &mut [f32], current: Epoch, max_lag: Epoch) {
        self.lock.lock_shared();
        let fresh = current.wrapping_sub(self.epoch.get()) <= max_lag;
        if fresh {
            self.with_data(|data| {
                let n = dst.len().min(data.len());
                dst[..n].copy_from_slice(&data[..n]);
                dst[n..].fill(0.0);
            });
        } else {
            dst.fill(0.0);
        }
        self.lock.unlock_shared();
    }

    /// Write under the bus rule: accumulate when already written this
    /// block, otherwise copy and claim the epoch. `replace` forces the copy
    /// path, erasing any same-block accumulation.
    pub fn write_from(&self, src: &[f32], current: Epoch, replace: bool) {
        self.lock.lock_exclusive();
        let accumulate = !replace && self.epoch.get() == current;
        self.with_data_mut(|data| {
            let n = src.len().min(data.len());
            if accumulate {
                for (d, s) in data[..n].iter_mut().zip(&src[..n]) {
                    *d += *s;
                }
            } else {
                data[..n].copy_from_slice(&src[..n]);
            }
        });
        self.epoch.set(current);
        self.lock.unlock_exclusive();
    }

    /// Copy the raw contents regardless of epoch. Diagnostic use only.
    pub fn snapshot(&self, dst: &mut [f32]) {
        self.lock.lock_shared();
        self.with_data(|data| {
            let n = dst.len().min(data.len());
            dst[..n].copy_from_slice(&data[..n]);
        });
        self.lock.unlock_shared();
    }

    fn with_data<R>(&self, f: impl FnOnce(&[f32]) -> R) -> R {
        match &self.storage {
            Storage::Internal(cell) => f(unsafe { &*cell.get() }),
            Storage::External { ptr, len } => {
                let p = ptr.get();
                if p.is_null() {
                    f(&[])
                } else {
                    f(unsafe { std::slice::from_raw_parts(p, len.get()) })
                }
            }
        }
    }

    fn with_data_mut<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> R {
        match &self.storage {
            Storage::Internal(cell) => f(unsafe { &mut *cell.get() }),
            Storage::External { ptr, len } => {
                let p = ptr.get();
                if p.is_null() {
                    f(&mut [])
                } else {
                    f(unsafe { std::slice::from_raw_parts_mut(p, len.get()) })
                }
            }
        }
    }
}

/// All buses of one engine: the internal bank plus the external
/// driver-facing banks.
pub struct BusBank {
    internal: Vec<AudioBus>,
    external_inputs: Vec<AudioBus>,
    external_outputs: Vec<AudioBus>,
}

impl BusBank {
    /// Allocate every bus up front. External epochs are seeded one behind
    /// so nothing reads driver garbage before the first wiring.
    pub fn new(
        block_size: usize,
        num_internal: usize,
        num_external_inputs: usize,
        num_external_outputs: usize,
        first_epoch: Epoch,
    ) -> Self {
        let stale = first_epoch.wrapping_sub(1);
        Self {
            internal: (0..num_internal).map(|_| AudioBus::internal(block_size, stale)).collect(),
            external_inputs: (0..num_external_inputs).map(|_| AudioBus::external(stale)).collect(),
            external_outputs: (0..num_external_outputs).map(|_| AudioBus::external(stale)).collect(),
        }
    }

    pub fn num_internal(&self) -> usize {
        self.internal.len()
    }

    pub fn num_external_inputs(&self) -> usize {
        self.external_inputs.len()
    }

    pub fn num_external_outputs(&self) -> usize {
        self.external_outputs.len()
    }

    pub fn internal(&self, index: usize) -> Option<&AudioBus> {
        self.internal.get(index)
    }

    pub fn external_input(&self, index: usize) -> Option<&AudioBus> {
        self.external_inputs.get(index)
    }

    pub fn external_output(&self, index: usize) -> Option<&AudioBus> {
        self.external_outputs.get(index)
    }
}
