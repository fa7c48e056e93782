/*!
 * Heap Accounting
 *
 * Every string, array, object, closure and buffer a unit allocates is
 * charged to its HeapMeter and released when the value drops. The meter is
 * shared with the memory supervisor: crossing the heap ceiling wakes it at
 * once, and allocation is refused outright at HARD_LIMIT_FACTOR times the
 * ceiling.
 */

use super::value::{ArrayCell, Closure, ObjectCell, Value};
use crate::core::limits::HARD_LIMIT_FACTOR;
use miette::Diagnostic;
use std::cell::{Cell, RefCell};
use std::mem::size_of;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Allocation refused at the hard stop
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Diagnostic)]
#[error("Allocation of {requested} bytes refused: {used} of {limit} bytes in use")]
#[diagnostic(code(script::heap_exhausted))]
pub struct HeapExhausted {
    pub requested: u64,
    pub used: u64,
    pub limit: u64,
}

/// Point-in-time view of a meter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapSnapshot {
    pub used: u64,
    /// High-water mark of `used`
    pub peak: u64,
    pub external: u64,
    pub peak_external: u64,
}

#[derive(Debug)]
struct Gauge {
    used: AtomicU64,
    peak: AtomicU64,
    soft_limit: u64,
    hard_limit: u64,
}

impl Gauge {
    fn new(soft_limit: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            soft_limit,
            hard_limit: soft_limit.saturating_mul(HARD_LIMIT_FACTOR),
        }
    }

    /// Returns whether this charge crossed the soft limit
    fn charge(&self, bytes: u64) -> Result<bool, HeapExhausted> {
        let previous = self.used.fetch_add(bytes, Ordering::AcqRel);
        let now = previous.saturating_add(bytes);
        if now > self.hard_limit {
            self.used.fetch_sub(bytes, Ordering::AcqRel);
            return Err(HeapExhausted {
                requested: bytes,
                used: previous,
                limit: self.hard_limit,
            });
        }
        self.peak.fetch_max(now, Ordering::AcqRel);
        Ok(previous <= self.soft_limit && now > self.soft_limit)
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

/// Per-unit byte meter
#[derive(Debug)]
pub struct HeapMeter {
    heap: Gauge,
    external: Gauge,
    crossing: Notify,
}

impl HeapMeter {
    /// `heap_limit` and `external_limit` are the supervisor ceilings
    pub fn new(heap_limit: u64, external_limit: u64) -> Self {
        Self {
            heap: Gauge::new(heap_limit),
            external: Gauge::new(external_limit),
            crossing: Notify::new(),
        }
    }

    pub fn charge(&self, bytes: u64) -> Result<(), HeapExhausted> {
        if self.heap.charge(bytes)? {
            self.crossing.notify_one();
        }
        Ok(())
    }

    pub fn release(&self, bytes: u64) {
        self.heap.release(bytes);
    }

    pub fn charge_external(&self, bytes: u64) -> Result<(), HeapExhausted> {
        if self.external.charge(bytes)? {
            self.crossing.notify_one();
        }
        Ok(())
    }

    pub fn release_external(&self, bytes: u64) {
        self.external.release(bytes);
    }

    #[inline]
    pub fn used(&self) -> u64 {
        self.heap.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn soft_limit(&self) -> u64 {
        self.heap.soft_limit
    }

    #[inline]
    pub fn hard_limit(&self) -> u64 {
        self.heap.hard_limit
    }

    pub fn snapshot(&self) -> HeapSnapshot {
        HeapSnapshot {
            used: self.heap.used.load(Ordering::Acquire),
            peak: self.heap.peak.load(Ordering::Acquire),
            external: self.external.used.load(Ordering::Acquire),
            peak_external: self.external.peak.load(Ordering::Acquire),
        }
    }

    /// Resolves the next time a ceiling is crossed
    pub fn crossed(&self) -> Notified<'_> {
        self.crossing.notified()
    }
}

/// Bytes held against a meter, released on drop
pub struct Charge {
    meter: Arc<HeapMeter>,
    bytes: Cell<u64>,
    external: bool,
}

impl Charge {
    pub fn heap(meter: &Arc<HeapMeter>, bytes: u64) -> Result<Self, HeapExhausted> {
        meter.charge(bytes)?;
        Ok(Self {
            meter: meter.clone(),
            bytes: Cell::new(bytes),
            external: false,
        })
    }

    pub fn external(meter: &Arc<HeapMeter>, bytes: u64) -> Result<Self, HeapExhausted> {
        meter.charge_external(bytes)?;
        Ok(Self {
            meter: meter.clone(),
            bytes: Cell::new(bytes),
            external: true,
        })
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes.get()
    }

    /// Adjust the held amount; growth may be refused
    pub fn resize(&self, bytes: u64) -> Result<(), HeapExhausted> {
        let current = self.bytes.get();
        if bytes > current {
            let delta = bytes - current;
            if self.external {
                self.meter.charge_external(delta)?;
            } else {
                self.meter.charge(delta)?;
            }
        } else if bytes < current {
            self.release(current - bytes);
        }
        self.bytes.set(bytes);
        Ok(())
    }

    fn release(&self, bytes: u64) {
        if self.external {
            self.meter.release_external(bytes);
        } else {
            self.meter.release(bytes);
        }
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.release(self.bytes.get());
    }
}

// =============================================================================
// SIZE ESTIMATES
// =============================================================================

const STRING_OVERHEAD: u64 = 24;
const ARRAY_OVERHEAD: u64 = 48;
const OBJECT_OVERHEAD: u64 = 56;
const CLOSURE_BYTES: u64 = 96;

#[inline]
pub fn string_bytes(len: usize) -> u64 {
    STRING_OVERHEAD + len as u64
}

#[inline]
pub fn array_bytes(len: usize) -> u64 {
    ARRAY_OVERHEAD + (len * size_of::<Value>()) as u64
}

#[inline]
pub fn object_entry_bytes(key: &str) -> u64 {
    (size_of::<(Rc<str>, Value)>() + key.len()) as u64
}

#[inline]
pub fn object_bytes(entries: &[(Rc<str>, Value)]) -> u64 {
    OBJECT_OVERHEAD + entries.iter().map(|(k, _)| object_entry_bytes(k)).sum::<u64>()
}

#[inline]
pub fn closure_bytes() -> u64 {
    CLOSURE_BYTES
}

// =============================================================================
// CYCLE BREAKER
// =============================================================================

const MIN_PRUNE_THRESHOLD: usize = 1024;

/// Weak registry of everything that can sit on a reference cycle
///
/// Values are reference counted, so a closure stored in the scope it
/// captures (or an array holding itself) would otherwise never drop.
/// `teardown` clears every live container once the unit finishes, which
/// releases the cycles and their heap charges.
pub struct Collector {
    arrays: RefCell<Vec<Weak<ArrayCell>>>,
    objects: RefCell<Vec<Weak<ObjectCell>>>,
    closures: RefCell<Vec<Weak<Closure>>>,
    prune_at: Cell<usize>,
}

impl Default for Collector {
    fn default() -> Self {
        Self {
            arrays: RefCell::new(Vec::new()),
            objects: RefCell::new(Vec::new()),
            closures: RefCell::new(Vec::new()),
            prune_at: Cell::new(MIN_PRUNE_THRESHOLD),
        }
    }
}

impl Collector {
    pub fn track_array(&self, array: &Rc<ArrayCell>) {
        self.arrays.borrow_mut().push(Rc::downgrade(array));
        self.maybe_prune();
    }

    pub fn track_object(&self, object: &Rc<ObjectCell>) {
        self.objects.borrow_mut().push(Rc::downgrade(object));
        self.maybe_prune();
    }

    pub fn track_closure(&self, closure: &Rc<Closure>) {
        self.closures.borrow_mut().push(Rc::downgrade(closure));
        self.maybe_prune();
    }

    /// Number of registry entries, dead ones included
    pub fn tracked(&self) -> usize {
        self.arrays.borrow().len() + self.objects.borrow().len() + self.closures.borrow().len()
    }

    fn maybe_prune(&self) {
        if self.tracked() >= self.prune_at.get() {
            self.compact();
        }
    }

    /// Drop registry entries whose targets are gone
    pub fn compact(&self) {
        self.arrays.borrow_mut().retain(|w| w.strong_count() > 0);
        self.objects.borrow_mut().retain(|w| w.strong_count() > 0);
        self.closures.borrow_mut().retain(|w| w.strong_count() > 0);
        self.arrays.borrow_mut().shrink_to_fit();
        self.objects.borrow_mut().shrink_to_fit();
        self.closures.borrow_mut().shrink_to_fit();
        self.prune_at
            .set((self.tracked() * 2).max(MIN_PRUNE_THRESHOLD));
    }

    /// Empty every live container, breaking all cycles
    pub fn teardown(&self) {
        for closure in self.closures.take() {
            if let Some(closure) = closure.upgrade() {
                closure.detach();
            }
        }
        for array in self.arrays.take() {
            if let Some(array) = array.upgrade() {
                array.clear();
            }
        }
        for object in self.objects.take() {
            if let Some(object) = object.upgrade() {
                object.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_release_on_drop() {
        let meter = Arc::new(HeapMeter::new(1024, 1024));
        {
            let _charge = Charge::heap(&meter, 100).unwrap();
            assert_eq!(meter.used(), 100);
        }
        assert_eq!(meter.used(), 0);
        assert_eq!(meter.snapshot().peak, 100);
    }

    #[test]
    fn test_hard_limit_refuses() {
        let meter = Arc::new(HeapMeter::new(100, 100));
        let _a = Charge::heap(&meter, 150).unwrap();
        let err = Charge::heap(&meter, 100).err().unwrap();
        assert_eq!(err.limit, 200);
        assert_eq!(meter.used(), 150);
    }

    #[test]
    fn test_resize_tracks_delta() {
        let meter = Arc::new(HeapMeter::new(1024, 1024));
        let charge = Charge::heap(&meter, 10).unwrap();
        charge.resize(50).unwrap();
        assert_eq!(meter.used(), 50);
        charge.resize(20).unwrap();
        assert_eq!(meter.used(), 20);
    }

    #[test]
    fn test_external_is_separate() {
        let meter = Arc::new(HeapMeter::new(1024, 1024));
        let _charge = Charge::external(&meter, 300).unwrap();
        let snapshot = meter.snapshot();
        assert_eq!(snapshot.used, 0);
        assert_eq!(snapshot.external, 300);
    }

    #[tokio::test]
    async fn test_crossing_notifies() {
        let meter = Arc::new(HeapMeter::new(100, 100));
        let _charge = Charge::heap(&meter, 150).unwrap();
        // The permit stored by notify_one completes the next wait at once
        tokio::time::timeout(std::time::Duration::from_millis(100), meter.crossed())
            .await
            .unwrap();
    }
}
