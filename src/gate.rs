//! Deferred recomputation and reconfiguration primitives.
//!
//! Setters may be called from any thread. They write the raw parameter and
//! then mark a [`Gate`] dirty. The processing thread calls
//! [`Gate::ensure_ready`] once at the top of each processing call, which is
//! the only place the flag is cleared and derived state is rebuilt.
//!
//! Destructive reconfiguration goes through a [`Lifecycle`]: the control
//! thread flags the instance as initialising, waits until the in-flight
//! processing call (if any) has returned, rebuilds, and publishes the result
//! through a [`Slot`]. Processing calls that observe a non initialised state
//! emit silence.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

const WAIT_STEP: Duration = Duration::from_millis(1);
const WAIT_STEPS_MAX: usize = 2000;

/// `f32` stored in an [`AtomicU32`].
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed)
    }
}

/// Reason a resource needs recomputation.
///
/// `0` is reserved for "ready"; implementors map their variants to non zero
/// codes.
pub trait Reason: Copy {
    fn code(self) -> u8;
    fn from_code(code: u8) -> Option<Self>;
}

/// The common single-reason case.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dirty;

impl Reason for Dirty {
    fn code(self) -> u8 {
        1
    }

    fn from_code(code: u8) -> Option<Self> {
        (code == 1).then_some(Dirty)
    }
}

const READY: u8 = 0;

/// Dirty flag holding either "ready" or the latest recompute reason.
#[derive(Debug)]
pub struct Gate(AtomicU8);

impl Default for Gate {
    fn default() -> Self {
        Self::ready()
    }
}

impl Gate {
    pub fn ready() -> Self {
        Self(AtomicU8::new(READY))
    }

    pub fn dirty<R: Reason>(reason: R) -> Self {
        Self(AtomicU8::new(reason.code()))
    }

    /// Request recomputation. Never blocks, never allocates.
    pub fn mark_dirty<R: Reason>(&self, reason: R) {
        self.0.store(reason.code(), Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.0.load(Ordering::SeqCst) != READY
    }

    /// Run `recompute` if the gate is dirty and clear it.
    ///
    /// The flag is cleared before `recompute` runs so a setter racing with
    /// the recomputation re-arms the gate for the next call instead of being
    /// lost. Returns whether recomputation happened.
    pub fn ensure_ready<R: Reason>(&self, recompute: impl FnOnce(R)) -> bool {
        let code = self.0.swap(READY, Ordering::SeqCst);
        match R::from_code(code) {
            Some(reason) => {
                recompute(reason);
                true
            }
            None => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecStatus {
    Initialised = 0,
    NotInitialised = 1,
    Initialising = 2,
}

/// Tracks initialisation and processing state of one instance.
#[derive(Debug)]
pub struct Lifecycle {
    codec: AtomicU8,
    processing: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(CodecStatus::Initialised)
    }
}

impl Lifecycle {
    pub fn new(status: CodecStatus) -> Self {
        Self {
            codec: AtomicU8::new(status as u8),
            processing: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> CodecStatus {
        match self.codec.load(Ordering::SeqCst) {
            0 => CodecStatus::Initialised,
            2 => CodecStatus::Initialising,
            _ => CodecStatus::NotInitialised,
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Flag the instance as needing a rebuild before it can process again.
    ///
    /// Invalidating while a rebuild is running makes that rebuild's
    /// [`Lifecycle::end_init`] a no-op, so the newer request is not lost.
    pub fn invalidate(&self) {
        self.codec
            .store(CodecStatus::NotInitialised as u8, Ordering::SeqCst);
    }

    /// Enter a processing call.
    ///
    /// Returns `None` if the instance is not initialised, in which case the
    /// caller emits silence. Never blocks.
    pub fn begin_processing(&self) -> Option<ProcessingGuard<'_>> {
        self.processing.store(true, Ordering::SeqCst);
        if self.status() == CodecStatus::Initialised {
            Some(ProcessingGuard { lifecycle: self })
        } else {
            self.processing.store(false, Ordering::SeqCst);
            None
        }
    }

    /// Claim the right to rebuild.
    ///
    /// Moves `NotInitialised` to `Initialising` and then waits for the
    /// in-flight processing call to return. Returns `false` if nothing needs
    /// rebuilding or another thread is already doing it.
    pub fn begin_init(&self) -> bool {
        let claimed = self
            .codec
            .compare_exchange(
                CodecStatus::NotInitialised as u8,
                CodecStatus::Initialising as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if claimed {
            self.wait_until_idle();
        }

        claimed
    }

    /// Publish the end of a rebuild. If the instance was invalidated again in
    /// the meantime it stays `NotInitialised`.
    pub fn end_init(&self, succeeded: bool) {
        let status = match succeeded {
            true => CodecStatus::Initialised,
            false => CodecStatus::NotInitialised,
        };
        let _ = self.codec.compare_exchange(
            CodecStatus::Initialising as u8,
            status as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Bounded sleep loop until no processing call is in flight.
    ///
    /// Returns `false` if the processing call did not finish in time.
    pub fn wait_until_idle(&self) -> bool {
        for _ in 0..WAIT_STEPS_MAX {
            if !self.is_processing() {
                return true;
            }
            thread::sleep(WAIT_STEP);
        }
        tracing::warn!("processing call still in flight after waiting, proceeding");
        false
    }
}

/// Marks a processing call as in flight for as long as it lives.
pub struct ProcessingGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.processing.store(false, Ordering::SeqCst);
    }
}

/// Single value hand-off from the control thread to the processing thread.
///
/// The control side may block briefly on [`Slot::put`]. The processing side
/// only ever calls [`Slot::try_take`], which gives up instead of waiting.
#[derive(Debug)]
pub struct Slot<T>(Mutex<Option<T>>);

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self(Mutex::new(None))
    }
}

impl<T> Slot<T> {
    pub fn put(&self, value: T) -> Option<T> {
        self.0.lock().replace(value)
    }

    pub fn try_take(&self) -> Option<T> {
        self.0.try_lock().and_then(|mut slot| slot.take())
    }

    /// Run `f` on the pending value, if any, from the control side.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.0.lock().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Source {
        Euler,
        Quaternion,
    }

    impl Reason for Source {
        fn code(self) -> u8 {
            match self {
                Source::Euler => 1,
                Source::Quaternion => 2,
            }
        }

        fn from_code(code: u8) -> Option<Self> {
            match code {
                1 => Some(Source::Euler),
                2 => Some(Source::Quaternion),
                _ => None,
            }
        }
    }

    #[test]
    fn gate_keeps_latest_reason_and_clears_once() {
        let gate = Gate::ready();
        assert!(!gate.ensure_ready(|_: Source| panic!("not dirty")));

        gate.mark_dirty(Source::Euler);
        gate.mark_dirty(Source::Quaternion);
        assert!(gate.is_dirty());

        let mut seen = None;
        assert!(gate.ensure_ready(|r: Source| seen = Some(r)));
        assert_eq!(seen, Some(Source::Quaternion));
        assert!(!gate.is_dirty());
        assert!(!gate.ensure_ready(|_: Source| panic!("already ready")));
    }

    #[test]
    fn atomic_f32_round_trip() {
        let v = AtomicF32::new(-12.5);
        assert_eq!(v.load(), -12.5);
        v.store(f32::MAX);
        assert_eq!(v.load(), f32::MAX);
    }

    #[test]
    fn processing_refused_until_initialised() {
        let lifecycle = Lifecycle::new(CodecStatus::NotInitialised);
        assert!(lifecycle.begin_processing().is_none());
        assert!(!lifecycle.is_processing());

        assert!(lifecycle.begin_init());
        assert_eq!(lifecycle.status(), CodecStatus::Initialising);
        assert!(lifecycle.begin_processing().is_none());
        assert!(!lifecycle.begin_init());

        lifecycle.end_init(true);
        let guard = lifecycle.begin_processing();
        assert!(guard.is_some());
        assert!(lifecycle.is_processing());
        drop(guard);
        assert!(!lifecycle.is_processing());
    }

    #[test]
    fn init_waits_for_in_flight_processing() {
        let lifecycle = Arc::new(Lifecycle::default());
        let guard_taken = Arc::new(AtomicBool::new(false));

        let worker = {
            let lifecycle = lifecycle.clone();
            let guard_taken = guard_taken.clone();
            thread::spawn(move || {
                let _guard = lifecycle.begin_processing().expect("initialised");
                guard_taken.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
            })
        };

        while !guard_taken.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        lifecycle.invalidate();
        assert!(lifecycle.begin_init());
        assert!(!lifecycle.is_processing());
        lifecycle.end_init(true);

        worker.join().unwrap();
        assert_eq!(lifecycle.status(), CodecStatus::Initialised);
    }

    #[test]
    fn slot_hand_off() {
        let slot = Slot::default();
        assert_eq!(slot.try_take(), None::<u32>);
        assert_eq!(slot.put(1), None);
        assert_eq!(slot.put(2), Some(1));
        assert_eq!(slot.with(|v| v.copied()), Some(2));
        assert_eq!(slot.try_take(), Some(2));
        assert_eq!(slot.try_take(), None);
    }
}
