use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use log::warn;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{EdgeKind, GpioTimings, PinDirection, ResistorMode};
use crate::error::GpioError;

const MONITOR_IDLE: u8 = 0;
const MONITOR_RUNNING: u8 = 1;
const MONITOR_STOPPING: u8 = 2;

/// Hardware access seam between the pin manager and the platform.
///
/// The pull register pair is shared chip-wide state; callers serialize the
/// latch sequence themselves (see [`GpioManager::set_resistor`]).
pub trait GpioBackend: Send + Sync {
    /// OS-level claim of a pin, skipped if the pin is already present there.
    fn claim(&self, number: u32) -> Result<(), GpioError>;
    fn set_direction(&self, number: u32, direction: PinDirection) -> Result<(), GpioError>;
    fn read_value(&self, number: u32) -> Result<bool, GpioError>;
    fn write_value(&self, number: u32, value: bool) -> Result<(), GpioError>;
    /// OS-level release of a claimed pin.
    fn release(&self, number: u32) -> Result<(), GpioError>;
    /// 32-bit write to the pull control register (GPPUD).
    fn write_pull_control(&self, code: u32) -> Result<(), GpioError>;
    /// 32-bit write to the pull clock register (GPPUDCLK0).
    fn write_pull_clock(&self, mask: u32) -> Result<(), GpioError>;
    /// Tear down the register mapping, if one was ever opened. Idempotent.
    fn release_registers(&self);
}

/// One exported hardware line. Handles are created by
/// [`GpioManager::export`] and stay valid until the pin is unexported.
pub struct Pin<B: GpioBackend> {
    number: u32,
    direction: PinDirection,
    name: RwLock<String>,
    resistor: RwLock<ResistorMode>,
    cached_state: AtomicBool,
    teardown: AtomicBool,
    monitor_state: AtomicU8,
    monitor_fault: Mutex<Option<GpioError>>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
    backend: Arc<B>,
    timings: GpioTimings,
    // Handed to the monitor thread; set up by the registry via new_cyclic.
    weak_self: Weak<Pin<B>>,
}

impl<B: GpioBackend> Pin<B> {
    fn new(
        number: u32,
        direction: PinDirection,
        backend: Arc<B>,
        timings: GpioTimings,
        weak_self: Weak<Pin<B>>,
    ) -> Self {
        Self {
            number,
            direction,
            name: RwLock::new(format!("Pin {number}")),
            resistor: RwLock::new(ResistorMode::Off),
            cached_state: AtomicBool::new(false),
            teardown: AtomicBool::new(false),
            monitor_state: AtomicU8::new(MONITOR_IDLE),
            monitor_fault: Mutex::new(None),
            monitor_thread: Mutex::new(None),
            backend,
            timings,
            weak_self,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn direction(&self) -> PinDirection {
        self.direction
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn resistor_mode(&self) -> ResistorMode {
        *self.resistor.read()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor_state.load(Ordering::SeqCst) != MONITOR_IDLE
    }

    /// Current logical state of the line.
    ///
    /// Inputs are re-read from the hardware on every call. Outputs return the
    /// last value written through [`set_state`](Self::set_state) without
    /// touching the hardware; an output that was never set reads `false`.
    pub fn get_state(&self) -> Result<bool, GpioError> {
        match self.direction {
            PinDirection::Output => Ok(self.cached_state.load(Ordering::SeqCst)),
            PinDirection::Input => self.read_input(),
        }
    }

    pub fn set_state(&self, state: bool) -> Result<(), GpioError> {
        if self.direction == PinDirection::Input {
            return Err(GpioError::InvalidDirection(format!(
                "Pin {} is exported as an input",
                self.number
            )));
        }

        self.backend.write_value(self.number, state)?;
        self.cached_state.store(state, Ordering::SeqCst);
        Ok(())
    }

    /// Start polling the line in a background thread and invoke `callback`
    /// with `(pin, new_state)` on every transition matching `edge`.
    ///
    /// The callback runs on the polling thread itself, so a slow callback
    /// delays subsequent polls of this pin. After any observed transition the
    /// loop sleeps for the debounce interval to ride out contact bounce.
    pub fn monitor<F>(&self, callback: F, edge: EdgeKind) -> Result<(), GpioError>
    where
        F: Fn(&Pin<B>, bool) + Send + 'static,
        B: 'static,
    {
        if self.direction == PinDirection::Output {
            return Err(GpioError::InvalidDirection(format!(
                "Pin {} is exported as an output",
                self.number
            )));
        }

        if self
            .monitor_state
            .compare_exchange(
                MONITOR_IDLE,
                MONITOR_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(GpioError::AlreadyMonitoring(self.number));
        }

        // Read the baseline up front so a dead line fails this call instead
        // of the background task.
        let baseline = match self.read_input() {
            Ok(state) => state,
            Err(e) => {
                self.monitor_state.store(MONITOR_IDLE, Ordering::SeqCst);
                return Err(e);
            }
        };

        // Reap a previous loop's finished thread before starting a new one.
        if let Some(handle) = self.monitor_thread.lock().take() {
            let _ = handle.join();
        }

        let pin = match self.weak_self.upgrade() {
            Some(pin) => pin,
            None => {
                self.monitor_state.store(MONITOR_IDLE, Ordering::SeqCst);
                return Err(GpioError::Hardware(format!(
                    "pin {} handle was dropped",
                    self.number
                )));
            }
        };
        let spawned = thread::Builder::new()
            .name(format!("gpio-monitor-{}", self.number))
            .spawn(move || pin.run_monitor(baseline, callback, edge));

        match spawned {
            Ok(handle) => {
                *self.monitor_thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.monitor_state.store(MONITOR_IDLE, Ordering::SeqCst);
                Err(GpioError::Hardware(format!("spawn monitor thread: {e}")))
            }
        }
    }

    /// Request the monitor loop to exit. The request is observed between
    /// polls; [`GpioManager::unexport`] joins the thread afterwards.
    pub fn stop_monitoring(&self) {
        let _ = self.monitor_state.compare_exchange(
            MONITOR_RUNNING,
            MONITOR_STOPPING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// A hardware read failure inside the monitor loop ends the loop and is
    /// parked here; this hands it out once.
    pub fn take_monitor_fault(&self) -> Option<GpioError> {
        self.monitor_fault.lock().take()
    }

    pub(crate) fn join_monitor(&self) {
        if let Some(handle) = self.monitor_thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub(crate) fn record_resistor(&self, mode: ResistorMode) {
        *self.resistor.write() = mode;
    }

    /// Claim this pin for teardown. Only one caller wins; the pin stays
    /// registered until the winner finishes, so the number cannot be
    /// re-exported while the OS-level release is still pending.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.teardown.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn abort_teardown(&self) {
        self.teardown.store(false, Ordering::SeqCst);
    }

    fn read_input(&self) -> Result<bool, GpioError> {
        let state = self.backend.read_value(self.number)?;
        self.cached_state.store(state, Ordering::SeqCst);
        Ok(state)
    }

    fn run_monitor<F>(self: Arc<Self>, mut last_state: bool, callback: F, edge: EdgeKind)
    where
        F: Fn(&Pin<B>, bool),
    {
        loop {
            if self.monitor_state.load(Ordering::SeqCst) == MONITOR_STOPPING {
                break;
            }

            let new_state = match self.read_input() {
                Ok(state) => state,
                Err(e) => {
                    warn!("monitor loop for pin {} aborted: {e}", self.number);
                    *self.monitor_fault.lock() = Some(e);
                    break;
                }
            };

            if new_state != last_state {
                if edge.matches(new_state) {
                    callback(self.as_ref(), new_state);
                }
                thread::sleep(self.timings.debounce());
            } else {
                thread::sleep(self.timings.poll_interval());
            }

            last_state = new_state;
        }

        self.monitor_state.store(MONITOR_IDLE, Ordering::SeqCst);
    }
}

impl<B: GpioBackend> PartialEq for Pin<B> {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
    }
}

impl<B: GpioBackend> Eq for Pin<B> {}

impl<B: GpioBackend> fmt::Debug for Pin<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pin")
            .field("number", &self.number)
            .field("direction", &self.direction)
            .field("name", &*self.name.read())
            .finish_non_exhaustive()
    }
}

impl<B: GpioBackend> fmt::Display for Pin<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name.read())
    }
}

/// Process-wide pin registry, resistor controller and cleanup point.
///
/// Owns every exported [`Pin`] and the shared pull register state behind the
/// backend. One instance per process against real hardware; tests create as
/// many as they like against mock backends.
pub struct GpioManager<B: GpioBackend> {
    backend: Arc<B>,
    timings: GpioTimings,
    pins: Mutex<FxHashMap<u32, Arc<Pin<B>>>>,
    pull_lock: Mutex<()>,
}

impl<B: GpioBackend> GpioManager<B> {
    pub fn new(backend: Arc<B>, timings: GpioTimings) -> Self {
        Self {
            backend,
            timings,
            pins: Mutex::new(FxHashMap::default()),
            pull_lock: Mutex::new(()),
        }
    }

    /// Claim `number` for this process and fix its direction.
    ///
    /// The OS-level export is skipped when the pin is already present at the
    /// OS level; the direction is written either way.
    pub fn export(
        &self,
        number: u32,
        direction: PinDirection,
    ) -> Result<Arc<Pin<B>>, GpioError> {
        let mut pins = self.pins.lock();
        if pins.contains_key(&number) {
            return Err(GpioError::AlreadyExported(number));
        }

        self.backend.claim(number)?;
        self.backend.set_direction(number, direction)?;

        let backend = Arc::clone(&self.backend);
        let timings = self.timings;
        let pin = Arc::new_cyclic(|weak| {
            Pin::new(number, direction, backend, timings, weak.clone())
        });
        pins.insert(number, Arc::clone(&pin));
        Ok(pin)
    }

    /// Release `number` back to the OS.
    ///
    /// A running monitor loop is stopped and joined first, and a non-`Off`
    /// resistor is reset, so the line is quiescent before the OS-level
    /// unexport happens.
    pub fn unexport(&self, number: u32) -> Result<(), GpioError> {
        let pin = self
            .pins
            .lock()
            .get(&number)
            .cloned()
            .ok_or(GpioError::NotExported(number))?;

        // Concurrent unexports of the same pin race for the teardown; the
        // loser must not reach the OS-level release a second time.
        if !pin.begin_teardown() {
            return Err(GpioError::NotExported(number));
        }

        pin.stop_monitoring();
        pin.join_monitor();

        if pin.resistor_mode() != ResistorMode::Off {
            if let Err(e) = self.apply_resistor(&pin, ResistorMode::Off) {
                pin.abort_teardown();
                return Err(e);
            }
        }

        if let Err(e) = self.backend.release(number) {
            pin.abort_teardown();
            return Err(e);
        }

        self.pins.lock().remove(&number);
        Ok(())
    }

    /// Latch a pull resistor mode onto an input pin.
    ///
    /// Drives the chip's two-phase handshake: the mode code goes into the
    /// pull control register, settles, is clocked onto this pin's bit, and
    /// both registers are cleared again. The whole sequence runs under one
    /// lock since the registers are shared by every pin on the chip.
    pub fn set_resistor(&self, pin: &Pin<B>, mode: ResistorMode) -> Result<(), GpioError> {
        if pin.direction() == PinDirection::Output {
            return Err(GpioError::InvalidDirection(format!(
                "Pin {} is exported as an output",
                pin.number()
            )));
        }
        if !self.pins.lock().contains_key(&pin.number()) {
            return Err(GpioError::NotExported(pin.number()));
        }

        self.apply_resistor(pin, mode)
    }

    /// Unexport every registered pin and release the register mapping.
    /// Safe to call repeatedly and with an empty registry.
    pub fn cleanup(&self) {
        let numbers: Vec<u32> = self.pins.lock().keys().copied().collect();
        for number in numbers {
            if let Err(e) = self.unexport(number) {
                warn!("cleanup: failed to unexport pin {number}: {e}");
                // The registry must drain even when the OS-level release
                // fails, or a retry would report AlreadyExported forever.
                self.pins.lock().remove(&number);
            }
        }

        self.backend.release_registers();
    }

    pub fn exported_pins(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self.pins.lock().keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }

    fn apply_resistor(&self, pin: &Pin<B>, mode: ResistorMode) -> Result<(), GpioError> {
        // Only bank 0 (pins 0-31) is reachable through GPPUDCLK0.
        let mask = 1u32.checked_shl(pin.number()).ok_or_else(|| {
            GpioError::Hardware(format!(
                "Pin {} is outside the pull clock register bank",
                pin.number()
            ))
        })?;

        let _guard = self.pull_lock.lock();
        if let Err(e) = self.latch_pull(mode, mask) {
            // The registers are shared chip-wide; never leave them asserted
            // for the next caller.
            let _ = self.backend.write_pull_control(0);
            let _ = self.backend.write_pull_clock(0);
            return Err(e);
        }

        pin.record_resistor(mode);
        Ok(())
    }

    fn latch_pull(&self, mode: ResistorMode, mask: u32) -> Result<(), GpioError> {
        self.backend.write_pull_control(mode.code())?;
        thread::sleep(self.timings.settle_delay());
        self.backend.write_pull_clock(mask)?;
        thread::sleep(self.timings.settle_delay());
        self.backend.write_pull_control(0)?;
        self.backend.write_pull_clock(0)
    }
}

impl<B: GpioBackend> Drop for GpioManager<B> {
    fn drop(&mut self) {
        self.cleanup();
    }
}
