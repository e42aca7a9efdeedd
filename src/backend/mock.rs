use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::PinDirection;
use crate::error::GpioError;
use crate::gpio::GpioBackend;

/// One recorded write to the shared pull register pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullWrite {
    Control(u32),
    Clock(u32),
}

#[derive(Default)]
struct MockPin {
    value: bool,
    script: VecDeque<bool>,
    direction: Option<PinDirection>,
    reads: usize,
    fail_reads: bool,
}

/// In-memory stand-in for the hardware. Lines hold a settable value or a
/// scripted sequence of reads (the last scripted value sticks once the
/// script drains), and every claim, release and pull register write is
/// recorded for assertions.
#[derive(Default)]
pub struct MockBackend {
    pins: Mutex<FxHashMap<u32, MockPin>>,
    claimed: Mutex<FxHashSet<u32>>,
    pull_writes: Mutex<Vec<PullWrite>>,
    fail_pull_clock_once: AtomicBool,
}

impl MockBackend {
    pub fn set_value(&self, number: u32, value: bool) {
        let mut pins = self.pins.lock();
        pins.entry(number).or_default().value = value;
    }

    /// Queue a sequence of values handed out by consecutive reads.
    pub fn script_reads(&self, number: u32, values: impl IntoIterator<Item = bool>) {
        let mut pins = self.pins.lock();
        pins.entry(number).or_default().script.extend(values);
    }

    /// Make every subsequent read of this line fail.
    pub fn fail_reads(&self, number: u32) {
        let mut pins = self.pins.lock();
        pins.entry(number).or_default().fail_reads = true;
    }

    pub fn read_count(&self, number: u32) -> usize {
        self.pins.lock().get(&number).map_or(0, |pin| pin.reads)
    }

    pub fn is_claimed(&self, number: u32) -> bool {
        self.claimed.lock().contains(&number)
    }

    pub fn direction_of(&self, number: u32) -> Option<PinDirection> {
        self.pins.lock().get(&number).and_then(|pin| pin.direction)
    }

    pub fn pull_writes(&self) -> Vec<PullWrite> {
        self.pull_writes.lock().clone()
    }

    /// Make the next pull clock write fail.
    pub fn fail_next_pull_clock(&self) {
        self.fail_pull_clock_once.store(true, Ordering::SeqCst);
    }
}

impl GpioBackend for MockBackend {
    fn claim(&self, number: u32) -> Result<(), GpioError> {
        self.claimed.lock().insert(number);
        self.pins.lock().entry(number).or_default();
        Ok(())
    }

    fn set_direction(&self, number: u32, direction: PinDirection) -> Result<(), GpioError> {
        let mut pins = self.pins.lock();
        pins.entry(number).or_default().direction = Some(direction);
        Ok(())
    }

    fn read_value(&self, number: u32) -> Result<bool, GpioError> {
        let mut pins = self.pins.lock();
        let pin = pins.entry(number).or_default();
        if pin.fail_reads {
            return Err(GpioError::Hardware(format!(
                "simulated read failure on pin {number}"
            )));
        }
        pin.reads += 1;
        if let Some(value) = pin.script.pop_front() {
            pin.value = value;
        }
        Ok(pin.value)
    }

    fn write_value(&self, number: u32, value: bool) -> Result<(), GpioError> {
        let mut pins = self.pins.lock();
        pins.entry(number).or_default().value = value;
        Ok(())
    }

    fn release(&self, number: u32) -> Result<(), GpioError> {
        self.claimed.lock().remove(&number);
        Ok(())
    }

    fn write_pull_control(&self, code: u32) -> Result<(), GpioError> {
        self.pull_writes.lock().push(PullWrite::Control(code));
        Ok(())
    }

    fn write_pull_clock(&self, mask: u32) -> Result<(), GpioError> {
        if self.fail_pull_clock_once.swap(false, Ordering::SeqCst) {
            return Err(GpioError::Hardware(
                "simulated pull clock write failure".to_string(),
            ));
        }
        self.pull_writes.lock().push(PullWrite::Clock(mask));
        Ok(())
    }

    fn release_registers(&self) {}
}
