use std::fs::{self, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use parking_lot::Mutex;

use crate::config::PinDirection;
use crate::error::GpioError;
use crate::gpio::GpioBackend;

/// Offsets of the pull registers inside the GPIO register window (BCM2835).
const GPPUD_OFFSET: usize = 0x94;
const GPPUDCLK0_OFFSET: usize = 0x98;

/// One page covers the whole GPIO register block.
const REGISTER_WINDOW_LEN: usize = 4096;

const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";
const GPIOMEM_DEVICE: &str = "/dev/gpiomem";

/// Backend for real hardware: pin claims and state go through the sysfs
/// pseudo-files, pull resistor configuration through a memory-mapped window
/// over the GPIO controller registers.
///
/// The window is mapped lazily on the first pull register write and torn
/// down by [`release_registers`](GpioBackend::release_registers).
pub struct SysfsBackend {
    gpio_root: PathBuf,
    gpiomem_path: PathBuf,
    registers: Mutex<Option<RegisterWindow>>,
}

impl SysfsBackend {
    pub fn new() -> Self {
        Self::with_paths(SYSFS_GPIO_ROOT, GPIOMEM_DEVICE)
    }

    /// Point the backend at alternate control paths. Tests aim this at a
    /// temp directory and a page-sized scratch file.
    pub fn with_paths(gpio_root: impl Into<PathBuf>, gpiomem_path: impl Into<PathBuf>) -> Self {
        Self {
            gpio_root: gpio_root.into(),
            gpiomem_path: gpiomem_path.into(),
            registers: Mutex::new(None),
        }
    }

    fn pin_dir(&self, number: u32) -> PathBuf {
        self.gpio_root.join(format!("gpio{number}"))
    }

    fn pin_file(&self, number: u32, name: &str) -> PathBuf {
        self.pin_dir(number).join(name)
    }

    fn write_control(&self, path: &Path, contents: &str) -> Result<(), GpioError> {
        fs::write(path, contents)
            .map_err(|e| GpioError::Hardware(format!("write {}: {e}", path.display())))
    }

    fn write_register(&self, offset: usize, value: u32) -> Result<(), GpioError> {
        let mut registers = self.registers.lock();
        if registers.is_none() {
            *registers = Some(RegisterWindow::map(&self.gpiomem_path)?);
        }
        if let Some(window) = registers.as_ref() {
            window.write(offset, value);
        }
        Ok(())
    }
}

impl Default for SysfsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioBackend for SysfsBackend {
    fn claim(&self, number: u32) -> Result<(), GpioError> {
        // Another process (or a previous crash) may have left the pin
        // exported; writing the number again would fail with EBUSY.
        if self.pin_dir(number).exists() {
            return Ok(());
        }
        self.write_control(&self.gpio_root.join("export"), &number.to_string())
    }

    fn set_direction(&self, number: u32, direction: PinDirection) -> Result<(), GpioError> {
        let value = match direction {
            PinDirection::Input => "in",
            PinDirection::Output => "out",
        };
        self.write_control(&self.pin_file(number, "direction"), value)
    }

    fn read_value(&self, number: u32) -> Result<bool, GpioError> {
        let path = self.pin_file(number, "value");
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Hardware(format!("read {}: {e}", path.display())))?;
        Ok(contents.as_bytes().first() == Some(&b'1'))
    }

    fn write_value(&self, number: u32, value: bool) -> Result<(), GpioError> {
        self.write_control(&self.pin_file(number, "value"), if value { "1" } else { "0" })
    }

    fn release(&self, number: u32) -> Result<(), GpioError> {
        self.write_control(&self.gpio_root.join("unexport"), &number.to_string())
    }

    fn write_pull_control(&self, code: u32) -> Result<(), GpioError> {
        self.write_register(GPPUD_OFFSET, code)
    }

    fn write_pull_clock(&self, mask: u32) -> Result<(), GpioError> {
        self.write_register(GPPUDCLK0_OFFSET, mask)
    }

    fn release_registers(&self) {
        if let Some(window) = self.registers.lock().take() {
            window.unmap();
        }
    }
}

/// Mapped view over the GPIO controller registers.
struct RegisterWindow {
    base: *mut u8,
}

// The raw pointer never leaves this module and all writes are volatile.
unsafe impl Send for RegisterWindow {}

impl RegisterWindow {
    fn map(path: &Path) -> Result<Self, GpioError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| GpioError::Hardware(format!("open {}: {e}", path.display())))?;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                REGISTER_WINDOW_LEN,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(GpioError::Hardware(format!(
                "mmap {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self { base: base as *mut u8 })
    }

    fn write(&self, offset: usize, value: u32) {
        debug_assert!(offset + size_of::<u32>() <= REGISTER_WINDOW_LEN);
        unsafe {
            ptr::write_volatile(self.base.add(offset) as *mut u32, value);
        }
    }

    fn unmap(self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, REGISTER_WINDOW_LEN);
        }
    }
}
