pub mod mock;
pub mod sysfs;

pub use mock::{MockBackend, PullWrite};
pub use sysfs::SysfsBackend;
