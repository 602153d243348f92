pub mod gpu;
pub mod utils;

pub use gpu::*;
pub use utils::Handle;

use std::sync::Mutex;

use utils::lock;

static DRIVER: Mutex<Option<Driver<DefaultBackend>>> = Mutex::new(None);

/// Process-wide driver, constructed on first access from
/// [`DriverConfig::from_env`].
pub fn driver() -> Driver<DefaultBackend> {
    let mut slot = lock(&DRIVER);
    if let Some(driver) = slot.as_ref() {
        return driver.clone();
    }
    let config = DriverConfig::from_env().unwrap_or_else(|err| {
        log::warn!("ignoring driver config: {err}");
        DriverConfig::default()
    });
    let driver = Driver::new(config);
    *slot = Some(driver.clone());
    driver
}

/// Tear down the process-wide driver. Queued cross-thread operations are
/// discarded. Resources still held elsewhere keep the device alive until
/// they are dropped.
pub fn destroy_driver() {
    let driver = lock(&DRIVER).take();
    if let Some(driver) = driver {
        driver.shutdown();
    }
}
