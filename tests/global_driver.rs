mod common;

use serial_test::serial;

#[test]
#[serial]
fn process_driver_is_shared_until_destroyed() {
    common::init_logging();
    let first = rhi::driver();
    let second = rhi::driver();
    assert_eq!(first.renderer(), second.renderer());

    let queue = first.operation_queue();
    assert!(queue.push(|| {}));

    // The command buffer is shared state, so the second handle sees it taken.
    let cmd = first.command_buffer().unwrap();
    assert!(second.command_buffer().is_err());
    drop(cmd);

    rhi::destroy_driver();
    assert!(!queue.push(|| {}));
    assert_eq!(first.drain_operations(), 0);

    let fresh = rhi::driver();
    assert!(fresh.command_buffer().is_ok());
    rhi::destroy_driver();
}

#[test]
#[serial]
fn config_files_feed_the_driver() {
    common::init_logging();
    assert!(matches!(
        common::SoftDriver::from_config_file("driver.yaml"),
        Err(rhi::GPUError::Config(rhi::ConfigError::UnsupportedFormat(_)))
    ));
    assert!(matches!(
        common::SoftDriver::from_config_file("/nonexistent/rhi/driver.toml"),
        Err(rhi::GPUError::Config(rhi::ConfigError::Io(_)))
    ));

    let path = std::env::temp_dir().join("rhi_config_files_feed_the_driver.toml");
    std::fs::write(&path, "[surface]\nwidth = 32\nheight = 24\n").unwrap();
    let driver = common::SoftDriver::from_config_file(path.to_str().unwrap()).unwrap();
    assert_eq!(driver.config().surface.width, 32);

    std::fs::write(&path, "[surface\nwidth = ").unwrap();
    assert!(matches!(
        common::SoftDriver::from_config_file(path.to_str().unwrap()),
        Err(rhi::GPUError::Config(rhi::ConfigError::Parse(_)))
    ));
    let _ = std::fs::remove_file(&path);
}
