mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use rhi::*;
use serial_test::serial;

#[test]
#[serial]
fn lost_device_is_recovered_with_content() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    let vertices = vertex_buffer(&driver, &triangle(WHITE));

    // A sampled texture attached as a target reads back its retained upload.
    let texels: Vec<u8> = (0..4u8).flat_map(|i| [i * 60, 0, 0, 255]).collect();
    let sampled = TextureBuilder::new(2, 2).build(&driver);
    sampled.update_data(&texels, 2, 2, 0).unwrap();
    let target = driver.create_render_target();
    target.set_color_texture(0, Some(&sampled), 0).unwrap();

    let recreated = Arc::new(AtomicUsize::new(0));
    let counter = recreated.clone();
    driver.add_recreate_listener(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut cmd = driver.command_buffer().unwrap();
    cmd.begin_frame().unwrap();
    driver.with_device(|device| device.simulate_device_loss());
    assert!(matches!(cmd.end_frame(), Err(GPUError::DeviceLost(_))));
    assert!(driver.is_device_lost());
    assert_eq!(cmd.current_state(), PassState::Idle);
    assert!(matches!(cmd.begin_frame(), Err(GPUError::DeviceLost(_))));
    assert!(cmd.update_pipeline_state(&pipeline.desc()).is_err());

    driver.recover_device().unwrap();
    assert!(!driver.is_device_lost());
    assert_eq!(recreated.load(Ordering::SeqCst), 1);
    assert_eq!(stats(&driver).recreations, 1);

    let restored = read_back(&mut cmd, &target, true);
    assert_eq!(restored.data, texels);

    // Programs, buffers and pipeline state work again after recovery.
    let screen = cmd.screen_target();
    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::clear_color([0.0, 0.0, 0.0, 1.0]))
        .unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();

    let pixels = read_back(&mut cmd, &screen, false);
    assert_eq!(pixels.pixel(8, 8), Some([255, 255, 255, 255]));
}

#[test]
#[serial]
fn dropped_shadow_copy_comes_back_zeroed() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    let vertices = vertex_buffer(&driver, &triangle(WHITE));
    vertices.retain_shadow_copy(false);

    driver.with_device(|device| device.simulate_device_loss());
    driver.recover_device().unwrap();

    // Every vertex now sits at the origin, so nothing is covered.
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();
    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::clear_color([0.0, 0.0, 0.0, 1.0]))
        .unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();

    let pixels = read_back(&mut cmd, &screen, false);
    assert_eq!(pixels.pixel(8, 8), Some([0, 0, 0, 255]));
}

#[test]
#[serial]
fn failed_recovery_keeps_the_device_lost() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    let vertices = vertex_buffer(&driver, &triangle(WHITE));
    let _texture = TextureBuilder::new(2, 2).build(&driver);

    let recreated = Arc::new(AtomicUsize::new(0));
    let counter = recreated.clone();
    let registrar = driver.clone();
    driver.add_recreate_listener(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let nested = counter.clone();
        registrar.add_recreate_listener(move || {
            nested.fetch_add(100, Ordering::SeqCst);
        });
    });

    driver.with_device(|device| {
        device.simulate_device_loss();
        device.fail_next_allocations(1);
    });
    assert!(matches!(driver.recover_device(), Err(GPUError::Device(_))));
    assert!(driver.is_device_lost());
    assert_eq!(recreated.load(Ordering::SeqCst), 0);
    let mut cmd = driver.command_buffer().unwrap();
    assert!(matches!(cmd.begin_frame(), Err(GPUError::DeviceLost(_))));

    // A retry rebuilds everything, and listeners may register listeners.
    driver.recover_device().unwrap();
    assert!(!driver.is_device_lost());
    assert_eq!(recreated.load(Ordering::SeqCst), 1);

    let screen = cmd.screen_target();
    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::clear_color([0.0, 0.0, 0.0, 1.0]))
        .unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();
    let pixels = read_back(&mut cmd, &screen, false);
    assert_eq!(pixels.pixel(8, 8), Some([255, 255, 255, 255]));

    // The listener added during the first recovery runs on the next one.
    driver.with_device(|device| device.simulate_device_loss());
    driver.recover_device().unwrap();
    assert_eq!(recreated.load(Ordering::SeqCst), 102);
}
