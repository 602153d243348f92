mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use common::*;
use rhi::gpu::soft::SoftBackend;
use rhi::*;
use serial_test::serial;

#[test]
#[serial]
fn only_one_command_buffer_per_driver() {
    let driver = soft_driver(16, 16);
    let cmd = driver.command_buffer().unwrap();
    assert!(matches!(driver.command_buffer(), Err(GPUError::CommandBufferInUse)));
    drop(cmd);
    assert!(driver.command_buffer().is_ok());
}

#[test]
#[serial]
fn calls_out_of_order_are_rejected() {
    let driver = soft_driver(16, 16);
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();
    let desc = RenderPassDesc::default();

    assert!(matches!(
        cmd.begin_render_pass(&screen, &desc),
        Err(GPUError::InvalidState {
            expected: PassState::FrameActive,
            found: PassState::Idle
        })
    ));
    assert!(cmd.end_frame().is_err());
    assert!(cmd
        .draw_arrays(PrimitiveType::Triangle, 0, 3, false)
        .is_err());

    cmd.begin_frame().unwrap();
    assert_eq!(cmd.current_state(), PassState::FrameActive);
    assert!(cmd.begin_frame().is_err());
    assert!(cmd.end_render_pass().is_err());
    assert!(cmd.resize_swap_chain(8, 8).is_err());

    cmd.begin_render_pass(&screen, &desc).unwrap();
    assert_eq!(cmd.current_state(), PassState::RenderPassActive);
    assert!(matches!(
        cmd.end_frame(),
        Err(GPUError::InvalidState {
            expected: PassState::FrameActive,
            found: PassState::RenderPassActive
        })
    ));
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();
    assert_eq!(cmd.current_state(), PassState::Idle);
    assert_eq!(stats(&driver).presents, 1);
}

#[test]
#[serial]
fn state_setters_need_a_render_pass() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    let vertices = vertex_buffer(&driver, &triangle(WHITE));
    let depth_stencil = driver.create_depth_stencil_state();
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();

    let idle = Err(PassState::Idle);
    let outside = |cmd: &mut CommandBuffer<SoftBackend>| {
        [
            cmd.update_pipeline_state(&pipeline.desc()),
            cmd.set_vertex_buffer(&vertices),
            cmd.set_index_buffer(&vertices),
            cmd.set_program_state(&pipeline.state),
            cmd.set_depth_stencil_state(Some(&depth_stencil)),
            cmd.set_cull_mode(CullMode::Back),
            cmd.set_stencil_reference_value(1),
        ]
        .into_iter()
        .map(|result| match result {
            Err(GPUError::InvalidState { found, .. }) => Err(found),
            other => Ok(other.is_ok()),
        })
        .collect::<Vec<_>>()
    };
    assert!(outside(&mut cmd).iter().all(|r| *r == idle));
    assert_eq!(stats(&driver).blend_states_created, 0);

    cmd.begin_frame().unwrap();
    assert!(outside(&mut cmd)
        .iter()
        .all(|r| *r == Err(PassState::FrameActive)));

    cmd.begin_render_pass(&screen, &RenderPassDesc::default()).unwrap();
    assert!(outside(&mut cmd).iter().all(|r| *r == Ok(true)));
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();
}

#[test]
#[serial]
fn draws_need_bound_state() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    let vertices = vertex_buffer(&driver, &triangle(WHITE));
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();

    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::default()).unwrap();
    assert!(matches!(
        cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false),
        Err(GPUError::InvalidData(_))
    ));
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    assert!(cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).is_err());
    cmd.set_vertex_buffer(&vertices).unwrap();
    assert!(cmd
        .draw_elements(PrimitiveType::Triangle, IndexFormat::UShort, 3, 0, false)
        .is_err());
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();

    // Ending the pass drops per-pass bindings.
    cmd.end_render_pass().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::default()).unwrap();
    assert!(cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).is_err());
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();
    assert_eq!(stats(&driver).draws, 1);
}

#[test]
#[serial]
fn resize_to_zero_is_ignored() {
    let driver = soft_driver(32, 16);
    let mut cmd = driver.command_buffer().unwrap();

    cmd.resize_swap_chain(0, 0).unwrap();
    cmd.resize_swap_chain(0, 64).unwrap();
    assert_eq!(driver.with_device(|device| device.swap_chain_size()), (32, 16));

    cmd.resize_swap_chain(64, 48).unwrap();
    assert_eq!(driver.with_device(|device| device.swap_chain_size()), (64, 48));

    let screen = cmd.screen_target();
    let pixels = read_back(&mut cmd, &screen, false);
    assert_eq!((pixels.width, pixels.height), (64, 48));
}

#[test]
#[serial]
fn queued_operations_run_at_frame_start() {
    let driver = soft_driver(16, 16);
    let ran = Arc::new(AtomicUsize::new(0));
    let queue = driver.operation_queue();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            let ran = ran.clone();
            thread::spawn(move || {
                assert!(queue.push(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }));
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    let mut cmd = driver.command_buffer().unwrap();
    cmd.begin_frame().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 4);
    cmd.end_frame().unwrap();

    let again = ran.clone();
    assert!(driver.queue_operation(move || {
        again.fetch_add(10, Ordering::SeqCst);
    }));
    assert_eq!(driver.drain_operations(), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 14);
}
