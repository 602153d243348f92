mod common;

use common::*;
use rhi::*;
use serial_test::serial;

fn rgba(driver: &SoftDriver) -> Texture<rhi::gpu::soft::SoftBackend> {
    TextureBuilder::new(8, 8)
        .render_target(PixelFormat::RGBA8)
        .build(driver)
}

#[test]
#[serial]
fn color_attachments_stay_contiguous() {
    let driver = soft_driver(16, 16);
    let target = driver.create_render_target();
    let (a, b, c) = (rgba(&driver), rgba(&driver), rgba(&driver));

    target.set_color_texture(0, Some(&a), 0).unwrap();
    assert!(matches!(
        target.set_color_texture(2, Some(&c), 0),
        Err(GPUError::AttachmentGap { index: 2, count: 1 })
    ));
    target.set_color_texture(1, Some(&b), 0).unwrap();
    target.set_color_texture(2, Some(&c), 0).unwrap();
    assert_eq!(target.color_attachment_count(), 3);

    // Only the last attachment may go.
    assert!(matches!(
        target.set_color_texture(0, None, 0),
        Err(GPUError::AttachmentGap { index: 0, count: 3 })
    ));
    target.set_color_texture(2, None, 0).unwrap();
    assert_eq!(target.color_attachment_count(), 2);
    assert_eq!(target.color_texture(1), Some(b.clone()));

    // Replacing in place keeps the count.
    target.set_color_texture(1, Some(&c), 0).unwrap();
    assert_eq!(target.color_attachment_count(), 2);
    assert!(matches!(
        target.set_color_texture(MAX_COLOR_ATTACHMENTS, Some(&a), 0),
        Err(GPUError::AttachmentIndex(4))
    ));
}

#[test]
#[serial]
fn depth_attachment_needs_a_depth_format() {
    let driver = soft_driver(16, 16);
    let target = driver.create_render_target();
    let color = rgba(&driver);
    let depth = TextureBuilder::new(8, 8)
        .render_target(PixelFormat::D24S8)
        .build(&driver);

    assert!(matches!(
        target.set_depth_stencil_texture(Some(&color), 0),
        Err(GPUError::NotDepthFormat(_))
    ));
    target.set_depth_stencil_texture(Some(&depth), 0).unwrap();
    assert_eq!(target.depth_stencil_texture(), Some(depth));
    assert_eq!(target.size(), Some((8, 8)));

    target.set_color_texture(0, Some(&color), 1).unwrap();
    assert_eq!(target.size(), Some((4, 4)));
}

#[test]
#[serial]
fn default_target_has_no_attachments() {
    let driver = soft_driver(16, 16);
    let target = driver.create_default_render_target();
    assert!(target.is_default());
    assert_eq!(target.size(), None);
    assert!(matches!(
        target.set_color_texture(0, Some(&rgba(&driver)), 0),
        Err(GPUError::Unsupported(_))
    ));
}

#[test]
#[serial]
fn only_dirty_views_are_rebuilt() {
    let driver = soft_driver(16, 16);
    let mut cmd = driver.command_buffer().unwrap();
    let (target, _texture) = color_target(&driver, 8, 8);
    let depth = TextureBuilder::new(8, 8)
        .render_target(PixelFormat::D24S8)
        .build(&driver);
    target.set_depth_stencil_texture(Some(&depth), 0).unwrap();

    assert!(target.is_color_dirty(0));
    assert!(target.is_depth_stencil_dirty());
    assert!(!target.is_color_dirty(1));

    let pass = |cmd: &mut CommandBuffer<_>| {
        cmd.begin_frame().unwrap();
        cmd.begin_render_pass(&target, &RenderPassDesc::default()).unwrap();
        cmd.end_render_pass().unwrap();
        cmd.end_frame().unwrap();
    };

    pass(&mut cmd);
    assert!(target.dirty_flags().is_empty());
    let first = stats(&driver);
    assert_eq!(first.color_view_rebuilds, 1);
    assert_eq!(first.depth_stencil_view_rebuilds, 1);

    pass(&mut cmd);
    let second = stats(&driver);
    assert_eq!(second.color_view_rebuilds, 1);
    assert_eq!(second.depth_stencil_view_rebuilds, 1);

    let other = rgba(&driver);
    target.set_color_texture(0, Some(&other), 0).unwrap();
    assert_eq!(target.dirty_flags(), TargetBufferFlags::COLOR0);
    pass(&mut cmd);
    let third = stats(&driver);
    assert_eq!(third.color_view_rebuilds, 2);
    assert_eq!(third.depth_stencil_view_rebuilds, 1);

    target.set_depth_stencil_texture(None, 0).unwrap();
    assert_eq!(target.dirty_flags(), TargetBufferFlags::DEPTH_AND_STENCIL);
    pass(&mut cmd);
    let fourth = stats(&driver);
    assert_eq!(fourth.color_view_rebuilds, 2);
    assert_eq!(fourth.depth_stencil_view_rebuilds, 2);
    assert!(target.dirty_flags().is_empty());
}
