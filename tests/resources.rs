mod common;

use std::thread;

use common::*;
use rhi::*;
use serial_test::serial;

#[test]
#[serial]
fn every_native_object_is_destroyed_once() {
    let driver = soft_driver(16, 16);
    {
        let pipeline = ColorPipeline::new(&driver);
        let buffer = vertex_buffer(&driver, &triangle(WHITE));
        let extra_ref = buffer.clone();
        assert_eq!(buffer.ref_count(), 2);
        drop(extra_ref);
        assert_eq!(buffer.ref_count(), 1);

        let (target, texture) = color_target(&driver, 8, 8);
        assert_eq!(texture.ref_count(), 2);
        drop(target);
        assert_eq!(texture.ref_count(), 1);
        drop(pipeline);
    }

    let stats = stats(&driver);
    assert!(stats.created() > 0);
    assert_eq!(stats.created(), stats.destroyed());
    assert_eq!(stats.double_destroys, 0);
    assert_eq!(driver.with_device(|device| device.live_objects()), 0);
}

#[test]
#[serial]
fn buffer_writes_past_capacity_are_rejected() {
    let driver = soft_driver(16, 16);
    let buffer = driver
        .create_buffer(16, BufferType::Vertex, BufferUsage::Dynamic, None)
        .unwrap();

    assert!(buffer.update_sub_data(&[1; 8], 8).is_ok());
    assert!(matches!(
        buffer.update_sub_data(&[1; 8], 9),
        Err(GPUError::BufferOverflow {
            offset: 9,
            size: 8,
            capacity: 16
        })
    ));
    assert!(buffer.update_sub_data(&[], usize::MAX).is_err());
    assert!(matches!(
        driver.create_buffer(4, BufferType::Index, BufferUsage::Static, Some(&[0; 8])),
        Err(GPUError::BufferOverflow { .. })
    ));
}

#[test]
#[serial]
fn immutable_buffer_accepts_one_write() {
    let driver = soft_driver(16, 16);
    let initialized = driver
        .create_buffer(4, BufferType::Uniform, BufferUsage::Immutable, Some(&[1, 2, 3, 4]))
        .unwrap();
    assert!(matches!(initialized.update_data(&[0; 4]), Err(GPUError::ImmutableBuffer)));

    let empty = driver
        .create_buffer(4, BufferType::Uniform, BufferUsage::Immutable, None)
        .unwrap();
    empty.update_data(&[5; 4]).unwrap();
    assert!(matches!(empty.update_data(&[6; 4]), Err(GPUError::ImmutableBuffer)));
}

#[test]
#[serial]
fn unsupported_compressed_format_falls_back() {
    let driver = soft_driver(16, 16);
    assert!(!driver.check_for_feature_supported(FeatureType::Etc2));
    assert!(!driver.is_format_supported(PixelFormat::Etc2Rgba));
    assert_eq!(driver.resolve_format(PixelFormat::Etc2Rgba), PixelFormat::RGBA8);

    let texture = TextureBuilder::new(4, 4)
        .format(PixelFormat::Etc2Rgba)
        .build(&driver);
    assert!(texture.is_valid());
    assert_eq!(texture.requested_format(), PixelFormat::Etc2Rgba);
    assert_eq!(texture.format(), PixelFormat::RGBA8);

    // Block data cannot go into the substituted texture, decoded texels can.
    assert!(matches!(
        texture.update_compressed_data(&[0; 16], 4, 4, 0),
        Err(GPUError::Unsupported(_))
    ));
    texture.update_data(&[255; 64], 4, 4, 0).unwrap();
}

#[test]
#[serial]
fn invalid_textures_reject_updates() {
    let driver = soft_driver(16, 16);
    let too_large = driver.max_texture_size() + 1;
    let texture = TextureBuilder::new(too_large, 1).build(&driver);
    assert!(!texture.is_valid());
    assert!(matches!(
        texture.update_data(&[0; 4], 1, 1, 0),
        Err(GPUError::InvalidResource)
    ));
    assert_eq!(texture.mip_level_count(), 0);

    let formatless = TextureBuilder::new(4, 4)
        .format(PixelFormat::None)
        .build(&driver);
    assert!(!formatless.is_valid());
}

#[test]
#[serial]
fn mipmaps_are_refused_on_render_targets() {
    let driver = soft_driver(16, 16);
    let (_target, texture) = color_target(&driver, 8, 8);
    assert!(matches!(texture.generate_mipmaps(), Err(GPUError::MipmapOnRenderTarget)));

    let sampled = TextureBuilder::new(8, 4).build(&driver);
    assert_eq!(sampled.mip_level_count(), 1);
    sampled.generate_mipmaps().unwrap();
    assert_eq!(sampled.mip_level_count(), 4);
}

#[test]
#[serial]
fn partial_uploads_are_bounds_checked() {
    let driver = soft_driver(16, 16);
    let texture = TextureBuilder::new(4, 4).mip_levels(0).build(&driver);
    assert_eq!(texture.mip_level_count(), 3);

    texture.update_sub_data(2, 2, 2, 2, 0, &[9; 16]).unwrap();
    assert!(texture.update_sub_data(3, 3, 2, 2, 0, &[9; 16]).is_err());
    // Offsets near the top of the range must not wrap into bounds.
    assert!(matches!(
        texture.update_sub_data(u32::MAX, 0, 2, 2, 0, &[9; 16]),
        Err(GPUError::InvalidData(_))
    ));
    assert!(matches!(
        texture.update_sub_data(0, u32::MAX - 1, 1, 4, 0, &[9; 16]),
        Err(GPUError::InvalidData(_))
    ));
    assert!(texture.update_data(&[9; 16], 2, 2, 1).is_ok());
    assert!(matches!(
        texture.update_data(&[9; 4], 2, 2, 1),
        Err(GPUError::InvalidData(_))
    ));
}

#[test]
#[serial]
fn releases_from_other_threads_wait_for_collection() {
    let driver = soft_driver(16, 16);
    let buffer = driver
        .create_buffer(64, BufferType::Vertex, BufferUsage::Static, None)
        .unwrap();
    let texture = TextureBuilder::new(2, 2).build(&driver);

    thread::spawn(move || {
        drop(buffer);
        drop(texture);
    })
    .join()
    .unwrap();

    let before = stats(&driver);
    assert_eq!(before.buffers_destroyed, 0);
    assert_eq!(before.textures_destroyed, 0);

    assert_eq!(driver.collect_garbage(), 2);
    let after = stats(&driver);
    assert_eq!(after.buffers_destroyed, 1);
    assert_eq!(after.textures_destroyed, 1);
    assert_eq!(driver.collect_garbage(), 0);
}
