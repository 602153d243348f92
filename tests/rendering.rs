mod common;

use common::*;
use rhi::gpu::reflect::ScType;
use rhi::gpu::soft::SoftBackend;
use rhi::*;
use serial_test::serial;

const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];
const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];

#[test]
#[serial]
fn clear_fills_the_whole_backbuffer() {
    let driver = soft_driver(256, 256);
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();

    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::clear_color(RED))
        .unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();

    let pixels = read_back(&mut cmd, &screen, false);
    assert_eq!((pixels.width, pixels.height), (256, 256));
    assert!(pixels.data.chunks_exact(4).all(|px| px == [255, 0, 0, 255]));
    assert_eq!(stats(&driver).clears, 1);
}

#[test]
#[serial]
fn texture_target_clears_and_reads_back_top_down() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    // Upper-left corner of clip space.
    let corner = [
        ColorVertex::new(-1.0, 1.0, GREEN),
        ColorVertex::new(-1.0, 0.0, GREEN),
        ColorVertex::new(0.0, 1.0, GREEN),
    ];
    let vertices = vertex_buffer(&driver, &corner);
    let texture = TextureBuilder::new(256, 256)
        .render_target(PixelFormat::RGBA8)
        .build(&driver);
    let target = driver.create_render_target();
    target.set_color_texture(0, Some(&texture), 0).unwrap();
    let mut cmd = driver.command_buffer().unwrap();

    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&target, &RenderPassDesc::clear_color(RED))
        .unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();
    assert_eq!(stats(&driver).color_view_rebuilds, 1);

    let pixels = read_back(&mut cmd, &target, false);
    let red = Some([255, 0, 0, 255]);
    let green = Some([0, 255, 0, 255]);
    assert_eq!((pixels.width, pixels.height), (256, 256));
    assert_eq!(pixels.pixel(0, 0), green);
    assert_eq!(pixels.pixel(32, 32), green);
    assert_eq!(pixels.pixel(255, 0), red);
    assert_eq!(pixels.pixel(0, 255), red);
    assert_eq!(pixels.pixel(255, 255), red);
    assert_eq!(pixels.pixel(128, 200), red);
}

#[test]
#[serial]
fn zero_instance_draws_produce_nothing() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    let vertices = vertex_buffer(&driver, &triangle(WHITE));
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();

    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::clear_color(BLUE))
        .unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();
    cmd.draw_arrays_instanced(PrimitiveType::Triangle, 0, 3, 0, false)
        .unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();

    let pixels = read_back(&mut cmd, &screen, false);
    assert_eq!(pixels.pixel(8, 8), Some([0, 0, 255, 255]));
    assert_eq!(stats(&driver).draws, 0);

    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::default()).unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();
    cmd.draw_arrays_instanced(PrimitiveType::Triangle, 0, 3, 2, false)
        .unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();

    let pixels = read_back(&mut cmd, &screen, false);
    assert_eq!(pixels.pixel(8, 8), Some([255, 255, 255, 255]));
    assert_eq!(stats(&driver).draws, 1);
}

#[test]
#[serial]
fn triangle_covers_the_center_only() {
    let driver = soft_driver(64, 64);
    let pipeline = ColorPipeline::new(&driver);
    pipeline
        .state
        .set_uniform_value(&pipeline.state.uniform_location("u_color"), &[0.0f32, 1.0, 0.0, 1.0])
        .unwrap();
    let vertices = vertex_buffer(&driver, &triangle(WHITE));
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();

    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::clear_color(BLUE))
        .unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();

    let pixels = read_back(&mut cmd, &screen, false);
    assert_eq!(pixels.pixel(32, 32), Some([0, 255, 0, 255]));
    assert_eq!(pixels.pixel(0, 0), Some([0, 0, 255, 255]));
    assert_eq!(pixels.pixel(63, 63), Some([0, 0, 255, 255]));
    assert_eq!(stats(&driver).draws, 1);
}

#[test]
#[serial]
fn readback_is_top_down_unless_preserved() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    // Upper half of clip space.
    let quad = [
        ColorVertex::new(-1.0, 0.0, RED),
        ColorVertex::new(1.0, 0.0, RED),
        ColorVertex::new(1.0, 1.0, RED),
        ColorVertex::new(-1.0, 0.0, RED),
        ColorVertex::new(1.0, 1.0, RED),
        ColorVertex::new(-1.0, 1.0, RED),
    ];
    let vertices = vertex_buffer(&driver, &quad);
    let (target, _texture) = color_target(&driver, 2, 2);
    let mut cmd = driver.command_buffer().unwrap();

    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&target, &RenderPassDesc::clear_color([0.0, 0.0, 0.0, 1.0]))
        .unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 6, false).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();

    let red = Some([255, 0, 0, 255]);
    let black = Some([0, 0, 0, 255]);

    let top_down = read_back(&mut cmd, &target, false);
    assert_eq!((top_down.width, top_down.height), (2, 2));
    assert_eq!([top_down.pixel(0, 0), top_down.pixel(1, 0)], [red, red]);
    assert_eq!([top_down.pixel(0, 1), top_down.pixel(1, 1)], [black, black]);

    let native = read_back(&mut cmd, &target, true);
    assert_eq!([native.pixel(0, 0), native.pixel(1, 0)], [black, black]);
    assert_eq!([native.pixel(0, 1), native.pixel(1, 1)], [red, red]);
}

#[test]
#[serial]
fn indexed_draws_read_the_index_buffer() {
    let driver = soft_driver(32, 32);
    let pipeline = ColorPipeline::new(&driver);
    let corners = [
        ColorVertex::new(-1.0, -1.0, RED),
        ColorVertex::new(1.0, -1.0, RED),
        ColorVertex::new(1.0, 1.0, RED),
        ColorVertex::new(-1.0, 1.0, RED),
    ];
    let vertices = vertex_buffer(&driver, &corners);
    let indices: [u16; 6] = [0, 1, 2, 0, 2, 3];
    let index_buffer = BufferBuilder::new(BufferType::Index)
        .data(bytemuck::cast_slice(&indices))
        .build(&driver)
        .unwrap();
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();

    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::clear_color(BLUE))
        .unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();
    cmd.set_index_buffer(&index_buffer).unwrap();
    // Second triangle only: the upper-left half.
    cmd.draw_elements(PrimitiveType::Triangle, IndexFormat::UShort, 3, 6, false)
        .unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();

    let pixels = read_back(&mut cmd, &screen, false);
    assert_eq!(pixels.pixel(2, 2), Some([255, 0, 0, 255]));
    assert_eq!(pixels.pixel(29, 29), Some([0, 0, 255, 255]));
}

#[test]
#[serial]
fn identical_blend_states_share_one_native_object() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();
    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::default()).unwrap();

    let desc = pipeline.desc();
    cmd.update_pipeline_state(&desc).unwrap();
    cmd.update_pipeline_state(&desc).unwrap();
    let first = stats(&driver);
    assert_eq!(first.blend_states_created, 1);

    // A second pipeline object with the same descriptor hits the cache.
    let other = driver.create_render_pipeline();
    cmd.set_render_pipeline(&other).unwrap();
    cmd.update_pipeline_state(&desc).unwrap();
    let second = stats(&driver);
    assert_eq!(second.blend_states_created, 1);
    assert_eq!(second.last_blend_state, first.last_blend_state);

    let blended = PipelineDesc {
        blend_desc: BlendDesc::alpha_blend(),
        ..desc.clone()
    };
    cmd.update_pipeline_state(&blended).unwrap();
    let third = stats(&driver);
    assert_eq!(third.blend_states_created, 2);
    assert_ne!(third.last_blend_state, first.last_blend_state);
    assert_eq!(other.blend_desc(), BlendDesc::alpha_blend());

    cmd.update_pipeline_state(&desc).unwrap();
    assert_eq!(stats(&driver).blend_states_created, 2);
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();
}

#[test]
#[serial]
fn depth_stencil_states_are_cached_by_descriptor() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    let vertices = vertex_buffer(&driver, &triangle(WHITE));
    let first = driver.create_depth_stencil_state();
    let second = driver.create_depth_stencil_state();
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();

    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::default()).unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();

    cmd.set_depth_stencil_state(Some(&first)).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    cmd.set_depth_stencil_state(Some(&second)).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    assert_eq!(stats(&driver).depth_stencil_states_created, 1);

    cmd.update_depth_stencil_state(&DepthStencilDesc {
        depth_compare_function: CompareFunc::LessEqual,
        ..Default::default()
    })
    .unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    assert_eq!(stats(&driver).depth_stencil_states_created, 2);

    cmd.set_depth_stencil_state(None).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    assert_eq!(stats(&driver).last_depth_stencil_state, None);
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();
}

#[test]
#[serial]
fn rasterizer_state_is_applied_only_on_change() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    let vertices = vertex_buffer(&driver, &triangle(WHITE));
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();

    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::default()).unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    assert_eq!(stats(&driver).rasterizer_applies, 1);

    cmd.set_cull_mode(CullMode::Back).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    assert_eq!(stats(&driver).rasterizer_applies, 2);
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();
}

#[test]
#[serial]
fn callback_uniforms_run_before_each_draw() {
    let driver = soft_driver(16, 16);
    let pipeline = ColorPipeline::new(&driver);
    let vertices = vertex_buffer(&driver, &triangle(WHITE));
    let location = pipeline.state.uniform_location("u_color");
    let mut frame = 0.0f32;
    pipeline.state.set_callback_uniform(&location, move |uniforms, location| {
        frame += 1.0;
        let tint = [frame / 4.0, 0.0, 0.0, 1.0];
        uniforms.set(location, bytemuck::bytes_of(&tint)).unwrap();
    });
    let mut cmd = driver.command_buffer().unwrap();
    let screen = cmd.screen_target();

    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::default()).unwrap();
    cmd.update_pipeline_state(&pipeline.desc()).unwrap();
    cmd.set_vertex_buffer(&vertices).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();

    let tint: [f32; 4] = bytemuck::pod_read_unaligned(&pipeline.state.uniform_buffer().fragment()[..16]);
    assert_eq!(tint, [0.5, 0.0, 0.0, 1.0]);
}

fn draw_once(cmd: &mut CommandBuffer<SoftBackend>, pipeline: &PipelineDesc<SoftBackend>, vertices: &Buffer<SoftBackend>) {
    let screen = cmd.screen_target();
    cmd.begin_frame().unwrap();
    cmd.begin_render_pass(&screen, &RenderPassDesc::clear_color(BLUE))
        .unwrap();
    cmd.update_pipeline_state(pipeline).unwrap();
    cmd.set_vertex_buffer(vertices).unwrap();
    cmd.draw_arrays(PrimitiveType::Triangle, 0, 3, false).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end_frame().unwrap();
}

#[test]
#[serial]
fn textures_share_samplers_by_descriptor() {
    let driver = soft_driver(16, 16);
    let fragment = ShaderContainerBuilder::new(ShaderStage::Fragment, "void main() {}")
        .uniform_block("Tint", 1)
        .uniform("u_color", ScType::Float4, 1)
        .texture("u_tex0", 3, 1)
        .to_bytes();
    let program = driver.create_program(&color_vertex_container(), &fragment);
    assert!(program.is_valid(), "{}", program.diagnostics());
    let mut desc = VertexLayoutDesc::start_layout(2);
    desc.add_program_attrib(program.layout(), "a_position", VertexFormat::Float3, 0, false)
        .add_program_attrib(program.layout(), "a_color", VertexFormat::Float4, 12, false);
    let layout = driver.create_vertex_layout(desc);

    let state = ProgramState::new(&program);
    let unit = state.builtin_location(Uniform::Texture);
    let first = TextureBuilder::new(2, 2).build(&driver);
    let second = TextureBuilder::new(4, 4).build(&driver);
    state.set_texture(&unit, &first);
    let pipeline = PipelineDesc {
        program_state: Some(state.clone()),
        vertex_layout: Some(layout),
        blend_desc: BlendDesc::default(),
    };
    let vertices = vertex_buffer(&driver, &triangle(WHITE));
    let mut cmd = driver.command_buffer().unwrap();

    draw_once(&mut cmd, &pipeline, &vertices);
    assert_eq!(stats(&driver).samplers_created, 1);

    // Same descriptor on a different texture reuses the sampler.
    state.set_texture(&unit, &second);
    draw_once(&mut cmd, &pipeline, &vertices);
    assert_eq!(stats(&driver).samplers_created, 1);

    let nearest = SamplerDesc {
        min_filter: SamplerMinFilter::Nearest,
        mag_filter: SamplerMagFilter::Nearest,
        ..SamplerDesc::default()
    };
    second.update_sampler_desc(nearest).unwrap();
    draw_once(&mut cmd, &pipeline, &vertices);
    draw_once(&mut cmd, &pipeline, &vertices);
    assert_eq!(stats(&driver).samplers_created, 2);

    // Recreation invalidates every cached sampler.
    driver.with_device(|device| device.simulate_device_loss());
    driver.recover_device().unwrap();
    draw_once(&mut cmd, &pipeline, &vertices);
    assert_eq!(stats(&driver).samplers_created, 3);
    assert_eq!(stats(&driver).draws, 5);
}
