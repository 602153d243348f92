#![allow(dead_code)]

use bytemuck::{Pod, Zeroable};
use rhi::gpu::reflect::ScType;
use rhi::gpu::soft::{SoftBackend, SoftStats};
use rhi::*;

pub type SoftDriver = Driver<SoftBackend>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Software driver with a `width` x `height` backbuffer.
pub fn soft_driver(width: u32, height: u32) -> SoftDriver {
    init_logging();
    let mut config = DriverConfig::default();
    config.surface.width = width;
    config.surface.height = height;
    Driver::try_new(config).unwrap()
}

pub fn stats(driver: &SoftDriver) -> SoftStats {
    driver.with_device(|device| device.stats().clone())
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ColorVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

impl ColorVertex {
    pub fn new(x: f32, y: f32, color: [f32; 4]) -> Self {
        Self {
            position: [x, y, 0.0],
            color,
        }
    }
}

pub const WHITE: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

const VS_SOURCE: &str = r"#version 330
in vec3 a_position;
in vec4 a_color;
uniform Transform { mat4 u_MVPMatrix; };
out vec4 v_color;
void main() {
    v_color = a_color;
    gl_Position = u_MVPMatrix * vec4(a_position, 1.0);
}
";

const FS_SOURCE: &str = r"#version 330
in vec4 v_color;
uniform Tint { vec4 u_color; };
out vec4 frag_color;
void main() {
    frag_color = v_color * u_color;
}
";

pub fn color_vertex_container() -> Vec<u8> {
    ShaderContainerBuilder::new(ShaderStage::Vertex, VS_SOURCE)
        .name("color_vs")
        .input("a_position", 0, ScType::Float3)
        .input("a_color", 1, ScType::Float4)
        .uniform_block("Transform", 0)
        .uniform("u_MVPMatrix", ScType::Mat4, 1)
        .to_bytes()
}

pub fn tint_fragment_container() -> Vec<u8> {
    ShaderContainerBuilder::new(ShaderStage::Fragment, FS_SOURCE)
        .name("tint_fs")
        .uniform_block("Tint", 1)
        .uniform("u_color", ScType::Float4, 1)
        .to_bytes()
}

/// Position/color program with an identity transform and a white tint.
pub struct ColorPipeline {
    pub program: Program<SoftBackend>,
    pub state: ProgramState<SoftBackend>,
    pub layout: VertexLayout,
}

impl ColorPipeline {
    pub fn new(driver: &SoftDriver) -> Self {
        let program = driver.create_program(&color_vertex_container(), &tint_fragment_container());
        assert!(program.is_valid(), "{}", program.diagnostics());

        let mut desc = VertexLayoutDesc::start_layout(2);
        desc.add_program_attrib(program.layout(), "a_position", VertexFormat::Float3, 0, false)
            .add_program_attrib(program.layout(), "a_color", VertexFormat::Float4, 12, false);
        let layout = driver.create_vertex_layout(desc);

        let state = ProgramState::new(&program);
        let mvp = state.builtin_location(Uniform::MvpMatrix);
        state
            .set_uniform_value(&mvp, &glam::Mat4::IDENTITY.to_cols_array())
            .unwrap();
        state.set_uniform_value(&state.uniform_location("u_color"), &WHITE).unwrap();

        Self {
            program,
            state,
            layout,
        }
    }

    pub fn desc(&self) -> PipelineDesc<SoftBackend> {
        PipelineDesc {
            program_state: Some(self.state.clone()),
            vertex_layout: Some(self.layout.clone()),
            blend_desc: BlendDesc::default(),
        }
    }
}

pub fn vertex_buffer(driver: &SoftDriver, vertices: &[ColorVertex]) -> Buffer<SoftBackend> {
    BufferBuilder::new(BufferType::Vertex)
        .data(bytemuck::cast_slice(vertices))
        .build(driver)
        .unwrap()
}

pub fn triangle(color: [f32; 4]) -> [ColorVertex; 3] {
    [
        ColorVertex::new(-0.5, -0.5, color),
        ColorVertex::new(0.5, -0.5, color),
        ColorVertex::new(0.0, 0.5, color),
    ]
}

/// Color render target backed by a fresh RGBA8 texture.
pub fn color_target(driver: &SoftDriver, width: u32, height: u32) -> (RenderTarget<SoftBackend>, Texture<SoftBackend>) {
    let texture = TextureBuilder::new(width, height)
        .render_target(PixelFormat::RGBA8)
        .build(driver);
    assert!(texture.is_valid());
    let target = driver.create_render_target();
    target.set_color_texture(0, Some(&texture), 0).unwrap();
    (target, texture)
}

pub fn read_back(
    cmd: &mut CommandBuffer<SoftBackend>,
    target: &RenderTarget<SoftBackend>,
    preserve: bool,
) -> PixelBuffer {
    let mut out = PixelBuffer::default();
    cmd.read_pixels(target, preserve, |pixels| out = pixels.clone())
        .unwrap();
    out
}
