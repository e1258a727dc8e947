use bytemuck::{Pod, Zeroable};
use cgmath::Matrix4;
use wgpu::util::DeviceExt;

use crate::device_errors::create_or_exit;
use crate::matrix_operations::flatten_matrix_for_wgpu;
use crate::physics::StateSlot;
use crate::physics_pass::PhysicsBuffers;
use crate::voxel_storage::{CellId, FaceId, VoxelStorage};

pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
pub const PICK_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// How face corners follow the cells that share them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum RenderMode {
    /// Every face follows its owning cell only; cubes drift apart as rigid boxes.
    Cubes,
    /// Corners are averaged over all cells sharing them, gluing the cubes together.
    Stretchy,
}

impl RenderMode {
    pub fn toggled(self) -> Self {
        match self {
            RenderMode::Cubes => RenderMode::Stretchy,
            RenderMode::Stretchy => RenderMode::Cubes,
        }
    }

    fn shader_id(self) -> u32 {
        match self {
            RenderMode::Cubes => 0,
            RenderMode::Stretchy => 1,
        }
    }
}

#[repr(C)]
#[derive(Default, Copy, Clone, Debug, Pod, Zeroable)]
pub struct FrameUniforms {
    transform: [[f32; 4]; 4],
    mode: u32,
    _pad: [u32; 3],
}

impl FrameUniforms {
    pub fn new(transform: Matrix4<f32>, mode: RenderMode) -> Self {
        Self {
            transform: flatten_matrix_for_wgpu(transform),
            mode: mode.shader_id(),
            _pad: [0; 3],
        }
    }
}

/// Per-face highlight flags, one byte each, mirrored into a storage buffer.
#[derive(Clone, Debug)]
pub struct FaceHighlight {
    bytes: Vec<u8>,
    face_count: usize,
    dirty: bool,
}

impl FaceHighlight {
    pub fn new(face_count: usize) -> Self {
        // Storage buffers are read as u32 words.
        let padded = face_count.div_ceil(4).max(1) * 4;
        Self {
            bytes: vec![0; padded],
            face_count,
            dirty: true,
        }
    }

    pub fn highlight_cell(&mut self, storage: &VoxelStorage, cell: CellId) {
        for (face, _) in storage.faces_of(cell) {
            self.bytes[face.index()] = u8::MAX;
        }
        self.dirty = true;
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
        self.dirty = true;
    }

    pub fn is_highlighted(&self, face: FaceId) -> bool {
        face.index() < self.face_count && self.bytes[face.index()] != 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn upload(&mut self, queue: &wgpu::Queue, buffer: &wgpu::Buffer) {
        if self.dirty {
            queue.write_buffer(buffer, 0, &self.bytes);
            self.dirty = false;
        }
    }
}

const UNIFORM_GROUP_ID: u32 = 0;
const FRAME_UNIFORM_IDX: u32 = 0;

const STATIC_GROUP_ID: u32 = 1;
const CORNER_BUFFER_IDX: u32 = 0;
const HIGHLIGHT_BUFFER_IDX: u32 = 1;

const STATE_GROUP_ID: u32 = 2;
const DATA_3D_IDX: u32 = 0;
const DATA_4D_IDX: u32 = 1;
const DEBUG_IDX: u32 = 2;

const FACE_CORNER_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Uint32x4];
const FACE_CELL_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![1 => Uint32];

fn read_only_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn depth_stencil_state() -> wgpu::DepthStencilState {
    wgpu::DepthStencilState {
        format: DEPTH_FORMAT,
        depth_write_enabled: true,
        depth_compare: wgpu::CompareFunction::Less,
        stencil: Default::default(),
        bias: Default::default(),
    }
}

pub fn create_depth_view(
    device: &wgpu::Device,
    width: u32,
    height: u32,
    label: &str,
) -> wgpu::TextureView {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

pub struct VoxelPass {
    shaded_pipeline: wgpu::RenderPipeline,
    pick_pipeline: wgpu::RenderPipeline,
    vector_pipeline: wgpu::RenderPipeline,
}

impl VoxelPass {
    pub fn new(device: &wgpu::Device, format: wgpu::TextureFormat) -> Self {
        let uniform_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Voxels: Uniform Bind Group Layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: FRAME_UNIFORM_IDX,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });
        let static_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Voxels: Static Bind Group Layout"),
                entries: &[
                    read_only_entry(CORNER_BUFFER_IDX),
                    read_only_entry(HIGHLIGHT_BUFFER_IDX),
                ],
            });
        let state_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Voxels: State Bind Group Layout"),
                entries: &[
                    read_only_entry(DATA_3D_IDX),
                    read_only_entry(DATA_4D_IDX),
                    read_only_entry(DEBUG_IDX),
                ],
            });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Voxel Pipeline Layout"),
            bind_group_layouts: &[
                &uniform_bind_group_layout,
                &static_bind_group_layout,
                &state_bind_group_layout,
            ],
            push_constant_ranges: &[],
        });

        let shader = create_or_exit(device, "voxel shader", || {
            device.create_shader_module(wgpu::include_wgsl!("voxels.wgsl"))
        });
        let face_buffers = [
            wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<[u32; 4]>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Instance,
                attributes: &FACE_CORNER_ATTRIBUTES,
            },
            wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<u32>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Instance,
                attributes: &FACE_CELL_ATTRIBUTES,
            },
        ];
        let face_pipeline = |label: &str, entry_point: &str, target: wgpu::ColorTargetState| {
            create_or_exit(device, label, || {
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(label),
                    layout: Some(&layout),
                    vertex: wgpu::VertexState {
                        module: &shader,
                        entry_point: Some("vs_face"),
                        compilation_options: Default::default(),
                        buffers: &face_buffers,
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &shader,
                        entry_point: Some(entry_point),
                        compilation_options: Default::default(),
                        targets: &[Some(target)],
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleList,
                        strip_index_format: None,
                        front_face: Default::default(),
                        cull_mode: None,
                        unclipped_depth: false,
                        polygon_mode: Default::default(),
                        conservative: false,
                    },
                    depth_stencil: Some(depth_stencil_state()),
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                })
            })
        };
        let shaded_pipeline = face_pipeline(
            "Voxel Shaded Pipeline",
            "fs_shaded",
            wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                write_mask: wgpu::ColorWrites::ALL,
            },
        );
        let pick_pipeline = face_pipeline("Voxel Pick Pipeline", "fs_pick", PICK_FORMAT.into());

        let vector_pipeline = create_or_exit(device, "Voxel Vector Pipeline", || {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Voxel Vector Pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_vectors"),
                    compilation_options: Default::default(),
                    buffers: &[],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_vectors"),
                    compilation_options: Default::default(),
                    targets: &[Some(format.into())],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::LineList,
                    ..Default::default()
                },
                depth_stencil: Some(depth_stencil_state()),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        });

        Self {
            shaded_pipeline,
            pick_pipeline,
            vector_pipeline,
        }
    }
}

/// Geometry and uniforms the voxel pipelines draw from.
pub struct VoxelBuffers {
    pub face_corners: wgpu::Buffer,
    pub face_cells: wgpu::Buffer,
    pub corners: wgpu::Buffer,
    pub highlight: wgpu::Buffer,
    pub render_uniform: wgpu::Buffer,
    pub pick_uniform: wgpu::Buffer,
}

impl VoxelBuffers {
    pub fn new(device: &wgpu::Device, storage: &VoxelStorage, highlight: &FaceHighlight) -> Self {
        let mut face_corners = storage.face_indices();
        let mut face_cells = storage.face_cells();
        let mut corners = storage.corner_records();
        debug_assert_eq!(face_corners.len(), face_cells.len());
        // Empty buffers cannot be bound.
        if face_corners.is_empty() {
            face_corners.push([0; 4]);
            face_cells.push(0);
        }
        if corners.is_empty() {
            corners.push(Default::default());
        }

        let uniform = |label: &str| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::bytes_of(&FrameUniforms::default()),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            })
        };
        Self {
            face_corners: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Face Corner Buffer"),
                contents: bytemuck::cast_slice(&face_corners),
                usage: wgpu::BufferUsages::VERTEX,
            }),
            face_cells: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Face Cell Buffer"),
                contents: bytemuck::cast_slice(&face_cells),
                usage: wgpu::BufferUsages::VERTEX,
            }),
            corners: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Corner Record Buffer"),
                contents: bytemuck::cast_slice(&corners),
                usage: wgpu::BufferUsages::STORAGE,
            }),
            highlight: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Face Highlight Buffer"),
                contents: highlight.as_bytes(),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            }),
            render_uniform: uniform("Render Uniform Buffer"),
            pick_uniform: uniform("Pick Uniform Buffer"),
        }
    }
}

pub struct VoxelBindings {
    render_uniform: wgpu::BindGroup,
    pick_uniform: wgpu::BindGroup,
    static_bind_group: wgpu::BindGroup,
    state_bind_group: wgpu::BindGroup,
}

impl VoxelBindings {
    /// The state group binds slot A, which holds the latest snapshot between frames.
    pub fn new(
        device: &wgpu::Device,
        VoxelPass { shaded_pipeline, .. }: &VoxelPass,
        buffers: &VoxelBuffers,
        physics: &PhysicsBuffers,
    ) -> Self {
        let uniform_group = |label: &str, buffer: &wgpu::Buffer| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &shaded_pipeline.get_bind_group_layout(UNIFORM_GROUP_ID),
                entries: &[wgpu::BindGroupEntry {
                    binding: FRAME_UNIFORM_IDX,
                    resource: buffer.as_entire_binding(),
                }],
            })
        };
        let static_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Voxels: Static Bind Group"),
            layout: &shaded_pipeline.get_bind_group_layout(STATIC_GROUP_ID),
            entries: &[
            wgpu::BindGroupEntry {
                binding: CORNER_BUFFER_IDX,
                resource: buffers.corners.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: HIGHLIGHT_BUFFER_IDX,
                resource: buffers.highlight.as_entire_binding(),
            }],
        });
        let state = physics.state(StateSlot::A);
        let state_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Voxels: State Bind Group"),
            layout: &shaded_pipeline.get_bind_group_layout(STATE_GROUP_ID),
            entries: &[
            wgpu::BindGroupEntry {
                binding: DATA_3D_IDX,
                resource: state.data_3d.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: DATA_4D_IDX,
                resource: state.data_4d.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: DEBUG_IDX,
                resource: physics.debug.as_entire_binding(),
            }],
        });
        Self {
            render_uniform: uniform_group(
                "Voxels: Render Uniform Bind Group",
                &buffers.render_uniform,
            ),
            pick_uniform: uniform_group("Voxels: Pick Uniform Bind Group", &buffers.pick_uniform),
            static_bind_group,
            state_bind_group,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaceTarget {
    Screen,
    Pick,
}

impl<'a> VoxelPass {
    pub fn record_faces<'pass>(
        &'a self,
        rpass: &mut wgpu::RenderPass<'pass>,
        bindings: &'a VoxelBindings,
        buffers: &'a VoxelBuffers,
        target: FaceTarget,
        face_count: u32,
    ) where
        'a: 'pass,
    {
        if face_count == 0 {
            return;
        }
        let (pipeline, uniform) = match target {
            FaceTarget::Screen => (&self.shaded_pipeline, &bindings.render_uniform),
            FaceTarget::Pick => (&self.pick_pipeline, &bindings.pick_uniform),
        };
        rpass.set_pipeline(pipeline);
        rpass.set_bind_group(UNIFORM_GROUP_ID, uniform, &[]);
        rpass.set_bind_group(STATIC_GROUP_ID, &bindings.static_bind_group, &[]);
        rpass.set_bind_group(STATE_GROUP_ID, &bindings.state_bind_group, &[]);
        rpass.set_vertex_buffer(0, buffers.face_corners.slice(..));
        rpass.set_vertex_buffer(1, buffers.face_cells.slice(..));
        rpass.draw(0..6, 0..face_count);
    }

    pub fn record_vectors<'pass>(
        &'a self,
        rpass: &mut wgpu::RenderPass<'pass>,
        bindings: &'a VoxelBindings,
        cell_count: u32,
    ) where
        'a: 'pass,
    {
        if cell_count == 0 {
            return;
        }
        rpass.set_pipeline(&self.vector_pipeline);
        rpass.set_bind_group(UNIFORM_GROUP_ID, &bindings.render_uniform, &[]);
        rpass.set_bind_group(STATIC_GROUP_ID, &bindings.static_bind_group, &[]);
        rpass.set_bind_group(STATE_GROUP_ID, &bindings.state_bind_group, &[]);
        rpass.draw(0..4, 0..cell_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid3;

    #[test]
    fn test_frame_uniform_layout() {
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 80);
        let uniforms = FrameUniforms::new(Matrix4::from_scale(2.0), RenderMode::Stretchy);
        assert_eq!(uniforms.transform[0][0], 2.0);
        assert_eq!(uniforms.transform[3][3], 1.0);
        assert_eq!(uniforms.mode, 1);
    }

    #[test]
    fn test_render_mode_toggles() {
        assert_eq!(RenderMode::Cubes.toggled(), RenderMode::Stretchy);
        assert_eq!(RenderMode::Stretchy.toggled().toggled(), RenderMode::Stretchy);
    }

    #[test]
    fn test_highlight_is_word_padded() {
        assert_eq!(FaceHighlight::new(0).as_bytes().len(), 4);
        assert_eq!(FaceHighlight::new(10).as_bytes().len(), 12);
        assert_eq!(FaceHighlight::new(12).as_bytes().len(), 12);
    }

    #[test]
    fn test_highlight_cell_marks_only_its_faces() {
        let storage = VoxelStorage::extract(&Grid3::new([2, 1, 1], true));
        let mut highlight = FaceHighlight::new(storage.face_count());
        highlight.highlight_cell(&storage, CellId(1));

        for (i, face) in storage.faces().iter().enumerate() {
            assert_eq!(highlight.is_highlighted(FaceId(i as u32)), face.cell == CellId(1));
        }
        assert_eq!(highlight.as_bytes().iter().filter(|b| **b != 0).count(), 5);

        highlight.clear();
        assert!(highlight.as_bytes().iter().all(|b| *b == 0));
    }
}
