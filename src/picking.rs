use std::path::PathBuf;

use cgmath::{Matrix4, Point3, Vector3};

use crate::device_errors::DeviceErrorScope;
use crate::matrix_operations::{pixel_transform, project, unproject};
use crate::physics_pass::read_mapped;
use crate::voxel_pass::{
    create_depth_view, FaceTarget, FrameUniforms, RenderMode, VoxelBindings, VoxelBuffers,
    VoxelPass, PICK_FORMAT,
};
use crate::voxel_storage::{CellId, FaceId};

const BASE: u32 = 255;

/// Base-255 digits of the face index, least significant in red.
pub fn encode_face_id(face: FaceId) -> [u8; 4] {
    let id = face.0;
    [
        (id % BASE) as u8,
        (id / BASE % BASE) as u8,
        (id / (BASE * BASE)) as u8,
        u8::MAX,
    ]
}

/// The target is cleared to white, which no face index produces.
pub fn decode_pixel(pixel: [u8; 4]) -> Option<FaceId> {
    let [r, g, b, _] = pixel;
    if [r, g, b] == [u8::MAX; 3] {
        return None;
    }
    Some(FaceId(r as u32 + g as u32 * BASE + b as u32 * BASE * BASE))
}

/// Texture-to-buffer copies need rows aligned to `COPY_BYTES_PER_ROW_ALIGNMENT`.
pub fn padded_bytes_per_row(width: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (width * 4).div_ceil(align) * align
}

pub fn pixel_at(bytes: &[u8], bytes_per_row: u32, x: u32, y: u32) -> [u8; 4] {
    let start = (y * bytes_per_row + x * 4) as usize;
    [bytes[start], bytes[start + 1], bytes[start + 2], bytes[start + 3]]
}

pub fn strip_row_padding(bytes: &[u8], width: u32, height: u32, bytes_per_row: u32) -> Vec<u8> {
    let row = (width * 4) as usize;
    (0..height as usize)
        .flat_map(|y| {
            let start = y * bytes_per_row as usize;
            bytes[start..start + row].iter().copied()
        })
        .collect()
}

/// A cell grabbed with the pointer.
#[derive(Clone, Debug, PartialEq)]
pub struct ClickSelection {
    pub cell: CellId,
    pub face: FaceId,
    /// Window depth of the cell centre when it was grabbed.
    pub screen_depth: f32,
    /// Cell position minus the cursor's world position at that depth.
    pub world_offset: Vector3<f32>,
}

fn cursor_window(viewport: [f32; 2], cursor: [f32; 2], depth: f32) -> Vector3<f32> {
    Vector3::new(cursor[0], viewport[1] - cursor[1], depth)
}

impl ClickSelection {
    pub fn begin(
        cell: CellId,
        face: FaceId,
        cell_position: Point3<f32>,
        transform: Matrix4<f32>,
        viewport: [f32; 2],
        cursor: [f32; 2],
    ) -> Option<Self> {
        let screen_depth = project(transform, cell_position, viewport).z;
        let window = cursor_window(viewport, cursor, screen_depth);
        let grabbed = unproject(window, transform, viewport)?;
        Some(Self {
            cell,
            face,
            screen_depth,
            world_offset: cell_position - grabbed,
        })
    }

    /// Where the grabbed cell would sit with the cursor at `cursor`. Nothing moves it there yet.
    pub fn drag_target(
        &self,
        transform: Matrix4<f32>,
        viewport: [f32; 2],
        cursor: [f32; 2],
    ) -> Option<Point3<f32>> {
        let window = cursor_window(viewport, cursor, self.screen_depth);
        let under_cursor = unproject(window, transform, viewport)?;
        Some(under_cursor + self.world_offset)
    }
}

/// Off-screen face-id target used to resolve clicks.
pub struct Picker {
    size: u32,
    color_texture: wgpu::Texture,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    readback: wgpu::Buffer,
    dump_dir: Option<PathBuf>,
    dumped: u32,
}

impl Picker {
    pub fn new(device: &wgpu::Device, size: u32, dump_dir: Option<PathBuf>) -> Self {
        let color_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Pick Color Target"),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: PICK_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let color_view = color_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = create_depth_view(device, size, size, "Pick Depth Target");
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Pick Readback Buffer"),
            size: (padded_bytes_per_row(size) * size) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            size,
            color_texture,
            color_view,
            depth_view,
            readback,
            dump_dir,
            dumped: 0,
        }
    }

    /// Renders the faces under `cursor` and returns the one nearest the camera.
    #[allow(clippy::too_many_arguments)]
    pub fn pick(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        pass: &VoxelPass,
        bindings: &VoxelBindings,
        buffers: &VoxelBuffers,
        transform: Matrix4<f32>,
        mode: RenderMode,
        viewport: [f32; 2],
        cursor: [f32; 2],
        face_count: u32,
    ) -> Option<FaceId> {
        let pick_transform = pixel_transform(viewport, cursor) * transform;
        let uniforms = FrameUniforms::new(pick_transform, mode);
        queue.write_buffer(&buffers.pick_uniform, 0, bytemuck::bytes_of(&uniforms));

        let scope = DeviceErrorScope::begin(device, "pick");
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Pick Encoder"),
        });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Pick Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::WHITE),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.record_faces(&mut rpass, bindings, buffers, FaceTarget::Pick, face_count);
        }
        let bytes_per_row = padded_bytes_per_row(self.size);
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.color_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.readback,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(self.size),
                },
            },
            wgpu::Extent3d {
                width: self.size,
                height: self.size,
                depth_or_array_layers: 1,
            },
        );
        queue.submit(Some(encoder.finish()));

        let bytes = read_mapped(device, &self.readback);
        scope.end();
        let bytes = bytes?;

        let centre = self.size / 2;
        let pixel = pixel_at(&bytes, bytes_per_row, centre, centre);
        let face = decode_pixel(pixel);
        log::debug!("Pick at {:?}: pixel {:?} -> {:?}", cursor, pixel, face);

        if self.dump_dir.is_some() {
            self.dump(&bytes, bytes_per_row);
        }
        face
    }

    fn dump(&mut self, bytes: &[u8], bytes_per_row: u32) {
        let Some(dir) = &self.dump_dir else { return };
        let pixels = strip_row_padding(bytes, self.size, self.size, bytes_per_row);
        let Some(image) = image::RgbaImage::from_raw(self.size, self.size, pixels) else {
            log::warn!("Pick target size does not match its readback");
            return;
        };
        if let Err(err) = std::fs::create_dir_all(dir) {
            log::warn!("Failed to create {}: {}", dir.display(), err);
            return;
        }
        let path = dir.join(format!("pick_{:04}.png", self.dumped));
        match image.save(&path) {
            Ok(()) => log::info!("Wrote {}", path.display()),
            Err(err) => log::warn!("Failed to write {}: {}", path.display(), err),
        }
        self.dumped += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SimConfig, PICK_TARGET_SIZE};
    use crate::device_errors::test_device;
    use crate::grid::gen_sphere;
    use crate::matrix_operations::{model_matrix, projection_matrix, view_matrix};
    use crate::physics_pass::PhysicsStepper;
    use crate::voxel_pass::FaceHighlight;
    use crate::voxel_storage::VoxelStorage;
    use cgmath::InnerSpace;

    #[test]
    fn test_decode_red_digit() {
        assert_eq!(decode_pixel([5, 0, 0, 255]), Some(FaceId(5)));
        assert_eq!(decode_pixel([0, 0, 0, 255]), Some(FaceId(0)));
    }

    #[test]
    fn test_white_is_no_hit() {
        assert_eq!(decode_pixel([255, 255, 255, 255]), None);
        assert_eq!(decode_pixel([255, 255, 255, 0]), None);
    }

    #[test]
    fn test_encode_uses_base_255() {
        assert_eq!(encode_face_id(FaceId(254)), [254, 0, 0, 255]);
        assert_eq!(encode_face_id(FaceId(255)), [0, 1, 0, 255]);
        assert_eq!(encode_face_id(FaceId(65025 + 2 * 255 + 7)), [7, 2, 1, 255]);
        for id in [0, 1, 300, 70_000, 16_000_000] {
            assert_eq!(decode_pixel(encode_face_id(FaceId(id))), Some(FaceId(id)));
        }
    }

    #[test]
    fn test_row_padding() {
        assert_eq!(padded_bytes_per_row(100), 512);
        assert_eq!(padded_bytes_per_row(64), 256);

        let (width, height, stride) = (2, 2, 12);
        let mut bytes = vec![0u8; (stride * height) as usize];
        bytes[stride as usize + 4..stride as usize + 8].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(pixel_at(&bytes, stride, 1, 1), [1, 2, 3, 4]);
        let tight = strip_row_padding(&bytes, width, height, stride);
        assert_eq!(tight.len(), 16);
        assert_eq!(&tight[12..16], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_drag_offset_follows_cursor() {
        let viewport = [800.0, 600.0];
        let transform = projection_matrix(800, 600) * view_matrix() * model_matrix(10.0);
        let cell = Point3::new(12.0, 9.0, 10.0);
        let cursor = [410.0, 290.0];
        let selection =
            ClickSelection::begin(CellId(3), FaceId(7), cell, transform, viewport, cursor)
                .expect("transform is invertible");

        let unmoved = selection
            .drag_target(transform, viewport, cursor)
            .expect("transform is invertible");
        assert!((unmoved - cell).magnitude() < 1e-2);

        let moved = selection
            .drag_target(transform, viewport, [500.0, 290.0])
            .expect("transform is invertible");
        assert!(moved.x > cell.x);
        assert!((moved.y - cell.y).abs() < 1e-2);
    }

    #[test]
    fn test_pick_resolves_front_face() {
        let Some((device, queue)) = test_device() else {
            eprintln!("No adapter available, skipping pick test");
            return;
        };
        let config = SimConfig {
            radius: 3.0,
            ..Default::default()
        };
        let grid = gen_sphere(config.radius);
        let storage = VoxelStorage::extract(&grid);
        let stepper = PhysicsStepper::new(&device, &storage, &config);
        let highlight = FaceHighlight::new(storage.face_count());
        let pass = VoxelPass::new(&device, wgpu::TextureFormat::Rgba8Unorm);
        let buffers = VoxelBuffers::new(&device, &storage, &highlight);
        let bindings = VoxelBindings::new(&device, &pass, &buffers, stepper.buffers());
        let mut picker = Picker::new(&device, PICK_TARGET_SIZE, None);

        let viewport = [800.0, 600.0];
        let transform =
            projection_matrix(800, 600) * view_matrix() * model_matrix(config.radius);
        let centre = grid.sizes()[0] / 2;
        let (front_id, front) = storage
            .cells()
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.position[0] == centre && cell.position[1] == centre)
            .max_by_key(|(_, cell)| cell.position[2])
            .expect("the centre column is filled");
        let face_centre = Point3::new(
            front.position[0] as f32 + 0.5,
            front.position[1] as f32 + 0.5,
            front.position[2] as f32 + 1.0,
        );
        let window = project(transform, face_centre, viewport);
        let cursor = [window.x, viewport[1] - window.y];

        let face_count = storage.face_count() as u32;
        for mode in [RenderMode::Cubes, RenderMode::Stretchy] {
            let picked = picker.pick(
                &device, &queue, &pass, &bindings, &buffers, transform, mode, viewport, cursor,
                face_count,
            );
            let face = picked.and_then(|id| storage.face(id)).expect("front face is hit");
            assert_eq!(face.cell, CellId(front_id as u32));
        }

        let missed = picker.pick(
            &device,
            &queue,
            &pass,
            &bindings,
            &buffers,
            transform,
            RenderMode::Cubes,
            viewport,
            [5.0, 5.0],
            face_count,
        );
        assert_eq!(missed, None);
    }
}
