use cgmath::{Matrix4, Point3, SquareMatrix};
use winit::event::ElementState;
use winit::keyboard::{Key, NamedKey};

use crate::config::{SimConfig, PICK_TARGET_SIZE};
use crate::device_errors::DeviceErrorScope;
use crate::grid::gen_sphere;
use crate::matrix_operations::{model_matrix, projection_matrix, view_matrix};
use crate::physics::StepControl;
use crate::physics_pass::PhysicsStepper;
use crate::picking::{ClickSelection, Picker};
use crate::voxel_pass::{
    create_depth_view, FaceHighlight, FaceTarget, FrameUniforms, RenderMode, VoxelBindings,
    VoxelBuffers, VoxelPass,
};
use crate::voxel_storage::VoxelStorage;

const CLEAR_COLOR: wgpu::Color = wgpu::Color {
    r: 0.1,
    g: 0.1,
    b: 0.12,
    a: 1.0,
};

/// Window facts every input handler needs.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ViewportContext {
    pub width: u32,
    pub height: u32,
    /// Window pixels, origin at the top left.
    pub cursor: [f32; 2],
}

impl ViewportContext {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            cursor: [0.0, 0.0],
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
    }

    pub fn size(&self) -> [f32; 2] {
        [self.width as f32, self.height as f32]
    }

    pub fn frame_transform(&self, radius: f32) -> Matrix4<f32> {
        projection_matrix(self.width, self.height) * view_matrix() * model_matrix(radius)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyAction {
    TogglePause,
    SingleStep,
    ToggleRenderMode,
    ToggleVectors,
    Quit,
}

pub fn key_action(key: &Key) -> Option<KeyAction> {
    match key {
        Key::Named(NamedKey::Escape) => Some(KeyAction::Quit),
        Key::Character(c) => match c.as_str() {
            "p" | "P" => Some(KeyAction::TogglePause),
            "." => Some(KeyAction::SingleStep),
            "c" | "C" => Some(KeyAction::ToggleRenderMode),
            "v" | "V" => Some(KeyAction::ToggleVectors),
            _ => None,
        },
        _ => None,
    }
}

/// Only the initial press of a key acts; releases and auto-repeats are ignored.
pub fn key_press_action(state: ElementState, repeat: bool, key: &Key) -> Option<KeyAction> {
    if state != ElementState::Pressed || repeat {
        return None;
    }
    key_action(key)
}

/// Everything the keyboard can change.
#[derive(Clone, Debug)]
pub struct ViewControls {
    pub step: StepControl,
    pub mode: RenderMode,
    pub draw_vectors: bool,
}

impl ViewControls {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            step: StepControl::new(config.start_paused),
            mode: config.render_mode,
            draw_vectors: config.draw_vectors,
        }
    }

    pub fn apply(&mut self, action: KeyAction) {
        match action {
            KeyAction::TogglePause => {
                self.step.toggle_pause();
                log::info!("{}", if self.step.is_paused() { "Paused" } else { "Running" });
            }
            KeyAction::SingleStep => self.step.request_single_step(),
            KeyAction::ToggleRenderMode => {
                self.mode = self.mode.toggled();
                log::info!("Render mode: {:?}", self.mode);
            }
            KeyAction::ToggleVectors => self.draw_vectors = !self.draw_vectors,
            KeyAction::Quit => {}
        }
    }
}

/// Owns the voxel body and every device resource that draws, steps and picks it.
pub struct VoxelRenderer {
    config: SimConfig,
    storage: VoxelStorage,
    stepper: PhysicsStepper,
    voxel_pass: VoxelPass,
    voxel_buffers: VoxelBuffers,
    voxel_bindings: VoxelBindings,
    picker: Picker,
    depth_view: wgpu::TextureView,
    highlight: FaceHighlight,
    controls: ViewControls,
    selection: Option<ClickSelection>,
    /// Transform of the last rendered frame; picks are resolved against it.
    last_transform: Matrix4<f32>,
}

impl VoxelRenderer {
    pub fn new(
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        viewport: &ViewportContext,
        config: SimConfig,
    ) -> Self {
        let grid = gen_sphere(config.radius);
        let storage = VoxelStorage::extract(&grid);
        log::info!(
            "Grid {:?}: {} cells, {} corners, {} faces, {} surface cells",
            grid.sizes(),
            storage.cell_count(),
            storage.corner_count(),
            storage.face_count(),
            storage.surface_cells().count()
        );

        let stepper = PhysicsStepper::new(device, &storage, &config);
        let highlight = FaceHighlight::new(storage.face_count());
        let voxel_pass = VoxelPass::new(device, format);
        let voxel_buffers = VoxelBuffers::new(device, &storage, &highlight);
        let voxel_bindings =
            VoxelBindings::new(device, &voxel_pass, &voxel_buffers, stepper.buffers());
        let picker = Picker::new(device, PICK_TARGET_SIZE, config.dump_picks.clone());
        let depth_view = create_depth_view(device, viewport.width, viewport.height, "Depth Target");

        Self {
            controls: ViewControls::new(&config),
            config,
            storage,
            stepper,
            voxel_pass,
            voxel_buffers,
            voxel_bindings,
            picker,
            depth_view,
            highlight,
            selection: None,
            last_transform: Matrix4::identity(),
        }
    }

    pub fn resize(&mut self, device: &wgpu::Device, viewport: &ViewportContext) {
        self.depth_view =
            create_depth_view(device, viewport.width, viewport.height, "Depth Target");
    }

    pub fn apply_key(&mut self, action: KeyAction) {
        self.controls.apply(action);
    }

    /// Steps the simulation, then draws the current snapshot into `view`.
    pub fn frame(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        view: &wgpu::TextureView,
        viewport: &ViewportContext,
    ) {
        self.stepper
            .step_frame(device, queue, &mut self.controls.step, &self.config);

        let transform = viewport.frame_transform(self.config.radius);
        self.last_transform = transform;
        queue.write_buffer(
            &self.voxel_buffers.render_uniform,
            0,
            bytemuck::bytes_of(&FrameUniforms::new(transform, self.controls.mode)),
        );
        self.highlight.upload(queue, &self.voxel_buffers.highlight);

        let scope = DeviceErrorScope::begin(device, "render");
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Render Encoder"),
        });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Voxel Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(CLEAR_COLOR),
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
            self.voxel_pass.record_faces(
                &mut rpass,
                &self.voxel_bindings,
                &self.voxel_buffers,
                FaceTarget::Screen,
                self.storage.face_count() as u32,
            );
            if self.controls.draw_vectors {
                self.voxel_pass.record_vectors(
                    &mut rpass,
                    &self.voxel_bindings,
                    self.storage.cell_count() as u32,
                );
            }
        }
        queue.submit(Some(encoder.finish()));
        scope.end();
    }

    /// Left button down: resolve the cell under the cursor and grab it.
    pub fn press(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        viewport: &ViewportContext,
    ) {
        let face = self.picker.pick(
            device,
            queue,
            &self.voxel_pass,
            &self.voxel_bindings,
            &self.voxel_buffers,
            self.last_transform,
            self.controls.mode,
            viewport.size(),
            viewport.cursor,
            self.storage.face_count() as u32,
        );
        let Some(face_id) = face else {
            log::debug!("Nothing under the cursor");
            return;
        };
        let Some(face) = self.storage.face(face_id) else {
            log::warn!(
                "Pick decoded face {} but only {} exist",
                face_id.0,
                self.storage.face_count()
            );
            return;
        };
        let cell = face.cell;
        let Some(position) = self.stepper.read_cell_position(device, queue, cell.0) else {
            return;
        };

        self.selection = ClickSelection::begin(
            cell,
            face_id,
            Point3::from(position),
            self.last_transform,
            viewport.size(),
            viewport.cursor,
        );
        self.highlight.clear();
        self.highlight.highlight_cell(&self.storage, cell);
        log::info!("Picked cell {} through face {} at {:?}", cell.0, face_id.0, position);
    }

    pub fn release(&mut self) {
        if self.selection.take().is_some() {
            self.highlight.clear();
        }
    }

    pub fn cursor_moved(&self, viewport: &ViewportContext) {
        let Some(selection) = &self.selection else { return };
        // TODO: feed the target into the step kernel as a spring on the grabbed cell.
        let target = selection.drag_target(self.last_transform, viewport.size(), viewport.cursor);
        if let Some(target) = target {
            log::trace!("Drag cell {} towards {:?}", selection.cell.0, target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_bindings() {
        assert_eq!(key_action(&Key::Character("p".into())), Some(KeyAction::TogglePause));
        assert_eq!(key_action(&Key::Character("P".into())), Some(KeyAction::TogglePause));
        assert_eq!(key_action(&Key::Character(".".into())), Some(KeyAction::SingleStep));
        assert_eq!(key_action(&Key::Character("c".into())), Some(KeyAction::ToggleRenderMode));
        assert_eq!(key_action(&Key::Character("v".into())), Some(KeyAction::ToggleVectors));
        assert_eq!(key_action(&Key::Named(NamedKey::Escape)), Some(KeyAction::Quit));
        assert_eq!(key_action(&Key::Character("x".into())), None);
        assert_eq!(key_action(&Key::Named(NamedKey::Enter)), None);
    }

    #[test]
    fn test_held_keys_do_not_repeat() {
        let pause = Key::Character("p".into());
        assert_eq!(
            key_press_action(ElementState::Pressed, false, &pause),
            Some(KeyAction::TogglePause)
        );
        assert_eq!(key_press_action(ElementState::Pressed, true, &pause), None);
        assert_eq!(key_press_action(ElementState::Released, false, &pause), None);

        let step = Key::Character(".".into());
        let config = SimConfig::default();
        let mut controls = ViewControls::new(&config);
        for (repeat, expected_pairs) in [(false, 1), (true, 0), (true, 0), (true, 0)] {
            if let Some(action) = key_press_action(ElementState::Pressed, repeat, &step) {
                controls.apply(action);
            }
            assert_eq!(controls.step.pairs_this_frame(&config), expected_pairs);
        }
        assert!(controls.step.is_paused());
        for repeat in [false, true, true] {
            if let Some(action) = key_press_action(ElementState::Pressed, repeat, &pause) {
                controls.apply(action);
            }
        }
        assert!(!controls.step.is_paused());
    }

    #[test]
    fn test_controls_follow_keys() {
        let config = SimConfig::default();
        let mut controls = ViewControls::new(&config);
        assert!(controls.step.is_paused());
        assert_eq!(controls.mode, RenderMode::Stretchy);

        controls.apply(KeyAction::SingleStep);
        assert_eq!(controls.step.pairs_this_frame(&config), 1);
        assert_eq!(controls.step.pairs_this_frame(&config), 0);

        controls.apply(KeyAction::TogglePause);
        assert_eq!(controls.step.pairs_this_frame(&config), config.pairs_per_frame());

        controls.apply(KeyAction::ToggleRenderMode);
        assert_eq!(controls.mode, RenderMode::Cubes);
        controls.apply(KeyAction::ToggleVectors);
        assert!(controls.draw_vectors);
    }

    #[test]
    fn test_viewport_never_collapses() {
        let mut viewport = ViewportContext::new(0, 0);
        assert_eq!(viewport.size(), [1.0, 1.0]);
        viewport.resize(640, 0);
        assert_eq!((viewport.width, viewport.height), (640, 1));
    }
}
