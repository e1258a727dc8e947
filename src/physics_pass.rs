use wgpu::util::DeviceExt;

use crate::config::SimConfig;
use crate::device_errors::{create_or_exit, DeviceErrorScope};
use crate::physics::{initial_wire_state, PhysData3D, RubberBand, StateSlot, StepControl};
use crate::voxel_storage::VoxelStorage;

pub struct PhysicsPipelines {
    step_pipeline: wgpu::ComputePipeline,
}

const WORKGROUP_SIZE: u32 = 64;

const STATIC_GROUP_ID: u32 = 0;
const CELL_BUFFER_IDX: u32 = 0;
const PARAMS_BUFFER_IDX: u32 = 1;

const INPUT_GROUP_ID: u32 = 1;
const OUTPUT_GROUP_ID: u32 = 2;
const DATA_3D_IDX: u32 = 0;
const DATA_4D_IDX: u32 = 1;
const DEBUG_IDX: u32 = 2;

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl PhysicsPipelines {
    pub fn new(device: &wgpu::Device) -> Self {
        let static_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Physics: Static Bind Group Layout"),
                entries: &[
                storage_entry(CELL_BUFFER_IDX, true),
                wgpu::BindGroupLayoutEntry { // Sim params
                    binding: PARAMS_BUFFER_IDX,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });
        let input_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Physics: Input State Bind Group Layout"),
                entries: &[
                    storage_entry(DATA_3D_IDX, true),
                    storage_entry(DATA_4D_IDX, true),
                ],
            });
        let output_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Physics: Output State Bind Group Layout"),
                entries: &[
                    storage_entry(DATA_3D_IDX, false),
                    storage_entry(DATA_4D_IDX, false),
                    storage_entry(DEBUG_IDX, false),
                ],
            });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Physics Pipeline Layout"),
            bind_group_layouts: &[
                &static_bind_group_layout,
                &input_bind_group_layout,
                &output_bind_group_layout,
            ],
            push_constant_ranges: &[],
        });
        let step_pipeline = create_or_exit(device, "physics step pipeline", || {
            let shader = device.create_shader_module(wgpu::include_wgsl!("sim.wgsl"));
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Physics Step Pipeline"),
                layout: Some(&layout),
                module: &shader,
                entry_point: Some("step_cells"),
                compilation_options: Default::default(),
                cache: None,
            })
        });
        Self { step_pipeline }
    }
}

/// One full state set on the device.
pub struct StateBuffers {
    pub data_3d: wgpu::Buffer,
    pub data_4d: wgpu::Buffer,
}

impl StateBuffers {
    fn new(device: &wgpu::Device, storage: &VoxelStorage, label: &str) -> Self {
        let (data_3d, data_4d) = initial_wire_state(storage);
        // Zero-sized storage bindings are invalid; keep at least one record around.
        let data_3d = if data_3d.is_empty() { vec![Default::default()] } else { data_3d };
        let data_4d = if data_4d.is_empty() { vec![Default::default()] } else { data_4d };
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        Self {
            data_3d: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{} PhysData3D Buffer", label)),
                contents: bytemuck::cast_slice(&data_3d),
                usage,
            }),
            data_4d: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{} PhysData4D Buffer", label)),
                contents: bytemuck::cast_slice(&data_4d),
                usage,
            }),
        }
    }
}

pub struct PhysicsBuffers {
    pub cells: wgpu::Buffer,
    pub params: wgpu::Buffer,
    pub states: [StateBuffers; 2],
    /// Stretch magnitude per cell from the latest sub-step.
    pub debug: wgpu::Buffer,
}

impl PhysicsBuffers {
    pub fn new(
        device: &wgpu::Device,
        storage: &VoxelStorage,
        config: &SimConfig,
        rule: &RubberBand,
    ) -> Self {
        let mut cell_records = storage.cell_records();
        if cell_records.is_empty() {
            cell_records.push(Default::default());
        }
        let cells = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Cell Record Buffer"),
            contents: bytemuck::cast_slice(&cell_records),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let params = rule.params(config.time_step(), storage.cell_count() as u32);
        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Sim Params Buffer"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let debug = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Debug Feedback Buffer"),
            size: (storage.cell_count().max(1) * std::mem::size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self {
            cells,
            params,
            states: [
                StateBuffers::new(device, storage, "State A"),
                StateBuffers::new(device, storage, "State B"),
            ],
            debug,
        }
    }

    pub fn state(&self, slot: StateSlot) -> &StateBuffers {
        &self.states[slot.index()]
    }
}

/// Bind groups for reading from and writing to one state set.
pub struct StateBindings {
    as_input: wgpu::BindGroup,
    as_output: wgpu::BindGroup,
}

pub struct PhysicsBindings {
    static_bind_group: wgpu::BindGroup,
    states: [StateBindings; 2],
}

impl PhysicsBindings {
    pub fn new(
        device: &wgpu::Device,
        pipelines: &PhysicsPipelines,
        buffers: &PhysicsBuffers,
    ) -> Self {
        let static_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Physics: Static Bind Group"),
            layout: &pipelines.step_pipeline.get_bind_group_layout(STATIC_GROUP_ID),
            entries: &[
            wgpu::BindGroupEntry {
                binding: CELL_BUFFER_IDX,
                resource: buffers.cells.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: PARAMS_BUFFER_IDX,
                resource: buffers.params.as_entire_binding(),
            }],
        });
        let state_bindings = |slot: StateSlot| {
            let state = buffers.state(slot);
            let as_input = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Physics: Input State Bind Group"),
                layout: &pipelines.step_pipeline.get_bind_group_layout(INPUT_GROUP_ID),
                entries: &[
                wgpu::BindGroupEntry {
                    binding: DATA_3D_IDX,
                    resource: state.data_3d.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: DATA_4D_IDX,
                    resource: state.data_4d.as_entire_binding(),
                }],
            });
            let as_output = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Physics: Output State Bind Group"),
                layout: &pipelines.step_pipeline.get_bind_group_layout(OUTPUT_GROUP_ID),
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
                    resource: buffers.debug.as_entire_binding(),
                }],
            });
            StateBindings { as_input, as_output }
        };
        Self {
            static_bind_group,
            states: [state_bindings(StateSlot::A), state_bindings(StateSlot::B)],
        }
    }
}

impl<'a> PhysicsPipelines {
    /// One sub-step: read the `input` state set, write the other one.
    pub fn record<'pass>(
        &'a self,
        cpass: &mut wgpu::ComputePass<'pass>,
        bindings: &'a PhysicsBindings,
        input: StateSlot,
        cell_count: u32,
    ) where
        'a: 'pass,
    {
        cpass.set_pipeline(&self.step_pipeline);
        cpass.set_bind_group(STATIC_GROUP_ID, &bindings.static_bind_group, &[]);
        cpass.set_bind_group(INPUT_GROUP_ID, &bindings.states[input.index()].as_input, &[]);
        let output = &bindings.states[input.other().index()].as_output;
        cpass.set_bind_group(OUTPUT_GROUP_ID, output, &[]);
        cpass.dispatch_workgroups(cell_count.div_ceil(WORKGROUP_SIZE), 1, 1);
    }

    /// A into B, then B back into A.
    pub fn record_pair<'pass>(
        &'a self,
        cpass: &mut wgpu::ComputePass<'pass>,
        bindings: &'a PhysicsBindings,
        cell_count: u32,
    ) where
        'a: 'pass,
    {
        self.record(cpass, bindings, StateSlot::A, cell_count);
        self.record(cpass, bindings, StateSlot::B, cell_count);
    }
}

/// Owns the device-side simulation and advances it a frame at a time.
pub struct PhysicsStepper {
    pipelines: PhysicsPipelines,
    bindings: PhysicsBindings,
    buffers: PhysicsBuffers,
    cell_count: u32,
}

impl PhysicsStepper {
    pub fn new(device: &wgpu::Device, storage: &VoxelStorage, config: &SimConfig) -> Self {
        let pipelines = PhysicsPipelines::new(device);
        let buffers = PhysicsBuffers::new(device, storage, config, &RubberBand::default());
        let bindings = PhysicsBindings::new(device, &pipelines, &buffers);
        log::info!(
            "Physics: {} cells, dt {:.6}s, {} sub-steps per frame",
            storage.cell_count(),
            config.time_step(),
            config.steps_per_frame
        );
        Self {
            pipelines,
            bindings,
            buffers,
            cell_count: storage.cell_count() as u32,
        }
    }

    pub fn buffers(&self) -> &PhysicsBuffers {
        &self.buffers
    }

    /// The state set holding the latest snapshot. Sub-steps come in pairs, so this is
    /// always A between frames.
    pub fn current_state(&self) -> &StateBuffers {
        self.buffers.state(StateSlot::A)
    }

    /// Runs this frame's sub-step pairs. Returns the number of pairs issued.
    pub fn step_frame(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        control: &mut StepControl,
        config: &SimConfig,
    ) -> u32 {
        let pairs = control.pairs_this_frame(config);
        if pairs == 0 || self.cell_count == 0 {
            return 0;
        }

        let scope = DeviceErrorScope::begin(device, "physics step");
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Physics Encoder"),
        });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Physics Pass"),
                timestamp_writes: None,
            });
            for _ in 0..pairs {
                self.pipelines.record_pair(&mut cpass, &self.bindings, self.cell_count);
            }
        }
        queue.submit(Some(encoder.finish()));
        scope.end();

        log::trace!("Issued {} sub-step pairs", pairs);
        pairs
    }

    /// Copies one cell's position out of the current state set.
    pub fn read_cell_position(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        cell: u32,
    ) -> Option<[f32; 3]> {
        if cell >= self.cell_count {
            return None;
        }
        let stride = std::mem::size_of::<PhysData3D>() as u64;
        let size = std::mem::size_of::<[f32; 3]>() as u64;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cell Position Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let scope = DeviceErrorScope::begin(device, "cell position readback");
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Cell Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(
            &self.current_state().data_3d,
            cell as u64 * stride,
            &staging,
            0,
            size,
        );
        queue.submit(Some(encoder.finish()));

        let bytes = read_mapped(device, &staging);
        scope.end();
        let position: [f32; 3] = bytemuck::pod_read_unaligned(&bytes?);
        Some(position)
    }
}

/// Maps a MAP_READ buffer, blocking until the device is done with it.
pub fn read_mapped(device: &wgpu::Device, buffer: &wgpu::Buffer) -> Option<Vec<u8>> {
    let slice = buffer.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device.poll(wgpu::Maintain::Wait);
    match receiver.recv() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            log::error!("Failed to map readback buffer: {}", err);
            return None;
        }
        Err(err) => {
            log::error!("Readback callback was dropped: {}", err);
            return None;
        }
    }
    let bytes = slice.get_mapped_range().to_vec();
    buffer.unmap();
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use cgmath::InnerSpace;

    use super::*;
    use crate::device_errors::test_device;
    use crate::grid::gen_sphere;
    use crate::physics::{CellState, CpuSimulation, PhysData4D};

    fn read_states(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        state: &StateBuffers,
        cell_count: usize,
    ) -> Vec<CellState> {
        let size_3d = (cell_count * std::mem::size_of::<PhysData3D>()) as u64;
        let size_4d = (cell_count * std::mem::size_of::<PhysData4D>()) as u64;
        let staging = |size| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Test Staging Buffer"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let (staging_3d, staging_4d) = (staging(size_3d), staging(size_4d));
        let mut encoder = device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&state.data_3d, 0, &staging_3d, 0, size_3d);
        encoder.copy_buffer_to_buffer(&state.data_4d, 0, &staging_4d, 0, size_4d);
        queue.submit(Some(encoder.finish()));

        let bytes_3d = read_mapped(device, &staging_3d).expect("3d state maps");
        let bytes_4d = read_mapped(device, &staging_4d).expect("4d state maps");
        let data_3d: Vec<PhysData3D> = bytemuck::pod_collect_to_vec(&bytes_3d);
        let data_4d: Vec<PhysData4D> = bytemuck::pod_collect_to_vec(&bytes_4d);
        data_3d
            .iter()
            .zip(data_4d.iter())
            .map(|(a, b)| CellState::from_wire(a, b))
            .collect()
    }

    #[test]
    fn test_device_kernel_matches_host_rule() {
        let Some((device, queue)) = test_device() else {
            eprintln!("No adapter available, skipping device kernel comparison");
            return;
        };
        let config = SimConfig::default();
        let storage = VoxelStorage::extract(&gen_sphere(2.0));
        let stepper = PhysicsStepper::new(&device, &storage, &config);

        let mut host = CpuSimulation::new(&storage, RubberBand::default(), config.time_step());
        host.states_mut()[0].position.x += 0.3;
        host.states_mut()[1].velocity.y -= 0.5;
        let (data_3d, data_4d): (Vec<_>, Vec<_>) =
            host.states().iter().map(CellState::to_wire).unzip();
        let slot_a = stepper.current_state();
        queue.write_buffer(&slot_a.data_3d, 0, bytemuck::cast_slice(&data_3d));
        queue.write_buffer(&slot_a.data_4d, 0, bytemuck::cast_slice(&data_4d));

        let mut control = StepControl::new(false);
        let frames = 3;
        for _ in 0..frames {
            assert_eq!(
                stepper.step_frame(&device, &queue, &mut control, &config),
                config.pairs_per_frame()
            );
        }
        host.run_pairs(frames * config.pairs_per_frame());

        let device_states = read_states(&device, &queue, slot_a, storage.cell_count());
        let mut moved = false;
        for (gpu, cpu) in device_states.iter().zip(host.states()) {
            assert!((gpu.position - cpu.position).magnitude() < 1e-4);
            assert!((gpu.velocity - cpu.velocity).magnitude() < 1e-3);
            assert!((gpu.angular_velocity - cpu.angular_velocity).magnitude() < 1e-3);
            moved |= gpu.velocity.magnitude() > 1e-3;
        }
        assert!(moved);
    }

    #[test]
    fn test_cell_position_readback() {
        let Some((device, queue)) = test_device() else {
            eprintln!("No adapter available, skipping readback test");
            return;
        };
        let config = SimConfig::default();
        let storage = VoxelStorage::extract(&gen_sphere(2.0));
        let stepper = PhysicsStepper::new(&device, &storage, &config);

        let last = storage.cell_count() as u32 - 1;
        let expected = storage.cells()[last as usize].position.map(|c| c as f32);
        assert_eq!(stepper.read_cell_position(&device, &queue, last), Some(expected));
        assert_eq!(stepper.read_cell_position(&device, &queue, last + 1), None);
    }
}
