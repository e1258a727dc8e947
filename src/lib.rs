pub mod config;
pub mod device_errors;
pub mod grid;
pub mod matrix_operations;
pub mod physics;
pub mod physics_pass;
pub mod picking;
pub mod renderer;
pub mod voxel_pass;
pub mod voxel_storage;

use web_time::Instant;
use winit::{
    event::{ElementState, Event, MouseButton, WindowEvent},
    event_loop::EventLoop,
    window::{Window, WindowBuilder},
};

use crate::config::SimConfig;
use crate::device_errors::install_uncaptured_handler;
use crate::renderer::{key_press_action, KeyAction, ViewportContext, VoxelRenderer};

const FRAME_LOG_INTERVAL: u32 = 300;

async fn arun(event_loop: EventLoop<()>, window: Window, sim_config: SimConfig) {
    let size = window.inner_size();
    let mut viewport = ViewportContext::new(size.width, size.height);

    let instance = wgpu::Instance::default();

    let surface = instance
        .create_surface(&window)
        .expect("Failed to create surface");
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            // Request an adapter which can render to our surface
            compatible_surface: Some(&surface),
        })
        .await
        .expect("Failed to find an appropriate adapter");
    log::info!("Using adapter {:?}", adapter.get_info());

    // Create the logical device and command queue
    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: None,
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
            },
            None,
        )
        .await
        .expect("Failed to create device");
    install_uncaptured_handler(&device);

    let mut config = surface
        .get_default_config(&adapter, viewport.width, viewport.height)
        .expect("Surface is not supported by the adapter");
    surface.configure(&device, &config);

    let mut renderer = VoxelRenderer::new(&device, config.format, &viewport, sim_config);

    let mut frame_count = 0;
    let mut frame_window_start = Instant::now();

    let window = &window;
    event_loop
        .run(move |event, target| {
            // Have the closure take ownership of the resources.
            // `event_loop.run` never returns, therefore we must do this to ensure
            // the resources are properly cleaned up.
            let _ = (&instance, &adapter);

            let Event::WindowEvent { event, .. } = event else {
                return;
            };
            match event {
                WindowEvent::Resized(new_size) => {
                    // Reconfigure the surface with the new size
                    viewport.resize(new_size.width, new_size.height);
                    config.width = viewport.width;
                    config.height = viewport.height;
                    surface.configure(&device, &config);
                    renderer.resize(&device, &viewport);
                    // On macos the window needs to be redrawn manually after resizing
                    window.request_redraw();
                }
                WindowEvent::RedrawRequested => {
                    let frame = match surface.get_current_texture() {
                        Ok(frame) => frame,
                        Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                            surface.configure(&device, &config);
                            window.request_redraw();
                            return;
                        }
                        Err(err) => {
                            log::error!("Failed to acquire next swap chain texture: {}", err);
                            window.request_redraw();
                            return;
                        }
                    };
                    let view = frame
                        .texture
                        .create_view(&wgpu::TextureViewDescriptor::default());
                    renderer.frame(&device, &queue, &view, &viewport);
                    frame.present();

                    frame_count += 1;
                    if frame_count == FRAME_LOG_INTERVAL {
                        let elapsed = frame_window_start.elapsed();
                        log::debug!(
                            "{:.2} ms per frame",
                            elapsed.as_secs_f64() * 1000.0 / frame_count as f64
                        );
                        frame_count = 0;
                        frame_window_start = Instant::now();
                    }

                    window.request_redraw();
                }
                WindowEvent::KeyboardInput { event, .. } => {
                    match key_press_action(event.state, event.repeat, &event.logical_key) {
                        Some(KeyAction::Quit) => target.exit(),
                        Some(action) => renderer.apply_key(action),
                        None => {}
                    }
                }
                WindowEvent::CursorMoved { position, .. } => {
                    viewport.cursor = [position.x as f32, position.y as f32];
                    renderer.cursor_moved(&viewport);
                }
                WindowEvent::MouseInput {
                    state,
                    button: MouseButton::Left,
                    ..
                } => match state {
                    ElementState::Pressed => renderer.press(&device, &queue, &viewport),
                    ElementState::Released => renderer.release(),
                },
                WindowEvent::CloseRequested => target.exit(),
                _ => {}
            };
        })
        .expect("Event loop terminated with an error");
}

/// Opens the window and runs the simulation until it is closed.
pub fn run(sim_config: SimConfig) {
    let event_loop = EventLoop::new().expect("Failed to create event loop");
    let window = WindowBuilder::new()
        .with_title("Stretchy Voxels")
        .build(&event_loop)
        .expect("Failed to create window");
    pollster::block_on(arun(event_loop, window, sim_config));
}
