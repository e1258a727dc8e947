use std::panic::Location;

/// Captures device errors raised by the commands issued between `begin` and `end`
/// and reports them against the call site that opened the scope. Errors are logged,
/// never propagated.
pub struct DeviceErrorScope<'a> {
    device: &'a wgpu::Device,
    label: &'static str,
    location: &'static Location<'static>,
}

impl<'a> DeviceErrorScope<'a> {
    #[track_caller]
    pub fn begin(device: &'a wgpu::Device, label: &'static str) -> Self {
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        Self {
            device,
            label,
            location: Location::caller(),
        }
    }

    /// Pops both scopes and returns how many errors were logged.
    pub fn end(self) -> usize {
        let mut errors = 0;
        // Innermost first.
        for kind in ["validation", "out of memory"] {
            if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
                log::error!("{} ({}): {} error: {}", self.label, self.location, kind, error);
                errors += 1;
            }
        }
        errors
    }
}

/// Anything outside an explicit scope is logged instead of aborting the process.
pub fn install_uncaptured_handler(device: &wgpu::Device) {
    device.on_uncaptured_error(Box::new(|error: wgpu::Error| {
        log::error!("Uncaptured device error: {}", error);
    }));
}

/// Startup creation of shaders and pipelines. A validation failure here means the
/// kernel source or layout is wrong, so log it and terminate.
#[track_caller]
pub fn create_or_exit<T>(device: &wgpu::Device, what: &str, create: impl FnOnce() -> T) -> T {
    let location = Location::caller();
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let created = create();
    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        log::error!("Failed to create {} ({}): {}", what, location, error);
        std::process::exit(1);
    }
    created
}

/// Any adapter will do, software rasterisers included. `None` when the machine has none.
#[cfg(test)]
pub fn test_device() -> Option<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::default();
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::default(),
        force_fallback_adapter: false,
        compatible_surface: None,
    }))?;
    let (device, queue) =
        pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default(), None))
            .ok()?;
    install_uncaptured_handler(&device);
    Some((device, queue))
}
