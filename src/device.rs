use candle_core::Device;
use tracing::{info, warn};

/// Pick the device to run the model on from the requested GPU count
///
/// `0` selects the CPU. Any positive count selects the first CUDA device,
/// falling back to the CPU when no CUDA device is usable.
pub fn select_device(gpus: usize) -> Device {
    if gpus == 0 {
        return Device::Cpu;
    }
    if gpus > 1 {
        warn!("{gpus} GPUs requested; inference runs on a single device");
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            info!("Running on cuda:0");
            device
        }
        Ok(device) => {
            warn!("No CUDA device available, running on CPU");
            device
        }
        Err(e) => {
            warn!("Failed to initialize CUDA device ({e}), running on CPU");
            Device::Cpu
        }
    }
}

/// Display name for a device
pub fn device_name(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}
