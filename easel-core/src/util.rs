use anyhow::Result;
use candle_core::{Device, Tensor};
use image::DynamicImage;
use tracing::info;

use crate::{ComputeDevice, DeviceMap};

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match ComputeDevice::resolve(device_map) {
        ComputeDevice::Cuda(ordinal) => Ok(Device::new_cuda(ordinal)?),
        ComputeDevice::Metal(ordinal) => Ok(Device::new_metal(ordinal)?),
        ComputeDevice::Cpu => {
            if device_map != DeviceMap::ForceCpu {
                #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
                {
                    info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
                }
                #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
                {
                    info!("Running on CPU, to run on GPU, build with `--features cuda`");
                }
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Blocks until queued device work is done so dropped buffers are handed back to the allocator.
pub fn synchronize_device(device: &Device) {
    if let Err(err) = device.synchronize() {
        tracing::warn!("device synchronize failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn tensor_to_image_converts_chw_layout() -> Result<()> {
        // Red channel full, others empty.
        let data: Vec<u8> = [vec![255u8; 4], vec![0u8; 4], vec![0u8; 4]].concat();
        let tensor = Tensor::from_vec(data, (3, 2, 2), &Device::Cpu)?;
        let image = tensor_to_image(&tensor)?.to_rgb8();
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(1, 1).0, [255, 0, 0]);
        Ok(())
    }

    #[test]
    fn tensor_to_image_rejects_wrong_channel_count() -> Result<()> {
        let tensor = Tensor::zeros((4, 2, 2), DType::U8, &Device::Cpu)?;
        assert!(tensor_to_image(&tensor).is_err());
        Ok(())
    }
}
