// This is free and unencumbered software released into the public domain.

use crate::shared::CameraFacing;
use image::DynamicImage;

/// Snaps an arbitrary angle in degrees onto 0, 90, 180 or 270.
pub fn normalize_rotation(degrees: i32) -> u32 {
    let snapped = ((degrees as f64 / 90.0).round() as i64 * 90).rem_euclid(360);
    snapped as u32
}

/// Rotation to apply to camera output so it appears upright for the current device rotation.
///
/// Front cameras are mirrored, so their rotation runs the other way.
pub fn camera_rotation(native_orientation: u32, device_rotation: u32, facing: CameraFacing) -> u32 {
    let native = native_orientation % 360;
    let device = device_rotation % 360;
    match facing {
        CameraFacing::Front => (360 - (native + device) % 360) % 360,
        CameraFacing::Back => (native + 360 - device) % 360,
    }
}

/// Orientation hint handed to a recorder; the recorder applies its own mirroring.
pub fn recorder_orientation_hint(rotation: u32, facing: CameraFacing) -> u32 {
    match facing {
        CameraFacing::Front => (360 - rotation % 360) % 360,
        CameraFacing::Back => rotation % 360,
    }
}

/// Makes a raw preview image match what the viewfinder showed.
pub fn orient_preview_image(image: DynamicImage, rotation: u32, facing: CameraFacing) -> DynamicImage {
    let image = match facing {
        CameraFacing::Front => image.fliph(),
        CameraFacing::Back => image,
    };
    match rotation % 360 {
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        _ => image,
    }
}
