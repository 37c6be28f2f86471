//! Frame preparation ahead of classification.
//!
//! Centre-crop to a square, nearest-neighbour resize to the model input,
//! rotate upright, then scale bytes into `[0, 1]`.

use capture::{Orientation, Resolution};
use image::{
    RgbImage,
    imageops::{self, FilterType},
};

use crate::engine::InputTensor;

pub fn prepare_input(
    image: &RgbImage,
    input_size: Resolution,
    orientation: Orientation,
) -> InputTensor {
    let (width, height) = image.dimensions();
    let side = width.min(height);
    let cropped = imageops::crop_imm(image, (width - side) / 2, (height - side) / 2, side, side)
        .to_image();

    let resized = if (side, side) == (input_size.width, input_size.height) {
        cropped
    } else {
        imageops::resize(
            &cropped,
            input_size.width,
            input_size.height,
            FilterType::Nearest,
        )
    };

    let upright = rotate_counter_clockwise(resized, orientation);
    let (out_w, out_h) = upright.dimensions();

    InputTensor {
        data: upright
            .as_raw()
            .iter()
            .map(|&byte| f32::from(byte) / 255.0)
            .collect(),
        width: out_w,
        height: out_h,
        channels: 3,
    }
}

/// Undo the sensor rotation: one counter-clockwise quarter turn per 90°.
fn rotate_counter_clockwise(image: RgbImage, orientation: Orientation) -> RgbImage {
    match orientation {
        Orientation::Deg0 => image,
        Orientation::Deg90 => imageops::rotate270(&image),
        Orientation::Deg180 => imageops::rotate180(&image),
        Orientation::Deg270 => imageops::rotate90(&image),
    }
}
