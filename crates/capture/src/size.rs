//! Output resolution selection.

use crate::types::{CaptureError, Resolution};

/// Pick the sensor output that best serves a `target_width` x `target_height` consumer.
///
/// An exact match wins outright. Otherwise the smallest candidate whose sides both
/// reach `min(target_width, target_height)` is chosen, falling back to the largest
/// candidate when none is big enough. Ties keep the first candidate in input order.
pub fn select_optimal(
    candidates: &[Resolution],
    target_width: u32,
    target_height: u32,
) -> Result<Resolution, CaptureError> {
    let desired = Resolution::new(target_width, target_height);
    let min_side = target_width.min(target_height);

    let mut smallest_big_enough: Option<Resolution> = None;
    let mut largest_too_small: Option<Resolution> = None;

    for &option in candidates {
        if option == desired {
            return Ok(option);
        }

        if option.width >= min_side && option.height >= min_side {
            if smallest_big_enough.is_none_or(|best| option.area() < best.area()) {
                smallest_big_enough = Some(option);
            }
        } else if largest_too_small.is_none_or(|best| option.area() > best.area()) {
            largest_too_small = Some(option);
        }
    }

    smallest_big_enough
        .or(largest_too_small)
        .ok_or(CaptureError::NoCompatibleResolution)
}
