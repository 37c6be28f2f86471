//! Preview geometry: mapping sensor buffers onto a rotated display surface.

use capture::{Orientation, Resolution};

/// 2-D affine transform, row-major:
///
/// ```text
/// | sx kx tx |
/// | ky sy ty |
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineMatrix {
    pub sx: f32,
    pub kx: f32,
    pub tx: f32,
    pub ky: f32,
    pub sy: f32,
    pub ty: f32,
}

/// Axis-aligned rectangle in view coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn from_size(size: Resolution) -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            right: size.width as f32,
            bottom: size.height as f32,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    pub fn offset(self, dx: f32, dy: f32) -> Self {
        Self {
            left: self.left + dx,
            top: self.top + dy,
            right: self.right + dx,
            bottom: self.bottom + dy,
        }
    }
}

impl AffineMatrix {
    pub const IDENTITY: Self = Self {
        sx: 1.0,
        kx: 0.0,
        tx: 0.0,
        ky: 0.0,
        sy: 1.0,
        ty: 0.0,
    };

    /// Stretch `src` to exactly cover `dst`.
    pub fn rect_to_rect(src: Rect, dst: Rect) -> Self {
        let sx = dst.width() / src.width();
        let sy = dst.height() / src.height();
        Self {
            sx,
            kx: 0.0,
            tx: dst.left - src.left * sx,
            ky: 0.0,
            sy,
            ty: dst.top - src.top * sy,
        }
    }

    /// Apply `self`, then `next`.
    pub fn then(self, next: Self) -> Self {
        Self {
            sx: next.sx * self.sx + next.kx * self.ky,
            kx: next.sx * self.kx + next.kx * self.sy,
            tx: next.sx * self.tx + next.kx * self.ty + next.tx,
            ky: next.ky * self.sx + next.sy * self.ky,
            sy: next.ky * self.kx + next.sy * self.sy,
            ty: next.ky * self.tx + next.sy * self.ty + next.ty,
        }
    }

    /// Follow with a uniform scale about `(cx, cy)`.
    pub fn post_scale(self, scale: f32, cx: f32, cy: f32) -> Self {
        self.then(Self {
            sx: scale,
            kx: 0.0,
            tx: cx - scale * cx,
            ky: 0.0,
            sy: scale,
            ty: cy - scale * cy,
        })
    }

    /// Follow with a rotation of `degrees` (clockwise on a y-down screen) about `(cx, cy)`.
    pub fn post_rotate(self, degrees: i32, cx: f32, cy: f32) -> Self {
        let (sin, cos) = sin_cos_degrees(degrees);
        self.then(Self {
            sx: cos,
            kx: -sin,
            tx: cx - cos * cx + sin * cy,
            ky: sin,
            sy: cos,
            ty: cy - sin * cx - cos * cy,
        })
    }

    pub fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.sx * x + self.kx * y + self.tx,
            self.ky * x + self.sy * y + self.ty,
        )
    }

    pub fn approx_eq(&self, other: &Self, epsilon: f32) -> bool {
        [
            (self.sx, other.sx),
            (self.kx, other.kx),
            (self.tx, other.tx),
            (self.ky, other.ky),
            (self.sy, other.sy),
            (self.ty, other.ty),
        ]
        .iter()
        .all(|(a, b)| (a - b).abs() <= epsilon)
    }
}

impl Default for AffineMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Exact for quarter turns so rotated previews stay pixel aligned.
fn sin_cos_degrees(degrees: i32) -> (f32, f32) {
    match degrees.rem_euclid(360) {
        0 => (0.0, 1.0),
        90 => (1.0, 0.0),
        180 => (0.0, -1.0),
        270 => (-1.0, 0.0),
        other => {
            let radians = (other as f32).to_radians();
            (radians.sin(), radians.cos())
        }
    }
}

/// Transform that shows a `buffer`-sized sensor stream in a `view` on a display
/// rotated by `rotation`, centre-cropped to fill the view without letterboxing.
///
/// Sensor buffers are landscape-relative, so the buffer rectangle is taken as
/// height x width before mapping.
pub fn compute_transform(
    view: Resolution,
    buffer: Resolution,
    rotation: Orientation,
) -> AffineMatrix {
    if view.is_empty() || buffer.is_empty() {
        return AffineMatrix::IDENTITY;
    }

    let view_rect = Rect::from_size(view);
    let (cx, cy) = view_rect.center();

    match rotation {
        Orientation::Deg90 | Orientation::Deg270 => {
            let buffer_rect = Rect::from_size(buffer.transposed());
            let (bx, by) = buffer_rect.center();
            let buffer_rect = buffer_rect.offset(cx - bx, cy - by);
            let scale = (view.height as f32 / buffer.height as f32)
                .max(view.width as f32 / buffer.width as f32);
            let degrees = 90 * (i32::from(rotation.quarter_turns()) - 2);
            AffineMatrix::rect_to_rect(view_rect, buffer_rect)
                .post_scale(scale, cx, cy)
                .post_rotate(degrees, cx, cy)
        }
        Orientation::Deg180 => AffineMatrix::IDENTITY.post_rotate(180, cx, cy),
        Orientation::Deg0 => AffineMatrix::IDENTITY,
    }
}

/// Largest size with the aspect ratio of `ratio` that fits inside `available`.
///
/// A zero-sized ratio leaves `available` unchanged.
pub fn fit_to_aspect(available: Resolution, ratio: Resolution) -> Resolution {
    if ratio.is_empty() {
        return available;
    }
    let (width, height) = (u64::from(available.width), u64::from(available.height));
    let (ratio_w, ratio_h) = (u64::from(ratio.width), u64::from(ratio.height));
    if width < height * ratio_w / ratio_h {
        Resolution::new(available.width, (width * ratio_h / ratio_w) as u32)
    } else {
        Resolution::new((height * ratio_w / ratio_h) as u32, available.height)
    }
}

/// Aspect ratio the preview surface should adopt for the current screen layout.
pub fn preview_aspect(preview: Resolution, landscape: bool) -> Resolution {
    if landscape {
        preview
    } else {
        preview.transposed()
    }
}
