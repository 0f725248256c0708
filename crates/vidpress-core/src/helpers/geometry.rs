// crates/vidpress-core/src/helpers/geometry.rs
//
// Output frame geometry for the re-encode path.
//
// Containers store frames in their native (sensor) orientation and carry a
// separate display transform (the ffmpeg display matrix, a CoreGraphics-style
// affine transform on Apple sources). The encoder keeps pixels in native
// orientation and copies the transform onto the output stream, so the
// resolver works in *display* space to pick the size cap and then maps the
// result back with `TargetGeometry::native_for`.

use serde::{Deserialize, Serialize};

/// Pixel dimensions as stored in the container (before any transform).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width:  u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Affine display transform `[a b; c d] + (tx, ty)`.
///
/// Same layout as `CGAffineTransform` and as the first two columns of the
/// ffmpeg display matrix. Rotations and mirroring may negate axes, so callers
/// always take the absolute value of an applied size.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisplayTransform {
    pub a:  f64,
    pub b:  f64,
    pub c:  f64,
    pub d:  f64,
    pub tx: f64,
    pub ty: f64,
}

impl Default for DisplayTransform {
    fn default() -> Self { Self::IDENTITY }
}

/// 16.16 fixed-point scale used by the a/b/c/d/tx/ty cells of the display matrix.
const FIXED_16_16: f64 = (1u32 << 16) as f64;
/// 2.30 fixed-point scale used by the u/v/w cells.
const FIXED_2_30:  f64 = (1u32 << 30) as f64;

impl DisplayTransform {
    pub const IDENTITY: Self = Self { a: 1.0, b: 0.0, c: 0.0, d: 1.0, tx: 0.0, ty: 0.0 };

    /// Clockwise rotation by a multiple of 90°. Other angles snap to the
    /// nearest quarter turn; containers only ever store those.
    pub fn rotation(degrees: i32) -> Self {
        let quarter = (((degrees as f64 / 90.0).round() as i32 % 4) + 4) % 4;
        let (a, b, c, d) = match quarter {
            0 => ( 1.0,  0.0,  0.0,  1.0),
            1 => ( 0.0,  1.0, -1.0,  0.0),
            2 => (-1.0,  0.0,  0.0, -1.0),
            _ => ( 0.0, -1.0,  1.0,  0.0),
        };
        Self { a, b, c, d, tx: 0.0, ty: 0.0 }
    }

    /// Decode the 3×3 row-major display matrix ffmpeg stores as nine native
    /// `i32`s (`[a b u; c d v; x y w]`).
    pub fn from_display_matrix(m: &[i32; 9]) -> Self {
        Self {
            a:  m[0] as f64 / FIXED_16_16,
            b:  m[1] as f64 / FIXED_16_16,
            c:  m[3] as f64 / FIXED_16_16,
            d:  m[4] as f64 / FIXED_16_16,
            tx: m[6] as f64 / FIXED_16_16,
            ty: m[7] as f64 / FIXED_16_16,
        }
    }

    /// Inverse of `from_display_matrix`, used to stamp the transform onto an
    /// output stream.
    pub fn to_display_matrix(&self) -> [i32; 9] {
        let fx = |v: f64| (v * FIXED_16_16).round() as i32;
        [
            fx(self.a),  fx(self.b),  0,
            fx(self.c),  fx(self.d),  0,
            fx(self.tx), fx(self.ty), FIXED_2_30 as i32,
        ]
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Clockwise rotation in whole degrees, normalised to 0/90/180/270.
    /// A mirrored transform reports the rotation left once its horizontal
    /// flip is undone, so a plain mirror is 0°.
    pub fn rotation_degrees(&self) -> i32 {
        let (a, b) = if self.is_mirrored() { (-self.a, -self.b) } else { (self.a, self.b) };
        let deg = b.atan2(a).to_degrees().round() as i32;
        ((deg % 360 + 360) % 360 + 45) / 90 * 90 % 360
    }

    /// Negative determinant: the transform includes a flip.
    pub fn is_mirrored(&self) -> bool {
        self.a * self.d - self.b * self.c < 0.0
    }

    /// True when the transform turns the frame on its side (90°/270°).
    pub fn swaps_axes(&self) -> bool {
        self.a.abs() < self.b.abs()
    }

    /// Apply the linear part to a size. Results may be negative.
    pub fn apply(&self, size: FrameSize) -> (f64, f64) {
        let (w, h) = (size.width as f64, size.height as f64);
        (self.a * w + self.c * h, self.b * w + self.d * h)
    }
}

/// Final encoder frame size in display orientation. Always even, always ≥ 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGeometry {
    pub width:  u32,
    pub height: u32,
}

impl TargetGeometry {
    pub fn longest_side(&self) -> u32 {
        self.width.max(self.height)
    }

    /// The frame size the encoder must be configured with when pixels stay in
    /// native orientation and `transform` is carried on the output stream.
    pub fn native_for(&self, transform: &DisplayTransform) -> FrameSize {
        if transform.swaps_axes() {
            FrameSize::new(self.height, self.width)
        } else {
            FrameSize::new(self.width, self.height)
        }
    }
}

/// Compute the target output size.
///
/// `max_dimension = None` means no cap (passthrough tier). Never upscales.
///
/// ```
/// use vidpress_core::helpers::geometry::{resolve, DisplayTransform, FrameSize};
/// let g = resolve(FrameSize::new(1920, 1080), &DisplayTransform::IDENTITY, Some(720));
/// assert_eq!((g.width, g.height), (720, 404));
/// ```
pub fn resolve(
    natural:       FrameSize,
    transform:     &DisplayTransform,
    max_dimension: Option<u32>,
) -> TargetGeometry {
    let (w, h) = transform.apply(natural);
    let (mut w, mut h) = (w.abs(), h.abs());

    if let Some(max_dim) = max_dimension {
        let max_dim = max_dim as f64;
        // Pin the long axis to the cap exactly; scaling it by `max / long`
        // can land a hair under an even number and lose two pixels.
        if w >= h && w > max_dim {
            h = h * max_dim / w;
            w = max_dim;
        } else if h > w && h > max_dim {
            w = w * max_dim / h;
            h = max_dim;
        }
    }

    TargetGeometry { width: floor_even(w), height: floor_even(h) }
}

/// `floor(v / 2) * 2`, clamped so a 1-px axis does not collapse to zero.
fn floor_even(v: f64) -> u32 {
    (((v / 2.0).floor() * 2.0) as u32).max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> DisplayTransform { DisplayTransform::IDENTITY }

    #[test]
    fn full_hd_to_low_tier() {
        let g = resolve(FrameSize::new(1920, 1080), &id(), Some(720));
        assert_eq!(g, TargetGeometry { width: 720, height: 404 });
    }

    #[test]
    fn four_by_three_to_medium_tier() {
        let g = resolve(FrameSize::new(4000, 3000), &id(), Some(1080));
        assert_eq!(g, TargetGeometry { width: 1080, height: 810 });
        let src_ratio = 4000.0 / 3000.0;
        let out_ratio = g.width as f64 / g.height as f64;
        assert!((src_ratio - out_ratio).abs() < 0.01);
    }

    #[test]
    fn portrait_rotation_swaps_axes() {
        let g = resolve(FrameSize::new(1920, 1080), &DisplayTransform::rotation(90), Some(720));
        assert_eq!(g, TargetGeometry { width: 404, height: 720 });
        assert_eq!(g.native_for(&DisplayTransform::rotation(90)), FrameSize::new(720, 404));
    }

    #[test]
    fn never_upscales() {
        for &(w, h) in &[(640, 360), (720, 720), (1000, 10), (2, 2), (1080, 1920)] {
            let g = resolve(FrameSize::new(w, h), &id(), Some(1920));
            assert_eq!(g.width,  (w / 2 * 2).max(2));
            assert_eq!(g.height, (h / 2 * 2).max(2));
        }
    }

    #[test]
    fn capped_longest_side_hits_max() {
        for max in [720_u32, 1080, 1920] {
            for &(w, h) in &[(3840, 2160), (2160, 3840), (4001, 3001), (5000, 5000), (9999, 123)] {
                let g = resolve(FrameSize::new(w, h), &id(), Some(max));
                assert!(g.longest_side() <= max);
                assert!(max - g.longest_side() <= 1, "{w}x{h} → {g:?} for max {max}");
            }
        }
    }

    #[test]
    fn always_even() {
        let transforms = [id(), DisplayTransform::rotation(90), DisplayTransform::rotation(180), DisplayTransform::rotation(270)];
        for t in &transforms {
            for w in (1..400).step_by(7) {
                for h in (1..400).step_by(11) {
                    for max in [None, Some(100), Some(333)] {
                        let g = resolve(FrameSize::new(w, h), t, max);
                        assert_eq!(g.width % 2, 0);
                        assert_eq!(g.height % 2, 0);
                        assert!(g.width >= 2 && g.height >= 2);
                    }
                }
            }
        }
    }

    #[test]
    fn extreme_aspect_keeps_short_side_positive() {
        let g = resolve(FrameSize::new(10_000, 3), &id(), Some(720));
        assert_eq!(g, TargetGeometry { width: 720, height: 2 });
    }

    #[test]
    fn unbounded_keeps_natural_size() {
        let g = resolve(FrameSize::new(7680, 4320), &id(), None);
        assert_eq!(g, TargetGeometry { width: 7680, height: 4320 });
    }

    #[test]
    fn mirrored_transform_uses_absolute_size() {
        let mirror = DisplayTransform { a: -1.0, d: 1.0, ..DisplayTransform::IDENTITY };
        let g = resolve(FrameSize::new(1280, 720), &mirror, None);
        assert_eq!(g, TargetGeometry { width: 1280, height: 720 });
    }

    #[test]
    fn plain_mirror_is_not_a_rotation() {
        let mirror = DisplayTransform { a: -1.0, d: 1.0, ..DisplayTransform::IDENTITY };
        assert!(mirror.is_mirrored());
        assert_eq!(mirror.rotation_degrees(), 0);
        // A vertical flip is a horizontal flip turned half way round.
        let vflip = DisplayTransform { a: 1.0, d: -1.0, ..DisplayTransform::IDENTITY };
        assert_eq!(vflip.rotation_degrees(), 180);
    }

    #[test]
    fn mirrored_quarter_turn_keeps_its_rotation() {
        // rotation(90) with the x axis flipped.
        let t = DisplayTransform { a: 0.0, b: -1.0, c: -1.0, d: 0.0, tx: 0.0, ty: 0.0 };
        assert!(t.is_mirrored());
        assert!(t.swaps_axes());
        assert_eq!(t.rotation_degrees(), 90);
        assert!(!DisplayTransform::rotation(270).is_mirrored());
    }

    #[test]
    fn display_matrix_roundtrip_for_quarter_turns() {
        for deg in [0, 90, 180, 270] {
            let t = DisplayTransform::rotation(deg);
            let back = DisplayTransform::from_display_matrix(&t.to_display_matrix());
            assert_eq!(back, t);
            assert_eq!(back.rotation_degrees(), deg);
        }
    }

    #[test]
    fn ffmpeg_portrait_matrix_is_recognised() {
        // What ffmpeg writes for a phone video recorded in portrait.
        let m = [0, 65536, 0, -65536, 0, 0, 0, 0, 1 << 30];
        let t = DisplayTransform::from_display_matrix(&m);
        assert!(t.swaps_axes());
        assert_eq!(t.rotation_degrees(), 90);
    }
}
