//! Face alignment via a 4-DOF similarity transform.
//!
//! Detected faces are warped onto the five InsightFace reference landmarks
//! so the recognizer always sees a canonical 112×112 crop.

use crate::frame::Frame;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// `dst = [[a, -b], [b, a]] · src + [tx, ty]`
#[derive(Debug, Clone, Copy, PartialEq)]
struct SimilarityTransform {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl SimilarityTransform {
    /// Least-squares fit of `src` onto `dst`.
    ///
    /// Returns `None` when the landmarks are collinear or coincident and no
    /// unique transform exists.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        // Normal equations AᵀA·p = Aᵀb for p = [a, b, tx, ty], two rows per point:
        //   [sx, -sy, 1, 0]·p = dx
        //   [sy,  sx, 0, 1]·p = dy
        let mut m = [[0.0f32; 5]; 4];
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
            for (r, rhs) in rows {
                for j in 0..4 {
                    for k in 0..4 {
                        m[j][k] += r[j] * r[k];
                    }
                    m[j][4] += r[j] * rhs;
                }
            }
        }

        let [a, b, tx, ty] = solve_augmented(m)?;
        Some(Self { a, b, tx, ty })
    }

    /// Map an output pixel back to its source position.
    fn inverse_map(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let dx = x - self.tx;
        let dy = y - self.ty;
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Gaussian elimination with partial pivoting on a 4×5 augmented matrix.
#[allow(clippy::needless_range_loop)]
fn solve_augmented(mut m: [[f32; 5]; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-6 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][4] - tail) / m[i][i];
    }
    Some(x)
}

/// Sample a grayscale frame at a sub-pixel position; outside pixels read as 0.
fn sample_bilinear(frame: &Frame, sx: f32, sy: f32) -> f32 {
    let w = frame.width as i32;
    let h = frame.height as i32;
    let x0 = sx.floor() as i32;
    let y0 = sy.floor() as i32;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let px = |x: i32, y: i32| -> f32 {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            frame.data[(y * w + x) as usize] as f32
        } else {
            0.0
        }
    };

    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1) * (1.0 - fx) * fy
        + px(x0 + 1, y0 + 1) * fx * fy
}

/// Warp the face described by `landmarks` into a canonical 112×112 crop.
///
/// Returns `None` if the landmarks do not determine a transform.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5]) -> Option<Vec<u8>> {
    let transform = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS_112)?;

    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
    for oy in 0..ALIGNED_SIZE {
        for ox in 0..ALIGNED_SIZE {
            let (sx, sy) = transform.inverse_map(ox as f32, oy as f32)?;
            out[oy * ALIGNED_SIZE + ox] = sample_bilinear(frame, sx, sy).round().clamp(0.0, 255.0) as u8;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let t = SimilarityTransform::estimate(&pts, &pts).unwrap();
        assert!((t.a - 1.0).abs() < 1e-3, "a = {}", t.a);
        assert!(t.b.abs() < 1e-3, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-2, "tx = {}", t.tx);
        assert!(t.ty.abs() < 1e-2, "ty = {}", t.ty);
    }

    #[test]
    fn test_scaled_transform() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let t = SimilarityTransform::estimate(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 0.5).abs() < 0.01, "a = {}, expected ~0.5", t.a);
    }

    #[test]
    fn test_coincident_landmarks_have_no_transform() {
        let src = [(10.0, 10.0); 5];
        assert!(SimilarityTransform::estimate(&src, &REFERENCE_LANDMARKS_112).is_none());
        let frame = Frame::new(vec![0u8; 64 * 64], 64, 64).unwrap();
        assert!(align_face(&frame, &src).is_none());
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = Frame::new(vec![128u8; 640 * 480], 640, 480).unwrap();
        let aligned = align_face(&frame, &REFERENCE_LANDMARKS_112).unwrap();
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE);
    }

    #[test]
    fn test_left_eye_lands_on_reference() {
        let (w, h) = (200usize, 200usize);
        let mut data = vec![0u8; w * h];
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        // 5x5 bright patch survives bilinear sampling.
        for y in 58..63 {
            for x in 78..83 {
                data[y * w + x] = 255;
            }
        }
        let frame = Frame::new(data, w as u32, h as u32).unwrap();
        let aligned = align_face(&frame, &src).unwrap();

        let rx = REFERENCE_LANDMARKS_112[0].0.round() as usize;
        let ry = REFERENCE_LANDMARKS_112[0].1.round() as usize;
        let brightest = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned[y * ALIGNED_SIZE + x])
            .max()
            .unwrap_or(0);
        assert!(brightest > 100, "expected bright patch near ({rx}, {ry}), max={brightest}");
    }
}
