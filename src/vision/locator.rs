//! Colour-segmentation object locator.
//!
//! A block is detected by thresholding the frame in HSV space (OpenCV scale:
//! H in `0..180`, S and V in `0..=255`), grouping the matching pixels into
//! 8-connected blobs and taking the centroid of the largest blob. Blobs of at
//! most `min_area` pixels are noise. The pixel centroid is mapped to
//! normalized robot coordinates with a homography fitted to the four
//! calibrated workspace corners.

use std::collections::BTreeMap;

use image::{GrayImage, Luma};
use tracing::debug;

use crate::config::{ColorRange, ColorSettings};
use crate::robot::Frame;

use super::{ObjectLocator, VisionError};

/// Robot-frame coordinates of the calibration corners, in order.
const ROBOT_CORNERS: [[f64; 2]; 4] = [[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];

/// HSV colour locator for the bottom camera.
#[derive(Debug, Clone)]
pub struct ColorLocator {
    ranges: BTreeMap<String, ColorRange>,
    min_area: u32,
    homography: [[f64; 3]; 3],
}

impl ColorLocator {
    /// Creates a locator.
    ///
    /// `pixel_corners` are the pixel positions of the robot workspace corners
    /// `(0,0)`, `(0,1)`, `(1,0)`, `(1,1)` in a rectified frame.
    ///
    /// # Errors
    ///
    /// Returns `VisionError::DegenerateCalibration` if three or more corners
    /// are collinear.
    pub fn new(colors: &ColorSettings, pixel_corners: [[f64; 2]; 4]) -> Result<Self, VisionError> {
        Ok(Self {
            ranges: colors.ranges.clone(),
            min_area: colors.min_area,
            homography: fit_homography(&pixel_corners, &ROBOT_CORNERS)?,
        })
    }

    /// Builder method to set the minimum detection area.
    pub fn with_min_area(mut self, min_area: u32) -> Self {
        self.min_area = min_area;
        self
    }

    /// Returns the pixel centroid of the `color` block, if one is visible.
    pub fn detect_pixel(&self, frame: &Frame, color: &str) -> Result<Option<[f64; 2]>, VisionError> {
        let range = self
            .ranges
            .get(color)
            .ok_or_else(|| VisionError::UnknownColor(color.to_string()))?;

        let mut mask = GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
            if in_range(rgb_to_hsv(frame.get_pixel(x, y).0), range) {
                MASK_SET
            } else {
                MASK_CLEAR
            }
        });

        let mut largest: Option<Blob> = None;
        for y in 0..mask.height() {
            for x in 0..mask.width() {
                if mask.get_pixel(x, y) != &MASK_SET {
                    continue;
                }
                let blob = flood_blob(&mut mask, x, y);
                if largest.map_or(true, |best| blob.area > best.area) {
                    largest = Some(blob);
                }
            }
        }

        match largest {
            Some(blob) if blob.area > u64::from(self.min_area) => {
                debug!(color, area = blob.area, "Object found");
                Ok(Some(blob.centroid()))
            }
            other => {
                debug!(
                    color,
                    area = other.map_or(0, |b| b.area),
                    "Object not found"
                );
                Ok(None)
            }
        }
    }

    /// Maps a pixel position to normalized robot coordinates.
    pub fn pixel_to_robot(&self, pixel: [f64; 2]) -> [f64; 2] {
        apply_homography(&self.homography, pixel)
    }
}

impl ObjectLocator for ColorLocator {
    fn locate(&self, frame: &Frame, color: &str) -> Result<Option<[f64; 2]>, VisionError> {
        Ok(self
            .detect_pixel(frame, color)?
            .map(|pixel| self.pixel_to_robot(pixel)))
    }
}

fn in_range(hsv: [u8; 3], range: &ColorRange) -> bool {
    let within = |lower: [u8; 3], upper: [u8; 3]| {
        (0..3).all(|c| hsv[c] >= lower[c] && hsv[c] <= upper[c])
    };
    if within(range.lower1, range.upper1) {
        return true;
    }
    match (range.lower2, range.upper2) {
        (Some(lower), Some(upper)) => within(lower, upper),
        _ => false,
    }
}

const MASK_SET: Luma<u8> = Luma([255]);
const MASK_CLEAR: Luma<u8> = Luma([0]);

/// One 8-connected group of in-range pixels.
#[derive(Debug, Clone, Copy)]
struct Blob {
    area: u64,
    sum_x: f64,
    sum_y: f64,
}

impl Blob {
    fn centroid(&self) -> [f64; 2] {
        let n = self.area as f64;
        [self.sum_x / n, self.sum_y / n]
    }
}

/// Clears the blob containing `(x, y)` from `mask` and returns its area and
/// pixel sums.
fn flood_blob(mask: &mut GrayImage, x: u32, y: u32) -> Blob {
    let (width, height) = mask.dimensions();
    let mut blob = Blob {
        area: 0,
        sum_x: 0.0,
        sum_y: 0.0,
    };
    let mut stack = vec![(x, y)];
    mask.put_pixel(x, y, MASK_CLEAR);

    while let Some((px, py)) = stack.pop() {
        blob.area += 1;
        blob.sum_x += f64::from(px);
        blob.sum_y += f64::from(py);

        for ny in py.saturating_sub(1)..=(py + 1).min(height - 1) {
            for nx in px.saturating_sub(1)..=(px + 1).min(width - 1) {
                if mask.get_pixel(nx, ny) == &MASK_SET {
                    mask.put_pixel(nx, ny, MASK_CLEAR);
                    stack.push((nx, ny));
                }
            }
        }
    }
    blob
}

/// Converts RGB to HSV on the OpenCV 8-bit scale.
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let r = f64::from(rgb[0]);
    let g = f64::from(rgb[1]);
    let b = f64::from(rgb[2]);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let s = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
    let h_deg = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta)
    } else if max == g {
        60.0 * ((b - r) / delta) + 120.0
    } else {
        60.0 * ((r - g) / delta) + 240.0
    };
    let h_deg = if h_deg < 0.0 { h_deg + 360.0 } else { h_deg };

    [
        ((h_deg / 2.0).round() as u16 % 180) as u8,
        s.round() as u8,
        max as u8,
    ]
}

/// Fits the homography mapping each `src` point onto the matching `dst` point.
fn fit_homography(src: &[[f64; 2]; 4], dst: &[[f64; 2]; 4]) -> Result<[[f64; 3]; 3], VisionError> {
    let mut a = [[0.0f64; 9]; 8];
    for i in 0..4 {
        let [x, y] = src[i];
        let [u, v] = dst[i];
        a[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, u];
        a[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, v];
    }

    // Gaussian elimination with partial pivoting on the augmented 8x9 system
    for col in 0..8 {
        let pivot = (col..8)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(VisionError::DegenerateCalibration(
                "calibration corners are collinear".to_string(),
            ));
        }
        a.swap(col, pivot);

        for row in 0..8 {
            if row == col {
                continue;
            }
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..9 {
                a[row][k] -= factor * a[col][k];
            }
        }
    }

    let h: Vec<f64> = (0..8).map(|i| a[i][8] / a[i][i]).collect();
    Ok([[h[0], h[1], h[2]], [h[3], h[4], h[5]], [h[6], h[7], 1.0]])
}

fn apply_homography(h: &[[f64; 3]; 3], point: [f64; 2]) -> [f64; 2] {
    let [x, y] = point;
    let w = h[2][0] * x + h[2][1] * y + h[2][2];
    [
        (h[0][0] * x + h[0][1] * y + h[0][2]) / w,
        (h[1][0] * x + h[1][1] * y + h[1][2]) / w,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const SQUARE: [[f64; 2]; 4] = [[0.0, 0.0], [0.0, 100.0], [100.0, 0.0], [100.0, 100.0]];

    fn locator() -> ColorLocator {
        ColorLocator::new(&ColorSettings::default(), SQUARE).expect("locator")
    }

    fn frame_with_block(x0: u32, y0: u32, size: u32, color: Rgb<u8>) -> Frame {
        let mut frame = Frame::from_pixel(100, 100, Rgb([0, 0, 0]));
        for y in y0..y0 + size {
            for x in x0..x0 + size {
                frame.put_pixel(x, y, color);
            }
        }
        frame
    }

    fn close(a: [f64; 2], b: [f64; 2]) -> bool {
        (a[0] - b[0]).abs() < 1e-6 && (a[1] - b[1]).abs() < 1e-6
    }

    #[test]
    fn test_hsv_conversion_matches_opencv_scale() {
        assert_eq!(rgb_to_hsv([255, 0, 0]), [0, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 255, 0]), [60, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 255]), [120, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 0]), [0, 0, 0]);
    }

    #[test]
    fn test_homography_maps_corners() {
        let loc = locator();
        for (pixel, robot) in SQUARE.iter().zip(ROBOT_CORNERS.iter()) {
            assert!(close(loc.pixel_to_robot(*pixel), *robot));
        }
        assert!(close(loc.pixel_to_robot([50.0, 50.0]), [0.5, 0.5]));
    }

    #[test]
    fn test_skewed_corners() {
        let corners = [[150.0, 69.0], [149.0, 441.0], [534.0, 67.0], [535.0, 435.0]];
        let loc = ColorLocator::new(&ColorSettings::default(), corners).expect("locator");
        for (pixel, robot) in corners.iter().zip(ROBOT_CORNERS.iter()) {
            assert!(close(loc.pixel_to_robot(*pixel), *robot));
        }
    }

    #[test]
    fn test_collinear_corners_rejected() {
        let corners = [[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0]];
        let err = ColorLocator::new(&ColorSettings::default(), corners).expect_err("degenerate");
        assert!(matches!(err, VisionError::DegenerateCalibration(_)));
    }

    #[test]
    fn test_locate_green_block() {
        let frame = frame_with_block(60, 10, 20, Rgb([0, 255, 0]));
        let position = locator().locate(&frame, "green").expect("locate");
        assert!(close(position.expect("visible"), [0.695, 0.195]));
    }

    #[test]
    fn test_red_uses_second_hue_range() {
        // hue near 178 on the OpenCV scale
        let frame = frame_with_block(0, 0, 20, Rgb([255, 0, 10]));
        assert!(locator().locate(&frame, "red").expect("locate").is_some());
    }

    #[test]
    fn test_small_blob_is_noise() {
        let frame = frame_with_block(10, 10, 10, Rgb([0, 255, 0]));
        assert_eq!(locator().locate(&frame, "green").expect("locate"), None);
        assert!(locator()
            .with_min_area(50)
            .locate(&frame, "green")
            .expect("locate")
            .is_some());
    }

    #[test]
    fn test_largest_blob_wins_over_smaller_one() {
        let mut frame = frame_with_block(0, 0, 25, Rgb([0, 255, 0]));
        for y in 80..98 {
            for x in 80..98 {
                frame.put_pixel(x, y, Rgb([0, 255, 0]));
            }
        }

        let position = locator().locate(&frame, "green").expect("locate");
        assert!(close(position.expect("visible"), [0.12, 0.12]));
    }

    #[test]
    fn test_scattered_pixels_do_not_add_up_to_a_block() {
        // 400 isolated pixels: above min_area in total, but no blob is
        let mut frame = Frame::from_pixel(100, 100, Rgb([0, 0, 0]));
        for y in (0..40).map(|i| i * 2) {
            for x in (0..10).map(|i| i * 2) {
                frame.put_pixel(x, y, Rgb([0, 255, 0]));
            }
        }

        assert_eq!(locator().locate(&frame, "green").expect("locate"), None);
    }

    #[test]
    fn test_hue_wraps_below_180() {
        // 359.8 degrees rounds to 180 before wrapping
        assert_eq!(rgb_to_hsv([255, 0, 1])[0], 0);
        assert!(rgb_to_hsv([255, 0, 10])[0] < 180);
    }

    #[test]
    fn test_unknown_color() {
        let frame = Frame::new(4, 4);
        let err = locator().locate(&frame, "purple").expect_err("unknown");
        assert!(matches!(err, VisionError::UnknownColor(_)));
    }

    #[test]
    fn test_all_visible() {
        let mut frame = frame_with_block(60, 10, 20, Rgb([0, 255, 0]));
        let colors = vec!["green".to_string(), "blue".to_string()];
        assert!(!locator().all_visible(&frame, &colors).expect("check"));

        for y in 60..80 {
            for x in 10..30 {
                frame.put_pixel(x, y, Rgb([0, 0, 255]));
            }
        }
        assert!(locator().all_visible(&frame, &colors).expect("check"));
    }
}
