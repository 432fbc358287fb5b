//! Fisheye undistortion of the bottom camera.
//!
//! Uses the equidistant fisheye model with four distortion coefficients and
//! keeps the original camera matrix as the rectified one. Each output pixel
//! is sampled bilinearly from the raw frame; samples outside the raw frame are
//! black. The rectified frame is then flipped vertically and rotated 90°
//! clockwise so that it is aligned with the robot workspace.

use std::sync::{Arc, Mutex, PoisonError};

use image::{imageops, Rgb};

use crate::robot::Frame;

use super::Undistorter;

/// Per-resolution source coordinates for every output pixel.
struct RemapTable {
    width: u32,
    height: u32,
    coords: Vec<(f64, f64)>,
}

/// Fisheye undistorter for one calibrated camera.
pub struct FisheyeUndistorter {
    matrix: [[f64; 3]; 3],
    distortion: [f64; 4],
    table: Mutex<Option<Arc<RemapTable>>>,
}

impl FisheyeUndistorter {
    pub fn new(matrix: [[f64; 3]; 3], distortion: [f64; 4]) -> Self {
        Self {
            matrix,
            distortion,
            table: Mutex::new(None),
        }
    }

    /// Maps an undistorted pixel position to its position in the raw frame.
    pub fn distort_point(&self, u: f64, v: f64) -> (f64, f64) {
        let (fx, fy) = (self.matrix[0][0], self.matrix[1][1]);
        let (cx, cy) = (self.matrix[0][2], self.matrix[1][2]);
        let [k1, k2, k3, k4] = self.distortion;

        let x = (u - cx) / fx;
        let y = (v - cy) / fy;
        let r = (x * x + y * y).sqrt();
        if r < 1e-8 {
            return (u, v);
        }

        let theta = r.atan();
        let t2 = theta * theta;
        let theta_d = theta * (1.0 + k1 * t2 + k2 * t2 * t2 + k3 * t2.powi(3) + k4 * t2.powi(4));
        let scale = theta_d / r;

        (fx * x * scale + cx, fy * y * scale + cy)
    }

    fn table_for(&self, width: u32, height: u32) -> Arc<RemapTable> {
        let mut cached = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = cached.as_ref() {
            if table.width == width && table.height == height {
                return Arc::clone(table);
            }
        }

        let mut coords = Vec::with_capacity((width as usize) * (height as usize));
        for v in 0..height {
            for u in 0..width {
                coords.push(self.distort_point(f64::from(u), f64::from(v)));
            }
        }
        let table = Arc::new(RemapTable {
            width,
            height,
            coords,
        });
        *cached = Some(Arc::clone(&table));
        table
    }

    fn rectify(&self, frame: &Frame) -> Frame {
        let (width, height) = frame.dimensions();
        let table = self.table_for(width, height);
        let mut out = Frame::new(width, height);
        for (i, pixel) in out.pixels_mut().enumerate() {
            let (sx, sy) = table.coords[i];
            *pixel = sample_bilinear(frame, sx, sy);
        }
        out
    }
}

impl Undistorter for FisheyeUndistorter {
    fn undistort(&self, frame: &Frame) -> Frame {
        let rectified = self.rectify(frame);
        imageops::rotate90(&imageops::flip_vertical(&rectified))
    }
}

/// Pass-through undistorter for cameras without calibration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUndistortion;

impl Undistorter for NoUndistortion {
    fn undistort(&self, frame: &Frame) -> Frame {
        frame.clone()
    }
}

fn sample_bilinear(frame: &Frame, x: f64, y: f64) -> Rgb<u8> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Rgb([0, 0, 0]);
    }
    let max_x = f64::from(width - 1);
    let max_y = f64::from(height - 1);
    if !(0.0..=max_x).contains(&x) || !(0.0..=max_y).contains(&y) {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - f64::from(x0);
    let fy = y - f64::from(y0);

    let p00 = frame.get_pixel(x0, y0);
    let p10 = frame.get_pixel(x1, y0);
    let p01 = frame.get_pixel(x0, y1);
    let p11 = frame.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for (c, value) in out.iter_mut().enumerate() {
        let top = f64::from(p00[c]) * (1.0 - fx) + f64::from(p10[c]) * fx;
        let bottom = f64::from(p01[c]) * (1.0 - fx) + f64::from(p11[c]) * fx;
        *value = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}
