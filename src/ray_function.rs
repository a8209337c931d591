//! Ray functions turn the samples of a finished ray into a pixel color.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use log::{debug, warn};
#[cfg(feature = "mpi")]
use mpi::{collective::SystemOperation, traits::CommunicatorCollectives};

use crate::{
    constants::CHANNELS,
    error::Result,
    image::{Extents, ImagePatch},
    ray::RayRef,
};

/// An 8 bit RGB image with a depth buffer, as produced by the sampling stage.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelBuffer {
    width: usize,
    height: usize,
    rgb: Vec<u8>,
    zbuffer: Vec<f32>,
}

impl PixelBuffer {
    /// A black image with every depth at the far plane.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            rgb: vec![0; 3 * width * height],
            zbuffer: vec![1.0; width * height],
        }
    }

    /// Width of the image.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height of the image.
    pub fn height(&self) -> usize {
        self.height
    }

    /// The RGB bytes, row major.
    pub fn rgb(&self) -> &[u8] {
        &self.rgb
    }

    /// The depth buffer, row major. Depths are in `[0, 1]`.
    pub fn zbuffer_mut(&mut self) -> &mut [f32] {
        &mut self.zbuffer
    }

    /// Color of pixel `(w, h)`.
    pub fn color(&self, w: usize, h: usize) -> [u8; 3] {
        let offset = 3 * (h * self.width + w);
        [self.rgb[offset], self.rgb[offset + 1], self.rgb[offset + 2]]
    }

    /// Mutable color and depth of pixel `(w, h)`.
    pub fn pixel_mut(&mut self, w: usize, h: usize) -> (&mut [u8], f32) {
        let index = h * self.width + w;
        (&mut self.rgb[3 * index..3 * index + 3], self.zbuffer[index])
    }

    /// Cut out `extents` as a premultiplied RGBA patch for the compositor.
    ///
    /// The brightest channel of a pixel is used as its opacity, so black pixels
    /// are fully transparent.
    pub fn to_patch(
        &self,
        extents: Extents,
        depth: f32,
        origin_rank: usize,
        patch_index: usize,
    ) -> ImagePatch {
        let mut data = Vec::with_capacity(extents.num_pixels() * CHANNELS);
        for h in extents.ymin..extents.ymax {
            for w in extents.xmin..extents.xmax {
                let rgb = self.color(w as usize, h as usize);
                let [r, g, b] = rgb.map(|c| c as f32 / 255.0);
                data.extend_from_slice(&[r, g, b, r.max(g).max(b)]);
            }
        }
        ImagePatch::new(extents, depth, origin_rank, patch_index, data)
    }
}

/// Maps a finished ray to a pixel color.
pub trait RayFunction {
    /// Compute the color of the ray through pixel `pixel = (w, h)`.
    ///
    /// `depth` is the depth buffer value of the pixel in `[0, 1]`. The
    /// function may leave `rgb` untouched, for example when an opaque surface
    /// hides the ray.
    fn get_ray_value(&mut self, ray: RayRef<'_>, pixel: (usize, usize), rgb: &mut [u8], depth: f64);
}

/// Index of the sample at normalized depth `depth`.
pub fn index_of_depth(depth: f64, num_samples: usize) -> usize {
    if num_samples == 0 {
        return 0;
    }
    let index = (depth * num_samples as f64) as i64;
    index.clamp(0, num_samples as i64 - 1) as usize
}

/// Integrates the primary variable along each ray and shows the result in grey.
///
/// The raw integrals are kept per pixel so that they can be summed across
/// ranks and written to a file.
pub struct IntegrationRayFunction {
    primary_variable: usize,
    distance: f64,
    min: f64,
    max: f64,
    window: (usize, usize),
    vals: Vec<f64>,
    raw_values_written: bool,
    issued_warning: bool,
}

impl IntegrationRayFunction {
    /// Create a new integration ray function.
    ///
    /// `distance` is the physical length of every ray, `min` and `max` the
    /// range of the primary variable.
    pub fn new(primary_variable: usize, distance: f64, min: f64, max: f64) -> Self {
        Self {
            primary_variable,
            distance,
            min,
            max,
            window: (0, 0),
            vals: Vec::new(),
            raw_values_written: false,
            issued_warning: false,
        }
    }

    /// Set the range of the primary variable.
    pub fn set_range(&mut self, min: f64, max: f64) {
        self.min = min;
        self.max = max;
    }

    /// Size the buffer of raw integrals for a `width x height` window.
    ///
    /// The buffer is only reallocated when the size changes. It is zeroed in any case.
    pub fn set_window_size(&mut self, width: usize, height: usize) {
        if self.window != (width, height) {
            self.window = (width, height);
            self.vals = vec![0.0; width * height];
        } else {
            self.vals.fill(0.0);
        }
    }

    /// The raw integral per pixel, row major.
    pub fn values(&self) -> &[f64] {
        &self.vals
    }

    /// The window size the raw integrals refer to.
    pub fn window_size(&self) -> (usize, usize) {
        self.window
    }

    /// Riemann sum of the primary variable over the valid samples of `ray`.
    pub fn integrate(&self, ray: RayRef<'_>) -> f64 {
        let step = self.distance / ray.num_samples() as f64;
        ray.variable(self.primary_variable)
            .iter()
            .zip(ray.valid_mask())
            .filter(|&(_, &valid)| valid)
            .map(|(&value, _)| value * step)
            .sum()
    }

    /// Map a raw integral to a grey level.
    pub fn intensity(&self, integral: f64) -> u8 {
        let range = (self.max - self.min) * self.distance;
        if range <= 0.0 {
            return 0;
        }
        let normalized = num::clamp((integral - self.min * self.distance) / range, 0.0, 1.0);
        (normalized * 255.0) as u8
    }

    /// Sum the raw integrals of all ranks. Every rank receives the sum.
    #[cfg(feature = "mpi")]
    pub fn sum_across_ranks<C: CommunicatorCollectives>(&mut self, comm: &C) {
        let mut summed = vec![0.0; self.vals.len()];
        comm.all_reduce_into(&self.vals[..], &mut summed[..], SystemOperation::sum());
        self.vals = summed;
    }

    /// Write the raw integrals to `path`, once per session.
    ///
    /// The first line holds the width and height, followed by one value per
    /// pixel in row major order. Returns whether the file was written. Failure
    /// to write is reported as a warning and does not abort the render.
    pub fn output_raw_values<P: AsRef<Path>>(&mut self, path: P) -> bool {
        if self.raw_values_written {
            return false;
        }
        let path = path.as_ref();

        match self.write_raw_values(path) {
            Ok(()) => {
                self.raw_values_written = true;
                self.warn_once(&format!(
                    "Raw integration values were written to {}. In client/server mode this file \
                     is on the file system of the compute engine, not the viewer.",
                    path.display()
                ));
                true
            }
            Err(err) => {
                self.warn_once(&format!(
                    "Could not write raw integration values to {}: {}",
                    path.display(),
                    err
                ));
                false
            }
        }
    }

    fn write_raw_values(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{} {}", self.window.0, self.window.1)?;
        for value in &self.vals {
            writeln!(writer, "{}", value)?;
        }
        writer.flush()?;
        debug!("wrote {} raw values to {}", self.vals.len(), path.display());
        Ok(())
    }

    fn warn_once(&mut self, message: &str) {
        if !self.issued_warning {
            warn!("{}", message);
            self.issued_warning = true;
        }
    }
}

impl RayFunction for IntegrationRayFunction {
    fn get_ray_value(
        &mut self,
        ray: RayRef<'_>,
        pixel: (usize, usize),
        rgb: &mut [u8],
        depth: f64,
    ) {
        let Some(first_valid) = ray.first_valid_sample() else {
            return;
        };

        let integral = self.integrate(ray);

        let (w, h) = pixel;
        if w < self.window.0 && h < self.window.1 {
            self.vals[h * self.window.0 + w] = integral;
        }

        // An opaque surface in front of the first valid sample hides the integral.
        let max_sample = index_of_depth(depth, ray.num_samples());
        if max_sample >= first_valid {
            let grey = self.intensity(integral);
            rgb[..3].fill(grey);
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use assert_approx_eq::assert_approx_eq;

    use super::{index_of_depth, IntegrationRayFunction, PixelBuffer, RayFunction};
    use crate::{context::RenderContext, image::Extents, ray::Ray};

    fn ray_with(values: &[Option<f64>]) -> Ray {
        let context = RenderContext::new();
        let mut ray = Ray::new(values.len(), 1).unwrap();
        for (index, value) in values.iter().enumerate() {
            if let Some(value) = value {
                ray.set_sample(index, &[*value], &context).unwrap();
            }
        }
        ray
    }

    #[test]
    fn test_index_of_depth() {
        assert_eq!(index_of_depth(0.0, 10), 0);
        assert_eq!(index_of_depth(0.55, 10), 5);
        assert_eq!(index_of_depth(1.0, 10), 9);
        assert_eq!(index_of_depth(-0.5, 10), 0);
    }

    #[test]
    fn test_integration() {
        let ray = ray_with(&[None, Some(2.0), Some(4.0), None]);
        let mut function = IntegrationRayFunction::new(0, 2.0, 0.0, 4.0);
        function.set_window_size(2, 2);

        // Each sample covers 2.0 / 4 = 0.5 of the ray.
        assert_approx_eq!(function.integrate(ray.view()), 3.0);

        let mut rgb = [0_u8; 3];
        function.get_ray_value(ray.view(), (1, 0), &mut rgb, 1.0);
        // 3.0 / (4.0 * 2.0) of full intensity.
        assert_eq!(rgb, [95, 95, 95]);
        assert_approx_eq!(function.values()[1], 3.0);
    }

    #[test]
    fn test_opaque_surface_in_front() {
        let ray = ray_with(&[None, None, Some(1.0), Some(1.0)]);
        let mut function = IntegrationRayFunction::new(0, 1.0, 0.0, 1.0);
        function.set_window_size(1, 1);

        let mut rgb = [7_u8; 3];
        function.get_ray_value(ray.view(), (0, 0), &mut rgb, 0.25);
        assert_eq!(rgb, [7, 7, 7]);
        // The raw integral is still recorded.
        assert_approx_eq!(function.values()[0], 0.5);
    }

    #[test]
    fn test_window_resize_resets_values() {
        let ray = ray_with(&[Some(1.0)]);
        let mut function = IntegrationRayFunction::new(0, 1.0, 0.0, 1.0);
        function.set_window_size(1, 1);
        let mut rgb = [0_u8; 3];
        function.get_ray_value(ray.view(), (0, 0), &mut rgb, 1.0);
        assert_eq!(function.values(), &[1.0]);

        function.set_window_size(1, 1);
        assert_eq!(function.values(), &[0.0]);

        function.set_window_size(2, 3);
        assert_eq!(function.values().len(), 6);
    }

    #[test]
    fn test_output_raw_values_once() {
        let ray = ray_with(&[Some(1.0), Some(3.0)]);
        let mut function = IntegrationRayFunction::new(0, 2.0, 0.0, 1.0);
        function.set_window_size(2, 1);
        let mut rgb = [0_u8; 3];
        function.get_ray_value(ray.view(), (1, 0), &mut rgb, 1.0);

        let path = std::env::temp_dir().join(format!("raw_values_{}.txt", std::process::id()));
        assert!(function.output_raw_values(&path));
        assert!(!function.output_raw_values(&path));

        let content = fs::read_to_string(&path).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines, vec!["2 1", "0", "4"]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_pixel_buffer_to_patch() {
        let mut buffer = PixelBuffer::new(3, 2);
        let (rgb, depth) = buffer.pixel_mut(1, 1);
        rgb.copy_from_slice(&[255, 0, 51]);
        assert_eq!(depth, 1.0);

        let patch = buffer.to_patch(Extents::new(1, 3, 1, 2), 0.5, 2, 0);
        assert_eq!(&patch.data()[..4], &[1.0, 0.0, 0.2, 1.0]);
        assert_eq!(&patch.data()[4..], &[0.0; 4]);
    }
}
