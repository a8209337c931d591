//! Image tiles and the pixel operations used by the compositor.
//!
//! All pixels are RGBA with colors premultiplied by alpha. Buffers are row
//! major over their extents.

use std::cmp::Ordering;

use crate::constants::CHANNELS;

/// Pixel extents `xmin..xmax` times `ymin..ymax` inside the full image.
///
/// Both ranges are half open.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extents {
    /// First column.
    pub xmin: i32,
    /// One past the last column.
    pub xmax: i32,
    /// First scanline.
    pub ymin: i32,
    /// One past the last scanline.
    pub ymax: i32,
}

impl Extents {
    /// Create new extents.
    pub fn new(xmin: i32, xmax: i32, ymin: i32, ymax: i32) -> Self {
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    /// Extents of a full `width x height` image.
    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, width as i32, 0, height as i32)
    }

    /// Create from `[xmin, xmax, ymin, ymax]`.
    pub fn from_array(arr: [i32; 4]) -> Self {
        Self::new(arr[0], arr[1], arr[2], arr[3])
    }

    /// Return `[xmin, xmax, ymin, ymax]`.
    pub fn to_array(&self) -> [i32; 4] {
        [self.xmin, self.xmax, self.ymin, self.ymax]
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        (self.xmax - self.xmin).max(0) as usize
    }

    /// Number of scanlines.
    pub fn height(&self) -> usize {
        (self.ymax - self.ymin).max(0) as usize
    }

    /// Number of pixels.
    pub fn num_pixels(&self) -> usize {
        self.width() * self.height()
    }

    /// Return true if the extents contain no pixel.
    pub fn is_empty(&self) -> bool {
        self.num_pixels() == 0
    }

    /// The common part of two extents.
    pub fn intersect(&self, other: &Extents) -> Option<Extents> {
        let result = Extents::new(
            self.xmin.max(other.xmin),
            self.xmax.min(other.xmax),
            self.ymin.max(other.ymin),
            self.ymax.min(other.ymax),
        );
        if result.is_empty() {
            None
        } else {
            Some(result)
        }
    }

    /// Offset of pixel `(x, y)` in a buffer laid out over these extents.
    pub fn pixel_offset(&self, x: i32, y: i32) -> usize {
        debug_assert!(x >= self.xmin && x < self.xmax && y >= self.ymin && y < self.ymax);
        (y - self.ymin) as usize * self.width() + (x - self.xmin) as usize
    }
}

/// Visit every pixel shared by `dst` and `src` as a pair of buffer offsets.
fn for_each_overlap(dst: &Extents, src: &Extents, mut f: impl FnMut(usize, usize)) {
    let Some(overlap) = dst.intersect(src) else {
        return;
    };

    let row_len = overlap.width();
    for y in overlap.ymin..overlap.ymax {
        let dst_row = dst.pixel_offset(overlap.xmin, y);
        let src_row = src.pixel_offset(overlap.xmin, y);
        for x in 0..row_len {
            f(dst_row + x, src_row + x);
        }
    }
}

/// The contribution of one rank to the final image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImagePatch {
    extents: Extents,
    depth: f32,
    origin_rank: usize,
    patch_index: usize,
    data: Vec<f32>,
}

impl ImagePatch {
    /// Create a new patch.
    ///
    /// `data` holds `CHANNELS` premultiplied values per pixel of `extents`.
    /// `depth` orders the patch against others, smaller is closer to the viewer.
    pub fn new(
        extents: Extents,
        depth: f32,
        origin_rank: usize,
        patch_index: usize,
        data: Vec<f32>,
    ) -> Self {
        assert_eq!(data.len(), extents.num_pixels() * CHANNELS);
        Self {
            extents,
            depth,
            origin_rank,
            patch_index,
            data,
        }
    }

    /// Pixel extents of the patch in the full image.
    pub fn extents(&self) -> &Extents {
        &self.extents
    }

    /// Depth of the patch.
    pub fn depth(&self) -> f32 {
        self.depth
    }

    /// Rank that rendered the patch.
    pub fn origin_rank(&self) -> usize {
        self.origin_rank
    }

    /// Index of the patch among the patches of its rank.
    pub fn patch_index(&self) -> usize {
        self.patch_index
    }

    /// Pixel data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consume the patch and return its pixel data.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// The part of the patch that lies in scanlines `ymin..ymax`.
    pub fn clip_rows(&self, ymin: i32, ymax: i32) -> Option<ImagePatch> {
        let ymin = ymin.max(self.extents.ymin);
        let ymax = ymax.min(self.extents.ymax);
        if ymin >= ymax || self.extents.width() == 0 {
            return None;
        }

        let row = self.extents.width() * CHANNELS;
        let start = (ymin - self.extents.ymin) as usize * row;
        let end = (ymax - self.extents.ymin) as usize * row;

        Some(ImagePatch::new(
            Extents::new(self.extents.xmin, self.extents.xmax, ymin, ymax),
            self.depth,
            self.origin_rank,
            self.patch_index,
            self.data[start..end].to_vec(),
        ))
    }

    /// Total compositing order: depth first, then rank and patch index.
    pub fn compositing_order(&self, other: &ImagePatch) -> Ordering {
        self.depth
            .total_cmp(&other.depth)
            .then(self.origin_rank.cmp(&other.origin_rank))
            .then(self.patch_index.cmp(&other.patch_index))
    }
}

/// An RGBA image covering some extents of the full image.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    extents: Extents,
    data: Vec<f32>,
}

impl Image {
    /// A fully transparent image.
    pub fn new(extents: Extents) -> Self {
        Self {
            extents,
            data: vec![0.0; extents.num_pixels() * CHANNELS],
        }
    }

    /// Create an image from existing pixel data.
    pub fn from_data(extents: Extents, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), extents.num_pixels() * CHANNELS);
        Self { extents, data }
    }

    /// Extents of the image.
    pub fn extents(&self) -> &Extents {
        &self.extents
    }

    /// Pixel data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable pixel data.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume the image and return its pixel data.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// The RGBA value of pixel `(x, y)` given in full image coordinates.
    pub fn pixel(&self, x: i32, y: i32) -> [f32; CHANNELS] {
        let offset = self.extents.pixel_offset(x, y) * CHANNELS;
        let mut pixel = [0.0; CHANNELS];
        pixel.copy_from_slice(&self.data[offset..offset + CHANNELS]);
        pixel
    }

    /// Set every pixel to `color`.
    pub fn color_image(&mut self, color: [f32; CHANNELS]) {
        for pixel in self.data.chunks_exact_mut(CHANNELS) {
            pixel.copy_from_slice(&color);
        }
    }

    /// Copy the pixels of `src`, laid out over `src_extents`, into the
    /// overlapping part of this image.
    pub fn place_image(&mut self, src_extents: &Extents, src: &[f32]) {
        debug_assert_eq!(src.len(), src_extents.num_pixels() * CHANNELS);
        let dst = &mut self.data;
        for_each_overlap(&self.extents, src_extents, |d, s| {
            dst[d * CHANNELS..(d + 1) * CHANNELS]
                .copy_from_slice(&src[s * CHANNELS..(s + 1) * CHANNELS]);
        });
    }

    /// Blend `src` behind the current content.
    ///
    /// Use this when patches are visited from the front to the back.
    pub fn blend_front_to_back(&mut self, src_extents: &Extents, src: &[f32]) {
        debug_assert_eq!(src.len(), src_extents.num_pixels() * CHANNELS);
        let dst = &mut self.data;
        for_each_overlap(&self.extents, src_extents, |d, s| {
            let dst = &mut dst[d * CHANNELS..(d + 1) * CHANNELS];
            let src = &src[s * CHANNELS..(s + 1) * CHANNELS];
            let transmission = 1.0 - dst[3];
            for c in 0..CHANNELS {
                dst[c] += transmission * src[c];
            }
        });
    }

    /// Blend `src` in front of the current content.
    ///
    /// Use this when patches are visited from the back to the front.
    pub fn blend_back_to_front(&mut self, src_extents: &Extents, src: &[f32]) {
        debug_assert_eq!(src.len(), src_extents.num_pixels() * CHANNELS);
        let dst = &mut self.data;
        for_each_overlap(&self.extents, src_extents, |d, s| {
            let dst = &mut dst[d * CHANNELS..(d + 1) * CHANNELS];
            let src = &src[s * CHANNELS..(s + 1) * CHANNELS];
            let transmission = 1.0 - src[3];
            for c in 0..CHANNELS {
                dst[c] = src[c] + transmission * dst[c];
            }
        });
    }

    /// Composite the image over an opaque background color.
    pub fn blend_with_background(&mut self, background: [f32; 3]) {
        for pixel in self.data.chunks_exact_mut(CHANNELS) {
            let transmission = 1.0 - pixel[3];
            for c in 0..3 {
                pixel[c] += transmission * background[c];
            }
            pixel[3] = 1.0;
        }
    }

    /// Convert to 8 bit RGB.
    pub fn to_rgb8(&self) -> Vec<u8> {
        self.data
            .chunks_exact(CHANNELS)
            .flat_map(|pixel| {
                pixel[..3]
                    .iter()
                    .map(|&c| (num::clamp(c, 0.0, 1.0) * 255.0).round() as u8)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use assert_approx_eq::assert_approx_eq;
    use rand::Rng;

    use super::{Extents, Image, ImagePatch};
    use crate::{constants::CHANNELS, tools::seeded_rng};

    #[test]
    fn test_intersect() {
        let a = Extents::new(0, 4, 0, 4);
        let b = Extents::new(2, 6, 3, 8);
        assert_eq!(a.intersect(&b), Some(Extents::new(2, 4, 3, 4)));
        assert_eq!(a.intersect(&Extents::new(4, 6, 0, 4)), None);
    }

    #[test]
    fn test_place_image_offsets() {
        let mut image = Image::new(Extents::new(10, 14, 20, 22));
        let src_extents = Extents::new(12, 16, 21, 23);
        let src = (0..src_extents.num_pixels())
            .flat_map(|p| [p as f32, 0.0, 0.0, 1.0])
            .collect::<Vec<_>>();

        image.place_image(&src_extents, &src);

        // Pixel (12, 21) is the first source pixel, (13, 21) the second.
        assert_eq!(image.pixel(12, 21), [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(image.pixel(13, 21), [1.0, 0.0, 0.0, 1.0]);
        // Outside of the overlap nothing changes.
        assert_eq!(image.pixel(10, 20), [0.0; CHANNELS]);
        assert_eq!(image.pixel(11, 21), [0.0; CHANNELS]);
    }

    #[test]
    fn test_blend_orders_agree() {
        let mut rng = seeded_rng(3);
        let extents = Extents::new(0, 3, 0, 2);
        let layers = (0..4)
            .map(|_| {
                (0..extents.num_pixels())
                    .flat_map(|_| {
                        let alpha: f32 = rng.gen_range(0.0..1.0);
                        [
                            alpha * rng.gen::<f32>(),
                            alpha * rng.gen::<f32>(),
                            alpha * rng.gen::<f32>(),
                            alpha,
                        ]
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let mut front_to_back = Image::new(extents);
        for layer in &layers {
            front_to_back.blend_front_to_back(&extents, layer);
        }

        let mut back_to_front = Image::new(extents);
        for layer in layers.iter().rev() {
            back_to_front.blend_back_to_front(&extents, layer);
        }

        for (a, b) in front_to_back.data().iter().zip(back_to_front.data()) {
            assert_approx_eq!(a, b, 1e-5);
        }
    }

    #[test]
    fn test_background() {
        let mut image = Image::new(Extents::new(0, 1, 0, 1));
        image.color_image([0.25, 0.0, 0.0, 0.5]);
        image.blend_with_background([1.0, 1.0, 1.0]);
        assert_eq!(image.pixel(0, 0), [0.75, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn test_clip_rows() {
        let extents = Extents::new(0, 2, 1, 4);
        let data = (0..extents.num_pixels() * CHANNELS).map(|v| v as f32).collect();
        let patch = ImagePatch::new(extents, 0.5, 0, 0, data);

        let clipped = patch.clip_rows(2, 10).unwrap();
        assert_eq!(*clipped.extents(), Extents::new(0, 2, 2, 4));
        assert_eq!(clipped.data()[0], 8.0);
        assert!(patch.clip_rows(4, 6).is_none());
    }
}
