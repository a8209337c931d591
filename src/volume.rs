//! A lazily allocated grid of rays.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::{
    constants::{VARIABLE_LIMIT, VOLUME_MESSAGE_VERSION},
    context::RenderContext,
    error::{bad_index, RenderError, Result},
    memory::{RayId, RayPool},
    partition::ImagePartition,
    ray::{RayMut, RayRef},
    ray_function::{PixelBuffer, RayFunction},
};

/// The rays of one rank, one per pixel of a `width x height` image, each with
/// `depth` samples of `num_variables` variables.
///
/// Scanlines and rays are only allocated when first touched. The restriction
/// rectangle limits which rays take part in the aggregate operations
/// ([Volume::get_variables], [Volume::get_pixels], [Volume::construct_messages]).
pub struct Volume {
    width: usize,
    height: usize,
    depth: usize,
    num_variables: usize,
    // Indexed by scanline, then by column.
    rays: Vec<Option<Vec<Option<RayId>>>>,
    pool: RayPool,
    // Inclusive bounds `[min_width, max_width, min_height, max_height]`,
    // `None` if the restriction lies outside the volume.
    restriction: Option<[usize; 4]>,
}

impl Volume {
    /// Create an empty volume. The restriction covers the whole volume.
    pub fn new(width: usize, height: usize, depth: usize, num_variables: usize) -> Result<Self> {
        if num_variables > VARIABLE_LIMIT {
            return Err(RenderError::TooManyVariables(num_variables));
        }
        assert!(width > 0 && height > 0 && depth > 0);

        Ok(Self {
            width,
            height,
            depth,
            num_variables,
            rays: (0..height).map(|_| None).collect(),
            pool: RayPool::new(depth, num_variables)?,
            restriction: Some([0, width - 1, 0, height - 1]),
        })
    }

    /// Number of rays per scanline.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of scanlines.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of samples per ray.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of variables per sample.
    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    /// The ray through pixel `(w, h)`, allocated on first access.
    pub fn get_ray(&mut self, w: usize, h: usize) -> Result<RayMut<'_>> {
        if w >= self.width {
            return Err(bad_index(w, self.width));
        }
        if h >= self.height {
            return Err(bad_index(h, self.height));
        }

        let width = self.width;
        let scanline = self.rays[h].get_or_insert_with(|| vec![None; width]);

        let id = match scanline[w] {
            Some(id) => id,
            None => {
                let id = self.pool.acquire();
                scanline[w] = Some(id);
                id
            }
        };

        Ok(self.pool.get_mut(id))
    }

    /// The ray through pixel `(w, h)` if it was allocated.
    pub fn query_ray(&self, w: usize, h: usize) -> Option<RayRef<'_>> {
        let id = self.ray_id(w, h)?;
        Some(self.pool.get(id))
    }

    fn ray_id(&self, w: usize, h: usize) -> Option<RayId> {
        self.rays.get(h)?.as_ref()?.get(w).copied().flatten()
    }

    /// Limit aggregate operations to the rays in `xmin..=xmax` times `ymin..=ymax`.
    ///
    /// The bounds are clipped to the volume. A rectangle entirely outside of
    /// the volume leaves no ray in the restriction.
    pub fn restrict(&mut self, xmin: usize, xmax: usize, ymin: usize, ymax: usize) {
        assert!(xmin <= xmax && ymin <= ymax);
        self.restriction = if xmin >= self.width || ymin >= self.height {
            None
        } else {
            Some([
                xmin,
                xmax.min(self.width - 1),
                ymin,
                ymax.min(self.height - 1),
            ])
        };
    }

    /// The restriction as inclusive bounds `[xmin, xmax, ymin, ymax]`, `None` if it is empty.
    pub fn restriction(&self) -> Option<[usize; 4]> {
        self.restriction
    }

    /// Return true if `(w, h)` lies inside the restriction.
    pub fn is_restricted_to(&self, w: usize, h: usize) -> bool {
        self.restriction.map_or(false, |[xmin, xmax, ymin, ymax]| {
            w >= xmin && w <= xmax && h >= ymin && h <= ymax
        })
    }

    fn allocated_rays(&self) -> impl Iterator<Item = (usize, usize, RayId)> + '_ {
        self.rays
            .iter()
            .enumerate()
            .filter_map(|(h, scanline)| scanline.as_ref().map(|scanline| (h, scanline)))
            .flat_map(|(h, scanline)| {
                scanline
                    .iter()
                    .enumerate()
                    .filter_map(move |(w, id)| id.map(|id| (w, h, id)))
            })
    }

    /// Hand every ray back to the pool for reuse. Memory is kept.
    pub fn reset_samples(&mut self) {
        let ids = self.allocated_rays().map(|(_, _, id)| id).collect::<Vec<_>>();
        for id in ids {
            self.pool.release(id);
        }
        for scanline in self.rays.iter_mut().flatten() {
            scanline.fill(None);
        }
    }

    /// Release all ray memory.
    pub fn destroy_samples(&mut self) {
        self.rays.iter_mut().for_each(|scanline| *scanline = None);
        self.pool.clear();
    }

    /// Normalize the kernel weighted samples of every ray.
    pub fn finalize_rays(&mut self, context: &RenderContext) {
        let ids = self.allocated_rays().map(|(_, _, id)| id).collect::<Vec<_>>();
        for id in ids {
            self.pool.get_mut(id).finalize(context);
        }
    }

    /// Number of valid samples on each scanline, as a load estimate for partitioning.
    pub fn estimate_number_of_samples_per_scanline(&self) -> Vec<usize> {
        let mut samples = vec![0; self.height];
        for (_, h, id) in self.allocated_rays() {
            samples[h] += self.pool.get(id).num_valid_samples();
        }
        samples
    }

    /// Dense copy of every variable over the restriction.
    ///
    /// Returns one array per variable. Sample `k` of ray `(w, h)` is stored at
    /// `(k * rh + (h - ymin)) * rw + (w - xmin)` where `rw x rh` is the size of
    /// the restriction. Missing samples are set to `default`. An empty
    /// restriction gives empty arrays.
    pub fn get_variables(&self, default: f64) -> Vec<Vec<f64>> {
        let Some([xmin, xmax, ymin, ymax]) = self.restriction else {
            return vec![Vec::new(); self.num_variables];
        };
        let rw = xmax - xmin + 1;
        let rh = ymax - ymin + 1;

        let mut output = vec![vec![default; rw * rh * self.depth]; self.num_variables];
        let mut sample = [0.0; VARIABLE_LIMIT];

        for h in ymin..=ymax {
            for w in xmin..=xmax {
                let Some(ray) = self.query_ray(w, h) else {
                    continue;
                };
                for k in 0..self.depth {
                    if let Ok(true) = ray.get_sample(k, &mut sample) {
                        let index = (k * rh + (h - ymin)) * rw + (w - xmin);
                        for (variable, values) in output.iter_mut().enumerate() {
                            values[index] = sample[variable];
                        }
                    }
                }
            }
        }

        output
    }

    /// Run `function` over every allocated ray of the restriction.
    ///
    /// `pixels` must cover the full volume. Pixel colors are written in place;
    /// the depth buffer is read.
    pub fn get_pixels<F: RayFunction>(&self, function: &mut F, pixels: &mut PixelBuffer) {
        assert_eq!(pixels.width(), self.width);
        assert_eq!(pixels.height(), self.height);

        let Some([xmin, xmax, ymin, ymax]) = self.restriction else {
            return;
        };
        for h in ymin..=ymax {
            for w in xmin..=xmax {
                let Some(ray) = self.query_ray(w, h) else {
                    continue;
                };
                if ray.num_valid_samples() == 0 {
                    continue;
                }
                let (rgb, depth) = pixels.pixel_mut(w, h);
                function.get_ray_value(ray, (w, h), rgb, depth as f64);
            }
        }
    }

    /// Serialize the rays of the restriction into one message per partition.
    ///
    /// A ray goes to the partition owning its scanline. Every partition gets
    /// a message, possibly without rays. See [Volume::extract_samples] for the
    /// inverse.
    pub fn construct_messages(&self, partition: &ImagePartition) -> Result<Vec<Vec<u8>>> {
        assert_eq!(partition.height(), self.height);

        let nparts = partition.num_partitions();
        let mut bodies = vec![Vec::<u8>::new(); nparts];
        let mut ray_counts = vec![0_u32; nparts];

        for (w, h, id) in self.allocated_rays() {
            if !self.is_restricted_to(w, h) {
                continue;
            }
            let ray = self.pool.get(id);
            if ray.num_valid_samples() == 0 {
                continue;
            }

            let target = partition.partition_for_scanline(h);
            ray_counts[target] += 1;
            encode_ray(&mut bodies[target], w, h, ray)?;
        }

        let mut messages = Vec::with_capacity(nparts);
        for (body, count) in bodies.into_iter().zip(ray_counts) {
            let mut message = Vec::with_capacity(16 + body.len());
            message.write_u32::<LittleEndian>(VOLUME_MESSAGE_VERSION)?;
            message.write_u32::<LittleEndian>(self.num_variables as u32)?;
            message.write_u32::<LittleEndian>(self.depth as u32)?;
            message.write_u32::<LittleEndian>(count)?;
            message.extend_from_slice(&body);
            messages.push(message);
        }

        Ok(messages)
    }

    /// Merge serialized rays into this volume.
    pub fn extract_samples<'a, I>(&mut self, messages: I, context: &RenderContext) -> Result<()>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut total = 0;
        for message in messages {
            total += self.extract_message(message, context)?;
        }
        debug!("extracted {} rays from messages", total);
        Ok(())
    }

    fn extract_message(&mut self, message: &[u8], context: &RenderContext) -> Result<usize> {
        let mut reader = Cursor::new(message);

        let version = read_u32(&mut reader)?;
        if version != VOLUME_MESSAGE_VERSION {
            return Err(RenderError::MalformedMessage(format!(
                "unsupported volume message version {}",
                version
            )));
        }
        let num_variables = read_u32(&mut reader)? as usize;
        let depth = read_u32(&mut reader)? as usize;
        if num_variables != self.num_variables || depth != self.depth {
            return Err(RenderError::MalformedMessage(format!(
                "message has {} variables and {} samples, volume has {} and {}",
                num_variables, depth, self.num_variables, self.depth
            )));
        }
        let count = read_u32(&mut reader)? as usize;

        let mut values = vec![0.0; num_variables];
        for _ in 0..count {
            let w = read_u32(&mut reader)? as usize;
            let h = read_u32(&mut reader)? as usize;
            let nruns = read_u32(&mut reader)?;
            let mut ray = self.get_ray(w, h)?;

            for _ in 0..nruns {
                let start = read_u32(&mut reader)? as usize;
                let len = read_u32(&mut reader)? as usize;
                if start + len > depth {
                    return Err(RenderError::MalformedMessage(format!(
                        "run {}..{} exceeds {} samples",
                        start,
                        start + len,
                        depth
                    )));
                }
                for index in start..start + len {
                    for value in values.iter_mut() {
                        *value = read_f64(&mut reader)?;
                    }
                    ray.merge_sample(index, &values, context)?;
                }
            }
        }

        if reader.position() as usize != message.len() {
            return Err(RenderError::MalformedMessage(
                "trailing bytes after last ray".to_string(),
            ));
        }

        Ok(count)
    }
}

// Per ray: `w`, `h`, number of runs, then for each run its start, its length
// and the values sample by sample.
fn encode_ray<W: Write>(body: &mut W, w: usize, h: usize, ray: RayRef<'_>) -> Result<()> {
    let runs = ray.runs();
    body.write_u32::<LittleEndian>(w as u32)?;
    body.write_u32::<LittleEndian>(h as u32)?;
    body.write_u32::<LittleEndian>(runs.len() as u32)?;
    for (start, len) in runs {
        body.write_u32::<LittleEndian>(start as u32)?;
        body.write_u32::<LittleEndian>(len as u32)?;
        for index in start..start + len {
            for variable in 0..ray.num_variables() {
                body.write_f64::<LittleEndian>(ray.value(variable, index))?;
            }
        }
    }
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    reader
        .read_u32::<LittleEndian>()
        .map_err(|_| RenderError::MalformedMessage("truncated volume message".to_string()))
}

fn read_f64<R: Read>(reader: &mut R) -> Result<f64> {
    reader
        .read_f64::<LittleEndian>()
        .map_err(|_| RenderError::MalformedMessage("truncated volume message".to_string()))
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use assert_approx_eq::assert_approx_eq;

    use super::Volume;
    use crate::{
        context::RenderContext,
        error::RenderError,
        partition::ImagePartition,
        ray_function::{IntegrationRayFunction, PixelBuffer},
    };

    #[test]
    fn test_get_ray_is_stable_and_distinct() {
        let mut volume = Volume::new(5, 4, 3, 1).unwrap();
        let context = RenderContext::new();

        // Tag every ray with its own position so that rays can be told apart.
        for h in 0..4 {
            for w in 0..5 {
                let tag = (h * 5 + w) as f64;
                volume.get_ray(w, h).unwrap().set_sample(0, &[tag], &context).unwrap();
            }
        }

        let mut tags = HashSet::new();
        for h in 0..4 {
            for w in 0..5 {
                let ray = volume.query_ray(w, h).unwrap();
                assert_eq!(ray.value(0, 0), (h * 5 + w) as f64);
                tags.insert(ray.value(0, 0) as usize);
            }
        }
        assert_eq!(tags.len(), 20);
    }

    #[test]
    fn test_get_ray_out_of_range() {
        let mut volume = Volume::new(2, 2, 2, 1).unwrap();
        assert!(matches!(
            volume.get_ray(2, 0),
            Err(RenderError::BadIndex { index: 2, len: 2 })
        ));
        assert!(volume.get_ray(0, 5).is_err());
        assert!(volume.query_ray(0, 5).is_none());
    }

    #[test]
    fn test_query_does_not_allocate() {
        let mut volume = Volume::new(3, 3, 2, 1).unwrap();
        assert!(volume.query_ray(1, 1).is_none());
        volume.get_ray(1, 1).unwrap();
        assert!(volume.query_ray(1, 1).is_some());
        assert!(volume.query_ray(0, 1).is_none());
    }

    #[test]
    fn test_reset_recycles_rays() {
        let context = RenderContext::new();
        let mut volume = Volume::new(4, 4, 2, 1).unwrap();
        volume.get_ray(0, 0).unwrap().set_sample(1, &[3.0], &context).unwrap();
        volume.get_ray(3, 2).unwrap();

        volume.reset_samples();
        assert!(volume.query_ray(0, 0).is_none());

        assert_eq!(volume.get_ray(1, 1).unwrap().num_valid_samples(), 0);
        assert_eq!(volume.pool.num_reserved(), 2);
        assert_eq!(volume.pool.num_free(), 1);

        volume.destroy_samples();
        assert_eq!(volume.pool.num_reserved(), 0);
    }

    #[test]
    fn test_estimate_and_variables() {
        let context = RenderContext::new();
        let mut volume = Volume::new(3, 2, 2, 2).unwrap();
        volume.get_ray(0, 1).unwrap().set_sample(1, &[1.0, 2.0], &context).unwrap();
        volume.get_ray(2, 1).unwrap().set_sample(0, &[3.0, 4.0], &context).unwrap();
        volume.get_ray(2, 1).unwrap().set_sample(1, &[5.0, 6.0], &context).unwrap();

        assert_eq!(volume.estimate_number_of_samples_per_scanline(), vec![0, 3]);

        volume.restrict(1, 2, 1, 1);
        let variables = volume.get_variables(-1.0);
        // Restriction is 2 x 1, two samples deep.
        assert_eq!(variables[0], vec![-1.0, 3.0, -1.0, 5.0]);
        assert_eq!(variables[1], vec![-1.0, 4.0, -1.0, 6.0]);
    }

    #[test]
    fn test_messages_roundtrip_by_partition() {
        let context = RenderContext::new();
        let mut volume = Volume::new(4, 4, 5, 2).unwrap();
        volume.get_ray(1, 0).unwrap().set_sample(2, &[1.0, 1.5], &context).unwrap();
        volume.get_ray(2, 3).unwrap().set_sample(0, &[2.0, 2.5], &context).unwrap();
        volume.get_ray(2, 3).unwrap().set_sample(4, &[3.0, 3.5], &context).unwrap();
        // Outside of the restriction, must not be sent.
        volume.get_ray(3, 3).unwrap().set_sample(4, &[9.0, 9.0], &context).unwrap();
        volume.restrict(0, 2, 0, 3);

        let partition = ImagePartition::new(4, 4, 2);
        let messages = volume.construct_messages(&partition).unwrap();
        assert_eq!(messages.len(), 2);

        let mut upper = Volume::new(4, 4, 5, 2).unwrap();
        upper.extract_samples([messages[0].as_slice()], &context).unwrap();
        assert_eq!(upper.query_ray(1, 0).unwrap().value(1, 2), 1.5);
        assert!(upper.query_ray(2, 3).is_none());

        let mut lower = Volume::new(4, 4, 5, 2).unwrap();
        lower.extract_samples([messages[1].as_slice()], &context).unwrap();
        let ray = lower.query_ray(2, 3).unwrap();
        assert_eq!(ray.valid_mask(), &[true, false, false, false, true]);
        assert_eq!(ray.value(0, 4), 3.0);
        assert!(lower.query_ray(3, 3).is_none());
    }

    #[test]
    fn test_kernel_messages_accumulate() {
        let context = RenderContext::kernel_based();
        let mut first = Volume::new(2, 2, 2, 2).unwrap();
        first.get_ray(0, 0).unwrap().accumulate_sample(1, &[4.0], 0.5).unwrap();
        let mut second = Volume::new(2, 2, 2, 2).unwrap();
        second.get_ray(0, 0).unwrap().accumulate_sample(1, &[2.0], 1.5).unwrap();

        let partition = ImagePartition::new(2, 2, 1);
        let messages = first.construct_messages(&partition).unwrap();
        second.extract_samples(messages.iter().map(|m| m.as_slice()), &context).unwrap();
        second.finalize_rays(&context);

        // (0.5 * 4 + 1.5 * 2) / (0.5 + 1.5)
        assert_approx_eq!(second.query_ray(0, 0).unwrap().value(0, 1), 2.5);
    }

    #[test]
    fn test_truncated_message() {
        let context = RenderContext::new();
        let mut volume = Volume::new(2, 2, 2, 1).unwrap();
        volume.get_ray(0, 0).unwrap().set_sample(0, &[1.0], &context).unwrap();
        let messages = volume.construct_messages(&ImagePartition::new(2, 2, 1)).unwrap();
        let truncated = &messages[0][..messages[0].len() - 3];

        let mut target = Volume::new(2, 2, 2, 1).unwrap();
        assert!(matches!(
            target.extract_samples([truncated], &context),
            Err(RenderError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_get_pixels() {
        let context = RenderContext::new();
        let mut volume = Volume::new(2, 2, 2, 1).unwrap();
        volume.get_ray(1, 0).unwrap().set_sample(0, &[1.0], &context).unwrap();
        volume.get_ray(1, 0).unwrap().set_sample(1, &[1.0], &context).unwrap();

        let mut function = IntegrationRayFunction::new(0, 1.0, 0.0, 1.0);
        function.set_window_size(2, 2);
        let mut pixels = PixelBuffer::new(2, 2);
        volume.get_pixels(&mut function, &mut pixels);

        assert_eq!(pixels.color(1, 0), [255, 255, 255]);
        assert_eq!(pixels.color(0, 0), [0, 0, 0]);
        assert_eq!(function.values()[1], 1.0);
    }

    #[test]
    fn test_restriction_outside_the_volume() {
        let context = RenderContext::new();
        let mut volume = Volume::new(4, 4, 2, 1).unwrap();
        volume.get_ray(3, 3).unwrap().set_sample(0, &[1.0], &context).unwrap();

        volume.restrict(5, 9, 0, 3);
        assert_eq!(volume.restriction(), None);
        assert!(!volume.is_restricted_to(3, 3));
        assert_eq!(volume.get_variables(0.0), vec![Vec::<f64>::new()]);

        let messages = volume.construct_messages(&ImagePartition::new(4, 4, 1)).unwrap();
        let mut target = Volume::new(4, 4, 2, 1).unwrap();
        target.extract_samples([messages[0].as_slice()], &context).unwrap();
        assert!(target.query_ray(3, 3).is_none());

        // Partly outside, clipped to the volume.
        volume.restrict(2, 9, 3, 7);
        assert_eq!(volume.restriction(), Some([2, 3, 3, 3]));
        assert_eq!(volume.get_variables(-1.0), vec![vec![-1.0, 1.0, -1.0, -1.0]]);
    }
}
