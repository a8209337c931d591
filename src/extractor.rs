//! Kernel based splatting of cells onto the rays of a volume.
//!
//! Every cell spreads its values over the samples within a spherical kernel
//! around its center. The kernel radius follows the size of the cell but never
//! drops below a minimum derived from the sample spacing, so that even a
//! degenerate cell reaches its neighbouring samples. Each touched sample
//! accumulates `weight * value` per variable and the weight itself in a
//! trailing channel, see [crate::ray::Ray::accumulate_sample]. The weighted
//! sums are normalized by [crate::volume::Volume::finalize_rays].

use log::debug;

use crate::{
    cell_list::{CellList, SampleBox},
    constants::{DEFERRAL_THRESHOLD, KERNEL_SCALE},
    context::RenderContext,
    error::{RenderError, Result},
    geometry::{Cell, SampleGrid},
    volume::Volume,
};

/// What happened to a cell handed to [PointExtractor::extract].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Extraction {
    /// The kernel does not reach the restricted part of the volume.
    Missed,
    /// The kernel was too large and the cell went to the cell list.
    Deferred,
    /// The cell was splatted onto the given number of samples.
    Splatted(usize),
}

/// Splats cells onto a [Volume].
pub struct PointExtractor {
    grid: SampleGrid,
    smallest: [f64; 3],
    defer_large_cells: bool,
    cell_list: CellList,
}

impl PointExtractor {
    /// Create an extractor for volumes sampled on `grid`.
    ///
    /// Deferral of large cells is off.
    pub fn new(grid: SampleGrid) -> Self {
        // Half the spacing is the largest distance between a point and its
        // nearest sample, scaled like the kernel itself.
        let smallest = grid.spacing().map(|spacing| KERNEL_SCALE * 0.5 * spacing);
        Self {
            grid,
            smallest,
            defer_large_cells: false,
            cell_list: CellList::new(),
        }
    }

    /// The sample grid.
    pub fn grid(&self) -> &SampleGrid {
        &self.grid
    }

    /// Send cells with too many candidate samples to the cell list.
    pub fn set_defer_large_cells(&mut self, flag: bool) {
        self.defer_large_cells = flag;
    }

    /// The deferred cells.
    pub fn cell_list(&self) -> &CellList {
        &self.cell_list
    }

    /// Mutable access to the deferred cells.
    pub fn cell_list_mut(&mut self) -> &mut CellList {
        &mut self.cell_list
    }

    /// Kernel radius of `cell`.
    pub fn kernel_radius(&self, cell: &Cell) -> f64 {
        let extent = cell.bounds().extent();
        let squared: f64 = (0..3)
            .map(|axis| {
                let diff = f64::max(0.5 * extent[axis], self.smallest[axis]);
                diff * diff
            })
            .sum();
        KERNEL_SCALE * squared.sqrt()
    }

    /// Samples of `volume` that the kernel of `cell` may touch.
    ///
    /// The box is clamped to the restriction of the volume. Returns `None` if
    /// the kernel misses the restriction.
    pub fn sample_box(&self, cell: &Cell, volume: &Volume) -> Option<SampleBox> {
        let center = cell.center();
        let rad = self.kernel_radius(cell);

        let [xmin, xmax, ymin, ymax] = volume.restriction()?;
        let limits = [(xmin, xmax), (ymin, ymax), (0, volume.depth() - 1)];

        let mut sample_box = SampleBox {
            min: [0; 3],
            max: [0; 3],
        };

        for (axis, &(lower, upper)) in limits.iter().enumerate() {
            let first = self.grid.snap_right(axis, center[axis] - rad);
            let last = self.grid.snap_left(axis, center[axis] + rad);
            if last < first || last < lower as i64 || first > upper as i64 {
                return None;
            }
            sample_box.min[axis] = first.max(lower as i64) as usize;
            sample_box.max[axis] = last.min(upper as i64) as usize;
        }

        Some(sample_box)
    }

    /// Splat `cell` onto `volume`.
    ///
    /// The volume needs one variable more than the cell carries values, for
    /// the kernel weight. Fails if the context is not set up for kernel based
    /// sampling.
    pub fn extract(
        &mut self,
        cell: &Cell,
        volume: &mut Volume,
        context: &RenderContext,
    ) -> Result<Extraction> {
        if !context.kernel_based_sampling() {
            return Err(RenderError::KernelSamplingDisabled);
        }
        assert_eq!(
            self.grid.dims(),
            [volume.width(), volume.height(), volume.depth()]
        );
        assert_eq!(cell.values().len() + 1, volume.num_variables());

        let Some(sample_box) = self.sample_box(cell, volume) else {
            return Ok(Extraction::Missed);
        };

        if self.defer_large_cells && sample_box.num_samples() > DEFERRAL_THRESHOLD {
            self.cell_list.push(cell.clone(), sample_box);
            return Ok(Extraction::Deferred);
        }

        self.splat(cell, &sample_box, volume).map(Extraction::Splatted)
    }

    fn splat(&self, cell: &Cell, sample_box: &SampleBox, volume: &mut Volume) -> Result<usize> {
        let center = cell.center();
        let rad = self.kernel_radius(cell);
        let rad2 = rad * rad;
        let mut touched = 0;

        for h in sample_box.min[1]..=sample_box.max[1] {
            let dy = self.grid.position(1, h) - center[1];
            for w in sample_box.min[0]..=sample_box.max[0] {
                let dx = self.grid.position(0, w) - center[0];
                let planar = dx * dx + dy * dy;
                if planar >= rad2 {
                    continue;
                }
                for k in sample_box.min[2]..=sample_box.max[2] {
                    let dz = self.grid.position(2, k) - center[2];
                    let dist = planar + dz * dz;
                    if dist >= rad2 {
                        continue;
                    }
                    let weight = ((rad2 - dist) / rad2).powi(2);
                    volume
                        .get_ray(w, h)?
                        .accumulate_sample(k, cell.values(), weight)?;
                    touched += 1;
                }
            }
        }

        Ok(touched)
    }

    /// Splat a batch of cells. Returns the number of touched samples.
    pub fn extract_cells<'a, I>(
        &mut self,
        cells: I,
        volume: &mut Volume,
        context: &RenderContext,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = &'a Cell>,
    {
        let mut touched = 0;
        let mut deferred = 0;
        let mut missed = 0;

        for cell in cells {
            match self.extract(cell, volume, context)? {
                Extraction::Splatted(count) => touched += count,
                Extraction::Deferred => deferred += 1,
                Extraction::Missed => missed += 1,
            }
        }

        debug!(
            "splatted {} samples, deferred {} cells, {} cells missed the volume",
            touched, deferred, missed
        );
        Ok(touched)
    }

    /// Second pass: splat `cells` without the deferral threshold.
    ///
    /// Used for the cells of the own cell list after the image was partitioned,
    /// or for deferred cells received from other ranks.
    pub fn extract_deferred(
        &mut self,
        cells: &[Cell],
        volume: &mut Volume,
        context: &RenderContext,
    ) -> Result<usize> {
        let defer = self.defer_large_cells;
        self.defer_large_cells = false;
        let result = self.extract_cells(cells, volume, context);
        self.defer_large_cells = defer;
        result
    }
}
