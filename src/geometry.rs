//! Geometry information

use bytemuck;

/// An axis aligned box in the space in which a volume is sampled.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PhysicalBox {
    coords: [f64; 6],
}

impl PhysicalBox {
    /// Create a new bounding box.
    ///
    /// The coordinates are given by `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    pub fn new(coords: [f64; 6]) -> Self {
        Self { coords }
    }

    /// Give a slice of points. Compute an associated bounding box.
    pub fn from_points(points: &[f64]) -> PhysicalBox {
        assert_eq!(points.len() % 3, 0);

        let points: &[[f64; 3]] = bytemuck::cast_slice(points);

        let mut xmin = f64::MAX;
        let mut xmax = f64::MIN;

        let mut ymin = f64::MAX;
        let mut ymax = f64::MIN;

        let mut zmin = f64::MAX;
        let mut zmax = f64::MIN;

        for point in points {
            xmin = f64::min(xmin, point[0]);
            xmax = f64::max(xmax, point[0]);

            ymin = f64::min(ymin, point[1]);
            ymax = f64::max(ymax, point[1]);

            zmin = f64::min(zmin, point[2]);
            zmax = f64::max(zmax, point[2]);
        }

        PhysicalBox {
            coords: [xmin, ymin, zmin, xmax, ymax, zmax],
        }
    }

    /// Return coordinates
    pub fn coordinates(&self) -> [f64; 6] {
        self.coords
    }

    /// Center of the box.
    pub fn center(&self) -> [f64; 3] {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;
        [
            0.5 * (xmin + xmax),
            0.5 * (ymin + ymax),
            0.5 * (zmin + zmax),
        ]
    }

    /// Edge lengths of the box.
    pub fn extent(&self) -> [f64; 3] {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;
        [xmax - xmin, ymax - ymin, zmax - zmin]
    }

    /// Map a point from the reference box [0, 1]^3 to the bounding box.
    pub fn reference_to_physical(&self, point: [f64; 3]) -> [f64; 3] {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        [
            xmin + (xmax - xmin) * point[0],
            ymin + (ymax - ymin) * point[1],
            zmin + (zmax - zmin) * point[2],
        ]
    }

    /// Map a point from the physical domain to the reference box.
    pub fn physical_to_reference(&self, point: [f64; 3]) -> [f64; 3] {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        [
            (point[0] - xmin) / (xmax - xmin),
            (point[1] - ymin) / (ymax - ymin),
            (point[2] - zmin) / (zmax - zmin),
        ]
    }
}

impl std::fmt::Display for PhysicalBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        write!(
            f,
            "(xmin: {}, ymin: {}, zmin: {}, xmax: {}, ymax: {}, zmax: {})",
            xmin, ymin, zmin, xmax, ymax, zmax
        )
    }
}

/// A mesh cell reduced to what sampling needs: a bounding box and its values.
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    bounds: PhysicalBox,
    values: Vec<f64>,
}

impl Cell {
    /// Create a new cell.
    pub fn new(bounds: PhysicalBox, values: Vec<f64>) -> Self {
        Self { bounds, values }
    }

    /// Create a cell from the flat coordinates of its points.
    pub fn from_points(points: &[f64], values: Vec<f64>) -> Self {
        Self::new(PhysicalBox::from_points(points), values)
    }

    /// Bounding box of the cell.
    pub fn bounds(&self) -> &PhysicalBox {
        &self.bounds
    }

    /// Center of the bounding box.
    pub fn center(&self) -> [f64; 3] {
        self.bounds.center()
    }

    /// Variable values carried by the cell.
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Maps between sample indices of a `width x height x depth` volume and the
/// physical box it covers.
///
/// Sample `(i, j, k)` sits in the middle of its voxel.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SampleGrid {
    bounds: PhysicalBox,
    dims: [usize; 3],
}

impl SampleGrid {
    /// Create a new sample grid.
    pub fn new(bounds: PhysicalBox, width: usize, height: usize, depth: usize) -> Self {
        assert!(width > 0 && height > 0 && depth > 0);
        Self {
            bounds,
            dims: [width, height, depth],
        }
    }

    /// The physical box covered by the grid.
    pub fn bounds(&self) -> &PhysicalBox {
        &self.bounds
    }

    /// Number of samples along each axis.
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Distance between neighbouring samples along each axis.
    pub fn spacing(&self) -> [f64; 3] {
        let extent = self.bounds.extent();
        [
            extent[0] / self.dims[0] as f64,
            extent[1] / self.dims[1] as f64,
            extent[2] / self.dims[2] as f64,
        ]
    }

    /// Physical position of sample `index` along `axis`.
    pub fn position(&self, axis: usize, index: usize) -> f64 {
        self.bounds.coords[axis] + (index as f64 + 0.5) * self.spacing()[axis]
    }

    /// Smallest sample index along `axis` whose position is at least `coord`.
    ///
    /// The result may lie outside of the grid.
    pub fn snap_right(&self, axis: usize, coord: f64) -> i64 {
        let continuous = (coord - self.bounds.coords[axis]) / self.spacing()[axis] - 0.5;
        continuous.ceil() as i64
    }

    /// Largest sample index along `axis` whose position is at most `coord`.
    ///
    /// The result may lie outside of the grid.
    pub fn snap_left(&self, axis: usize, coord: f64) -> i64 {
        let continuous = (coord - self.bounds.coords[axis]) / self.spacing()[axis] - 0.5;
        continuous.floor() as i64
    }
}
