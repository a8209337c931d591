//! Partitioning of the image into contiguous bands of scanlines.

use itertools::Itertools;

use crate::tools::{sort_to_bins, split};

/// A split of the scanlines `0..height` into `num_partitions` contiguous bands.
///
/// Partition `p` covers the scanlines `start(p)..end(p)`. Bands may be empty
/// when a few scanlines carry most of the load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagePartition {
    width: usize,
    height: usize,
    // Start scanline of each partition followed by `height`.
    boundaries: Vec<usize>,
}

impl ImagePartition {
    /// Create a partition with bands of (almost) equal numbers of scanlines.
    pub fn new(width: usize, height: usize, num_partitions: usize) -> Self {
        assert!(num_partitions > 0);

        let mut boundaries = Vec::with_capacity(num_partitions + 1);
        let mut start = 0;
        boundaries.push(start);

        let lines = (0..height).collect_vec();
        for chunk in split(&lines, num_partitions) {
            start += chunk.len();
            boundaries.push(start);
        }

        // There are fewer scanlines than partitions. The trailing partitions stay empty.
        while boundaries.len() < num_partitions + 1 {
            boundaries.push(height);
        }

        Self {
            width,
            height,
            boundaries,
        }
    }

    /// Rebalance the bands so that each holds roughly the same number of samples.
    ///
    /// `samples_per_scanline` has one estimate per scanline. If all estimates
    /// are zero the uniform partition is kept.
    pub fn establish_partition_boundaries(&mut self, samples_per_scanline: &[usize]) {
        assert_eq!(samples_per_scanline.len(), self.height);

        let size = self.num_partitions();
        let total: usize = samples_per_scanline.iter().sum();

        if total == 0 || size == 1 {
            return;
        }

        // Each scanline is represented by the position of its midpoint in the
        // running sum of samples, doubled to stay in integers. Sorting these keys
        // into equally spaced bins yields contiguous bands of equal weight.

        let keys = samples_per_scanline
            .iter()
            .scan(0, |acc, &x| {
                let key = 2 * *acc + x;
                *acc += x;
                Some(key)
            })
            .collect_vec();

        let w = total / size;
        let k = total % size;

        let mut bins = Vec::<usize>::with_capacity(size);

        for p in 1..=size {
            if p <= k {
                bins.push(2 * (p - 1) * (1 + w));
            } else {
                bins.push(2 * ((p - 1) * w + k));
            }
        }

        let counts = sort_to_bins(&keys, &bins);

        let mut start = 0;
        self.boundaries.clear();
        self.boundaries.push(start);
        for count in counts {
            start += count;
            self.boundaries.push(start);
        }

        debug_assert_eq!(*self.boundaries.last().unwrap(), self.height);
    }

    /// Number of partitions.
    pub fn num_partitions(&self) -> usize {
        self.boundaries.len() - 1
    }

    /// Width of the partitioned image.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height of the partitioned image.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Scanline range `(start, end)` of partition `partition`, end exclusive.
    pub fn partition_extents(&self, partition: usize) -> (usize, usize) {
        (self.boundaries[partition], self.boundaries[partition + 1])
    }

    /// The partition owning scanline `scanline`.
    pub fn partition_for_scanline(&self, scanline: usize) -> usize {
        assert!(scanline < self.height);
        // The first partition ending after the scanline. Empty partitions end
        // where they start and are skipped that way.
        self.boundaries[1..].partition_point(|&end| end <= scanline)
    }
}

#[cfg(test)]
mod test {
    use super::ImagePartition;

    fn assert_covers(partition: &ImagePartition) {
        let mut expected_start = 0;
        for p in 0..partition.num_partitions() {
            let (start, end) = partition.partition_extents(p);
            assert_eq!(start, expected_start);
            assert!(end >= start);
            for scanline in start..end {
                assert_eq!(partition.partition_for_scanline(scanline), p);
            }
            expected_start = end;
        }
        assert_eq!(expected_start, partition.height());
    }

    #[test]
    fn test_uniform_partition() {
        let partition = ImagePartition::new(10, 10, 3);
        assert_eq!(partition.partition_extents(0), (0, 4));
        assert_eq!(partition.partition_extents(1), (4, 7));
        assert_eq!(partition.partition_extents(2), (7, 10));
        assert_covers(&partition);
    }

    #[test]
    fn test_more_partitions_than_scanlines() {
        let partition = ImagePartition::new(4, 2, 4);
        assert_eq!(partition.num_partitions(), 4);
        assert_covers(&partition);
    }

    #[test]
    fn test_balanced_partition() {
        let mut partition = ImagePartition::new(8, 8, 2);
        // Almost all samples sit in the first two scanlines.
        partition.establish_partition_boundaries(&[50, 50, 1, 1, 1, 1, 1, 1]);
        assert_eq!(partition.partition_extents(0), (0, 1));
        assert_eq!(partition.partition_extents(1), (1, 8));
        assert_covers(&partition);
    }

    #[test]
    fn test_zero_estimate_keeps_uniform() {
        let mut partition = ImagePartition::new(8, 8, 2);
        partition.establish_partition_boundaries(&[0; 8]);
        assert_eq!(partition, ImagePartition::new(8, 8, 2));
    }
}
