//! Static assignment of scanline bands of the final image to ranks.

use itertools::Itertools;

use crate::{
    error::{RenderError, Result},
    image::Extents,
    tools::split,
};

/// A band of scanlines `start..end` of the final image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    /// First scanline.
    pub start: i32,
    /// One past the last scanline.
    pub end: i32,
}

impl Region {
    /// Number of scanlines.
    pub fn size(&self) -> i32 {
        self.end - self.start
    }

    /// Extents of the region in an image of the given width.
    pub fn extents(&self, width: usize) -> Extents {
        Extents::new(0, width as i32, self.start, self.end)
    }
}

/// The regions of the final image. Region `r` is owned by rank `r`.
///
/// Every rank computes the same table without communication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionTable {
    height: usize,
    regions: Vec<Region>,
}

impl RegionTable {
    /// Split `height` scanlines into contiguous regions for `num_ranks` ranks.
    ///
    /// There are never more regions than scanlines, so with more ranks than
    /// scanlines the trailing ranks own no region.
    pub fn compute_region_extents(num_ranks: usize, height: usize) -> Self {
        assert!(num_ranks > 0);
        let num_regions = num_ranks.min(height);
        if num_regions == 0 {
            return Self {
                height,
                regions: Vec::new(),
            };
        }

        let lines = (0..height as i32).collect_vec();
        let regions = split(&lines, num_regions)
            .map(|chunk| Region {
                start: chunk[0],
                end: chunk[chunk.len() - 1] + 1,
            })
            .collect_vec();

        Self { height, regions }
    }

    /// Restore a table from its flat `[start, end, size]` per region form.
    pub fn from_flat(flat: &[i32]) -> Result<Self> {
        if flat.len() % 3 != 0 {
            return Err(RenderError::MalformedMessage(format!(
                "region table of length {} is not a multiple of three",
                flat.len()
            )));
        }

        let mut expected_start = 0;
        let mut regions = Vec::with_capacity(flat.len() / 3);
        for chunk in flat.chunks_exact(3) {
            let region = Region {
                start: chunk[0],
                end: chunk[1],
            };
            if region.start != expected_start || region.size() != chunk[2] || region.size() <= 0 {
                return Err(RenderError::MalformedMessage(format!(
                    "invalid region {:?} with size {}",
                    region, chunk[2]
                )));
            }
            expected_start = region.end;
            regions.push(region);
        }

        Ok(Self {
            height: expected_start as usize,
            regions,
        })
    }

    /// The flat `[start, end, size]` per region form of the table.
    pub fn to_flat(&self) -> Vec<i32> {
        self.regions
            .iter()
            .flat_map(|region| [region.start, region.end, region.size()])
            .collect()
    }

    /// Number of regions.
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Height of the final image.
    pub fn height(&self) -> usize {
        self.height
    }

    /// All regions, top to bottom.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// The region owned by `rank`, if any.
    pub fn region(&self, rank: usize) -> Option<&Region> {
        self.regions.get(rank)
    }

    /// The region containing scanline `y`.
    pub fn region_for_scanline(&self, y: i32) -> Option<usize> {
        let index = self.regions.partition_point(|region| region.end <= y);
        self.regions
            .get(index)
            .filter(|region| region.start <= y)
            .map(|_| index)
    }

    /// First and last region overlapped by `extents`.
    ///
    /// Returns `None` if the patch is empty or lies outside of the image.
    pub fn find_regions_for_patch(&self, extents: &Extents) -> Option<(usize, usize)> {
        if extents.is_empty() {
            return None;
        }
        let ymin = extents.ymin.max(0);
        let ymax = extents.ymax.min(self.height as i32);
        if ymin >= ymax {
            return None;
        }

        let first = self.region_for_scanline(ymin)?;
        let last = self.region_for_scanline(ymax - 1)?;
        Some((first, last))
    }
}

#[cfg(test)]
mod test {
    use super::{Region, RegionTable};
    use crate::image::Extents;

    #[test]
    fn test_regions_cover_image() {
        for height in [1, 2, 7, 16, 33] {
            for num_ranks in 1..=height {
                let table = RegionTable::compute_region_extents(num_ranks, height);
                assert_eq!(table.num_regions(), num_ranks);

                let mut expected_start = 0;
                for region in table.regions() {
                    assert_eq!(region.start, expected_start);
                    assert!(region.size() > 0);
                    expected_start = region.end;
                }
                assert_eq!(expected_start as usize, height);

                for y in 0..height as i32 {
                    let r = table.region_for_scanline(y).unwrap();
                    let region = table.region(r).unwrap();
                    assert!(region.start <= y && y < region.end);
                }
            }
        }
    }

    #[test]
    fn test_more_ranks_than_scanlines() {
        let table = RegionTable::compute_region_extents(8, 3);
        assert_eq!(table.num_regions(), 3);
        assert!(table.region(5).is_none());
    }

    #[test]
    fn test_flat_form() {
        let table = RegionTable::compute_region_extents(3, 10);
        let flat = table.to_flat();
        assert_eq!(flat, vec![0, 4, 4, 4, 7, 3, 7, 10, 3]);
        assert_eq!(RegionTable::from_flat(&flat).unwrap(), table);
        assert!(RegionTable::from_flat(&[0, 4, 3]).is_err());
        assert!(RegionTable::from_flat(&[1, 4, 3]).is_err());
    }

    #[test]
    fn test_find_regions_for_patch() {
        let table = RegionTable::compute_region_extents(4, 8);
        assert_eq!(table.regions()[1], Region { start: 2, end: 4 });

        assert_eq!(table.find_regions_for_patch(&Extents::new(0, 5, 3, 6)), Some((1, 2)));
        assert_eq!(table.find_regions_for_patch(&Extents::new(0, 5, 4, 5)), Some((2, 2)));
        assert_eq!(table.find_regions_for_patch(&Extents::new(0, 5, -3, 20)), Some((0, 3)));
        assert_eq!(table.find_regions_for_patch(&Extents::new(0, 5, 8, 9)), None);
        assert_eq!(table.find_regions_for_patch(&Extents::new(2, 2, 0, 8)), None);
    }
}
