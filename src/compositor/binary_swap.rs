//! The communication free half of binary swap compositing.
//!
//! Ranks are enumerated front to back by the depth of their tile. In round
//! `k` a rank exchanges half of its current band with the rank whose virtual
//! rank differs in bit `k`. After `log2(size)` rounds every rank owns a
//! disjoint band of scanlines holding the blend of all tiles.

use itertools::Itertools;

use crate::image::{Extents, Image};

/// One exchange of a binary swap as seen from a single rank.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwapRound {
    /// Rank of the partner in this round.
    pub partner: usize,
    /// Rows this rank blends and keeps.
    pub keep: Extents,
    /// Rows this rank hands to the partner.
    pub give: Extents,
    /// True if the tiles merged so far on this rank lie in front of those of
    /// the partner.
    pub in_front: bool,
}

/// Ranks ordered front to back by tile depth, ties broken by rank.
pub fn depth_order(depths: &[f32]) -> Vec<usize> {
    (0..depths.len())
        .sorted_by(|&a, &b| depths[a].total_cmp(&depths[b]).then(a.cmp(&b)))
        .collect_vec()
}

/// The rounds of `rank` in a binary swap over a `width` x `height` image.
///
/// `order` lists the ranks front to back, see [depth_order]. Its length must
/// be a power of two.
pub fn binary_swap_schedule(
    rank: usize,
    order: &[usize],
    width: usize,
    height: usize,
) -> Vec<SwapRound> {
    let size = order.len();
    assert_eq!(size.count_ones(), 1);

    let virtual_rank = order
        .iter()
        .position(|&r| r == rank)
        .unwrap_or_default();

    let mut rounds = Vec::new();
    let mut lo = 0;
    let mut hi = height as i32;
    let mut bit = 1;

    while bit < size {
        let mid = lo + (hi - lo) / 2;
        let in_front = virtual_rank & bit == 0;
        let front = Extents::new(0, width as i32, lo, mid);
        let back = Extents::new(0, width as i32, mid, hi);
        let (keep, give) = if in_front {
            (front, back)
        } else {
            (back, front)
        };

        rounds.push(SwapRound {
            partner: order[virtual_rank ^ bit],
            keep,
            give,
            in_front,
        });
        (lo, hi) = (keep.ymin, keep.ymax);
        bit <<= 1;
    }

    rounds
}

impl SwapRound {
    /// Split `current` into the kept rows and the rows sent to the partner.
    pub fn split(&self, current: &Image) -> (Image, Image) {
        let mut kept = Image::new(self.keep);
        kept.place_image(current.extents(), current.data());
        let mut outgoing = Image::new(self.give);
        outgoing.place_image(current.extents(), current.data());
        (kept, outgoing)
    }

    /// Blend the rows received from the partner into `kept`.
    pub fn merge(&self, kept: &mut Image, incoming: &[f32]) {
        if self.in_front {
            kept.blend_front_to_back(&self.keep, incoming);
        } else {
            kept.blend_back_to_front(&self.keep, incoming);
        }
    }
}

#[cfg(test)]
mod test {
    use assert_approx_eq::assert_approx_eq;
    use itertools::Itertools;
    use rand::seq::SliceRandom;

    use super::{binary_swap_schedule, depth_order, SwapRound};
    use crate::{
        compositor::{CompositorConfig, ImageCompositor},
        image::{Extents, Image, ImagePatch},
        tools::{generate_random_patch, seeded_rng},
    };

    fn check_schedule(size: usize, width: usize, height: usize) {
        let mut rng = seeded_rng(size);
        let mut order = (0..size).collect_vec();
        order.shuffle(&mut rng);

        let schedules = (0..size)
            .map(|rank| binary_swap_schedule(rank, &order, width, height))
            .collect_vec();

        for (rank, rounds) in schedules.iter().enumerate() {
            assert_eq!(rounds.len(), size.trailing_zeros() as usize);

            let mut band = Extents::full(width, height);
            for (index, round) in rounds.iter().enumerate() {
                assert_ne!(round.partner, rank);

                // Both sides agree on the exchange.
                let other = &schedules[round.partner][index];
                assert_eq!(other.partner, rank);
                assert_eq!(other.keep, round.give);
                assert_eq!(other.give, round.keep);
                assert_ne!(other.in_front, round.in_front);

                // The band is halved along its rows.
                assert_eq!(round.keep.ymin.min(round.give.ymin), band.ymin);
                assert_eq!(round.keep.ymax.max(round.give.ymax), band.ymax);
                assert_eq!(round.keep.height() + round.give.height(), band.height());
                band = round.keep;
            }
        }

        // The final bands cover every row exactly once.
        let mut covered = vec![0; height];
        for rounds in &schedules {
            let band = rounds.last().unwrap().keep;
            for row in band.ymin..band.ymax {
                covered[row as usize] += 1;
            }
        }
        assert!(covered.iter().all(|&count| count == 1));
    }

    #[test]
    fn test_schedule_four_ranks() {
        check_schedule(4, 8, 16);
        check_schedule(4, 5, 7);
    }

    #[test]
    fn test_schedule_eight_ranks() {
        check_schedule(8, 8, 32);
        check_schedule(8, 3, 13);
    }

    #[test]
    fn test_front_rank_keeps_the_top_half() {
        let order = [2, 0, 3, 1];
        let rounds = binary_swap_schedule(2, &order, 4, 8);

        assert_eq!(
            rounds[0],
            SwapRound {
                partner: 0,
                keep: Extents::new(0, 4, 0, 4),
                give: Extents::new(0, 4, 4, 8),
                in_front: true,
            }
        );
        assert_eq!(
            rounds[1],
            SwapRound {
                partner: 3,
                keep: Extents::new(0, 4, 0, 2),
                give: Extents::new(0, 4, 2, 4),
                in_front: true,
            }
        );
    }

    #[test]
    fn test_depth_order_breaks_ties_by_rank() {
        assert_eq!(depth_order(&[0.5, 0.1, 0.5, 0.3]), vec![1, 3, 0, 2]);
    }

    /// Run all ranks of a binary swap in lockstep within one process.
    fn swap_in_process(tiles: &[ImagePatch], width: usize, height: usize) -> Vec<Image> {
        let size = tiles.len();
        let order = depth_order(&tiles.iter().map(|tile| tile.depth()).collect_vec());
        let schedules = (0..size)
            .map(|rank| binary_swap_schedule(rank, &order, width, height))
            .collect_vec();

        let mut current = tiles
            .iter()
            .map(|tile| {
                let mut image = Image::new(Extents::full(width, height));
                image.place_image(tile.extents(), tile.data());
                image
            })
            .collect_vec();

        for index in 0..schedules[0].len() {
            let (mut kept, outgoing): (Vec<_>, Vec<_>) = (0..size)
                .map(|rank| schedules[rank][index].split(&current[rank]))
                .unzip();
            for (rank, image) in kept.iter_mut().enumerate() {
                let round = &schedules[rank][index];
                round.merge(image, outgoing[round.partner].data());
            }
            current = kept;
        }

        current
    }

    fn check_against_sequential(size: usize, width: usize, height: usize) {
        let mut rng = seeded_rng(10 + size);
        let tiles = (0..size)
            .map(|rank| generate_random_patch(width, height, rank, 0, &mut rng))
            .collect_vec();

        let config = CompositorConfig::default();
        let mut reference = ImageCompositor::new(config, width, height);
        let expected = reference.composite_local(tiles.clone()).clone();

        for mut band in swap_in_process(&tiles, width, height) {
            band.blend_with_background(config.background);
            let extents = *band.extents();
            for y in extents.ymin..extents.ymax {
                for x in extents.xmin..extents.xmax {
                    let actual = band.pixel(x, y);
                    let wanted = expected.pixel(x, y);
                    for c in 0..4 {
                        assert_approx_eq!(actual[c], wanted[c], 1e-5);
                    }
                }
            }
        }
    }

    #[test]
    fn test_swap_matches_sequential_blend_four_ranks() {
        check_against_sequential(4, 12, 10);
    }

    #[test]
    fn test_swap_matches_sequential_blend_eight_ranks() {
        check_against_sequential(8, 9, 17);
    }
}
