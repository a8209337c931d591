//! The communication free half of direct-send compositing.
//!
//! Each patch is cut along the region boundaries and every piece is sent to
//! the owner of its region. The owner blends the pieces it receives in a fixed
//! order, see [ImagePatch::compositing_order], so the result does not depend
//! on the order in which messages arrive.

use crate::{
    compositor::{
        region::{Region, RegionTable},
        BlendOrder,
    },
    constants::{CHANNELS, DIRECT_SEND_VERSION, PATCH_HEADER_LEN},
    error::{RenderError, Result},
    image::{Extents, Image, ImagePatch},
};

/// A piece of a local patch and the rank that composites it.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchSend {
    /// Owner of the region the piece falls into.
    pub target: usize,
    /// The piece, clipped to the region.
    pub patch: ImagePatch,
}

/// Cut the local patches along the regions of `regions`.
///
/// Pieces are ordered by target rank. Patches outside of the image are dropped.
pub fn plan_direct_send(patches: &[ImagePatch], regions: &RegionTable) -> Vec<PatchSend> {
    let mut sends = Vec::new();

    for patch in patches {
        let Some((first, last)) = regions.find_regions_for_patch(patch.extents()) else {
            continue;
        };
        for (target, region) in regions.regions()[first..=last].iter().enumerate() {
            if let Some(piece) = patch.clip_rows(region.start, region.end) {
                sends.push(PatchSend {
                    target: first + target,
                    patch: piece,
                });
            }
        }
    }

    sends.sort_by_key(|send| send.target);
    sends
}

/// Blend the pieces received for `region` into an image of the region.
///
/// The pieces are sorted into compositing order first. If a background is
/// given the result is made opaque over it.
pub fn composite_region(
    region: &Region,
    width: usize,
    mut patches: Vec<ImagePatch>,
    order: BlendOrder,
    background: Option<[f32; 3]>,
) -> Image {
    let mut image = Image::new(region.extents(width));
    patches.sort_by(|a, b| a.compositing_order(b));

    match order {
        BlendOrder::FrontToBack => {
            for patch in &patches {
                image.blend_front_to_back(patch.extents(), patch.data());
            }
        }
        BlendOrder::BackToFront => {
            for patch in patches.iter().rev() {
                image.blend_back_to_front(patch.extents(), patch.data());
            }
        }
    }

    if let Some(background) = background {
        image.blend_with_background(background);
    }

    image
}

/// Header sent ahead of the pixels of a patch.
///
/// `[version, xmin, xmax, ymin, ymax, origin_rank, patch_index, depth bits]`
pub fn encode_header(patch: &ImagePatch) -> [i32; PATCH_HEADER_LEN] {
    let [xmin, xmax, ymin, ymax] = patch.extents().to_array();
    [
        DIRECT_SEND_VERSION,
        xmin,
        xmax,
        ymin,
        ymax,
        patch.origin_rank() as i32,
        patch.patch_index() as i32,
        patch.depth().to_bits() as i32,
    ]
}

/// Rebuild a patch from its header and pixels.
pub fn decode_header(header: &[i32], data: Vec<f32>) -> Result<ImagePatch> {
    if header.len() != PATCH_HEADER_LEN {
        return Err(RenderError::MalformedMessage(format!(
            "patch header has {} entries instead of {}",
            header.len(),
            PATCH_HEADER_LEN
        )));
    }
    if header[0] != DIRECT_SEND_VERSION {
        return Err(RenderError::MalformedMessage(format!(
            "unsupported direct-send version {}",
            header[0]
        )));
    }

    let extents = Extents::new(header[1], header[2], header[3], header[4]);
    let ordered = extents.xmin <= extents.xmax && extents.ymin <= extents.ymax;
    if !ordered || header[5] < 0 || header[6] < 0 {
        return Err(RenderError::MalformedMessage(format!(
            "invalid patch header {:?}",
            header
        )));
    }
    if data.len() != extents.num_pixels() * CHANNELS {
        return Err(RenderError::MalformedMessage(format!(
            "patch with extents {:?} carries {} values",
            extents,
            data.len()
        )));
    }

    Ok(ImagePatch::new(
        extents,
        f32::from_bits(header[7] as u32),
        header[5] as usize,
        header[6] as usize,
        data,
    ))
}
