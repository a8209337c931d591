//! MPI transport of the compositor.

use itertools::{izip, Itertools};
use log::{debug, info};
use mpi::{
    request::{scope, WaitGuard},
    traits::{CommunicatorCollectives, Destination, Source},
};

use crate::{
    compositor::{
        binary_swap_schedule, composite_region, decode_header, depth_order, encode_header,
        plan_direct_send, ImageCompositor, RegionTable, Strategy,
    },
    constants::{BINARY_SWAP_TAG, CHANNELS, DIRECT_SEND_TAGS, PATCH_HEADER_LEN},
    error::{RenderError, Result},
    image::{Extents, Image, ImagePatch},
    tools::{gather_to_all, gather_to_root},
};

impl ImageCompositor {
    /// Composite the patches of all ranks.
    ///
    /// This is a collective operation. The strategy is resolved from the
    /// configuration and the number of patches on every rank. The final image
    /// ends up on rank 0, all other ranks return `None`.
    pub fn composite<C: CommunicatorCollectives>(
        &mut self,
        patches: Vec<ImagePatch>,
        comm: &C,
    ) -> Result<Option<&Image>> {
        let rank = comm.rank();

        let tiles_per_rank = gather_to_all(&[patches.len() as i32], comm)
            .into_iter()
            .map(|tiles| tiles as usize)
            .collect_vec();
        let strategy = Strategy::select(self.config.strategy, &tiles_per_rank)?;

        if rank == 0 {
            info!(
                "compositing {} patches on {} ranks with {:?}",
                tiles_per_rank.iter().sum::<usize>(),
                tiles_per_rank.len(),
                strategy
            );
        }

        self.final_image = match strategy {
            Strategy::OneNode => Some(self.composite_sequential(patches)),
            Strategy::DirectSend => self.composite_direct_send(&patches, comm)?,
            Strategy::IceT => {
                if comm.size().count_ones() == 1 {
                    self.composite_binary_swap(&patches[0], comm)?
                } else {
                    self.composite_reduce(&patches, comm)?
                }
            }
        };

        Ok(self.final_image.as_ref())
    }

    fn composite_direct_send<C: CommunicatorCollectives>(
        &self,
        patches: &[ImagePatch],
        comm: &C,
    ) -> Result<Option<Image>> {
        let rank = comm.rank() as usize;
        let regions = RegionTable::compute_region_extents(comm.size() as usize, self.height);

        let received = direct_send(patches, &regions, comm)?;

        let band = match regions.region(rank) {
            Some(region) => composite_region(
                region,
                self.width,
                received,
                self.config.blend_order,
                Some(self.config.background),
            ),
            None => Image::new(Extents::new(0, self.width as i32, 0, 0)),
        };

        gather_bands(&band, self.width, self.height, comm)
    }

    fn composite_binary_swap<C: CommunicatorCollectives>(
        &self,
        tile: &ImagePatch,
        comm: &C,
    ) -> Result<Option<Image>> {
        let mut band = binary_swap(tile, self.width, self.height, comm);
        band.blend_with_background(self.config.background);
        gather_bands(&band, self.width, self.height, comm)
    }

    fn composite_reduce<C: CommunicatorCollectives>(
        &self,
        patches: &[ImagePatch],
        comm: &C,
    ) -> Result<Option<Image>> {
        let headers = patches.iter().flat_map(encode_header).collect_vec();
        let data = patches
            .iter()
            .flat_map(|patch| patch.data().iter().copied())
            .collect_vec();

        let headers = gather_to_root(&headers, comm);
        let data = gather_to_root(&data, comm);

        let (Some(headers), Some(data)) = (headers, data) else {
            return Ok(None);
        };

        let mut offset = 0;
        let mut all = Vec::with_capacity(headers.len() / PATCH_HEADER_LEN);
        for header in headers.chunks_exact(PATCH_HEADER_LEN) {
            let extents = Extents::new(header[1], header[2], header[3], header[4]);
            let len = extents.num_pixels() * CHANNELS;
            if offset + len > data.len() {
                return Err(RenderError::MalformedMessage(
                    "gathered pixels do not match the patch headers".to_string(),
                ));
            }
            all.push(decode_header(header, data[offset..offset + len].to_vec())?);
            offset += len;
        }

        Ok(Some(self.composite_sequential(all)))
    }
}

/// Exchange the pieces of the local patches with the owners of their regions.
///
/// Counts are agreed first and all ranks meet at a barrier before the first
/// send. Every piece then travels as a header on `DIRECT_SEND_TAGS[0]`
/// followed by its pixels on `DIRECT_SEND_TAGS[1]`. Returns the pieces
/// received for the region of this rank.
pub fn direct_send<C: CommunicatorCollectives>(
    patches: &[ImagePatch],
    regions: &RegionTable,
    comm: &C,
) -> Result<Vec<ImagePatch>> {
    let size = comm.size() as usize;

    let sends = plan_direct_send(patches, regions);
    let headers = sends
        .iter()
        .map(|send| encode_header(&send.patch))
        .collect_vec();

    let mut counts = vec![0_i32; size];
    for send in &sends {
        counts[send.target] += 1;
    }
    let mut recv_counts = vec![0_i32; size];
    comm.all_to_all_into(&counts[..], &mut recv_counts[..]);

    // The region table and the counts are agreed on every rank.
    comm.barrier();

    let received = scope(|scope| {
        let mut header_guards = Vec::with_capacity(sends.len());
        let mut data_guards = Vec::with_capacity(sends.len());

        for (send, header) in izip!(sends.iter(), headers.iter()) {
            let process = comm.process_at_rank(send.target as i32);
            header_guards.push(WaitGuard::from(process.immediate_send_with_tag(
                scope,
                &header[..],
                DIRECT_SEND_TAGS[0],
            )));
            data_guards.push(WaitGuard::from(process.immediate_send_with_tag(
                scope,
                send.patch.data(),
                DIRECT_SEND_TAGS[1],
            )));
        }

        let mut received = Vec::with_capacity(recv_counts.iter().sum::<i32>() as usize);
        for (source, &count) in recv_counts.iter().enumerate() {
            let process = comm.process_at_rank(source as i32);
            for _ in 0..count {
                let (header, _) = process.receive_vec_with_tag::<i32>(DIRECT_SEND_TAGS[0]);
                let (data, _) = process.receive_vec_with_tag::<f32>(DIRECT_SEND_TAGS[1]);
                received.push(decode_header(&header, data));
            }
        }

        received
    });

    debug!(
        "rank {} sent {} pieces and received {}",
        comm.rank(),
        sends.len(),
        received.len()
    );

    received.into_iter().collect()
}

/// Binary swap over ranks ordered by the depth of their tiles.
///
/// The number of ranks must be a power of two. Returns the composited band of
/// scanlines this rank ends up owning.
pub fn binary_swap<C: CommunicatorCollectives>(
    tile: &ImagePatch,
    width: usize,
    height: usize,
    comm: &C,
) -> Image {
    let rank = comm.rank() as usize;

    let depths = gather_to_all(&[tile.depth()], comm);
    let order = depth_order(&depths);

    let mut current = Image::new(Extents::full(width, height));
    current.place_image(tile.extents(), tile.data());

    for round in binary_swap_schedule(rank, &order, width, height) {
        let (mut kept, outgoing) = round.split(&current);

        let process = comm.process_at_rank(round.partner as i32);
        let incoming = scope(|scope| {
            let _guard = WaitGuard::from(process.immediate_send_with_tag(
                scope,
                outgoing.data(),
                BINARY_SWAP_TAG,
            ));
            let (data, _) = process.receive_vec_with_tag::<f32>(BINARY_SWAP_TAG);
            data
        });

        round.merge(&mut kept, &incoming);
        current = kept;
    }

    current
}

/// Assemble the bands of all ranks into the full image on rank 0.
///
/// Bands must not overlap. Parts of the image covered by no band stay transparent.
pub fn gather_bands<C: CommunicatorCollectives>(
    band: &Image,
    width: usize,
    height: usize,
    comm: &C,
) -> Result<Option<Image>> {
    let extents = gather_to_root(&band.extents().to_array(), comm);
    let data = gather_to_root(band.data(), comm);

    let (Some(extents), Some(data)) = (extents, data) else {
        return Ok(None);
    };

    let mut image = Image::new(Extents::full(width, height));
    let mut offset = 0;
    for arr in extents.chunks_exact(4) {
        let extents = Extents::from_array([arr[0], arr[1], arr[2], arr[3]]);
        let len = extents.num_pixels() * CHANNELS;
        if offset + len > data.len() {
            return Err(RenderError::MalformedMessage(
                "gathered band pixels do not match their extents".to_string(),
            ));
        }
        image.place_image(&extents, &data[offset..offset + len]);
        offset += len;
    }

    Ok(Some(image))
}
