//! Sample cells onto distributed ray volumes and render an integration image.
//!
//! Every rank splats its share of the cells, the scanlines are partitioned by
//! the estimated sample load, samples and deferred cells are exchanged, each
//! rank integrates the rays of its band and the bands are composited on rank 0.

use std::{fs::File, io::Write, path::PathBuf};

use clap::Parser;
use itertools::Itertools;
use log::{info, LevelFilter};
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};
use mpi::{
    collective::SystemOperation,
    traits::{Communicator, CommunicatorCollectives},
};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use ray_composite::{
    cell_list::CellList,
    compositor::{CompositorConfig, ImageCompositor},
    context::RenderContext,
    extractor::PointExtractor,
    geometry::{Cell, PhysicalBox, SampleGrid},
    image::Extents,
    mesh::{bounding_box, load_cells},
    partition::ImagePartition,
    ray_function::{IntegrationRayFunction, PixelBuffer},
    tools::{redistribute_with_counts, seeded_rng, split},
    volume::Volume,
};

#[derive(Parser, Debug)]
#[command(version, about = "Distributed ray sampling and compositing")]
struct Cli {
    /// Width of the image.
    #[arg(long, default_value_t = 64)]
    width: usize,
    /// Height of the image.
    #[arg(long, default_value_t = 64)]
    height: usize,
    /// Samples per ray.
    #[arg(long, default_value_t = 32)]
    depth: usize,
    /// Number of random cells per rank.
    #[arg(long, default_value_t = 2000)]
    cells: usize,
    /// Seed of the cell generator.
    #[arg(long, default_value_t = 0)]
    seed: usize,
    /// Render the cells of this VTK file instead of random ones.
    #[arg(long)]
    mesh: Option<PathBuf>,
    /// Scalar array of the mesh to render.
    #[arg(long, default_value = "density")]
    variable: String,
    /// Write the composited image as PPM.
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// Write the raw integrals of all pixels.
    #[arg(long)]
    raw: Option<PathBuf>,
}

/// Cells clustered around a few random centres in the unit cube.
fn clustered_cells(cli: &Cli, rank: usize) -> Vec<Cell> {
    let mut rng = seeded_rng(cli.seed + rank);
    let centres = (0..4)
        .map(|_| [rng.gen_range(0.2..0.8), rng.gen_range(0.2..0.8), rng.gen_range(0.2..0.8)])
        .collect_vec();
    let spread = Normal::new(0.0, 0.08).unwrap();

    (0..cli.cells)
        .map(|index| {
            let centre = centres[index % centres.len()];
            let lower = centre.map(|c| num::clamp(c + spread.sample(&mut rng), 0.0, 0.95));
            let edge = rng.gen_range(0.005..0.05);
            Cell::new(
                PhysicalBox::new([
                    lower[0],
                    lower[1],
                    lower[2],
                    lower[0] + edge,
                    lower[1] + edge,
                    lower[2] + edge,
                ]),
                vec![rng.gen_range(0.0..10.0)],
            )
        })
        .collect_vec()
}

/// Send `messages[r]` to rank `r` and return the messages received from every rank.
fn exchange<C: CommunicatorCollectives>(messages: Vec<Vec<u8>>, comm: &C) -> Vec<Vec<u8>> {
    let counts = messages.iter().map(|m| m.len() as i32).collect_vec();
    let bytes = messages.concat();
    let (received, recv_counts) = redistribute_with_counts(&bytes, &counts, comm);

    let mut offset = 0;
    recv_counts
        .iter()
        .map(|&count| {
            let message = received[offset..offset + count as usize].to_vec();
            offset += count as usize;
            message
        })
        .collect_vec()
}

pub fn main() {
    let cli = Cli::parse();

    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let comm = universe.world();
    let rank = comm.rank() as usize;
    let size = comm.size() as usize;

    let _handle = if rank == 0 {
        let stderr = ConsoleAppender::builder()
            .target(Target::Stderr)
            .encoder(Box::new(PatternEncoder::new("{l} {M} - {m}\n")))
            .build();
        let config = Config::builder()
            .appender(Appender::builder().build("stderr", Box::new(stderr)))
            .build(Root::builder().appender("stderr").build(LevelFilter::Info))
            .unwrap();
        Some(log4rs::init_config(config).unwrap())
    } else {
        None
    };

    let (cells, bounds) = match &cli.mesh {
        Some(path) => {
            let all = load_cells(path, &cli.variable).unwrap();
            let bounds = bounding_box(&all).unwrap();
            let mine = split(&all, size).nth(rank).unwrap_or_default().to_vec();
            (mine, bounds)
        }
        None => (
            clustered_cells(&cli, rank),
            PhysicalBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
        ),
    };

    let (width, height, depth) = (cli.width, cli.height, cli.depth);
    let context = RenderContext::kernel_based();
    let grid = SampleGrid::new(bounds, width, height, depth);

    // First pass, small cells go straight onto the rays.
    let mut volume = Volume::new(width, height, depth, 2).unwrap();
    let mut extractor = PointExtractor::new(grid);
    extractor.set_defer_large_cells(true);
    extractor
        .extract_cells(&cells, &mut volume, &context)
        .unwrap();

    // Balance the scanlines by the samples of all ranks.
    let local_estimate = volume
        .estimate_number_of_samples_per_scanline()
        .into_iter()
        .zip(extractor.cell_list().estimate_number_of_samples_per_scanline(height))
        .map(|(rays, cells)| (rays + cells) as u64)
        .collect_vec();
    let mut estimate = vec![0_u64; height];
    comm.all_reduce_into(&local_estimate[..], &mut estimate[..], SystemOperation::sum());
    let estimate = estimate.into_iter().map(|e| e as usize).collect_vec();

    let mut partition = ImagePartition::new(width, height, size);
    partition.establish_partition_boundaries(&estimate);
    let (start, end) = partition.partition_extents(rank);

    let volume_messages = exchange(volume.construct_messages(&partition).unwrap(), &comm);
    let cell_messages = exchange(
        extractor.cell_list().construct_messages(&partition).unwrap(),
        &comm,
    );
    volume.destroy_samples();

    // Second pass on the band of this rank.
    let mut band = Volume::new(width, height, depth, 2).unwrap();
    if end > start {
        band.restrict(0, width - 1, start, end - 1);
        band.extract_samples(volume_messages.iter().map(|m| &m[..]), &context)
            .unwrap();
        let deferred = CellList::extract_cells(cell_messages.iter().map(|m| &m[..])).unwrap();
        extractor
            .extract_deferred(&deferred, &mut band, &context)
            .unwrap();
        band.finalize_rays(&context);
    }

    // Range of the rendered variable over all cells.
    let (local_min, local_max) = cells
        .iter()
        .map(|cell| cell.values()[0])
        .fold((f64::MAX, f64::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let mut min = 0.0;
    let mut max = 0.0;
    comm.all_reduce_into(&local_min, &mut min, SystemOperation::min());
    comm.all_reduce_into(&local_max, &mut max, SystemOperation::max());

    let distance = bounds.extent()[2];
    let mut function = IntegrationRayFunction::new(0, distance, min, max);
    function.set_window_size(width, height);
    let mut pixels = PixelBuffer::new(width, height);
    band.get_pixels(&mut function, &mut pixels);

    function.sum_across_ranks(&comm);
    if rank == 0 {
        if let Some(raw) = &cli.raw {
            function.output_raw_values(raw);
        }
    }

    let patches = if end > start {
        let extents = Extents::new(0, width as i32, start as i32, end as i32);
        vec![pixels.to_patch(extents, 0.5, rank, 0)]
    } else {
        Vec::new()
    };

    let config = CompositorConfig::from_env().unwrap();
    let mut compositor = ImageCompositor::new(config, width, height);
    let image = compositor.composite(patches, &comm).unwrap();

    if let Some(image) = image {
        info!(
            "rendered {} x {} pixels from the cells of {} ranks, variable range [{}, {}]",
            width, height, size, min, max
        );

        if let Some(output) = &cli.output {
            let mut file = File::create(output).unwrap();
            write!(file, "P6\n{} {}\n255\n", width, height).unwrap();
            file.write_all(&image.to_rgb8()).unwrap();
            info!("wrote {}", output.display());
        }
    }
}
