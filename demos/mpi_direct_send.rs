//! Composite random patches of all ranks by direct send and compare the
//! result on rank 0 with a sequential blend of all patches.

use clap::Parser;
use itertools::Itertools;
use log::{info, LevelFilter};
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};
use mpi::traits::Communicator;
use ray_composite::{
    compositor::{BlendOrder, CompositorConfig, ImageCompositor, StrategyRequest},
    image::ImagePatch,
    tools::{generate_random_patch, seeded_rng},
};

#[derive(Parser, Debug)]
#[command(version, about = "Direct send compositing of random patches")]
struct Cli {
    /// Width of the final image.
    #[arg(long, default_value_t = 64)]
    width: usize,
    /// Height of the final image.
    #[arg(long, default_value_t = 48)]
    height: usize,
    /// Number of patches per rank.
    #[arg(long, short, default_value_t = 3)]
    patches: usize,
    /// Seed of the patch generator.
    #[arg(long, default_value_t = 0)]
    seed: usize,
    /// Blend order, `front-to-back` or `back-to-front`.
    #[arg(long, default_value = "front-to-back")]
    blend: BlendOrder,
    /// Also write the log to this file.
    #[arg(long)]
    log: Option<String>,
}

fn init_logging(log: Option<String>) -> log4rs::Handle {
    let level = LevelFilter::Info;
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{l} {M} - {m}\n")))
        .build();

    let mut builder = Config::builder().appender(
        Appender::builder()
            .filter(Box::new(ThresholdFilter::new(level)))
            .build("stderr", Box::new(stderr)),
    );
    let mut root = Root::builder().appender("stderr");

    if let Some(log) = log {
        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{l} {M} - {m}\n")))
            .build(log)
            .unwrap();
        builder = builder.appender(Appender::builder().build("logfile", Box::new(logfile)));
        root = root.appender("logfile");
    }

    let config = builder.build(root.build(LevelFilter::Debug)).unwrap();
    log4rs::init_config(config).unwrap()
}

fn patches_of(rank: usize, cli: &Cli) -> Vec<ImagePatch> {
    let mut rng = seeded_rng(cli.seed + rank);
    (0..cli.patches)
        .map(|index| generate_random_patch(cli.width, cli.height, rank, index, &mut rng))
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

    // Only rank 0 reports.
    let _handle = if rank == 0 {
        Some(init_logging(cli.log.clone()))
    } else {
        None
    };

    let config = CompositorConfig {
        strategy: StrategyRequest::DirectSend,
        blend_order: cli.blend,
        background: [0.1, 0.1, 0.1],
    };

    let mut compositor = ImageCompositor::new(config, cli.width, cli.height);
    let result = compositor
        .composite(patches_of(rank, &cli), &comm)
        .unwrap()
        .cloned();

    if let Some(image) = result {
        // Every patch can be regenerated from the seed of its rank.
        let all = (0..size).flat_map(|r| patches_of(r, &cli)).collect_vec();
        let mut reference = ImageCompositor::new(config, cli.width, cli.height);
        let expected = reference.composite_local(all);

        let max_diff = image
            .data()
            .iter()
            .zip(expected.data())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max);

        assert!(max_diff < 1e-5);
        info!(
            "Direct send on {} ranks matches the sequential blend, maximum difference {}.",
            size, max_diff
        );
    }
}
