//! Composite one random tile per rank with the IceT strategy.
//!
//! With a power of two number of ranks the tiles are merged by binary swap,
//! otherwise they are reduced to rank 0.

use clap::Parser;
use itertools::Itertools;
use log::{info, LevelFilter};
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};
use mpi::traits::Communicator;
use ray_composite::{
    compositor::{CompositorConfig, ImageCompositor, StrategyRequest},
    tools::{generate_random_patch, seeded_rng},
};

#[derive(Parser, Debug)]
#[command(version, about = "IceT style compositing of one tile per rank")]
struct Cli {
    /// Width of the final image.
    #[arg(long, default_value_t = 32)]
    width: usize,
    /// Height of the final image.
    #[arg(long, default_value_t = 32)]
    height: usize,
    /// Seed of the tile generator.
    #[arg(long, default_value_t = 7)]
    seed: usize,
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

    let tile_of = |r: usize| {
        let mut rng = seeded_rng(cli.seed + r);
        generate_random_patch(cli.width, cli.height, r, 0, &mut rng)
    };

    let config = CompositorConfig {
        strategy: StrategyRequest::IceT,
        background: [1.0, 1.0, 1.0],
        ..Default::default()
    };

    let mut compositor = ImageCompositor::new(config, cli.width, cli.height);
    let result = compositor
        .composite(vec![tile_of(rank)], &comm)
        .unwrap()
        .cloned();

    if let Some(image) = result {
        let all = (0..size).map(tile_of).collect_vec();
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
            "IceT compositing on {} ranks matches the sequential blend, maximum difference {}.",
            size, max_diff
        );
    }
}
