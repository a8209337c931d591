//! Sort-last compositing of the image patches of all ranks.
//!
//! Three strategies are available:
//! - [Strategy::OneNode] for a single rank, the local patches are blended directly.
//! - [Strategy::DirectSend] splits the final image into one band of scanlines
//!   per rank. Every rank sends the parts of its patches to the owners of the
//!   bands they overlap, the owners blend and the bands are gathered on rank 0.
//! - [Strategy::IceT] requires exactly one tile per rank. Tiles are merged by
//!   binary swap when the number of ranks is a power of two and by a reduction
//!   to rank 0 otherwise.
//!
//! The rounds of binary swap are planned by [binary_swap_schedule]. The MPI
//! transport lives in [parallel].
mod binary_swap;
mod direct_send;
#[cfg(feature = "mpi")]
pub mod parallel;
mod region;

use std::{env, str::FromStr};

use log::debug;

pub use binary_swap::{binary_swap_schedule, depth_order, SwapRound};
pub use direct_send::{
    composite_region, decode_header, encode_header, plan_direct_send, PatchSend,
};
pub use region::{Region, RegionTable};

use crate::{
    error::{RenderError, Result},
    image::{Image, ImagePatch},
};

/// Environment variable selecting the compositing strategy.
pub const STRATEGY_VARIABLE: &str = "RAY_COMPOSITE_STRATEGY";

/// Environment variable selecting the blend order of direct send.
pub const BLEND_VARIABLE: &str = "RAY_COMPOSITE_BLEND";

/// The strategy asked for by the configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum StrategyRequest {
    /// One node for a single rank, direct send otherwise.
    #[default]
    Auto,
    /// Binary swap or reduction, one tile per rank.
    IceT,
    /// No compositing across ranks.
    OneNode,
    /// Direct send of patch pieces to band owners.
    DirectSend,
}

impl FromStr for StrategyRequest {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "icet" => Ok(Self::IceT),
            "onenode" | "one-node" => Ok(Self::OneNode),
            "directsend" | "direct-send" => Ok(Self::DirectSend),
            other => Err(RenderError::InvalidStrategy(format!(
                "unknown strategy '{}'",
                other
            ))),
        }
    }
}

/// A strategy whose preconditions hold for the current world.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Every rank contributes exactly one tile.
    IceT,
    /// There is a single rank.
    OneNode,
    /// Any number of patches per rank.
    DirectSend,
}

impl Strategy {
    /// Resolve `request` given the number of tiles of every rank.
    ///
    /// Fails if the requested strategy cannot be used.
    pub fn select(request: StrategyRequest, tiles_per_rank: &[usize]) -> Result<Self> {
        let num_ranks = tiles_per_rank.len();
        if num_ranks == 0 {
            return Err(RenderError::InvalidStrategy("no ranks".to_string()));
        }

        match request {
            StrategyRequest::Auto if num_ranks == 1 => Ok(Self::OneNode),
            StrategyRequest::Auto | StrategyRequest::DirectSend => Ok(Self::DirectSend),
            StrategyRequest::OneNode => {
                if num_ranks == 1 {
                    Ok(Self::OneNode)
                } else {
                    Err(RenderError::InvalidStrategy(format!(
                        "one node compositing with {} ranks",
                        num_ranks
                    )))
                }
            }
            StrategyRequest::IceT => {
                if Self::icet_valid(tiles_per_rank) {
                    Ok(Self::IceT)
                } else {
                    Err(RenderError::InvalidStrategy(format!(
                        "IceT needs one tile per rank, got {:?}",
                        tiles_per_rank
                    )))
                }
            }
        }
    }

    /// Return true if every rank has exactly one tile.
    pub fn icet_valid(tiles_per_rank: &[usize]) -> bool {
        tiles_per_rank.iter().all(|&tiles| tiles == 1)
    }
}

/// Which algebraic form of the over operator is used per band.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlendOrder {
    /// Visit patches nearest first.
    #[default]
    FrontToBack,
    /// Visit patches farthest first.
    BackToFront,
}

impl FromStr for BlendOrder {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "front-to-back" | "ftb" => Ok(Self::FrontToBack),
            "back-to-front" | "btf" => Ok(Self::BackToFront),
            other => Err(RenderError::InvalidStrategy(format!(
                "unknown blend order '{}'",
                other
            ))),
        }
    }
}

/// Settings of an [ImageCompositor].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CompositorConfig {
    /// Requested strategy.
    pub strategy: StrategyRequest,
    /// Blend order used by direct send.
    pub blend_order: BlendOrder,
    /// Opaque color behind all patches.
    pub background: [f32; 3],
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyRequest::Auto,
            blend_order: BlendOrder::FrontToBack,
            background: [0.0; 3],
        }
    }
}

impl CompositorConfig {
    /// Read the configuration from [STRATEGY_VARIABLE] and [BLEND_VARIABLE].
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [CompositorConfig::from_env] but with a custom variable lookup.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(STRATEGY_VARIABLE) {
            config.strategy = value.parse()?;
        }
        if let Some(value) = lookup(BLEND_VARIABLE) {
            config.blend_order = value.parse()?;
        }
        debug!("compositor configuration: {:?}", config);
        Ok(config)
    }
}

/// Composites the patches of all ranks into a final image of fixed size.
///
/// The final image is overwritten by every composite.
pub struct ImageCompositor {
    config: CompositorConfig,
    width: usize,
    height: usize,
    final_image: Option<Image>,
}

impl ImageCompositor {
    /// Create a compositor for a `width x height` image.
    pub fn new(config: CompositorConfig, width: usize, height: usize) -> Self {
        Self {
            config,
            width,
            height,
            final_image: None,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    /// Width of the final image.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height of the final image.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Change the size of the final image. A previous image of another size is dropped.
    pub fn set_window_size(&mut self, width: usize, height: usize) {
        if (width, height) != (self.width, self.height) {
            self.width = width;
            self.height = height;
            self.final_image = None;
        }
    }

    /// The result of the last composite, if this rank holds it.
    pub fn final_image(&self) -> Option<&Image> {
        self.final_image.as_ref()
    }

    /// Take the result of the last composite.
    pub fn take_final_image(&mut self) -> Option<Image> {
        self.final_image.take()
    }

    /// Blend `patches` over the full image without any communication.
    pub fn composite_local(&mut self, patches: Vec<ImagePatch>) -> &Image {
        let image = self.composite_sequential(patches);
        self.final_image.insert(image)
    }

    fn full_region(&self) -> Region {
        Region {
            start: 0,
            end: self.height as i32,
        }
    }

    fn composite_sequential(&self, patches: Vec<ImagePatch>) -> Image {
        composite_region(
            &self.full_region(),
            self.width,
            patches,
            self.config.blend_order,
            Some(self.config.background),
        )
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::{
        BlendOrder, CompositorConfig, ImageCompositor, Strategy, StrategyRequest, BLEND_VARIABLE,
        STRATEGY_VARIABLE,
    };
    use crate::{
        error::RenderError,
        image::{Extents, ImagePatch},
    };

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            Strategy::select(StrategyRequest::Auto, &[3]).unwrap(),
            Strategy::OneNode
        );
        assert_eq!(
            Strategy::select(StrategyRequest::Auto, &[1, 1]).unwrap(),
            Strategy::DirectSend
        );
        assert_eq!(
            Strategy::select(StrategyRequest::IceT, &[1, 1, 1]).unwrap(),
            Strategy::IceT
        );
        assert!(matches!(
            Strategy::select(StrategyRequest::IceT, &[1, 2, 1]),
            Err(RenderError::InvalidStrategy(_))
        ));
        assert!(Strategy::select(StrategyRequest::OneNode, &[1, 1]).is_err());
        assert!(Strategy::select(StrategyRequest::DirectSend, &[]).is_err());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars = HashMap::from([
            (STRATEGY_VARIABLE, "IceT".to_string()),
            (BLEND_VARIABLE, "back-to-front".to_string()),
        ]);
        let config = CompositorConfig::from_lookup(|name| vars.get(name).cloned()).unwrap();
        assert_eq!(config.strategy, StrategyRequest::IceT);
        assert_eq!(config.blend_order, BlendOrder::BackToFront);

        let config = CompositorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, CompositorConfig::default());

        assert!(CompositorConfig::from_lookup(|_| Some("sideways".to_string())).is_err());
    }

    #[test]
    fn test_composite_local_overwrites() {
        let config = CompositorConfig {
            background: [0.0, 0.0, 1.0],
            ..Default::default()
        };
        let mut compositor = ImageCompositor::new(config, 2, 1);

        let red = vec![1.0, 0.0, 0.0, 1.0];
        let patch = ImagePatch::new(Extents::new(0, 1, 0, 1), 0.5, 0, 0, red);
        let image = compositor.composite_local(vec![patch]);
        assert_eq!(image.pixel(0, 0), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(image.pixel(1, 0), [0.0, 0.0, 1.0, 1.0]);

        let image = compositor.composite_local(Vec::new());
        assert_eq!(image.pixel(0, 0), [0.0, 0.0, 1.0, 1.0]);

        compositor.set_window_size(3, 1);
        assert!(compositor.final_image().is_none());
    }
}
