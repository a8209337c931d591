//! Ray sampling volumes and sort-last parallel image compositing.
//!
//! Cells are splatted onto the rays of a [volume::Volume] by a
//! [extractor::PointExtractor], ray samples are redistributed between ranks
//! along an [partition::ImagePartition], turned into pixels by a
//! [ray_function::RayFunction] and the resulting patches of all ranks are
//! merged by the [compositor::ImageCompositor].
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod cell_list;
pub mod compositor;
pub mod constants;
pub mod context;
pub mod error;
pub mod extractor;
pub mod geometry;
pub mod image;
pub mod memory;
pub mod mesh;
pub mod partition;
pub mod ray;
pub mod ray_function;
pub mod tools;
pub mod volume;
