#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // No need for defaults in the internal types.
    clippy::new_without_default,
    // Matches are good and extendable, no need to make an exception here.
    clippy::single_match,
)]
#![warn(trivial_casts, trivial_numeric_casts, unused_qualifications)]

pub mod accel;
pub mod binding;
pub mod camera;
pub mod geometry;
pub mod gpu;
pub mod pipeline;
pub mod renderer;
pub mod sbt;
pub mod scene;

pub use camera::Camera;
pub use renderer::{Renderer, RendererDesc, ShaderPaths};
pub use scene::{GeometryChunk, ImageData, MaterialDesc, Scene, Vertex};
