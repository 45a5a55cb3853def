//! kiln: a frame-scoped Vulkan render graph.
//!
//! Applications record graphics and compute passes every frame through
//! [`Renderer`]; at `end_frame` the graph resolves render passes,
//! framebuffers, and pipelines through time-keyed caches, plans image
//! layout transitions, records one command buffer per pass, chains
//! submissions through explicit 64-bit dependency masks, and presents the
//! swap-chain image.
//!
//! The engine is reverse-depth throughout: [`perspective`] maps the near
//! plane to clip z = 1 and the far plane to 0, pipelines compare depth
//! with GREATER, and depth attachments clear to 0.

pub mod buffer;
pub mod command_buffer;
pub mod data;
pub mod device;
pub mod frame;
pub mod framebuffer;
pub mod graph;
pub mod graveyard;
pub mod math;
pub mod memory;
pub mod mpmc;
pub mod pipeline;
pub mod pool;
pub mod program;
pub mod render_pass;
pub mod renderer;
pub mod resource;
pub mod sampler;
pub mod spirv;
pub mod texture;
pub mod types;
pub mod utils;

pub use data::DataProvider;
pub use math::{orthographic, pack_color, perspective, unpack_color, ColorPacked, ColorUnpacked};
pub use renderer::{Renderer, RendererInfo};
pub use types::*;
