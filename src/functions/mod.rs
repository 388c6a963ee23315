pub mod api;
pub mod pipeline;

pub use api::*;
pub use pipeline::*;
