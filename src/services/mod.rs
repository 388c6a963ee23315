pub mod credentials;
pub mod gemini_client;
pub mod generation;
pub mod history;
pub mod media;

pub use credentials::*;
pub use gemini_client::*;
pub use generation::*;
pub use history::*;
pub use media::*;
