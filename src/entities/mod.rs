pub mod flavor;
pub mod image;
pub mod server;

pub use flavor::Flavor;
pub use image::Image;
pub use server::{Server, ServerState, ServerWatcher};
