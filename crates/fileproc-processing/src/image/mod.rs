pub mod resize;

pub use resize::{ImageResizer, ResizeError};
