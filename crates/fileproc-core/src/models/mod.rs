pub mod file;
pub mod processed_output;
pub mod task;

pub use file::*;
pub use processed_output::*;
pub use task::*;
