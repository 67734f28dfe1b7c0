mod graph;
pub use graph::*;

mod batch;
pub use batch::*;

mod loader;
pub use loader::*;
