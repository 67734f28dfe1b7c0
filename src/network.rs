mod builder;
pub use builder::{ConvOptions, GraphCnnNetwork, LayerOptions};

mod description;
pub use description::{LayerSpec, NetworkDescription};
