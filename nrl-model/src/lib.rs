pub mod config;
pub mod context;
pub mod dataset;
pub mod error;
pub mod experiment;
pub mod layer;
pub mod network;
pub mod optimizer;
pub mod robot;
pub mod store;
pub mod trainer;
pub mod trajectory;
pub mod utils;

pub use config::ModelConfig;
pub use context::Context;
pub use dataset::Dataset;
pub use error::{ModelError, ModelResult};
pub use experiment::{ErrorRegression, ErrorRegressionConfig, OnlineSession, PostdictionReport};
pub use layer::{Layer, LayerConfig};
pub use network::{DataShape, Frame, Losses, Network, NetworkConfig, Sequence};
pub use optimizer::{Adam, Optimizable, Param, Slot};
pub use robot::JointLimits;
pub use trainer::{EpochReport, Trainer, TrainingConfig};
pub use utils::Noise;
