pub mod augmentations;
pub mod dataset;
pub mod model;

pub use augmentations::{AugmentationPolicy, AugmentationTier, PixelBuffer, Pipeline, eval_pipeline};
pub use dataset::{Batch, Dropped, Sample, SampledDataset, collate};
pub use model::{ModelError, ModelFactory, ModelIdentity, ModelState, parse_architecture};
