
pub mod error;
pub mod logging;
pub mod config;
pub mod codec;
pub mod digest;
pub mod modality;
pub mod container;
pub mod progress;
pub mod resample;
pub mod sino;
pub mod angles;
pub mod rotation;
pub mod algorithm;
pub mod cache;
pub mod pipeline;
pub mod artifact;
pub mod session;
pub mod commands;
