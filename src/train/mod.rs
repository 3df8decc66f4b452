//! Training configuration and update rule
//!
//! This module holds the population hyperparameters, an optimizer whose state
//! can be copied and persisted, and the SVG(0) update step.

pub mod config;
pub mod optim;
pub mod svg0;

pub use config::{DeviceChoice, PbtConfig};
pub use optim::Adam;
pub use svg0::{Svg0Updater, soft_update};
