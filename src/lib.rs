//! Surgical tool pose tracking from robot kinematics and stereo vision
//!
//! A kinematic coarse guess from the joint encoders is refined every frame by
//! an unscented Kalman filter, a particle filter, or both, against an external
//! render-and-score oracle. See [`tracker::ToolTracker`] for the per-frame entry
//! point and [`filters`] for the estimators themselves.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod filters;
pub mod health_monitor;
pub mod live_status;
pub mod motion_model;
pub mod parallel;
pub mod pose;
pub mod replay;
pub mod rerun_logger;
pub mod tracker;
pub mod types;

pub use config::TrackerConfig;
pub use error::{NumericalCondition, TrackResult, TrackingError};
pub use tracker::{EstimatorMode, ToolTracker, TrackingEvent, TrackingSnapshot};
