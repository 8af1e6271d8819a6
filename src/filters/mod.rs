pub mod particle;
pub mod resample;
pub mod ukf;
pub mod unscented;

pub use particle::{ParticleFilter, PfReport, PointEstimate, ScoreWeighting};
pub use resample::ResamplePolicy;
pub use ukf::{UkfReport, UnscentedKalmanFilter};
pub use unscented::{UnscentedParams, UnscentedTransform};
