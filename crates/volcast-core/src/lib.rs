pub mod config;
pub mod constants;
pub mod error;
pub mod math;
pub mod transfer;
pub mod types;

pub use config::{ConfigError, MapperConfig};
pub use error::RenderError;
pub use transfer::{ColorChannel, PiecewiseTransferFunction, TransferFunction};
pub use types::{
    BlendMode, Bounds, Camera, CroppingConfig, Extent, Interpolation, MaskKind, Plane,
    ScalarArray, Timestamp, Viewport, Volume, VolumeId, VolumeProperty,
};
