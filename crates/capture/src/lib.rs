pub mod autofocus;
pub mod commands;
pub mod config;
pub mod device;
pub mod distributor;
pub mod errors;
pub mod frame_server;
pub mod picture;
pub mod pipeline;
pub mod request;
pub mod synthetic;
pub mod types;
pub mod zoom;

pub use autofocus::{AfState, AutofocusController, ScanOutcome};
pub use config::PipelineConfig;
pub use distributor::{ConsumerEvent, ConsumerFilter, FrameConsumer, FrameLease};
pub use errors::{CaptureError, DeviceError};
pub use picture::{ImageSaver, Picture, PictureTaker};
pub use pipeline::CapturePipeline;
pub use synthetic::SyntheticDevice;
pub use zoom::ZoomState;
