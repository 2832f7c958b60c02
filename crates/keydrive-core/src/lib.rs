//! Core building blocks for keydrive.
//!
//! Parsing of the host's volume declarations, device and mount inspection,
//! and the two state machines that open the keys volume and activate every
//! managed drive with the key files stored on it.

pub mod cancel;
pub mod config;
pub mod crypttab;
pub mod error;
pub mod keyfile;
pub mod logging;
pub mod mounts;
pub mod resolver;
pub mod tabfile;
pub mod workflow;

pub use cancel::CancelToken;
pub use config::{HostPaths, KeydriveConfig, KeysDeviceCfg, ToolsCfg};
pub use error::{KeydriveError, KeydriveResult};
pub use workflow::{
    initialize_keys_device, DriveActivation, DriveActivator, Environment, KeysDeviceOptions,
    KeysDeviceSummary, LogObserver, WorkflowEvent, WorkflowLevel, WorkflowObserver, IMAGE_SIZE,
};
