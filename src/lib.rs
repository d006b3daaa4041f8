//! Supervisor for a single hosted application instance that runs a plugin
//! under development.
//!
//! [`InstanceSupervisor::run`] checks that no instance is active, validates
//! the plugin location and listen port, spawns the instance with a shaped
//! environment, and waits for the startup line announcing its address.
//! [`InstanceSupervisor::terminate`] force-kills it again.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod logging;
pub mod output;
pub mod port;
pub mod process;
pub mod readiness;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use descriptor::{PackageJsonChecker, PluginDescriptor, PluginDescriptorChecker};
pub use error::{Result, SupervisorError};
pub use output::{OutputLine, OutputStream};
pub use port::{PortProbe, TcpPortProbe};
pub use process::{InspectOptions, LaunchSpec, ProcessHost, TokioProcessHost};
pub use supervisor::{InstanceStatus, InstanceSupervisor, RunOptions};
pub use url::Url;
