pub mod config;
pub mod controller;
pub mod process;
pub mod registry;
pub mod tree;

pub use config::{load_settings, ApparatusConfig, Settings};
pub use controller::{Controller, DispatchError};
pub use process::{MissingProcessManager, ProcessManager};
pub use registry::{
    ConfigSaver, FileConfigSaver, Logbook, MissingConfigSaver, MissingRunNumberSource,
    NullLogbook, RunNumberSource, SequentialRunNumbers,
};
pub use tree::{
    Apparatus, BroadcastReport, CommandOutcome, FailureKind, NodeFailure, NodeKind, NodeStatus,
};
