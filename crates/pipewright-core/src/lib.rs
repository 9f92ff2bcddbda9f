pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{PipewrightError, Result};
pub use event::EventBus;
pub use graph::{GraphDefinition, InputRef, Node, NodeCategory, NodeConfig, NodeKind, OutputRef};
pub use types::*;
