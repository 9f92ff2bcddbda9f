pub mod builtin;
pub mod generator;
pub mod registry;

pub use generator::HttpTextGenerator;
pub use registry::ExecutorRegistry;
