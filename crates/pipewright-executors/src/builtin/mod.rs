pub mod ai;
pub mod code;
pub mod input;
pub mod network;
pub mod output;
pub mod relational;
pub mod text;
pub mod transform;
pub mod util;
