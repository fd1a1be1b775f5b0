#![warn(missing_docs)]

//! SLIM routing node: a message processor with no local endpoint that serves
//! and dials the links listed in its configuration.

pub mod config;
pub mod node;

pub use config::NodeConfig;
pub use node::Node;
