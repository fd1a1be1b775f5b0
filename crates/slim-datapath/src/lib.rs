#![warn(missing_docs)]

//! SLIM datapath: hierarchical names, the routed message envelope, the
//! subscription/route fabric and the processor that moves messages between
//! connections and the local endpoint.

pub mod error;
pub mod fabric;
pub mod message;
pub mod metrics;
pub mod name;
pub mod processor;

pub use error::{DatapathError, Result};
pub use fabric::{Action, Fabric};
pub use message::{Message, MessageBody, BROADCAST, UNICAST};
pub use metrics::DatapathMetricsSnapshot;
pub use name::Name;
pub use processor::{Delivery, MessageProcessor};
