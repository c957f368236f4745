pub mod classifier;
pub mod cluster;
pub mod direct;
pub mod merge;
pub mod types;

pub use cluster::{ClusterOutcome, discover, endpoint_priority, reference_ips};
pub use direct::{DirectOutcome, DirectQueryConfig, poll_known_addresses, polling_list};
pub use merge::merge;
pub use types::*;
