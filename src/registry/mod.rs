//! Sharded registry of live connections and their group memberships.

mod bucket;
mod connection;
mod group;

pub use bucket::{Bucket, BucketOptions, GroupBroadcast};
pub use connection::{Connection, Delivery, OfferError, Outbound, QueueDepths};
pub use group::{GroupError, GroupNode, MemberHandle, Removal};
