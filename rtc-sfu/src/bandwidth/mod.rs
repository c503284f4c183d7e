//! Outgoing bandwidth estimation and distribution.
//!
//! The [`RembClient`] turns REMB feedback from the receiver into an available
//! bitrate estimate; [`distribute`] splits that estimate across consumers by
//! priority and then lets them grab what is left layer by layer.

pub mod distributor;
pub mod remb_client;

pub use distributor::{distribute, LayerAllocator};
pub use remb_client::RembClient;
