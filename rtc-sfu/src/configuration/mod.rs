//! Configuration of a [`WebRtcTransport`](crate::transport::WebRtcTransport).
//!
//! All tunables live in [`SettingEngine`]; the defaults reproduce the
//! behavior expected from a production SFU and rarely need changing.

pub mod setting_engine;

pub use setting_engine::{LayerTuning, RembSettings, SettingEngine};
