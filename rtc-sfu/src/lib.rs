#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! Sans-I/O media relay core of a selective forwarding unit.
//!
//! A [`WebRtcTransport`](transport::WebRtcTransport) terminates one ICE-Lite /
//! DTLS / SRTP connection towards a receiver and forwards media published by
//! producers through a set of consumers, each of which adapts one source into
//! a single continuous output stream. Everything is driven through the
//! [`sansio::Protocol`] trait: inbound datagrams go in through `handle_read`,
//! source packets through `handle_write`, producer notifications through
//! `handle_event`, and timers through `handle_timeout`.

pub mod bandwidth;
pub mod configuration;
pub mod consumer;
pub mod event;
pub(crate) mod handler;
pub mod message;
pub mod rtp_parameters;
pub mod rtp_stream;
pub mod transport;

pub use transport::WebRtcTransport;
