#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]

//! A CAN-bus diagnostic toolkit: ISO-TP (ISO 15765-2) transport, a UDS (ISO 14229) diagnostic
//! client, passive DTC reassembly, and a frame monitor pipeline tying them to a signal database
//! and an outbound transport queue.
//!
//! ## Transport
//!
//! [`frame`] defines [`frame::FrameIo`], the uniform send/receive interface every other layer in
//! this crate is built on. [`hardware::socketcan`] implements it over a real Linux SocketCAN
//! socket (behind the `socketcan` feature); [`frame::LoopbackFrameIo`] is an in-memory double
//! usable both in tests and for `--listen-only` operation without hardware.
//!
//! ## ISO-TP
//!
//! [`isotp`] implements ISO 15765-2 segmentation, reassembly and flow control: Normal,
//! NormalFixed and Extended addressing, BlockSize/STmin negotiation, and the PCI framing shared
//! by an active session ([`isotp::IsoTpSession`]) and a passive one ([`reassembler`]).
//!
//! ## UDS
//!
//! [`uds`] is a client for the subset of ISO 14229 needed to drive a diagnostic session:
//! `DiagnosticSessionControl`, `SecurityAccess`, and `ReadDTCByStatusMask`, plus T_Data observer
//! hooks ([`uds::hooks::TDataHooks`]) for instrumentation.
//!
//! ## DTCs
//!
//! [`dtc`] canonicalizes raw ISO 14229-1 DTC bytes into `Pxxxx`/`Cxxxx`/`Bxxxx`/`Uxxxx` codes and
//! parses `ReadDTCByStatusMask` responses against a configured lookup table.
//!
//! ## Monitor
//!
//! [`monitor`] drives the steady-state receive loop: decode ordinary frames against a
//! [`signal_db::SignalDatabase`], reassemble overheard UDS responses, forward records to a
//! [`transport::TransportHandle`], and reconnect with exponential backoff on bus errors.

pub mod config;
pub mod dtc;
pub mod error;
pub mod frame;
pub mod hardware;
pub mod isotp;
pub mod metrics;
pub mod monitor;
pub mod reassembler;
pub mod signal_db;
pub mod transport;
pub mod uds;
