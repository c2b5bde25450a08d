//! # tyretherm
//!
//! Acquisition and analysis core for an in-car tyre, brake and pressure
//! display.
//!
//! ## Features
//!
//! - **Non-blocking acquisition**: one thread per sensor, publishing into a
//!   depth-2 snapshot slot the render loop reads without locking
//! - **Thermal zone analysis**: edge detection with hysteresis and trimmed
//!   medians over left/centre/right tyre bands, on fixed-size buffers
//! - **Temporal filtering**: EMA smoothing with a physical slew-rate clamp
//! - **Corner bus protocol**: decoder and encoder for the corner-node frames,
//!   including on-demand full thermal frame transfers
//! - **Graceful degradation**: missing or flaky hardware degrades a channel,
//!   never the consumer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tyretherm::config::HandlerConfig;
//! use tyretherm::handler::SensorHandler;
//! use tyretherm::protocol::Corner;
//! use tyretherm::sensors::ThermalSensor;
//! use tyretherm::sim::{FaultProfile, SimThermalCamera, TyreScene};
//!
//! let camera = SimThermalCamera::new(TyreScene::default(), FaultProfile::healthy(), 1);
//! let sensor = ThermalSensor::new(
//!     Corner::FrontLeft,
//!     Box::new(camera),
//!     Default::default(),
//!     Default::default(),
//! );
//!
//! let mut handler = SensorHandler::new(sensor, HandlerConfig::default());
//! handler.start().unwrap();
//! if let Some(snapshot) = handler.get_latest() {
//!     println!("gradient {:.1}", snapshot.payload.lateral_gradient);
//! }
//! handler.stop().unwrap();
//! ```
//!
//! ## Architecture
//!
//! - [`filter`] - per-channel temporal filter
//! - [`protocol`] - corner bus identifiers, decoder and encoder
//! - [`zone`] - thermal zone processor
//! - [`snapshot`] - single-writer latest-value slot
//! - [`sensors`] - per-hardware acquisition pipelines and device traits
//! - [`handler`] - acquisition thread and its state machine
//! - [`store`] - every channel, read once per render cycle
//! - [`sim`] - simulated devices with fault injection

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod filter;
pub mod handler;
pub mod protocol;
pub mod sensors;
pub mod sim;
pub mod snapshot;
pub mod store;
pub mod zone;

pub use config::Config;
pub use handler::{HandlerState, SensorHandler};
pub use protocol::{decode, encode, Corner, CornerMessage, DecodeError};
pub use snapshot::Snapshot;
pub use store::SnapshotStore;
pub use zone::{RawThermalFrame, ZoneProcessor, ZoneResult};
