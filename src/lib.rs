//! growerd, the on-device GPIO control plane for the growerd appliance.
//!
//! A tokio daemon for a Raspberry-Pi-class board that owns the GPIO pins,
//! reconciles them against a desired-state document in a remote document
//! database, runs time-window-bounded recurring schedules, enforces local
//! safety interlocks, and serves a LAN diagnostics HTTP surface.
//!
//! Data flow: remote document → watcher → (reconciler | schedule cache) →
//! pin registry → pin driver → hardware, and back through the hardware
//! sync loop into the document.

pub mod error;
pub mod gpio;
pub mod http;
pub mod model;
pub mod reconcile;
pub mod runtime_config;
pub mod safety;
pub mod schedule;
pub mod settings;
pub mod store;
pub mod sync;
pub mod watcher;
pub mod world;

pub use error::{ControlError, ControlResult};
pub use settings::Settings;
pub use world::World;
