// growerd: GPIO layer: driver abstraction, polarity mapping, pin registry

pub mod driver;
pub mod polarity;
pub mod registry;

pub use driver::{PinDriver, RppalPinDriver, SimulatedHandle, SimulatedPinDriver};
pub use polarity::{from_level, to_level};
pub use registry::{PinEntry, PinRegistry, RegistrySnapshot};
