// growerd: Pin driver abstraction
//
// The driver deals exclusively in electrical levels (true = HIGH);
// polarity inversion happens in the callers via the polarity module.
// The driver is an exclusive resource of the reconciler worker; no other
// component may touch it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{ControlError, ControlResult};
use crate::model::PinMode;

/// Software PWM carrier frequency for duty-cycle control.
const PWM_FREQUENCY_HZ: f64 = 1000.0;

/// Minimal abstraction over the physical GPIO hardware.
///
/// `configure` must be called for a pin exactly once before any state
/// write. Errors surface as `ControlError::DriverFault`; callers never
/// trap them silently.
pub trait PinDriver: Send {
    /// Configure a pin for the given mode, driving `initial_level` on
    /// output pins.
    fn configure(&mut self, pin: u8, mode: PinMode, initial_level: bool) -> ControlResult<()>;

    /// Drive an electrical level on an output pin.
    fn write(&mut self, pin: u8, level: bool) -> ControlResult<()>;

    /// Read the current electrical level of a pin. Works on output pins
    /// too (returns the driven level).
    fn read(&mut self, pin: u8) -> ControlResult<bool>;

    /// Set the PWM duty cycle (0–100 %). Duty 0 stops PWM and leaves the
    /// pin LOW.
    fn set_pwm(&mut self, pin: u8, duty_percent: u8) -> ControlResult<()>;

    /// Release a single pin back to its unconfigured state.
    fn cleanup(&mut self, pin: u8) -> ControlResult<()>;

    /// Release every configured pin.
    fn cleanup_all(&mut self) -> ControlResult<()>;
}

// ─── Real hardware (rppal) ──────────────────────────────────────────

enum HardwarePin {
    Output(rppal::gpio::OutputPin),
    Input(rppal::gpio::InputPin),
}

/// Pin driver backed by the Raspberry Pi GPIO peripheral via rppal.
///
/// Pins are released on drop (rppal resets them to inputs), so a crashed
/// process never leaves an actuator driven.
pub struct RppalPinDriver {
    gpio: rppal::gpio::Gpio,
    pins: HashMap<u8, HardwarePin>,
}

impl RppalPinDriver {
    pub fn new() -> ControlResult<Self> {
        let gpio = rppal::gpio::Gpio::new()
            .map_err(|e| ControlError::DriverInit(format!("GPIO peripheral unavailable: {e}")))?;
        info!("GPIO driver initialised (BCM numbering, real hardware)");
        Ok(Self {
            gpio,
            pins: HashMap::new(),
        })
    }

    fn output_pin(&mut self, pin: u8) -> ControlResult<&mut rppal::gpio::OutputPin> {
        match self.pins.get_mut(&pin) {
            Some(HardwarePin::Output(p)) => Ok(p),
            Some(HardwarePin::Input(_)) => Err(ControlError::DriverFault {
                pin,
                message: "pin is configured as input".into(),
            }),
            None => Err(ControlError::DriverFault {
                pin,
                message: "pin not configured".into(),
            }),
        }
    }
}

impl PinDriver for RppalPinDriver {
    fn configure(&mut self, pin: u8, mode: PinMode, initial_level: bool) -> ControlResult<()> {
        let hw = self
            .gpio
            .get(pin)
            .map_err(|e| ControlError::driver_fault(pin, e))?;

        let configured = match mode {
            PinMode::Output | PinMode::Pwm => {
                let out = if initial_level {
                    hw.into_output_high()
                } else {
                    hw.into_output_low()
                };
                HardwarePin::Output(out)
            }
            PinMode::Input => HardwarePin::Input(hw.into_input()),
        };

        self.pins.insert(pin, configured);
        debug!(pin, mode = mode.as_str(), initial_level, "Pin configured");
        Ok(())
    }

    fn write(&mut self, pin: u8, level: bool) -> ControlResult<()> {
        let out = self.output_pin(pin)?;
        if level {
            out.set_high();
        } else {
            out.set_low();
        }
        Ok(())
    }

    fn read(&mut self, pin: u8) -> ControlResult<bool> {
        match self.pins.get_mut(&pin) {
            Some(HardwarePin::Output(p)) => Ok(p.is_set_high()),
            Some(HardwarePin::Input(p)) => Ok(p.read() == rppal::gpio::Level::High),
            None => Err(ControlError::DriverFault {
                pin,
                message: "pin not configured".into(),
            }),
        }
    }

    fn set_pwm(&mut self, pin: u8, duty_percent: u8) -> ControlResult<()> {
        let out = self.output_pin(pin)?;
        if duty_percent == 0 {
            out.clear_pwm()
                .map_err(|e| ControlError::driver_fault(pin, e))?;
            out.set_low();
        } else {
            let duty = f64::from(duty_percent.min(100)) / 100.0;
            out.set_pwm_frequency(PWM_FREQUENCY_HZ, duty)
                .map_err(|e| ControlError::driver_fault(pin, e))?;
        }
        Ok(())
    }

    fn cleanup(&mut self, pin: u8) -> ControlResult<()> {
        // Dropping the rppal pin resets it to an input.
        self.pins.remove(&pin);
        Ok(())
    }

    fn cleanup_all(&mut self) -> ControlResult<()> {
        self.pins.clear();
        Ok(())
    }
}

// ─── Simulated hardware ─────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct SimulatedPin {
    mode: Option<PinMode>,
    level: bool,
    duty: u8,
}

type SimulatedState = Arc<Mutex<HashMap<u8, SimulatedPin>>>;

/// In-memory pin driver with the same contract as the hardware driver.
///
/// Writes are buffered in a shared latch map that the paired
/// [`SimulatedHandle`] can inspect and perturb, which is how tests model
/// external interference on a pin.
pub struct SimulatedPinDriver {
    state: SimulatedState,
}

/// Test/inspection handle onto a [`SimulatedPinDriver`]'s latch map.
#[derive(Clone)]
pub struct SimulatedHandle {
    state: SimulatedState,
}

impl SimulatedPinDriver {
    pub fn new() -> (Self, SimulatedHandle) {
        let state: SimulatedState = Arc::new(Mutex::new(HashMap::new()));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimulatedHandle { state },
        )
    }
}

impl PinDriver for SimulatedPinDriver {
    fn configure(&mut self, pin: u8, mode: PinMode, initial_level: bool) -> ControlResult<()> {
        let mut pins = self.state.lock();
        pins.insert(
            pin,
            SimulatedPin {
                mode: Some(mode),
                level: initial_level,
                duty: 0,
            },
        );
        debug!(pin, mode = mode.as_str(), initial_level, "Simulated pin configured");
        Ok(())
    }

    fn write(&mut self, pin: u8, level: bool) -> ControlResult<()> {
        let mut pins = self.state.lock();
        let entry = pins.get_mut(&pin).ok_or_else(|| ControlError::DriverFault {
            pin,
            message: "pin not configured".into(),
        })?;
        entry.level = level;
        Ok(())
    }

    fn read(&mut self, pin: u8) -> ControlResult<bool> {
        let pins = self.state.lock();
        pins.get(&pin)
            .map(|p| p.level)
            .ok_or_else(|| ControlError::DriverFault {
                pin,
                message: "pin not configured".into(),
            })
    }

    fn set_pwm(&mut self, pin: u8, duty_percent: u8) -> ControlResult<()> {
        let mut pins = self.state.lock();
        let entry = pins.get_mut(&pin).ok_or_else(|| ControlError::DriverFault {
            pin,
            message: "pin not configured".into(),
        })?;
        entry.duty = duty_percent.min(100);
        if entry.duty == 0 {
            entry.level = false;
        }
        Ok(())
    }

    fn cleanup(&mut self, pin: u8) -> ControlResult<()> {
        self.state.lock().remove(&pin);
        Ok(())
    }

    fn cleanup_all(&mut self) -> ControlResult<()> {
        self.state.lock().clear();
        Ok(())
    }
}

impl SimulatedHandle {
    /// Current electrical level of a pin, if configured.
    pub fn level(&self, pin: u8) -> Option<bool> {
        self.state.lock().get(&pin).map(|p| p.level)
    }

    /// Current PWM duty of a pin, if configured.
    pub fn duty(&self, pin: u8) -> Option<u8> {
        self.state.lock().get(&pin).map(|p| p.duty)
    }

    pub fn is_configured(&self, pin: u8) -> bool {
        self.state.lock().contains_key(&pin)
    }

    /// Externally force an electrical level, bypassing the driver contract
    /// (models a glitched relay or a shorted line).
    pub fn force_level(&self, pin: u8, level: bool) {
        if let Some(entry) = self.state.lock().get_mut(&pin) {
            entry.level = level;
        }
    }

    pub fn configured_count(&self) -> usize {
        self.state.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_write_read_round_trip() {
        let (mut driver, handle) = SimulatedPinDriver::new();
        driver.configure(17, PinMode::Output, false).unwrap();
        driver.write(17, true).unwrap();
        assert!(driver.read(17).unwrap());
        assert_eq!(handle.level(17), Some(true));
    }

    #[test]
    fn unconfigured_pin_faults() {
        let (mut driver, _) = SimulatedPinDriver::new();
        assert!(matches!(
            driver.write(5, true),
            Err(ControlError::DriverFault { pin: 5, .. })
        ));
        assert!(driver.read(5).is_err());
    }

    #[test]
    fn pwm_zero_stops_and_drives_low() {
        let (mut driver, handle) = SimulatedPinDriver::new();
        driver.configure(12, PinMode::Pwm, false).unwrap();
        driver.set_pwm(12, 75).unwrap();
        assert_eq!(handle.duty(12), Some(75));
        driver.write(12, true).unwrap();
        driver.set_pwm(12, 0).unwrap();
        assert_eq!(handle.duty(12), Some(0));
        assert_eq!(handle.level(12), Some(false));
    }

    #[test]
    fn cleanup_releases_pins() {
        let (mut driver, handle) = SimulatedPinDriver::new();
        driver.configure(17, PinMode::Output, false).unwrap();
        driver.configure(18, PinMode::Output, true).unwrap();
        driver.cleanup(17).unwrap();
        assert!(!handle.is_configured(17));
        driver.cleanup_all().unwrap();
        assert_eq!(handle.configured_count(), 0);
    }

    #[test]
    fn forced_level_visible_to_driver() {
        let (mut driver, handle) = SimulatedPinDriver::new();
        driver.configure(26, PinMode::Output, true).unwrap();
        handle.force_level(26, false);
        assert!(!driver.read(26).unwrap());
    }
}
