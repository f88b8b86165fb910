//! Relay outputs. The `gpio` feature gates the real rppal driver; without it,
//! a mock board keeps output states in memory and logs every write.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};
use tracing::info;

use crate::channel::ChannelId;
use crate::error::TransportError;

/// Fire-and-confirm actuator writes. `Ok` means the output is in the
/// requested state.
pub trait ActuatorTransport: Send + Sync {
    fn write(&self, channel: &ChannelId, on: bool) -> Result<(), TransportError>;
}

fn poisoned() -> TransportError {
    TransportError::Hardware("relay board lock poisoned".to_string())
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: Mutex<HashMap<ChannelId, OutputPin>>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(channel_to_gpio: &[(ChannelId, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (channel, pin_num) in channel_to_gpio {
            let mut pin = gpio.get(*pin_num)?.into_output();

            // Fail-safe: OFF at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(channel.clone(), pin);
        }

        info!(outputs = pins.len(), active_low, "relay board initialised");
        Ok(Self {
            pins: Mutex::new(pins),
            active_low,
        })
    }
}

#[cfg(feature = "gpio")]
impl ActuatorTransport for RelayBoard {
    fn write(&self, channel: &ChannelId, on: bool) -> Result<(), TransportError> {
        let mut pins = self.pins.lock().map_err(|_| poisoned())?;
        let pin = pins
            .get_mut(channel)
            .ok_or_else(|| TransportError::UnknownOutput(channel.clone()))?;

        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(channel = %channel, state = if on { "ON" } else { "OFF" }, "relay set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    outputs: Mutex<HashMap<ChannelId, bool>>,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(channel_to_gpio: &[(ChannelId, u8)], _active_low: bool) -> Result<Self> {
        let mut outputs = HashMap::new();
        for (channel, pin_num) in channel_to_gpio {
            info!(channel = %channel, gpio = pin_num, "[mock-gpio] registered output (not wired)");
            outputs.insert(channel.clone(), false);
        }
        info!("[mock-gpio] relay board initialised (no hardware)");
        Ok(Self {
            outputs: Mutex::new(outputs),
        })
    }

    pub fn output(&self, channel: &ChannelId) -> Option<bool> {
        self.outputs.lock().ok()?.get(channel).copied()
    }
}

#[cfg(not(feature = "gpio"))]
impl ActuatorTransport for RelayBoard {
    fn write(&self, channel: &ChannelId, on: bool) -> Result<(), TransportError> {
        let mut outputs = self.outputs.lock().map_err(|_| poisoned())?;
        let state = outputs
            .get_mut(channel)
            .ok_or_else(|| TransportError::UnknownOutput(channel.clone()))?;
        *state = on;
        info!(channel = %channel, state = if on { "ON" } else { "OFF" }, "[mock-gpio] relay set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// Records every write; optionally fails them all, or only writes to
/// particular channels.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingTransport {
    writes: Mutex<Vec<(ChannelId, bool)>>,
    fail_all: std::sync::atomic::AtomicBool,
    fail_channels: Mutex<Vec<ChannelId>>,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn failing() -> Self {
        let t = Self::default();
        t.set_failing(true);
        t
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_all
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn fail_channel(&self, channel: &str) {
        self.fail_channels.lock().unwrap().push(channel.into());
    }

    pub fn writes(&self) -> Vec<(ChannelId, bool)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_to(&self, channel: &str) -> Vec<bool> {
        let id = ChannelId::from(channel);
        self.writes()
            .into_iter()
            .filter(|(c, _)| *c == id)
            .map(|(_, on)| on)
            .collect()
    }
}

#[cfg(test)]
impl ActuatorTransport for RecordingTransport {
    fn write(&self, channel: &ChannelId, on: bool) -> Result<(), TransportError> {
        if self.fail_all.load(std::sync::atomic::Ordering::SeqCst)
            || self.fail_channels.lock().unwrap().contains(channel)
        {
            return Err(TransportError::Hardware("relay did not respond".to_string()));
        }
        self.writes.lock().unwrap().push((channel.clone(), on));
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    fn board() -> RelayBoard {
        RelayBoard::new(&[("light".into(), 17), ("pump".into(), 27)], true).unwrap()
    }

    #[test]
    fn relay_board_starts_all_off() {
        let board = board();
        assert_eq!(board.output(&"light".into()), Some(false));
        assert_eq!(board.output(&"pump".into()), Some(false));
    }

    #[test]
    fn relay_board_write_sets_output() {
        let board = board();
        board.write(&"light".into(), true).unwrap();
        assert_eq!(board.output(&"light".into()), Some(true));
        board.write(&"light".into(), false).unwrap();
        assert_eq!(board.output(&"light".into()), Some(false));
    }

    #[test]
    fn relay_board_unknown_channel_errors() {
        let board = board();
        let err = board.write(&"ghost".into(), true).unwrap_err();
        assert_eq!(err, TransportError::UnknownOutput("ghost".into()));
        assert_eq!(board.output(&"ghost".into()), None);
    }
}
