// growerd: Polarity mapping between logical state and electrical level
//
// Active-LOW relays invert the mapping: electrical LOW means the device
// is ON. Both directions reduce to XOR with the per-pin `active_low` flag;
// these two functions are applied at every boundary between logical
// reasoning and the pin driver.

/// Logical device state → electrical pin level.
#[inline]
pub fn to_level(state: bool, active_low: bool) -> bool {
    state ^ active_low
}

/// Electrical pin level → logical device state.
#[inline]
pub fn from_level(level: bool, active_low: bool) -> bool {
    level ^ active_low
}
