//! Watermark classification and reservation sizing.
//!
//! An index's level is derived from `used / reserved` against the configured
//! [`WatermarkThresholds`]. Reservations are recomputed towards the `ideal`
//! ratio, capped by what the node can still hand out.

use zoekt_core::WatermarkThresholds;
use zoekt_state::{Index, NodeStorage, StateError, StateResult, StateStore, WatermarkLevel};

use crate::error::{ReconcileError, ReconcileResult};

/// The level an index with the given usage should carry.
pub fn appropriate_level(used: i64, reserved: i64, t: &WatermarkThresholds) -> WatermarkLevel {
    if reserved <= 0 {
        return if used <= 0 {
            WatermarkLevel::Healthy
        } else {
            WatermarkLevel::CriticalWatermarkExceeded
        };
    }
    let ratio = used as f64 / reserved as f64;
    if ratio >= t.critical {
        WatermarkLevel::CriticalWatermarkExceeded
    } else if ratio >= t.high {
        WatermarkLevel::HighWatermarkExceeded
    } else if ratio >= t.low {
        WatermarkLevel::LowWatermarkExceeded
    } else if ratio < t.overprovisioned && reserved > t.min_reserved_bytes {
        WatermarkLevel::Overprovisioned
    } else {
        WatermarkLevel::Healthy
    }
}

/// Parse a watermark symbol sent by the storage monitor.
pub fn parse_watermark(symbol: &str) -> ReconcileResult<WatermarkLevel> {
    WatermarkLevel::from_symbol(symbol)
        .ok_or_else(|| ReconcileError::UnknownWatermark(symbol.to_string()))
}

/// A monitor-requested level next to the one derived from stored usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkTransition {
    pub requested: WatermarkLevel,
    pub derived: WatermarkLevel,
}

impl WatermarkTransition {
    pub fn agrees(&self) -> bool {
        self.requested == self.derived
    }
}

/// Map a requested watermark symbol to the transition it implies.
///
/// Pure: touches no state. Unknown symbols are rejected.
pub fn classify(
    used: i64,
    reserved: i64,
    symbol: &str,
    t: &WatermarkThresholds,
) -> ReconcileResult<WatermarkTransition> {
    Ok(transition_to(parse_watermark(symbol)?, used, reserved, t))
}

/// The transition to an already parsed level.
pub fn transition_to(
    requested: WatermarkLevel,
    used: i64,
    reserved: i64,
    t: &WatermarkThresholds,
) -> WatermarkTransition {
    WatermarkTransition {
        requested,
        derived: appropriate_level(used, reserved, t),
    }
}

/// Reservation that would put `used` exactly at the ideal ratio, never below
/// the configured floor.
pub fn ideal_reserved_bytes(used: i64, t: &WatermarkThresholds) -> i64 {
    let ideal = if used <= 0 {
        0
    } else {
        (used as f64 / t.ideal).ceil() as i64
    };
    ideal.max(t.min_reserved_bytes)
}

/// Whether the stored level disagrees with the stored usage.
pub fn is_stale(index: &Index, t: &WatermarkThresholds) -> bool {
    index.watermark_level
        != appropriate_level(index.used_storage_bytes, index.reserved_storage_bytes, t)
}

/// Reservation and level a recompute settles on, given the bookkeeping of
/// the index's node.
///
/// The reservation can grow at most into the node's unclaimed capacity and
/// never drops below zero.
pub fn planned_reservation(
    storage: &NodeStorage,
    index: &Index,
    t: &WatermarkThresholds,
) -> (i64, WatermarkLevel) {
    let max_reservable = storage.unclaimed_bytes() + index.reserved_storage_bytes;
    let reserved = ideal_reserved_bytes(index.used_storage_bytes, t)
        .min(max_reservable)
        .max(0);
    (reserved, appropriate_level(index.used_storage_bytes, reserved, t))
}

/// Whether a recompute against `storage` would change the index.
pub fn needs_resize(storage: &NodeStorage, index: &Index, t: &WatermarkThresholds) -> bool {
    planned_reservation(storage, index, t) != (index.reserved_storage_bytes, index.watermark_level)
}

/// Resize an index's reservation towards the ideal ratio and re-derive its
/// level, see [`planned_reservation`].
///
/// The write is optimistic: a concurrent update to the same index surfaces
/// as [`StateError::Conflict`]. Nothing is written when the result would be
/// unchanged.
pub fn recompute_reserved_storage_bytes(
    state: &StateStore,
    t: &WatermarkThresholds,
    index: &Index,
) -> StateResult<Index> {
    let storage = state
        .node_storage(index.node_id)?
        .ok_or_else(|| StateError::NotFound(format!("node {}", index.node_id)))?;
    let (reserved, level) = planned_reservation(&storage, index, t);

    if reserved == index.reserved_storage_bytes && level == index.watermark_level {
        return Ok(index.clone());
    }
    let mut updated = index.clone();
    updated.reserved_storage_bytes = reserved;
    updated.watermark_level = level;
    state.update_index(&updated)
}
