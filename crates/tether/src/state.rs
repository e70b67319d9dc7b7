//! Vehicle state owned by the relay
//!
//! A single [`VehicleState`] lives behind [`VehicleStateStore`]. All mutation
//! goes through [`VehicleStateStore::update`], which serializes writers; reads
//! go through [`VehicleStateStore::with`] or [`VehicleStateStore::snapshot`]
//! and always observe a fully applied update.

use anyhow::{bail, Result};
use parking_lot::RwLock;
use serde::Serialize;

/// Inclusive bounds for the depth setpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DepthBounds {
    min: i32,
    max: i32,
}

impl DepthBounds {
    pub fn new(min: i32, max: i32) -> Result<Self> {
        if min > max {
            bail!("Invalid depth bounds: min {} > max {}", min, max);
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> i32 {
        self.min
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    /// Clamp an arbitrary requested depth into range
    pub fn clamp(&self, value: i64) -> i32 {
        value.clamp(self.min as i64, self.max as i64) as i32
    }
}

impl Default for DepthBounds {
    fn default() -> Self {
        Self { min: 0, max: 100 }
    }
}

/// One telemetry sample (percentages, 0-100)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetrySample {
    pub wifi_strength: u8,
    pub battery: u8,
}

impl TelemetrySample {
    pub fn new(wifi_strength: u8, battery: u8) -> Self {
        Self {
            wifi_strength: wifi_strength.min(100),
            battery: battery.min(100),
        }
    }
}

/// Process-wide vehicle record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VehicleState {
    pub depth: i32,
    pub light_on: bool,
    pub last_telemetry: TelemetrySample,
}

/// Synchronized owner of the [`VehicleState`]
pub struct VehicleStateStore {
    bounds: DepthBounds,
    inner: RwLock<VehicleState>,
}

impl VehicleStateStore {
    /// Create a store; the initial depth is clamped into `bounds`
    pub fn new(bounds: DepthBounds, mut initial: VehicleState) -> Self {
        initial.depth = bounds.clamp(initial.depth as i64);
        Self {
            bounds,
            inner: RwLock::new(initial),
        }
    }

    pub fn bounds(&self) -> DepthBounds {
        self.bounds
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> VehicleState {
        self.inner.read().clone()
    }

    /// Run `f` with shared access. Writers are excluded until `f` returns.
    pub fn with<R>(&self, f: impl FnOnce(&VehicleState) -> R) -> R {
        f(&self.inner.read())
    }

    /// Run `f` with exclusive access.
    ///
    /// Anything `f` publishes is ordered with respect to every other update
    /// and to session replay, which reads under the same lock. `f` must not
    /// block or touch this store again.
    pub fn update<R>(&self, f: impl FnOnce(&mut VehicleState) -> R) -> R {
        let mut state = self.inner.write();
        let result = f(&mut state);
        debug_assert!(state.depth >= self.bounds.min && state.depth <= self.bounds.max);
        result
    }

    /// Clamp and store a new depth setpoint, returning the applied value.
    ///
    /// `publish` sees the new state before the lock is released.
    pub fn set_depth(&self, requested: i64, publish: impl FnOnce(&VehicleState)) -> i32 {
        let depth = self.bounds.clamp(requested);
        self.update(|s| {
            s.depth = depth;
            publish(s);
        });
        depth
    }
}
