//! Actuation collaborator interface
//!
//! The relay never drives hardware itself. Motors, lights and the still
//! camera sit behind [`Actuator`], supplied at startup.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

/// Physical effects requested by operators
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Apply a joystick deflection; both axes are already clamped to [-1, 1]
    async fn set_joystick(&self, x: f64, y: f64) -> Result<()>;

    /// Switch the light
    async fn set_light(&self, on: bool) -> Result<()>;

    /// Take a still photo
    async fn capture_photo(&self) -> Result<()>;
}

/// Placeholder used until real actuators are wired in.
///
/// Every request is acknowledged as successful and traced; nothing moves.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingActuator;

#[async_trait]
impl Actuator for LoggingActuator {
    async fn set_joystick(&self, x: f64, y: f64) -> Result<()> {
        debug!(x, y, "Joystick (no actuator attached)");
        Ok(())
    }

    async fn set_light(&self, on: bool) -> Result<()> {
        info!(on, "Light (no actuator attached)");
        Ok(())
    }

    async fn capture_photo(&self) -> Result<()> {
        info!("Photo (no actuator attached)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_actuator_always_succeeds() {
        let actuator: &dyn Actuator = &LoggingActuator;
        assert!(actuator.set_joystick(0.5, -1.0).await.is_ok());
        assert!(actuator.set_light(true).await.is_ok());
        assert!(actuator.capture_photo().await.is_ok());
    }
}
