//! Latest reported state per device and per servo channel.
//!
//! Controllers push `status` messages with an opaque payload (battery,
//! current pose, ...). The core keeps only the most recent one.
//!
//! Servo channels are tracked per device type: the router records the
//! angle it commanded, servo drivers report where the channel actually is
//! (`feedback`) or that it failed (`error`).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use fleet_core::{DeviceId, DeviceType, ServoFault, ServoFeedback, ServoReading};

pub use fleet_core::{DeviceState, ServoChannelState};

/// Destination for device status reports and servo positions.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn update_state(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        payload: serde_json::Value,
    );

    /// The core sent `reading` to the servo drivers of `device_type`.
    async fn servo_target(&self, device_type: &DeviceType, reading: &ServoReading);

    async fn servo_feedback(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        feedback: &ServoFeedback,
    );

    async fn servo_fault(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        fault: &ServoFault,
    );
}

/// In-memory [`StateStore`].
#[derive(Default)]
pub struct StateManager {
    states: Mutex<HashMap<DeviceId, DeviceState>>,
    servos: Mutex<HashMap<DeviceType, BTreeMap<u8, ServoChannelState>>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, device_id: &DeviceId) -> Option<DeviceState> {
        self.states.lock().await.get(device_id).cloned()
    }

    pub async fn by_type(&self, device_type: &DeviceType) -> Vec<DeviceState> {
        let states = self.states.lock().await;
        states
            .values()
            .filter(|s| &s.device_type == device_type)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<DeviceState> {
        self.states.lock().await.values().cloned().collect()
    }

    /// Forgets a device's state. Returns true if there was any.
    pub async fn clear(&self, device_id: &DeviceId) -> bool {
        self.states.lock().await.remove(device_id).is_some()
    }

    /// Known channels of `device_type`, ascending.
    pub async fn servo_channels(&self, device_type: &DeviceType) -> Vec<ServoChannelState> {
        let servos = self.servos.lock().await;
        servos
            .get(device_type)
            .map(|channels| channels.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn servo_channel(
        &self,
        device_type: &DeviceType,
        channel: u8,
    ) -> Option<ServoChannelState> {
        let servos = self.servos.lock().await;
        servos.get(device_type)?.get(&channel).cloned()
    }

    async fn with_channel<F>(&self, device_type: &DeviceType, channel: u8, update: F)
    where
        F: FnOnce(&mut ServoChannelState) + Send,
    {
        let now = Utc::now();
        let mut servos = self.servos.lock().await;
        let state = servos
            .entry(device_type.clone())
            .or_default()
            .entry(channel)
            .or_insert_with(|| ServoChannelState::new(channel, now));
        update(state);
        state.updated_at = now;
    }
}

#[async_trait]
impl StateStore for StateManager {
    async fn update_state(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        payload: serde_json::Value,
    ) {
        let mut states = self.states.lock().await;
        states.insert(
            device_id.clone(),
            DeviceState {
                device_id: device_id.clone(),
                device_type: device_type.clone(),
                payload,
                last_updated: Utc::now(),
            },
        );
    }

    async fn servo_target(&self, device_type: &DeviceType, reading: &ServoReading) {
        self.with_channel(device_type, reading.channel, |state| {
            state.target_angle = Some(reading.angle);
            state.is_moving = state.current_angle != Some(reading.angle);
        })
        .await;
    }

    async fn servo_feedback(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        feedback: &ServoFeedback,
    ) {
        self.with_channel(device_type, feedback.channel, |state| {
            state.current_angle = Some(feedback.current_angle);
            if feedback.target_angle.is_some() {
                state.target_angle = feedback.target_angle;
            }
            if feedback.pulse_width_us.is_some() {
                state.pulse_us = feedback.pulse_width_us;
            }
            state.is_moving = feedback.is_moving;
            state.error = None;
            state.reported_by = Some(device_id.clone());
        })
        .await;
    }

    async fn servo_fault(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        fault: &ServoFault,
    ) {
        let Some(channel) = fault.channel else {
            debug!(device_id = %device_id, "Board-level fault has no channel to record against");
            return;
        };
        self.with_channel(device_type, channel, |state| {
            state.error = Some(fault.error_message.clone());
            state.is_moving = false;
            state.reported_by = Some(device_id.clone());
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn servo() -> DeviceType {
        DeviceType::new("servo-driver")
    }

    fn feedback(channel: u8, current_angle: f64) -> ServoFeedback {
        ServoFeedback {
            channel,
            current_angle,
            target_angle: None,
            pulse_width_us: Some(1500),
            pca9685_ticks: None,
            is_moving: false,
        }
    }

    #[tokio::test]
    async fn test_latest_payload_wins() {
        let store = StateManager::new();
        let head = DeviceId::new("head");

        store.update_state(&head, &servo(), json!({"pose": "home"})).await;
        store.update_state(&head, &servo(), json!({"pose": "handsup"})).await;

        let state = store.get(&head).await.unwrap();
        assert_eq!(state.payload, json!({"pose": "handsup"}));
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_filter_and_clear() {
        let store = StateManager::new();
        store
            .update_state(&DeviceId::new("head"), &servo(), json!({}))
            .await;
        store
            .update_state(&DeviceId::new("wheels"), &DeviceType::new("wheel-driver"), json!({}))
            .await;

        assert_eq!(store.by_type(&DeviceType::new("wheel-driver")).await.len(), 1);
        assert!(store.clear(&DeviceId::new("wheels")).await);
        assert!(!store.clear(&DeviceId::new("wheels")).await);
        assert!(store.get(&DeviceId::new("wheels")).await.is_none());
    }

    #[tokio::test]
    async fn test_target_then_feedback_settles_channel() {
        let store = StateManager::new();
        let head = DeviceId::new("servoscontroller");
        let reading = ServoReading {
            channel: 2,
            angle: 120.0,
            pulse_us: 1667,
            pca9685_ticks: 341,
            ledc_ticks: 5462,
        };

        store.servo_target(&servo(), &reading).await;
        let state = store.servo_channel(&servo(), 2).await.unwrap();
        assert_eq!(state.target_angle, Some(120.0));
        assert_eq!(state.current_angle, None);
        assert!(state.is_moving);

        store.servo_feedback(&head, &servo(), &feedback(2, 120.0)).await;
        let state = store.servo_channel(&servo(), 2).await.unwrap();
        assert_eq!(state.current_angle, Some(120.0));
        assert_eq!(state.target_angle, Some(120.0));
        assert_eq!(state.pulse_us, Some(1500));
        assert!(!state.is_moving);
        assert_eq!(state.reported_by, Some(head));
    }

    #[tokio::test]
    async fn test_fault_recorded_until_next_feedback() {
        let store = StateManager::new();
        let head = DeviceId::new("servoscontroller");
        let fault = ServoFault {
            channel: Some(3),
            error_code: 1,
            error_message: "I2C communication failed".into(),
        };

        store.servo_fault(&head, &servo(), &fault).await;
        let state = store.servo_channel(&servo(), 3).await.unwrap();
        assert_eq!(state.error.as_deref(), Some("I2C communication failed"));

        store.servo_feedback(&head, &servo(), &feedback(3, 45.0)).await;
        assert!(store.servo_channel(&servo(), 3).await.unwrap().error.is_none());

        let board = ServoFault {
            channel: None,
            ..fault
        };
        store.servo_fault(&head, &servo(), &board).await;
        assert_eq!(store.servo_channels(&servo()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_channels_are_per_device_type() {
        let store = StateManager::new();
        let head = DeviceId::new("head");
        store.servo_feedback(&head, &servo(), &feedback(5, 10.0)).await;
        store.servo_feedback(&head, &servo(), &feedback(1, 20.0)).await;

        let channels: Vec<u8> = store
            .servo_channels(&servo())
            .await
            .iter()
            .map(|c| c.channel)
            .collect();
        assert_eq!(channels, vec![1, 5]);
        assert!(store.servo_channels(&DeviceType::new("arm")).await.is_empty());
    }
}
