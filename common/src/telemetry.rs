use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde_json::{Map, Number, Value};
use thiserror::Error;

// Transport collaborator limits; packets that cannot fit are never sent.
pub const MAX_MESSAGE_SEND_SIZE: usize = 128;
pub const MAX_MESSAGE_RECEIVE_SIZE: usize = 128;

pub const TOPIC_TELEMETRY: &str = "v1/devices/me/telemetry";
pub const TOPIC_ATTRIBUTES: &str = "v1/devices/me/attributes";
pub const TOPIC_RPC_REQUEST_SUB: &str = "v1/devices/me/rpc/request/+";
pub const TOPIC_RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";
pub const TOPIC_RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";

pub const KEY_TEMPERATURE: &str = "temperature";
pub const KEY_HUMIDITY: &str = "humidity";
pub const KEY_VOC: &str = "voc";
pub const KEY_LUX: &str = "lux";
pub const KEY_BATTERY: &str = "battery";
pub const KEY_VERSION: &str = "VERSION";

pub fn rpc_response_topic(request_id: &str) -> String {
    format!("{TOPIC_RPC_RESPONSE_PREFIX}{request_id}")
}

pub fn request_id_from_topic(topic: &str) -> Option<&str> {
    let id = topic.strip_prefix(TOPIC_RPC_REQUEST_PREFIX)?;
    if id.is_empty() || !id.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    Some(id)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("payload is {size} bytes; transport limit is {MAX_MESSAGE_SEND_SIZE}")]
    Oversize { size: usize },
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryPacket {
    values: Map<String, Value>,
}

impl TelemetryPacket {
    pub fn new() -> Self {
        Self::default()
    }

    // Non-finite values are dropped; one decimal keeps the wire compact and
    // avoids f32-to-f64 noise like 23.100000381.
    pub fn push_scalar(&mut self, key: &str, value: f32, decimals: u32) {
        if !value.is_finite() {
            return;
        }
        let factor = 10f64.powi(decimals as i32);
        let rounded = (f64::from(value) * factor).round() / factor;
        if let Some(number) = Number::from_f64(rounded) {
            self.values.insert(key.to_string(), Value::Number(number));
        }
    }

    pub fn push_count(&mut self, key: &str, value: u32) {
        self.values.insert(key.to_string(), Value::from(value));
    }

    pub fn push_flag(&mut self, key: &str, value: bool) {
        self.values.insert(key.to_string(), Value::Bool(value));
    }

    pub fn push_text(&mut self, key: &str, value: &str) {
        self.values
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_payload(self) -> Result<Vec<u8>, TelemetryError> {
        let payload = serde_json::to_vec(&Value::Object(self.values))
            .unwrap_or_else(|_| b"{}".to_vec());
        if payload.len() > MAX_MESSAGE_SEND_SIZE {
            return Err(TelemetryError::Oversize {
                size: payload.len(),
            });
        }
        Ok(payload)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Link {
    online: Arc<AtomicBool>,
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}
