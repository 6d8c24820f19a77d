pub mod alarm;
pub mod backoff;
pub mod config;
pub mod relay;
pub mod rpc;
pub mod sensors;
pub mod telemetry;

pub use alarm::{AlarmEngine, AlarmEvent, Direction, Quantity};
pub use backoff::Backoff;
pub use config::{AlarmThresholds, NetworkConfig, RelayPinConfig, RuntimeConfig, SensorConfig};
pub use relay::{Actuator, RelayBank, RelayDriver};
pub use rpc::{RpcDispatcher, RpcError, RpcHandler, RpcOutcome, RpcRequest, MAX_RPC_SUBSCRIPTIONS};
pub use sensors::{SensorReading, SensorSource};
pub use telemetry::*;
