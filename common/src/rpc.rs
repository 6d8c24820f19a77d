use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::relay::{Actuator, RelayBank, RelayDriver};

// Transport collaborator limit: at most this many server-side RPC
// subscriptions may be registered.
pub const MAX_RPC_SUBSCRIPTIONS: usize = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC method `{0}` is already registered")]
    DuplicateMethod(String),
    #[error("cannot register more than {MAX_RPC_SUBSCRIPTIONS} RPC methods")]
    TooManyMethods,
    #[error("unknown RPC method `{0}`")]
    UnknownMethod(String),
    #[error("`enabled` must be the integer 0 or 1")]
    InvalidEnabled,
    #[error("relay drive failed: {0}")]
    Driver(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcHandler {
    SetSwitch(Actuator),
    GetSwitch(Actuator),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcOutcome {
    pub response: Value,
    // Set handlers hand the applied state back so the caller can mirror it
    // as a device attribute, best effort.
    pub mirror: Option<(Actuator, bool)>,
}

#[derive(Debug, Default)]
pub struct RpcDispatcher {
    handlers: Vec<(String, RpcHandler)>,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_switch_methods() -> Result<Self, RpcError> {
        let mut dispatcher = Self::new();
        for actuator in Actuator::ALL {
            dispatcher.register(actuator.set_method(), RpcHandler::SetSwitch(actuator))?;
            dispatcher.register(actuator.get_method(), RpcHandler::GetSwitch(actuator))?;
        }
        Ok(dispatcher)
    }

    pub fn register(&mut self, method: &str, handler: RpcHandler) -> Result<(), RpcError> {
        if self.lookup(method).is_some() {
            return Err(RpcError::DuplicateMethod(method.to_string()));
        }
        if self.handlers.len() >= MAX_RPC_SUBSCRIPTIONS {
            return Err(RpcError::TooManyMethods);
        }
        self.handlers.push((method.to_string(), handler));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn lookup(&self, method: &str) -> Option<RpcHandler> {
        self.handlers
            .iter()
            .find(|(name, _)| name == method)
            .map(|(_, handler)| *handler)
    }

    pub fn dispatch<D: RelayDriver>(
        &self,
        bank: &mut RelayBank,
        driver: &mut D,
        request: &RpcRequest,
    ) -> Result<RpcOutcome, RpcError> {
        let handler = self
            .lookup(&request.method)
            .ok_or_else(|| RpcError::UnknownMethod(request.method.clone()))?;

        match handler {
            RpcHandler::SetSwitch(actuator) => {
                // Validate before touching any state; a bad payload must leave
                // the relay exactly where it was.
                let desired = parse_enabled(&request.params)?;
                let applied = bank.apply(actuator, desired, driver)?;
                Ok(RpcOutcome {
                    response: Value::Bool(applied),
                    mirror: Some((actuator, applied)),
                })
            }
            RpcHandler::GetSwitch(actuator) => Ok(RpcOutcome {
                response: json!({ actuator.attribute_key(): bank.state(actuator) }),
                mirror: None,
            }),
        }
    }
}

fn parse_enabled(params: &Value) -> Result<bool, RpcError> {
    match params.get("enabled").and_then(Value::as_i64) {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(RpcError::InvalidEnabled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct NullDriver;

    impl RelayDriver for NullDriver {
        fn write(&mut self, _actuator: Actuator, _level: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn set_request(method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn switch_method_table_is_complete() {
        let dispatcher = RpcDispatcher::with_switch_methods().unwrap();
        assert_eq!(dispatcher.len(), MAX_RPC_SUBSCRIPTIONS);
    }

    #[test]
    fn set_then_get_round_trips() {
        let dispatcher = RpcDispatcher::with_switch_methods().unwrap();
        let mut bank = RelayBank::new();
        let mut driver = NullDriver;

        let outcome = dispatcher
            .dispatch(
                &mut bank,
                &mut driver,
                &set_request("set_light_switch", json!({ "enabled": 1 })),
            )
            .unwrap();
        assert_eq!(outcome.response, Value::Bool(true));
        assert_eq!(outcome.mirror, Some((Actuator::Light, true)));

        let outcome = dispatcher
            .dispatch(
                &mut bank,
                &mut driver,
                &set_request("get_light_switch", Value::Null),
            )
            .unwrap();
        assert_eq!(outcome.response, json!({ "LIGHT_RELAY": true }));
        assert_eq!(outcome.mirror, None);

        let outcome = dispatcher
            .dispatch(
                &mut bank,
                &mut driver,
                &set_request("set_light_switch", json!({ "enabled": 0 })),
            )
            .unwrap();
        assert_eq!(outcome.response, Value::Bool(false));

        let outcome = dispatcher
            .dispatch(
                &mut bank,
                &mut driver,
                &set_request("get_light_switch", Value::Null),
            )
            .unwrap();
        assert_eq!(outcome.response, json!({ "LIGHT_RELAY": false }));
    }

    #[test]
    fn invalid_enabled_values_are_rejected_without_mutation() {
        let dispatcher = RpcDispatcher::with_switch_methods().unwrap();
        let mut bank = RelayBank::new();
        let mut driver = NullDriver;

        dispatcher
            .dispatch(
                &mut bank,
                &mut driver,
                &set_request("set_vmc_switch", json!({ "enabled": 1 })),
            )
            .unwrap();
        assert!(bank.state(Actuator::Vmc));

        for params in [
            json!({ "enabled": 5 }),
            json!({ "enabled": -1 }),
            json!({ "enabled": "on" }),
            json!({ "enabled": true }),
            json!({ "enabled": 1.0 }),
            json!({}),
            Value::Null,
        ] {
            let err = dispatcher
                .dispatch(
                    &mut bank,
                    &mut driver,
                    &set_request("set_vmc_switch", params),
                )
                .unwrap_err();
            assert!(matches!(err, RpcError::InvalidEnabled));
            assert!(bank.state(Actuator::Vmc), "state must survive bad payloads");
        }
    }

    #[test]
    fn unknown_method_is_rejected() {
        let dispatcher = RpcDispatcher::with_switch_methods().unwrap();
        let mut bank = RelayBank::new();
        let mut driver = NullDriver;

        let err = dispatcher
            .dispatch(
                &mut bank,
                &mut driver,
                &set_request("set_pump_switch", json!({ "enabled": 1 })),
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::UnknownMethod(_)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut dispatcher = RpcDispatcher::new();
        dispatcher
            .register("set_light_switch", RpcHandler::SetSwitch(Actuator::Light))
            .unwrap();

        let err = dispatcher
            .register("set_light_switch", RpcHandler::GetSwitch(Actuator::Light))
            .unwrap_err();
        assert!(matches!(err, RpcError::DuplicateMethod(_)));
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn registration_is_capped_at_subscription_limit() {
        let mut dispatcher = RpcDispatcher::with_switch_methods().unwrap();

        let err = dispatcher
            .register("set_pump_switch", RpcHandler::SetSwitch(Actuator::Light))
            .unwrap_err();
        assert!(matches!(err, RpcError::TooManyMethods));
    }

    #[test]
    fn failing_driver_surfaces_as_rpc_error() {
        struct FailingDriver;
        impl RelayDriver for FailingDriver {
            fn write(&mut self, _actuator: Actuator, _level: bool) -> anyhow::Result<()> {
                anyhow::bail!("gpio write failed")
            }
        }

        let dispatcher = RpcDispatcher::with_switch_methods().unwrap();
        let mut bank = RelayBank::new();
        let mut driver = FailingDriver;

        let err = dispatcher
            .dispatch(
                &mut bank,
                &mut driver,
                &set_request("set_heater_switch", json!({ "enabled": 1 })),
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::Driver(_)));
        assert!(!bank.state(Actuator::Heater));
    }
}
