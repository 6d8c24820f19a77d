use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use domus_common::{
    telemetry::{
        request_id_from_topic, rpc_response_topic, Link, TelemetryPacket, KEY_VERSION,
        MAX_MESSAGE_RECEIVE_SIZE, TOPIC_ATTRIBUTES, TOPIC_RPC_REQUEST_SUB,
    },
    Actuator, Backoff, RelayBank, RelayDriver, RpcDispatcher, RpcRequest, RuntimeConfig,
};

const MQTT_CHANNEL_CAPACITY: usize = 64;
const INBOUND_QUEUE_CAPACITY: usize = 16;
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

enum Inbound {
    Connected,
    Request { id: String, payload: Vec<u8> },
}

struct LogRelayDriver;

impl RelayDriver for LogRelayDriver {
    // Hardware integration point: the esp32 build drives GPIO relay lines.
    fn write(&mut self, actuator: Actuator, level: bool) -> anyhow::Result<()> {
        info!(
            "relay {} -> {}",
            actuator.attribute_key(),
            if level { "on" } else { "off" }
        );
        Ok(())
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RuntimeConfig::default();

    let tb_host = std::env::var("TB_HOST").unwrap_or(config.network.tb_host.clone());
    let tb_port = std::env::var("TB_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.network.tb_port);
    let device_token = std::env::var("TB_TOKEN").unwrap_or(config.network.device_token.clone());

    // Fail fast: a broken method table is a configuration error, not
    // something to discover on the first inbound command.
    let dispatcher = RpcDispatcher::with_switch_methods().context("RPC method table is invalid")?;

    let mut mqtt_options = MqttOptions::new("domus-controller", tb_host, tb_port);
    if !device_token.is_empty() {
        // ThingsBoard device auth: the access token is the MQTT username.
        mqtt_options.set_credentials(device_token, "");
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, MQTT_CHANNEL_CAPACITY);
    let link = Link::new();
    let (inbound_tx, mut inbound) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    spawn_transport_loop(link.clone(), mqtt.clone(), eventloop, inbound_tx);

    // Relay state is owned by this one task; commands arrive through the
    // queue, which keeps every {output, mirror} update indivisible.
    let mut bank = RelayBank::new();
    let mut driver = LogRelayDriver;

    info!("controller loop started");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                return Ok(());
            }
            Some(message) = inbound.recv() => match message {
                Inbound::Connected => publish_initial_attributes(&mqtt, &bank).await,
                Inbound::Request { id, payload } => {
                    handle_request(&mqtt, &link, &dispatcher, &mut bank, &mut driver, &id, &payload)
                        .await;
                }
            }
        }
    }
}

fn spawn_transport_loop(
    link: Link,
    mqtt: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    inbound: mpsc::Sender<Inbound>,
) {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(
            RECONNECT_INITIAL_DELAY,
            RECONNECT_MAX_DELAY,
            RECONNECT_MAX_ATTEMPTS,
        );

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("command transport connected");
                    link.set_online(true);
                    backoff.reset();
                    // Subscriptions do not survive a broker reconnect.
                    if let Err(err) = mqtt.subscribe(TOPIC_RPC_REQUEST_SUB, QoS::AtLeastOnce).await
                    {
                        warn!("rpc subscribe failed: {err}");
                    }
                    if inbound.send(Inbound::Connected).await.is_err() {
                        return;
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if publish.payload.len() > MAX_MESSAGE_RECEIVE_SIZE {
                        warn!(
                            "dropping oversized RPC payload on {} ({} bytes)",
                            publish.topic,
                            publish.payload.len()
                        );
                        continue;
                    }
                    let Some(id) = request_id_from_topic(&publish.topic) else {
                        warn!("ignoring message on unexpected topic {}", publish.topic);
                        continue;
                    };
                    let message = Inbound::Request {
                        id: id.to_string(),
                        payload: publish.payload.to_vec(),
                    };
                    if inbound.send(message).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    link.set_online(false);
                    match backoff.next_delay() {
                        Some(delay) => {
                            warn!("mqtt poll error: {err}; retrying in {delay:?}");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            // Keep looping anyway: availability beats giving up.
                            error!(
                                "mqtt retries exhausted after {} attempts; starting a fresh backoff cycle",
                                backoff.attempt()
                            );
                            backoff.reset();
                            tokio::time::sleep(RECONNECT_MAX_DELAY).await;
                        }
                    }
                }
            }
        }
    });
}

async fn handle_request(
    mqtt: &AsyncClient,
    link: &Link,
    dispatcher: &RpcDispatcher,
    bank: &mut RelayBank,
    driver: &mut LogRelayDriver,
    request_id: &str,
    payload: &[u8],
) {
    let response = match serde_json::from_slice::<RpcRequest>(payload) {
        Ok(request) => {
            info!("rpc {} (request {request_id})", request.method);
            match dispatcher.dispatch(bank, driver, &request) {
                Ok(outcome) => {
                    if let Some((actuator, state)) = outcome.mirror {
                        publish_attribute(mqtt, link, actuator, state);
                    }
                    outcome.response
                }
                Err(err) => {
                    warn!("rpc {} rejected: {err}", request.method);
                    serde_json::json!({ "error": err.to_string() })
                }
            }
        }
        Err(err) => {
            warn!("undecodable rpc payload (request {request_id}): {err}");
            serde_json::json!({ "error": "invalid request payload" })
        }
    };

    let topic = rpc_response_topic(request_id);
    if let Err(err) = mqtt
        .publish(topic, QoS::AtLeastOnce, false, response.to_string())
        .await
    {
        warn!("rpc response publish failed: {err}");
    }
}

fn publish_attribute(mqtt: &AsyncClient, link: &Link, actuator: Actuator, state: bool) {
    let mut packet = TelemetryPacket::new();
    packet.push_flag(actuator.attribute_key(), state);
    let payload = match packet.into_payload() {
        Ok(payload) => payload,
        Err(err) => {
            warn!("attribute packet dropped: {err}");
            return;
        }
    };

    if !link.is_online() {
        // The local relay state is authoritative; the mirror is queued and
        // flushed once the transport reconnects.
        warn!(
            "transport offline; {} mirror deferred",
            actuator.attribute_key()
        );
    }
    if let Err(err) = mqtt.try_publish(TOPIC_ATTRIBUTES, QoS::AtLeastOnce, false, payload) {
        warn!("attribute publish failed: {err}");
    }
}

async fn publish_initial_attributes(mqtt: &AsyncClient, bank: &RelayBank) {
    let mut packet = TelemetryPacket::new();
    packet.push_text(KEY_VERSION, env!("CARGO_PKG_VERSION"));
    for (actuator, state) in bank.states() {
        packet.push_flag(actuator.attribute_key(), state);
    }

    match packet.into_payload() {
        Ok(payload) => {
            if let Err(err) = mqtt
                .publish(TOPIC_ATTRIBUTES, QoS::AtLeastOnce, false, payload)
                .await
            {
                warn!("initial attribute publish failed: {err}");
            }
        }
        Err(err) => warn!("initial attribute packet dropped: {err}"),
    }
}
