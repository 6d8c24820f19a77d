use std::time::Duration;

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tracing::{debug, error, info, warn};

use domus_common::{
    telemetry::{
        Link, TelemetryPacket, KEY_BATTERY, KEY_HUMIDITY, KEY_LUX, KEY_TEMPERATURE, KEY_VOC,
        TOPIC_TELEMETRY,
    },
    AlarmEngine, AlarmEvent, Backoff, RuntimeConfig, SensorReading, SensorSource,
};

use crate::voc::VocIndex;

const MQTT_CHANNEL_CAPACITY: usize = 32;
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

struct SimulatedSensors {
    tick: u64,
    voc: VocIndex,
}

impl SimulatedSensors {
    fn new(voc_warmup_samples: u32) -> Self {
        Self {
            tick: 0,
            voc: VocIndex::new(voc_warmup_samples),
        }
    }
}

impl SensorSource for SimulatedSensors {
    // Hardware integration point: the esp32 build replaces these waveforms
    // with AHT20/SGP40/BH1750 reads and the battery ADC.
    fn sample(&mut self) -> SensorReading {
        self.tick = self.tick.saturating_add(1);
        let tick = self.tick;

        let raw_ticks = 30_000.0 - ((tick % 12) as f32) * 40.0;
        SensorReading {
            temperature: Some(17.0 + ((tick % 16) as f32) * 0.3),
            humidity: Some(38.0 + ((tick % 9) as f32) * 1.5),
            voc: self.voc.update(raw_ticks),
            lux: Some(120.0 + ((tick % 10) as f32) * 15.0),
            battery: Some(3.9 - ((tick % 40) as f32) * 0.005),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = RuntimeConfig::default();
    config.sensor.sanitize();

    let tb_host = std::env::var("TB_HOST").unwrap_or(config.network.tb_host.clone());
    let tb_port = std::env::var("TB_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.network.tb_port);
    let device_token = std::env::var("TB_TOKEN").unwrap_or(config.network.device_token.clone());

    let mut mqtt_options = MqttOptions::new("domus-sensor", tb_host, tb_port);
    if !device_token.is_empty() {
        // ThingsBoard device auth: the access token is the MQTT username.
        mqtt_options.set_credentials(device_token, "");
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, MQTT_CHANNEL_CAPACITY);
    let link = Link::new();
    spawn_transport_loop(link.clone(), eventloop);

    let mut engine = AlarmEngine::new(config.thresholds);
    let mut sensors = SimulatedSensors::new(config.sensor.voc_warmup_samples);
    let mut interval =
        tokio::time::interval(Duration::from_millis(config.sensor.poll_interval_ms));

    info!("sensor loop started");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                return Ok(());
            }
            _ = interval.tick() => {
                let reading = sensors.sample();
                publish_reading(&mqtt, &link, &reading).await;
                for event in engine.evaluate_reading(&reading) {
                    publish_alarm(&mqtt, &link, event);
                }
            }
        }
    }
}

fn spawn_transport_loop(link: Link, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(
            RECONNECT_INITIAL_DELAY,
            RECONNECT_MAX_DELAY,
            RECONNECT_MAX_ATTEMPTS,
        );

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("telemetry transport connected");
                    link.set_online(true);
                    backoff.reset();
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

async fn publish_reading(mqtt: &AsyncClient, link: &Link, reading: &SensorReading) {
    let mut packet = TelemetryPacket::new();
    if let Some(temperature) = reading.temperature {
        packet.push_scalar(KEY_TEMPERATURE, temperature, 1);
    }
    if let Some(humidity) = reading.humidity {
        packet.push_scalar(KEY_HUMIDITY, humidity, 1);
    }
    if let Some(voc) = reading.voc {
        packet.push_count(KEY_VOC, voc.round().max(0.0) as u32);
    }
    if let Some(lux) = reading.lux {
        packet.push_scalar(KEY_LUX, lux, 1);
    }
    if let Some(battery) = reading.battery {
        packet.push_scalar(KEY_BATTERY, battery, 2);
    }

    if packet.is_empty() {
        return;
    }
    if !link.is_online() {
        debug!("transport offline; skipping telemetry publish");
        return;
    }

    match packet.into_payload() {
        Ok(payload) => {
            if let Err(err) = mqtt
                .publish(TOPIC_TELEMETRY, QoS::AtLeastOnce, false, payload)
                .await
            {
                warn!("telemetry publish failed: {err}");
            }
        }
        Err(err) => warn!("telemetry packet dropped: {err}"),
    }
}

fn publish_alarm(mqtt: &AsyncClient, link: &Link, event: AlarmEvent) {
    info!(
        "alarm {} -> {}",
        event.quantity.telemetry_key(),
        event.active
    );

    let mut packet = TelemetryPacket::new();
    packet.push_flag(event.quantity.telemetry_key(), event.active);
    let payload = match packet.into_payload() {
        Ok(payload) => payload,
        Err(err) => {
            warn!("alarm packet dropped: {err}");
            return;
        }
    };

    if !link.is_online() {
        warn!("transport offline; alarm transition queued for reconnect");
    }
    // try_publish: edge events are queued even while offline, and a full
    // request queue must not stall the sampling loop.
    if let Err(err) = mqtt.try_publish(TOPIC_TELEMETRY, QoS::AtLeastOnce, false, payload) {
        warn!("alarm publish failed: {err}");
    }
}
