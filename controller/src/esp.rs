use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{
        Details, EspMqttClient, EspMqttConnection, EventPayload, MqttClientConfiguration,
    },
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use domus_common::{
    config::{NetworkConfig, RelayPinConfig},
    telemetry::{
        request_id_from_topic, rpc_response_topic, Link, TelemetryPacket, KEY_VERSION,
        MAX_MESSAGE_RECEIVE_SIZE, TOPIC_ATTRIBUTES, TOPIC_RPC_REQUEST_SUB,
    },
    Actuator, RelayBank, RelayDriver, RpcDispatcher, RpcRequest, RuntimeConfig,
};

const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE: Duration = Duration::from_secs(300);
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

struct GpioRelayDriver {
    light: PinDriver<'static, AnyOutputPin, Output>,
    vmc: PinDriver<'static, AnyOutputPin, Output>,
    heater: PinDriver<'static, AnyOutputPin, Output>,
    ac: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioRelayDriver {
    fn from_config(pins: &RelayPinConfig) -> anyhow::Result<Self> {
        // Pin numbers are sanitized to be non-negative before this point.
        let light = PinDriver::output(unsafe { AnyOutputPin::new(pins.light_pin) })
            .context("failed to claim light relay pin")?;
        let vmc = PinDriver::output(unsafe { AnyOutputPin::new(pins.vmc_pin) })
            .context("failed to claim VMC relay pin")?;
        let heater = PinDriver::output(unsafe { AnyOutputPin::new(pins.heater_pin) })
            .context("failed to claim heater relay pin")?;
        let ac = PinDriver::output(unsafe { AnyOutputPin::new(pins.ac_pin) })
            .context("failed to claim AC relay pin")?;

        Ok(Self {
            light,
            vmc,
            heater,
            ac,
        })
    }

    fn all_off(&mut self) -> anyhow::Result<()> {
        for actuator in Actuator::ALL {
            self.write(actuator, false)?;
        }
        Ok(())
    }

    fn pin(&mut self, actuator: Actuator) -> &mut PinDriver<'static, AnyOutputPin, Output> {
        match actuator {
            Actuator::Light => &mut self.light,
            Actuator::Vmc => &mut self.vmc,
            Actuator::Heater => &mut self.heater,
            Actuator::Ac => &mut self.ac,
        }
    }
}

impl RelayDriver for GpioRelayDriver {
    fn write(&mut self, actuator: Actuator, level: bool) -> anyhow::Result<()> {
        info!(
            "relay {} -> {}",
            actuator.attribute_key(),
            if level { "on" } else { "off" }
        );
        let pin = self.pin(actuator);
        if level {
            pin.set_high()?;
        } else {
            pin.set_low()?;
        }
        Ok(())
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = RuntimeConfig::default();
    runtime.relays.sanitize();
    ensure_network_defaults(&mut runtime);

    // Fail fast: a broken method table is a configuration error, not
    // something to discover on the first inbound command.
    let dispatcher = RpcDispatcher::with_switch_methods()
        .map_err(|err| anyhow!("RPC method table is invalid: {err}"))?;

    let Peripherals { modem, .. } = Peripherals::take()?;

    let mut driver = GpioRelayDriver::from_config(&runtime.relays)?;
    driver.all_off()?;
    let bank = RelayBank::new();

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => wifi,
        Err(err) => restart_device(&format!("wifi startup failed: {err:#}")),
    };
    disable_wifi_power_save();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let (mqtt, conn) = create_mqtt_client(&runtime.network)?;
    let link = Link::new();
    spawn_rpc_receiver(link, conn, mqtt, bank, driver, dispatcher);

    // Keep the wifi driver alive for the program lifetime.
    let _wifi = wifi;
    let mut wifi_disconnected_since: Option<Instant> = None;

    info!("controller ready");

    loop {
        feed_watchdog();
        maintain_wifi_health(&mut wifi_disconnected_since);
        thread::sleep(Duration::from_secs(1));
    }
}

// All relay mutation happens on this one thread, so every {output, mirror}
// update stays indivisible without locking.
fn spawn_rpc_receiver(
    link: Link,
    mut conn: EspMqttConnection,
    mut mqtt: EspMqttClient<'static>,
    mut bank: RelayBank,
    mut driver: GpioRelayDriver,
    dispatcher: RpcDispatcher,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("command transport connected");
                        link.set_online(true);
                        // Subscriptions do not survive a broker reconnect.
                        if let Err(err) = mqtt.subscribe(TOPIC_RPC_REQUEST_SUB, QoS::AtLeastOnce) {
                            warn!("rpc subscribe failed: {err:?}");
                        }
                        publish_initial_attributes(&mut mqtt, &bank);
                    }
                    EventPayload::Disconnected => {
                        warn!("command transport disconnected");
                        link.set_online(false);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // We only process full MQTT payloads.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        handle_request(
                            &mut mqtt,
                            &link,
                            &dispatcher,
                            &mut bank,
                            &mut driver,
                            topic,
                            data,
                        );
                    }
                    _ => {}
                },
                Err(err) => {
                    link.set_online(false);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn handle_request(
    mqtt: &mut EspMqttClient<'static>,
    link: &Link,
    dispatcher: &RpcDispatcher,
    bank: &mut RelayBank,
    driver: &mut GpioRelayDriver,
    topic: &str,
    data: &[u8],
) {
    if data.len() > MAX_MESSAGE_RECEIVE_SIZE {
        warn!(
            "dropping oversized RPC payload on {topic} ({} bytes)",
            data.len()
        );
        return;
    }
    let Some(request_id) = request_id_from_topic(topic) else {
        warn!("ignoring message on unexpected topic {topic}");
        return;
    };

    let response = match serde_json::from_slice::<RpcRequest>(data) {
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

    let response_topic = rpc_response_topic(request_id);
    if let Err(err) = mqtt.publish(
        &response_topic,
        QoS::AtLeastOnce,
        false,
        response.to_string().as_bytes(),
    ) {
        warn!("rpc response publish failed: {err:?}");
    }
}

fn publish_attribute(
    mqtt: &mut EspMqttClient<'static>,
    link: &Link,
    actuator: Actuator,
    state: bool,
) {
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
    if let Err(err) = mqtt.enqueue(TOPIC_ATTRIBUTES, QoS::AtLeastOnce, false, &payload) {
        warn!("attribute publish failed: {err:?}");
    }
}

fn publish_initial_attributes(mqtt: &mut EspMqttClient<'static>, bank: &RelayBank) {
    let mut packet = TelemetryPacket::new();
    packet.push_text(KEY_VERSION, env!("CARGO_PKG_VERSION"));
    for (actuator, state) in bank.states() {
        packet.push_flag(actuator.attribute_key(), state);
    }

    match packet.into_payload() {
        Ok(payload) => {
            if let Err(err) = mqtt.publish(TOPIC_ATTRIBUTES, QoS::AtLeastOnce, false, &payload) {
                warn!("initial attribute publish failed: {err:?}");
            }
        }
        Err(err) => warn!("initial attribute packet dropped: {err}"),
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.tb_host, network.tb_port);

    let conf = MqttClientConfiguration {
        client_id: Some("domus-controller"),
        // ThingsBoard device auth: the access token is the MQTT username.
        username: if network.device_token.is_empty() {
            None
        } else {
            Some(network.device_token.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(&url, &conf)?)
}

fn ensure_network_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }
    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or("CHANGE_ME").to_string();
    }
    if let Some(host) = option_env!("TB_HOST") {
        runtime.network.tb_host = host.to_string();
    }
    if runtime.network.device_token.is_empty() {
        runtime.network.device_token = option_env!("TB_TOKEN").unwrap_or("").to_string();
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            },
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow::Error::from(err)
            .context(format!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed"))),
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn maintain_wifi_health(wifi_disconnected_since: &mut Option<Instant>) {
    if is_wifi_station_connected() {
        *wifi_disconnected_since = None;
        return;
    }

    match wifi_disconnected_since {
        Some(disconnected_since) if disconnected_since.elapsed() >= WIFI_RESTART_GRACE => {
            restart_device(&format!(
                "wifi disconnected for {}s",
                WIFI_RESTART_GRACE.as_secs()
            ));
        }
        Some(_) => {}
        None => *wifi_disconnected_since = Some(Instant::now()),
    }
}

fn restart_device(reason: &str) -> ! {
    warn!("{reason}; restarting device");
    thread::sleep(Duration::from_millis(200));
    unsafe { esp_idf_svc::sys::esp_restart() };
    #[allow(unreachable_code)]
    {
        unreachable!("esp_restart returned")
    }
}
