use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::{FreeRtos, BLOCK},
    gpio::Gpio35,
    i2c::{I2cConfig, I2cDriver},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, EventPayload, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use domus_common::{
    config::NetworkConfig,
    telemetry::{
        Link, TelemetryPacket, KEY_BATTERY, KEY_HUMIDITY, KEY_LUX, KEY_TEMPERATURE, KEY_VOC,
        TOPIC_TELEMETRY,
    },
    AlarmEngine, AlarmEvent, RuntimeConfig, SensorReading, SensorSource,
};

use crate::voc::VocIndex;

const I2C_SDA_PIN: i32 = 21;
const I2C_SCL_PIN: i32 = 22;

const AHT20_ADDR: u8 = 0x38;
const SGP40_ADDR: u8 = 0x59;
const BH1750_ADDR: u8 = 0x23;

const AHT20_MEASURE_DELAY_MS: u32 = 80;
const SGP40_MEASURE_DELAY_MS: u32 = 30;
const BH1750_MEASURE_DELAY_MS: u32 = 180;

// Feather-style board: VBAT behind a 1/2 divider on GPIO35 (A13).
const BATTERY_DIVIDER: f32 = 2.0;

const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_RESTART_GRACE: Duration = Duration::from_secs(300);
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

struct SensorSuite {
    i2c: I2cDriver<'static>,
    adc: AdcDriver<'static, ADC1>,
    battery_pin: Gpio35,
    voc: VocIndex,
    last_temperature: f32,
    last_humidity: f32,
}

impl SensorSuite {
    fn new(
        i2c: I2cDriver<'static>,
        adc: AdcDriver<'static, ADC1>,
        battery_pin: Gpio35,
        voc_warmup_samples: u32,
    ) -> Self {
        Self {
            i2c,
            adc,
            battery_pin,
            voc: VocIndex::new(voc_warmup_samples),
            last_temperature: 25.0,
            last_humidity: 50.0,
        }
    }

    fn read_aht20(&mut self) -> Option<(f32, f32)> {
        if let Err(err) = self.i2c.write(AHT20_ADDR, &[0xAC, 0x33, 0x00], BLOCK) {
            warn!("AHT20 trigger failed: {err:?}");
            return None;
        }
        FreeRtos::delay_ms(AHT20_MEASURE_DELAY_MS);

        let mut buf = [0_u8; 7];
        if let Err(err) = self.i2c.read(AHT20_ADDR, &mut buf, BLOCK) {
            warn!("AHT20 read failed: {err:?}");
            return None;
        }
        // Bit 7 of the status byte is the busy flag.
        if buf[0] & 0x80 != 0 {
            warn!("AHT20 still busy after measurement delay");
            return None;
        }

        let raw_humidity =
            ((buf[1] as u32) << 12) | ((buf[2] as u32) << 4) | ((buf[3] as u32) >> 4);
        let raw_temp = (((buf[3] as u32) & 0x0F) << 16) | ((buf[4] as u32) << 8) | (buf[5] as u32);

        let humidity = raw_humidity as f32 / 1_048_576.0 * 100.0;
        let temperature = raw_temp as f32 / 1_048_576.0 * 200.0 - 50.0;
        Some((temperature, humidity))
    }

    // Raw VOC measurement with on-chip humidity/temperature compensation,
    // folded through the index scaler.
    fn read_voc(&mut self) -> Option<f32> {
        let humidity_ticks = ((self.last_humidity.clamp(0.0, 100.0) / 100.0) * 65_535.0) as u16;
        let temp_ticks = (((self.last_temperature.clamp(-45.0, 130.0) + 45.0) / 175.0)
            * 65_535.0) as u16;

        let mut command = [0_u8; 8];
        command[0] = 0x26;
        command[1] = 0x0F;
        command[2..4].copy_from_slice(&humidity_ticks.to_be_bytes());
        command[4] = sensirion_crc8(&command[2..4]);
        command[5..7].copy_from_slice(&temp_ticks.to_be_bytes());
        command[7] = sensirion_crc8(&command[5..7]);

        if let Err(err) = self.i2c.write(SGP40_ADDR, &command, BLOCK) {
            warn!("SGP40 measure command failed: {err:?}");
            return None;
        }
        FreeRtos::delay_ms(SGP40_MEASURE_DELAY_MS);

        let mut buf = [0_u8; 3];
        if let Err(err) = self.i2c.read(SGP40_ADDR, &mut buf, BLOCK) {
            warn!("SGP40 read failed: {err:?}");
            return None;
        }
        if sensirion_crc8(&buf[0..2]) != buf[2] {
            warn!("SGP40 response failed CRC check");
            return None;
        }

        let raw_ticks = u16::from_be_bytes([buf[0], buf[1]]);
        self.voc.update(f32::from(raw_ticks))
    }

    fn read_lux(&mut self) -> Option<f32> {
        // One-time high-resolution mode; the sensor powers down afterwards.
        if let Err(err) = self.i2c.write(BH1750_ADDR, &[0x20], BLOCK) {
            warn!("BH1750 trigger failed: {err:?}");
            return None;
        }
        FreeRtos::delay_ms(BH1750_MEASURE_DELAY_MS);

        let mut buf = [0_u8; 2];
        if let Err(err) = self.i2c.read(BH1750_ADDR, &mut buf, BLOCK) {
            warn!("BH1750 read failed: {err:?}");
            return None;
        }
        Some(f32::from(u16::from_be_bytes(buf)) / 1.2)
    }

    fn read_battery(&mut self) -> Option<f32> {
        let config = AdcChannelConfig {
            attenuation: DB_11,
            calibration: true,
            ..Default::default()
        };
        let mut channel = match AdcChannelDriver::new(&self.adc, &mut self.battery_pin, &config) {
            Ok(channel) => channel,
            Err(err) => {
                warn!("battery ADC setup failed: {err:?}");
                return None;
            }
        };

        match self.adc.read(&mut channel) {
            Ok(millivolts) => Some(f32::from(millivolts) / 1_000.0 * BATTERY_DIVIDER),
            Err(err) => {
                warn!("battery ADC read failed: {err:?}");
                None
            }
        }
    }
}

impl SensorSource for SensorSuite {
    fn sample(&mut self) -> SensorReading {
        let aht = self.read_aht20();
        if let Some((temperature, humidity)) = aht {
            // Remembered for SGP40 compensation on cycles where the AHT20
            // read fails.
            self.last_temperature = temperature;
            self.last_humidity = humidity;
        }

        SensorReading {
            temperature: aht.map(|(temperature, _)| temperature),
            humidity: aht.map(|(_, humidity)| humidity),
            voc: self.read_voc(),
            lux: self.read_lux(),
            battery: self.read_battery(),
        }
    }
}

fn sensirion_crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = RuntimeConfig::default();
    runtime.sensor.sanitize();
    ensure_network_defaults(&mut runtime);

    let Peripherals {
        modem,
        pins,
        i2c0,
        adc1,
        ..
    } = Peripherals::take()?;

    let i2c_config = I2cConfig::new().baudrate(100.kHz().into());
    let i2c = I2cDriver::new(i2c0, pins.gpio21, pins.gpio22, &i2c_config)
        .context("failed to initialize I2C bus")?;
    info!("I2C bus ready on SDA={I2C_SDA_PIN} SCL={I2C_SCL_PIN}");

    let adc = AdcDriver::new(adc1).context("failed to initialize battery ADC")?;
    let mut sensors = SensorSuite::new(i2c, adc, pins.gpio35, runtime.sensor.voc_warmup_samples);

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => wifi,
        Err(err) => restart_device(&format!("wifi startup failed: {err:#}")),
    };
    disable_wifi_power_save();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let (mut mqtt, conn) = create_mqtt_client(&runtime.network)?;
    let link = Link::new();
    spawn_mqtt_receiver(link.clone(), conn);

    let mut engine = AlarmEngine::new(runtime.thresholds);
    let poll_interval = Duration::from_millis(runtime.sensor.poll_interval_ms);

    // Keep the wifi driver alive for the program lifetime.
    let _wifi = wifi;
    let mut wifi_disconnected_since: Option<Instant> = None;

    info!("sensor loop started");

    loop {
        feed_watchdog();
        maintain_wifi_health(&mut wifi_disconnected_since);

        let reading = sensors.sample();
        publish_reading(&mut mqtt, &link, &reading);
        for event in engine.evaluate_reading(&reading) {
            publish_alarm(&mut mqtt, &link, event);
        }

        thread::sleep(poll_interval);
    }
}

fn publish_reading(mqtt: &mut EspMqttClient<'static>, link: &Link, reading: &SensorReading) {
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
        return;
    }

    match packet.into_payload() {
        Ok(payload) => {
            if let Err(err) = mqtt.publish(TOPIC_TELEMETRY, QoS::AtLeastOnce, false, &payload) {
                warn!("telemetry publish failed: {err:?}");
            }
        }
        Err(err) => warn!("telemetry packet dropped: {err}"),
    }
}

fn publish_alarm(mqtt: &mut EspMqttClient<'static>, link: &Link, event: AlarmEvent) {
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
    // enqueue: edge events go through the client outbox and survive a
    // temporarily offline broker connection.
    if let Err(err) = mqtt.enqueue(TOPIC_TELEMETRY, QoS::AtLeastOnce, false, &payload) {
        warn!("alarm publish failed: {err:?}");
    }
}

fn spawn_mqtt_receiver(link: Link, mut conn: EspMqttConnection) {
    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(8192)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("telemetry transport connected");
                        link.set_online(true);
                    }
                    EventPayload::Disconnected => {
                        warn!("telemetry transport disconnected");
                        link.set_online(false);
                    }
                    _ => {}
                },
                Err(err) => {
                    link.set_online(false);
                    warn!("sensor mqtt poll error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .expect("failed to spawn mqtt thread");
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.tb_host, network.tb_port);

    let conf = MqttClientConfiguration {
        client_id: Some("domus-sensor"),
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
