use async_trait::async_trait;
use serde::Deserialize;
use std::{io, time::Duration};
use tokio::time;
#[cfg(feature = "rtu")]
use tokio_modbus::client::rtu;
#[cfg(feature = "tcp")]
use tokio_modbus::client::tcp;
use tokio_modbus::client::{Context as ModbusClient, Reader};
use tracing::{debug, error, info};

use super::{
    register::{PowerRegister, RegisterKind},
    PowerSource, Unit, UnitId, Watts,
};
use crate::Error;

/// How to reach the inverter and which register holds its output
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub settings: ModbusProto,

    #[serde(alias = "slave", default = "default_modbus_unit", with = "UnitDef")]
    pub unit: Unit,

    /// Upper bound on each connect or read
    #[serde(with = "humantime_serde", default = "default_modbus_timeout")]
    pub timeout: Duration,

    #[serde(default)]
    pub register: PowerRegister,
}

#[derive(Deserialize)]
#[serde(remote = "tokio_modbus::slave::Slave")]
struct UnitDef(UnitId);

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "proto", rename_all = "lowercase")]
pub enum ModbusProto {
    #[cfg(feature = "tcp")]
    Tcp {
        host: String,

        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    #[cfg(feature = "rtu")]
    Rtu { tty: String, baud_rate: u32 },

    // Predominantly for if the binary is compiled without the protocol that the config asks for.
    #[serde(other)]
    Unknown,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: Default::default(),
            unit: default_modbus_unit(),
            timeout: default_modbus_timeout(),
            register: Default::default(),
        }
    }
}

impl Default for ModbusProto {
    #[cfg(feature = "tcp")]
    fn default() -> Self {
        ModbusProto::Tcp {
            host: "192.168.0.160".to_owned(),
            port: default_modbus_port(),
        }
    }

    #[cfg(not(feature = "tcp"))]
    fn default() -> Self {
        ModbusProto::Unknown
    }
}

impl Config {
    /// Point the connection at `host` over TCP, keeping the configured port if there already was one.
    #[cfg(feature = "tcp")]
    pub fn set_host(&mut self, host: String) -> crate::Result<()> {
        let port = match self.settings {
            ModbusProto::Tcp { port, .. } => port,
            _ => default_modbus_port(),
        };
        self.settings = ModbusProto::Tcp { host, port };
        Ok(())
    }

    #[cfg(not(feature = "tcp"))]
    pub fn set_host(&mut self, _host: String) -> crate::Result<()> {
        Err(Error::config("built without Modbus TCP support"))
    }
}

impl ModbusProto {
    pub async fn connect(&self, unit: Unit) -> crate::Result<ModbusClient> {
        let client = match *self {
            #[cfg(feature = "tcp")]
            ModbusProto::Tcp { ref host, port } => {
                let socket_addr = tokio::net::lookup_host((host.as_str(), port))
                    .await
                    .map_err(Error::Connectivity)?
                    .next()
                    .ok_or_else(|| {
                        Error::Connectivity(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("{host} did not resolve to an address"),
                        ))
                    })?;
                tcp::connect_slave(socket_addr, unit)
                    .await
                    .map_err(Error::Connectivity)?
            }

            #[cfg(feature = "rtu")]
            ModbusProto::Rtu { ref tty, baud_rate } => {
                let builder = tokio_serial::new(tty, baud_rate);
                let port = tokio_serial::SerialStream::open(&builder)
                    .map_err(|err| Error::Connectivity(err.into()))?;
                rtu::connect_slave(port, unit)
                    .await
                    .map_err(Error::Connectivity)?
            }

            ModbusProto::Unknown => {
                error!("Unrecognised protocol");
                Err(Error::config("unrecognised modbus protocol"))?
            }
        };
        Ok(client)
    }
}

/// Reads the inverter's output register, reconnecting on the next read whenever one fails.
#[derive(Debug)]
pub struct ModbusPowerSource {
    config: Config,
    client: Option<ModbusClient>,
}

impl ModbusPowerSource {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            client: None,
        }
    }

    async fn client(&mut self) -> crate::Result<&mut ModbusClient> {
        if self.client.is_none() {
            let connect = self.config.settings.connect(self.config.unit);
            let client = time::timeout(self.config.timeout, connect)
                .await
                .map_err(|_| timed_out("connect"))??;
            info!(settings = ?self.config.settings, "Connected to inverter");
            self.client = Some(client);
        }

        self.client
            .as_mut()
            .ok_or_else(|| Error::from("modbus client missing after connect"))
    }
}

#[async_trait]
impl PowerSource for ModbusPowerSource {
    async fn connect(&mut self) -> crate::Result<()> {
        self.client().await.map(|_| ())
    }

    async fn read_power(&mut self) -> crate::Result<Watts> {
        let register = self.config.register.clone();
        let timeout = self.config.timeout;
        let client = self.client().await?;

        debug!(
            address = register.address,
            size = register.size(),
            register_type = ?register.kind,
            value_type = register.type_name(),
            "Polling register",
        );

        let read = async {
            match register.kind {
                RegisterKind::Holding => {
                    client
                        .read_holding_registers(register.address, register.size())
                        .await
                }
                RegisterKind::Input => {
                    client
                        .read_input_registers(register.address, register.size())
                        .await
                }
            }
        };

        let result = match time::timeout(timeout, read).await {
            Ok(Ok(words)) => {
                debug!(raw = ?words, "Received value");
                register.parse_words(&words)
            }
            Ok(Err(err)) => Err(Error::Connectivity(err)),
            Err(_) => Err(timed_out("read")),
        };

        if matches!(result, Err(ref err) if err.is_connectivity()) {
            // Start from a fresh connection next time
            self.client = None;
        }

        result
    }

    async fn close(&mut self) -> crate::Result<()> {
        if let Some(mut client) = self.client.take() {
            debug!("Disconnecting from inverter");
            client.disconnect().await.map_err(Error::Connectivity)?;
        }
        Ok(())
    }
}

fn timed_out(operation: &str) -> Error {
    Error::Connectivity(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{operation} timed out"),
    ))
}

pub(crate) fn default_modbus_port() -> u16 {
    502
}

pub(crate) fn default_modbus_unit() -> Unit {
    tokio_modbus::slave::Slave(1)
}

pub(crate) fn default_modbus_timeout() -> Duration {
    Duration::from_secs(3)
}

#[cfg(feature = "tcp")]
#[test]
fn parse_minimal_tcp_connect_config() {
    use serde_json::json;
    let result = serde_json::from_value::<Config>(json!({
        "proto": "tcp",
        "host": "1.1.1.1"
    }));

    let connect = result.unwrap();
    assert!(matches!(
        connect.settings,
        ModbusProto::Tcp {
            ref host,
            port: 502
        } if host == "1.1.1.1"
    ));
    assert_eq!(connect.unit.0, 1);
    assert_eq!(connect.timeout, Duration::from_secs(3));
    assert_eq!(connect.register, PowerRegister::default());
}

#[cfg(feature = "rtu")]
#[test]
fn parse_minimal_rtu_connect_config() {
    use serde_json::json;
    let connect = serde_json::from_value::<Config>(json!({
        "proto": "rtu",
        "tty": "/dev/ttyUSB0",
        "baud_rate": 9600,
        "slave": 3,
    }))
    .unwrap();

    assert!(matches!(
        connect.settings,
        ModbusProto::Rtu {
            ref tty,
            baud_rate: 9600,
        } if tty == "/dev/ttyUSB0"
    ));
    assert_eq!(connect.unit.0, 3);
}

#[cfg(feature = "tcp")]
#[test]
fn set_host_keeps_port() {
    use serde_json::json;
    let mut connect = serde_json::from_value::<Config>(json!({
        "proto": "tcp",
        "host": "1.1.1.1",
        "port": 1502,
    }))
    .unwrap();

    connect.set_host("10.0.0.9".to_owned()).unwrap();
    assert!(matches!(
        connect.settings,
        ModbusProto::Tcp { ref host, port: 1502 } if host == "10.0.0.9"
    ));
}

#[tokio::test]
async fn unknown_protocol_is_a_config_error() {
    use serde_json::json;
    let connect = serde_json::from_value::<Config>(json!({ "proto": "carrier-pigeon" })).unwrap();
    assert!(matches!(connect.settings, ModbusProto::Unknown));

    let mut source = ModbusPowerSource::new(connect);
    assert!(matches!(
        source.connect().await,
        Err(Error::InvalidConfig(_))
    ));
}

#[cfg(feature = "tcp")]
#[tokio::test]
async fn unreachable_inverter_is_a_connectivity_error() {
    // Grab a free port, then close it again so nothing is listening there
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let mut source = ModbusPowerSource::new(Config {
        settings: ModbusProto::Tcp {
            host: "127.0.0.1".to_owned(),
            port,
        },
        ..Default::default()
    });

    assert!(source.connect().await.unwrap_err().is_connectivity());
    assert!(source.read_power().await.unwrap_err().is_connectivity());
    assert!(source.close().await.is_ok());
}
