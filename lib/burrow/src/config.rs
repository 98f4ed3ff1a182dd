use std::net::Ipv4Addr;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use loam::crypto::Method;

use crate::ack;
use crate::error::{Error, Result};
use crate::iface::IfaceConfig;
use crate::merger::{MergerConfig, ThreadingBy};
use crate::message::Compression;
use crate::packet::HashSource;
use crate::retry::RetryConfig;

/// How outbound packets choose among the open connections.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortStrategy {
    Random,
    Hash,
}

impl PortStrategy {
    pub fn from_name(name: &str) -> Option<PortStrategy> {
        match name {
            "random" => Some(PortStrategy::Random),
            "hash" => Some(PortStrategy::Hash),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerConfig {
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> LoggerConfig {
        LoggerConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemConfig {
    pub client_id: String,
    pub shell: String,
}

impl Default for SystemConfig {
    fn default() -> SystemConfig {
        SystemConfig {
            client_id: String::new(),
            shell: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub host: String,
    pub port_min: u16,
    pub port_max: u16,
    #[serde(rename = "useTCP")]
    pub use_tcp: bool,
    #[serde(rename = "useUDP")]
    pub use_udp: bool,
    pub authentication_timeout: u64,
    pub handshake_timeout: u64,
    pub max_connection_attempts: u32,
    pub keepalive_timeout: u64,
    pub keepalive_interval: u64,
    pub keepalive_probes: u32,
    pub port_selection_strategy: String,
    pub compression: String,
    pub compression_level: u8,
    pub obfuscate_data: bool,
    pub endpoint_hash: String,
}

impl Default for NetworkConfig {
    fn default() -> NetworkConfig {
        NetworkConfig {
            host: String::new(),
            port_min: 1977,
            port_max: 1986,
            use_tcp: false,
            use_udp: true,
            authentication_timeout: 10,
            handshake_timeout: 10,
            max_connection_attempts: 3,
            keepalive_timeout: 60,
            keepalive_interval: 2,
            keepalive_probes: 20,
            port_selection_strategy: "random".to_string(),
            compression: "none".to_string(),
            compression_level: 0,
            obfuscate_data: true,
            endpoint_hash: "source".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn max_ports(&self) -> usize {
        let mut protocols = 0;
        if self.use_tcp {
            protocols += 1;
        }
        if self.use_udp {
            protocols += 1;
        }
        usize::from(self.port_max - self.port_min + 1) * protocols
    }

    pub fn strategy(&self) -> Result<PortStrategy> {
        PortStrategy::from_name(&self.port_selection_strategy)
            .ok_or(Error::NoPortSelectionStrategy)
    }

    pub fn compression(&self) -> Compression {
        Compression::from_name(&self.compression)
    }

    pub fn endpoint_hash_source(&self) -> Result<HashSource> {
        HashSource::from_name(&self.endpoint_hash).ok_or_else(|| {
            Error::Validation(format!("unknown endpoint hash '{}'", self.endpoint_hash))
        })
    }

    fn validate(&self) -> Result<()> {
        if self.port_min > self.port_max {
            return Err(Error::Validation(format!(
                "portMin {} is above portMax {}",
                self.port_min, self.port_max
            )));
        }
        if !self.use_tcp && !self.use_udp {
            return Err(Error::Validation(
                "at least one of useTCP/useUDP must be enabled".to_string(),
            ));
        }
        self.strategy()?;
        self.endpoint_hash_source()?;
        if self.compression() == Compression::Lzo {
            return Err(Error::Validation(
                "lzo compression is not supported".to_string(),
            ));
        }
        if !["none", "lz4", "lzo", "zstd"].contains(&self.compression.as_str()) {
            return Err(Error::Validation(format!(
                "unknown compression '{}'",
                self.compression
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelConfig {
    pub mtu: usize,
    pub addr_min: String,
    pub addr_max: String,
    pub number_of_handler_threads: usize,
    pub encryption: String,
    pub interface_up: Vec<String>,
    pub interface_down: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> TunnelConfig {
        TunnelConfig {
            mtu: 1400,
            addr_min: "192.168.30.0".to_string(),
            addr_max: "192.168.50.0".to_string(),
            number_of_handler_threads: 4,
            encryption: "aes-256-ecb".to_string(),
            interface_up: Vec::new(),
            interface_down: Vec::new(),
        }
    }
}

impl TunnelConfig {
    pub fn method(&self) -> Result<Method> {
        Method::from_name(&self.encryption).ok_or_else(|| {
            Error::Validation(format!("unknown encryption method '{}'", self.encryption))
        })
    }

    pub fn addr_min_v4(&self) -> Result<Ipv4Addr> {
        self.addr_min
            .parse()
            .map_err(|_| Error::Validation(format!("invalid addrMin '{}'", self.addr_min)))
    }

    fn validate(&self) -> Result<()> {
        if !(576..=9000).contains(&self.mtu) {
            return Err(Error::Validation(format!("mtu {} out of range", self.mtu)));
        }
        if self.number_of_handler_threads == 0 {
            return Err(Error::Validation(
                "numberOfHandlerThreads must be at least 1".to_string(),
            ));
        }
        self.method()?;
        self.addr_min_v4()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamMergerSettings {
    pub threading_by: String,
    pub waiting_list_max_size: usize,
    #[serde(rename = "waitingListMaxTTL")]
    pub waiting_list_max_ttl: u64,
    pub stream_check_interval: u64,
    #[serde(rename = "streamTTL")]
    pub stream_ttl: u64,
}

impl Default for StreamMergerSettings {
    fn default() -> StreamMergerSettings {
        StreamMergerSettings {
            threading_by: "endpoint".to_string(),
            waiting_list_max_size: 1_048_576,
            waiting_list_max_ttl: 60,
            stream_check_interval: 60,
            stream_ttl: 300,
        }
    }
}

impl StreamMergerSettings {
    pub fn threading(&self) -> Result<ThreadingBy> {
        ThreadingBy::from_name(&self.threading_by).ok_or_else(|| {
            Error::Validation(format!("unknown threadingBy '{}'", self.threading_by))
        })
    }

    pub fn merger_config(&self, tracing: bool) -> Result<MergerConfig> {
        Ok(MergerConfig {
            threading_by: self.threading()?,
            waiting_list_max_size: self.waiting_list_max_size,
            waiting_list_max_ttl: Duration::from_secs(self.waiting_list_max_ttl),
            stream_check_interval: Duration::from_secs(self.stream_check_interval),
            stream_ttl: Duration::from_secs(self.stream_ttl),
            tracing,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    // The wire key keeps the historical spelling.
    #[serde(rename = "maxTimout")]
    pub max_timeout: u64,
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> RetrySettings {
        RetrySettings {
            max_timeout: 30,
            backoff_factor: 0.2,
        }
    }
}

impl RetrySettings {
    pub fn retry_config(&self, network: &NetworkConfig, tracing: bool) -> RetryConfig {
        RetryConfig {
            max_timeout: Duration::from_secs(self.max_timeout),
            backoff_factor: self.backoff_factor,
            keepalive_timeout: Duration::from_secs(network.keepalive_timeout),
            keepalive_interval: Duration::from_secs(network.keepalive_interval),
            keepalive_probes: network.keepalive_probes,
            tracing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AckSettings {
    #[serde(rename = "waitingTimePercentOfRTO")]
    pub waiting_time_percent_of_rto: f64,
    pub endpoint_life_time: u64,
}

impl Default for AckSettings {
    fn default() -> AckSettings {
        AckSettings {
            waiting_time_percent_of_rto: 50.0,
            endpoint_life_time: 60,
        }
    }
}

impl AckSettings {
    pub fn ack_config(&self, max_size: usize, tracing: bool) -> ack::AckConfig {
        ack::AckConfig {
            max_size,
            waiting_time_percent: self.waiting_time_percent_of_rto,
            tracing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthenticationConfig {
    /// Base64 of the pre-shared primary key.
    pub key: String,
}

impl Default for AuthenticationConfig {
    fn default() -> AuthenticationConfig {
        AuthenticationConfig { key: String::new() }
    }
}

impl AuthenticationConfig {
    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        if self.key.is_empty() {
            return Ok(Vec::new());
        }
        base64::decode(&self.key)
            .map_err(|_| Error::Validation("authentication key is not valid base64".to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TracingConfig {
    pub socket: bool,
    pub interface: bool,
    pub stream_merger: bool,
    pub retry: bool,
    pub ack: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerConfig {
    pub logger: LoggerConfig,
    pub system: SystemConfig,
    pub network: NetworkConfig,
    pub tunnel: TunnelConfig,
    pub stream_merger: StreamMergerSettings,
    pub retry: RetrySettings,
    #[serde(rename = "Acknowledgement")]
    pub ack: AckSettings,
    pub authentication: AuthenticationConfig,
    pub users: Vec<User>,
    pub max_sessions_count: usize,
    pub tracing: TracingConfig,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            logger: LoggerConfig::default(),
            system: SystemConfig::default(),
            network: NetworkConfig::default(),
            tunnel: TunnelConfig::default(),
            stream_merger: StreamMergerSettings::default(),
            retry: RetrySettings::default(),
            ack: AckSettings::default(),
            authentication: AuthenticationConfig::default(),
            users: Vec::new(),
            max_sessions_count: 100,
            tracing: TracingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        self.tunnel.validate()?;
        self.stream_merger.threading()?;
        if self.users.is_empty() {
            return Err(Error::Validation("no users configured".to_string()));
        }
        validate_key(&self.authentication, self.tunnel.method()?)?;
        Ok(())
    }

    pub fn iface_config(&self) -> IfaceConfig {
        IfaceConfig {
            mtu: self.tunnel.mtu,
            endpoint_ttl: self.ack.endpoint_life_time,
            up_commands: self.tunnel.interface_up.clone(),
            down_commands: self.tunnel.interface_down.clone(),
            tracing: self.tracing.interface,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClientConnection {
    pub name: String,
    pub server: NetworkConfig,
    pub authentication: AuthenticationConfig,
    pub user: User,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClientConfig {
    pub logger: LoggerConfig,
    pub system: SystemConfig,
    pub stream_merger: StreamMergerSettings,
    pub retry: RetrySettings,
    #[serde(rename = "Acknowledgement")]
    pub ack: AckSettings,
    pub connection: ClientConnection,
    pub tracing: TracingConfig,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        self.connection.server.validate()?;
        self.connection.tunnel.validate()?;
        self.stream_merger.threading()?;
        if self.connection.user.name.is_empty() {
            return Err(Error::Validation("user name is empty".to_string()));
        }
        if self.system.client_id.is_empty() {
            return Err(Error::Validation("clientId is empty".to_string()));
        }
        validate_key(&self.connection.authentication, self.connection.tunnel.method()?)?;
        Ok(())
    }

    pub fn iface_config(&self) -> IfaceConfig {
        IfaceConfig {
            mtu: self.connection.tunnel.mtu,
            endpoint_ttl: self.ack.endpoint_life_time,
            up_commands: self.connection.tunnel.interface_up.clone(),
            down_commands: self.connection.tunnel.interface_down.clone(),
            tracing: self.tracing.interface,
        }
    }
}

fn validate_key(auth: &AuthenticationConfig, method: Method) -> Result<()> {
    let key = auth.key_bytes()?;
    if key.len() != method.key_size() {
        return Err(Error::Validation(format!(
            "authentication key must be {} bytes for {}, got {}",
            method.key_size(),
            method.name(),
            key.len()
        )));
    }
    Ok(())
}

pub fn load_server(path: &str) -> Result<ServerConfig> {
    serdeconv::from_toml_file(path).map_err(|err| Error::Validation(err.to_string()))
}

pub fn load_client(path: &str) -> Result<ClientConfig> {
    serdeconv::from_toml_file(path).map_err(|err| Error::Validation(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_server() -> ServerConfig {
        let mut cfg = ServerConfig::default();
        cfg.users.push(User {
            name: "alice".to_string(),
            password: "pw".to_string(),
        });
        cfg.authentication.key = base64::encode(loam::crypto::generate_key());
        cfg.max_sessions_count = 100;
        cfg
    }

    #[test]
    fn test_defaults() {
        let cfg: ServerConfig = serdeconv::from_toml_str("").unwrap();
        assert_eq!(cfg.network.port_min, 1977);
        assert_eq!(cfg.network.port_max, 1986);
        assert!(cfg.network.use_udp);
        assert!(!cfg.network.use_tcp);
        assert_eq!(cfg.tunnel.mtu, 1400);
        assert_eq!(cfg.tunnel.encryption, "aes-256-ecb");
        assert_eq!(cfg.stream_merger.threading_by, "endpoint");
        assert_eq!(cfg.stream_merger.waiting_list_max_size, 1_048_576);
        assert_eq!(cfg.retry.max_timeout, 30);
        assert!((cfg.retry.backoff_factor - 0.2).abs() < f64::EPSILON);
        assert!((cfg.ack.waiting_time_percent_of_rto - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_document() {
        let cfg: ServerConfig = serdeconv::from_toml_str(
            r#"
[Network]
portMin = 2000
portMax = 2003
useTCP = true
compression = "lz4"

[Tunnel]
mtu = 1300
encryption = "aes-256-gcm"

[StreamMerger]
threadingBy = "session"
waitingListMaxTTL = 30

[Retry]
maxTimout = 15

[[Users]]
name = "bob"
password = "secret"
"#,
        )
        .unwrap();

        assert_eq!(cfg.network.port_min, 2000);
        assert!(cfg.network.use_tcp);
        assert_eq!(cfg.network.compression(), Compression::Lz4);
        assert_eq!(cfg.tunnel.mtu, 1300);
        assert_eq!(cfg.tunnel.method().unwrap(), Method::Aes256Gcm);
        assert_eq!(cfg.stream_merger.threading().unwrap(), ThreadingBy::Session);
        assert_eq!(cfg.stream_merger.waiting_list_max_ttl, 30);
        assert_eq!(cfg.retry.max_timeout, 15);
        assert_eq!(cfg.users.len(), 1);
    }

    #[test]
    fn test_valid_config_passes() {
        valid_server().validate().unwrap();
    }

    #[test]
    fn test_rejects_inverted_port_range() {
        let mut cfg = valid_server();
        cfg.network.port_min = 3000;
        cfg.network.port_max = 2000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_no_transports() {
        let mut cfg = valid_server();
        cfg.network.use_tcp = false;
        cfg.network.use_udp = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_lzo() {
        let mut cfg = valid_server();
        cfg.network.compression = "lzo".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_mtu() {
        let mut cfg = valid_server();
        cfg.tunnel.mtu = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_missing_users() {
        let mut cfg = valid_server();
        cfg.users.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_short_key() {
        let mut cfg = valid_server();
        cfg.authentication.key = base64::encode(&[1, 2, 3]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        let mut cfg = valid_server();
        cfg.network.port_selection_strategy = "roulette".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_client_validation() {
        let mut cfg = ClientConfig::default();
        cfg.connection.user.name = "alice".to_string();
        cfg.system.client_id = "client-1".to_string();
        cfg.connection.authentication.key = base64::encode(loam::crypto::generate_key());
        cfg.validate().unwrap();

        cfg.system.client_id.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_max_ports() {
        let mut network = NetworkConfig::default();
        assert_eq!(network.max_ports(), 10);
        network.use_tcp = true;
        assert_eq!(network.max_ports(), 20);
    }
}
