use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::game::constants::net::{
    DATA_BUFFER_SIZE, DEFAULT_PORT, HEADER_SIZE, INBOUND_QUEUE_CAPACITY, MAX_CLIENTS, MAX_FRAME_SIZE, TICK_RATE,
};
use crate::game::scene::SceneTable;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind both sockets to
    pub bind_address: IpAddr,
    /// Reliable stream port
    pub tcp_port: u16,
    /// Datagram port
    pub udp_port: u16,
    /// Maximum simultaneous clients; peer IDs are 1..=max_clients
    pub max_clients: usize,
    /// Socket read buffer and maximum datagram size
    pub data_buffer_size: usize,
    /// Largest reliable frame accepted before the peer is dropped
    pub max_frame_size: usize,
    /// Session ticks per second
    pub tick_rate: u32,
    /// Packet events buffered between ticks
    pub inbound_capacity: usize,
    /// Greeting sent in `Welcome`
    pub welcome_message: String,
    /// Scenes synchronized from the start
    pub builtin_scenes: Vec<String>,
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            tcp_port: DEFAULT_PORT,
            udp_port: DEFAULT_PORT,
            max_clients: MAX_CLIENTS,
            data_buffer_size: DATA_BUFFER_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            tick_rate: TICK_RATE,
            inbound_capacity: INBOUND_QUEUE_CAPACITY,
            welcome_message: "Welcome to the session".to_string(),
            builtin_scenes: ["MainMenu", "IndoorRange", "Village", "Arena"]
                .into_iter()
                .map(String::from)
                .collect(),
            metrics_port: 9090,
        }
    }
}

/// Parse `name` from the environment, keeping `current` (with a warning) if it
/// is missing, unparsable or rejected by `valid`
fn env_parse<T, F>(name: &str, current: T, valid: F, rule: &str) -> T
where
    T: FromStr,
    F: Fn(&T) -> bool,
{
    let Ok(raw) = std::env::var(name) else {
        return current;
    };
    match raw.parse::<T>() {
        Ok(parsed) if valid(&parsed) => parsed,
        Ok(_) => {
            tracing::warn!("{} must be {}, using default", name, rule);
            current
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            current
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        config.tcp_port = env_parse("TCP_PORT", config.tcp_port, |p| *p > 0, "> 0");
        // the datagram port follows the stream port unless set explicitly
        config.udp_port = env_parse("UDP_PORT", config.tcp_port, |p| *p > 0, "> 0");
        config.max_clients = env_parse("MAX_CLIENTS", config.max_clients, |n| (1..=1000).contains(n), "1-1000");
        config.data_buffer_size = env_parse(
            "DATA_BUFFER_SIZE",
            config.data_buffer_size,
            |n| (512..=65_507).contains(n),
            "512-65507",
        );
        config.max_frame_size = env_parse(
            "MAX_FRAME_SIZE",
            config.max_frame_size,
            |n| *n >= 1024,
            "at least 1024",
        );
        config.tick_rate = env_parse("TICK_RATE", config.tick_rate, |n| (1..=240).contains(n), "1-240");
        config.inbound_capacity = env_parse(
            "INBOUND_QUEUE_CAPACITY",
            config.inbound_capacity,
            |n| *n > 0,
            "> 0",
        );

        if let Ok(message) = std::env::var("WELCOME_MESSAGE") {
            config.welcome_message = message;
        }

        if let Ok(scenes) = std::env::var("BUILTIN_SCENES") {
            let parsed: Vec<String> = scenes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if parsed.is_empty() {
                tracing::warn!("BUILTIN_SCENES is empty, using default");
            } else {
                config.builtin_scenes = parsed;
            }
        }

        config.metrics_port = env_parse("METRICS_PORT", config.metrics_port, |p| *p > 0, "> 0");

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.tcp_port == 0 || self.udp_port == 0 {
            return Err("Ports cannot be 0".to_string());
        }
        if self.max_clients == 0 {
            return Err("max_clients must be at least 1".to_string());
        }
        if self.max_clients > i32::MAX as usize {
            return Err("max_clients must fit a peer ID".to_string());
        }
        if self.data_buffer_size <= HEADER_SIZE {
            return Err("data_buffer_size must exceed the datagram header".to_string());
        }
        if self.max_frame_size < self.data_buffer_size {
            return Err("max_frame_size cannot be smaller than data_buffer_size".to_string());
        }
        if self.tick_rate == 0 {
            return Err("tick_rate must be at least 1".to_string());
        }
        if self.builtin_scenes.is_empty() {
            return Err("At least one built-in scene is required".to_string());
        }
        Ok(())
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.tcp_port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.udp_port)
    }

    /// Initial synchronized-scenes table
    pub fn scene_table(&self) -> SceneTable {
        SceneTable::with_builtin(self.builtin_scenes.iter().cloned())
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_tcp: SocketAddr,
    pub server_udp: SocketAddr,
    pub username: String,
    pub data_buffer_size: usize,
    pub max_frame_size: usize,
    pub tick_rate: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            server_tcp: SocketAddr::new(localhost, DEFAULT_PORT),
            server_udp: SocketAddr::new(localhost, DEFAULT_PORT),
            username: "Player".to_string(),
            data_buffer_size: DATA_BUFFER_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            tick_rate: TICK_RATE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.tcp_port, 7861);
        assert_eq!(config.udp_port, 7861);
        assert_eq!(config.max_clients, 32);
        assert_eq!(config.data_buffer_size, 4096);
        assert_eq!(config.builtin_scenes.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.tcp_port > 0);
        assert!(config.udp_port > 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.max_clients = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.max_frame_size = 100;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.builtin_scenes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scene_table_from_config() {
        let scenes = ServerConfig::default().scene_table();
        assert!(scenes.is_synchronized("Village"));
        assert!(!scenes.is_synchronized("ModdedMap"));
        assert_eq!(scenes.custom().count(), 0);
    }

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.server_tcp.port(), 7861);
        assert!(config.server_tcp.ip().is_loopback());
    }
}
