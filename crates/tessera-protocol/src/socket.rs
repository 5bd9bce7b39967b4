//! TCP socket options shared by the lobby server and peer transports.
//!
//! Both sides apply the same [`SocketConfig`]: game payload wants
//! `TCP_NODELAY`, and keepalive probes let a silent NAT drop surface as a
//! connection loss instead of a hang.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

/// Socket options applied to every connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm for lower latency. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 30s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 5s.
    pub keepalive_interval: Duration,
    /// Probes before the connection is declared dead. Default: 3.
    pub keepalive_retries: u32,
    /// Enable `SO_REUSEADDR` on listeners. Default: true except on Windows.
    pub reuse_addr: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
        }
    }
}

/// Apply socket configuration to a connected [`TcpStream`].
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);

        // Retries are supported on Linux and Windows but not macOS.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Create a listener with the configured options. Must be called from within
/// a tokio runtime.
pub async fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    TcpListener::from_std(socket.into())
}

/// `0.0.0.0:port`.
pub fn unspecified_v4(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_nodelay_is_set() {
        let config = SocketConfig::default();
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        configure_stream(&client, &config).unwrap();
        assert!(client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_keepalive_is_configured() {
        let config = SocketConfig::default();
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        configure_stream(&client, &config).unwrap();
        assert!(SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let config = SocketConfig {
            reuse_addr: false,
            ..Default::default()
        };
        let first = create_listener("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();
        assert!(create_listener(taken, &config).await.is_err());
    }

    #[test]
    fn test_unspecified_v4() {
        let addr = unspecified_v4(4000);
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 4000);
    }
}
