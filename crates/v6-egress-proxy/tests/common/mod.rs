//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use v6_egress_proxy::{
    BinderError, InterfaceBinder, OutboundDialer, ProxyConfig, ProxyError, ProxyService,
};

/// Records interface calls instead of running `ip`.
#[derive(Default)]
pub struct RecordingBinder {
    pub provisioned: Mutex<Vec<Ipv6Addr>>,
    pub released: Mutex<Vec<Ipv6Addr>>,
}

#[async_trait]
impl InterfaceBinder for RecordingBinder {
    async fn provision_address(&self, address: Ipv6Addr) -> Result<(), BinderError> {
        self.provisioned.lock().push(address);
        Ok(())
    }

    async fn release_address(&self, address: Ipv6Addr) -> Result<(), BinderError> {
        self.released.lock().push(address);
        Ok(())
    }
}

/// Connects every tunnel to one local server, whatever the CONNECT target,
/// and remembers which source address was requested.
pub struct LoopbackDialer {
    pub upstream: SocketAddr,
    pub sources: Mutex<Vec<Ipv6Addr>>,
}

#[async_trait]
impl OutboundDialer for LoopbackDialer {
    async fn dial(&self, source: Ipv6Addr, _target: &str) -> io::Result<TcpStream> {
        self.sources.lock().push(source);
        TcpStream::connect(self.upstream).await
    }
}

/// Echo server on an ephemeral loopback port.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.into_split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub service: Arc<ProxyService>,
    pub binder: Arc<RecordingBinder>,
    pub dialer: Arc<LoopbackDialer>,
    pub handle: JoinHandle<Result<(), ProxyError>>,
}

impl TestProxy {
    pub async fn stop(self) {
        self.service.shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("proxy did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Config with fast retries suitable for tests.
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.tunnel.dial_attempts = 2;
    config.tunnel.initial_backoff = Duration::from_millis(5);
    config.tunnel.max_backoff = Duration::from_millis(10);
    config.tunnel.dial_timeout = Duration::from_secs(2);
    config
}

pub async fn start_proxy(config: ProxyConfig, upstream: SocketAddr) -> TestProxy {
    let binder = Arc::new(RecordingBinder::default());
    let dialer = Arc::new(LoopbackDialer {
        upstream,
        sources: Mutex::new(Vec::new()),
    });
    let service = Arc::new(
        ProxyService::new(
            config,
            Arc::clone(&binder) as Arc<dyn InterfaceBinder>,
            Arc::clone(&dialer) as Arc<dyn OutboundDialer>,
        )
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.run_with_listener(listener).await })
    };

    TestProxy {
        addr,
        service,
        binder,
        dialer,
        handle,
    }
}

/// Read an HTTP response head, up to and including the blank line.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed before end of head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Send a raw request and return the stream plus the response head.
pub async fn send_request(proxy: SocketAddr, request: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = tokio::time::timeout(Duration::from_secs(5), read_head(&mut stream))
        .await
        .expect("no response head");
    (stream, head)
}

pub fn connect_request(target: &str, source: Option<&str>) -> String {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(source) = source {
        request.push_str(&format!("x-proxy-ip: {source}\r\n"));
    }
    request.push_str("\r\n");
    request
}

pub fn status_of(head: &str) -> u16 {
    head.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("malformed status line")
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
