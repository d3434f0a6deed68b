//! Scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::backoff::BackoffConfig;
use crate::config::BridgeConfig;
use crate::error::TransportError;
use crate::path::{ObjectPath, PeripheralAddress};
use crate::transport::{
    DiscoveryTransport, NotifyHandle, PropertyChange, PropertyStream, Transport,
};

pub const CHAR_PATH: &str = "/org/bluez/hci0/dev_5C_12_03_6A_24_E7/service0010/char0011";

/// Config with millisecond timings so loop tests stay fast.
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::new(PeripheralAddress::from_channel(CHAR_PATH).unwrap());
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.connect_timeout = Duration::from_millis(500);
    config.call_timeout = Duration::from_millis(500);
    config.settle_delay = Duration::from_millis(10);
    let backoff = BackoffConfig::new(
        Duration::from_millis(100),
        Duration::from_millis(100),
        Duration::from_millis(300),
    );
    config.reconnect_backoff = backoff;
    config.acquire_backoff = backoff;
    config.scan_join_timeout = Duration::from_millis(200);
    config.wake_notice = b"+WAKE\n".to_vec();
    config
}

#[derive(Default)]
pub struct MockTransport {
    connect_script: Mutex<VecDeque<Result<(), TransportError>>>,
    connect_times: Mutex<Vec<Instant>>,
    acquire_script: Mutex<VecDeque<TransportError>>,
    acquire_calls: AtomicUsize,
    write_script: Mutex<VecDeque<Result<(), TransportError>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    disconnect_calls: AtomicUsize,
    filter_calls: AtomicUsize,
    start_discovery_calls: AtomicUsize,
    stop_discovery_calls: AtomicUsize,
    /// Peripheral ends of every acquired notify pipe, newest last.
    peripherals: Mutex<Vec<DuplexStream>>,
    properties: Mutex<Option<mpsc::UnboundedSender<PropertyChange>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_connect(&self, result: Result<(), TransportError>) {
        self.connect_script.lock().unwrap().push_back(result);
    }

    pub fn push_acquire_err(&self, err: TransportError) {
        self.acquire_script.lock().unwrap().push_back(err);
    }

    pub fn push_write(&self, result: Result<(), TransportError>) {
        self.write_script.lock().unwrap().push_back(result);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_times.lock().unwrap().len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().unwrap().clone()
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn filter_calls(&self) -> usize {
        self.filter_calls.load(Ordering::SeqCst)
    }

    pub fn start_discovery_calls(&self) -> usize {
        self.start_discovery_calls.load(Ordering::SeqCst)
    }

    pub fn stop_discovery_calls(&self) -> usize {
        self.stop_discovery_calls.load(Ordering::SeqCst)
    }

    /// Take the peripheral end of the most recently acquired notify pipe.
    pub fn take_peripheral(&self) -> Option<DuplexStream> {
        self.peripherals.lock().unwrap().pop()
    }

    pub fn is_subscribed(&self) -> bool {
        self.properties
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Close the current subscription from the transport side.
    pub fn end_subscription(&self) {
        self.properties.lock().unwrap().take();
    }

    /// Deliver a property change to the current subscriber. False if nobody listens.
    pub fn emit(&self, change: PropertyChange) -> bool {
        match self.properties.lock().unwrap().as_ref() {
            Some(tx) => tx.send(change).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Notify = DuplexStream;

    async fn connect(&self, _device: &ObjectPath, _timeout: Duration) -> Result<(), TransportError> {
        self.connect_times.lock().unwrap().push(Instant::now());
        self.connect_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn disconnect(&self, _device: &ObjectPath) -> Result<(), TransportError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_channel(&self, _channel: &ObjectPath, bytes: &[u8]) -> Result<(), TransportError> {
        self.writes.lock().unwrap().push(bytes.to_vec());
        self.write_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn acquire_notify(
        &self,
        _channel: &ObjectPath,
    ) -> Result<NotifyHandle<DuplexStream>, TransportError> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.acquire_script.lock().unwrap().pop_front() {
            return Err(err);
        }
        let (bridge_end, peripheral_end) = tokio::io::duplex(1024);
        self.peripherals.lock().unwrap().push(peripheral_end);
        Ok(NotifyHandle::new(bridge_end, 20))
    }

    async fn set_discovery_filter(
        &self,
        _adapter: &ObjectPath,
        _transport: DiscoveryTransport,
    ) -> Result<(), TransportError> {
        self.filter_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_discovery(&self, _adapter: &ObjectPath) -> Result<(), TransportError> {
        self.start_discovery_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_discovery(&self, _adapter: &ObjectPath) -> Result<(), TransportError> {
        self.stop_discovery_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe_property_changes(
        &self,
        _device: &ObjectPath,
    ) -> Result<PropertyStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.properties.lock().unwrap() = Some(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|change| (change, rx))
        });
        Ok(Box::pin(stream))
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
