//! Connection manager: connect → settle → acquire-notify → ready, and reconnect with backoff.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::BridgeConfig;
use crate::error::{LinkError, TransportError};
use crate::shutdown::Shutdown;
use crate::state::ConnectionState;
use crate::transport::{with_timeout, NotifyHandle, Transport, DEFAULT_MTU};

/// Owns the link state and the notify handle. Driven only from the event loop task.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    config: Arc<BridgeConfig>,
    shutdown: Shutdown,
    state: ConnectionState,
    notify: Option<NotifyHandle<T::Notify>>,
    /// MTU of the last acquired handle; used while the link is down.
    last_mtu: u16,
    /// Whether the remote side may still hold a connection we opened.
    transport_connected: bool,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, config: Arc<BridgeConfig>, shutdown: Shutdown) -> Self {
        Self {
            transport,
            config,
            shutdown,
            state: ConnectionState::Disconnected,
            notify: None,
            last_mtu: DEFAULT_MTU,
            transport_connected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    /// Chunk size for reads on either side of the bridge.
    pub fn mtu(&self) -> u16 {
        self.notify.as_ref().map(|h| h.mtu).unwrap_or(self.last_mtu)
    }

    pub fn has_notify(&self) -> bool {
        self.notify.is_some()
    }

    pub fn is_transport_connected(&self) -> bool {
        self.transport_connected
    }

    pub fn notify_reader(&mut self) -> Option<&mut T::Notify> {
        self.notify.as_mut().map(|h| &mut h.reader)
    }

    /// Single attempt: connect, settle, acquire.
    pub async fn connect(&mut self) -> Result<(), LinkError> {
        self.drop_link();
        if let Err(e) = self.connect_device().await {
            warn!(device = %self.config.address.device, error = %e, "connect failed");
            return Err(LinkError::TransportUnavailable(e));
        }
        if let Err(e) = self.pause(self.config.settle_delay).await {
            self.state = ConnectionState::Disconnected;
            return Err(e);
        }
        match self.acquire().await {
            Ok(handle) => {
                self.install(handle);
                Ok(())
            }
            Err(e) => {
                if e == TransportError::NotConnected {
                    self.transport_connected = false;
                }
                self.state = ConnectionState::Disconnected;
                warn!(channel = %self.config.address.channel, error = %e, "notify acquire failed");
                Err(LinkError::AcquireFailed(e))
            }
        }
    }

    /// Loop until the link is ready or shutdown is requested.
    ///
    /// Connect attempts back off from the floor on every call. Once connected,
    /// acquire-notify retries on its own backoff; a not-connected answer drops
    /// back to the connect loop instead.
    pub async fn reconnect(&mut self) -> Result<(), LinkError> {
        info!(device = %self.config.address.device, "reconnecting");
        let mut connect_backoff = Backoff::new(self.config.reconnect_backoff);
        loop {
            loop {
                self.drop_link();
                if self.shutdown.is_triggered() {
                    return Err(LinkError::Cancelled);
                }
                match self.connect_device().await {
                    Ok(()) => break,
                    Err(e) => {
                        let delay = connect_backoff.next_delay();
                        debug!(error = %e, ?delay, "connect attempt failed");
                        self.pause(delay).await?;
                    }
                }
            }

            if let Err(e) = self.pause(self.config.settle_delay).await {
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }

            let mut acquire_backoff = Backoff::new(self.config.acquire_backoff);
            loop {
                if self.shutdown.is_triggered() {
                    self.state = ConnectionState::Disconnected;
                    return Err(LinkError::Cancelled);
                }
                match self.acquire().await {
                    Ok(handle) => {
                        self.install(handle);
                        info!("reconnected");
                        return Ok(());
                    }
                    Err(TransportError::NotConnected) => {
                        warn!("peripheral dropped before notify acquire; connecting again");
                        self.transport_connected = false;
                        self.state = ConnectionState::Disconnected;
                        break;
                    }
                    Err(e) => {
                        let delay = acquire_backoff.next_delay();
                        debug!(error = %e, ?delay, "notify acquire attempt failed");
                        if let Err(e) = self.pause(delay).await {
                            self.state = ConnectionState::Disconnected;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Forward one chunk. Failures are returned untouched; the caller decides on reconnect.
    pub async fn write_channel(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let channel = &self.config.address.channel;
        with_timeout(
            self.config.call_timeout,
            self.transport.write_channel(channel, bytes),
        )
        .await
    }

    /// Close the handle, ask the peripheral to disconnect, mark disconnected. Safe to repeat.
    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.drop_link();
        if !self.transport_connected {
            return Ok(());
        }
        let device = &self.config.address.device;
        with_timeout(self.config.call_timeout, self.transport.disconnect(device)).await?;
        self.transport_connected = false;
        info!(device = %device, "peripheral disconnected");
        Ok(())
    }

    /// Notify handle hit EOF: the peripheral went away on its own.
    pub fn mark_link_dropped(&mut self) {
        self.drop_link();
    }

    pub fn close_notify(&mut self) {
        if self.notify.take().is_some() {
            debug!("notify handle closed");
        }
    }

    /// No handle means no `Ready`.
    fn drop_link(&mut self) {
        self.close_notify();
        self.state = ConnectionState::Disconnected;
    }

    async fn connect_device(&mut self) -> Result<(), TransportError> {
        let device = &self.config.address.device;
        let timeout = self.config.connect_timeout;
        with_timeout(timeout, self.transport.connect(device, timeout)).await?;
        self.transport_connected = true;
        self.state = ConnectionState::Connecting;
        info!(device = %device, "device connected");
        Ok(())
    }

    async fn acquire(&self) -> Result<NotifyHandle<T::Notify>, TransportError> {
        let channel = &self.config.address.channel;
        with_timeout(
            self.config.call_timeout,
            self.transport.acquire_notify(channel),
        )
        .await
    }

    fn install(&mut self, mut handle: NotifyHandle<T::Notify>) {
        // A zero-sized read buffer would look like EOF.
        if handle.mtu == 0 {
            handle.mtu = DEFAULT_MTU;
        }
        self.last_mtu = handle.mtu;
        debug!(mtu = handle.mtu, "notify handle acquired");
        self.notify = Some(handle);
        self.state = ConnectionState::Ready;
    }

    async fn pause(&mut self, delay: Duration) -> Result<(), LinkError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.shutdown.triggered() => Err(LinkError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{test_config, MockTransport};
    use crate::shutdown::{shutdown_channel, ShutdownTrigger};
    use tokio::time::Instant;

    fn manager(mock: &Arc<MockTransport>) -> (ShutdownTrigger, ConnectionManager<MockTransport>) {
        let (trigger, shutdown) = shutdown_channel();
        let config = Arc::new(test_config());
        (trigger, ConnectionManager::new(mock.clone(), config, shutdown))
    }

    fn assert_close(gap: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            gap >= expected && gap < expected + Duration::from_millis(5),
            "gap {gap:?}, expected {expected:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reaches_ready() {
        let mock = Arc::new(MockTransport::new());
        let (_t, mut cm) = manager(&mock);
        cm.connect().await.unwrap();
        assert_eq!(cm.state(), ConnectionState::Ready);
        assert!(cm.has_notify());
        assert_eq!(cm.mtu(), 20);
        assert_eq!(mock.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_are_classified() {
        let mock = Arc::new(MockTransport::new());
        let (_t, mut cm) = manager(&mock);

        mock.push_connect(Err(TransportError::failed("no adapter")));
        assert!(matches!(
            cm.connect().await,
            Err(LinkError::TransportUnavailable(_))
        ));
        assert_eq!(cm.state(), ConnectionState::Disconnected);

        mock.push_acquire_err(TransportError::failed("busy"));
        assert!(matches!(cm.connect().await, Err(LinkError::AcquireFailed(_))));
        assert_eq!(cm.state(), ConnectionState::Disconnected);
        assert!(!cm.has_notify());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_grows_then_caps() {
        let mock = Arc::new(MockTransport::new());
        for _ in 0..6 {
            mock.push_connect(Err(TransportError::failed("out of range")));
        }
        let (_t, mut cm) = manager(&mock);
        cm.reconnect().await.unwrap();

        let times = mock.connect_times();
        assert_eq!(times.len(), 7);
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        for (gap, ms) in gaps.iter().zip([100u64, 200, 300, 300, 300, 300]) {
            assert_close(*gap, ms);
        }
        assert_eq!(cm.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_resets_on_each_reconnect_call() {
        let mock = Arc::new(MockTransport::new());
        let (_t, mut cm) = manager(&mock);

        for _ in 0..3 {
            mock.push_connect(Err(TransportError::failed("gone")));
        }
        cm.reconnect().await.unwrap();

        mock.push_connect(Err(TransportError::failed("gone")));
        let start = Instant::now();
        cm.reconnect().await.unwrap();
        let times = mock.connect_times();
        let last_two = &times[times.len() - 2..];
        assert!(last_two[0] >= start);
        assert_close(last_two[1] - last_two[0], 100);
    }

    #[tokio::test(start_paused = true)]
    async fn not_connected_on_acquire_restarts_connect_loop() {
        let mock = Arc::new(MockTransport::new());
        mock.push_acquire_err(TransportError::NotConnected);
        let (_t, mut cm) = manager(&mock);
        cm.reconnect().await.unwrap();
        assert_eq!(mock.connect_calls(), 2);
        assert_eq!(mock.acquire_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn other_acquire_errors_retry_acquire_only() {
        let mock = Arc::new(MockTransport::new());
        mock.push_acquire_err(TransportError::failed("in progress"));
        mock.push_acquire_err(TransportError::Timeout(Duration::from_secs(1)));
        let (_t, mut cm) = manager(&mock);
        cm.reconnect().await.unwrap();
        assert_eq!(mock.connect_calls(), 1);
        assert_eq!(mock.acquire_calls(), 3);
        assert_eq!(cm.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_reconnect() {
        let mock = Arc::new(MockTransport::new());
        for _ in 0..100 {
            mock.push_connect(Err(TransportError::failed("gone")));
        }
        let (trigger, mut cm) = manager(&mock);
        let task = tokio::spawn(async move {
            let res = cm.reconnect().await;
            (res, cm.state())
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        trigger.trigger();
        let (res, state) = task.await.unwrap();
        assert_eq!(res, Err(LinkError::Cancelled));
        assert_ne!(state, ConnectionState::Ready);
        assert!(mock.connect_calls() < 100);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_after_ready_leaves_disconnected() {
        let mock = Arc::new(MockTransport::new());
        let (_t, mut cm) = manager(&mock);
        cm.connect().await.unwrap();
        assert!(cm.state().is_ready());

        mock.push_connect(Err(TransportError::failed("gone")));
        assert!(matches!(
            cm.connect().await,
            Err(LinkError::TransportUnavailable(_))
        ));
        assert_eq!(cm.state(), ConnectionState::Disconnected);
        assert!(!cm.has_notify());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reconnect_from_ready_leaves_disconnected() {
        let mock = Arc::new(MockTransport::new());
        let (trigger, mut cm) = manager(&mock);
        cm.connect().await.unwrap();
        for _ in 0..50 {
            mock.push_connect(Err(TransportError::failed("gone")));
        }
        let task = tokio::spawn(async move {
            let res = cm.reconnect().await;
            (res, cm.state(), cm.has_notify())
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        trigger.trigger();
        let (res, state, has_notify) = task.await.unwrap();
        assert_eq!(res, Err(LinkError::Cancelled));
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(!has_notify);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cuts_connect_settle_short() {
        let mock = Arc::new(MockTransport::new());
        let (trigger, shutdown) = shutdown_channel();
        let mut config = test_config();
        config.settle_delay = Duration::from_secs(60);
        let mut cm = ConnectionManager::new(mock.clone(), Arc::new(config), shutdown);
        let task = tokio::spawn(async move {
            let start = Instant::now();
            let res = cm.connect().await;
            (res, start.elapsed(), cm.state())
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();
        let (res, elapsed, state) = task.await.unwrap();
        assert_eq!(res, Err(LinkError::Cancelled));
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(state, ConnectionState::Disconnected);
        assert_eq!(mock.acquire_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let mock = Arc::new(MockTransport::new());
        let (_t, mut cm) = manager(&mock);
        cm.connect().await.unwrap();
        cm.disconnect().await.unwrap();
        cm.disconnect().await.unwrap();
        assert_eq!(cm.state(), ConnectionState::Disconnected);
        assert!(!cm.has_notify());
        assert_eq!(mock.disconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn write_passes_errors_through() {
        let mock = Arc::new(MockTransport::new());
        let (_t, mut cm) = manager(&mock);
        cm.connect().await.unwrap();
        cm.write_channel(b"AT").await.unwrap();
        mock.push_write(Err(TransportError::NotConnected));
        assert_eq!(
            cm.write_channel(b"AT+RESET").await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(mock.writes(), vec![b"AT".to_vec(), b"AT+RESET".to_vec()]);
        assert_eq!(mock.connect_calls(), 1);
    }
}
