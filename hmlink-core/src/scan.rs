//! Wake scan: while the link is down, watch the peripheral's advertisements for a
//! service-data flag and raise a wake when it is set.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::TransportError;
use crate::state::ConnectionState;
use crate::transport::{
    with_timeout, DiscoveryTransport, PropertyChange, PropertyStream, Transport, DEVICE_INTERFACE,
};
use crate::wake::WakeSender;

/// True when the notification carries service data whose first byte is non-zero.
///
/// Anything else (other interface, no service data, empty payload) is "no signal".
pub fn decode_wake_flag(change: &PropertyChange) -> bool {
    if change.interface != DEVICE_INTERFACE {
        return false;
    }
    let Some(entries) = change.service_data.as_ref() else {
        return false;
    };
    entries
        .first()
        .and_then(|(_, payload)| payload.first())
        .is_some_and(|flag| *flag != 0)
}

struct DispatchTask {
    stop_tx: oneshot::Sender<()>,
    /// Fires if the property stream ends before `stop` is asked for.
    ended_rx: oneshot::Receiver<()>,
    handle: JoinHandle<()>,
}

pub struct ScanMonitor<T: Transport> {
    transport: Arc<T>,
    config: Arc<BridgeConfig>,
    wake: WakeSender,
    task: Option<DispatchTask>,
}

impl<T: Transport> ScanMonitor<T> {
    pub fn new(transport: Arc<T>, config: Arc<BridgeConfig>, wake: WakeSender) -> Self {
        Self {
            transport,
            config,
            wake,
            task: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.task.is_some()
    }

    /// Filter to LE, subscribe, start the dispatch task, start discovery.
    /// No-op if already scanning or if the link is up.
    pub async fn start(&mut self, state: &mut ConnectionState) -> Result<(), TransportError> {
        if self.task.is_some() {
            return Ok(());
        }
        if state.is_ready() {
            debug!("link is ready; not scanning");
            return Ok(());
        }
        let config = self.config.clone();
        let address = &config.address;
        let limit = config.call_timeout;

        with_timeout(
            limit,
            self.transport
                .set_discovery_filter(&address.adapter, DiscoveryTransport::Le),
        )
        .await?;
        let changes = with_timeout(
            limit,
            self.transport.subscribe_property_changes(&address.device),
        )
        .await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (ended_tx, ended_rx) = oneshot::channel();
        let handle = tokio::spawn(dispatch(changes, self.wake.clone(), stop_rx, ended_tx));
        self.task = Some(DispatchTask {
            stop_tx,
            ended_rx,
            handle,
        });

        if let Err(e) = with_timeout(limit, self.transport.start_discovery(&address.adapter)).await
        {
            self.join_task().await;
            return Err(e);
        }
        *state = ConnectionState::Scanning;
        info!(device = %address.device, "scanning for wake advertisement");
        Ok(())
    }

    /// Unsubscribe, stop discovery, join the dispatch task. No-op when idle.
    pub async fn stop(&mut self, state: &mut ConnectionState) {
        if self.task.is_none() {
            return;
        }
        let config = self.config.clone();
        if let Err(e) = with_timeout(
            config.call_timeout,
            self.transport.stop_discovery(&config.address.adapter),
        )
        .await
        {
            warn!(error = %e, "stop discovery failed");
        }
        self.join_task().await;
        if *state == ConnectionState::Scanning {
            *state = ConnectionState::Disconnected;
        }
        info!("scan stopped");
    }

    /// Resolve when the running scan's subscription has ended on its own.
    /// Pending while idle. Follow with `stop` before polling again.
    pub async fn ended(&mut self) {
        match self.task.as_mut() {
            Some(task) => {
                let _ = (&mut task.ended_rx).await;
            }
            None => std::future::pending().await,
        }
    }

    #[cfg(test)]
    pub(crate) fn wake_sender(&self) -> WakeSender {
        self.wake.clone()
    }

    async fn join_task(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = task.stop_tx.send(());
        let abort = task.handle.abort_handle();
        if tokio::time::timeout(self.config.scan_join_timeout, task.handle)
            .await
            .is_err()
        {
            warn!("scan task did not stop in time; aborting");
            abort.abort();
        }
    }
}

/// Scan task body. Only ever touches the wake sender.
async fn dispatch(
    mut changes: PropertyStream,
    wake: WakeSender,
    mut stop: oneshot::Receiver<()>,
    ended: oneshot::Sender<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            change = changes.next() => match change {
                Some(change) => {
                    if decode_wake_flag(&change) {
                        debug!("wake flag set in advertisement");
                        wake.raise();
                    }
                }
                None => {
                    warn!("property change stream ended");
                    let _ = ended.send(());
                    break;
                }
            },
        }
    }
}
