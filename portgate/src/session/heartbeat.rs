use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::TunnelServiceClient;
use crate::transport::message::HeartbeatRequest;

/// Non-blocking, single-slot "connection lost" signal.
///
/// Only the first reason is kept; later notifications are dropped so a
/// failing heartbeat can never stall on a session that is already closing.
#[derive(Clone, Debug)]
pub struct LostSignal {
    tx: mpsc::Sender<String>,
}

impl LostSignal {
    pub fn notify(&self, reason: impl Into<String>) {
        let _ = self.tx.try_send(reason.into());
    }
}

pub fn lost_channel() -> (LostSignal, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(1);
    (LostSignal { tx }, rx)
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Runs the heartbeat stream for `tunnel_id` until `cancel` fires or the
/// stream fails, in which case `lost` is notified.
pub fn spawn(
    mut client: TunnelServiceClient,
    tunnel_id: String,
    interval: Duration,
    lost: LostSignal,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (tx, rx) = mpsc::channel(4);
        let beat = |tunnel_id: &str| HeartbeatRequest {
            tunnel_id: tunnel_id.to_string(),
            timestamp: unix_seconds(),
        };

        // The first beat is queued before the call so the server sees the
        // tunnel id as soon as the stream opens.
        let _ = tx.try_send(beat(&tunnel_id));
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = client.heartbeat(ReceiverStream::new(rx)) => opened,
        };
        let mut inbound = match opened {
            Ok(inbound) => inbound,
            Err(status) => {
                warn!("Heartbeat {}: failed to open stream: {}", tunnel_id, status);
                lost.notify(format!("heartbeat open failed: {}", status.message()));
                return;
            }
        };

        let acks = {
            let lost = lost.clone();
            let cancel = cancel.clone();
            let tunnel_id = tunnel_id.clone();
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = cancel.cancelled() => return,
                        message = inbound.message() => message,
                    };
                    match message {
                        Ok(Some(ack)) => debug!("Heartbeat {}: ack {}", tunnel_id, ack.timestamp),
                        Ok(None) => {
                            lost.notify("heartbeat stream closed by server");
                            return;
                        }
                        Err(status) => {
                            lost.notify(format!("heartbeat receive failed: {}", status.message()));
                            return;
                        }
                    }
                }
            })
        };

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if tx.send(beat(&tunnel_id)).await.is_err() {
                        lost.notify("heartbeat send failed");
                        break;
                    }
                }
            }
        }
        acks.abort();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lost_signal_keeps_first_reason() {
        let (lost, mut rx) = lost_channel();
        lost.notify("first");
        lost.notify("second");
        lost.clone().notify("third");
        assert_eq!(rx.recv().await.unwrap(), "first");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lost_signal_after_receiver_dropped() {
        let (lost, rx) = lost_channel();
        drop(rx);
        lost.notify("nobody listening");
    }
}
