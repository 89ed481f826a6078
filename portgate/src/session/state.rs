use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::{RwLock, mpsc};

#[derive(Debug, Default)]
struct Inner {
    tunnel_id: String,
    public_url: String,
    connected: bool,
    ws_connections: HashMap<String, mpsc::Sender<Bytes>>,
}

/// Mutable state of one live session, guarded by a single lock.
#[derive(Debug, Default)]
pub struct SessionState {
    inner: RwLock<Inner>,
}

impl SessionState {
    pub fn new(tunnel_id: &str, public_url: &str) -> Self {
        Self {
            inner: RwLock::new(Inner {
                tunnel_id: tunnel_id.to_string(),
                public_url: public_url.to_string(),
                ..Default::default()
            }),
        }
    }

    pub async fn tunnel_id(&self) -> String {
        self.inner.read().await.tunnel_id.clone()
    }

    pub async fn public_url(&self) -> String {
        self.inner.read().await.public_url.clone()
    }

    /// Replaces the public URL; returns whether it changed.
    pub async fn set_public_url(&self, url: &str) -> bool {
        let mut inner = self.inner.write().await;
        if inner.public_url == url {
            return false;
        }
        inner.public_url = url.to_string();
        true
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.connected
    }

    pub async fn set_connected(&self) {
        self.inner.write().await.connected = true;
    }

    /// Marks the session down and drops every WebSocket inbound channel,
    /// which ends the corresponding write pumps.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.write().await;
        inner.connected = false;
        inner.ws_connections.clear();
    }

    pub async fn register_ws(&self, request_id: &str, tx: mpsc::Sender<Bytes>) {
        self.inner
            .write()
            .await
            .ws_connections
            .insert(request_id.to_string(), tx);
    }

    pub async fn unregister_ws(&self, request_id: &str) -> bool {
        self.inner
            .write()
            .await
            .ws_connections
            .remove(request_id)
            .is_some()
    }

    pub async fn ws_sender(&self, request_id: &str) -> Option<mpsc::Sender<Bytes>> {
        self.inner
            .read()
            .await
            .ws_connections
            .get(request_id)
            .cloned()
    }

    pub async fn ws_count(&self) -> usize {
        self.inner.read().await.ws_connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_public_url_update() {
        let state = SessionState::new("t1", "https://a.example.com");
        assert!(!state.set_public_url("https://a.example.com").await);
        assert!(state.set_public_url("https://b.example.com").await);
        assert_eq!(state.public_url().await, "https://b.example.com");
    }

    #[tokio::test]
    async fn test_disconnect_clears_ws_routes() {
        let state = SessionState::new("t1", "");
        let (tx, mut rx) = mpsc::channel(1);
        state.set_connected().await;
        state.register_ws("r1", tx).await;
        assert!(state.ws_sender("r1").await.is_some());

        state.disconnect().await;
        assert!(!state.is_connected().await);
        assert_eq!(state.ws_count().await, 0);
        assert!(rx.recv().await.is_none());
    }
}
