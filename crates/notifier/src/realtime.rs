//! Realtime push of delivery episodes to dashboard connections.
//!
//! Connections are tagged with the owning user and role. An episode is sent
//! to every connection owned by the episode's user and to every admin
//! connection. Delivery is best-effort: closed connections are pruned on the
//! next broadcast that hits them.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use payhook_common::types::{DeliveryEpisode, UserRole};

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EpisodeEvent {
    #[serde(rename = "webhook:new")]
    New,
    #[serde(rename = "webhook:update")]
    Update,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Failed to encode realtime message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Connection registry lock poisoned")]
    Poisoned,
}

/// Sink for episode change notifications.
pub trait EpisodeBroadcaster: Send + Sync {
    /// Push `episode` to its audience, returning how many connections got it.
    fn broadcast(
        &self,
        event: EpisodeEvent,
        episode: &DeliveryEpisode,
    ) -> Result<usize, BroadcastError>;
}

#[derive(Serialize)]
struct Envelope<'a> {
    event: EpisodeEvent,
    data: &'a DeliveryEpisode,
}

struct Connection {
    user_id: Uuid,
    role: UserRole,
    sender: mpsc::UnboundedSender<String>,
}

/// Registry of live dashboard connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; serialized messages arrive on the returned receiver.
    pub fn register(
        &self,
        user_id: Uuid,
        role: UserRole,
    ) -> Result<(ConnectionId, mpsc::UnboundedReceiver<String>), BroadcastError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        self.connections
            .write()
            .map_err(|_| BroadcastError::Poisoned)?
            .insert(
                id,
                Connection {
                    user_id,
                    role,
                    sender,
                },
            );

        tracing::debug!(connection_id = %id, user_id = %user_id, %role, "Realtime connection registered");
        Ok((id, receiver))
    }

    pub fn unregister(&self, id: ConnectionId) {
        match self.connections.write() {
            Ok(mut connections) => {
                if connections.remove(&id).is_some() {
                    tracing::debug!(connection_id = %id, "Realtime connection closed");
                }
            }
            Err(_) => tracing::error!(connection_id = %id, "Connection registry lock poisoned"),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }
}

impl EpisodeBroadcaster for ConnectionRegistry {
    fn broadcast(
        &self,
        event: EpisodeEvent,
        episode: &DeliveryEpisode,
    ) -> Result<usize, BroadcastError> {
        let message = serde_json::to_string(&Envelope {
            event,
            data: episode,
        })?;

        let mut dead = Vec::new();
        let mut delivered = 0;
        {
            let connections = self.connections.read().map_err(|_| BroadcastError::Poisoned)?;
            for (id, conn) in connections.iter() {
                if conn.user_id != episode.user_id && conn.role != UserRole::Admin {
                    continue;
                }
                if conn.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.write().map_err(|_| BroadcastError::Poisoned)?;
            for id in &dead {
                connections.remove(id);
            }
            tracing::debug!(pruned = dead.len(), "Pruned closed realtime connections");
        }

        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use payhook_common::types::{DeliveryMeta, NewEpisode};

    fn episode_for(user_id: Uuid) -> DeliveryEpisode {
        DeliveryEpisode::new(
            NewEpisode {
                webhook_url: "https://hooks.example.com/tx".to_string(),
                payload: serde_json::json!({ "orderId": "DH42" }),
                meta: DeliveryMeta::for_user(user_id),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_owner_and_admins_receive_others_do_not() {
        let registry = ConnectionRegistry::new();
        let owner = Uuid::new_v4();
        let (_, mut owner_rx) = registry.register(owner, UserRole::User).unwrap();
        let (_, mut admin_rx) = registry.register(Uuid::new_v4(), UserRole::Admin).unwrap();
        let (_, mut other_rx) = registry.register(Uuid::new_v4(), UserRole::User).unwrap();

        let sent = registry
            .broadcast(EpisodeEvent::New, &episode_for(owner))
            .unwrap();
        assert_eq!(sent, 2);

        let msg: serde_json::Value = serde_json::from_str(&owner_rx.try_recv().unwrap()).unwrap();
        assert_eq!(msg["event"], "webhook:new");
        assert_eq!(msg["data"]["user_id"], owner.to_string());
        assert!(admin_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_connections_are_pruned() {
        let registry = ConnectionRegistry::new();
        let owner = Uuid::new_v4();
        let (_, rx) = registry.register(owner, UserRole::User).unwrap();
        let (_, _live_rx) = registry.register(owner, UserRole::User).unwrap();
        drop(rx);

        let sent = registry
            .broadcast(EpisodeEvent::Update, &episode_for(owner))
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_unregister() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = registry.register(Uuid::new_v4(), UserRole::User).unwrap();
        registry.unregister(id);
        assert_eq!(registry.connection_count(), 0);
    }
}
