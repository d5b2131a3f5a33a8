use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use groupcast_settings::Topology;
use tracing::trace;

use super::DistributionStrategy;
use crate::directory::Directory;
use crate::errors::Result;

/// Single-process distribution: publish goes straight to the local hub.
pub struct LocalOnly {
    directory: Arc<Directory>,
}

impl LocalOnly {
    /// Publish into groups registered in `directory`.
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl DistributionStrategy for LocalOnly {
    async fn publish(&self, group: &str, payload: Bytes) -> Result<()> {
        match self.directory.get(group) {
            Some(target) => {
                let _ = target.broadcast(payload).await;
            }
            None => trace!(group = %group, "publish to absent group ignored"),
        }
        Ok(())
    }

    fn topology(&self) -> Topology {
        Topology::Local
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::CloseHandle;
    use crate::member::{Member, MemberId};

    #[tokio::test]
    async fn publish_reaches_local_hub() {
        let dir = Directory::new();
        let (group, _) = dir.get_or_create("chat", 16);
        let (tx, mut rx) = mpsc::channel(8);
        group
            .register(Member {
                id: MemberId::new(),
                outbound: tx,
                close: CloseHandle::new(),
            })
            .await
            .unwrap();

        let local = LocalOnly::new(dir);
        local.publish("chat", Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn publish_to_missing_group_is_silent() {
        let dir = Directory::new();
        let local = LocalOnly::new(dir.clone());
        local.publish("nobody", Bytes::from_static(b"x")).await.unwrap();
        assert!(dir.is_empty());
        assert_eq!(local.topology(), Topology::Local);
    }
}
