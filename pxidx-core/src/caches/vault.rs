use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Owner addresses currently classified as vault accounts.
#[derive(Debug, Clone, Default)]
pub struct VaultCache {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl VaultCache {
    pub async fn contains(&self, address: &str) -> bool {
        self.inner.read().await.contains(address)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub(crate) async fn replace_all(&self, addresses: Vec<String>) {
        *self.inner.write().await = addresses.into_iter().collect();
    }

    /// Apply `(address, is_member)` changes in order.
    pub(crate) async fn apply(&self, changes: impl IntoIterator<Item = (String, bool)>) {
        let mut members = self.inner.write().await;
        for (address, is_member) in changes {
            if is_member {
                members.insert(address);
            } else {
                members.remove(&address);
            }
        }
    }
}
