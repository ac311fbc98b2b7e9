//! Back-pressured account snapshot loads
//!
//! Broadcast passes and read-heavy paths all want the full account graph.
//! This buffer bounds concurrent loads to one per account: whoever gets the
//! per-account mutex first loads, and callers that queued behind the load
//! reuse the snapshot it produced instead of hitting the store again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::Mutex;

use warren_core::account::AccountSnapshot;
use warren_core::error::Result;

use crate::queries;
use crate::store::Store;

#[derive(Default)]
struct BufferEntry {
    loading: Mutex<()>,
    latest: StdMutex<Option<(Instant, Arc<AccountSnapshot>)>>,
}

pub struct AccountRequestBuffer {
    store: Arc<Store>,
    entries: StdMutex<HashMap<String, Arc<BufferEntry>>>,
}

impl AccountRequestBuffer {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            entries: StdMutex::new(HashMap::new()),
        }
    }

    /// Returns a full account snapshot, sharing an in-flight load with any
    /// caller that arrived while it ran.
    pub async fn get_account_with_backpressure(
        &self,
        account_id: &str,
    ) -> Result<Arc<AccountSnapshot>> {
        let entry = self.entry(account_id);
        let requested_at = Instant::now();

        let _loading = entry.loading.lock().await;

        // A load that finished after we queued up is fresh enough.
        if let Some((loaded_at, snapshot)) = entry.latest.lock().unwrap().as_ref() {
            if *loaded_at >= requested_at {
                return Ok(snapshot.clone());
            }
        }

        let mut conn = self.store.acquire().await?;
        let snapshot = Arc::new(queries::get_full_account(&mut conn, account_id).await?);
        *entry.latest.lock().unwrap() = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    /// Drops the cached snapshot. Called by every write path that commits a
    /// topology change.
    pub fn invalidate(&self, account_id: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get(account_id) {
            entry.latest.lock().unwrap().take();
        }
    }

    fn entry(&self, account_id: &str) -> Arc<BufferEntry> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(BufferEntry::default()))
            .clone()
    }
}
