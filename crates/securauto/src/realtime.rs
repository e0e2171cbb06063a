//! Realtime listener façade
//!
//! Attaches change listeners to store queries. Every listener gets the full
//! current result set when it attaches and again after each write to its
//! collection, never a diff. Listeners are only attached for an
//! authenticated session and are tracked so they can be torn down on
//! logout, on stream close and at shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::session::AdminSession;
use crate::store::{Document, DocumentStore, Query};

struct ActiveListener {
    owner: Uuid,
    collection: String,
    task: AbortHandle,
}

type Registry = Mutex<HashMap<Uuid, ActiveListener>>;

pub struct Realtime {
    store: Arc<DocumentStore>,
    active: Arc<Registry>,
}

/// Handle to one attached listener.
///
/// The listener stays attached while the handle is alive; dropping or
/// disposing the handle detaches it.
pub struct ListenerHandle {
    id: Uuid,
    registry: Weak<Registry>,
}

impl ListenerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Detach the listener now
    pub fn dispose(self) {
        // Drop does the work
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            detach(&registry, |id, _| *id == self.id);
        }
    }
}

impl Realtime {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self {
            store,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach `on_change` to the documents matching `query`.
    ///
    /// Returns `None` when there is no authenticated session. Must be called
    /// from within a Tokio runtime.
    pub fn subscribe<F>(
        &self,
        session: Option<&AdminSession>,
        query: Query,
        on_change: F,
    ) -> Option<ListenerHandle>
    where
        F: Fn(Vec<Document>) + Send + 'static,
    {
        let Some(session) = session else {
            debug!(collection = %query.collection, "Refusing listener without session");
            return None;
        };

        let id = Uuid::new_v4();
        let collection = query.collection.clone();
        // Subscribe before the first read so no write slips between the two
        let mut changes = self.store.watch();
        let store = Arc::clone(&self.store);

        let task = tokio::spawn(async move {
            deliver(&store, &query, &on_change);
            loop {
                match changes.recv().await {
                    Ok(event) if event.collection == query.collection => {
                        deliver(&store, &query, &on_change);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped = skipped, "Listener lagged, re-reading");
                        deliver(&store, &query, &on_change);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.registry().insert(
            id,
            ActiveListener {
                owner: session.id,
                collection: collection.clone(),
                task: task.abort_handle(),
            },
        );
        debug!(listener = %id, collection = %collection, "Listener attached");

        Some(ListenerHandle {
            id,
            registry: Arc::downgrade(&self.active),
        })
    }

    /// Detach every listener owned by a session, returning how many
    pub fn unsubscribe_session(&self, session_id: Uuid) -> usize {
        detach(&self.active, |_, listener| listener.owner == session_id)
    }

    /// Detach every listener. Safe to call repeatedly.
    pub fn unsubscribe_all(&self) -> usize {
        detach(&self.active, |_, _| true)
    }

    pub fn active_count(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ActiveListener>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn detach<P>(registry: &Registry, mut predicate: P) -> usize
where
    P: FnMut(&Uuid, &ActiveListener) -> bool,
{
    let mut map = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let ids: Vec<Uuid> = map
        .iter()
        .filter(|(id, listener)| predicate(id, listener))
        .map(|(id, _)| *id)
        .collect();

    for id in &ids {
        if let Some(listener) = map.remove(id) {
            listener.task.abort();
            debug!(listener = %id, collection = %listener.collection, "Listener detached");
        }
    }
    ids.len()
}

fn deliver<F>(store: &DocumentStore, query: &Query, on_change: &F)
where
    F: Fn(Vec<Document>),
{
    match store.query(query) {
        Ok(docs) => on_change(docs),
        Err(e) => warn!(collection = %query.collection, error = %e, "Listener query failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AdminProfile, AdminRole};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn session() -> AdminSession {
        AdminSession {
            id: Uuid::new_v4(),
            credential_id: "admin-1".to_string(),
            admin: AdminProfile {
                email: "chef@securauto.sn".to_string(),
                display_name: "Chef".to_string(),
                role: AdminRole::LegionAdmin,
                legion: Some("Dakar".to_string()),
                permissions: BTreeMap::new(),
                active: true,
                last_login: None,
                created_at: Utc::now(),
            },
            captured_at: Utc::now(),
        }
    }

    fn setup() -> (Arc<DocumentStore>, Realtime) {
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let realtime = Realtime::new(Arc::clone(&store));
        (store, realtime)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<usize>) -> usize {
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_requires_session() {
        let (_store, realtime) = setup();
        let handle = realtime.subscribe(None, Query::new("det"), |_| {});

        assert!(handle.is_none());
        assert_eq!(realtime.active_count(), 0);
    }

    #[tokio::test]
    async fn test_delivers_full_result_set() {
        let (store, realtime) = setup();
        store.add("det", &json!({"legion": "Dakar"})).unwrap();
        let session = session();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let query = Query::new("det").where_eq("legion", "Dakar");
        let _handle = realtime
            .subscribe(Some(&session), query, move |docs| {
                let _ = tx.send(docs.len());
            })
            .unwrap();

        assert_eq!(next(&mut rx).await, 1);

        store.add("det", &json!({"legion": "Dakar"})).unwrap();
        assert_eq!(next(&mut rx).await, 2);

        // Writes that do not match still trigger a full re-read
        store.add("det", &json!({"legion": "Thiès"})).unwrap();
        assert_eq!(next(&mut rx).await, 2);
    }

    #[tokio::test]
    async fn test_other_collections_do_not_trigger() {
        let (store, realtime) = setup();
        let session = session();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = realtime
            .subscribe(Some(&session), Query::new("det"), move |docs| {
                let _ = tx.send(docs.len());
            })
            .unwrap();
        assert_eq!(next(&mut rx).await, 0);

        store.add("unrelated", &json!({})).unwrap();
        store.add("det", &json!({})).unwrap();
        assert_eq!(next(&mut rx).await, 1);
    }

    #[tokio::test]
    async fn test_dispose_detaches() {
        let (_store, realtime) = setup();
        let session = session();

        let handle = realtime
            .subscribe(Some(&session), Query::new("det"), |_| {})
            .unwrap();
        assert_eq!(realtime.active_count(), 1);

        handle.dispose();
        assert_eq!(realtime.active_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_detaches() {
        let (_store, realtime) = setup();
        let session = session();

        {
            let _handle = realtime.subscribe(Some(&session), Query::new("det"), |_| {});
            assert_eq!(realtime.active_count(), 1);
        }
        assert_eq!(realtime.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_is_idempotent() {
        let (_store, realtime) = setup();
        let session = session();
        let _a = realtime.subscribe(Some(&session), Query::new("a"), |_| {});
        let _b = realtime.subscribe(Some(&session), Query::new("b"), |_| {});

        assert_eq!(realtime.unsubscribe_all(), 2);
        assert_eq!(realtime.unsubscribe_all(), 0);
        assert_eq!(realtime.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_session_only_touches_owner() {
        let (_store, realtime) = setup();
        let first = session();
        let second = session();
        let _a = realtime.subscribe(Some(&first), Query::new("a"), |_| {});
        let _b = realtime.subscribe(Some(&second), Query::new("a"), |_| {});

        assert_eq!(realtime.unsubscribe_session(first.id), 1);
        assert_eq!(realtime.active_count(), 1);
    }

    #[tokio::test]
    async fn test_detached_listener_stops_receiving() {
        let (store, realtime) = setup();
        let session = session();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = realtime
            .subscribe(Some(&session), Query::new("det"), move |docs| {
                let _ = tx.send(docs.len());
            })
            .unwrap();
        assert_eq!(next(&mut rx).await, 0);

        handle.dispose();
        store.add("det", &json!({})).unwrap();

        // The aborted task drops its sender, closing the channel
        let received = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(received.is_none());
    }
}
