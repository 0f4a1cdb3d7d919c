//! Subscriptions: the per-(session, sub-id) bridge between a publish
//! handler and the documents it contributes.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use async_trait::async_trait;
use ddp_engine_core::CursorDescription;
use ddp_engine_core::LiveConnection;
use ddp_engine_core::observe::ObserveCallbacks;
use ddp_engine_core::random_id;
use ddp_engine_proto::ClientError;
use ddp_engine_proto::Document;
use ddp_engine_proto::FieldPatch;
use ddp_engine_proto::Fields;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::method::HandlerError;
use crate::session::Session;
use crate::strategy::PublicationStrategy;

/// What a publish handler resolves to.
pub enum PublishOutcome {
    /// The handler drives the subscription itself (`added`/`ready`/...).
    Handled,
    /// Publish one cursor; the subscription becomes ready after its
    /// initial adds.
    Cursor(Box<dyn PublishableCursor>),
    /// Publish several cursors over distinct collections.
    Cursors(Vec<Box<dyn PublishableCursor>>),
}

pub type PublishHandler = Arc<
    dyn Fn(Arc<Subscription>, Vec<Value>) -> BoxFuture<'static, Result<PublishOutcome, HandlerError>>
        + Send
        + Sync,
>;

/// The capability a cursor-like value needs to be returned from a
/// publish handler.
#[async_trait]
pub trait PublishableCursor: Send + Sync {
    fn collection_name(&self) -> String;

    /// Observe the cursor and feed the subscription until it stops.
    /// Resolves once the initial adds have been delivered.
    async fn publish_cursor(
        &self,
        subscription: &Arc<Subscription>,
    ) -> ddp_engine_core::Result<()>;
}

/// A live query over the shared store connection; the standard
/// [`PublishableCursor`].
pub struct LiveCursor {
    pub connection: Arc<LiveConnection>,
    pub description: CursorDescription,
}

#[async_trait]
impl PublishableCursor for LiveCursor {
    fn collection_name(&self) -> String {
        self.description.collection.clone()
    }

    async fn publish_cursor(
        &self,
        subscription: &Arc<Subscription>,
    ) -> ddp_engine_core::Result<()> {
        let collection = self.description.collection.clone();
        let weak = Arc::downgrade(subscription);

        let added_sub = weak.clone();
        let added_collection = collection.clone();
        let changed_sub = weak.clone();
        let changed_collection = collection.clone();
        let removed_sub = weak.clone();
        let removed_collection = collection.clone();
        let initial_sub = weak.clone();
        let initial_collection = collection.clone();

        let callbacks = ObserveCallbacks {
            added: Some(Box::new(move |id: &str, fields: Arc<Fields>| {
                if let Some(sub) = added_sub.upgrade() {
                    sub.added(&added_collection, id, fields.as_ref().clone());
                }
            })),
            changed: Some(Box::new(move |id: &str, patch: Arc<FieldPatch>| {
                if let Some(sub) = changed_sub.upgrade() {
                    sub.changed(&changed_collection, id, patch.as_ref());
                }
            })),
            removed: Some(Box::new(move |id: &str| {
                if let Some(sub) = removed_sub.upgrade() {
                    sub.removed(&removed_collection, id);
                }
            })),
            initial_adds: Some(Box::new(move |docs: &[Document]| {
                if let Some(sub) = initial_sub.upgrade() {
                    sub.initial_added(&initial_collection, docs);
                }
            })),
            ..Default::default()
        };

        let handle = self
            .connection
            .observe_changes(self.description.clone(), false, callbacks, true)
            .await?;
        subscription.on_stop(move || handle.stop());
        Ok(())
    }
}

struct SubscriptionState {
    deactivated: bool,
    ready: bool,
    /// collection name → ids this subscription contributed (kept only
    /// under strategies that do accounting).
    documents: HashMap<String, HashSet<String>>,
    stop_callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

/// One subscription within one session.
pub struct Subscription {
    weak_self: Weak<Subscription>,
    session: Weak<Session>,
    handler: PublishHandler,
    /// `None` for universal subscriptions.
    sub_id: Option<String>,
    name: Option<String>,
    params: Vec<Value>,
    /// Merge-box identity: `N`-prefixed for named, `U`-prefixed for
    /// universal.
    handle_id: String,
    strategy: PublicationStrategy,
    user_id: Option<String>,
    state: Mutex<SubscriptionState>,
}

impl Subscription {
    pub(crate) fn new(
        session: &Arc<Session>,
        handler: PublishHandler,
        sub_id: Option<String>,
        name: Option<String>,
        params: Vec<Value>,
        strategy: PublicationStrategy,
    ) -> Arc<Self> {
        let handle_id = match &sub_id {
            Some(id) => format!("N{id}"),
            None => format!("U{}", random_id()),
        };
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            session: Arc::downgrade(session),
            handler,
            sub_id,
            name,
            params,
            handle_id,
            strategy,
            user_id: session.user_id(),
            state: Mutex::new(SubscriptionState {
                deactivated: false,
                ready: false,
                documents: HashMap::new(),
                stop_callbacks: Vec::new(),
            }),
        })
    }

    pub fn sub_id(&self) -> Option<&str> {
        self.sub_id.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The user id the session had when this subscription started.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    /// Run the publish handler and wire up whatever it returns.
    pub(crate) async fn run_handler(&self) {
        let this = self.weak_self.upgrade().expect("subscription alive");
        let outcome = (self.handler)(this, self.params.clone()).await;
        match outcome {
            Err(err) => self.error(err.into_payload()),
            Ok(PublishOutcome::Handled) => {}
            Ok(PublishOutcome::Cursor(cursor)) => self.publish_cursors(vec![cursor]).await,
            Ok(PublishOutcome::Cursors(cursors)) => self.publish_cursors(cursors).await,
        }
    }

    async fn publish_cursors(
        &self,
        cursors: Vec<Box<dyn PublishableCursor>>,
    ) {
        let mut collections = HashSet::new();
        for cursor in &cursors {
            if !collections.insert(cursor.collection_name()) {
                self.error(ClientError::with_reason(
                    500,
                    format!(
                        "publish produced multiple cursors for collection '{}'",
                        cursor.collection_name()
                    ),
                ));
                return;
            }
        }
        let this = self.weak_self.upgrade().expect("subscription alive");
        for cursor in cursors {
            if self.is_deactivated() {
                return;
            }
            if let Err(err) = cursor.publish_cursor(&this).await {
                warn!("[Subscription] cursor observe failed: {err}");
                self.error(ClientError::internal());
                return;
            }
        }
        self.ready();
    }

    fn is_deactivated(&self) -> bool {
        self.state.lock().expect("subscription poisoned").deactivated
    }

    fn account_added(
        &self,
        collection: &str,
        id: &str,
    ) {
        if self.strategy.do_accounting() {
            let mut state = self.state.lock().expect("subscription poisoned");
            state.documents.entry(collection.to_string()).or_default().insert(id.to_string());
        }
    }

    fn account_removed(
        &self,
        collection: &str,
        id: &str,
    ) {
        if self.strategy.do_accounting() {
            let mut state = self.state.lock().expect("subscription poisoned");
            if let Some(ids) = state.documents.get_mut(collection) {
                ids.remove(id);
            }
        }
    }

    /// Report a document this subscription contributes.
    pub fn added(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) {
        if self.is_deactivated() {
            return;
        }
        let Some(session) = self.session() else {
            return;
        };
        self.account_added(collection, id);
        if self.strategy.use_collection_view() {
            session.merge_added(&self.handle_id, collection, id, &fields);
        } else {
            session.send_added_direct(collection, id, fields);
        }
    }

    /// Batch form of [`Subscription::added`] for a cursor's initial
    /// result set; on a version-1a session the burst becomes one `init`
    /// message.
    pub(crate) fn initial_added(
        &self,
        collection: &str,
        docs: &[Document],
    ) {
        if self.is_deactivated() {
            return;
        }
        let Some(session) = self.session() else {
            return;
        };
        session.begin_init_batch(collection);
        for doc in docs {
            self.added(collection, &doc.id, doc.fields.clone());
        }
        session.end_init_batch();
    }

    /// Report a field-level change to a contributed document.
    pub fn changed(
        &self,
        collection: &str,
        id: &str,
        patch: &FieldPatch,
    ) {
        if self.is_deactivated() {
            return;
        }
        let Some(session) = self.session() else {
            return;
        };
        if self.strategy.use_collection_view() {
            session.merge_changed(&self.handle_id, collection, id, patch);
        } else {
            session.send_changed_direct(collection, id, patch);
        }
    }

    /// Report that a contributed document no longer matches.
    pub fn removed(
        &self,
        collection: &str,
        id: &str,
    ) {
        if self.is_deactivated() {
            return;
        }
        let Some(session) = self.session() else {
            return;
        };
        self.account_removed(collection, id);
        if self.strategy.use_collection_view() {
            session.merge_removed(&self.handle_id, collection, id);
        } else {
            session.send_removed_direct(collection, id);
        }
    }

    /// Mark the subscription ready; named subscriptions notify the
    /// client once.
    pub fn ready(&self) {
        let Some(sub_id) = &self.sub_id else {
            return;
        };
        let newly_ready = {
            let mut state = self.state.lock().expect("subscription poisoned");
            if state.deactivated || state.ready {
                false
            } else {
                state.ready = true;
                true
            }
        };
        if newly_ready {
            if let Some(session) = self.session() {
                session.send_ready(vec![sub_id.clone()]);
            }
        }
    }

    /// Register teardown work (observe handle stops and the like).
    pub fn on_stop<F>(
        &self,
        callback: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock().expect("subscription poisoned");
        if state.deactivated {
            drop(state);
            callback();
            return;
        }
        state.stop_callbacks.push(Box::new(callback));
    }

    /// Tear the subscription down without a client-visible error.
    pub fn stop(&self) {
        if let (Some(session), Some(sub_id)) = (self.session(), &self.sub_id) {
            session.stop_subscription(sub_id, None);
        }
    }

    /// Tear down and notify the client through `nosub`.
    pub fn error(
        &self,
        error: ClientError,
    ) {
        match (self.session(), &self.sub_id) {
            (Some(session), Some(sub_id)) => session.stop_subscription(sub_id, Some(error)),
            _ => debug!("[Subscription] error on a universal sub: {error}"),
        }
    }

    /// Run stop callbacks and block further document updates.
    /// Idempotent.
    pub(crate) fn deactivate(&self) {
        let callbacks = {
            let mut state = self.state.lock().expect("subscription poisoned");
            if state.deactivated {
                return;
            }
            state.deactivated = true;
            std::mem::take(&mut state.stop_callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Emit `removed` for every (collection, id) this subscription
    /// contributed. Used at unsubscribe unless the client cleans up
    /// itself (protocol 1a).
    pub(crate) fn remove_all_documents(&self) {
        let Some(session) = self.session() else {
            return;
        };
        let documents = {
            let mut state = self.state.lock().expect("subscription poisoned");
            std::mem::take(&mut state.documents)
        };
        for (collection, ids) in documents {
            for id in ids {
                if self.strategy.use_collection_view() {
                    session.merge_removed(&self.handle_id, &collection, &id);
                } else {
                    session.send_removed_direct(&collection, &id);
                }
            }
        }
    }

    /// A fresh subscription with the same identity and handler and a
    /// clean slate; used when rerunning after a user-id rebind.
    pub(crate) fn recreate(
        &self,
        session: &Arc<Session>,
    ) -> Arc<Subscription> {
        Subscription::new(
            session,
            Arc::clone(&self.handler),
            self.sub_id.clone(),
            self.name.clone(),
            self.params.clone(),
            self.strategy,
        )
    }
}
