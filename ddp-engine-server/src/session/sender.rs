//! The session's outbound path: serialization, the sending gate used
//! during user-id rebinds, pending-ready buffering, and `init` batching
//! for version-1a clients.

use std::sync::Arc;
use std::sync::Mutex;

use ddp_engine_proto::FieldPatch;
use ddp_engine_proto::Fields;
use ddp_engine_proto::InitItem;
use ddp_engine_proto::ServerMessage;
use ddp_engine_proto::stringify_ddp;
use ddp_engine_proto::to_wire_fields;
use ddp_engine_proto::to_wire_patch;
use tracing::trace;

use crate::transport::ConnectionSink;

struct InitBatch {
    collection: String,
    items: Vec<InitItem>,
}

struct SenderState {
    /// While false, data messages are dropped (the views still update);
    /// `ready` messages buffer instead.
    sending: bool,
    pending_ready: Vec<String>,
    batch: Option<InitBatch>,
}

#[derive(Clone)]
pub(crate) struct SessionSender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    sink: Arc<dyn ConnectionSink>,
    version: String,
    state: Mutex<SenderState>,
}

impl SessionSender {
    pub(crate) fn new(
        sink: Arc<dyn ConnectionSink>,
        version: String,
    ) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                sink,
                version,
                state: Mutex::new(SenderState {
                    sending: true,
                    pending_ready: Vec::new(),
                    batch: None,
                }),
            }),
        }
    }

    fn write(
        &self,
        message: &ServerMessage,
    ) {
        let frame = stringify_ddp(message);
        trace!(frame = %frame, "[Session] send");
        self.inner.sink.send_frame(frame);
    }

    fn flush_batch_locked(
        &self,
        state: &mut SenderState,
    ) {
        if let Some(batch) = state.batch.take() {
            if !batch.items.is_empty() {
                self.write(&ServerMessage::Init {
                    collection: batch.collection,
                    items: batch.items,
                });
            }
        }
    }

    /// Protocol messages (results, nosub, pongs...) bypass the sending
    /// gate but still flush an open batch first to preserve order.
    pub(crate) fn send(
        &self,
        message: ServerMessage,
    ) {
        let mut state = self.inner.state.lock().expect("sender poisoned");
        self.flush_batch_locked(&mut state);
        self.write(&message);
    }

    pub(crate) fn send_added(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) {
        let mut state = self.inner.state.lock().expect("sender poisoned");
        if !state.sending {
            return;
        }
        let fields = to_wire_fields(&fields);
        if let Some(batch) = &mut state.batch {
            if batch.collection == collection {
                batch.items.push(InitItem {
                    id: id.to_string(),
                    fields,
                });
                return;
            }
        }
        self.flush_batch_locked(&mut state);
        self.write(&ServerMessage::Added {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        });
    }

    pub(crate) fn send_changed(
        &self,
        collection: &str,
        id: &str,
        patch: &FieldPatch,
    ) {
        if patch.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock().expect("sender poisoned");
        if !state.sending {
            return;
        }
        self.flush_batch_locked(&mut state);
        self.write(&ServerMessage::changed(collection, id, &to_wire_patch(patch)));
    }

    pub(crate) fn send_removed(
        &self,
        collection: &str,
        id: &str,
    ) {
        let mut state = self.inner.state.lock().expect("sender poisoned");
        if !state.sending {
            return;
        }
        self.flush_batch_locked(&mut state);
        self.write(&ServerMessage::Removed {
            collection: collection.to_string(),
            id: id.to_string(),
        });
    }

    pub(crate) fn send_ready(
        &self,
        subs: Vec<String>,
    ) {
        let mut state = self.inner.state.lock().expect("sender poisoned");
        if !state.sending {
            state.pending_ready.extend(subs);
            return;
        }
        self.flush_batch_locked(&mut state);
        self.write(&ServerMessage::Ready {
            subs,
        });
    }

    /// Open an `init` batch for one collection (no-op off version 1a).
    pub(crate) fn begin_init_batch(
        &self,
        collection: &str,
    ) {
        if self.inner.version != "1a" {
            return;
        }
        let mut state = self.inner.state.lock().expect("sender poisoned");
        self.flush_batch_locked(&mut state);
        state.batch = Some(InitBatch {
            collection: collection.to_string(),
            items: Vec::new(),
        });
    }

    pub(crate) fn end_init_batch(&self) {
        let mut state = self.inner.state.lock().expect("sender poisoned");
        self.flush_batch_locked(&mut state);
    }

    pub(crate) fn set_sending(
        &self,
        sending: bool,
    ) {
        let mut state = self.inner.state.lock().expect("sender poisoned");
        state.sending = sending;
    }

    /// Deliver `ready`s buffered while sending was disabled.
    pub(crate) fn flush_pending_ready(&self) {
        let pending = {
            let mut state = self.inner.state.lock().expect("sender poisoned");
            std::mem::take(&mut state.pending_ready)
        };
        if !pending.is_empty() {
            self.send_ready(pending);
        }
    }

    pub(crate) fn close(&self) {
        self.inner.sink.close();
    }
}
