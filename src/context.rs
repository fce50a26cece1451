//! Per-request identity exposed to user callbacks.
//!
//! Every dispatched request publishes the caller's uid/gid/pid and the value
//! returned by the user `init` callback. The storage behind the accessor is
//! swappable so embedders with their own threading model can provide a
//! different thread-scoped slot.

use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::RwLock;

/// Opaque per-filesystem value produced by the user `init` callback.
pub type PrivateData = Arc<dyn Any + Send + Sync>;

/// Identity of the process that triggered the current request.
#[derive(Clone, Default)]
pub struct Context {
    /// User id of the calling process.
    pub uid: u32,
    /// Group id of the calling process.
    pub gid: u32,
    /// Process id of the calling process.
    pub pid: u32,
    /// Value returned by the user `init` callback, if any.
    pub private_data: Option<PrivateData>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("pid", &self.pid)
            .field("private_data", &self.private_data.is_some())
            .finish()
    }
}

impl Context {
    /// The context of the request currently being dispatched on this
    /// thread, if any.
    pub fn current() -> Option<Context> {
        STORE.read().current()
    }
}

/// Thread-scoped storage slot for the request context.
///
/// The default implementation keeps the context in a thread-local; replace
/// it with [`set_context_store`] when requests are dispatched from a
/// threading model where that does not hold (e.g. a custom scheduler that
/// migrates work between threads).
pub trait ContextStore: Sync {
    /// Publish the context of the request starting on this thread.
    fn replace(&self, ctx: Option<Context>);

    /// The context last published on this thread.
    fn current(&self) -> Option<Context>;
}

struct ThreadLocalStore;

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

impl ContextStore for ThreadLocalStore {
    fn replace(&self, ctx: Option<Context>) {
        CURRENT.with(|c| *c.borrow_mut() = ctx);
    }

    fn current(&self) -> Option<Context> {
        CURRENT.with(|c| c.borrow().clone())
    }
}

static THREAD_LOCAL: ThreadLocalStore = ThreadLocalStore;
static STORE: RwLock<&'static dyn ContextStore> = RwLock::new(&THREAD_LOCAL);

/// Swap the storage slot the context accessor reads from.
pub fn set_context_store(store: &'static dyn ContextStore) {
    *STORE.write() = store;
}

pub(crate) fn enter(ctx: Context) {
    STORE.read().replace(Some(ctx));
}
