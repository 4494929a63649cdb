//! Per-request context propagation.
//!
//! Callers embedding the stack under an interposition front-end sometimes
//! need to hand request-scoped data (a FUSE file-info record, a trace id)
//! down to a particular layer without every layer in between knowing about
//! it. The context is a thread-local `Arc<dyn Any>` installed for the
//! duration of a call; the parallel dispatcher re-installs the caller's
//! context inside each worker thread so a fan-out is transparent to it.
//!
//! The context is never owned by a layer: it lives exactly as long as the
//! [`ContextGuard`] that installed it.

use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;

/// Opaque request-scoped value shared down the call chain.
pub type RequestContext = Arc<dyn Any + Send + Sync>;

thread_local! {
    static CURRENT: RefCell<Option<RequestContext>> = const { RefCell::new(None) };
}

/// Installs `ctx` as the current thread's request context until the guard
/// drops, restoring whatever was installed before.
pub fn install(ctx: RequestContext) -> ContextGuard {
    let previous = CURRENT.with(|cell| cell.replace(Some(ctx)));
    ContextGuard { previous }
}

/// The context installed on this thread, if any.
pub fn current() -> Option<RequestContext> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Restores the previously installed context on drop.
#[must_use = "dropping the guard immediately uninstalls the context"]
pub struct ContextGuard {
    previous: Option<RequestContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|cell| *cell.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_and_restore() {
        assert!(current().is_none());
        {
            let _guard = install(Arc::new(41u32));
            let ctx = current().expect("installed");
            assert_eq!(*ctx.downcast::<u32>().expect("u32"), 41);
            {
                let _inner = install(Arc::new("nested"));
                let ctx = current().expect("nested installed");
                assert!(ctx.downcast::<&str>().is_ok());
            }
            // Inner guard dropped; the outer context is visible again.
            let ctx = current().expect("outer restored");
            assert_eq!(*ctx.downcast::<u32>().expect("u32"), 41);
        }
        assert!(current().is_none());
    }

    #[test]
    fn context_is_per_thread() {
        let _guard = install(Arc::new(1u8));
        std::thread::spawn(|| assert!(current().is_none()))
            .join()
            .expect("spawned thread");
    }
}
