//! Catching panics together with the backtrace of where they were raised.
//!
//! Once `catch_unwind` returns the panicking frames are gone, so the backtrace is taken by a
//! panic hook while they still exist. The hook is installed on first use, chains to the hook
//! it replaces, and only captures for panics raised under [`catch`] or [`catch_async`].

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    panic::AssertUnwindSafe,
    pin::pin,
    sync::Once,
};

use futures::{FutureExt, future::poll_fn};

thread_local! {
    static GUARDED: Cell<bool> = const { Cell::new(false) };
    static BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

/// A caught panic.
#[derive(Debug)]
pub(crate) struct CaughtPanic {
    pub(crate) message: String,
    /// Taken at the panic site. Disabled if another panic hook replaced ours.
    pub(crate) backtrace: Backtrace,
}

impl CaughtPanic {
    fn new(payload: Box<dyn Any + Send>) -> Self {
        let backtrace = BACKTRACE
            .try_with(|b| b.borrow_mut().take())
            .ok()
            .flatten()
            .unwrap_or_else(Backtrace::disabled);
        Self {
            message: panic_message(payload.as_ref()),
            backtrace,
        }
    }
}

/// Run `f`, catching a panic.
pub(crate) fn catch<T>(f: impl FnOnce() -> T) -> Result<T, CaughtPanic> {
    install_hook();
    std::panic::catch_unwind(AssertUnwindSafe(|| {
        let _guarded = Guarded::enter();
        f()
    }))
    .map_err(CaughtPanic::new)
}

/// Drive `fut` to completion, catching a panic raised by any of its polls.
pub(crate) async fn catch_async<F>(fut: F) -> Result<F::Output, CaughtPanic>
where
    F: Future + Send,
{
    install_hook();
    let mut fut = pin!(fut);
    let guarded = poll_fn(move |cx| {
        let _guarded = Guarded::enter();
        fut.as_mut().poll(cx)
    });
    AssertUnwindSafe(guarded)
        .catch_unwind()
        .await
        .map_err(CaughtPanic::new)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if GUARDED.try_with(Cell::get).unwrap_or(false) {
                let _ = BACKTRACE.try_with(|b| b.replace(Some(Backtrace::force_capture())));
            }
            previous(info);
        }));
    });
}

/// Marks the current thread as running guarded code until dropped. Nests.
#[derive(Debug)]
struct Guarded {
    previous: bool,
}

impl Guarded {
    fn enter() -> Self {
        Self {
            previous: GUARDED.replace(true),
        }
    }
}

impl Drop for Guarded {
    fn drop(&mut self) {
        GUARDED.set(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use std::backtrace::BacktraceStatus;

    use pretty_assertions::assert_eq;

    use super::*;

    #[inline(never)]
    fn explode() {
        panic!("exploded");
    }

    fn stashed() -> bool {
        BACKTRACE.with(|b| b.borrow().is_some())
    }

    #[test]
    fn backtrace_is_taken_at_the_panic_site() {
        let panic = catch(explode).unwrap_err();

        assert_eq!(panic.message, "exploded");
        assert_eq!(panic.backtrace.status(), BacktraceStatus::Captured);
        let backtrace = panic.backtrace.to_string();
        assert!(backtrace.contains("unwind::tests::explode"), "{backtrace}");
        assert!(!stashed());
        assert!(!GUARDED.get());
    }

    #[tokio::test]
    async fn panics_while_polling_are_caught() {
        let panic = catch_async(async {
            tokio::task::yield_now().await;
            explode();
        })
        .await
        .unwrap_err();

        assert_eq!(panic.message, "exploded");
        let backtrace = panic.backtrace.to_string();
        assert!(backtrace.contains("unwind::tests::explode"), "{backtrace}");

        assert_eq!(catch_async(async { 42 }).await.unwrap(), 42);
    }

    #[test]
    fn unguarded_panics_are_not_captured() {
        install_hook();
        assert!(std::panic::catch_unwind(explode).is_err());
        assert!(!stashed());
    }

    #[test]
    fn nested_guards_restore_the_outer_state() {
        let inner = catch(|| catch(explode).is_err()).unwrap();
        assert!(inner);
        assert!(!GUARDED.get());
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(&"static str"), "static str");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic payload");
    }
}
