// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! Panic capture for method bodies.
//!
//! A process-wide panic hook records the backtrace of the latest panic in a
//! thread-local slot. `catch_unwind` runs on the panicking thread, so the
//! catcher finds the backtrace there and attaches it to the `INTERNAL` error.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;

use crate::domain::error::CallError;

thread_local! {
    static LAST_PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chain the capturing hook in front of the existing one. Idempotent.
pub(crate) fn install_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("method panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("method panicked: {}", message)
    } else {
        "method panicked".to_string()
    }
}

/// Turn a caught panic payload into `INTERNAL`, with the backtrace recorded on this thread.
pub(crate) fn caught(panic: Box<dyn Any + Send>) -> CallError {
    let message = panic_message(&*panic);
    let trace = LAST_PANIC_TRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| message.clone());
    CallError::panicked(message, trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorCode;
    use std::panic::AssertUnwindSafe;

    #[inline(never)]
    fn explode() {
        panic!("boom");
    }

    #[test]
    fn test_caught_panic_carries_backtrace() {
        install_hook();
        let panic = std::panic::catch_unwind(AssertUnwindSafe(explode)).unwrap_err();
        let payload = caught(panic).to_payload();

        assert_eq!(payload.error, ErrorCode::Internal);
        assert_eq!(payload.reason, "method panicked: boom");
        let trace = payload.trace.unwrap();
        assert_ne!(trace, "method panicked: boom");
        assert_eq!(payload.extra, Some(serde_json::Value::String(trace)));
    }

    #[test]
    fn test_slot_is_consumed() {
        install_hook();
        let first = std::panic::catch_unwind(|| panic!("one")).unwrap_err();
        caught(first);
        let empty = LAST_PANIC_TRACE.with(|slot| slot.borrow().is_none());
        assert!(empty);
    }
}
