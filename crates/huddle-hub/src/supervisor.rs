//! Panic isolation for actor loops.
//!
//! Each command is processed inside [`guarded`]. A panic while handling one
//! command is logged and swallowed so the actor keeps serving the next one;
//! handlers finish their state mutation before doing anything that can
//! fail, so a recovered panic never leaves a registry half-updated.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::error;

pub(crate) async fn guarded<F>(actor: &'static str, fut: F)
where
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        error!(
            actor,
            panic = %panic_message(panic.as_ref()),
            "Recovered from panic in actor loop"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
