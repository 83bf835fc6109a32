//! Runs the loops of a conversation on scoped OS threads.
use std::any::Any;
use std::sync::{Mutex, PoisonError};
use std::{fmt, panic, thread};

use crate::NodeId;

/// A unit of work run on its own thread.
pub type Task<'env, E> = Box<dyn FnOnce() -> Result<(), E> + Send + 'env>;

/// A task panicked.
#[derive(thiserror::Error, Debug)]
#[error("thread `{label}` panicked: {message}")]
pub struct Panic {
    pub label: &'static str,
    pub message: String,
}

impl Panic {
    fn new(label: &'static str, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("<unknown>")
        };
        Self { label, message }
    }
}

/// Spawn a scoped OS thread.
pub fn spawn_scoped<'scope, 'env, D, F, T>(
    nid: &NodeId,
    label: D,
    scope: &'scope thread::Scope<'scope, 'env>,
    f: F,
) -> thread::ScopedJoinHandle<'scope, T>
where
    D: fmt::Display,
    F: FnOnce() -> T,
    F: Send + 'scope,
    T: Send + 'scope,
{
    thread::Builder::new()
        .name(name(nid, label))
        .spawn_scoped(scope, f)
        .expect("thread::spawn_scoped: thread label must not contain NULL bytes")
}

pub fn name<D: fmt::Display>(nid: &NodeId, label: D) -> String {
    if cfg!(debug_assertions) {
        format!("{nid} {:<14}", format!("<{label}>"))
    } else {
        format!("{label}")
    }
}

/// Run every task on its own thread and wait for all of them.
///
/// The first task to fail, by returning an error or panicking, triggers `on_error`. It is
/// called at most once, and should unblock the remaining tasks, eg. by closing the
/// connection they're reading from. The first error is returned; later ones are logged.
pub fn do_parallel_with_handler<'env, E, F>(
    peer: &NodeId,
    on_error: F,
    tasks: Vec<(&'static str, Task<'env, E>)>,
) -> Result<(), E>
where
    E: From<Panic> + fmt::Display + Send,
    F: Fn() + Sync,
{
    let failure: Mutex<Option<E>> = Mutex::new(None);
    let fail = |label: &'static str, err: E| {
        let mut failure = failure.lock().unwrap_or_else(PoisonError::into_inner);

        if failure.is_none() {
            log::debug!(target: "rpc", "Task `{label}` with {peer} failed: {err}");
            *failure = Some(err);
            drop(failure);

            on_error();
        } else {
            log::debug!(target: "rpc", "Task `{label}` with {peer} also failed: {err}");
        }
    };

    thread::scope(|s| {
        let handles = tasks
            .into_iter()
            .map(|(label, task)| {
                let fail = &fail;

                spawn_scoped(peer, label, s, move || {
                    match panic::catch_unwind(panic::AssertUnwindSafe(task)) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => fail(label, err),
                        Err(payload) => fail(label, E::from(Panic::new(label, payload))),
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            // Panics are caught inside the thread.
            handle.join().ok();
        }
    });

    match failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
