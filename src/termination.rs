//! Defines the [`Termination`] trait.

use std::{convert::Infallible, fmt::Debug, process};

/// This trait extends the [`std::process::Termination`] trait so that [`run`] can pick the exit
/// code.
///
/// The GUI event loop owns the main thread and never returns, so the application's `main` runs on
/// a second thread and [`run`] exits the process itself once it returns. This trait tells it
/// whether that exit should report success.
///
/// [`run`]: crate::run
pub trait Termination: process::Termination {
    fn is_success(&self) -> bool;
}

impl Termination for Infallible {
    fn is_success(&self) -> bool {
        match *self {}
    }
}

impl Termination for () {
    fn is_success(&self) -> bool {
        true
    }
}

impl<T: Termination, E: Debug> Termination for Result<T, E> {
    fn is_success(&self) -> bool {
        match self {
            Ok(term) => term.is_success(),
            Err(_) => false,
        }
    }
}
