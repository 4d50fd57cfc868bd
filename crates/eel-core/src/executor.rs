//! Runs inbound Commands against the exposure registry.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::errors::HandlerError;
use crate::message::{Command, Response};
use crate::registry::ExposureRegistry;

/// Execute `command` and build its Response.
///
/// Always produces exactly one Response: handler errors, handler panics and
/// unknown function names all become `error = true` Responses.
pub async fn execute(registry: &ExposureRegistry, command: Command) -> Response {
    let Command {
        id,
        function,
        parameters,
    } = command;

    let handler = match registry.lookup(&function) {
        Ok(handler) => handler,
        Err(_) => {
            warn!(call_id = %id, function, "peer called unexposed function");
            return Response::failure(id, format!("Could not find function: {function}"));
        }
    };

    debug!(call_id = %id, function, args = parameters.len(), "executing exposed function");
    match AssertUnwindSafe(handler.call(parameters)).catch_unwind().await {
        Ok(Ok(value)) => Response::success(id, value),
        Ok(Err(err)) => {
            debug!(call_id = %id, function, error = %err, "exposed function failed");
            Response::failure(id, err.to_string())
        }
        Err(payload) => {
            let err = HandlerError::Panicked(panic_message(payload.as_ref()));
            warn!(call_id = %id, function, error = %err, "exposed function panicked");
            Response::failure(id, err.to_string())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
