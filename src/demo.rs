//! Functions the `eel` binary exposes to the page out of the box.

use std::sync::{Arc, Weak};

use eel_core::{arg, from_async, EelError, HandlerError, Session};
use serde_json::{json, Value};

/// Expose `echo`, `add`, `serverInfo` and `callBrowser` on `session`.
pub fn expose_all(session: &Arc<Session>) -> eel_core::Result<()> {
    session.expose_fn("echo", |params| Ok(Value::Array(params)))?;

    session.expose_fn("add", |params| {
        let mut total = 0.0;
        for index in 0..params.len() {
            total += arg::<f64>(&params, index)?;
        }
        Ok(json!(total))
    })?;

    let started = chrono::Utc::now();
    session.expose_fn("serverInfo", move |_| {
        Ok(json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "startedAt": started.to_rfc3339(),
            "now": chrono::Utc::now().to_rfc3339(),
        }))
    })?;

    // Weak: the registry lives inside the session.
    let weak: Weak<Session> = Arc::downgrade(session);
    session.expose(
        "callBrowser",
        from_async(move |params| {
            let weak = weak.clone();
            async move { call_browser(weak, params).await }
        }),
    )?;
    Ok(())
}

/// `callBrowser(name, ...args)`: call `name` on the page and return its
/// value. Exercises a host call made from inside an exposed function.
async fn call_browser(session: Weak<Session>, params: Vec<Value>) -> Result<Value, HandlerError> {
    let function: String = arg(&params, 0)?;
    let session = session
        .upgrade()
        .ok_or_else(|| HandlerError::failed("session is gone"))?;
    let args = params.into_iter().skip(1).collect();
    session.call(&function, args).await.map_err(|e| match e {
        EelError::Remote { message, .. } => HandlerError::Failed(message),
        other => HandlerError::Failed(other.to_string()),
    })
}
