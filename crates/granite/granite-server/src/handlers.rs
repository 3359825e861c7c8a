// Request dispatch. Every handler is synchronous and returns promptly:
// collaborator calls are moved onto the blocking pool and never awaited.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use basalt_events::now_ms;
use serde_json::{Value, json};

use crate::arbitration::{AcquireOutcome, ConnId, Outbox, ReleaseOutcome};
use crate::protocol::{ErrorCode, ErrorReply, Request, error_line, parse_request, response_line};
use crate::server::Shared;

pub(crate) const DENIED_REASON: &str = "wait until stock download is finished";

type Reply = Result<Value, ErrorReply>;

/// Turn one input line into exactly one output line.
pub(crate) fn handle_line(shared: &Arc<Shared>, conn: ConnId, outbox: &Outbox, line: &[u8]) -> String {
    let req = match parse_request(line) {
        Ok(req) => req,
        Err((id, err)) => {
            tracing::warn!(conn, %id, code = err.code.as_str(), error = %err.message, "rejected request");
            return error_line(&id, &err);
        }
    };

    tracing::info!(conn, id = %req.id, op = %req.op, "handling");
    let started = Instant::now();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(shared, conn, outbox, &req)));
    let line = match outcome {
        Ok(Ok(data)) => response_line(&req.id, &req.op, data),
        Ok(Err(err)) => {
            tracing::warn!(conn, id = %req.id, op = %req.op, code = err.code.as_str(), error = %err.message, "error response");
            error_line(&req.id, &err)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(conn, id = %req.id, op = %req.op, panic = %message, "handler panicked");
            error_line(&req.id, &ErrorReply::new(ErrorCode::Internal, message))
        }
    };

    tracing::info!(
        conn,
        id = %req.id,
        op = %req.op,
        latency_us = started.elapsed().as_micros() as u64,
        "completed"
    );
    line
}

fn dispatch(shared: &Arc<Shared>, conn: ConnId, outbox: &Outbox, req: &Request) -> Reply {
    match req.op.as_str() {
        "list_tickers" => Ok(json!(shared.services.state.tickers())),
        "get_quote" => get_quote(shared, req),
        "get_snapshot_epoch" => {
            let e = shared.services.state.snapshot_epoch();
            Ok(json!({ "epoch": e.epoch, "last_update_ms": e.last_update_ms }))
        }
        "get_shm_name" => match shared.services.state.shm_name() {
            Some(name) => Ok(json!({ "shm_name": name })),
            None => Err(ErrorReply::not_found("Shared memory not configured")),
        },
        "get_fundamentals" => get_fundamentals(shared, req),
        "acquire_ibkr" => acquire(shared, conn, outbox),
        "release_ibkr" => release(shared, conn),
        _ => Err(ErrorReply::bad_request("Unknown request type")),
    }
}

fn get_quote(shared: &Shared, req: &Request) -> Reply {
    let ticker = req
        .str_field("ticker")
        .ok_or_else(|| ErrorReply::bad_request("Missing ticker"))?;
    let quote = shared
        .services
        .state
        .quote(ticker)
        .ok_or_else(|| ErrorReply::not_found(format!("Unknown ticker {ticker}")))?;

    let stale = quote.is_stale(now_ms(), shared.settings.freshness_window_ms);
    let mut data = match serde_json::to_value(&quote) {
        Ok(Value::Object(map)) => map,
        _ => return Err(ErrorReply::new(ErrorCode::Internal, "quote encoding failed")),
    };
    data.insert("ticker".into(), json!(ticker));
    data.insert("stale".into(), json!(stale));
    Ok(Value::Object(data))
}

fn get_fundamentals(shared: &Arc<Shared>, req: &Request) -> Reply {
    let ticker = req
        .str_field("ticker")
        .ok_or_else(|| ErrorReply::bad_request("Missing ticker"))?;
    let cache = &shared.services.fundamentals;

    if cache.needs_refresh(ticker, req.flag("fresh")) {
        schedule_refresh(shared, ticker);
    }

    let value = cache
        .get(ticker)
        .ok_or_else(|| ErrorReply::not_found(format!("No fundamentals for {ticker}")))?;
    serde_json::to_value(&*value)
        .map_err(|e| ErrorReply::new(ErrorCode::Internal, format!("fundamentals encoding failed: {e}")))
}

fn schedule_refresh(shared: &Arc<Shared>, ticker: &str) {
    let Some(source) = shared.services.fundamentals_source.clone() else {
        tracing::debug!(ticker, "no fundamentals source configured");
        return;
    };
    if !shared.refreshing.lock().insert(ticker.to_string()) {
        return;
    }

    let shared = Arc::clone(shared);
    let ticker = ticker.to_string();
    offload(move || {
        match source.fetch(&ticker) {
            Ok(f) => {
                tracing::info!(ticker = %ticker, "fundamentals refreshed");
                shared.services.fundamentals.set(&ticker, f);
            }
            Err(e) => tracing::warn!(ticker = %ticker, error = %e, "fundamentals refresh failed"),
        }
        shared.refreshing.lock().remove(&ticker);
    });
}

fn acquire(shared: &Shared, conn: ConnId, outbox: &Outbox) -> Reply {
    let manager = &shared.services.manager;
    match shared.arbiter.acquire(conn, outbox, || manager.is_downloading()) {
        AcquireOutcome::Acquired => {
            tracing::info!(conn, "IBKR connection acquired");
            let manager = Arc::clone(manager);
            offload(move || manager.disconnect_from_ibkr_tws());
            Ok(json!({ "status": "acquired" }))
        }
        AcquireOutcome::AlreadyOwner => Ok(json!({ "status": "acquired" })),
        AcquireOutcome::Denied => Ok(json!({ "status": "denied", "reason": DENIED_REASON })),
        AcquireOutcome::Conflict => Err(ErrorReply::new(
            ErrorCode::Conflict,
            "IBKR connection already acquired by another client",
        )),
    }
}

fn release(shared: &Shared, conn: ConnId) -> Reply {
    match shared.arbiter.release(conn) {
        ReleaseOutcome::Released => {
            tracing::info!(conn, "IBKR connection released");
            reconnect(shared);
            Ok(json!({ "status": "released" }))
        }
        ReleaseOutcome::NotHeld => Err(ErrorReply::bad_request("no acquired connection to release")),
        ReleaseOutcome::NotOwner => Err(ErrorReply::new(
            ErrorCode::Conflict,
            "IBKR connection is held by another client",
        )),
    }
}

/// Hand the session back to the data manager.
pub(crate) fn reconnect(shared: &Shared) {
    let manager = Arc::clone(&shared.services.manager);
    offload(move || manager.connect_to_ibkr_tws());
}

/// Run `f` on the blocking pool without waiting for it. Outside a runtime
/// it runs inline.
fn offload<F: FnOnce() + Send + 'static>(f: F) {
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn_blocking(f);
        }
        Err(_) => f(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
