//! Write-only trace/config side channel, backed by `tracing`. Loss of log
//! output must never affect correctness: with no subscriber installed these
//! macros are simply no-ops.

pub fn log_trace(msg: impl AsRef<str>) {
    tracing::trace!(target: "chunkkv::trace", "{}", msg.as_ref());
}

pub fn log_config(msg: impl AsRef<str>) {
    tracing::info!(target: "chunkkv::config", "{}", msg.as_ref());
}
