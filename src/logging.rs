//! Tracing setup and replay-safe logging macros.
//!
//! Orchestration code runs once per replay, so plain `tracing` calls inside it repeat on
//! every turn. The `replay_safe_*` macros only emit while the context is executing new
//! events.

pub const DISPATCHER_TARGET: &str = "durable_task_core::dispatcher";
pub const REPLAY_TARGET: &str = "durable_task_core::replay";
pub const ENTITIES_TARGET: &str = "durable_task_core::entities";
pub const RETRY_TARGET: &str = "durable_task_core::retry";

/// Installs a fmt subscriber filtered by `RUST_LOG` (default `info`). Safe to call repeatedly.
pub fn init_default_subscriber() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

#[macro_export]
macro_rules! replay_safe_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! replay_safe_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! replay_safe_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}
