//! Internal logging helpers for structured queue events.

/// Single logging target for the crate.
pub(crate) const LOG_TARGET: &str = "partqueue";

macro_rules! queue_log {
    ($level:expr, $event:expr, $fmt:expr $(, $args:expr)* $(,)?) => {{
        if log::log_enabled!($level) {
            log::log!(
                target: crate::logging::LOG_TARGET,
                $level,
                "event={} {}",
                $event,
                format_args!($fmt $(, $args)*)
            );
        }
    }};
}

pub(crate) use queue_log;
