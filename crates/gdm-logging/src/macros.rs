//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Event macros that attach a [`LogContext`](crate::LogContext).

#[doc(hidden)]
#[macro_export]
macro_rules! __gdm_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            tick = ctx.tick.unwrap_or_default(),
            role = ctx.role.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with tick/role context.
#[macro_export]
macro_rules! gdm_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__gdm_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__gdm_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with tick/role context.
#[macro_export]
macro_rules! gdm_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__gdm_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__gdm_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with tick/role context.
#[macro_export]
macro_rules! gdm_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__gdm_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__gdm_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}
