/// Logs at error level with an additional `crit` marker so downstream
/// alerting can distinguish page-worthy conditions from ordinary errors.
#[macro_export]
macro_rules! crit {
    ($($arg:tt)*) => {
        ::tracing::error!(crit = true, $($arg)*);
    };
}
