//! Dialect dispatch macro.
//!
//! Expands to a single `match` over [`DialectConnection`] variants so each
//! operation reads as two parallel arms with no runtime overhead.
//!
//! [`DialectConnection`]: crate::db::dialect::DialectConnection

/// Generate match arms for `DialectConnection` variants.
///
/// # Example
///
/// ```ignore
/// dispatch_dialect!(conn, {
///     MySql(s) => mysql::ping(s).await,
///     Postgres(s) => postgres::ping(s).await,
/// });
/// ```
#[macro_export]
macro_rules! dispatch_dialect {
    ($conn:expr, { $($variant:ident($s:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::dialect::DialectConnection::$variant($s) => $body,
            )+
        }
    };
}

pub use dispatch_dialect;
