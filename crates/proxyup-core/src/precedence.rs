//! Ordered source resolution
//!
//! Each identity field is resolved from a left-to-right list of optional
//! sources, falling back to a lazily computed default.

/// Return the first present value in `sources`, else `default()`.
///
/// `default` only runs when every source is absent, so generating defaults
/// (random ids, fresh UUIDs) costs nothing when a source is available.
pub fn resolve<T, I>(sources: I, default: impl FnOnce() -> T) -> T
where
    I: IntoIterator<Item = Option<T>>,
{
    sources
        .into_iter()
        .flatten()
        .next()
        .unwrap_or_else(default)
}

/// Treat empty and whitespace-only strings as absent.
pub fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Coerce a raw port string.
///
/// Returns `None` for anything that is not an integer in `1..=65535`, so the
/// caller moves on to the next source instead of failing.
pub fn parse_port(raw: &str) -> Option<u16> {
    let value: i64 = raw.trim().parse().ok()?;
    u16::try_from(value).ok().filter(|p| *p > 0)
}
