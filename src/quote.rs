//! Escaping for statement text that cannot carry bound parameters.
//!
//! PostgreSQL does not accept parameters in utility statements such as
//! `SET LOCAL`, so values there must be embedded as literals. These two
//! functions are the only place such text is built. Inputs come from
//! configuration or from validated identifiers, never from end users.

/// Quote a string as a SQL literal.
///
/// Single quotes are doubled. A value containing a backslash switches to the
/// escape-string form (`E'...'`) with backslashes doubled as well, so the
/// result is correct regardless of `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");

    if escaped.contains('\\') {
        format!(" E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// Quote a possibly schema-qualified identifier.
///
/// Each part is wrapped in double quotes with embedded double quotes doubled
/// and NUL bytes removed; parts are joined with `.`.
pub fn quote_identifier<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|part| {
            let cleaned = part.as_ref().replace('\0', "").replace('"', "\"\"");
            format!("\"{}\"", cleaned)
        })
        .collect::<Vec<_>>()
        .join(".")
}
