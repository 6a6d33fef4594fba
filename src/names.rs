// src/names.rs
//! Qualified test name parsing.
//!
//! Splits fully qualified automated test names into type/method/arguments
//! and derives the owning project from the test storage name. Malformed
//! input is never an error here; the fallbacks are permissive by design.

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub type_name: String,
    pub method: String,
    pub arguments: String,
}

/// Split a qualified test name into (type, method, arguments).
///
/// Everything before the first `(` is the name proper; everything between
/// the `(` and the final character is the argument string. Within the name,
/// the last `.` separates type from method; with no `.` the whole name is
/// the method. Argument strings containing parentheses or dots are not
/// balanced or escaped; only the first `(` is used as the boundary.
pub fn parse_test_name(qualified: &str) -> ParsedName {
    let (pre_args, arguments) = match qualified.find('(') {
        Some(paren) => {
            let rest = &qualified[paren + 1..];
            // Drop the assumed trailing ')'.
            let args = match rest.char_indices().last() {
                Some((last, _)) => &rest[..last],
                None => "",
            };
            (&qualified[..paren], args)
        }
        None => (qualified, ""),
    };

    let (type_name, method) = match pre_args.rfind('.') {
        Some(dot) => (&pre_args[..dot], &pre_args[dot + 1..]),
        None => ("", pre_args),
    };

    ParsedName {
        type_name: type_name.to_string(),
        method: method.to_string(),
        arguments: arguments.to_string(),
    }
}

/// Derive the project name from a test storage name.
///
/// Binary module names (`path/to/Foo.Tests.dll`) yield the file stem;
/// otherwise the prefix before the first `--` is used; anything else passes
/// through unchanged with a logged warning.
pub fn parse_project(storage: &str) -> String {
    if let Some(stem) = storage.strip_suffix(".dll") {
        let file = stem.rsplit(['/', '\\']).next().unwrap_or(stem);
        return file.to_string();
    }
    if let Some(idx) = storage.find("--") {
        return storage[..idx].to_string();
    }
    warn!("unexpected test storage name: '{}'", storage);
    storage.to_string()
}
