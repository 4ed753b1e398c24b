//! Unique naming within a folder
//!
//! Collisions are resolved with a numbered suffix before the extension:
//! `photo.jpg`, `photo (1).jpg`, `photo (2).jpg`, ...
//! The first free candidate wins, so the result only depends on the set of
//! names already taken.

/// Splits a file name into base and extension (with its dot)
///
/// The split is on the last dot. A leading dot belongs to the base, so
/// `.bashrc` has no extension.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => (&name[..idx], &name[idx..]),
    }
}

/// Returns `name` if it is free, otherwise the first free `base (n).ext`
pub fn unique_name<F>(name: &str, mut exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    if !exists(name) {
        return name.to_string();
    }

    let (base, ext) = split_name(name);
    let mut n: u64 = 1;
    loop {
        let candidate = format!("{base} ({n}){ext}");
        if !exists(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
