//! Slash-path helpers shared by the S3 adapter and the common contracts.
//!
//! All names handled here are forward-slash paths. A trailing `/` marks a
//! directory path; the root is `/`. Empty directories on the object store
//! are materialized by a stub object named [`DIR_STUB_FILE_NAME`] inside
//! the directory.

/// Name of the stub file imitating an empty folder on the object store.
pub const DIR_STUB_FILE_NAME: &str = ".dir";

/// Content of the stub file imitating an empty folder.
pub const DIR_STUB_FILE_CONTENT: &[u8] = b"!";

const STUB_SUFFIX: &str = "/.dir";

/// Normalizes a name into the canonical form used by the S3 adapter:
/// rooted, forward slashes only, dot segments collapsed, drive-letter
/// prefixes stripped, and a trailing `/` preserved for directory inputs.
pub fn normalize(name: &str) -> String {
    let name = if name.is_empty() { "/" } else { name };
    let was_dir = is_dir_path(name);
    let name = strip_drive_letter(name);
    let mut name = clean(name).replace('\\', "/");
    if !name.starts_with('/') {
        name.insert(0, '/');
    }
    if was_dir && name != "/" {
        name.push('/');
    }
    name
}

fn strip_drive_letter(name: &str) -> &str {
    let b = name.as_bytes();
    if b.len() >= 2 && b[1] == b':' && (b[0].is_ascii_alphabetic() || b[0] == b'?') {
        &name[2..]
    } else {
        name
    }
}

/// Lexical path cleaning: collapses repeated separators and `.` segments,
/// resolves `..` against preceding segments (clamped at the root for
/// rooted paths, preserved at the front of relative ones).
fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if out.last().is_some_and(|s| *s != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            seg => out.push(seg),
        }
    }
    let joined = out.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Whether the name denotes a directory path (trailing `/`).
pub fn is_dir_path(name: &str) -> bool {
    name.ends_with('/')
}

/// Whether the name denotes a directory stub object.
pub fn is_stub(name: &str) -> bool {
    name.ends_with(STUB_SUFFIX)
}

/// Whether the name denotes a directory, either as a path or as a stub.
pub fn is_dir(name: &str) -> bool {
    is_dir_path(name) || is_stub(name)
}

/// Appends a trailing `/` unless already present.
pub fn name_to_dir(name: &str) -> String {
    if name.ends_with('/') {
        name.to_string()
    } else {
        format!("{name}/")
    }
}

/// The stub object path for the given directory name.
pub fn name_to_stub(name: &str) -> String {
    format!("{}{}", name_to_dir(name), DIR_STUB_FILE_NAME)
}

/// Converts a stub object path to its directory path; any other name is
/// returned unchanged.
pub fn stub_to_dir(name: &str) -> String {
    if !is_stub(name) {
        return name.to_string();
    }
    let d = format!("{}/", dir(name));
    match d.strip_prefix('.') {
        Some(stripped) => stripped.to_string(),
        None => d,
    }
}

/// Parent directory of a slash path, without the trailing `/`.
/// The parent of a top-level name is `/`; a relative single segment
/// yields `.`.
pub fn dir(name: &str) -> String {
    match name.rfind('/') {
        None => ".".to_string(),
        Some(i) => clean(&name[..=i]),
    }
}

/// Last element of a slash path; trailing slashes are ignored, the root
/// stays `/`.
pub fn base(name: &str) -> String {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return if name.is_empty() { ".".to_string() } else { "/".to_string() };
    }
    match trimmed.rfind('/') {
        None => trimmed.to_string(),
        Some(i) => trimmed[i + 1..].to_string(),
    }
}

/// File name extension of the last path element, including the dot;
/// empty when there is none.
pub fn ext(name: &str) -> String {
    let b = base(name);
    match b.rfind('.') {
        Some(i) if i > 0 => b[i..].to_string(),
        _ => String::new(),
    }
}

/// Joins the non-empty segments with `/` and cleans the result.
pub fn join(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .copied()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        return String::new();
    }
    clean(&joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_basics() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("/a/b/"), "/a/b/");
        assert_eq!(normalize("/a//b/./c"), "/a/b/c");
        assert_eq!(normalize("/a/x/../b"), "/a/b");
    }

    #[test]
    fn normalize_strips_drive_letters_and_backslashes() {
        assert_eq!(normalize(r"C:\1\2\3.txt"), "/1/2/3.txt");
        assert_eq!(normalize(r"?:\x\y"), "/x/y");
        assert_eq!(normalize(r"d:/a/b"), "/a/b");
    }

    #[test]
    fn normalize_is_idempotent() {
        for p in [
            "", "/", "a", "/a/b/", "/a//b/../c", r"C:\1\2.txt", "/a/b/.dir",
        ] {
            let once = normalize(p);
            assert_eq!(normalize(&once), once, "input {p:?}");
        }
    }

    #[test]
    fn directory_classification() {
        assert!(is_dir_path("/a/"));
        assert!(!is_dir_path("/a"));
        assert!(is_stub("/a/.dir"));
        assert!(!is_stub("/a/x.dir"));
        assert!(!is_stub(".dir"));
        assert!(is_dir("/a/"));
        assert!(is_dir("/a/.dir"));
        assert!(!is_dir("/a/b.txt"));
    }

    #[test]
    fn stub_conversions() {
        assert_eq!(name_to_dir("/a/b"), "/a/b/");
        assert_eq!(name_to_dir("/a/b/"), "/a/b/");
        assert_eq!(name_to_stub("/a/b"), "/a/b/.dir");
        assert_eq!(stub_to_dir("/a/b/.dir"), "/a/b/");
        assert_eq!(stub_to_dir("/a/b/c.txt"), "/a/b/c.txt");
    }

    #[test]
    fn dir_base_ext() {
        assert_eq!(dir("/a/b/c.txt"), "/a/b");
        assert_eq!(dir("/a/b/"), "/a/b");
        assert_eq!(dir("/a"), "/");
        assert_eq!(dir("a"), ".");
        assert_eq!(base("/a/b/c.txt"), "c.txt");
        assert_eq!(base("/a/b/"), "b");
        assert_eq!(base("/"), "/");
        assert_eq!(ext("/a/b/c.txt"), ".txt");
        assert_eq!(ext("/a/b/c"), "");
        assert_eq!(ext("/a/.dir"), "");
    }

    #[test]
    fn join_segments() {
        assert_eq!(join(&["/a", "b", "c.txt"]), "/a/b/c.txt");
        assert_eq!(join(&["a", "", "b"]), "a/b");
        assert_eq!(join(&[]), "");
    }
}
