//! Request path normalization shared by archive lookups and direct objects.

/// File served for directory-style paths
pub const INDEX_FILE: &str = "index.html";

/// Turn a request path into a relative file name.
///
/// Empty and `.` segments are dropped, `..` never climbs above the root and
/// a leading `/` is removed. An empty path or one ending in `/` names the
/// directory's [`INDEX_FILE`].
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    let is_directory = path.is_empty()
        || path.ends_with('/')
        || path.ends_with("/.")
        || path.ends_with("/..")
        || path == "."
        || path == "..";
    if is_directory {
        segments.push(INDEX_FILE);
    }
    segments.join("/")
}
