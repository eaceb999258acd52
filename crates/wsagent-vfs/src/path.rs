use std::ffi::OsString;
use std::path::{Component, Path, PathBuf, Prefix, PrefixComponent};

pub(crate) fn normalize_local_path(path: &Path) -> PathBuf {
    let mut prefix: Option<OsString> = None;
    let mut has_root = false;
    let mut stack: Vec<OsString> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix_component) => {
                prefix = Some(normalize_prefix(prefix_component));
            }
            Component::RootDir => has_root = true,
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(last) = stack.last() {
                    if last != ".." {
                        stack.pop();
                        continue;
                    }
                }

                // `..` above an absolute root stays at the root.
                if !has_root {
                    stack.push(OsString::from(".."));
                }
            }
            Component::Normal(segment) => stack.push(segment.to_owned()),
        }
    }

    let mut out = PathBuf::new();
    match (prefix, has_root) {
        (Some(mut prefix), true) => {
            prefix.push(std::path::MAIN_SEPARATOR.to_string());
            out.push(prefix);
        }
        (Some(prefix), false) => out.push(prefix),
        (None, true) => out.push(std::path::MAIN_SEPARATOR.to_string()),
        (None, false) => {}
    }
    out.extend(stack);
    out
}

fn normalize_prefix(prefix: PrefixComponent<'_>) -> OsString {
    // Drive letters are case-insensitive; keep them uppercase so `c:\a` and `C:\a` compare equal.
    match prefix.kind() {
        Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
            let mut out = OsString::new();
            out.push((letter as char).to_ascii_uppercase().to_string());
            out.push(":");
            out
        }
        _ => prefix.as_os_str().to_owned(),
    }
}
