//! Directory listing parser.
//!
//! Listings arrive as a Python list repr (`['boot.py', 'lib']`), as
//! `os.ilistdir` tuples (`[('lib', 16384, 0, 0)]`), or as plain text with one
//! name per line. Where the reply says what an entry is (a trailing `/`, an
//! ilistdir type code, a `file`/`dir` column) that wins; otherwise
//! [`infer_kind`] guesses.

/// What a directory entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DirEntry {
    /// Entry name without any directory part.
    pub name: String,
    /// File or directory.
    pub kind: EntryKind,
    /// Full path on the device.
    pub path: String,
}

/// `st_mode` type bit for directories in `os.ilistdir` tuples.
const S_IFDIR: u32 = 0x4000;

/// Guess an entry's kind from its name: names with an extension are files.
///
/// This is an approximation; `README` is reported as a directory.
pub fn infer_kind(name: &str) -> EntryKind {
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < name.len() => EntryKind::File,
        _ => EntryKind::Directory,
    }
}

/// Join a directory and an entry name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        format!("/{name}")
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Parse the listing of `dir`.
pub fn parse_listing(dir: &str, raw: &str) -> Vec<DirEntry> {
    let raw = raw.trim();
    let items: Vec<(String, Option<EntryKind>)> = if raw.starts_with('[') && raw.ends_with(']') {
        split_top_level(&raw[1..raw.len() - 1])
            .into_iter()
            .filter_map(|item| parse_repr_item(&item))
            .collect()
    } else {
        parse_text(raw)
    };

    items
        .into_iter()
        .filter(|(name, _)| !name.is_empty() && name != "." && name != "..")
        .map(|(name, kind)| DirEntry {
            path: join_path(dir, &name),
            kind: kind.unwrap_or_else(|| infer_kind(&name)),
            name,
        })
        .collect()
}

/// Split a Python literal list body on commas outside quotes and brackets.
fn split_top_level(body: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth = 0usize;

    for ch in body.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                current.push(ch);
            },
            '(' | '[' => {
                depth += 1;
                current.push(ch);
            },
            ')' | ']' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            },
            ',' if depth == 0 => items.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    items.push(current);

    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn unquote(literal: &str) -> String {
    let literal = literal.trim();
    let inner = literal
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| literal.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .unwrap_or(literal);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

fn parse_repr_item(item: &str) -> Option<(String, Option<EntryKind>)> {
    let Some(tuple) = item.strip_prefix('(').and_then(|s| s.strip_suffix(')')) else {
        return Some(split_marker(&unquote(item)));
    };

    let fields = split_top_level(tuple);
    let name = unquote(fields.first()?);
    let kind = fields
        .get(1)
        .and_then(|code| code.trim().parse::<u32>().ok())
        .map(|code| {
            if code & S_IFDIR != 0 {
                EntryKind::Directory
            } else {
                EntryKind::File
            }
        });
    Some((name, kind))
}

/// A trailing `/` marks a directory.
fn split_marker(name: &str) -> (String, Option<EntryKind>) {
    match name.strip_suffix('/') {
        Some(dir) => (dir.to_string(), Some(EntryKind::Directory)),
        None => (name.to_string(), None),
    }
}

fn parse_text(raw: &str) -> Vec<(String, Option<EntryKind>)> {
    let lines: Vec<&str> = if raw.lines().count() == 1 && raw.contains(',') {
        raw.split(',').collect()
    } else {
        raw.lines().collect()
    };

    lines
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.rsplit_once(char::is_whitespace) {
            Some((name, column)) => match column.to_ascii_lowercase().as_str() {
                "file" | "f" => (name.trim().to_string(), Some(EntryKind::File)),
                "dir" | "directory" | "d" => (name.trim().to_string(), Some(EntryKind::Directory)),
                _ => split_marker(line),
            },
            None => split_marker(line),
        })
        .collect()
}
