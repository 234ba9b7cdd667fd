//! Unified diff validation.
//!
//! Only structure is checked: file headers, hunk headers and hunk line
//! counts. Whether the diff applies is the builder's call.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Structural problems in a submitted diff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    #[error("diff is empty")]
    Empty,

    #[error("diff is not valid UTF-8")]
    NotUtf8,

    #[error("no file headers found (expected `--- ` / `+++ ` pairs)")]
    NoFiles,

    #[error("line {line}: `--- ` header not followed by `+++ `")]
    MissingNewHeader { line: usize },

    #[error("line {line}: file {path} has no hunks")]
    NoHunks { line: usize, path: String },

    #[error("line {line}: malformed hunk header {header:?}")]
    BadHunkHeader { line: usize, header: String },

    #[error("line {line}: hunk body ended early (expected {old_left} more old / {new_left} more new lines)")]
    TruncatedHunk {
        line: usize,
        old_left: u32,
        new_left: u32,
    },

    #[error("binary patches are not supported ({path})")]
    Binary { path: String },
}

/// One hunk header, `@@ -old_start,old_lines +new_start,new_lines @@`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
}

/// All hunks for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    /// Path as the patched tree sees it (`a/`/`b/` prefixes stripped).
    pub fn path(&self) -> &str {
        let raw = if self.new_path == "/dev/null" {
            &self.old_path
        } else {
            &self.new_path
        };
        raw.strip_prefix("b/")
            .or_else(|| raw.strip_prefix("a/"))
            .unwrap_or(raw)
    }
}

/// A structurally valid unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedDiff {
    pub files: Vec<FilePatch>,
}

fn hunk_header() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").ok())
        .as_ref()
}

fn parse_hunk_header(line: &str, line_no: usize) -> Result<Hunk, DiffError> {
    let bad = || DiffError::BadHunkHeader {
        line: line_no,
        header: line.to_string(),
    };
    let caps = hunk_header()
        .and_then(|re| re.captures(line))
        .ok_or_else(bad)?;
    let num = |i: usize, default: u32| -> Result<u32, DiffError> {
        match caps.get(i) {
            Some(m) => m.as_str().parse().map_err(|_| bad()),
            None => Ok(default),
        }
    };
    Ok(Hunk {
        old_start: num(1, 0)?,
        old_lines: num(2, 1)?,
        new_start: num(3, 0)?,
        new_lines: num(4, 1)?,
    })
}

fn header_path(line: &str, prefix: &str) -> String {
    let rest = &line[prefix.len()..];
    // Drop the optional tab-separated timestamp.
    rest.split('\t').next().unwrap_or(rest).trim_end().to_string()
}

impl UnifiedDiff {
    /// Parse raw diff bytes.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, DiffError> {
        let text = std::str::from_utf8(bytes).map_err(|_| DiffError::NotUtf8)?;
        Self::parse(text)
    }

    /// Parse diff text. Text outside file sections (commit messages,
    /// `diff --git`/`index` metadata, signatures) is ignored.
    pub fn parse(text: &str) -> Result<Self, DiffError> {
        if text.trim().is_empty() {
            return Err(DiffError::Empty);
        }

        let lines: Vec<&str> = text.lines().collect();
        let mut files = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];

            if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
                return Err(DiffError::Binary {
                    path: line.to_string(),
                });
            }

            if !line.starts_with("--- ") {
                i += 1;
                continue;
            }

            let header_line = i + 1;
            let old_path = header_path(line, "--- ");
            let Some(next) = lines.get(i + 1).filter(|l| l.starts_with("+++ ")) else {
                return Err(DiffError::MissingNewHeader { line: header_line });
            };
            let new_path = header_path(next, "+++ ");
            i += 2;

            let mut hunks = Vec::new();
            while let Some(line) = lines.get(i).filter(|l| l.starts_with("@@")) {
                let hunk = parse_hunk_header(line, i + 1)?;
                i += 1;

                let (mut old_left, mut new_left) = (hunk.old_lines, hunk.new_lines);
                while old_left > 0 || new_left > 0 {
                    let Some(body) = lines.get(i) else {
                        return Err(DiffError::TruncatedHunk {
                            line: i + 1,
                            old_left,
                            new_left,
                        });
                    };
                    match body.chars().next() {
                        // Some editors strip the single space of empty context lines.
                        Some(' ') | None if old_left > 0 && new_left > 0 => {
                            old_left -= 1;
                            new_left -= 1;
                        }
                        Some('-') if old_left > 0 => old_left -= 1,
                        Some('+') if new_left > 0 => new_left -= 1,
                        Some('\\') => {}
                        _ => {
                            return Err(DiffError::TruncatedHunk {
                                line: i + 1,
                                old_left,
                                new_left,
                            })
                        }
                    }
                    i += 1;
                }
                // "\ No newline at end of file" may trail the last line.
                while lines.get(i).is_some_and(|l| l.starts_with('\\')) {
                    i += 1;
                }
                hunks.push(hunk);
            }

            if hunks.is_empty() {
                return Err(DiffError::NoHunks {
                    line: header_line,
                    path: new_path,
                });
            }
            files.push(FilePatch {
                old_path,
                new_path,
                hunks,
            });
        }

        if files.is_empty() {
            return Err(DiffError::NoFiles);
        }
        Ok(UnifiedDiff { files })
    }

    pub fn files_changed(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIT_DIFF: &str = "\
diff --git a/src/png.c b/src/png.c
index 1111111..2222222 100644
--- a/src/png.c
+++ b/src/png.c
@@ -10,3 +10,4 @@ png_read(png_structp p)
   size_t n = p->len;
-  memcpy(buf, p->data, n);
+  if (n > sizeof(buf)) return -1;
+  memcpy(buf, p->data, n);
   return 0;

diff --git a/src/util.c b/src/util.c
--- a/src/util.c
+++ b/src/util.c
@@ -1 +1 @@
-int x;
+int x = 0;
\\ No newline at end of file
";

    #[test]
    fn parses_multi_file_git_diff() {
        let diff = UnifiedDiff::parse(GIT_DIFF).unwrap();
        assert_eq!(diff.files_changed(), 2);
        assert_eq!(diff.files[0].path(), "src/png.c");
        assert_eq!(
            diff.files[0].hunks[0],
            Hunk {
                old_start: 10,
                old_lines: 3,
                new_start: 10,
                new_lines: 4
            }
        );
        assert_eq!(diff.files[1].hunks[0].old_lines, 1);
    }

    #[test]
    fn new_file_uses_new_path_and_deleted_uses_old() {
        let added = "--- /dev/null\n+++ b/new.c\n@@ -0,0 +1,2 @@\n+a\n+b\n";
        let diff = UnifiedDiff::parse(added).unwrap();
        assert_eq!(diff.files[0].path(), "new.c");

        let deleted = "--- a/old.c\n+++ /dev/null\n@@ -1 +0,0 @@\n-a\n";
        let diff = UnifiedDiff::parse(deleted).unwrap();
        assert_eq!(diff.files[0].path(), "old.c");
    }

    #[test]
    fn rejects_empty_and_prose() {
        assert_eq!(UnifiedDiff::parse("  \n"), Err(DiffError::Empty));
        assert_eq!(
            UnifiedDiff::parse("I fixed the bug by adding a bounds check."),
            Err(DiffError::NoFiles)
        );
    }

    #[test]
    fn rejects_missing_plus_header() {
        let err = UnifiedDiff::parse("--- a/x\n@@ -1 +1 @@\n-a\n+b\n").unwrap_err();
        assert_eq!(err, DiffError::MissingNewHeader { line: 1 });
    }

    #[test]
    fn rejects_headers_without_hunks() {
        let err = UnifiedDiff::parse("--- a/x\n+++ b/x\n").unwrap_err();
        assert!(matches!(err, DiffError::NoHunks { .. }));
    }

    #[test]
    fn rejects_truncated_hunk() {
        let err = UnifiedDiff::parse("--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n a\n-b\n").unwrap_err();
        assert!(matches!(err, DiffError::TruncatedHunk { .. }));
    }

    #[test]
    fn hunk_header_pattern_compiles() {
        let re = hunk_header().unwrap();
        let caps = re.captures("@@ -10,3 +10,4 @@ fn main()").unwrap();
        assert_eq!(&caps[1], "10");
        assert_eq!(&caps[4], "4");
    }

    #[test]
    fn rejects_bad_hunk_header() {
        let err = UnifiedDiff::parse("--- a/x\n+++ b/x\n@@ nonsense @@\n").unwrap_err();
        assert!(matches!(err, DiffError::BadHunkHeader { line: 3, .. }));
    }

    #[test]
    fn rejects_binary_and_non_utf8() {
        let err = UnifiedDiff::parse("Binary files a/x.png and b/x.png differ\n").unwrap_err();
        assert!(matches!(err, DiffError::Binary { .. }));
        assert_eq!(
            UnifiedDiff::parse_bytes(&[0xff, 0xfe, 0x00]),
            Err(DiffError::NotUtf8)
        );
    }

    #[test]
    fn accepts_empty_context_line_without_space() {
        let diff = "--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n a\n\n-b\n+c\n";
        assert!(UnifiedDiff::parse(diff).is_ok());
    }
}
