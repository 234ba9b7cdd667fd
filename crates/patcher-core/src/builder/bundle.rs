//! Response bundle layout.
//!
//! A response directory holds:
//! - `retcode`   — decimal exit code of the operation
//! - `build_id`  — identifier of the produced build (successful builds only)
//! - `cache_hit` — present when the gateway served the build from cache
//! - `patch.diff` — the submitted patch (apply-patch-build only)
//! - any other regular file — a log artifact (`build.log`, `pov_stderr.log`, …)

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::domain::{BuildId, ExecStatus, LogBundle, PatcherError, Phase, Result};

pub const RETCODE_FILE: &str = "retcode";
pub const BUILD_ID_FILE: &str = "build_id";
pub const CACHE_HIT_FILE: &str = "cache_hit";
/// Patch handed to apply-patch-build; not a log artifact.
pub const PATCH_FILE: &str = "patch.diff";

/// Per-artifact size cap; larger logs keep their tail.
pub const MAX_ARTIFACT_BYTES: usize = 4 * 1024 * 1024;

/// Parsed contents of a response directory.
#[derive(Debug, Clone, Default)]
pub struct ResponseFiles {
    pub retcode: Option<i32>,
    pub build_id: Option<BuildId>,
    pub logs: LogBundle,
}

impl ResponseFiles {
    /// Whether the builder left anything at all in the directory.
    pub fn is_empty(&self) -> bool {
        self.retcode.is_none() && self.build_id.is_none() && self.logs.artifacts.is_empty()
    }
}

/// Read a response directory. A missing directory reads as empty.
pub fn read_response_dir(dir: &Path, phase: Phase) -> Result<ResponseFiles> {
    let mut files = ResponseFiles {
        logs: LogBundle::new(Some(dir.to_path_buf())),
        ..ResponseFiles::default()
    };

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let bytes = fs::read(entry.path())?;

        match name.as_str() {
            RETCODE_FILE => {
                let text = String::from_utf8_lossy(&bytes);
                let code = text.trim().parse::<i32>().map_err(|_| {
                    PatcherError::infrastructure(
                        phase,
                        format!("unparseable retcode {:?} in {}", text.trim(), dir.display()),
                    )
                })?;
                files.retcode = Some(code);
            }
            BUILD_ID_FILE => {
                let id = String::from_utf8_lossy(&bytes).trim().to_string();
                if !id.is_empty() {
                    files.build_id = Some(BuildId::new(id));
                }
            }
            CACHE_HIT_FILE | PATCH_FILE => {}
            _ => {
                files.logs.artifacts.insert(name, tail_lossy(&bytes, MAX_ARTIFACT_BYTES));
            }
        }
    }

    Ok(files)
}

/// Files already in a response directory before a call.
#[derive(Debug, Default)]
pub struct ResponseSnapshot {
    seen: HashMap<String, (SystemTime, u64)>,
}

impl ResponseSnapshot {
    /// Drop artifacts the call did not write or change.
    pub fn retain_fresh(&self, dir: &Path, files: &mut ResponseFiles) {
        files.logs.artifacts.retain(|name, _| match self.seen.get(name) {
            None => true,
            Some(before) => file_stamp(&dir.join(name)).map_or(true, |now| now != *before),
        });
    }
}

/// Remove the reserved files a previous call left in `dir` and record the
/// artifacts that remain, so a reused directory cannot answer for a call
/// that wrote nothing.
pub async fn prepare_response_dir(dir: &Path) -> Result<ResponseSnapshot> {
    tokio::fs::create_dir_all(dir).await?;
    for reserved in [RETCODE_FILE, BUILD_ID_FILE, CACHE_HIT_FILE] {
        match tokio::fs::remove_file(dir.join(reserved)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
    }

    let mut snapshot = ResponseSnapshot::default();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        snapshot.seen.insert(
            entry.file_name().to_string_lossy().into_owned(),
            (meta.modified()?, meta.len()),
        );
    }
    Ok(snapshot)
}

fn file_stamp(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

/// Write a response bundle. Existing files with the same names are replaced.
pub fn write_response_bundle(
    dir: &Path,
    status: ExecStatus,
    build_id: Option<&BuildId>,
    logs: &LogBundle,
    cache_hit: bool,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(RETCODE_FILE), format!("{}\n", status.exit_code()))?;
    if let Some(id) = build_id {
        fs::write(dir.join(BUILD_ID_FILE), format!("{id}\n"))?;
    }
    if cache_hit {
        fs::write(dir.join(CACHE_HIT_FILE), "1\n")?;
    }
    for (name, text) in &logs.artifacts {
        // Names must stay inside the bundle directory.
        if name.contains('/') || name.contains("..") {
            continue;
        }
        fs::write(dir.join(name), text)?;
    }
    Ok(())
}

fn tail_lossy(bytes: &[u8], max: usize) -> String {
    if bytes.len() <= max {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    String::from_utf8_lossy(&bytes[bytes.len() - max..]).into_owned()
}
