//! Source tree discovery and reset.
//!
//! The agent edits the project checkout in place; before and after each
//! session the tree is returned to `HEAD` so stray edits never reach the
//! builder or the next session.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::domain::{PatcherError, Result};

/// Instruction file written into the checkout for the agent.
pub const INSTRUCTIONS_FILE: &str = "AGENTS.md";

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Locate the project checkout under `<work>/src`.
///
/// Prefers `<src>/repo`, then the first child directory (by name) holding a
/// `.git` entry.
pub fn locate_project(source_root: &Path) -> Result<PathBuf> {
    let preferred = source_root.join("repo");
    if preferred.join(".git").exists() {
        return Ok(preferred);
    }

    let mut children: Vec<PathBuf> = fs::read_dir(source_root)
        .map_err(|e| {
            PatcherError::SourceSetup(format!("cannot read {}: {e}", source_root.display()))
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir() && p.join(".git").exists())
        .collect();
    children.sort();

    children.into_iter().next().ok_or_else(|| {
        PatcherError::SourceSetup(format!("no git repo found in {}", source_root.display()))
    })
}

/// List POV inputs: regular files under `pov_dir`, recursively, sorted by
/// path, skipping dotfiles. A missing directory yields no POVs.
pub fn discover_povs(pov_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if pov_dir.is_dir() {
        walk_files(pov_dir, &mut found)?;
    }
    found.sort();
    Ok(found)
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// Read `<diff_dir>/ref.diff` when present (delta mode).
pub fn read_reference_diff(diff_dir: &Path) -> Option<String> {
    let path = diff_dir.join("ref.diff");
    match fs::read_to_string(&path) {
        Ok(text) => {
            info!(event = "source.ref_diff", chars = text.len());
            Some(text)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(event = "source.ref_diff_unreadable", path = %path.display(), error = %e);
            None
        }
    }
}

/// Reset the checkout to `HEAD`: drop stale `.git/**/*.lock` files, then
/// `git reset --hard HEAD` and `git clean -fd`. Failures are logged only.
pub async fn reset_source(repo_dir: &Path) {
    let mut locks = Vec::new();
    collect_locks(&repo_dir.join(".git"), &mut locks);
    for lock in locks {
        warn!(event = "source.stale_lock", path = %lock.display());
        if let Err(e) = fs::remove_file(&lock) {
            warn!(event = "source.stale_lock_remove_failed", path = %lock.display(), error = %e);
        }
    }

    for args in [&["reset", "--hard", "HEAD"][..], &["clean", "-fd"][..]] {
        if let Err(e) = run_git(repo_dir, args).await {
            warn!(event = "source.reset_failed", args = ?args, error = %e);
        }
    }
}

fn collect_locks(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => collect_locks(&path, out),
            Ok(t) if t.is_file() && path.extension().is_some_and(|ext| ext == "lock") => {
                out.push(path)
            }
            _ => {}
        }
    }
}

/// Keep the instruction file out of `git status` and generated diffs.
pub fn exclude_from_git(repo_dir: &Path, name: &str) -> Result<()> {
    let info_dir = repo_dir.join(".git").join("info");
    fs::create_dir_all(&info_dir)?;
    let exclude = info_dir.join("exclude");
    let existing = fs::read_to_string(&exclude).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == name) {
        return Ok(());
    }
    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(name);
    content.push('\n');
    fs::write(&exclude, content)?;
    Ok(())
}

async fn run_git(repo_dir: &Path, args: &[&str]) -> Result<()> {
    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git")
            .args(args)
            .current_dir(repo_dir)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| PatcherError::Git(format!("git {} timed out", args.join(" "))))?
    .map_err(|e| PatcherError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PatcherError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        run(dir, &["init"]);
        run(dir, &["config", "user.name", "test-user"]);
        run(dir, &["config", "user.email", "test@example.com"]);
        fs::write(dir.join("main.c"), "int main(void) { return 0; }\n").unwrap();
        run(dir, &["add", "main.c"]);
        run(dir, &["commit", "-m", "initial"]);
    }

    #[test]
    fn locate_prefers_repo_dir() {
        let root = tempfile::tempdir().unwrap();
        make_git_repo(&root.path().join("aaa"));
        make_git_repo(&root.path().join("repo"));
        assert_eq!(locate_project(root.path()).unwrap(), root.path().join("repo"));
    }

    #[test]
    fn locate_falls_back_to_first_git_child() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("aaa-not-git")).unwrap();
        make_git_repo(&root.path().join("libpng"));
        assert_eq!(
            locate_project(root.path()).unwrap(),
            root.path().join("libpng")
        );
    }

    #[test]
    fn locate_without_repo_is_source_setup_error() {
        let root = tempfile::tempdir().unwrap();
        let err = locate_project(root.path()).unwrap_err();
        assert!(matches!(err, PatcherError::SourceSetup(_)));
    }

    #[test]
    fn discover_povs_sorted_recursive_skipping_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("b.bin"), b"b").unwrap();
        fs::write(dir.path().join("nested/a.bin"), b"a").unwrap();
        fs::write(dir.path().join(".hidden"), b"x").unwrap();
        let povs = discover_povs(dir.path()).unwrap();
        assert_eq!(
            povs,
            vec![dir.path().join("b.bin"), dir.path().join("nested/a.bin")]
        );
        assert!(discover_povs(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_discards_edits_untracked_files_and_locks() {
        let root = tempfile::tempdir().unwrap();
        let repo = root.path().join("repo");
        make_git_repo(&repo);
        fs::write(repo.join("main.c"), "garbage").unwrap();
        fs::write(repo.join("scratch.c"), "tmp").unwrap();
        fs::write(repo.join(".git/index.lock"), "").unwrap();

        reset_source(&repo).await;

        assert_eq!(
            fs::read_to_string(repo.join("main.c")).unwrap(),
            "int main(void) { return 0; }\n"
        );
        assert!(!repo.join("scratch.c").exists());
        assert!(!repo.join(".git/index.lock").exists());
    }

    #[tokio::test]
    async fn reset_outside_repo_only_warns() {
        let dir = tempfile::tempdir().unwrap();
        reset_source(dir.path()).await;
    }

    #[test]
    fn exclude_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let repo = root.path().join("repo");
        make_git_repo(&repo);
        exclude_from_git(&repo, INSTRUCTIONS_FILE).unwrap();
        exclude_from_git(&repo, INSTRUCTIONS_FILE).unwrap();
        let exclude = fs::read_to_string(repo.join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.matches(INSTRUCTIONS_FILE).count(), 1);

        fs::write(repo.join(INSTRUCTIONS_FILE), "# notes").unwrap();
        let status = StdCommand::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&repo)
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&status.stdout).trim().is_empty());
    }
}
