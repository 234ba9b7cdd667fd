//! Agent instruction artifact (`AGENTS.md`) and the launch prompt.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::domain::{ReproducedPov, Result};
use crate::source::{exclude_from_git, INSTRUCTIONS_FILE};

/// Inputs for rendering the instructions.
#[derive(Debug, Clone)]
pub struct Instructions<'a> {
    pub language: &'a str,
    pub sanitizer: &'a str,
    pub harness: &'a str,
    pub builder_module: &'a str,
    /// Program the agent calls for builds, POV runs and tests.
    pub gateway: &'a str,
    pub work_dir: &'a Path,
    pub patches_dir: &'a Path,
    pub povs: &'a [ReproducedPov],
    pub ref_diff: Option<&'a str>,
}

impl Instructions<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Vulnerability fix task\n");
        let _ = writeln!(
            out,
            "A {} project built with the {} sanitizer crashes on {} input(s) for harness `{}`. \
             All inputs are variants of the same bug; one patch must fix every one of them.\n",
            self.language,
            self.sanitizer,
            self.povs.len(),
            display_harness(self.harness),
        );

        out.push_str("## Crashing inputs\n\n");
        for pov in self.povs {
            let _ = writeln!(
                out,
                "- POV: `{}`, crash log: `{}`{}",
                pov.variant.path.display(),
                pov.crash_log_path.display(),
                pov.annotation
                    .as_deref()
                    .map(|a| format!(" ({a})"))
                    .unwrap_or_default(),
            );
            let _ = writeln!(
                out,
                "  Test: `{} run-pov {} <response_dir> --harness {} --build-id <build_id> --builder {}`",
                self.gateway,
                pov.variant.path.display(),
                pov.variant.harness,
                self.builder_module,
            );
        }

        let _ = write!(
            out,
            "\n## Tools\n\n\
             Build a patch (writes `retcode`, `build_id` and logs into the response dir):\n\n\
             ```\n{gw} apply-patch-build <patch.diff> <response_dir> --builder {b}\n```\n\n\
             Run the test suite against a build (`retcode` 0 means pass or no tests):\n\n\
             ```\n{gw} run-test <response_dir> --build-id <build_id> --builder {b}\n```\n\n\
             A `run-pov` retcode of 0 means the input no longer crashes; 124 means it timed out.\n\
             Use a fresh response dir under `{work}` for every call.\n",
            gw = self.gateway,
            b = self.builder_module,
            work = self.work_dir.display(),
        );

        let _ = write!(
            out,
            "\n## Submitting\n\n\
             When every POV passes against the same build and the tests pass, write the final \
             unified diff (`git diff` from the repository root) to a single file in `{}` ending \
             in `.diff`. Only the first valid diff is accepted and it cannot be replaced. Exit \
             after writing it.\n",
            self.patches_dir.display(),
        );

        if let Some(diff) = self.ref_diff {
            let _ = write!(
                out,
                "\n## Reference diff (delta mode)\n\n\
                 This change introduced the vulnerability:\n\n```diff\n{}\n```\n",
                diff.trim_end(),
            );
        }
        out
    }

    /// Write `AGENTS.md` into the checkout and keep it out of git.
    pub fn write_to(&self, source_dir: &Path) -> Result<PathBuf> {
        let path = source_dir.join(INSTRUCTIONS_FILE);
        std::fs::write(&path, self.render())?;
        exclude_from_git(source_dir, INSTRUCTIONS_FILE)?;
        Ok(path)
    }

    pub fn prompt(&self) -> String {
        format!(
            "Fix the vulnerability. There are {} POV variant(s); crash logs are in {}/crash_log_*.txt. \
             See {} for tools and POV details.",
            self.povs.len(),
            self.work_dir.display(),
            INSTRUCTIONS_FILE,
        )
    }
}

fn display_harness(harness: &str) -> &str {
    if harness.is_empty() {
        "(unset)"
    } else {
        harness
    }
}
