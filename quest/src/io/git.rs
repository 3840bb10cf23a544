//! Local git capability and its `git` CLI adapter.
//!
//! The orchestrator only needs a handful of read operations plus two writes:
//! publishing a synthesized branch for a starter or reset pull request, and
//! restoring protected files in the working copy after a hard reset. Branch
//! commits are built with plumbing (`read-tree`, `update-index`,
//! `commit-tree`) on a private index so the learner's index is never touched.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::conflict::{ConflictPolicy, carry_game_areas};
use crate::core::types::{BranchContent, PathSource};
use crate::io::process;

/// Identity recorded on commits the orchestrator synthesizes.
const BOT_NAME: &str = "quest";
const BOT_EMAIL: &str = "quest@localhost";

static SLUG_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"[:/]([^/:]+)/([^/]+?)(?:\.git)?/?$"));

static INDEX_SEQ: AtomicU64 = AtomicU64::new(0);

/// Where to read a file from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAt<'a> {
    /// A committed revision (`HEAD`, `upstream/initial`, a sha).
    Rev(&'a str),
    /// The working copy on disk.
    WorkTree,
}

/// A branch to (re)publish on the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub branch: String,
    /// Commit the new branch head is built on.
    pub base: String,
    pub content: BranchContent,
    pub message: String,
    /// Game-area markers; overlaid files keep the game areas found at `base`.
    pub policy: ConflictPolicy,
}

/// Local git operations the orchestrator consumes.
pub trait LocalGit: Send + Sync {
    fn head_commit(&self) -> Result<String>;
    /// File content, or `None` when the path does not exist at `at`.
    fn read_file(&self, path: &str, at: FileAt<'_>) -> Result<Option<String>>;
    fn is_dirty(&self) -> Result<bool>;
    /// `(ahead, behind)` of `HEAD` relative to `upstream`.
    fn ahead_behind(&self, upstream: &str) -> Result<(u32, u32)>;
    fn fetch(&self) -> Result<()>;
    /// Build the requested commit and force-push it. Returns the pushed sha.
    fn publish_branch(&self, request: &PublishRequest) -> Result<String>;
    /// Rewrite `paths` in the working copy from their source refs, keeping
    /// game areas. Returns the paths that changed.
    fn restore_paths(&self, paths: &[PathSource], policy: &ConflictPolicy) -> Result<Vec<String>>;
}

/// Content a protected path should have once restored; `None` means absent.
pub fn restored_content(
    expected: Option<String>,
    current: Option<&str>,
    policy: &ConflictPolicy,
) -> Option<String> {
    match (expected, current) {
        (Some(expected), Some(current)) => Some(carry_game_areas(&expected, current, policy)),
        (expected, _) => expected,
    }
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    remote: String,
    network_timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            remote: "origin".to_string(),
            network_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Remote-tracking ref for a branch of the publishing remote.
    pub fn tracking_ref(&self, branch: &str) -> String {
        format!("{}/{branch}", self.remote)
    }

    /// `owner/name` of the publishing remote, parsed from its URL.
    pub fn origin_repository(&self) -> Result<String> {
        let url = self.run_capture(&["remote", "get-url", &self.remote])?;
        parse_repository_slug(url.trim())
            .ok_or_else(|| anyhow!("cannot derive owner/name from remote url '{}'", url.trim()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    fn absolute_git_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    fn rev_exists(&self, spec: &str) -> Result<bool> {
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", spec], &[])?
            .status
            .success())
    }

    /// Tree id for the requested branch content, built on `base`.
    fn build_tree(&self, request: &PublishRequest) -> Result<String> {
        let base = request.base.as_str();
        let paths = match &request.content {
            BranchContent::Tree { source_ref } => {
                let out = self.run_capture(&["rev-parse", &format!("{source_ref}^{{tree}}")])?;
                return Ok(out.trim().to_string());
            }
            BranchContent::Overlay { paths } => paths,
        };

        let seq = INDEX_SEQ.fetch_add(1, Ordering::Relaxed);
        let index = self
            .absolute_git_dir()?
            .join(format!("quest-index-{}-{seq}", std::process::id()));
        let result = self.overlay_tree(&index, base, paths, &request.policy);
        if let Err(err) = fs::remove_file(&index)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(err = %err, index = %index.display(), "failed to remove temporary index");
        }
        result
    }

    fn overlay_tree(
        &self,
        index: &Path,
        base: &str,
        paths: &[PathSource],
        policy: &ConflictPolicy,
    ) -> Result<String> {
        let env = [("GIT_INDEX_FILE", index.as_os_str())];
        self.run_checked(&["read-tree", base], &env)?;
        for source in paths {
            let listing =
                self.run_checked(&["ls-tree", &source.source_ref, "--", &source.path], &[])?;
            let listing = String::from_utf8_lossy(&listing.stdout);
            match parse_ls_tree_blob(&listing) {
                Some((mode, oid)) => {
                    let oid = self.carried_blob(base, &source.path, oid, policy)?;
                    let cacheinfo = format!("{mode},{oid},{}", source.path);
                    self.run_checked(&["update-index", "--add", "--cacheinfo", &cacheinfo], &env)?;
                }
                None => {
                    debug!(
                        path = %source.path,
                        source = %source.source_ref,
                        "path absent at source, removing"
                    );
                    self.run_checked(
                        &["update-index", "--force-remove", "--", &source.path],
                        &env,
                    )?;
                }
            }
        }
        let out = self.run_checked(&["write-tree"], &env)?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Blob for `path` with the game areas from `base` carried into `oid`.
    fn carried_blob(
        &self,
        base: &str,
        path: &str,
        oid: String,
        policy: &ConflictPolicy,
    ) -> Result<String> {
        let Some(current) = self.read_file(path, FileAt::Rev(base))? else {
            return Ok(oid);
        };
        let out = self.run_checked(&["cat-file", "blob", &oid], &[])?;
        let expected = String::from_utf8_lossy(&out.stdout);
        let carried = carry_game_areas(&expected, &current, policy);
        if carried == expected {
            return Ok(oid);
        }
        debug!(path, "keeping game areas from base");
        self.hash_blob(&carried)
    }

    fn hash_blob(&self, contents: &str) -> Result<String> {
        let mut cmd = self.command(&["hash-object", "-w", "--stdin"]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().context("spawn git hash-object")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(contents.as_bytes())
                .context("write blob to git hash-object")?;
        }
        let output = child.wait_with_output().context("wait for git hash-object")?;
        if !output.status.success() {
            return Err(anyhow!(
                "git hash-object failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args, &[])?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str], env: &[(&str, &std::ffi::OsStr)]) -> Result<Output> {
        let output = self.run(args, env)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str], env: &[(&str, &std::ffi::OsStr)]) -> Result<Output> {
        let mut cmd = self.command(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }

    /// Run a network-bound git command under the configured timeout.
    fn run_network(&self, args: &[&str]) -> Result<()> {
        let output = process::run_with_timeout(self.command(args), self.network_timeout)
            .with_context(|| format!("git {}", args.join(" ")))?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.network_timeout.as_secs()
            ));
        }
        if !output.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_text()
            ));
        }
        Ok(())
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        cmd
    }
}

impl LocalGit for Git {
    fn head_commit(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    fn read_file(&self, path: &str, at: FileAt<'_>) -> Result<Option<String>> {
        match at {
            FileAt::WorkTree => match fs::read(self.workdir.join(path)) {
                Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err).with_context(|| format!("read {path} from working tree")),
            },
            FileAt::Rev(rev) => {
                if !self.rev_exists(&format!("{rev}^{{commit}}"))? {
                    return Err(anyhow!("unknown revision '{rev}'"));
                }
                let object = format!("{rev}:{path}");
                if !self.rev_exists(&object)? {
                    return Ok(None);
                }
                let out = self.run_checked(&["cat-file", "blob", &object], &[])?;
                Ok(Some(String::from_utf8_lossy(&out.stdout).into_owned()))
            }
        }
    }

    #[instrument(skip_all)]
    fn is_dirty(&self) -> Result<bool> {
        let entries = self.status_porcelain()?;
        debug!(changed = entries.len(), "worktree status");
        Ok(!entries.is_empty())
    }

    fn ahead_behind(&self, upstream: &str) -> Result<(u32, u32)> {
        let range = format!("HEAD...{upstream}");
        let out = self.run_capture(&["rev-list", "--left-right", "--count", &range])?;
        parse_ahead_behind(&out)
    }

    #[instrument(skip_all, fields(remote = %self.remote))]
    fn fetch(&self) -> Result<()> {
        self.run_network(&["fetch", "--quiet", "--prune", &self.remote])
    }

    #[instrument(skip_all, fields(branch = %request.branch))]
    fn publish_branch(&self, request: &PublishRequest) -> Result<String> {
        let tree = self.build_tree(request)?;
        let mut cmd = self.command(&[
            "commit-tree",
            &tree,
            "-p",
            &request.base,
            "-m",
            &request.message,
        ]);
        cmd.env("GIT_AUTHOR_NAME", BOT_NAME)
            .env("GIT_AUTHOR_EMAIL", BOT_EMAIL)
            .env("GIT_COMMITTER_NAME", BOT_NAME)
            .env("GIT_COMMITTER_EMAIL", BOT_EMAIL);
        let output = cmd.output().context("spawn git commit-tree")?;
        if !output.status.success() {
            return Err(anyhow!(
                "git commit-tree failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let refspec = format!("{sha}:refs/heads/{}", request.branch);
        self.run_network(&["push", "--force", "--quiet", &self.remote, &refspec])?;
        debug!(%sha, "branch published");
        Ok(sha)
    }

    #[instrument(skip_all, fields(paths = paths.len()))]
    fn restore_paths(&self, paths: &[PathSource], policy: &ConflictPolicy) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for source in paths {
            let expected = self.read_file(&source.path, FileAt::Rev(&source.source_ref))?;
            let current = self.read_file(&source.path, FileAt::WorkTree)?;
            let target = restored_content(expected, current.as_deref(), policy);
            if target == current {
                continue;
            }
            let full = self.workdir.join(&source.path);
            match &target {
                Some(contents) => {
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("create directory {}", parent.display()))?;
                    }
                    fs::write(&full, contents)
                        .with_context(|| format!("restore {}", source.path))?;
                }
                None => match fs::remove_file(&full) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(err).with_context(|| format!("remove {}", source.path));
                    }
                },
            }
            debug!(path = %source.path, removed = target.is_none(), "protected path restored");
            changed.push(source.path.clone());
        }
        Ok(changed)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_ahead_behind(out: &str) -> Result<(u32, u32)> {
    let mut counts = out.split_whitespace().map(str::parse::<u32>);
    match (counts.next(), counts.next(), counts.next()) {
        (Some(Ok(ahead)), Some(Ok(behind)), None) => Ok((ahead, behind)),
        _ => Err(anyhow!("unexpected rev-list output: '{}'", out.trim())),
    }
}

/// `(mode, oid)` of a blob in `git ls-tree` output; `None` for no entry.
fn parse_ls_tree_blob(listing: &str) -> Option<(String, String)> {
    let line = listing.lines().next()?;
    let (meta, _path) = line.split_once('\t')?;
    let mut parts = meta.split_whitespace();
    let mode = parts.next()?;
    let kind = parts.next()?;
    let oid = parts.next()?;
    (kind == "blob").then(|| (mode.to_string(), oid.to_string()))
}

/// Extract `owner/name` from an https or ssh remote URL.
pub fn parse_repository_slug(url: &str) -> Option<String> {
    let re = SLUG_RE.as_ref().ok()?;
    let caps = re.captures(url)?;
    Some(format!("{}/{}", &caps[1], &caps[2]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_modified_and_untracked_lines() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(e.code, " M");
        assert_eq!(e.path, "src/main.rs");
        let e = parse_status_line("?? notes.txt").expect("parse");
        assert_eq!(e.code, "??");
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn parses_ahead_behind_counts() {
        assert_eq!(parse_ahead_behind("2\t5\n").expect("parse"), (2, 5));
        assert!(parse_ahead_behind("garbage").is_err());
    }

    #[test]
    fn parses_ls_tree_blobs_only() {
        let blob = "100644 blob 3b18e512dba79e4c8300dd08aeb37f8e728b8dad\tsrc/lib.rs\n";
        assert_eq!(
            parse_ls_tree_blob(blob),
            Some((
                "100644".to_string(),
                "3b18e512dba79e4c8300dd08aeb37f8e728b8dad".to_string()
            ))
        );
        assert_eq!(parse_ls_tree_blob(""), None);
        assert_eq!(
            parse_ls_tree_blob("040000 tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\tsrc\n"),
            None
        );
    }

    #[test]
    fn derives_repository_slug_from_remote_urls() {
        assert_eq!(
            parse_repository_slug("https://github.com/learner/rust-async.git").as_deref(),
            Some("learner/rust-async")
        );
        assert_eq!(
            parse_repository_slug("git@github.com:learner/rust-async.git").as_deref(),
            Some("learner/rust-async")
        );
        assert_eq!(
            parse_repository_slug("https://github.com/learner/rust-async").as_deref(),
            Some("learner/rust-async")
        );
    }

    #[test]
    fn reads_files_from_revisions_and_worktree() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("src/lib.rs", "pub fn a() {}\n", "add lib")
            .expect("commit");
        let git = Git::new(repo.path());

        assert_eq!(
            git.read_file("src/lib.rs", FileAt::Rev("HEAD")).expect("read"),
            Some("pub fn a() {}\n".to_string())
        );
        assert_eq!(git.read_file("missing.rs", FileAt::Rev("HEAD")).expect("read"), None);
        assert!(git.read_file("src/lib.rs", FileAt::Rev("no-such-ref")).is_err());

        repo.write_file("src/lib.rs", "pub fn b() {}\n").expect("write");
        assert_eq!(
            git.read_file("src/lib.rs", FileAt::WorkTree).expect("read"),
            Some("pub fn b() {}\n".to_string())
        );
        assert!(git.is_dirty().expect("status"));
    }

    #[test]
    fn publish_overlays_paths_and_pushes_branch() {
        let repo = TestRepo::with_remote().expect("repo");
        repo.commit_file("src/lib.rs", "starter\n", "starter").expect("commit");
        repo.run_git(&["tag", "starter-ref"]).expect("tag");
        repo.commit_file("src/lib.rs", "learner drift\n", "drift").expect("commit");
        repo.commit_file("notes.md", "game area\n", "notes").expect("commit");
        let git = Git::new(repo.path());
        let base = git.head_commit().expect("head");

        let sha = git
            .publish_branch(&PublishRequest {
                branch: "quest/test/chapter-1-reset-1".to_string(),
                base: base.clone(),
                content: BranchContent::Overlay {
                    paths: vec![
                        PathSource {
                            path: "src/lib.rs".to_string(),
                            source_ref: "starter-ref".to_string(),
                        },
                        PathSource {
                            path: "src/gone.rs".to_string(),
                            source_ref: "starter-ref".to_string(),
                        },
                    ],
                },
                message: "Hard reset".to_string(),
                policy: ConflictPolicy::default(),
            })
            .expect("publish");

        let at_sha = |path: &str| git.read_file(path, FileAt::Rev(&sha)).expect("read");
        assert_eq!(at_sha("src/lib.rs").as_deref(), Some("starter\n"));
        assert_eq!(at_sha("notes.md").as_deref(), Some("game area\n"));
        let remote_head = repo
            .remote_rev("refs/heads/quest/test/chapter-1-reset-1")
            .expect("remote ref");
        assert_eq!(remote_head, sha);
        // Learner checkout is untouched.
        assert_eq!(git.head_commit().expect("head"), base);
        assert!(!git.is_dirty().expect("status"));
    }

    const MARKED_V1: &str = "fn helper() -> u32 {\n    1\n}\n\
        // quest:game-area:begin\nfn solve() {}\n// quest:game-area:end\n";
    const MARKED_V2: &str = "fn helper() -> u32 {\n    2\n}\n\
        // quest:game-area:begin\nfn solve() {}\n// quest:game-area:end\n";

    /// A later chapter re-protecting a file keeps the learner's game-area code.
    #[test]
    fn publish_keeps_game_areas_of_reprotected_files() {
        let repo = TestRepo::with_remote().expect("repo");
        repo.commit_file("src/lib.rs", MARKED_V2, "chapter 2 starter").expect("commit");
        repo.run_git(&["tag", "starter-2"]).expect("tag");
        let solved = MARKED_V1.replace("fn solve() {}", "fn solve() {\n    println!(\"done\");\n}");
        repo.commit_file("src/lib.rs", &solved, "learner solution").expect("commit");
        let git = Git::new(repo.path());
        let base = git.head_commit().expect("head");

        let sha = git
            .publish_branch(&PublishRequest {
                branch: "quest/test/chapter-2-starter".to_string(),
                base,
                content: BranchContent::Overlay {
                    paths: vec![PathSource {
                        path: "src/lib.rs".to_string(),
                        source_ref: "starter-2".to_string(),
                    }],
                },
                message: "Starter".to_string(),
                policy: ConflictPolicy::default(),
            })
            .expect("publish");

        let published = git
            .read_file("src/lib.rs", FileAt::Rev(&sha))
            .expect("read")
            .expect("present");
        assert!(published.contains("    2\n"), "{published}");
        assert!(published.contains("println!(\"done\")"), "{published}");
    }

    #[test]
    fn restore_rewrites_protected_text_and_keeps_game_areas() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("src/lib.rs", MARKED_V1, "starter").expect("commit");
        repo.run_git(&["tag", "starter-1"]).expect("tag");
        let drifted = MARKED_V1
            .replace("    1\n", "    99\n")
            .replace("fn solve() {}", "fn solve() { work() }");
        repo.write_file("src/lib.rs", &drifted).expect("write");
        repo.write_file("src/extra.rs", "// stray\n").expect("write");
        let git = Git::new(repo.path());

        let changed = git
            .restore_paths(
                &[
                    PathSource {
                        path: "src/lib.rs".to_string(),
                        source_ref: "starter-1".to_string(),
                    },
                    PathSource {
                        path: "src/extra.rs".to_string(),
                        source_ref: "starter-1".to_string(),
                    },
                ],
                &ConflictPolicy::default(),
            )
            .expect("restore");

        assert_eq!(changed, vec!["src/lib.rs".to_string(), "src/extra.rs".to_string()]);
        let restored = git
            .read_file("src/lib.rs", FileAt::WorkTree)
            .expect("read")
            .expect("present");
        assert_eq!(restored, MARKED_V1.replace("fn solve() {}", "fn solve() { work() }"));
        assert_eq!(git.read_file("src/extra.rs", FileAt::WorkTree).expect("read"), None);
    }
}
