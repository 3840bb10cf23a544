//! Test-only fakes for the orchestrator's capabilities and quest builders.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Mutex, MutexGuard, PoisonError, mpsc};

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::conflict::ConflictPolicy;
use crate::core::types::{ArtifactState, PathSource, ProgressRecord, Sighting};
use crate::io::forge::{Forge, ForgeError, NewIssue, NewPull};
use crate::io::git::{FileAt, LocalGit, PublishRequest, restored_content};
use crate::io::progress_store::{ProgressStore, StoreError};
use crate::quest::{Chapter, DEFAULT_INITIAL_REF, Quest, Starter};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Chapter without starter or solution; title is `"{label} title"`.
pub fn chapter(label: &str) -> Chapter {
    Chapter {
        label: label.to_string(),
        title: format!("{label} title"),
        issue_body: format!("{label} body"),
        starter: None,
        solution: None,
    }
}

/// Chapter whose starter lives at `git_ref` and owns `protected`.
pub fn chapter_with_starter(label: &str, git_ref: &str, protected: &[&str]) -> Chapter {
    Chapter {
        starter: Some(Starter {
            git_ref: git_ref.to_string(),
            protected: protected.iter().map(|path| path.to_string()).collect(),
        }),
        ..chapter(label)
    }
}

pub fn quest_with(chapters: Vec<Chapter>) -> Quest {
    Quest {
        id: "test-quest".to_string(),
        template: "quests/test-quest".to_string(),
        initial_ref: DEFAULT_INITIAL_REF.to_string(),
        protected: Vec::new(),
        chapters,
    }
}

/// Failure a [`FakeForge`] can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgeFailure {
    Unavailable,
    NotFound,
    AlreadyExists,
}

impl ForgeFailure {
    fn into_error(self) -> ForgeError {
        match self {
            ForgeFailure::Unavailable => ForgeError::Unavailable(anyhow!("injected timeout")),
            ForgeFailure::NotFound => ForgeError::NotFound("injected".to_string()),
            ForgeFailure::AlreadyExists => ForgeError::AlreadyExists("injected".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactType {
    Issue,
    Pull,
}

#[derive(Debug, Clone)]
struct Artifact {
    kind: ArtifactType,
    state: ArtifactState,
    labels: Vec<String>,
    head: Option<String>,
}

#[derive(Debug, Default)]
struct ForgeState {
    last_number: u64,
    artifacts: BTreeMap<u64, Artifact>,
    /// Created but not yet returned by label search.
    unindexed: BTreeSet<u64>,
    hide_budget: u32,
    fail_next: Option<ForgeFailure>,
    fail_next_create: Option<ForgeFailure>,
    branches: BTreeMap<String, String>,
}

impl ForgeState {
    fn injected(&mut self) -> Result<(), ForgeError> {
        match self.fail_next.take() {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }

    fn create(
        &mut self,
        kind: ArtifactType,
        labels: &[String],
        head: Option<String>,
    ) -> Result<u64, ForgeError> {
        self.injected()?;
        if let Some(failure) = self.fail_next_create.take() {
            return Err(failure.into_error());
        }
        self.last_number += 1;
        let number = self.last_number;
        self.artifacts.insert(number, Artifact {
            kind,
            state: ArtifactState::Open,
            labels: labels.to_vec(),
            head,
        });
        if self.hide_budget > 0 {
            self.hide_budget -= 1;
            self.unindexed.insert(number);
        }
        Ok(number)
    }

    fn get(&mut self, kind: ArtifactType, number: u64) -> Result<Sighting, ForgeError> {
        self.injected()?;
        self.artifacts
            .get(&number)
            .filter(|artifact| artifact.kind == kind)
            .map(|artifact| sighting(number, artifact))
            .ok_or_else(|| ForgeError::NotFound(format!("#{number}")))
    }

    fn find(&mut self, kind: ArtifactType, label: &str) -> Result<Vec<Sighting>, ForgeError> {
        self.injected()?;
        Ok(self
            .artifacts
            .iter()
            .filter(|(number, artifact)| {
                artifact.kind == kind
                    && !self.unindexed.contains(number)
                    && artifact.labels.iter().any(|l| l == label)
            })
            .map(|(number, artifact)| sighting(*number, artifact))
            .collect())
    }

    fn artifact_mut(&mut self, number: u64) -> Result<&mut Artifact, ForgeError> {
        self.artifacts
            .get_mut(&number)
            .ok_or_else(|| ForgeError::NotFound(format!("#{number}")))
    }
}

fn sighting(number: u64, artifact: &Artifact) -> Sighting {
    Sighting {
        number,
        state: artifact.state,
        labels: artifact.labels.clone(),
    }
}

/// In-memory forge with search lag and failure injection.
///
/// Issues and pull requests share one number sequence starting at 1.
#[derive(Debug, Default)]
pub struct FakeForge {
    state: Mutex<ForgeState>,
}

impl FakeForge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the next `count` created artifacts out of label search.
    pub fn hide_from_search(&self, count: u32) {
        lock(&self.state).hide_budget = count;
    }

    /// Let search return every artifact.
    pub fn reindex(&self) {
        lock(&self.state).unindexed.clear();
    }

    /// Fail the next forge call of any kind.
    pub fn fail_next(&self, failure: ForgeFailure) {
        lock(&self.state).fail_next = Some(failure);
    }

    /// Fail the next create call, leaving reads untouched.
    pub fn fail_next_create(&self, failure: ForgeFailure) {
        lock(&self.state).fail_next_create = Some(failure);
    }

    pub fn open_issue_with_labels(&self, labels: &[&str]) -> u64 {
        self.seed(ArtifactType::Issue, labels, None)
    }

    pub fn open_pull_with_labels(&self, labels: &[&str]) -> u64 {
        self.seed(ArtifactType::Pull, labels, Some("seeded".to_string()))
    }

    fn seed(&self, kind: ArtifactType, labels: &[&str], head: Option<String>) -> u64 {
        let mut state = lock(&self.state);
        state.last_number += 1;
        let number = state.last_number;
        state.artifacts.insert(number, Artifact {
            kind,
            state: ArtifactState::Open,
            labels: labels.iter().map(|label| label.to_string()).collect(),
            head,
        });
        number
    }

    /// Merge a pull request as the learner would on the forge.
    pub fn merge_remote(&self, number: u64) {
        self.set_state(number, ArtifactState::Merged);
    }

    /// Close an issue or pull request as the learner would on the forge.
    pub fn close_remote(&self, number: u64) {
        self.set_state(number, ArtifactState::Closed);
    }

    fn set_state(&self, number: u64, to: ArtifactState) {
        if let Some(artifact) = lock(&self.state).artifacts.get_mut(&number) {
            artifact.state = to;
        }
    }

    pub fn remove_label(&self, number: u64, label: &str) {
        if let Some(artifact) = lock(&self.state).artifacts.get_mut(&number) {
            artifact.labels.retain(|l| l != label);
        }
    }

    pub fn delete(&self, number: u64) {
        lock(&self.state).artifacts.remove(&number);
    }

    pub fn set_branch_head(&self, branch: &str, sha: &str) {
        lock(&self.state)
            .branches
            .insert(branch.to_string(), sha.to_string());
    }

    pub fn issue(&self, number: u64) -> Option<Sighting> {
        self.peek(ArtifactType::Issue, number)
    }

    pub fn pull(&self, number: u64) -> Option<Sighting> {
        self.peek(ArtifactType::Pull, number)
    }

    /// Head branch a pull request was opened from.
    pub fn pull_head(&self, number: u64) -> Option<String> {
        lock(&self.state)
            .artifacts
            .get(&number)
            .and_then(|artifact| artifact.head.clone())
    }

    fn peek(&self, kind: ArtifactType, number: u64) -> Option<Sighting> {
        lock(&self.state)
            .artifacts
            .get(&number)
            .filter(|artifact| artifact.kind == kind)
            .map(|artifact| sighting(number, artifact))
    }

    pub fn issue_count(&self) -> usize {
        self.count(ArtifactType::Issue)
    }

    pub fn pull_count(&self) -> usize {
        self.count(ArtifactType::Pull)
    }

    fn count(&self, kind: ArtifactType) -> usize {
        lock(&self.state)
            .artifacts
            .values()
            .filter(|artifact| artifact.kind == kind)
            .count()
    }

    /// Pull requests carrying `label`, search lag ignored.
    pub fn pulls_labeled(&self, label: &str) -> Vec<u64> {
        lock(&self.state)
            .artifacts
            .iter()
            .filter(|(_, a)| a.kind == ArtifactType::Pull && a.labels.iter().any(|l| l == label))
            .map(|(number, _)| *number)
            .collect()
    }
}

impl Forge for FakeForge {
    fn get_issue(&self, number: u64) -> Result<Sighting, ForgeError> {
        lock(&self.state).get(ArtifactType::Issue, number)
    }

    fn find_issues(&self, label: &str) -> Result<Vec<Sighting>, ForgeError> {
        lock(&self.state).find(ArtifactType::Issue, label)
    }

    fn create_issue(&self, issue: &NewIssue) -> Result<u64, ForgeError> {
        lock(&self.state).create(ArtifactType::Issue, &issue.labels, None)
    }

    fn close_issue(&self, number: u64) -> Result<(), ForgeError> {
        let mut state = lock(&self.state);
        state.injected()?;
        state.artifact_mut(number)?.state = ArtifactState::Closed;
        Ok(())
    }

    fn get_pull(&self, number: u64) -> Result<Sighting, ForgeError> {
        lock(&self.state).get(ArtifactType::Pull, number)
    }

    fn find_pulls(&self, label: &str) -> Result<Vec<Sighting>, ForgeError> {
        lock(&self.state).find(ArtifactType::Pull, label)
    }

    fn create_pull(&self, pull: &NewPull) -> Result<u64, ForgeError> {
        lock(&self.state).create(ArtifactType::Pull, &pull.labels, Some(pull.head.clone()))
    }

    fn merge_pull(&self, number: u64) -> Result<(), ForgeError> {
        let mut state = lock(&self.state);
        state.injected()?;
        let artifact = state.artifact_mut(number)?;
        if artifact.state == ArtifactState::Closed {
            return Err(ForgeError::Unavailable(anyhow!("#{number} is closed")));
        }
        artifact.state = ArtifactState::Merged;
        Ok(())
    }

    fn list_labels(&self, number: u64) -> Result<Vec<String>, ForgeError> {
        let mut state = lock(&self.state);
        state.injected()?;
        Ok(state.artifact_mut(number)?.labels.clone())
    }

    fn set_label(&self, number: u64, label: &str) -> Result<(), ForgeError> {
        let mut state = lock(&self.state);
        state.injected()?;
        let artifact = state.artifact_mut(number)?;
        if !artifact.labels.iter().any(|l| l == label) {
            artifact.labels.push(label.to_string());
        }
        Ok(())
    }

    fn branch_head(&self, branch: &str) -> Result<String, ForgeError> {
        let mut state = lock(&self.state);
        state.injected()?;
        Ok(state
            .branches
            .get(branch)
            .cloned()
            .unwrap_or_else(|| format!("{branch}-head")))
    }
}

#[derive(Debug)]
struct GitState {
    head: String,
    dirty: bool,
    ahead: u32,
    behind: u32,
    unavailable: bool,
    /// `rev -> path -> content`.
    revs: BTreeMap<String, BTreeMap<String, String>>,
    worktree: BTreeMap<String, String>,
    published: Vec<PublishRequest>,
    fetches: u32,
    fetch_gate: Option<mpsc::Receiver<()>>,
}

impl Default for GitState {
    fn default() -> Self {
        Self {
            head: "l0".to_string(),
            dirty: false,
            ahead: 0,
            behind: 0,
            unavailable: false,
            revs: BTreeMap::new(),
            worktree: BTreeMap::new(),
            published: Vec::new(),
            fetches: 0,
            fetch_gate: None,
        }
    }
}

impl GitState {
    fn available(&self) -> Result<()> {
        if self.unavailable {
            bail!("git is unavailable");
        }
        Ok(())
    }
}

/// In-memory refs and working tree. `HEAD` starts at `l0`.
#[derive(Debug, Default)]
pub struct FakeGit {
    state: Mutex<GitState>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `path` at `rev`; the rev becomes known.
    pub fn set_file(&self, rev: &str, path: &str, contents: &str) {
        lock(&self.state)
            .revs
            .entry(rev.to_string())
            .or_default()
            .insert(path.to_string(), contents.to_string());
    }

    pub fn set_worktree_file(&self, path: &str, contents: &str) {
        lock(&self.state)
            .worktree
            .insert(path.to_string(), contents.to_string());
    }

    pub fn remove_worktree_file(&self, path: &str) {
        lock(&self.state).worktree.remove(path);
    }

    pub fn set_head(&self, sha: &str) {
        lock(&self.state).head = sha.to_string();
    }

    pub fn set_dirty(&self, dirty: bool) {
        lock(&self.state).dirty = dirty;
    }

    pub fn set_ahead_behind(&self, ahead: u32, behind: u32) {
        let mut state = lock(&self.state);
        state.ahead = ahead;
        state.behind = behind;
    }

    /// Make every call fail, as with a missing or broken `git`.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        lock(&self.state).published.clone()
    }

    pub fn fetch_count(&self) -> u32 {
        lock(&self.state).fetches
    }

    /// Block the next `fetch` until the returned sender sends (or is dropped).
    pub fn pause_next_fetch(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        lock(&self.state).fetch_gate = Some(rx);
        tx
    }
}

impl LocalGit for FakeGit {
    fn head_commit(&self) -> Result<String> {
        let state = lock(&self.state);
        state.available()?;
        Ok(state.head.clone())
    }

    fn read_file(&self, path: &str, at: FileAt<'_>) -> Result<Option<String>> {
        let state = lock(&self.state);
        state.available()?;
        match at {
            FileAt::WorkTree => Ok(state.worktree.get(path).cloned()),
            FileAt::Rev(rev) => {
                let files = state
                    .revs
                    .get(rev)
                    .ok_or_else(|| anyhow!("unknown revision '{rev}'"))?;
                Ok(files.get(path).cloned())
            }
        }
    }

    fn is_dirty(&self) -> Result<bool> {
        let state = lock(&self.state);
        state.available()?;
        Ok(state.dirty)
    }

    fn ahead_behind(&self, _upstream: &str) -> Result<(u32, u32)> {
        let state = lock(&self.state);
        state.available()?;
        Ok((state.ahead, state.behind))
    }

    fn fetch(&self) -> Result<()> {
        let gate = {
            let mut state = lock(&self.state);
            state.available()?;
            state.fetches += 1;
            state.fetch_gate.take()
        };
        if let Some(gate) = gate {
            // A dropped sender releases the fetch too.
            let _ = gate.recv();
        }
        Ok(())
    }

    fn publish_branch(&self, request: &PublishRequest) -> Result<String> {
        let mut state = lock(&self.state);
        state.available()?;
        state.published.push(request.clone());
        Ok(format!("published-{}", state.published.len()))
    }

    fn restore_paths(&self, paths: &[PathSource], policy: &ConflictPolicy) -> Result<Vec<String>> {
        let mut state = lock(&self.state);
        state.available()?;
        let mut changed = Vec::new();
        for source in paths {
            let expected = state
                .revs
                .get(&source.source_ref)
                .ok_or_else(|| anyhow!("unknown revision '{}'", source.source_ref))?
                .get(&source.path)
                .cloned();
            let current = state.worktree.get(&source.path).cloned();
            let target = restored_content(expected, current.as_deref(), policy);
            if target == current {
                continue;
            }
            match target {
                Some(contents) => state.worktree.insert(source.path.clone(), contents),
                None => state.worktree.remove(&source.path),
            };
            changed.push(source.path.clone());
        }
        Ok(changed)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    records: BTreeMap<String, ProgressRecord>,
    fail_next_save: bool,
    interfere_next_save: bool,
}

/// In-memory compare-and-swap store.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    state: Mutex<StoreState>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, instance_id: &str, record: ProgressRecord) {
        lock(&self.state)
            .records
            .insert(instance_id.to_string(), record);
    }

    pub fn current(&self, instance_id: &str) -> Option<ProgressRecord> {
        lock(&self.state).records.get(instance_id).cloned()
    }

    /// Fail the next save with an I/O error.
    pub fn fail_next_save(&self) {
        lock(&self.state).fail_next_save = true;
    }

    /// Bump the stored revision right before the next save, as a concurrent
    /// writer would.
    pub fn interfere_next_save(&self) {
        lock(&self.state).interfere_next_save = true;
    }
}

impl ProgressStore for MemoryProgressStore {
    fn load_progress(&self, instance_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        Ok(self.current(instance_id))
    }

    fn save_progress(
        &self,
        instance_id: &str,
        record: &ProgressRecord,
        expected_revision: u64,
    ) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next_save) {
            return Err(StoreError::Io(anyhow!("injected write failure")));
        }
        if std::mem::take(&mut state.interfere_next_save) {
            let entry = state.records.entry(instance_id.to_string()).or_default();
            entry.revision += 1;
        }
        let found = state
            .records
            .get(instance_id)
            .map_or(0, |record| record.revision);
        if found != expected_revision {
            return Err(StoreError::Conflict {
                expected: expected_revision,
                found,
            });
        }
        state.records.insert(instance_id.to_string(), record.clone());
        Ok(())
    }
}

/// Throwaway git repository with an initial commit on `main`.
pub struct TestRepo {
    dir: TempDir,
    remote: Option<TempDir>,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create repo dir")?;
        let repo = Self { dir, remote: None };
        repo.run_git(&["init", "-q", "-b", "main"])?;
        repo.run_git(&["config", "user.name", "Quest Test"])?;
        repo.run_git(&["config", "user.email", "test@localhost"])?;
        repo.run_git(&["config", "commit.gpgsign", "false"])?;
        repo.run_git(&["commit", "-q", "--allow-empty", "-m", "initial"])?;
        Ok(repo)
    }

    /// Like [`TestRepo::new`], plus a bare `origin` holding `main`.
    pub fn with_remote() -> Result<Self> {
        let mut repo = Self::new()?;
        let remote = tempfile::tempdir().context("create remote dir")?;
        git_in(remote.path(), &["init", "-q", "--bare"])?;
        let url = remote.path().to_string_lossy().into_owned();
        repo.run_git(&["remote", "add", "origin", &url])?;
        repo.run_git(&["push", "-q", "origin", "HEAD:refs/heads/main"])?;
        repo.remote = Some(remote);
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the working copy and return trimmed stdout.
    pub fn run_git(&self, args: &[&str]) -> Result<String> {
        git_in(self.path(), args)
    }

    pub fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        let full = self.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&full, contents).with_context(|| format!("write {}", full.display()))
    }

    /// Write, stage and commit one file. Returns the new HEAD.
    pub fn commit_file(&self, path: &str, contents: &str, message: &str) -> Result<String> {
        self.write_file(path, contents)?;
        self.run_git(&["add", path])?;
        self.run_git(&["commit", "-q", "-m", message])?;
        self.run_git(&["rev-parse", "HEAD"])
    }

    /// Resolve `refname` in the bare remote.
    pub fn remote_rev(&self, refname: &str) -> Result<String> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| anyhow!("repository has no remote"))?;
        git_in(remote.path(), &["rev-parse", refname])
    }
}

fn git_in(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
