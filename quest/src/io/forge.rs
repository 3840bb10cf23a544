//! Forge capability and its `gh` CLI adapter.
//!
//! Every call shells out to `gh` with `--repo` pinned to the instance's
//! repository and `GH_CONFIG_DIR` pointing at the configured credential store.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::anyhow;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::types::{ArtifactState, Sighting};
use crate::io::config::ForgeConfig;
use crate::io::process;

static CREATED_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"/(?:pull|issues)/(\d+)"));

const LABEL_COLOR: &str = "5319e7";
const LIST_LIMIT: &str = "200";

/// Failure talking to the forge.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// Transport failure, timeout or unexpected response. Retryable.
    #[error("forge unavailable: {0:#}")]
    Unavailable(anyhow::Error),
    #[error("not found on forge: {0}")]
    NotFound(String),
    /// Another writer created the artifact first.
    #[error("already exists on forge: {0}")]
    AlreadyExists(String),
}

/// Issue to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Pull request to create. `head` must already exist on the forge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPull {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Forge operations the orchestrator consumes.
///
/// Implementations must be safe to call concurrently for different numbers.
pub trait Forge: Send + Sync {
    fn get_issue(&self, number: u64) -> Result<Sighting, ForgeError>;
    /// Issues in any state carrying `label`.
    fn find_issues(&self, label: &str) -> Result<Vec<Sighting>, ForgeError>;
    fn create_issue(&self, issue: &NewIssue) -> Result<u64, ForgeError>;
    fn close_issue(&self, number: u64) -> Result<(), ForgeError>;
    fn get_pull(&self, number: u64) -> Result<Sighting, ForgeError>;
    /// Pull requests in any state carrying `label`.
    fn find_pulls(&self, label: &str) -> Result<Vec<Sighting>, ForgeError>;
    fn create_pull(&self, pull: &NewPull) -> Result<u64, ForgeError>;
    fn merge_pull(&self, number: u64) -> Result<(), ForgeError>;
    fn list_labels(&self, number: u64) -> Result<Vec<String>, ForgeError>;
    fn set_label(&self, number: u64, label: &str) -> Result<(), ForgeError>;
    fn branch_head(&self, branch: &str) -> Result<String, ForgeError>;
}

/// `gh`-backed forge adapter.
#[derive(Debug, Clone)]
pub struct GhForge {
    repository: String,
    binary: String,
    config_dir: Option<PathBuf>,
    timeout: Duration,
}

impl GhForge {
    pub fn new(repository: impl Into<String>, cfg: &ForgeConfig) -> Self {
        Self {
            repository: repository.into(),
            binary: cfg.gh_binary.clone(),
            config_dir: cfg.gh_config_dir.clone(),
            timeout: cfg.timeout(),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    #[instrument(skip_all, fields(cmd = %args.first().copied().unwrap_or_default()))]
    fn gh(&self, args: &[&str]) -> Result<String, ForgeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        if let Some(dir) = &self.config_dir {
            cmd.env("GH_CONFIG_DIR", dir);
        }
        let output = process::run_with_timeout(cmd, self.timeout)
            .map_err(|err| ForgeError::Unavailable(err.context(format!("run {}", self.binary))))?;
        if output.timed_out {
            return Err(ForgeError::Unavailable(anyhow!(
                "gh {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            )));
        }
        if !output.success() {
            return Err(classify_failure(args, &output.stderr_text()));
        }
        debug!(bytes = output.stdout.len(), "gh call succeeded");
        Ok(output.stdout_text())
    }

    fn ensure_labels(&self, labels: &[String]) -> Result<(), ForgeError> {
        for label in labels {
            self.gh(&[
                "label",
                "create",
                label,
                "--repo",
                &self.repository,
                "--color",
                LABEL_COLOR,
                "--force",
            ])?;
        }
        Ok(())
    }

    fn view(&self, kind: &str, number: u64) -> Result<Sighting, ForgeError> {
        let num = number.to_string();
        let json = self.gh(&[
            kind,
            "view",
            &num,
            "--repo",
            &self.repository,
            "--json",
            "number,state,labels",
        ])?;
        let view: GhView = parse_json(&json)?;
        view.into_sighting()
    }

    fn list(&self, kind: &str, label: &str) -> Result<Vec<Sighting>, ForgeError> {
        let json = self.gh(&[
            kind,
            "list",
            "--repo",
            &self.repository,
            "--label",
            label,
            "--state",
            "all",
            "--limit",
            LIST_LIMIT,
            "--json",
            "number,state,labels",
        ])?;
        let views: Vec<GhView> = parse_json(&json)?;
        views.into_iter().map(GhView::into_sighting).collect()
    }
}

impl Forge for GhForge {
    fn get_issue(&self, number: u64) -> Result<Sighting, ForgeError> {
        self.view("issue", number)
    }

    fn find_issues(&self, label: &str) -> Result<Vec<Sighting>, ForgeError> {
        self.list("issue", label)
    }

    fn create_issue(&self, issue: &NewIssue) -> Result<u64, ForgeError> {
        self.ensure_labels(&issue.labels)?;
        let mut args = vec![
            "issue",
            "create",
            "--repo",
            self.repository.as_str(),
            "--title",
            issue.title.as_str(),
            "--body",
            issue.body.as_str(),
        ];
        for label in &issue.labels {
            args.extend(["--label", label.as_str()]);
        }
        let out = self.gh(&args)?;
        parse_created_number(&out)
    }

    fn close_issue(&self, number: u64) -> Result<(), ForgeError> {
        let num = number.to_string();
        self.gh(&["issue", "close", &num, "--repo", &self.repository])?;
        Ok(())
    }

    fn get_pull(&self, number: u64) -> Result<Sighting, ForgeError> {
        self.view("pr", number)
    }

    fn find_pulls(&self, label: &str) -> Result<Vec<Sighting>, ForgeError> {
        self.list("pr", label)
    }

    fn create_pull(&self, pull: &NewPull) -> Result<u64, ForgeError> {
        self.ensure_labels(&pull.labels)?;
        let mut args = vec![
            "pr",
            "create",
            "--repo",
            self.repository.as_str(),
            "--head",
            pull.head.as_str(),
            "--base",
            pull.base.as_str(),
            "--title",
            pull.title.as_str(),
            "--body",
            pull.body.as_str(),
        ];
        for label in &pull.labels {
            args.extend(["--label", label.as_str()]);
        }
        let out = self.gh(&args)?;
        parse_created_number(&out)
    }

    fn merge_pull(&self, number: u64) -> Result<(), ForgeError> {
        let num = number.to_string();
        self.gh(&["pr", "merge", &num, "--repo", &self.repository, "--merge"])?;
        Ok(())
    }

    fn list_labels(&self, number: u64) -> Result<Vec<String>, ForgeError> {
        let path = format!("repos/{}/issues/{number}/labels", self.repository);
        let out = self.gh(&["api", &path, "--jq", ".[].name"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn set_label(&self, number: u64, label: &str) -> Result<(), ForgeError> {
        self.ensure_labels(&[label.to_string()])?;
        let num = number.to_string();
        self.gh(&[
            "issue",
            "edit",
            &num,
            "--repo",
            &self.repository,
            "--add-label",
            label,
        ])?;
        Ok(())
    }

    fn branch_head(&self, branch: &str) -> Result<String, ForgeError> {
        let path = format!("repos/{}/branches/{branch}", self.repository);
        let out = self.gh(&["api", &path, "--jq", ".commit.sha"])?;
        let sha = out.trim();
        if sha.is_empty() {
            return Err(ForgeError::NotFound(format!("branch {branch}")));
        }
        Ok(sha.to_string())
    }
}

/// JSON shape returned by `gh issue view --json` / `gh pr view --json`.
#[derive(Deserialize)]
struct GhView {
    number: u64,
    state: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Deserialize)]
struct GhLabel {
    name: String,
}

impl GhView {
    fn into_sighting(self) -> Result<Sighting, ForgeError> {
        let state = match self.state.as_str() {
            "OPEN" => ArtifactState::Open,
            "CLOSED" => ArtifactState::Closed,
            "MERGED" => ArtifactState::Merged,
            other => {
                return Err(ForgeError::Unavailable(anyhow!(
                    "unexpected state '{other}' for #{}",
                    self.number
                )));
            }
        };
        Ok(Sighting {
            number: self.number,
            state,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
        })
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(json: &str) -> Result<T, ForgeError> {
    serde_json::from_str(json)
        .map_err(|err| ForgeError::Unavailable(anyhow!(err).context("parse gh json output")))
}

/// Number of the issue or PR whose URL `gh ... create` printed.
fn parse_created_number(out: &str) -> Result<u64, ForgeError> {
    let re = CREATED_RE
        .as_ref()
        .map_err(|err| ForgeError::Unavailable(anyhow!(err.clone())))?;
    re.captures_iter(out)
        .last()
        .and_then(|caps| caps[1].parse().ok())
        .ok_or_else(|| {
            ForgeError::Unavailable(anyhow!(
                "could not find a created issue or PR url in gh output: '{}'",
                out.trim()
            ))
        })
}

fn classify_failure(args: &[&str], stderr: &str) -> ForgeError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("already exists") {
        ForgeError::AlreadyExists(stderr.to_string())
    } else if lower.contains("could not resolve to")
        || lower.contains("http 404")
        || lower.contains("not found")
    {
        ForgeError::NotFound(stderr.to_string())
    } else {
        ForgeError::Unavailable(anyhow!("gh {} failed: {stderr}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_number_from_created_urls() {
        assert_eq!(
            parse_created_number("https://github.com/learner/rq/issues/12\n").expect("issue"),
            12
        );
        assert_eq!(
            parse_created_number("Creating pull request...\nhttps://github.com/learner/rq/pull/7\n")
                .expect("pull"),
            7
        );
        assert!(matches!(
            parse_created_number("nothing here"),
            Err(ForgeError::Unavailable(_))
        ));
    }

    #[test]
    fn classifies_gh_failures() {
        let duplicate = "a pull request for branch \"x\" into branch \"main\" already exists";
        assert!(matches!(
            classify_failure(&["pr", "create"], duplicate),
            ForgeError::AlreadyExists(_)
        ));
        let missing =
            "GraphQL: Could not resolve to an issue or pull request with the number of 9.";
        assert!(matches!(
            classify_failure(&["issue", "view"], missing),
            ForgeError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure(&["issue", "list"], "error connecting to api.github.com"),
            ForgeError::Unavailable(_)
        ));
    }

    #[test]
    fn converts_view_json_into_sightings() {
        let views: Vec<GhView> = parse_json(
            r#"[
                {"number":3,"state":"MERGED","labels":[{"name":"quest-key-abc"}]},
                {"number":4,"state":"OPEN","labels":[]}
            ]"#,
        )
        .expect("parse");
        let sightings: Vec<Sighting> = views
            .into_iter()
            .map(GhView::into_sighting)
            .collect::<Result<_, _>>()
            .expect("convert");
        assert_eq!(sightings[0].state, ArtifactState::Merged);
        assert!(sightings[0].has_label("quest-key-abc"));
        assert!(sightings[1].is_open());
    }

    #[test]
    fn unknown_state_is_rejected() {
        let view: GhView = parse_json(r#"{"number":1,"state":"DRAFTY"}"#).expect("parse");
        assert!(view.into_sighting().is_err());
    }

    #[test]
    fn missing_gh_binary_is_unavailable() {
        let cfg = ForgeConfig {
            gh_binary: "quest-test-no-such-gh-binary".to_string(),
            ..ForgeConfig::default()
        };
        let forge = GhForge::new("learner/rq", &cfg);
        assert!(matches!(forge.get_issue(1), Err(ForgeError::Unavailable(_))));
    }
}
