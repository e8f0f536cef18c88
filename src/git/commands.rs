//! [`VcsBackend`] implementation that shells out to the `git` binary via
//! [`tokio::process::Command`].
//!
//! Every child runs with `GIT_TERMINAL_PROMPT=0` so a remote that wants
//! credentials fails fast instead of hanging, and with `kill_on_drop` so a
//! timed-out update does not leave an orphaned git process behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{BackendError, BundleSpec, VcsBackend};

/// Refspec installed on every working clone: mirror remote branches onto
/// local branches of the same name.
const MIRROR_REFSPEC: &str = "+refs/heads/*:refs/heads/*";

/// Message git prints when every requested revision is excluded.
const EMPTY_BUNDLE_MESSAGE: &str = "Refusing to create empty bundle";

// ---------------------------------------------------------------------------
// GitCli
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitCli {
    binary: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, repo: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(repo) = repo {
            cmd.arg("-C").arg(repo);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, command: &'static str, mut cmd: Command) -> Result<Output, BackendError> {
        debug!(command, "spawning git");
        let output = cmd
            .output()
            .await
            .map_err(|source| BackendError::Spawn { command, source })?;
        check_status(command, output)
    }
}

fn check_status(command: &'static str, output: Output) -> Result<Output, BackendError> {
    if output.status.success() {
        return Ok(output);
    }
    Err(BackendError::Failed {
        command,
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[async_trait::async_trait]
impl VcsBackend for GitCli {
    #[instrument(skip(self), fields(%url, dest = %dest.display()))]
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), BackendError> {
        let mut cmd = self.command(None);
        cmd.arg("clone").arg("--bare").arg(url).arg(dest);
        self.run("clone", cmd).await?;

        let mut cmd = self.command(Some(dest));
        cmd.arg("config").arg("remote.origin.fetch").arg(MIRROR_REFSPEC);
        self.run("config", cmd).await?;

        debug!("git clone --bare succeeded");
        Ok(())
    }

    #[instrument(skip(self), fields(repo = %repo.display()))]
    async fn fetch(&self, repo: &Path) -> Result<(), BackendError> {
        let mut cmd = self.command(Some(repo));
        cmd.arg("fetch").arg("origin");
        self.run("fetch", cmd).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = %repo.display()))]
    async fn list_refs(&self, repo: &Path) -> Result<BTreeMap<String, String>, BackendError> {
        let mut cmd = self.command(Some(repo));
        cmd.arg("for-each-ref")
            .arg("--format=%(objectname) %(refname)")
            .arg("refs/heads")
            .arg("refs/tags");
        let output = self.run("for-each-ref", cmd).await?;

        let refs = parse_ref_listing(&String::from_utf8_lossy(&output.stdout));
        debug!(ref_count = refs.len(), "git for-each-ref complete");
        Ok(refs)
    }

    #[instrument(
        skip(self, spec),
        fields(repo = %repo.display(), output = %output.display(), refs = spec.refs.len(), excluded = spec.exclude.len())
    )]
    async fn create_bundle(
        &self,
        repo: &Path,
        output: &Path,
        spec: &BundleSpec,
    ) -> Result<bool, BackendError> {
        if spec.refs.is_empty() {
            return Ok(false);
        }

        // Revisions go through stdin; a repository with many tags would
        // otherwise overflow the argument list.
        let mut cmd = self.command(Some(repo));
        cmd.arg("bundle")
            .arg("create")
            .arg(output)
            .arg("--stdin")
            .stdin(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| BackendError::Spawn {
            command: "bundle create",
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut input = spec.rev_list_args().join("\n");
            input.push('\n');
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|source| BackendError::Spawn {
                    command: "bundle create",
                    source,
                })?;
            drop(stdin);
        }

        let result = child
            .wait_with_output()
            .await
            .map_err(|source| BackendError::Spawn {
                command: "bundle create",
                source,
            })?;

        if !result.status.success() && is_empty_bundle_refusal(&result.stderr) {
            debug!("nothing new to bundle");
            return Ok(false);
        }
        check_status("bundle create", result)?;

        debug!("git bundle create succeeded");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Parse `<oid> <refname>` lines into a `refname -> oid` map.
fn parse_ref_listing(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(' '))
        .map(|(oid, refname)| (refname.trim().to_string(), oid.trim().to_string()))
        .collect()
}

fn is_empty_bundle_refusal(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr).contains(EMPTY_BUNDLE_MESSAGE)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
