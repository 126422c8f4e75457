//! Release directory management on a target host.
//!
//! Layout under `deploy_path`:
//!
//! ```text
//! releases/<id>/     one directory per release
//! current -> releases/<id>
//! shared/<path>      files and directories persisted across releases
//! ```
//!
//! Every operation is a remote command issued through a `RemoteExecutor`, so
//! the same code drives ssh targets and local directories.

use serde::Serialize;
use std::time::Duration;

use crate::env::Env;
use crate::error::{Error, Result};
use crate::host::HostConfig;
use crate::ssh::{RemoteCommand, RemoteExecutor};
use crate::utils::shell::{self, quote_path};
use crate::utils::template::{self, TemplateVars};

const LIST_SEPARATOR: &str = "--current--";
const MISSING_MARKER: &str = "--missing--";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Preparing,
    Active,
    /// Retained for rollback after a newer release was activated.
    Inactive,
    Failed,
    Cleaned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRecord {
    pub id: String,
    pub path: String,
    pub status: ReleaseStatus,
}

/// One entry of a remote releases listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseEntry {
    pub id: String,
    pub path: String,
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// Candidates that were already gone or could not be removed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

/// Paths derived from `deploy_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseLayout {
    pub deploy_path: String,
}

impl ReleaseLayout {
    pub fn new(deploy_path: impl Into<String>) -> Self {
        let deploy_path: String = deploy_path.into();
        let trimmed = deploy_path.trim_end_matches('/');
        Self {
            deploy_path: if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            },
        }
    }

    pub fn releases_path(&self) -> String {
        shell::join_remote(&self.deploy_path, "releases")
    }

    pub fn release_path(&self, id: &str) -> String {
        shell::join_remote(&self.releases_path(), id)
    }

    pub fn current_path(&self) -> String {
        shell::join_remote(&self.deploy_path, "current")
    }

    pub fn shared_path(&self) -> String {
        shell::join_remote(&self.deploy_path, "shared")
    }

    /// Template variables describing this layout, optionally for a release.
    pub fn vars(&self, release: Option<&ReleaseRecord>) -> Env {
        let mut env = Env::new();
        env.set(TemplateVars::DEPLOY_PATH, &self.deploy_path);
        env.set(TemplateVars::RELEASES_PATH, self.releases_path());
        env.set(TemplateVars::CURRENT_PATH, self.current_path());
        env.set(TemplateVars::SHARED_PATH, self.shared_path());
        if let Some(record) = release {
            env.set(TemplateVars::RELEASE_ID, &record.id);
            env.set(TemplateVars::RELEASE_PATH, &record.path);
        }
        env
    }
}

/// Release operations for one host.
pub struct ReleaseManager<'a> {
    executor: &'a dyn RemoteExecutor,
    host: &'a HostConfig,
    layout: ReleaseLayout,
    timeout: Duration,
}

impl<'a> ReleaseManager<'a> {
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        host: &'a HostConfig,
        layout: ReleaseLayout,
    ) -> Self {
        Self {
            executor,
            host,
            layout,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, script: String) -> Result<String> {
        let command = RemoteCommand::new(script, "/", self.timeout);
        Ok(self.executor.execute(self.host, &command)?.stdout)
    }

    /// Ensure `releases/` and `shared/` exist and `current`, if present, is a
    /// symlink.
    pub fn prepare(&self) -> Result<()> {
        let current = quote_path(&self.layout.current_path());
        let script = format!(
            "mkdir -p {} {} && if [ -e {c} ] && [ ! -L {c} ]; then echo 'current is not a symlink' >&2; exit 1; fi",
            quote_path(&self.layout.releases_path()),
            quote_path(&self.layout.shared_path()),
            c = current,
        );
        self.run(script)?;
        Ok(())
    }

    /// Releases present on the host, oldest first, with the active one flagged.
    pub fn list(&self) -> Result<Vec<ReleaseEntry>> {
        let releases = quote_path(&self.layout.releases_path());
        let script = format!(
            "if [ -d {r} ]; then ls -1 {r}; fi; echo '{sep}'; readlink {c} || true",
            r = releases,
            sep = LIST_SEPARATOR,
            c = quote_path(&self.layout.current_path()),
        );
        let stdout = self.run(script)?;
        Ok(parse_listing(&self.layout, &stdout))
    }

    /// Create a new, empty release directory with an id newer than every
    /// existing release.
    pub fn prepare_release(&self) -> Result<ReleaseRecord> {
        let existing = self.list()?;
        let id = next_release_id(
            &chrono::Utc::now().format("%Y%m%d%H%M%S").to_string(),
            existing.last().map(|e| e.id.as_str()),
        );
        let path = self.layout.release_path(&id);

        // No -p: an existing directory means a concurrent deploy.
        self.run(format!("mkdir {}", quote_path(&path)))?;
        log_status!("release", "Created release {} on {}", id, self.host.name);

        Ok(ReleaseRecord {
            id,
            path,
            status: ReleaseStatus::Preparing,
        })
    }

    /// Populate the release with code: a configured update command, or a
    /// shallow git clone of `repository` at `branch`.
    pub fn update_code(
        &self,
        record: &ReleaseRecord,
        env: &Env,
        update_command: Option<&str>,
    ) -> Result<()> {
        let vars = env.merged_with(&self.layout.vars(Some(record)));

        if let Some(command) = update_command {
            let script = template::render_shell(command, &vars);
            let command = RemoteCommand::new(script, record.path.clone(), self.timeout);
            self.executor.execute(self.host, &command)?;
            return Ok(());
        }

        let Some(repository) = vars.non_empty("repository") else {
            log_status!(
                "release",
                "No repository configured for {}, leaving release {} as is",
                self.host.name,
                record.id
            );
            return Ok(());
        };

        let branch = vars
            .non_empty("branch")
            .map(|b| format!("--branch {} ", shell::quote_arg(b)))
            .unwrap_or_default();
        self.run(format!(
            "git clone --quiet --depth 1 {}{} {}",
            branch,
            shell::quote_arg(repository),
            quote_path(&record.path)
        ))?;
        Ok(())
    }

    /// Symlink shared directories and files into the release. Shared targets
    /// are created on first use, seeded from the release's own copy when it
    /// has one. Safe to run repeatedly.
    pub fn link_shared(
        &self,
        record: &ReleaseRecord,
        shared_dirs: &[String],
        shared_files: &[String],
    ) -> Result<()> {
        let shared_root = self.layout.shared_path();

        for dir in shared_dirs {
            let shared = shell::join_remote(&shared_root, dir);
            let in_release = shell::join_remote(&record.path, dir);
            let (s, r) = (quote_path(&shared), quote_path(&in_release));
            let script = format!(
                "if [ ! -d {s} ]; then mkdir -p {s}; if [ -d {r} ] && [ ! -L {r} ]; then cp -a {r}/. {s}/; fi; fi; rm -rf {r}; {mk}ln -sfn {s} {r}",
                s = s,
                r = r,
                mk = mkdir_parent(&in_release),
            );
            self.run(script)?;
        }

        for file in shared_files {
            let shared = shell::join_remote(&shared_root, file);
            let in_release = shell::join_remote(&record.path, file);
            let (s, r) = (quote_path(&shared), quote_path(&in_release));
            let script = format!(
                "if [ ! -f {s} ]; then {mks}if [ -f {r} ] && [ ! -L {r} ]; then cp -a {r} {s}; else touch {s}; fi; fi; rm -rf {r}; {mkr}ln -sfn {s} {r}",
                s = s,
                r = r,
                mks = mkdir_parent(&shared),
                mkr = mkdir_parent(&in_release),
            );
            self.run(script)?;
        }

        Ok(())
    }

    /// Create writable directories inside the release and apply `mode`.
    pub fn make_writable(&self, record: &ReleaseRecord, dirs: &[String], mode: &str) -> Result<()> {
        for dir in dirs {
            let path = quote_path(&shell::join_remote(&record.path, dir));
            self.run(format!(
                "mkdir -p {p} && chmod -R {m} {p}",
                p = path,
                m = shell::quote_arg(mode)
            ))?;
        }
        Ok(())
    }

    /// Atomically point `current` at `record`.
    ///
    /// The new link is created under a temporary name and renamed over
    /// `current`, so readers see either the old or the new target. Returns
    /// the previously active release, now retained as inactive.
    pub fn activate(&self, record: &mut ReleaseRecord) -> Result<Option<ReleaseRecord>> {
        let previous = self
            .list()?
            .into_iter()
            .find(|e| e.active && e.id != record.id)
            .map(|e| ReleaseRecord {
                id: e.id,
                path: e.path,
                status: ReleaseStatus::Inactive,
            });

        self.swap_current(&record.path, &record.id)?;
        record.status = ReleaseStatus::Active;
        log_status!("release", "{} now serves release {}", self.host.name, record.id);

        Ok(previous)
    }

    fn swap_current(&self, target: &str, id: &str) -> Result<()> {
        let tmp = shell::join_remote(&self.layout.deploy_path, &format!(".current.{}.tmp", id));
        self.run(format!(
            "ln -sfn {t} {tmp} && mv -fT {tmp} {c}",
            t = quote_path(target),
            tmp = quote_path(&tmp),
            c = quote_path(&self.layout.current_path()),
        ))?;
        Ok(())
    }

    /// Remove releases beyond the `keep` newest. The active release is never
    /// removed. Candidates that vanish or refuse removal are logged and
    /// skipped.
    pub fn cleanup(&self, keep: usize) -> Result<CleanupReport> {
        let entries = self.list()?;
        let mut report = CleanupReport::default();

        for entry in cleanup_candidates(&entries, keep) {
            let path = quote_path(&entry.path);
            let script = format!(
                "if [ -e {p} ]; then rm -rf {p}; else echo '{m}'; fi",
                p = path,
                m = MISSING_MARKER
            );
            match self.run(script) {
                Ok(out) if out.contains(MISSING_MARKER) => {
                    log_status!("cleanup", "Release {} already gone on {}", entry.id, self.host.name);
                    report.skipped.push(entry.id.clone());
                }
                Ok(_) => report.removed.push(entry.id.clone()),
                Err(e) => {
                    log_status!(
                        "cleanup",
                        "Could not remove release {} on {}: {}",
                        entry.id,
                        self.host.name,
                        e
                    );
                    report.skipped.push(entry.id.clone());
                }
            }
        }

        if !report.removed.is_empty() {
            log_status!(
                "cleanup",
                "Removed {} old release(s) on {}",
                report.removed.len(),
                self.host.name
            );
        }
        Ok(report)
    }

    /// Point `current` back at the newest release older than the active one,
    /// then delete the release it moved away from.
    pub fn rollback(&self) -> Result<ReleaseRecord> {
        let entries = self.list()?;
        let target = rollback_target(&entries)
            .ok_or_else(|| Error::no_rollback_target(&self.host.name))?;

        self.swap_current(&target.path, &target.id)?;
        log_status!("rollback", "{} rolled back to release {}", self.host.name, target.id);

        if let Some(abandoned) = entries.iter().find(|e| e.active) {
            let mut record = ReleaseRecord {
                id: abandoned.id.clone(),
                path: abandoned.path.clone(),
                status: ReleaseStatus::Failed,
            };
            if let Err(e) = self.discard(&mut record) {
                log_status!(
                    "rollback",
                    "Could not remove release {} on {}: {}",
                    record.id,
                    self.host.name,
                    e
                );
            }
        }

        Ok(ReleaseRecord {
            id: target.id.clone(),
            path: target.path.clone(),
            status: ReleaseStatus::Active,
        })
    }

    /// Point `current` at a known release, typically the one that was active
    /// before this invocation's swap.
    pub fn restore(&self, record: &ReleaseRecord) -> Result<ReleaseRecord> {
        self.swap_current(&record.path, &record.id)?;
        log_status!("rollback", "{} restored release {}", self.host.name, record.id);

        Ok(ReleaseRecord {
            status: ReleaseStatus::Active,
            ..record.clone()
        })
    }

    /// Delete a release that never became active.
    pub fn discard(&self, record: &mut ReleaseRecord) -> Result<()> {
        if record.status == ReleaseStatus::Active {
            return Err(Error::internal_unexpected(format!(
                "Refusing to discard active release {}",
                record.id
            )));
        }
        self.run(format!("rm -rf {}", quote_path(&record.path)))?;
        record.status = ReleaseStatus::Cleaned;
        Ok(())
    }
}

fn mkdir_parent(path: &str) -> String {
    match shell::remote_parent(path) {
        Some(parent) => format!("mkdir -p {} && ", quote_path(parent)),
        None => String::new(),
    }
}

/// Order release ids oldest first. Numeric ids of differing width compare by
/// length first so `9` sorts before `10`.
fn sort_ids(ids: &mut [String]) {
    ids.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
}

fn parse_listing(layout: &ReleaseLayout, stdout: &str) -> Vec<ReleaseEntry> {
    let (names, current) = match stdout.split_once(LIST_SEPARATOR) {
        Some((names, current)) => (names, current.trim()),
        None => (stdout, ""),
    };

    let mut ids: Vec<String> = names
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('.'))
        .map(str::to_string)
        .collect();
    sort_ids(&mut ids);

    let current_id = current
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();

    ids.into_iter()
        .map(|id| ReleaseEntry {
            path: layout.release_path(&id),
            active: !current.is_empty() && id == current_id,
            id,
        })
        .collect()
}

/// Next id: the timestamp, or one past the newest existing numeric id when
/// the clock has not moved past it.
fn next_release_id(timestamp: &str, newest: Option<&str>) -> String {
    let Some(newest) = newest else {
        return timestamp.to_string();
    };
    match (timestamp.parse::<u64>(), newest.parse::<u64>()) {
        (Ok(ts), Ok(last)) if ts <= last => (last + 1).to_string(),
        _ => timestamp.to_string(),
    }
}

/// Releases `cleanup(keep)` would delete, given a listing sorted oldest first.
pub fn cleanup_candidates(entries: &[ReleaseEntry], keep: usize) -> Vec<&ReleaseEntry> {
    let cutoff = entries.len().saturating_sub(keep);
    entries[..cutoff].iter().filter(|e| !e.active).collect()
}

/// Newest release strictly older than the active one.
pub fn rollback_target(entries: &[ReleaseEntry]) -> Option<&ReleaseEntry> {
    let active = entries.iter().position(|e| e.active)?;
    entries[..active].last()
}
