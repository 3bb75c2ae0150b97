//! Team creation, teardown and stale-team reclamation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::name::validate_team_name;
use crate::checkpoint::store::write_atomic;
use crate::config::ConvoyPaths;
use crate::errors::TeamError;
use crate::session::{SessionContext, SessionState};

const MARKER_FILE: &str = "team.json";
/// Prefix of in-progress team directories; never a valid team name.
const STAGING_PREFIX: &str = ".staging-";

/// Ownership marker stored in `teams/<name>/team.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMarker {
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub members: Vec<String>,
    pub session: SessionState,
}

/// A team created by this guard.
#[derive(Debug, Clone)]
pub struct Team {
    pub name: String,
    pub dir: PathBuf,
    pub pool_dir: PathBuf,
    pub signal_dir: PathBuf,
    pub marker: TeamMarker,
}

/// A team directory eligible for reclamation.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleTeam {
    pub name: String,
    pub path: PathBuf,
    pub age: Duration,
    /// `None` when the marker is missing or unreadable.
    pub owner: Option<SessionState>,
}

/// What a conflicting team directory turned out to be.
enum Occupant {
    ForeignLive(SessionState),
    Reclaimable(&'static str),
}

/// Creates and tears down teams on behalf of one session.
pub struct TeamGuard<'a> {
    paths: ConvoyPaths,
    session: &'a SessionContext,
    backoff: Vec<Duration>,
}

impl<'a> TeamGuard<'a> {
    pub fn new(paths: ConvoyPaths, session: &'a SessionContext, backoff: Vec<Duration>) -> Self {
        let backoff = if backoff.is_empty() {
            vec![Duration::ZERO]
        } else {
            backoff
        };
        Self {
            paths,
            session,
            backoff,
        }
    }

    fn io_err(path: &Path, source: std::io::Error) -> TeamError {
        TeamError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Create a team directory with our ownership marker.
    ///
    /// The directory is assembled under a private staging name and renamed
    /// into place, so `teams/<name>` never exists without a marker. An
    /// existing directory is reclaimed unless a different live session owns
    /// it. If placement keeps conflicting after reclamation (another process
    /// raced us), it is retried on the backoff schedule.
    pub async fn create_team(&self, name: &str) -> Result<Team, TeamError> {
        validate_team_name(name)?;
        let teams_dir = self.paths.teams_dir();
        fs::create_dir_all(&teams_dir).map_err(|e| Self::io_err(&teams_dir, e))?;
        let dir = self.paths.team_dir(name);

        for (attempt, delay) in self.backoff.iter().enumerate() {
            if !delay.is_zero() {
                debug!(team = %name, attempt, delay_secs = delay.as_secs(), "Retrying team creation");
                tokio::time::sleep(*delay).await;
            }

            if let Some(team) = self.try_place(name, &dir)? {
                return Ok(team);
            }

            match self.classify(&dir)? {
                Occupant::ForeignLive(owner) => {
                    return Err(TeamError::Conflict {
                        name: name.to_string(),
                        session_id: owner.session_id,
                        owner_pid: owner.owner_pid,
                    });
                }
                Occupant::Reclaimable(why) => {
                    info!(team = %name, reason = why, "Reclaiming existing team");
                    self.remove_team_dirs(name)?;
                }
            }

            // Immediate retry after reclamation; only repeated conflicts wait.
            if let Some(team) = self.try_place(name, &dir)? {
                return Ok(team);
            }
            warn!(team = %name, attempt, "Team reappeared after reclamation");
        }

        Err(TeamError::CreationExhausted {
            name: name.to_string(),
            attempts: self.backoff.len(),
        })
    }

    /// Stage a marked directory and rename it onto `dir`. `None` when `dir`
    /// is already occupied.
    fn try_place(&self, name: &str, dir: &Path) -> Result<Option<Team>, TeamError> {
        let staging = self
            .paths
            .teams_dir()
            .join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4().simple()));
        fs::create_dir(&staging).map_err(|e| Self::io_err(&staging, e))?;

        let marker = TeamMarker {
            name: name.to_string(),
            created_at: Utc::now(),
            members: Vec::new(),
            session: self.session.current_identity().clone(),
        };
        let placed = write_marker(&staging, &marker).and_then(|()| match fs::rename(&staging, dir) {
            Ok(()) => Ok(true),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::AlreadyExists | ErrorKind::DirectoryNotEmpty | ErrorKind::NotADirectory
                ) =>
            {
                Ok(false)
            }
            Err(e) => Err(Self::io_err(dir, e)),
        });
        if !matches!(placed, Ok(true)) {
            let _ = fs::remove_dir_all(&staging);
        }
        if !placed? {
            return Ok(None);
        }

        info!(team = %name, "Created team");
        Ok(Some(Team {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            pool_dir: self.paths.pool_dir(name),
            signal_dir: self.paths.signal_dir(name),
            marker,
        }))
    }

    fn classify(&self, dir: &Path) -> Result<Occupant, TeamError> {
        let meta = fs::symlink_metadata(dir).map_err(|e| Self::io_err(dir, e))?;
        if meta.file_type().is_symlink() || !meta.is_dir() {
            return Err(Self::io_err(
                dir,
                std::io::Error::other("team path is not a plain directory"),
            ));
        }
        Ok(match read_marker(dir) {
            None => Occupant::Reclaimable("no readable ownership marker"),
            Some(marker) if self.session.is_self(&marker.session) => {
                Occupant::Reclaimable("left over by this session")
            }
            Some(marker) if self.session.is_owned_by_live_session(&marker.session) => {
                Occupant::ForeignLive(marker.session)
            }
            Some(_) => Occupant::Reclaimable("owner is no longer running"),
        })
    }

    /// Record a member in the team marker.
    pub fn add_member(&self, team: &mut Team, member: &str) -> Result<(), TeamError> {
        if !team.marker.members.iter().any(|m| m == member) {
            team.marker.members.push(member.to_string());
        }
        write_marker(&team.dir, &team.marker)
    }

    /// Remove the team, its task pool and its signal directory.
    pub async fn cleanup_team(&self, name: &str) -> Result<(), TeamError> {
        validate_team_name(name)?;
        let dir = self.paths.team_dir(name);
        if let Some(marker) = read_marker(&dir)
            && self.session.is_foreign_live(&marker.session)
        {
            return Err(TeamError::Conflict {
                name: name.to_string(),
                session_id: marker.session.session_id,
                owner_pid: marker.session.owner_pid,
            });
        }

        let mut last_err = None;
        for (attempt, delay) in self.backoff.iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }
            match self.remove_team_dirs(name) {
                Ok(()) if self.verify_cleanup(name) => {
                    info!(team = %name, "Removed team");
                    return Ok(());
                }
                Ok(()) => {
                    debug!(team = %name, attempt, "Team directories still present after removal");
                    last_err = Some(std::io::Error::other("directories still present"));
                }
                Err(TeamError::Io { source, .. }) => {
                    warn!(team = %name, attempt, error = %source, "Team removal failed");
                    last_err = Some(source);
                }
                Err(e) => return Err(e),
            }
        }
        Err(TeamError::CleanupFailed {
            name: name.to_string(),
            attempts: self.backoff.len(),
            source: last_err.unwrap_or_else(|| std::io::Error::other("unknown failure")),
        })
    }

    fn remove_team_dirs(&self, name: &str) -> Result<(), TeamError> {
        for dir in [
            self.paths.team_dir(name),
            self.paths.pool_dir(name),
            self.paths.signal_dir(name),
        ] {
            remove_path(&dir).map_err(|e| Self::io_err(&dir, e))?;
        }
        Ok(())
    }

    /// Whether no trace of the team remains on disk.
    pub fn verify_cleanup(&self, name: &str) -> bool {
        [
            self.paths.team_dir(name),
            self.paths.pool_dir(name),
            self.paths.signal_dir(name),
        ]
        .iter()
        .all(|p| fs::symlink_metadata(p).is_err())
    }

    /// Teams older than `max_age` whose owner is not a live session.
    /// Symlinked entries are never followed or reported.
    pub fn scan_for_stale(&self, max_age: Duration) -> Vec<StaleTeam> {
        let teams_dir = self.paths.teams_dir();
        let Ok(entries) = fs::read_dir(&teams_dir) else {
            return Vec::new();
        };
        let now = Utc::now();
        let mut stale = Vec::new();

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Ok(meta) = fs::symlink_metadata(&path) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                debug!(path = %path.display(), "Skipping symlinked team entry");
                continue;
            }
            if !meta.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }
            if validate_team_name(&name).is_err() {
                warn!(path = %path.display(), "Ignoring team directory with invalid name");
                continue;
            }

            let marker = read_marker(&path);
            let created_at = marker
                .as_ref()
                .map(|m| m.created_at)
                .or_else(|| meta.modified().ok().map(DateTime::<Utc>::from))
                .unwrap_or(now);
            let age = (now - created_at).to_std().unwrap_or_default();
            if age < max_age {
                continue;
            }
            if let Some(m) = &marker
                && self.session.is_owned_by_live_session(&m.session)
            {
                continue;
            }
            stale.push(StaleTeam {
                name,
                path,
                age,
                owner: marker.map(|m| m.session),
            });
        }
        stale.sort_by(|a, b| a.name.cmp(&b.name));
        stale
    }

    /// Remove every stale team. Returns the names removed.
    pub fn reap_stale(&self, max_age: Duration) -> Vec<String> {
        self.sweep_staging(max_age);
        self.reap(&self.scan_for_stale(max_age), max_age)
    }

    /// Remove previously scanned teams, skipping any whose marker changed
    /// hands or gained a live owner since the scan.
    pub fn reap(&self, teams: &[StaleTeam], max_age: Duration) -> Vec<String> {
        let mut reaped = Vec::new();
        for team in teams {
            let current = read_marker(&team.path);
            let still_stale = match &current {
                Some(m) => {
                    Some(&m.session) == team.owner.as_ref()
                        && !self.session.is_owned_by_live_session(&m.session)
                        && (Utc::now() - m.created_at).to_std().unwrap_or_default() >= max_age
                }
                None => team.owner.is_none(),
            };
            if !still_stale {
                debug!(team = %team.name, "Team changed since scan; not reaping");
                continue;
            }
            match self.remove_team_dirs(&team.name) {
                Ok(()) => {
                    info!(team = %team.name, age_mins = team.age.as_secs() / 60, "Reaped stale team");
                    reaped.push(team.name.clone());
                }
                Err(e) => warn!(team = %team.name, error = %e, "Failed to reap stale team"),
            }
        }
        reaped
    }

    /// Remove staging directories abandoned by crashed creators.
    fn sweep_staging(&self, max_age: Duration) {
        let Ok(entries) = fs::read_dir(self.paths.teams_dir()) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            let path = entry.path();
            let old = fs::symlink_metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age >= max_age);
            if old && let Err(e) = remove_path(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}

/// Read a team's marker; `None` if missing or unparsable.
pub fn read_marker(team_dir: &Path) -> Option<TeamMarker> {
    let content = fs::read_to_string(team_dir.join(MARKER_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_marker(team_dir: &Path, marker: &TeamMarker) -> Result<(), TeamError> {
    let path = team_dir.join(MARKER_FILE);
    let content = serde_json::to_vec_pretty(marker).map_err(|e| TeamError::Io {
        path: path.clone(),
        source: std::io::Error::other(e),
    })?;
    write_atomic(&path, &content).map_err(|source| TeamError::Io { path, source })
}

/// Remove a directory tree, or just the link if `path` is a symlink.
fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
    }
}
