//! Team lifecycle guard.
//!
//! A team is a directory under `.convoy/teams/` whose marker records the
//! session that created it. The guard is the only component that creates or
//! removes team directories, and it never removes one owned by another live
//! session.

pub mod guard;
pub mod name;

pub use guard::{StaleTeam, Team, TeamGuard, TeamMarker, read_marker};
pub use name::{MAX_TEAM_NAME_LEN, team_name_for, validate_team_name};
