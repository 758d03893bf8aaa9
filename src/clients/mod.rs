//! External collaborators: issue tracker and version-control host.

pub mod tracker;
pub mod vcs;

pub use tracker::{HttpTrackerClient, TrackerClient, WorkItem};
pub use vcs::{HttpVcsClient, PullRequestRef, VcsClient};
