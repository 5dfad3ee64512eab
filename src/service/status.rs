use crate::cluster::{Cluster, Member, MemberStatus};
use crate::logger::{self, LogTag};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemberCounts {
    pub alive: usize,
    pub suspect: usize,
    pub failed: usize,
    pub left: usize,
}

impl MemberCounts {
    pub fn of(members: &[Member]) -> Self {
        let mut counts = Self::default();
        for member in members {
            match member.status {
                MemberStatus::Alive => counts.alive += 1,
                MemberStatus::Suspect => counts.suspect += 1,
                MemberStatus::Failed => counts.failed += 1,
                MemberStatus::Left => counts.left += 1,
            }
        }
        counts
    }
}

/// Periodically report cluster membership; changes are logged at info level
pub async fn run_status_reporter(
    cluster: Arc<dyn Cluster>,
    interval: Duration,
    closing: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut last = None;
    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let members = cluster.members();
        let counts = MemberCounts::of(&members);
        let line = format!(
            "Cluster: {} members (alive={}, suspect={}, failed={}, left={})",
            members.len(),
            counts.alive,
            counts.suspect,
            counts.failed,
            counts.left
        );

        if last != Some(counts) {
            logger::info(LogTag::Cluster, &line);
            for member in &members {
                logger::debug(
                    LogTag::Cluster,
                    &format!(
                        "  {} {} route={}",
                        member.name,
                        member.status,
                        member.route().unwrap_or("-")
                    ),
                );
            }
            last = Some(counts);
        } else {
            logger::verbose(LogTag::Cluster, &line);
        }
    }
}
