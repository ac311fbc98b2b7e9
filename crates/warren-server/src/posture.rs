//! Posture-check resolution for peers
//!
//! A posture-check bundle applies to a peer when an enabled policy carries
//! it and one of the policy's enabled rules has a source group containing
//! the peer. The snapshot-based variant used by broadcasts lives on
//! `AccountSnapshot`; this is the store-backed form for login and sync.

use sqlx::SqliteConnection;

use warren_core::error::Result;
use warren_core::types::PostureChecks;

use crate::queries;
use crate::store::LockingStrength;

pub(crate) async fn get_peer_posture_checks(
    conn: &mut SqliteConnection,
    account_id: &str,
    peer_id: &str,
) -> Result<Vec<PostureChecks>> {
    let policies =
        queries::get_account_policies(conn, LockingStrength::Share, account_id).await?;
    if policies.is_empty() {
        return Ok(Vec::new());
    }

    let mut check_ids: Vec<String> = Vec::new();
    for policy in &policies {
        if !policy.enabled || policy.source_posture_checks.is_empty() {
            continue;
        }
        for rule in policy.rules.iter().filter(|r| r.enabled) {
            let source_groups =
                queries::get_groups_by_ids(conn, LockingStrength::Share, account_id, &rule.sources)
                    .await?;
            let peer_in_sources = source_groups
                .values()
                .any(|g| g.peers.iter().any(|p| p == peer_id));
            if peer_in_sources {
                for id in &policy.source_posture_checks {
                    if !check_ids.contains(id) {
                        check_ids.push(id.clone());
                    }
                }
                break;
            }
        }
    }

    if check_ids.is_empty() {
        return Ok(Vec::new());
    }
    queries::get_posture_checks_by_ids(conn, LockingStrength::Share, account_id, &check_ids).await
}
