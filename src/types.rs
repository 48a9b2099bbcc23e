/// Leadership epoch counter. Terms start at 0 and only ever increase; `-1` is
/// the sentinel for "no entry" when reporting the term of a missing log slot.
pub type Term = i64;

/// Zero-based position in the command log. `-1` means "before the first
/// entry" (empty-log `prev_log_index`, initial `commit_index`/`match_index`).
pub type LogIndex = i64;

/// A replica's identity: its position in the ordered cluster member list.
/// Every process in a cluster is launched with the same list, so ids agree
/// across the cluster.
pub type ReplicaId = u32;
