use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::{common::types::MemberId, protocol::PresenceEntry};

/// Non-self members without a live presence record whose last local
/// observation is older than `stale_after` at `now`.
///
/// Staleness is measured on the local clock only; the `last_seen` a peer
/// reports is never compared against it. Live members get their observation
/// refreshed, and members never observed start their grace period at `now`.
pub fn stale_members(
    members: &HashMap<MemberId, PresenceEntry>,
    observed: &mut HashMap<MemberId, Instant>,
    is_live: impl Fn(&MemberId) -> bool,
    self_id: Option<&MemberId>,
    now: Instant,
    stale_after: Duration,
) -> Vec<MemberId> {
    let mut stale = Vec::new();
    for id in members.keys() {
        if Some(id) == self_id {
            continue;
        }
        if is_live(id) {
            observed.insert(id.clone(), now);
            continue;
        }
        let seen = *observed.entry(id.clone()).or_insert(now);
        if now.saturating_duration_since(seen) > stale_after {
            stale.push(id.clone());
        }
    }
    observed.retain(|id, _| members.contains_key(id) && !stale.contains(id));
    stale.sort();
    stale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PartyMember, Profile, VoiceState};

    const STALE_AFTER: Duration = Duration::from_secs(120);

    fn member(id: &str, last_seen: u64) -> (MemberId, PresenceEntry) {
        let mut m = PartyMember::new(MemberId::from(id), Profile::new(id, "", "").unwrap());
        m.last_seen = last_seen;
        (m.id.clone(), PresenceEntry::new(m, VoiceState::default()))
    }

    #[test]
    fn only_absent_members_past_the_threshold_are_stale() {
        let start = Instant::now();
        let members = HashMap::from([
            member("me", 0),
            member("ghost", 0),
            member("recent", 0),
            member("live", 0),
        ]);
        let mut observed = HashMap::from([
            (MemberId::from("me"), start),
            (MemberId::from("ghost"), start),
            (MemberId::from("recent"), start + Duration::from_secs(60)),
            (MemberId::from("live"), start),
        ]);

        let stale = stale_members(
            &members,
            &mut observed,
            |id| id.0 == "live",
            Some(&MemberId::from("me")),
            start + Duration::from_secs(121),
            STALE_AFTER,
        );
        assert_eq!(stale, vec![MemberId::from("ghost")]);
        assert!(!observed.contains_key(&MemberId::from("ghost")));
        assert_eq!(
            observed[&MemberId::from("live")],
            start + Duration::from_secs(121)
        );
    }

    #[test]
    fn reported_last_seen_is_ignored() {
        let start = Instant::now();
        // A peer whose clock lags far behind ours.
        let members = HashMap::from([member("skewed", 1)]);
        let mut observed = HashMap::new();

        let later = start + Duration::from_secs(600);
        assert!(stale_members(&members, &mut observed, |_| true, None, later, STALE_AFTER).is_empty());
        assert!(stale_members(&members, &mut observed, |_| false, None, later, STALE_AFTER).is_empty());
        let stale = stale_members(
            &members,
            &mut observed,
            |_| false,
            None,
            later + Duration::from_secs(121),
            STALE_AFTER,
        );
        assert_eq!(stale, vec![MemberId::from("skewed")]);
    }
}
