//! Rebuilding the visible member list from a presence snapshot.
//!
//! The snapshot is the source of truth for *who* is present. Voice fields are
//! taken from whichever side has the newer timestamp, since the presence
//! record is only re-tracked every heartbeat while voice broadcasts arrive
//! continuously.

use std::collections::HashMap;

use crate::{
    common::types::MemberId,
    protocol::{PresenceEntry, PresenceStatus, VoiceState},
    realtime::PresenceMap,
};

/// Picks one record per presence key. A member connected twice shows up with
/// two metas; the freshest wins. Keys whose freshest record says `left` are
/// dropped, as are metas that do not parse.
pub fn entries_from_snapshot(snapshot: &PresenceMap) -> HashMap<MemberId, PresenceEntry> {
    let mut entries = HashMap::with_capacity(snapshot.len());
    for metas in snapshot.values() {
        let freshest = metas
            .iter()
            .filter_map(PresenceEntry::from_meta)
            .max_by_key(|e| e.member.last_seen);
        if let Some(entry) = freshest {
            if entry.status != PresenceStatus::Left {
                entries.insert(entry.id().clone(), entry);
            }
        }
    }
    entries
}

/// Whether `id` has a live (not `left`) record in the snapshot.
pub fn snapshot_contains(snapshot: &PresenceMap, id: &MemberId) -> bool {
    snapshot
        .get(&id.0)
        .map(|metas| {
            metas
                .iter()
                .filter_map(PresenceEntry::from_meta)
                .any(|e| e.status != PresenceStatus::Left)
        })
        .unwrap_or(false)
}

/// Computes the directory contents for a snapshot.
///
/// * ids come from the snapshot only, plus `me` which is always visible
/// * the local self entry replaces whatever the snapshot says about us
/// * voice fields fall back to `voices` when those are at least as recent
pub fn merge_snapshot(
    snapshot: &PresenceMap,
    me: Option<&PresenceEntry>,
    voices: &HashMap<MemberId, VoiceState>,
) -> HashMap<MemberId, PresenceEntry> {
    let mut merged = HashMap::new();

    for (id, mut entry) in entries_from_snapshot(snapshot) {
        if me.is_some_and(|me| me.id() == &id) {
            continue;
        }
        if let Some(voice) = voices.get(&id) {
            if voice.timestamp >= entry.voice.timestamp {
                entry.voice = voice.clone();
            }
        }
        merged.insert(id, entry);
    }

    if let Some(me) = me {
        merged.insert(me.id().clone(), me.clone());
    }
    merged
}

/// Directory contents in display order: oldest member first.
pub fn ordered(members: &HashMap<MemberId, PresenceEntry>) -> Vec<PresenceEntry> {
    let mut list: Vec<PresenceEntry> = members.values().cloned().collect();
    list.sort_by(|a, b| {
        a.member
            .created_at
            .cmp(&b.member.created_at)
            .then_with(|| a.id().cmp(b.id()))
    });
    list
}
