use std::{sync::Arc, time::Duration};

use partyline::{
    common::{errors::PartyError, types::MemberId},
    configs::Config,
    credentials::TokenMinter,
    media::{DisconnectReason, SimulatedPermissions, SimulatedTransport},
    party::{MemorySessionStore, PartyCoordinator, PartyDeps, PartyState, SessionStorage},
    protocol::{PresenceEntry, VoiceStatus},
    realtime::LocalHub,
    voice::{VoiceDeps, VoiceSessionState},
};
use tokio::sync::watch;

struct Member {
    party: Arc<PartyCoordinator>,
    transport: Arc<SimulatedTransport>,
    permissions: Arc<SimulatedPermissions>,
    storage: Arc<MemorySessionStore>,
}

fn member(hub: &LocalHub) -> Member {
    let transport = Arc::new(SimulatedTransport::new());
    let permissions = Arc::new(SimulatedPermissions::new(true));
    let storage = Arc::new(MemorySessionStore::new());
    let party = PartyCoordinator::new(
        Config::default(),
        PartyDeps {
            realtime: hub.connect(Duration::from_secs(5)),
            voice: VoiceDeps {
                transport: transport.clone(),
                permissions: permissions.clone(),
                tokens: Arc::new(TokenMinter::new("partyline-dev", "secret", Duration::from_secs(3600))),
            },
            storage: storage.clone(),
        },
    );
    Member {
        party,
        transport,
        permissions,
        storage,
    }
}

fn id_of(m: &Member) -> MemberId {
    m.party
        .current_member()
        .borrow()
        .as_ref()
        .map(|m| m.id.clone())
        .unwrap_or_else(|| MemberId::from(""))
}

async fn wait_members(rx: &mut watch::Receiver<Vec<PresenceEntry>>, f: impl FnMut(&Vec<PresenceEntry>) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
        .await
        .expect("timed out waiting for members")
        .expect("directory dropped");
}

#[tokio::test]
async fn join_then_immediate_leave_is_clean() {
    let hub = LocalHub::new();
    let ann = member(&hub);

    ann.party.join("Ann", "a.png", "Trenching").await.unwrap();
    ann.party.leave().await.unwrap();

    assert_eq!(ann.party.state(), PartyState::Idle);
    assert_eq!(ann.transport.open_captures(), 0);
    assert!(!ann.transport.is_joined());
    assert!(ann.storage.current().is_none());

    tokio::time::timeout(Duration::from_secs(5), async {
        while !hub.registry().presence_state("presence:party").is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("relay still holds the presence record");
}

#[tokio::test]
async fn members_see_each_other_and_voice_changes() {
    let hub = LocalHub::new();
    let ann = member(&hub);
    let bob = member(&hub);

    ann.party.join("Ann", "a.png", "Trenching").await.unwrap();
    bob.party.join("Bob", "b.png", "Looting").await.unwrap();
    let ann_id = id_of(&ann);
    let bob_id = id_of(&bob);

    let mut ann_view = ann.party.members();
    wait_members(&mut ann_view, |m| m.iter().any(|e| e.id() == &bob_id)).await;
    let mut bob_view = bob.party.members();
    wait_members(&mut bob_view, |m| m.iter().any(|e| e.id() == &ann_id)).await;

    assert_eq!(ann.party.toggle_mute().await, Ok(true));
    wait_members(&mut bob_view, |m| {
        m.iter()
            .any(|e| e.id() == &ann_id && e.voice.muted && e.voice.voice_status == VoiceStatus::Muted)
    })
    .await;

    ann.party.leave().await.unwrap();
    wait_members(&mut bob_view, |m| m.iter().all(|e| e.id() != &ann_id)).await;
}

#[tokio::test(start_paused = true)]
async fn toggle_mute_while_voice_is_down_reconnects() {
    let hub = LocalHub::new();
    let ann = member(&hub);
    ann.party.join("Ann", "", "").await.unwrap();

    // Every reconnect attempt fails, so voice settles as disconnected.
    ann.transport.fail_next_joins(3);
    ann.transport.drop_connection(DisconnectReason::NetworkError);
    let mut voice = ann.party.voice_state();
    tokio::time::timeout(
        Duration::from_secs(60),
        voice.wait_for(|s| matches!(s, VoiceSessionState::Disconnected { error: Some(_) })),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(ann.party.state(), PartyState::Joined);

    assert_eq!(ann.party.toggle_mute().await, Ok(false));
    assert!(ann.party.voice_state().borrow().is_connected());
    assert!(ann.transport.is_published());
}

#[tokio::test]
async fn denied_permission_rolls_back_and_stays_invisible() {
    let hub = LocalHub::new();
    let ann = member(&hub);
    let bob = member(&hub);
    bob.party.join("Bob", "", "").await.unwrap();

    ann.permissions.set_granted(false);
    let err = ann.party.join("Ann", "", "").await.unwrap_err();
    assert!(matches!(err, PartyError::Permission(_)));
    assert_eq!(*ann.party.voice_state().borrow(), VoiceSessionState::PermissionDenied);
    assert_eq!(ann.party.state(), PartyState::Idle);

    let mut bob_view = bob.party.members();
    wait_members(&mut bob_view, |m| m.len() == 1 && m[0].member.name == "Bob").await;
}

#[tokio::test]
async fn restored_session_keeps_its_identity_for_peers() {
    let hub = LocalHub::new();
    let ann = member(&hub);
    ann.party.join("Ann", "a.png", "Trenching").await.unwrap();
    let ann_id = id_of(&ann);
    let stored = ann.storage.current().unwrap();

    // Same record on a fresh client, as after an app restart.
    let again = member(&hub);
    again.storage.save(&stored).unwrap();
    ann.party.leave().await.unwrap();

    assert_eq!(again.party.restore().await, Ok(true));
    assert_eq!(id_of(&again), ann_id);

    let bob = member(&hub);
    bob.party.join("Bob", "", "").await.unwrap();
    let mut bob_view = bob.party.members();
    wait_members(&mut bob_view, |m| {
        m.iter().any(|e| e.id() == &ann_id && e.member.name == "Ann")
    })
    .await;
}
