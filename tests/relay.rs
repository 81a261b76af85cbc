use std::{net::SocketAddr, sync::Arc, time::Duration};

use partyline::{
    common::{errors::PartyError, types::TransportUid},
    configs::Config,
    credentials::{HttpTokenSource, TokenMinter, TokenSource},
    media::{SimulatedPermissions, SimulatedTransport},
    party::{MemorySessionStore, PartyCoordinator, PartyDeps},
    realtime::{ChannelConfig, ChannelEvent, RealtimeClient, websocket},
    server::AppState,
    transport,
    voice::VoiceDeps,
};
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn serve(password: Option<&str>) -> (SocketAddr, Arc<AppState>) {
    let mut config = Config::default();
    config.server.password = password.map(str::to_string);
    config.server.app_certificate = "relay-secret".into();
    let state = Arc::new(AppState::new(config));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = transport::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

#[tokio::test]
async fn presence_crosses_the_websocket_relay() {
    let (addr, state) = serve(None).await;
    let url = format!("ws://{}/realtime", addr);

    let ann = websocket::connect(&url, TIMEOUT, TIMEOUT).await.unwrap();
    let bob = websocket::connect(&url, TIMEOUT, TIMEOUT).await.unwrap();

    let ann_channel = ann
        .subscribe("presence:den", ChannelConfig::presence("ann"))
        .await
        .unwrap();
    ann_channel.track(json!({ "name": "Ann" })).await.unwrap();

    let bob_channel = bob
        .subscribe("presence:den", ChannelConfig::presence("bob"))
        .await
        .unwrap();
    let events = bob_channel.events();
    tokio::time::timeout(TIMEOUT, async {
        while !bob_channel.presence_state().contains_key("ann") {
            let _ = events.recv_async().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(state.registry.subscriber_count("presence:den"), 2);

    ann.close();
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Ok(ChannelEvent::Leave { key, .. }) = events.recv_async().await {
                if key == "ann" {
                    break;
                }
            }
        }
    })
    .await
    .unwrap();
    assert!(!bob_channel.presence_state().contains_key("ann"));
}

#[tokio::test]
async fn token_endpoint_requires_the_password() {
    let (addr, _) = serve(Some("hunter2")).await;
    let endpoint = format!("http://{}/token", addr);

    let good = HttpTokenSource::new(&endpoint, TIMEOUT, Some("hunter2".into())).unwrap();
    let grant = good.fetch("den", TransportUid(9)).await.unwrap();
    let minter = TokenMinter::new("partyline-dev", "relay-secret", Duration::from_secs(3600));
    assert_eq!(minter.verify(&grant.token).unwrap().uid, TransportUid(9));

    let bad = HttpTokenSource::new(&endpoint, TIMEOUT, Some("wrong".into())).unwrap();
    assert!(matches!(
        bad.fetch("den", TransportUid(9)).await,
        Err(PartyError::Credential(_))
    ));
}

#[tokio::test]
async fn parties_join_through_the_relay() {
    let (addr, _) = serve(None).await;
    let url = format!("ws://{}/realtime", addr);
    let endpoint = format!("http://{}/token", addr);

    let mut coordinators = Vec::new();
    for name in ["Ann", "Bob"] {
        let realtime = websocket::connect(&url, TIMEOUT, TIMEOUT).await.unwrap();
        let party = PartyCoordinator::new(
            Config::default(),
            PartyDeps {
                realtime,
                voice: VoiceDeps {
                    transport: Arc::new(SimulatedTransport::new()),
                    permissions: Arc::new(SimulatedPermissions::new(true)),
                    tokens: Arc::new(HttpTokenSource::new(&endpoint, TIMEOUT, None).unwrap()),
                },
                storage: Arc::new(MemorySessionStore::new()),
            },
        );
        party.join(name, "", "").await.unwrap();
        coordinators.push(party);
    }

    for party in &coordinators {
        let mut members = party.members();
        tokio::time::timeout(TIMEOUT, members.wait_for(|m| m.len() == 2))
            .await
            .unwrap()
            .unwrap();
    }

    coordinators[0].leave().await.unwrap();
    let mut members = coordinators[1].members();
    tokio::time::timeout(TIMEOUT, members.wait_for(|m| m.len() == 1))
        .await
        .unwrap()
        .unwrap();
}
