use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use tether_proto::{ClientMessage, ServerMessage, SessionStatus};
use tether_relay::authorizer::Identity;
use tether_relay::push::PushHub;
use tether_relay::router::RelayRouter;
use tether_relay::storage::{MemoryRegistry, RegistryTtl, SessionStore};
use tether_secure::endpoint::{CliAction, CliEndpoint, CliPhase, WebAction, WebEndpoint, WebPhase};
use tether_secure::{InputFilterConfig, SecureChannel};

struct Relay {
    router: RelayRouter,
    hub: Arc<PushHub>,
    registry: Arc<MemoryRegistry>,
}

impl Relay {
    fn new() -> Self {
        let registry = Arc::new(MemoryRegistry::new(RegistryTtl::default()));
        let hub = Arc::new(PushHub::new());
        let router = RelayRouter::new(
            registry.clone(),
            hub.clone(),
            "ws://relay.test/ws",
            RegistryTtl::default(),
        );
        Self {
            router,
            hub,
            registry,
        }
    }

    fn connect(&self, connection_id: &str) -> UnboundedReceiver<String> {
        self.hub.register(connection_id)
    }

    async fn send(&self, connection_id: &str, message: &ClientMessage) {
        let frame = serde_json::to_string(message).unwrap();
        self.router
            .dispatch(connection_id, &Identity::anonymous(), &frame)
            .await;
    }

    async fn close(&self, connection_id: &str) {
        self.hub.unregister(connection_id);
        self.router.disconnect(connection_id).await;
    }

    async fn status(&self, session_id: &str) -> SessionStatus {
        self.registry
            .get_session(session_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    /// Feed every queued frame to the CLI and forward whatever it sends.
    async fn pump_cli(
        &self,
        cli: &mut CliEndpoint,
        rx: &mut UnboundedReceiver<String>,
        connection_id: &str,
    ) -> Vec<CliAction> {
        let mut actions = Vec::new();
        for frame in drain(rx) {
            actions.extend(cli.handle(frame));
        }
        for action in &actions {
            if let CliAction::Send(frame) = action {
                self.send(connection_id, frame).await;
            }
        }
        actions
    }

    /// Feed every queued frame to a viewer and forward whatever it sends.
    async fn pump_web(
        &self,
        web: &mut WebEndpoint,
        rx: &mut UnboundedReceiver<String>,
        connection_id: &str,
    ) -> Vec<WebAction> {
        let mut actions = Vec::new();
        for frame in drain(rx) {
            actions.extend(web.handle(frame));
        }
        for action in &actions {
            if let WebAction::Send(frame) = action {
                self.send(connection_id, frame).await;
            }
        }
        actions
    }
}

fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<ServerMessage> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

fn outputs(actions: &[WebAction]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|action| match action {
            WebAction::Output(data) => Some(data.clone()),
            _ => None,
        })
        .collect()
}

/// Create a session and announce one viewer to the CLI, which answers with
/// the viewer's key delivery. Returns both sockets' receivers.
async fn paired(
    relay: &Relay,
    cli: &mut CliEndpoint,
    web: &mut WebEndpoint,
) -> (UnboundedReceiver<String>, UnboundedReceiver<String>) {
    let mut cli_rx = relay.connect("cli-1");
    relay.send("cli-1", &cli.connect()).await;
    relay.pump_cli(cli, &mut cli_rx, "cli-1").await;

    let web_rx = relay.connect("web-1");
    relay.send("web-1", &web.join()).await;
    relay.pump_cli(cli, &mut cli_rx, "cli-1").await;
    (cli_rx, web_rx)
}

#[test_timeout::tokio_timeout_test]
async fn cli_output_reaches_the_viewer_unmodified() {
    let relay = Relay::new();
    let mut cli = CliEndpoint::with_session_id("AB12CD", InputFilterConfig::default());
    let mut web = WebEndpoint::new("AB12CD");

    let mut cli_rx = relay.connect("cli-1");
    relay.send("cli-1", &cli.connect()).await;
    let created = drain(&mut cli_rx);
    assert!(matches!(
        created.as_slice(),
        [ServerMessage::SessionCreated { session_id, .. }] if session_id == "AB12CD"
    ));
    cli.handle(created[0].clone());
    assert_eq!(relay.status("AB12CD").await, SessionStatus::Pending);

    let mut web_rx = relay.connect("web-1");
    relay.send("web-1", &web.join()).await;

    let to_cli = drain(&mut cli_rx);
    assert_eq!(
        to_cli,
        vec![ServerMessage::WebConnected {
            public_key: web.public_key(),
            connection_id: "web-1".into(),
        }]
    );
    let actions = cli.handle(to_cli[0].clone());
    let [CliAction::ViewerJoined { connection_id }, CliAction::Send(frame)] = actions.as_slice()
    else {
        panic!("expected a key delivery, got {actions:?}");
    };
    let ClientMessage::Encrypted(delivery) = frame else {
        panic!("expected a sealed key delivery, got {frame:?}");
    };
    assert_eq!(connection_id, "web-1");
    assert_eq!(cli.phase(), CliPhase::Paired);
    relay
        .send("cli-1", &ClientMessage::Encrypted(delivery.clone()))
        .await;

    let to_web = drain(&mut web_rx);
    assert_eq!(
        to_web,
        vec![
            ServerMessage::SessionJoined {
                session_id: "AB12CD".into(),
                cli_public_key: cli.public_key(),
                cli_disconnected: false,
            },
            ServerMessage::Encrypted(delivery.clone()),
        ]
    );
    assert_eq!(web.handle(to_web[0].clone()), vec![WebAction::Joined]);
    assert_eq!(web.phase(), WebPhase::AwaitingKey);
    assert_eq!(web.handle(to_web[1].clone())[0], WebAction::Connected);
    assert_eq!(web.phase(), WebPhase::Connected);
    assert_eq!(relay.status("AB12CD").await, SessionStatus::Active);

    let output = cli.send_output("hello").unwrap().unwrap();
    let ClientMessage::Encrypted(sent) = &output else {
        panic!("expected an envelope");
    };
    relay.send("cli-1", &output).await;

    let delivered = drain(&mut web_rx);
    assert_eq!(delivered, vec![ServerMessage::Encrypted(sent.clone())]);
    assert_eq!(web.handle(delivered[0].clone()), vec![WebAction::Output("hello".into())]);
}

#[test_timeout::tokio_timeout_test]
async fn viewer_state_request_is_answered_by_the_cli() {
    let relay = Relay::new();
    let mut cli = CliEndpoint::with_session_id("AB12CD", InputFilterConfig::default());
    cli.set_terminal_size(120, 40);
    let mut web = WebEndpoint::new("AB12CD");
    let (mut cli_rx, mut web_rx) = paired(&relay, &mut cli, &mut web).await;

    relay.pump_web(&mut web, &mut web_rx, "web-1").await;
    relay.pump_cli(&mut cli, &mut cli_rx, "cli-1").await;
    let synced = relay.pump_web(&mut web, &mut web_rx, "web-1").await;
    assert_eq!(
        synced,
        vec![WebAction::StateSync {
            cols: 120,
            rows: 40,
            has_history: false,
        }]
    );
}

#[test_timeout::tokio_timeout_test]
async fn viewer_input_is_filtered_before_the_terminal() {
    let relay = Relay::new();
    let mut cli = CliEndpoint::with_session_id("AB12CD", InputFilterConfig::default());
    let mut web = WebEndpoint::new("AB12CD");
    let (mut cli_rx, mut web_rx) = paired(&relay, &mut cli, &mut web).await;
    relay.pump_web(&mut web, &mut web_rx, "web-1").await;
    relay.pump_cli(&mut cli, &mut cli_rx, "cli-1").await;

    let input = web.send_input("ls\u{3} -la\n").unwrap().unwrap();
    relay.send("web-1", &input).await;

    let actions = relay.pump_cli(&mut cli, &mut cli_rx, "cli-1").await;
    assert_eq!(
        actions,
        vec![
            CliAction::InputBlocked {
                signals: vec!["SIGINT"]
            },
            CliAction::WriteInput("ls -la\n".into()),
        ]
    );
}

#[test_timeout::tokio_timeout_test]
async fn two_viewers_both_receive_all_output() {
    let relay = Relay::new();
    let mut cli = CliEndpoint::with_session_id("AB12CD", InputFilterConfig::default());
    let mut first = WebEndpoint::new("AB12CD");
    let (mut cli_rx, mut first_rx) = paired(&relay, &mut cli, &mut first).await;
    let mut first_actions = relay.pump_web(&mut first, &mut first_rx, "web-1").await;

    let mut second = WebEndpoint::new("AB12CD");
    let mut second_rx = relay.connect("web-2");
    relay.send("web-2", &second.join()).await;
    relay.pump_cli(&mut cli, &mut cli_rx, "cli-1").await;
    assert_eq!(cli.viewer_count(), 2);

    first_actions.extend(relay.pump_web(&mut first, &mut first_rx, "web-1").await);
    let mut second_actions = relay.pump_web(&mut second, &mut second_rx, "web-2").await;
    assert_eq!(first.phase(), WebPhase::Connected);
    assert_eq!(second.phase(), WebPhase::Connected);
    relay.pump_cli(&mut cli, &mut cli_rx, "cli-1").await;

    let mut sent = Vec::new();
    for index in 0..12 {
        let chunk = format!("line {index}\r\n");
        let frame = cli.send_output(chunk.clone()).unwrap().unwrap();
        relay.send("cli-1", &frame).await;
        sent.push(chunk);
    }
    first_actions.extend(relay.pump_web(&mut first, &mut first_rx, "web-1").await);
    second_actions.extend(relay.pump_web(&mut second, &mut second_rx, "web-2").await);

    assert_eq!(outputs(&first_actions), sent);
    assert_eq!(outputs(&second_actions), sent);
    for actions in [&first_actions, &second_actions] {
        assert!(!actions.contains(&WebAction::Rejoining));
        assert!(actions
            .iter()
            .any(|action| matches!(action, WebAction::StateSync { .. })));
    }

    // Both viewers can type into the shared terminal.
    for (web, connection_id) in [(&mut first, "web-1"), (&mut second, "web-2")] {
        let input = web.send_input(connection_id).unwrap().unwrap();
        relay.send(connection_id, &input).await;
    }
    let typed = relay.pump_cli(&mut cli, &mut cli_rx, "cli-1").await;
    assert_eq!(
        typed,
        vec![
            CliAction::WriteInput("web-1".into()),
            CliAction::WriteInput("web-2".into()),
        ]
    );
}

#[test_timeout::tokio_timeout_test]
async fn late_joiner_decrypts_cached_output_in_order() {
    let relay = Relay::new();
    let mut cli = CliEndpoint::with_session_id("AB12CD", InputFilterConfig::default());
    let mut first = WebEndpoint::new("AB12CD");
    let (mut cli_rx, mut first_rx) = paired(&relay, &mut cli, &mut first).await;
    relay.pump_web(&mut first, &mut first_rx, "web-1").await;

    for chunk in ["one", "two", "three"] {
        let frame = cli.send_output(chunk).unwrap().unwrap();
        relay.send("cli-1", &frame).await;
    }

    // A freshly loaded page: new key pair, nothing seen yet.
    let mut late = WebEndpoint::new("AB12CD");
    let mut late_rx = relay.connect("web-2");
    relay.send("web-2", &late.join()).await;
    relay.pump_cli(&mut cli, &mut cli_rx, "cli-1").await;

    let joined = relay.pump_web(&mut late, &mut late_rx, "web-2").await;
    assert!(joined.contains(&WebAction::Connected));
    assert!(joined
        .iter()
        .any(|action| matches!(action, WebAction::Send(ClientMessage::StateRequest { .. }))));

    let replayed = relay.pump_web(&mut late, &mut late_rx, "web-2").await;
    assert_eq!(outputs(&replayed), vec!["one", "two", "three"]);
    assert!(!replayed.contains(&WebAction::Rejoining));

    let first_actions = relay.pump_web(&mut first, &mut first_rx, "web-1").await;
    assert_eq!(outputs(&first_actions), vec!["one", "two", "three"]);
    assert!(!first_actions.contains(&WebAction::Rejoining));
}

#[test_timeout::tokio_timeout_test]
async fn traffic_never_crosses_sessions() {
    let relay = Relay::new();
    let mut cli_a = CliEndpoint::with_session_id("AB12CD", InputFilterConfig::default());
    let mut web_a = WebEndpoint::new("AB12CD");
    let (_cli_a_rx, mut web_a_rx) = paired(&relay, &mut cli_a, &mut web_a).await;
    relay.pump_web(&mut web_a, &mut web_a_rx, "web-1").await;

    let mut cli_b_rx = relay.connect("cli-b");
    let mut cli_b = CliEndpoint::with_session_id("ZZ99ZZ", InputFilterConfig::default());
    relay.send("cli-b", &cli_b.connect()).await;
    let mut web_b_rx = relay.connect("web-b");
    relay
        .send(
            "web-b",
            &ClientMessage::SessionJoin {
                session_id: "ZZ99ZZ".into(),
                public_key: SecureChannel::new().public_key(),
            },
        )
        .await;
    relay.pump_cli(&mut cli_b, &mut cli_b_rx, "cli-b").await;
    drain(&mut web_b_rx);
    drain(&mut web_a_rx);

    let output = cli_a.send_output("secret").unwrap().unwrap();
    relay.send("cli-1", &output).await;
    assert_eq!(drain(&mut web_a_rx).len(), 1);
    assert!(drain(&mut web_b_rx).is_empty());

    // A forged envelope naming another session is refused, not forwarded.
    let ClientMessage::Encrypted(mut forged) = cli_a.send_output("spoof").unwrap().unwrap() else {
        panic!("expected an envelope");
    };
    forged.session_id = "ZZ99ZZ".into();
    relay.send("cli-1", &ClientMessage::Encrypted(forged)).await;
    assert!(drain(&mut web_b_rx).is_empty());
    assert!(drain(&mut web_a_rx).is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn cli_transport_drop_and_reconnect() {
    let relay = Relay::new();
    let mut cli = CliEndpoint::with_session_id("AB12CD", InputFilterConfig::default());
    let mut web = WebEndpoint::new("AB12CD");
    let (_cli_rx, mut web_rx) = paired(&relay, &mut cli, &mut web).await;
    relay.pump_web(&mut web, &mut web_rx, "web-1").await;

    relay.close("cli-1").await;
    assert_eq!(relay.status("AB12CD").await, SessionStatus::Closed);
    let notices = relay.pump_web(&mut web, &mut web_rx, "web-1").await;
    assert_eq!(notices, vec![WebAction::CliDisconnected]);
    assert_eq!(web.phase(), WebPhase::Waiting);
    assert_eq!(web.send_input("x").unwrap(), None);

    let mut cli_rx = relay.connect("cli-2");
    let reconnect = cli.connect();
    assert!(matches!(reconnect, ClientMessage::SessionReconnect { .. }));
    relay.send("cli-2", &reconnect).await;
    relay.pump_cli(&mut cli, &mut cli_rx, "cli-2").await;
    assert_eq!(cli.phase(), CliPhase::Waiting);
    assert_eq!(relay.status("AB12CD").await, SessionStatus::Active);

    let actions = relay.pump_web(&mut web, &mut web_rx, "web-1").await;
    assert_eq!(actions.first(), Some(&WebAction::CliReconnected));
    relay.pump_cli(&mut cli, &mut cli_rx, "cli-2").await;
    assert_eq!(cli.phase(), CliPhase::Paired);
    let rejoined = relay.pump_web(&mut web, &mut web_rx, "web-1").await;
    assert!(rejoined.contains(&WebAction::Connected));
    assert_eq!(web.phase(), WebPhase::Connected);

    let output = cli.send_output("back").unwrap().unwrap();
    relay.send("cli-2", &output).await;
    let delivered = relay.pump_web(&mut web, &mut web_rx, "web-1").await;
    assert_eq!(delivered, vec![WebAction::Output("back".into())]);
}

#[test_timeout::tokio_timeout_test]
async fn viewer_can_wait_for_a_detached_cli() {
    let relay = Relay::new();
    let mut cli = CliEndpoint::with_session_id("AB12CD", InputFilterConfig::default());
    let mut cli_rx = relay.connect("cli-1");
    relay.send("cli-1", &cli.connect()).await;
    relay.pump_cli(&mut cli, &mut cli_rx, "cli-1").await;
    relay.close("cli-1").await;

    let mut web = WebEndpoint::new("AB12CD");
    let mut web_rx = relay.connect("web-1");
    relay.send("web-1", &web.join()).await;
    let actions = relay.pump_web(&mut web, &mut web_rx, "web-1").await;
    assert_eq!(actions, vec![WebAction::Joined, WebAction::CliDisconnected]);
    assert_eq!(web.phase(), WebPhase::Waiting);

    let mut cli_rx = relay.connect("cli-2");
    relay.send("cli-2", &cli.connect()).await;
    relay.pump_cli(&mut cli, &mut cli_rx, "cli-2").await;
    assert_eq!(relay.status("AB12CD").await, SessionStatus::Active);

    // The CLI has never seen this viewer, so the viewer re-announces itself.
    let actions = relay.pump_web(&mut web, &mut web_rx, "web-1").await;
    assert_eq!(actions.first(), Some(&WebAction::CliReconnected));
    relay.pump_cli(&mut cli, &mut cli_rx, "cli-2").await;
    assert_eq!(cli.phase(), CliPhase::Paired);

    relay.pump_web(&mut web, &mut web_rx, "web-1").await;
    relay.pump_cli(&mut cli, &mut cli_rx, "cli-2").await;
    let synced = relay.pump_web(&mut web, &mut web_rx, "web-1").await;
    assert_eq!(
        synced,
        vec![WebAction::StateSync {
            cols: 80,
            rows: 24,
            has_history: false,
        }]
    );
}
