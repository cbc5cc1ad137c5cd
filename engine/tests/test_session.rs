//! Session lifecycle: registration, dispatch loop recovery, shutdown.

mod controller_simulator;

use controller_simulator::{
    eventually, start, start_with, test_config, SimController, SimControllerConfig, SimHost,
};
use engine::{
    CapiError, Confirmation, Indication, ReceiveError, Request, Service, Session, SessionConfig,
    State,
};

fn init(controller: SimControllerConfig) -> Result<(), CapiError> {
    // ---
    let sim = SimController::new(controller);
    Session::init(sim, SimHost::new(), None, test_config()).map(drop)
}

#[test]
fn test_init_failures() {
    // ---
    let missing = SimControllerConfig {
        installed: false,
        ..SimControllerConfig::default()
    };
    assert!(matches!(init(missing), Err(CapiError::ControllerUnavailable)));

    let empty = SimControllerConfig {
        controllers: 0,
        ..SimControllerConfig::default()
    };
    assert!(matches!(init(empty), Err(CapiError::NoControllers)));

    let refused = SimControllerConfig {
        register_info: 0x1001,
        ..SimControllerConfig::default()
    };
    assert!(matches!(
        init(refused),
        Err(CapiError::RegistrationFailed(0x1001))
    ));
}

#[test]
fn test_listen_failure_releases_registration() {
    // ---
    let sim = SimController::new(SimControllerConfig::default());
    sim.fail("LISTEN_REQ", 0x2002);

    let result = Session::init(sim.clone(), SimHost::new(), None, test_config());
    assert!(matches!(result, Err(CapiError::RegistrationFailed(0x2002))));
    assert_eq!(sim.registrations(), 1);
    assert_eq!(sim.releases(), 1);
}

#[test]
fn test_invalid_config_rejected() {
    // ---
    let sim = SimController::new(SimControllerConfig::default());
    let config = SessionConfig {
        max_connections: 0,
        ..test_config()
    };

    let result = Session::init(sim.clone(), SimHost::new(), None, config);
    assert!(matches!(result, Err(CapiError::Config(_))));
    assert_eq!(sim.registrations(), 0);
}

#[test]
fn test_listens_on_every_controller() {
    // ---
    let controllers = SimControllerConfig {
        controllers: 3,
        ..SimControllerConfig::default()
    };
    let (sim, _host, mut session) = start_with(controllers, SimHost::new(), test_config());

    let listened: Vec<u32> = sim
        .sent()
        .iter()
        .filter_map(|r| match r {
            Request::Listen { controller, .. } => Some(*controller),
            _ => None,
        })
        .collect();
    assert_eq!(listened, vec![1, 2, 3]);
    assert!(session.is_running());

    session.shutdown();
}

#[test]
fn test_remote_host_forwarded() {
    // ---
    let sim = SimController::new(SimControllerConfig::default());
    let mut session = Session::init(sim.clone(), SimHost::new(), Some("capi.local"), test_config())
        .expect("init");

    assert_eq!(sim.remote_host().as_deref(), Some("capi.local"));
    session.shutdown();
}

#[test]
fn test_dial_rejects_empty_numbers() {
    // ---
    let (sim, _host, mut session) = start();
    let before = sim.sent().len();

    let err = session
        .dial(1, "", "5552", false, Service::Voice)
        .expect_err("empty source");
    assert!(matches!(err, CapiError::InvalidNumber(_)));
    assert!(session
        .dial(1, "5551", "", false, Service::Voice)
        .is_err());

    assert!(session.calls().is_empty());
    assert_eq!(sim.sent().len(), before, "nothing reached the controller");

    session.shutdown();
}

#[test]
fn test_no_free_slot() {
    // ---
    let config = SessionConfig {
        max_connections: 1,
        ..test_config()
    };
    let (_sim, _host, mut session) =
        start_with(SimControllerConfig::default(), SimHost::new(), config);

    session
        .dial(1, "5551", "5552", false, Service::Voice)
        .expect("first call");
    let err = session
        .dial(1, "5551", "5553", false, Service::Voice)
        .expect_err("table is full");
    assert!(matches!(err, CapiError::NoFreeSlot(1)));
    assert_eq!(session.calls().len(), 1);

    session.shutdown();
}

#[test]
fn test_shutdown_is_idempotent() {
    // ---
    let (sim, _host, mut session) = start();
    assert!(session.is_running());

    session.shutdown();
    assert!(!session.is_running());
    assert_eq!(sim.releases(), 1);

    session.shutdown();
    assert_eq!(sim.releases(), 1);

    let err = session
        .dial(1, "5551", "5552", false, Service::Voice)
        .expect_err("closed");
    assert!(matches!(err, CapiError::SessionClosed));
}

#[test]
fn test_drop_releases_registration() {
    // ---
    let (sim, _host, session) = start();
    drop(session);
    assert_eq!(sim.releases(), 1);
}

#[test]
fn test_shutdown_hangs_up_open_calls() {
    // ---
    let config = SessionConfig {
        shutdown_grace_ms: 1000,
        ..test_config()
    };
    let (sim, host, mut session) =
        start_with(SimControllerConfig::default(), SimHost::new(), config);

    let id = session
        .dial(1, "5551", "5552", false, Service::Voice)
        .expect("dial");
    sim.confirm(Confirmation::Connect {
        plci: 0x0101,
        info: 0,
    });
    assert!(eventually(|| session
        .call_info(id)
        .is_some_and(|c| c.state == State::ConnectWait)));

    // The controller answers the hangup within the grace period
    let responder = {
        let sim = sim.clone();
        std::thread::spawn(move || {
            if sim
                .wait_for_request(|r| *r == Request::Disconnect { plci: 0x0101 })
                .is_some()
            {
                sim.indicate(Indication::Disconnect {
                    plci: 0x0101,
                    reason: 0,
                });
            }
        })
    };

    session.shutdown();
    responder.join().expect("responder");

    assert!(sim.sent().contains(&Request::Disconnect { plci: 0x0101 }));
    assert!(session.calls().is_empty());
    assert_eq!(host.connected(), 0);
    assert_eq!(host.disconnected(), 1);
    assert_eq!(sim.releases(), 1);
}

#[test]
fn test_reconnects_after_empty_queue() {
    // ---
    let (sim, host, mut session) = start();
    assert_eq!(sim.registrations(), 1);

    sim.inject_queue_empty(1);
    assert!(eventually(|| session.metrics().reconnects_total.get() == 1));
    assert_eq!(sim.registrations(), 2);
    assert!(session.is_running());

    // Messages flow again after re-registration
    sim.indicate(Indication::Connect {
        plci: 0x0401,
        cip: 4,
        calling: controller_simulator::calling_number("123"),
        called: controller_simulator::called_number("9"),
    });
    assert!(sim
        .wait_for_request(|r| *r == Request::Alert { plci: 0x0401 })
        .is_some());
    assert!(host.statuses().is_empty());

    session.shutdown();
}

#[test]
fn test_gives_up_after_bounded_retries() {
    // ---
    let mut config = test_config();
    config.reconnect.max_retries = 2;
    let (sim, _host, mut session) =
        start_with(SimControllerConfig::default(), SimHost::new(), config);

    sim.set_register_info(0x1001);
    sim.inject_queue_empty(1);

    assert!(eventually(|| !session.is_running()));
    assert_eq!(sim.registrations(), 3);
    assert_eq!(session.metrics().reconnects_total.get(), 0);

    session.shutdown();
}

#[test]
fn test_receive_failure_stops_dispatch() {
    // ---
    let (sim, _host, mut session) = start();

    sim.inject_receive_failure(ReceiveError::Failed(0x1101));
    assert!(eventually(|| !session.is_running()));
    assert_eq!(sim.registrations(), 1);

    session.shutdown();
    assert_eq!(sim.releases(), 1);
}

#[test]
fn test_metrics_track_traffic() {
    // ---
    let (sim, _host, mut session) = start();

    sim.indicate(Indication::Connect {
        plci: 0x0501,
        cip: 2,
        calling: controller_simulator::calling_number("123"),
        called: controller_simulator::called_number("9"),
    });
    assert!(eventually(|| session.metrics().calls_rejected_total.get() == 1));

    let metrics = session.metrics();
    assert_eq!(metrics.indications_total.get(), 1);
    assert!(metrics.messages_received_total.get() >= 1);
    assert!(metrics.requests_sent_total.get() >= 2);

    let text = metrics.encode_text().expect("encode");
    assert!(text.contains("calls_rejected_total"));

    session.shutdown();
}

#[test]
fn test_config_loaded_from_toml() {
    // ---
    let config = SessionConfig::from_toml_str(
        r#"
        max_connections = 2
        wait_timeout_ms = 10
        shutdown_grace_ms = 20
        "#,
    )
    .expect("config");

    let (_sim, _host, mut session) =
        start_with(SimControllerConfig::default(), SimHost::new(), config);
    assert_eq!(session.config().max_connections, 2);

    session.dial(1, "1", "2", false, Service::Voice).expect("first");
    session.dial(1, "1", "3", false, Service::Voice).expect("second");
    assert!(session.dial(1, "1", "4", false, Service::Voice).is_err());

    session.shutdown();
}
