use mock_service::{BackendConfig, MockService};
use std::sync::OnceLock;
use surge::core::RunConfig;
use tokio::net::TcpListener;
use tracing::error;
use tracing_subscriber::FmtSubscriber;

#[allow(unused)]
pub fn init() {
    static ONCE_LOCK: OnceLock<()> = OnceLock::new();

    ONCE_LOCK.get_or_init(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            error!("Panic occurred: {info:?}");
        }));

        FmtSubscriber::builder()
            .with_env_filter("surge=debug,mock_service=debug")
            .with_test_writer()
            .init();
    });
}

/// Start a mock service on an ephemeral local port.
#[allow(unused)]
pub async fn spawn_service(config: BackendConfig) -> MockService {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    MockService::start(listener, config).await.unwrap()
}

/// Parse a run config aimed at `service`. `extra` holds additional top level JSON fields.
#[allow(unused)]
pub fn run_config(service: &MockService, extra: &str) -> RunConfig {
    let raw = format!(
        r#"{{
            "baseUrl": "{}",
            "startJitter": "100ms",
            "thinkTime": {{ "min": "20ms", "max": "50ms" }}
            {}{}
        }}"#,
        service.base_url(),
        if extra.is_empty() { "" } else { "," },
        extra
    );
    RunConfig::from_json(&raw).unwrap()
}
