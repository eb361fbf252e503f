mod utils;
#[allow(unused)]
use utils::*;

mod tests {
    use super::*;
    use mock_service::BackendConfig;
    use std::time::Duration;
    use surge::prelude::*;
    use surge::{ThresholdStatus, EXIT_FAIL, EXIT_PASS};

    const STAGES: &str = r#"
        "stages": [
            { "duration": "1s", "target": 3 },
            { "duration": "1s", "target": 3 },
            { "duration": "500ms", "target": 0 }
        ]"#;

    fn quick_backend() -> BackendConfig {
        BackendConfig {
            product_delay: Duration::from_millis(20),
            soft_limit: 10_000,
            hard_limit: 10_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ntest::timeout(20_000)]
    async fn healthy_backend_passes() {
        init();
        let service = spawn_service(quick_backend()).await;

        let config = run_config(
            &service,
            &format!(
                r#"{STAGES}, "thresholds": ["http_req_failed < 0.01", "p(95) < 500"]"#
            ),
        );
        let summary = LoadTest::connect(config).await.unwrap().run().await;
        let report = summary.report();

        assert!(summary.passed(), "{report:#?}");
        assert_eq!(summary.exit_code(), EXIT_PASS);
        assert!(report.requests > 0);
        assert!(report.iterations > 0);
        assert_eq!(report.failures, 0);
        for op in ["browse", "view", "checkout"] {
            assert!(report.operations[op].requests > 0, "{op}");
        }
        assert_eq!(report.status_codes.keys().copied().collect::<Vec<_>>(), vec![200]);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20_000)]
    async fn failing_checkouts_fail_the_run() {
        init();
        let service = spawn_service(BackendConfig {
            checkout_failure_ratio: 0.9,
            ..quick_backend()
        })
        .await;

        let config = run_config(
            &service,
            &format!(r#"{STAGES}, "thresholds": ["http_req_failed < 0.01"]"#),
        );
        let summary = LoadTest::connect(config).await.unwrap().run().await;
        let report = summary.report();

        assert!(!summary.passed());
        assert_eq!(summary.exit_code(), EXIT_FAIL);
        assert_eq!(report.thresholds[0].status, ThresholdStatus::Fail);

        let checkout = &report.operations["checkout"];
        assert!(checkout.failure_rate.unwrap() > 0.5, "{checkout:?}");
        assert_eq!(checkout.failures_by_kind.status, checkout.failures);
        assert_eq!(report.operations["browse"].failures, 0);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20_000)]
    async fn slow_product_lookups_violate_the_latency_bound() {
        init();
        let service = spawn_service(BackendConfig {
            product_delay: Duration::from_millis(350),
            ..quick_backend()
        })
        .await;

        let config = run_config(
            &service,
            &format!(
                r#"{STAGES}, "thresholds": [
                    "view:latency_violation_rate < 0.5",
                    "browse:failure_rate < 0.01"
                ]"#
            ),
        );
        let summary = LoadTest::connect(config).await.unwrap().run().await;
        let report = summary.report();

        let view = &report.operations["view"];
        assert!(view.requests > 0);
        assert_eq!(view.failures_by_kind.latency, view.requests);
        assert_eq!(report.thresholds[0].status, ThresholdStatus::Fail);
        assert_eq!(report.thresholds[1].status, ThresholdStatus::Pass);
        assert!(!summary.passed());

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20_000)]
    async fn fail_fast_aborts_a_doomed_run() {
        init();
        let service = spawn_service(BackendConfig {
            checkout_failure_ratio: 1.,
            ..quick_backend()
        })
        .await;

        let config = run_config(
            &service,
            r#""stages": [{ "duration": "60s", "target": 4 }],
               "ramp": "step",
               "failFast": true,
               "failFastInterval": "250ms",
               "thresholds": ["checkout:failure_rate < 0.1"]"#,
        );
        let summary = LoadTest::connect(config).await.unwrap().run().await;

        assert!(summary.verdict.aborted);
        assert!(!summary.passed());
        assert!(summary.elapsed < Duration::from_secs(10), "{:?}", summary.elapsed);
        assert_eq!(summary.exit_code(), EXIT_FAIL);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20_000)]
    async fn overload_window_rejects_excess_checkouts() {
        init();
        let service = spawn_service(BackendConfig {
            soft_limit: 3,
            hard_limit: 5,
            overload_step: Duration::from_millis(5),
            window: Duration::from_secs(60),
            ..quick_backend()
        })
        .await;

        let config = run_config(&service, STAGES);
        let summary = LoadTest::connect(config).await.unwrap().run().await;
        let checkout = &summary.report().operations["checkout"];

        // Only the first five checkouts of the window are accepted.
        assert!(checkout.requests > 5, "{checkout:?}");
        assert_eq!(checkout.requests - checkout.failures, 5);
        assert!(summary.snapshot.status_codes.contains_key(&503));

        service.shutdown().await.unwrap();
    }
}
