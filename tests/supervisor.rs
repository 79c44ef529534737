mod support;

use std::sync::Arc;
use std::time::Duration;

use cartwatch::adapters::ChallengeKind;
use cartwatch::config::{AppConfig, StoreCredentials};
use cartwatch::domain::{FailureReason, MonitorOutcome, PageTarget, PricePolicy, ProductTarget, StoreId};
use cartwatch::services::DiagnosticSink;
use cartwatch::stores::StoreRegistry;
use cartwatch::supervisor::{MonitorSupervisor, StorePlan, SupervisorSettings};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use support::*;
use tokio_util::sync::CancellationToken;

fn plan(store: &str, username: Option<&str>, products: Vec<ProductTarget>) -> StorePlan {
    StorePlan {
        store: StoreId::new(store),
        base_url: BASE_URL.to_string(),
        credentials: StoreCredentials {
            username: username.map(str::to_string),
            password: username.map(|_| "secret".to_string()),
        },
        automation: automation(store, PricePolicy::Strict),
        products,
    }
}

fn target(store: &str, id: &str, max: Decimal, url: &str) -> ProductTarget {
    ProductTarget::new(id, StoreId::new(store), max)
        .with_page(PageTarget::new(url, Duration::from_secs(10)))
}

fn supervisor_settings() -> SupervisorSettings {
    SupervisorSettings {
        monitor: settings(),
        arbitration: arbitrator_config(),
        diagnostics: DiagnosticSink::disabled(),
        cancel_grace: Duration::from_secs(30),
    }
}

#[tokio::test(start_paused = true)]
async fn stores_run_independently() {
    let north = Shop::new();
    north.break_login();
    north.script("https://shop.test/n/1", vec![View::price(10)]);
    let south = Shop::new();
    south.script("https://shop.test/s/1", vec![View::price(70), View::price(20)]);
    south.script("https://shop.test/s/2", vec![View::Blank]);

    let browser = FakeBrowser::default()
        .with_shop("north", north.clone())
        .with_shop("south", south.clone());
    let human = FakeHuman::correct();
    let supervisor = MonitorSupervisor::new(
        vec![
            plan(
                "north",
                Some("me"),
                vec![target("north", "lamp", dec!(50), "https://shop.test/n/1")],
            ),
            plan(
                "south",
                None,
                vec![
                    target("south", "desk", dec!(50), "https://shop.test/s/1"),
                    target("south", "chair", dec!(50), "https://shop.test/s/2"),
                ],
            ),
        ],
        Arc::new(browser),
        human.clone(),
        supervisor_settings(),
    );

    let report = supervisor.run_all(&CancellationToken::new()).await;

    assert_eq!(report.races.len(), 3);

    let lamp = report.race("lamp").unwrap();
    assert!(!lamp.result.is_purchased());
    assert!(lamp.note.as_deref().unwrap_or_default().contains("login"));
    assert!(matches!(
        lamp.monitors[0].outcome,
        MonitorOutcome::Failed(FailureReason::Login(_))
    ));
    assert!(north.fetches_of("https://shop.test/n/1").is_empty());

    assert!(report.race("desk").unwrap().result.is_purchased());
    assert!(!report.race("chair").unwrap().result.is_purchased());
    assert_eq!(report.purchased().count(), 1);
    assert_eq!(south.orders(), vec!["https://shop.test/s/1".to_string()]);

    let announcements = human.announcements();
    assert_eq!(announcements.len(), 1);
    assert!(announcements[0].contains("desk"));
}

#[tokio::test(start_paused = true)]
async fn login_verification_goes_through_the_arbitrator() {
    let shop = Shop::new();
    shop.challenge_on_login();
    shop.script("https://shop.test/p", vec![View::price(30)]);

    let human = FakeHuman::correct();
    let supervisor = MonitorSupervisor::new(
        vec![plan(
            "shop",
            Some("me"),
            vec![target("shop", "kettle", dec!(35), "https://shop.test/p")],
        )],
        Arc::new(FakeBrowser::default().with_shop("shop", shop.clone())),
        human.clone(),
        supervisor_settings(),
    );

    let report = supervisor.run_all(&CancellationToken::new()).await;

    assert_eq!(human.notify_count(), 1);
    assert!(report.all_purchased());
    assert_eq!(shop.orders().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn login_alert_is_acknowledged_instead_of_typed() {
    let shop = Shop::new();
    shop.alert_on_login();
    shop.script("https://shop.test/p", vec![View::price(30)]);

    // The human approves the sign-in on another device before answering.
    let approver = {
        let shop = shop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            shop.clear_verification();
        })
    };

    let human = FakeHuman::answering(Reply::Answer(String::new()), Duration::from_secs(1));
    let supervisor = MonitorSupervisor::new(
        vec![plan(
            "shop",
            Some("me"),
            vec![target("shop", "kettle", dec!(35), "https://shop.test/p")],
        )],
        Arc::new(FakeBrowser::default().with_shop("shop", shop.clone())),
        human.clone(),
        supervisor_settings(),
    );

    let report = supervisor.run_all(&CancellationToken::new()).await;
    approver.await.unwrap();

    assert_eq!(human.kinds(), vec![ChallengeKind::Acknowledge]);
    assert!(report.all_purchased());
    assert_eq!(shop.orders().len(), 1);
    assert_eq!(shop.cookie(MARKER), None);
}

#[tokio::test(start_paused = true)]
async fn shutdown_winds_down_a_pending_challenge() {
    let shop = Shop::new();
    shop.script("https://shop.test/p", vec![View::Challenge]);
    let cancel = CancellationToken::new();
    let human = FakeHuman::answering(Reply::Never, Duration::ZERO);

    let supervisor = MonitorSupervisor::new(
        vec![plan(
            "shop",
            None,
            vec![target("shop", "kettle", dec!(35), "https://shop.test/p")],
        )],
        Arc::new(FakeBrowser::default().with_shop("shop", shop.clone())),
        human.clone(),
        supervisor_settings(),
    );

    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            cancel.cancel();
        })
    };
    let started = tokio::time::Instant::now();
    let report = supervisor.run_all(&cancel).await;
    trigger.await.unwrap();

    let kettle = report.race("kettle").unwrap();
    assert_eq!(kettle.monitors[0].outcome, MonitorOutcome::Cancelled);
    // Shutdown does not sit out the grace period behind the human.
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(human.notify_count(), 1);
    assert_eq!(shop.cookie(MARKER), None);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_login_verification_reports_cancelled() {
    let shop = Shop::new();
    shop.challenge_on_login();
    shop.script("https://shop.test/p", vec![View::price(30)]);
    let cancel = CancellationToken::new();

    let supervisor = MonitorSupervisor::new(
        vec![plan(
            "shop",
            Some("me"),
            vec![target("shop", "kettle", dec!(35), "https://shop.test/p")],
        )],
        Arc::new(FakeBrowser::default().with_shop("shop", shop.clone())),
        FakeHuman::answering(Reply::Never, Duration::ZERO),
        supervisor_settings(),
    );

    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        })
    };
    let report = supervisor.run_all(&cancel).await;
    trigger.await.unwrap();

    let kettle = report.race("kettle").unwrap();
    assert_eq!(kettle.monitors[0].outcome, MonitorOutcome::Cancelled);
    assert!(shop.fetches_of("https://shop.test/p").is_empty());
    assert_eq!(shop.cookie(MARKER), None);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_every_race() {
    let shop = Shop::new();
    shop.script("https://shop.test/p", vec![View::price(99)]);
    let cancel = CancellationToken::new();

    let supervisor = MonitorSupervisor::new(
        vec![plan(
            "shop",
            None,
            vec![target("shop", "kettle", dec!(35), "https://shop.test/p")],
        )],
        Arc::new(FakeBrowser::default().with_shop("shop", shop.clone())),
        FakeHuman::correct(),
        supervisor_settings(),
    );

    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            cancel.cancel();
        })
    };
    let report = supervisor.run_all(&cancel).await;
    trigger.await.unwrap();

    let kettle = report.race("kettle").unwrap();
    assert_eq!(kettle.monitors[0].outcome, MonitorOutcome::Cancelled);
    assert_eq!(shop.fetches_of("https://shop.test/p").len(), 2);
}

#[test]
fn plans_come_from_validated_config() {
    let config = AppConfig::from_toml_str(
        r#"
        [[stores]]
        name = "Amazon"
        base_url = "https://www.amazon.com"

        [[stores.products]]
        id = "gpu"
        max_price = "499.99"

        [[stores.products.pages]]
        url = "https://www.amazon.com/dp/A"
        "#,
    )
    .unwrap();
    let registry = StoreRegistry::with_builtin();
    config.validate(&registry).unwrap();

    let supervisor = MonitorSupervisor::from_config(
        &config,
        &registry,
        Arc::new(FakeBrowser::default()),
        FakeHuman::correct(),
    )
    .unwrap();

    let plans = supervisor.plans();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].store.as_str(), "amazon");
    assert_eq!(plans[0].products[0].max_price, dec!(499.99));
    assert_eq!(plans[0].automation.store().as_str(), "amazon");
}
