use antler::run::Run;
use antler::runners::Runners;
use std::time::{Duration, Instant};

/// Two serial sleeps on the root node: success, elapsed at least the sum of
/// the sleeps, and no record traffic beyond the run itself.
#[tokio::test]
async fn serial_sleeps_run_in_order() {
    let tree = Run::serial(vec![
        Run::from(Runners::sleep("10ms")),
        Run::from(Runners::sleep("10ms")),
    ]);

    let mut records = Vec::new();
    let start = Instant::now();
    let out = antler::control::run(tree, |r| records.push(r)).await.unwrap();
    let elapsed = start.elapsed();

    assert!(out.ok);
    assert!(out.feedback.is_empty());
    assert!(elapsed >= Duration::from_millis(20), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "elapsed {:?}", elapsed);
    assert!(
        !records.iter().any(|r| matches!(r, antler::record::Record::Error(_))),
        "unexpected error records: {:?}",
        records
    );
}

/// A failing run stops a serial composition before later children start:
/// the trailing long sleep must never run.
#[tokio::test]
async fn serial_stops_at_first_failure() {
    let tree = Run::serial(vec![
        Run::from(Runners::system("/bin/false")),
        Run::from(Runners::sleep("30s")),
    ]);

    let start = Instant::now();
    let out = antler::control::run(tree, |_| {}).await.unwrap();

    assert!(!out.ok);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "the sleep after the failure must not have started"
    );
}
