use antler::node::Ctx;
use antler::run::{Run, Schedule};
use antler::runners::Runners;
use std::time::{Duration, Instant};

/// Canceling the context mid-schedule drains the fleet within the grace
/// period and surfaces a context-canceled error.
#[tokio::test]
async fn cancel_mid_schedule_drains_and_errors() {
    let tree = Run::schedule(Schedule {
        wait: vec!["10ms".into()],
        runs: (0..20).map(|_| Run::from(Runners::sleep("30s"))).collect(),
        ..Default::default()
    });

    let (cancel, ctx) = Ctx::new();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let start = Instant::now();
    let err = antler::control::run_ctx(ctx, tree, |_| {}).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.to_string().contains("canceled"), "error: {:#}", err);
    assert!(elapsed < Duration::from_secs(10), "drain took {:?}", elapsed);
}

/// Buffered records produced before the abort are flushed to the
/// controller with the terminal message.
#[tokio::test]
async fn buffered_records_are_flushed_on_abort() {
    let tree = Run::serial(vec![
        Run::from(Runners::system("/bin/true")),
        Run::from(Runners::sleep("30s")),
    ]);

    let (cancel, ctx) = Ctx::new();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let mut records = Vec::new();
    let _ = antler::control::run_ctx(ctx, tree, |r| records.push(r)).await;

    assert!(
        records
            .iter()
            .any(|r| matches!(r, antler::record::Record::Log(l) if l.text.contains("run started"))),
        "records: {:?}",
        records
    );
}
