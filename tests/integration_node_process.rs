//! End-to-end tests against the real node executable, launched as a
//! subprocess with its stdio as the transport.

use antler::launcher::Launch;
use antler::node::{Ctx, NodeId};
use antler::repo;
use antler::run::Run;
use antler::runners::Runners;
use std::time::{Duration, Instant};

fn subprocess(id: &str) -> NodeId {
    // Cargo points integration tests at the built node binary.
    repo::register(&repo::platform(), repo::Source::file(env!("CARGO_BIN_EXE_antler-node")));
    let mut n = NodeId::named(id);
    n.launch = Launch::Local { sudo: false };
    n.env.inherit = true;
    n
}

#[tokio::test]
async fn child_subprocess_runs_and_drains() {
    let tree = Run::child(subprocess("p1"), Run::from(Runners::sleep("10ms")));

    let mut records = Vec::new();
    let out = antler::control::run(tree, |r| records.push(r)).await.unwrap();

    assert!(out.ok, "records: {:?}", records);
}

#[tokio::test]
async fn child_subprocess_terminates_within_grace_on_cancel() {
    let tree = Run::child(subprocess("p2"), Run::from(Runners::sleep("30s")));

    let (cancel, ctx) = Ctx::new();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let start = Instant::now();
    let err = antler::control::run_ctx(ctx, tree, |_| {}).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.to_string().contains("canceled"), "error: {:#}", err);
    assert!(elapsed < Duration::from_secs(10), "teardown took {:?}", elapsed);
}

#[tokio::test]
async fn child_subprocess_reports_runner_failure() {
    let tree = Run::child(subprocess("p3"), Run::from(Runners::system("/bin/false")));

    let mut records = Vec::new();
    let out = antler::control::run(tree, |r| records.push(r)).await.unwrap();

    assert!(!out.ok);
    // The child's error record is forwarded to the controller.
    assert!(
        records
            .iter()
            .any(|r| matches!(r, antler::record::Record::Error(e) if e.node == "p3")),
        "records: {:?}",
        records
    );
}
