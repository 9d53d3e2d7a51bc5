use antler::record::Record;
use antler::run::Run;
use antler::runners::{Runners, StreamServer};

/// Two parallel servers publishing the same feedback key: the merge fails,
/// the overall result is failure, and the error record names the key.
#[tokio::test]
async fn colliding_feedback_keys_fail_the_run() {
    let tree = Run::parallel(vec![
        Run::from(Runners::stream_server(StreamServer::default())),
        Run::from(Runners::stream_server(StreamServer::default())),
    ]);

    let mut records = Vec::new();
    let out = antler::control::run(tree, |r| records.push(r)).await.unwrap();

    assert!(!out.ok);
    let named = records.iter().any(|r| {
        matches!(r, Record::Error(e) if e.tag == "feedback" && e.message.contains("addr"))
    });
    assert!(named, "expected a merge error naming the key, records: {:?}", records);
}
