use antler::launcher::Launch;
use antler::node::NodeId;
use antler::record::{Record, Side};
use antler::run::Run;
use antler::runners::{PacketClient, PacketServer, Runners, StreamClient, StreamServer};

fn in_process(id: &str) -> NodeId {
    let mut n = NodeId::named(id);
    n.launch = Launch::InProcess;
    n
}

/// A stream server on a child node publishes its bound address into
/// feedback; the client on the root consumes it. Measurement records from
/// both nodes stream back to the controller.
#[tokio::test]
async fn stream_flow_threads_addr_through_feedback() {
    let mut client = StreamClient::new("60ms");
    client.length = Some(512 * 1024);
    let tree = Run::serial(vec![
        Run::child(
            in_process("a"),
            Run::from(Runners::stream_server(StreamServer::default())),
        ),
        Run::from(Runners::stream_client(client)),
    ]);

    let mut records = Vec::new();
    let out = antler::control::run(tree, |r| records.push(r)).await.unwrap();

    assert!(out.ok, "records: {:?}", records);
    let addr = out.feedback["addr"].as_str().unwrap();
    assert!(addr.contains(':'), "feedback addr {:?}", addr);

    let server_info = records.iter().any(|r| {
        matches!(r, Record::StreamInfo(i) if i.side == Side::Server && i.node == "a")
    });
    let client_info = records.iter().any(|r| {
        matches!(r, Record::StreamInfo(i) if i.side == Side::Client && i.node.is_empty())
    });
    assert!(server_info, "records: {:?}", records);
    assert!(client_info, "records: {:?}", records);

    let bytes = records
        .iter()
        .filter_map(|r| match r {
            Record::StreamSample(s) => Some(s.bytes),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    assert!(bytes > 0, "expected stream samples, records: {:?}", records);
}

/// The packet pair measures round-trip times through a child-node echo
/// server.
#[tokio::test]
async fn packet_flow_yields_rtt_samples() {
    let mut client = PacketClient::new("80ms");
    client.interval = "5ms".to_string();
    let tree = Run::serial(vec![
        Run::child(
            in_process("b"),
            Run::from(Runners::packet_server(PacketServer::default())),
        ),
        Run::from(Runners::packet_client(client)),
    ]);

    let mut records = Vec::new();
    let out = antler::control::run(tree, |r| records.push(r)).await.unwrap();

    assert!(out.ok, "records: {:?}", records);
    let samples: Vec<u64> = records
        .iter()
        .filter_map(|r| match r {
            Record::PacketSample(s) => Some(s.rtt_ns),
            _ => None,
        })
        .collect();
    assert!(!samples.is_empty(), "records: {:?}", records);
}
