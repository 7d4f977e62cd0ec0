// End-to-end runs of the full stage chain: datagrams in, ordered sink rows out
use can_telemetry_pipeline::{
    load_dbc_or_empty, CancellationToken, CannelloniCodec, CannelloniDecoder, CollectingSink,
    ColumnValue, Connector, Decoder, Pipeline, ProcessorStage, RawCanFrame, RawDatagram,
    ReorderConfig, ReorderStage, RowMapper, SinkHandler, SinkRow, SourceStage, StageConfig,
    TransportMessage, UdpSource,
};
use chrono::Utc;
use std::io::Write;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

const TRANSMISSION_DBC: &str = r#"
VERSION ""

NS_ :
    VAL_

BS_:

BU_: ECU1 ECU2

BO_ 500 Transmission: 8 ECU1
 SG_ gear : 0|8@1+ (1,0) [0|3] "" ECU2
 SG_ oil_temp : 15|16@0+ (0.1,-40) [-40|200] "C" ECU2

VAL_ 500 gear 0 "first" 1 "second" 2 "third" ;
"#;

fn write_dbc() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(TRANSMISSION_DBC.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// One datagram: a transmission frame plus a frame nobody defines
fn datagram(sequence: u8) -> Vec<u8> {
    let oil_raw = 1000 + u16::from(sequence) * 10;
    let [hi, lo] = oil_raw.to_be_bytes();
    let message = TransportMessage::with_frames(
        sequence,
        vec![
            RawCanFrame::new(500, &[2, hi, lo, 0, 0, 0, 0, 0]),
            RawCanFrame::new(0x7FF, &[0xFF]),
        ],
    );
    CannelloniCodec::encode(&message).unwrap()
}

struct Chain {
    pipeline: Pipeline,
    sink: CollectingSink,
}

/// Build codec -> reorder -> decoder -> rows -> sink reading from `datagrams`
fn build_chain(datagrams: Arc<Connector<RawDatagram>>, reorder: ReorderConfig, dbc: &NamedTempFile) -> Chain {
    let messages = Arc::new(Connector::new(64));
    let ordered = Arc::new(Connector::new(64));
    let signals = Arc::new(Connector::new(64));
    let rows = Arc::new(Connector::new(64));
    let sink = CollectingSink::new();

    let mut pipeline = Pipeline::new();
    pipeline.add_stage(ProcessorStage::new(
        CannelloniDecoder::new(),
        datagrams,
        Arc::clone(&messages),
        StageConfig::new("cannelloni"),
    ));
    pipeline.add_stage(ReorderStage::new(messages, Arc::clone(&ordered), reorder));
    pipeline.add_stage(ProcessorStage::new(
        Decoder::with_database(load_dbc_or_empty(Some(dbc.path()))),
        ordered,
        Arc::clone(&signals),
        StageConfig::new("can"),
    ));
    pipeline.add_stage(ProcessorStage::new(
        RowMapper::new(),
        signals,
        Arc::clone(&rows),
        StageConfig::new("rows"),
    ));
    pipeline.add_stage(ProcessorStage::sink(
        SinkHandler::new(sink.clone()),
        rows,
        StageConfig::new("sink"),
    ));

    Chain { pipeline, sink }
}

fn raw_values(rows: &[SinkRow], table: &str) -> Vec<i64> {
    rows.iter()
        .filter(|r| r.table == table)
        .filter_map(|r| match r.get("raw_value") {
            Some(ColumnValue::Integer(v)) => Some(*v),
            _ => None,
        })
        .collect()
}

#[test]
fn out_of_order_datagrams_reach_the_sink_in_sequence() {
    let dbc = write_dbc();
    let datagrams = Arc::new(Connector::new(16));
    let cancel = CancellationToken::new();

    let base = Utc::now() - chrono::Duration::seconds(1);
    let received_at = |arrival: usize| base + chrono::Duration::milliseconds(10 * arrival as i64);

    let arrivals: Vec<Vec<u8>> = vec![datagram(2), vec![9, 9, 9], datagram(1), datagram(3), datagram(2)];
    for (arrival, payload) in arrivals.into_iter().enumerate() {
        let mut raw = RawDatagram::new(arrival as u64, payload);
        raw.received_at = received_at(arrival);
        datagrams.enqueue(raw, &cancel).unwrap();
    }
    datagrams.close();

    let mut chain = build_chain(
        Arc::clone(&datagrams),
        ReorderConfig::new().with_initial_sequence(1),
        &dbc,
    );
    chain.pipeline.init().unwrap();
    chain.pipeline.run(&cancel).unwrap();
    chain.pipeline.close();

    let rows = chain.sink.rows();
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|r| r.is_well_ordered()));

    // Malformed and duplicate datagrams are dropped; order follows the sequence number
    assert_eq!(raw_values(&rows, "float_signals"), vec![1010, 1020, 1030]);
    assert_eq!(raw_values(&rows, "enum_signals"), vec![2, 2, 2]);

    let gear = &rows[0];
    assert_eq!(gear.table, "enum_signals");
    let layout: Vec<&str> = gear.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(layout, vec!["name", "enum_value", "can_id", "raw_value"]);
    assert_eq!(gear.get("enum_value"), Some(&ColumnValue::Symbol("third".to_string())));
    assert_eq!(gear.get("can_id"), Some(&ColumnValue::Integer(500)));

    match rows[1].get("float_value") {
        Some(ColumnValue::Float(v)) => assert!((v - 61.0).abs() < 1e-9),
        other => panic!("unexpected float column {other:?}"),
    }

    // Rows keep the reception time of their datagram, even when it was held back
    let timestamps: Vec<_> = rows.iter().map(|r| r.timestamp).collect();
    assert_eq!(
        timestamps,
        vec![
            received_at(2),
            received_at(2),
            received_at(0),
            received_at(0),
            received_at(3),
            received_at(3),
        ]
    );
}

#[test]
fn udp_ingress_feeds_the_pipeline_until_cancelled() {
    let dbc = write_dbc();

    // Reserve a free port, then hand it to the source
    let addr = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

    let datagrams = Arc::new(Connector::new(64));
    let Chain { mut pipeline, sink } = build_chain(Arc::clone(&datagrams), ReorderConfig::new(), &dbc);
    pipeline.add_stage(SourceStage::new(
        "udp",
        UdpSource::new(addr).with_read_timeout(Duration::from_millis(20)),
        datagrams,
    ));
    pipeline.init().unwrap();

    let cancel = CancellationToken::new();
    let runner = {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            pipeline.run(&cancel).unwrap();
            pipeline.close();
        })
    };

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut sequence: u8 = 0;
    while sink.len() < 4 && Instant::now() < deadline {
        sender.send_to(&datagram(sequence), addr).unwrap();
        sequence = sequence.wrapping_add(1);
        std::thread::sleep(Duration::from_millis(20));
    }

    cancel.cancel();
    runner.join().unwrap();

    let rows = sink.rows();
    assert!(rows.len() >= 4, "only {} rows arrived", rows.len());
    let raw = raw_values(&rows, "float_signals");
    assert!(raw.windows(2).all(|w| w[0] < w[1]), "rows out of order: {raw:?}");
}
