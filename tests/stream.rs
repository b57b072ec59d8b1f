//! Result stream contract tests against a scripted in-process server.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

use bolt_stream::messages::{backend, frontend};
use bolt_stream::value::Value;
use bolt_stream::{BoltStream, FailureKind, ResultStream, StreamError, packstream};

fn message(signature: u8, fields: Vec<Value>) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(0xB0 | fields.len() as u8);
    body.put_u8(signature);
    for field in &fields {
        packstream::encode(field, &mut body);
    }
    let mut out = BytesMut::new();
    frontend::write_chunks(&mut out, &body);
    out
}

fn success(meta: Vec<(&str, Value)>) -> BytesMut {
    let map: HashMap<String, Value> =
        meta.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    message(0x70, vec![Value::Map(map)])
}

fn failure(code: &str, text: &str) -> BytesMut {
    let map: HashMap<String, Value> = [
        ("code".to_string(), Value::String(code.into())),
        ("message".to_string(), Value::String(text.into())),
    ]
    .into_iter()
    .collect();
    message(0x7F, vec![Value::Map(map)])
}

fn record(values: Vec<Value>) -> BytesMut {
    message(0x71, vec![Value::List(values)])
}

fn field_names(names: &[&str]) -> Value {
    Value::List(names.iter().map(|n| Value::String(n.to_string())).collect())
}

async fn expect_request(server: &mut DuplexStream, signature: u8) -> backend::BoltMessage {
    let msg = backend::read_message(&mut *server).await.unwrap();
    assert_eq!(
        u8::from(msg.signature),
        signature,
        "unexpected request {msg}"
    );
    msg
}

#[tokio::test]
async fn test_statement_roundtrip() {
    let (client, mut server) = duplex(8192);

    let server_task = tokio::spawn(async move {
        let run = expect_request(&mut server, 0x10).await;
        assert_eq!(run.fields[0], Value::String("RETURN 1, 'a'".into()));
        expect_request(&mut server, 0x3F).await;

        let header = success(vec![("fields", field_names(&["n", "m"]))]);
        server.write_all(&header).await.unwrap();
        let first = record(vec![Value::Int(1), Value::String("a".into())]);
        server.write_all(&first).await.unwrap();
        let second = record(vec![Value::Int(2), Value::String("b".into())]);
        server.write_all(&second).await.unwrap();
        let summary = success(vec![("type", Value::String("r".into()))]);
        server.write_all(&summary).await.unwrap();
    });

    let conn = BoltStream::from_stream(client);
    let mut results = conn.run("RETURN 1, 'a'", HashMap::new());

    assert_eq!(results.nfields().await.unwrap(), 2);
    assert_eq!(results.fieldname(0).await.unwrap(), "n");
    assert_eq!(results.fieldname(1).await.unwrap(), "m");

    let first = results.fetch_next().await.unwrap().unwrap();
    assert_eq!(first.field(0), Value::Int(1));
    assert_eq!(first.field(1), Value::String("a".into()));

    let second = results.fetch_next().await.unwrap().unwrap();
    assert_eq!(second.field(0), Value::Int(2));
    assert!(!first.is_valid(), "advancing invalidates the previous record");

    assert!(results.fetch_next().await.unwrap().is_none());
    assert!(results.fetch_next().await.unwrap().is_none());
    assert_eq!(results.check_failure(), None);

    results.close().await.unwrap();
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_statement_failure_is_sticky() {
    let (client, mut server) = duplex(8192);

    let server_task = tokio::spawn(async move {
        expect_request(&mut server, 0x10).await;
        expect_request(&mut server, 0x3F).await;

        let fail = failure(
            "Neo.ClientError.Statement.SyntaxError",
            "Invalid input 'X': expected <init>",
        );
        server.write_all(&fail).await.unwrap();

        // the client acknowledges before surfacing the failure
        expect_request(&mut server, 0x0E).await;
        server.write_all(&success(vec![])).await.unwrap();
    });

    let conn = BoltStream::from_stream(client);
    let mut results = conn.run("SYNTAX ERROR", HashMap::new());

    let err = results.fetch_next().await.err().unwrap();
    assert!(matches!(err, StreamError::Server(_)));

    assert_eq!(
        results.check_failure(),
        Some(FailureKind::StatementEvaluationFailed)
    );
    assert_eq!(
        results.error_code(),
        Some("Neo.ClientError.Statement.SyntaxError")
    );
    assert_eq!(
        results.error_message(),
        Some("Invalid input 'X': expected <init>")
    );

    // the failure repeats on every subsequent call
    assert!(results.fetch_next().await.is_err());
    assert!(results.nfields().await.is_err());
    assert_eq!(
        results.error_code(),
        Some("Neo.ClientError.Statement.SyntaxError")
    );

    results.close().await.unwrap();
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_close_mid_stream_aborts_request() {
    let (client, mut server) = duplex(8192);

    let server_task = tokio::spawn(async move {
        expect_request(&mut server, 0x10).await;
        expect_request(&mut server, 0x3F).await;

        let header = success(vec![("fields", field_names(&["n"]))]);
        server.write_all(&header).await.unwrap();
        server.write_all(&record(vec![Value::Int(1)])).await.unwrap();
        server.write_all(&record(vec![Value::Int(2)])).await.unwrap();

        // the abort must arrive even though more records were promised
        loop {
            let msg = backend::read_message(&mut server).await.unwrap();
            if msg.signature == backend::Signature::IGNORED {
                continue;
            }
            assert_eq!(u8::from(msg.signature), 0x0F, "expected reset");
            break;
        }
    });

    let conn = BoltStream::from_stream(client);
    let mut results = conn.run("MATCH (n) RETURN n", HashMap::new());

    let first = results.fetch_next().await.unwrap().unwrap();
    let kept = first.retain();

    results.close().await.unwrap();

    assert!(!kept.is_valid(), "close invalidates retained records too");
    assert_eq!(kept.field(0), Value::Null);
    assert!(matches!(
        results.fetch_next().await,
        Err(StreamError::Closed)
    ));

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_close_before_first_fetch() {
    let (client, mut server) = duplex(8192);

    let server_task = tokio::spawn(async move {
        expect_request(&mut server, 0x10).await;
        expect_request(&mut server, 0x3F).await;

        loop {
            match backend::read_message(&mut server).await {
                Ok(msg) if u8::from(msg.signature) == 0x0F => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    let conn = BoltStream::from_stream(client);
    let mut results = conn.run("RETURN 1", HashMap::new());
    results.close().await.unwrap();
    results.close().await.unwrap();

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_unexpected_message_poisons_stream() {
    let (client, mut server) = duplex(8192);

    let server_task = tokio::spawn(async move {
        expect_request(&mut server, 0x10).await;
        expect_request(&mut server, 0x3F).await;

        // a message signature that has no business in a result stream
        let garbage = message(0x66, vec![]);
        server.write_all(&garbage).await.unwrap();
    });

    let conn = BoltStream::from_stream(client);
    let mut results = conn.run("RETURN 1", HashMap::new());

    let err = results.fetch_next().await.err().unwrap();
    assert!(matches!(err, StreamError::Protocol(_)));
    assert_eq!(results.check_failure(), Some(FailureKind::ProtocolError));
    assert_eq!(results.error_code(), None);

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_server_hangup_is_connection_closed() {
    let (client, mut server) = duplex(8192);

    let server_task = tokio::spawn(async move {
        expect_request(&mut server, 0x10).await;
        expect_request(&mut server, 0x3F).await;

        let header = success(vec![("fields", field_names(&["n"]))]);
        server.write_all(&header).await.unwrap();
        // drop the connection mid-stream
    });

    let conn = BoltStream::from_stream(client);
    let mut results = conn.run("RETURN 1", HashMap::new());

    assert_eq!(results.nfields().await.unwrap(), 1);
    let err = results.fetch_next().await.err().unwrap();
    assert!(matches!(err, StreamError::ConnectionClosed));
    assert_eq!(results.check_failure(), Some(FailureKind::ConnectionClosed));

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_backpressure_does_not_lose_records() {
    let (client, mut server) = duplex(64 * 1024);

    // more records than the internal buffer holds; the driver must block on
    // the buffer, not drop or reorder
    const COUNT: i64 = 500;

    let server_task = tokio::spawn(async move {
        expect_request(&mut server, 0x10).await;
        expect_request(&mut server, 0x3F).await;

        let header = success(vec![("fields", field_names(&["i"]))]);
        server.write_all(&header).await.unwrap();
        for i in 0..COUNT {
            let rec = record(vec![Value::Int(i)]);
            server.write_all(&rec).await.unwrap();
        }
        server.write_all(&success(vec![])).await.unwrap();
    });

    let conn = BoltStream::from_stream(client);
    let mut results = conn.run("UNWIND range(0, 499) AS i RETURN i", HashMap::new());

    for i in 0..COUNT {
        let rec = results.fetch_next().await.unwrap().unwrap();
        assert_eq!(rec.field(0), Value::Int(i));
    }
    assert!(results.fetch_next().await.unwrap().is_none());

    results.close().await.unwrap();
    server_task.await.unwrap();
}
