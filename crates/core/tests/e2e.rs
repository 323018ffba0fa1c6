//! End-to-end tests: a real server and client talking Triple over loopback
//! TCP, covering each call shape and the failure paths a client can
//! observe.

use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use trirpc_core::handler::{RpcMethodHandler, RpcServiceHandler};
use trirpc_core::invocation::{
    DeserializeFn, SerializeFn, deserialize_with, raw_deserializer, raw_serializer, serialize_with,
};
use trirpc_core::{Client, ReadOutcome, RpcCode, Server};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Request {
    name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reply {
    message: String,
}

fn json_ser<T: Serialize + Send + Sync + 'static>() -> SerializeFn<T> {
    serialize_with(|value: &T| Ok(serde_json::to_vec(value)?))
}

fn json_de<T: DeserializeOwned + Send + Sync + 'static>() -> DeserializeFn<T> {
    deserialize_with(|payload: &[u8]| Ok(serde_json::from_slice(payload)?))
}

fn greeter_service() -> RpcServiceHandler {
    RpcServiceHandler::new(
        "org.apache.dubbo.samples.data.Greeter",
        vec![
            RpcMethodHandler::unary(
                "sayHello",
                |request: Request| {
                    Ok(Reply {
                        message: format!("Hello, {}!", request.name),
                    })
                },
                json_de(),
                json_ser(),
            ),
            RpcMethodHandler::unary(
                "fail",
                |_request: Request| -> Result<Reply, trirpc_core::BoxedError> {
                    Err("bad".into())
                },
                json_de(),
                json_ser(),
            ),
            RpcMethodHandler::server_stream(
                "split",
                |request: Request| {
                    Ok(request
                        .name
                        .split_whitespace()
                        .map(|word| Reply {
                            message: word.to_owned(),
                        })
                        .collect())
                },
                json_de(),
                json_ser(),
            ),
        ],
    )
}

fn math_service() -> RpcServiceHandler {
    RpcServiceHandler::new(
        "Math",
        vec![
            RpcMethodHandler::client_stream(
                "Sum",
                |stream| {
                    let mut sum = 0i64;
                    loop {
                        match stream.read()? {
                            ReadOutcome::Message(value) => sum += value,
                            ReadOutcome::Eof => break,
                            ReadOutcome::TimedOut => continue,
                        }
                    }
                    Ok(sum)
                },
                json_de::<i64>(),
                json_ser::<i64>(),
            ),
            RpcMethodHandler::bi_stream(
                "Double",
                |stream| {
                    loop {
                        match stream.read()? {
                            ReadOutcome::Message(value) => stream.write(value * 2)?,
                            ReadOutcome::Eof => break,
                            ReadOutcome::TimedOut => continue,
                        }
                    }
                    Ok(Vec::new())
                },
                json_de::<i64>(),
                json_ser::<i64>(),
            ),
        ],
    )
}

fn echo_service() -> RpcServiceHandler {
    RpcServiceHandler::new(
        "demo.Echo",
        vec![
            RpcMethodHandler::unary(
                "echo",
                |payload: Vec<u8>| Ok(payload),
                raw_deserializer(),
                raw_serializer(),
            ),
            RpcMethodHandler::bi_stream(
                "echoAll",
                |stream| {
                    loop {
                        match stream.read()? {
                            ReadOutcome::Message(payload) => stream.write(payload)?,
                            ReadOutcome::Eof => break,
                            ReadOutcome::TimedOut => continue,
                        }
                    }
                    Ok(Vec::new())
                },
                raw_deserializer(),
                raw_serializer(),
            ),
        ],
    )
}

fn start_server() -> Server {
    Server::builder()
        .bind("127.0.0.1:0")
        .register(greeter_service())
        .register(math_service())
        .register(echo_service())
        .start()
        .expect("server failed to start")
}

fn connect(server: &Server, service: &str) -> Client {
    Client::connect(server.local_addr().to_string(), service).expect("connect failed")
}

#[test]
fn unary_echo() {
    let server = start_server();
    let client = connect(&server, "org.apache.dubbo.samples.data.Greeter");
    let say_hello = client.unary::<Request, Reply>("sayHello", json_ser(), json_de());

    let reply = say_hello
        .call(Request {
            name: "world".to_owned(),
        })
        .unwrap();
    assert_eq!(reply.message, "Hello, world!");

    // The connection multiplexes: a second call on the same client works.
    let reply = say_hello
        .call(Request {
            name: "again".to_owned(),
        })
        .unwrap();
    assert_eq!(reply.message, "Hello, again!");
    server.shutdown();
}

#[test]
fn client_stream_sum() {
    let server = start_server();
    let client = connect(&server, "Math");
    let sum = client.client_stream::<i64, i64>("Sum", json_ser(), json_de());

    let call = sum.call().unwrap();
    for value in [1i64, 2, 3] {
        call.write(value).unwrap();
    }
    call.done_writing().unwrap();

    match call.read_timeout(Duration::from_secs(10)).unwrap() {
        ReadOutcome::Message(total) => assert_eq!(total, 6),
        other => panic!("expected the sum, got {other:?}"),
    }
    assert_eq!(call.read().unwrap(), ReadOutcome::Eof);
    server.shutdown();
}

#[test]
fn server_stream_split() {
    let server = start_server();
    let client = connect(&server, "org.apache.dubbo.samples.data.Greeter");
    let split = client.server_stream::<Request, Reply>("split", json_ser(), json_de());

    let responses = split
        .call(Request {
            name: "a b c".to_owned(),
        })
        .unwrap();

    let collected: Vec<String> = responses.map(|r| r.unwrap().message).collect();
    assert_eq!(collected, vec!["a", "b", "c"]);
    server.shutdown();
}

#[test]
fn bidi_stream_doubles_in_order() {
    let server = start_server();
    let client = connect(&server, "Math");
    let double = client.bi_stream::<i64, i64>("Double", json_ser(), json_de());

    let call = double.call().unwrap();
    for value in 0..20i64 {
        call.write(value).unwrap();
    }
    call.done_writing().unwrap();

    let mut received = Vec::new();
    loop {
        match call.read_timeout(Duration::from_secs(10)).unwrap() {
            ReadOutcome::Message(value) => received.push(value),
            ReadOutcome::Eof => break,
            ReadOutcome::TimedOut => panic!("timed out waiting for doubles"),
        }
    }
    let expected: Vec<i64> = (0..20).map(|v| v * 2).collect();
    assert_eq!(received, expected);
    server.shutdown();
}

#[test]
fn bidi_stream_with_multi_megabyte_messages() {
    // Each message dwarfs the 64 KiB initial windows, so this drives the
    // flow controller through starvation and WINDOW_UPDATE replenishment in
    // both directions.
    let server = start_server();
    let client = connect(&server, "demo.Echo");
    let echo_all = client.bi_stream::<Vec<u8>, Vec<u8>>("echoAll", raw_serializer(), raw_deserializer());

    let call = echo_all.call().unwrap();
    let first = vec![0xabu8; 3 * 1024 * 1024];
    let second = vec![0xcdu8; 3 * 1024 * 1024];
    call.write(first.clone()).unwrap();
    call.write(second.clone()).unwrap();
    call.done_writing().unwrap();

    match call.read_timeout(Duration::from_secs(30)).unwrap() {
        ReadOutcome::Message(payload) => assert_eq!(payload, first),
        other => panic!("expected first echo, got {other:?}"),
    }
    match call.read_timeout(Duration::from_secs(30)).unwrap() {
        ReadOutcome::Message(payload) => assert_eq!(payload, second),
        other => panic!("expected second echo, got {other:?}"),
    }
    assert_eq!(call.read().unwrap(), ReadOutcome::Eof);
    server.shutdown();
}

#[test]
fn oversized_message_fails_without_poisoning_the_connection() {
    let server = start_server();
    let client = connect(&server, "demo.Echo");
    let echo = client.unary::<Vec<u8>, Vec<u8>>("echo", raw_serializer(), raw_deserializer());

    let err = echo.call(vec![0u8; 5 * 1024 * 1024]).unwrap_err();
    assert_eq!(err.code, RpcCode::InvalidArgument);
    assert!(err.message.contains("message too large"));

    // Sibling calls on the same connection stay healthy.
    let reply = echo.call(b"still alive".to_vec()).unwrap();
    assert_eq!(reply, b"still alive");
    server.shutdown();
}

#[test]
fn failing_handler_surfaces_internal_status() {
    let server = start_server();
    let client = connect(&server, "org.apache.dubbo.samples.data.Greeter");
    let fail = client.unary::<Request, Reply>("fail", json_ser(), json_de());

    let err = fail
        .call(Request {
            name: "x".to_owned(),
        })
        .unwrap_err();
    assert_eq!(err.code, RpcCode::Internal);
    assert!(
        err.message.contains("Invoke method failed: bad"),
        "unexpected message: {}",
        err.message
    );
    server.shutdown();
}

#[test]
fn unknown_method_is_unimplemented() {
    let server = start_server();
    let client = connect(&server, "org.apache.dubbo.samples.data.Greeter");
    let missing = client.unary::<Request, Reply>("nope", json_ser(), json_de());

    let err = missing
        .call(Request {
            name: "x".to_owned(),
        })
        .unwrap_err();
    assert_eq!(err.code, RpcCode::Unimplemented);
    server.shutdown();
}

#[test]
fn unknown_service_is_unimplemented() {
    let server = start_server();
    let client = connect(&server, "demo.Missing");
    let nope = client.unary::<Vec<u8>, Vec<u8>>("echo", raw_serializer(), raw_deserializer());

    let err = nope.call(b"x".to_vec()).unwrap_err();
    assert_eq!(err.code, RpcCode::Unimplemented);
    server.shutdown();
}

#[test]
fn gzip_compressed_requests_round_trip() {
    let server = start_server();
    let client = Client::builder(server.local_addr().to_string(), "demo.Echo")
        .compression("gzip")
        .connect()
        .unwrap();
    let echo = client.unary::<Vec<u8>, Vec<u8>>("echo", raw_serializer(), raw_deserializer());

    let payload = vec![b'z'; 256 * 1024];
    assert_eq!(echo.call(payload.clone()).unwrap(), payload);
    server.shutdown();
}

#[test]
fn gzip_compressed_responses_round_trip() {
    let server = Server::builder()
        .bind("127.0.0.1:0")
        .register(echo_service())
        .response_compression("gzip")
        .start()
        .unwrap();
    let client = connect(&server, "demo.Echo");
    let echo = client.unary::<Vec<u8>, Vec<u8>>("echo", raw_serializer(), raw_deserializer());

    let payload = vec![b'y'; 128 * 1024];
    assert_eq!(echo.call(payload.clone()).unwrap(), payload);
    server.shutdown();
}

#[test]
fn unknown_compressor_fails_before_any_stream_work() {
    let server = start_server();
    let client = Client::builder(server.local_addr().to_string(), "demo.Echo")
        .compression("snappy")
        .connect()
        .unwrap();
    let echo = client.unary::<Vec<u8>, Vec<u8>>("echo", raw_serializer(), raw_deserializer());

    let err = echo.call(b"x".to_vec()).unwrap_err();
    assert_eq!(err.code, RpcCode::Unimplemented);
    server.shutdown();
}

#[test]
fn server_shutdown_fails_inflight_calls_with_unavailable() {
    let server = start_server();
    let client = connect(&server, "Math");
    let double = client.bi_stream::<i64, i64>("Double", json_ser(), json_de());
    let call = double.call().unwrap();
    call.write(1).unwrap();
    match call.read_timeout(Duration::from_secs(10)).unwrap() {
        ReadOutcome::Message(value) => assert_eq!(value, 2),
        other => panic!("expected an echo, got {other:?}"),
    }

    // Drop the server outright; its connections die with it.
    drop(server);

    // The open call observes the connection going away.
    let outcome = call.read_timeout(Duration::from_secs(10));
    match outcome {
        Err(err) => assert_eq!(err.code, RpcCode::Unavailable),
        Ok(ReadOutcome::Eof) => {}
        Ok(other) => panic!("expected a terminal event, got {other:?}"),
    }
    client.close();
}
