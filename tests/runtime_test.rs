//! End-to-end tests: a runtime with the debug module, driven by real clients
//! over every transport.

use std::time::Duration;

use futures_util::StreamExt;
use switchboard::modules::{self, debug};
use switchboard::{
    BrokerClient, Module, Packet, PacketType, Runtime, RuntimeConfig, RuntimeHandle, SchedulingMode,
    Target, Value,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn start(endpoint: &str) -> Runtime {
    let config = RuntimeConfig::with_endpoint(endpoint);
    Runtime::start(&config, modules::builtin()).await.unwrap()
}

fn vocab_args() -> Value {
    let pieces: Value = [("What", 3838), (" is", 374), (" your", 697), (" name", 829), ("?", 30)]
        .into_iter()
        .collect();
    [("vocab", pieces)].into_iter().collect()
}

fn text(s: &str) -> Value {
    [("text", s)].into_iter().collect()
}

/// Every `respond_execute` of `tx` up to and including the terminal one.
async fn collect_responses(client: &mut BrokerClient, tx: &str) -> Vec<Packet> {
    let mut packets = Vec::new();
    loop {
        let packet = tokio::time::timeout(TEST_TIMEOUT, client.wait_for(tx))
            .await
            .expect("no response within the test timeout")
            .unwrap();
        let terminal = packet.is_terminal();
        packets.push(packet);
        if terminal {
            return packets;
        }
    }
}

async fn define_tokenizer(client: &mut BrokerClient, name: &str) -> Result<Value, switchboard::ClientError> {
    let packet = Packet::define_component(switchboard::protocol::new_transaction_id(), "tokenizer", name, vocab_args());
    client.call(packet).await
}

// ─── Scenarios ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_tokenizer_encode_decode() {
    let mut runtime = start("inproc://encode-decode").await;
    let mut client = runtime.connect().await.unwrap();

    let defined = define_tokenizer(&mut client, "t1").await.unwrap();
    assert_eq!(defined.get("component").and_then(Value::as_str), Some("t1"));
    assert_eq!(defined.get("type").and_then(Value::as_str), Some("tokenizer"));

    let encode = Packet::call_method("tx-encode", "t1", "encode", text("What is your name?"));
    let encoded = client.call(encode).await.unwrap();
    let expected: Value = [("tokens", vec![3838, 374, 697, 829, 30])].into_iter().collect();
    assert_eq!(encoded, expected);

    let decode = Packet::call_method("tx-decode", "t1", "decode", encoded);
    let decoded = client.call(decode).await.unwrap();
    assert_eq!(decoded, text("What is your name?"));

    client.disconnect().await.unwrap();
    runtime.stop().await;
}

#[tokio::test]
async fn test_unknown_component_is_not_found_and_isolated() {
    let mut runtime = start("inproc://unknown-target").await;
    let mut client = runtime.connect().await.unwrap();
    define_tokenizer(&mut client, "t1").await.unwrap();

    let tx = client.call_method("missing", "encode", Value::map()).unwrap();
    let packets = collect_responses(&mut client, &tx).await;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::RespondExecute);
    assert!(!packets[0].status());
    assert_eq!(packets[0].error().unwrap().code, "NotFound");

    let encoded = client
        .call(Packet::call_method("tx-after", "t1", "encode", text("What?")))
        .await
        .unwrap();
    let expected: Value = [("tokens", vec![3838, 30])].into_iter().collect();
    assert_eq!(encoded, expected);

    runtime.stop().await;
}

#[tokio::test]
async fn test_component_names_are_unique_until_deleted() {
    let mut runtime = start("inproc://uniqueness").await;
    let mut client = runtime.connect().await.unwrap();

    define_tokenizer(&mut client, "t1").await.unwrap();
    let again = define_tokenizer(&mut client, "t1").await.unwrap_err();
    assert_eq!(again.remote_code(), Some("AlreadyExists"));

    let deleted = client
        .call(Packet::delete_component("tx-delete", "t1"))
        .await
        .unwrap();
    assert!(deleted.is_null());

    define_tokenizer(&mut client, "t1").await.unwrap();

    let missing = client
        .call(Packet::delete_component("tx-delete-missing", "nope"))
        .await
        .unwrap_err();
    assert_eq!(missing.remote_code(), Some("NotFound"));

    runtime.stop().await;
}

#[tokio::test]
async fn test_unknown_component_type_and_bad_factory_args() {
    let mut runtime = start("inproc://factory-errors").await;
    let mut client = runtime.connect().await.unwrap();

    let unknown = Packet::define_component("tx-unknown", "nonexistent", "x", Value::map());
    let err = client.call(unknown).await.unwrap_err();
    assert_eq!(err.remote_code(), Some("UnknownComponentType"));

    let no_vocab = Packet::define_component("tx-no-vocab", "tokenizer", "t1", Value::map());
    let err = client.call(no_vocab).await.unwrap_err();
    assert_eq!(err.remote_code(), Some("RangeError"));

    // The failed factory must not reserve the name.
    define_tokenizer(&mut client, "t1").await.unwrap();

    runtime.stop().await;
}

// ─── Streaming ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_streaming_ends_with_one_done_and_gapless_sequence() {
    let mut runtime = start("inproc://streaming").await;
    let mut caller = runtime.connect().await.unwrap();
    let mut watcher = runtime.connect().await.unwrap();
    watcher.subscribe(&Target::function("spell")).await.unwrap();

    let tx = caller.call_function("spell", text("hello")).unwrap();

    for client in [&mut caller, &mut watcher] {
        let packets = collect_responses(client, &tx).await;
        let letters: String = packets
            .iter()
            .filter_map(|p| p.output()?.get("text")?.as_str().map(str::to_owned))
            .collect();
        assert_eq!(letters, "hello");

        let done: Vec<bool> = packets.iter().map(Packet::done).collect();
        assert_eq!(done, vec![false, false, false, false, true]);
        assert!(packets.iter().all(Packet::status));

        let sequences: Vec<u32> = packets.iter().map(|p| p.sequence.unwrap()).collect();
        for pair in sequences.windows(2) {
            assert_eq!(pair[1], pair[0] + 1, "sequence gap in {sequences:?}");
        }
    }

    runtime.stop().await;
}

#[tokio::test]
async fn test_component_streaming_method() {
    let mut runtime = start("inproc://replay").await;
    let mut client = runtime.connect().await.unwrap();

    let define = Packet::define_component("tx-define", "accumulator", "acc", Value::map());
    client.call(define).await.unwrap();
    for s in ["a", "b", "c"] {
        let put: Value = [("s", s)].into_iter().collect();
        client.call(Packet::call_method(format!("tx-put-{s}"), "acc", "put", put)).await.unwrap();
    }

    let outputs: Vec<_> = client
        .call_stream(Packet::call_method("tx-replay", "acc", "replay", Value::Null))
        .unwrap()
        .collect()
        .await;
    let replayed: Vec<String> = outputs
        .into_iter()
        .map(|output| output.unwrap().get("s").and_then(Value::as_str).unwrap().to_string())
        .collect();
    assert_eq!(replayed, ["a", "b", "c"]);

    let got = client.call(Packet::call_method("tx-get", "acc", "get", Value::Null)).await.unwrap();
    assert_eq!(got, text("abc"));

    runtime.stop().await;
}

#[tokio::test]
async fn test_streaming_failure_is_terminal() {
    let mut runtime = start("inproc://stream-failure").await;
    let mut client = runtime.connect().await.unwrap();

    let args: Value = [("count", -1)].into_iter().collect();
    let tx = client.call_function("ticker", args).unwrap();
    let packets = collect_responses(&mut client, &tx).await;
    assert_eq!(packets.len(), 1);
    assert!(!packets[0].status());
    assert!(!packets[0].done());
    assert_eq!(packets[0].error().unwrap().code, "RangeError");

    runtime.stop().await;
}

#[tokio::test]
async fn test_stream_failure_after_outputs_keeps_sequence_gapless() {
    let mut runtime = start("inproc://stream-fails-midway").await;
    let mut caller = runtime.connect().await.unwrap();
    let mut watcher = runtime.connect().await.unwrap();
    watcher.subscribe(&Target::function("ticker")).await.unwrap();

    let args: Value = [("count", 10), ("interval_ms", 0), ("fail_at", 3)].into_iter().collect();
    let tx = caller.call_function("ticker", args).unwrap();

    for client in [&mut caller, &mut watcher] {
        let packets = collect_responses(client, &tx).await;
        let sequences: Vec<u32> = packets.iter().map(|p| p.sequence.unwrap()).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);

        let ticks: Vec<i64> = packets[..3]
            .iter()
            .map(|p| p.output().and_then(|o| o.get("tick")).and_then(Value::as_i64).unwrap())
            .collect();
        assert_eq!(ticks, vec![0, 1, 2]);
        assert!(packets[..3].iter().all(Packet::status));

        let last = &packets[3];
        assert!(!last.status());
        assert!(!last.done());
        assert!(packets.iter().all(|p| !p.done()));
        let err = last.error().unwrap();
        assert_eq!(err.code, "OperatorError");
        assert_eq!(err.detail, "ticker failed at tick 3");
    }

    runtime.stop().await;
}

#[tokio::test]
async fn test_slow_reader_receives_every_response() {
    let config = RuntimeConfig {
        mailbox_capacity: 8,
        ..RuntimeConfig::with_endpoint("inproc://slow-reader")
    };
    let mut runtime = Runtime::start(&config, modules::builtin()).await.unwrap();
    let mut client = runtime.connect().await.unwrap();

    let word = "x".repeat(300);
    let tx = client.call_function("spell", text(&word)).unwrap();
    // Let the VM run far ahead of the client's queue.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let packets = collect_responses(&mut client, &tx).await;
    assert_eq!(packets.len(), 300);
    let sequences: Vec<u32> = packets.iter().map(|p| p.sequence.unwrap()).collect();
    assert_eq!(sequences, (0..300).collect::<Vec<u32>>());
    assert!(packets.last().unwrap().done());
    assert!(packets.iter().all(Packet::status));

    runtime.stop().await;
}

// ─── Fan-out ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fan_out_to_subscribers() {
    let mut runtime = start("inproc://fan-out").await;
    let mut first = runtime.connect().await.unwrap();
    let mut second = runtime.connect().await.unwrap();
    let mut caller = runtime.connect().await.unwrap();

    define_tokenizer(&mut caller, "t1").await.unwrap();
    let target = Target::method("t1", "encode");
    first.subscribe(&target).await.unwrap();
    second.subscribe(&target).await.unwrap();

    let tx = caller.call_method("t1", "encode", text("What is your name?")).unwrap();
    let from_caller = collect_responses(&mut caller, &tx).await;
    let from_first = collect_responses(&mut first, &tx).await;
    let from_second = collect_responses(&mut second, &tx).await;
    assert_eq!(from_first, from_caller);
    assert_eq!(from_second, from_caller);

    // After unsubscribing, the next transaction reaches only the caller.
    first.unsubscribe(&target).await.unwrap();
    let err = first.unsubscribe(&target).await.unwrap_err();
    assert_eq!(err.remote_code(), Some("NotFound"));

    let tx = caller.call_method("t1", "encode", text("?")).unwrap();
    collect_responses(&mut caller, &tx).await;
    collect_responses(&mut second, &tx).await;
    let stray = first.listen(Some(Duration::from_millis(100))).await.unwrap();
    assert!(stray.is_none(), "unsubscribed client received {stray:?}");

    runtime.stop().await;
}

// ─── Cancellation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_stops_streaming_function() {
    let mut runtime = start("inproc://cancel").await;
    let mut client = runtime.connect().await.unwrap();

    let args: Value = [("count", 10_000), ("interval_ms", 10)].into_iter().collect();
    let tx = client.call_function("ticker", args).unwrap();
    let first = tokio::time::timeout(TEST_TIMEOUT, client.wait_for(&tx)).await.unwrap().unwrap();
    assert!(first.status());
    assert!(!first.done());

    client.cancel(&tx).await.unwrap();
    let rest = collect_responses(&mut client, &tx).await;
    let last = rest.last().unwrap();
    assert!(!last.done());
    assert_eq!(last.error().unwrap().code, "Cancelled");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = client.cancel(&tx).await.unwrap_err();
    assert_eq!(err.remote_code(), Some("UnknownTarget"));

    runtime.stop().await;
}

#[tokio::test]
async fn test_delete_cancels_running_method_before_replying() {
    let mut runtime = start("inproc://delete-while-streaming").await;
    let mut client = runtime.connect().await.unwrap();

    client
        .call(Packet::define_component("tx-define", "accumulator", "acc", Value::map()))
        .await
        .unwrap();
    for s in ["a", "b", "c", "d"] {
        let put: Value = [("s", s)].into_iter().collect();
        client.call(Packet::call_method(format!("tx-put-{s}"), "acc", "put", put)).await.unwrap();
    }

    let args: Value = [("interval_ms", 150)].into_iter().collect();
    let replay = client.call_method("acc", "replay", args).unwrap();
    let first = tokio::time::timeout(TEST_TIMEOUT, client.wait_for(&replay)).await.unwrap().unwrap();
    assert!(first.status());
    assert!(!first.done());

    let delete = client.delete_component("acc").unwrap();
    let mut arrivals = Vec::new();
    loop {
        let packet = client
            .listen(Some(TEST_TIMEOUT))
            .await
            .unwrap()
            .expect("no response within the test timeout");
        let finished = packet.transaction_id == delete && packet.is_terminal();
        arrivals.push(packet);
        if finished {
            break;
        }
    }

    let replay_rest: Vec<&Packet> = arrivals.iter().filter(|p| p.transaction_id == replay).collect();
    let stream_end = replay_rest.last().expect("replay produced no terminal response");
    assert!(stream_end.is_terminal());
    assert!(!stream_end.done());
    assert_eq!(stream_end.error().unwrap().code, "Cancelled");
    assert!(replay_rest.iter().all(|p| !p.done()));

    let end_index = arrivals.iter().position(|p| p.transaction_id == replay && p.is_terminal()).unwrap();
    let delete_index = arrivals.iter().position(|p| p.transaction_id == delete).unwrap();
    assert!(end_index < delete_index, "delete acknowledged before the running call ended");

    let deleted = &arrivals[delete_index];
    assert!(deleted.done());
    assert_eq!(deleted.output(), Some(&Value::Null));

    let gone = client
        .call(Packet::call_method("tx-get", "acc", "get", Value::Null))
        .await
        .unwrap_err();
    assert_eq!(gone.remote_code(), Some("NotFound"));

    runtime.stop().await;
}

#[tokio::test]
async fn test_cancel_unknown_transaction() {
    let mut runtime = start("inproc://cancel-unknown").await;
    let mut client = runtime.connect().await.unwrap();

    let err = client.cancel("never-sent").await.unwrap_err();
    assert_eq!(err.remote_code(), Some("UnknownTarget"));

    runtime.stop().await;
}

// ─── Transports ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_tcp_transport() {
    let mut runtime = start("tcp://127.0.0.1:0").await;
    let url = runtime.endpoint().to_string();
    assert!(url.starts_with("tcp://127.0.0.1:"));
    assert!(!url.ends_with(":0"), "port was not resolved: {url}");

    let mut client = BrokerClient::connect_url(&url, Duration::from_secs(1)).await.unwrap();
    let echoed = client.call(Packet::call_function("tx-echo", "echo", text("over tcp"))).await.unwrap();
    assert_eq!(echoed, text("over tcp"));
    client.disconnect().await.unwrap();

    runtime.stop().await;
}

#[tokio::test]
async fn test_unix_transport() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("ipc://{}", dir.path().join("switchboard.sock").display());
    let mut runtime = start(&url).await;

    let mut client = runtime.connect().await.unwrap();
    let outputs: Vec<_> = client
        .call_stream(Packet::call_function("tx-spell", "spell", text("ipc")))
        .unwrap()
        .collect()
        .await;
    assert_eq!(outputs.len(), 3);
    assert!(outputs.iter().all(Result::is_ok));
    drop(client);

    runtime.stop().await;
}

// ─── Lifecycle ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_is_idempotent() {
    let mut runtime = start("inproc://stop-twice").await;
    assert!(runtime.is_running());
    let _client = runtime.connect().await.unwrap();

    runtime.stop().await;
    assert!(!runtime.is_running());
    runtime.stop().await;
    assert!(!runtime.is_running());

    assert!(runtime.connect().await.is_err());
}

#[tokio::test]
async fn test_duplicate_function_names_fail_start() {
    let config = RuntimeConfig::with_endpoint("inproc://duplicates");
    let clash = Module::new("clash").instant("echo", Ok);
    let result = Runtime::start(&config, vec![debug::module(), clash]).await;
    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("echo"), "unexpected error: {err:#}");
}

#[test]
fn test_runtime_handle_cooperative() {
    let mut config = RuntimeConfig::with_endpoint("inproc://cooperative");
    config.scheduling = SchedulingMode::Cooperative;
    let mut handle = RuntimeHandle::start(config, modules::builtin()).unwrap();

    let mut client = handle.connect().unwrap();
    let echoed = handle
        .block_on(client.call(Packet::call_function("tx-echo", "echo", text("blocking"))))
        .unwrap();
    assert_eq!(echoed, text("blocking"));

    let args: Value = [("count", 3), ("interval_ms", 1)].into_iter().collect();
    let ticks: Vec<_> = handle.block_on(async {
        client
            .call_stream(Packet::call_function("tx-ticker", "ticker", args))
            .unwrap()
            .collect::<Vec<_>>()
            .await
    });
    assert_eq!(ticks.len(), 3);

    handle.stop();
    handle.stop();
}

#[test]
fn test_runtime_handle_multi_thread_drop_stops() {
    let handle = RuntimeHandle::start(RuntimeConfig::with_endpoint("inproc://drop"), modules::builtin()).unwrap();
    let mut client = handle.connect().unwrap();
    let result = handle.block_on(client.call(Packet::call_function("tx-echo", "echo", text("x"))));
    assert_eq!(result.unwrap(), text("x"));
    drop(client);
    drop(handle);
}
