//! Unit tests for the task runtime

use super::*;

#[test]
fn test_submit_and_await() {
    let runtime = TaskRuntime::with_threads(2);
    let id = runtime.submit(|| Ok(Value::I64(42)));
    assert_eq!(runtime.await_result(id), Ok(Value::I64(42)));
}

#[test]
fn test_task_error_reported_to_joiner() {
    let runtime = TaskRuntime::with_threads(1);
    let id = runtime.submit(|| Err(ErrorValue::new("IOError", "boom", 7)));
    let err = runtime.await_result(id).unwrap_err();
    assert_eq!(err.error_type, "IOError");
    assert_eq!(err.message, "boom");
}

#[test]
fn test_await_is_single_shot() {
    let runtime = TaskRuntime::with_threads(1);
    let id = runtime.submit(|| Ok(Value::Nil));
    runtime.await_result(id).unwrap();
    assert!(runtime.await_result(id).is_err());
}

#[test]
fn test_panicking_task_does_not_kill_the_pool() {
    let runtime = TaskRuntime::with_threads(1);
    let bad = runtime.submit(|| panic!("task body panicked"));
    assert!(runtime.await_result(bad).is_err());

    // The single worker must still be serving jobs
    let good = runtime.submit(|| Ok(Value::Bool(true)));
    assert_eq!(runtime.await_result(good), Ok(Value::Bool(true)));
}

#[test]
fn test_channel_send_recv() {
    let runtime = TaskRuntime::with_threads(2);
    let channel = runtime.create_channel();
    runtime.send(channel, Value::I64(1)).unwrap();
    runtime.send(channel, Value::I64(2)).unwrap();
    assert_eq!(runtime.recv(channel).unwrap(), Value::I64(1));
    assert_eq!(runtime.recv(channel).unwrap(), Value::I64(2));
    assert_eq!(runtime.try_recv(channel).unwrap(), None);
}

#[test]
fn test_channel_close_drains_then_fails() {
    let runtime = TaskRuntime::with_threads(1);
    let channel = runtime.create_channel();
    runtime.send(channel, Value::I64(1)).unwrap();
    runtime.close_channel(channel).unwrap();

    assert!(runtime.send(channel, Value::I64(2)).is_err());
    assert_eq!(runtime.recv(channel).unwrap(), Value::I64(1));
    let err = runtime.recv(channel).unwrap_err();
    assert_eq!(err.error_type, "ChannelClosed");
}

#[test]
fn test_blocking_recv_waits_for_producer() {
    let runtime = Arc::new(TaskRuntime::with_threads(2));
    let channel = runtime.create_channel();

    let producer = {
        let runtime = Arc::clone(&runtime);
        runtime.clone().submit(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            runtime.send(channel, Value::I64(9))?;
            Ok(Value::Nil)
        })
    };

    // Blocks until the producer task delivers
    assert_eq!(runtime.recv(channel).unwrap(), Value::I64(9));
    runtime.await_result(producer).unwrap();
}

#[test]
fn test_many_tasks_all_complete() {
    let runtime = TaskRuntime::with_threads(4);
    let ids: Vec<_> = (0..32)
        .map(|i| runtime.submit(move || Ok(Value::I64(i))))
        .collect();
    for (i, id) in ids.into_iter().enumerate() {
        assert_eq!(runtime.await_result(id), Ok(Value::I64(i as i64)));
    }
}
