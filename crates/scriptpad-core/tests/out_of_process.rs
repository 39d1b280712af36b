//! Integration tests for the out-of-process host.
//!
//! These need the scriptpad-host binary. Run `cargo build -p scriptpad-host`
//! first, then `cargo test -- --ignored`.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{TestEngine, all_text, errors, wait_for_status};
use scriptpad_core::{EnvironmentEvent, RunOptions, Status};
use tokio::sync::broadcast;

fn host_starts(events: &mut broadcast::Receiver<EnvironmentEvent>) -> usize {
    let mut starts = 0;
    while let Ok(event) = events.try_recv() {
        if let EnvironmentEvent::HostLifetime { running: true, .. } = event {
            starts += 1;
        }
    }
    starts
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires scriptpad-host binary"]
async fn test_hello_world_in_host_process() {
    let engine = TestEngine::out_of_process();
    let env = engine.open("hello", r#"println!("Hello World"); dump(&(1, "two"));"#);
    let mut output = env.subscribe_output();

    let result = env.run(RunOptions::default()).await.unwrap();

    assert!(result.is_success(), "{:?}", result);
    assert_eq!(env.status(), Status::Ready);
    let events = output.drain();
    assert!(all_text(&events).contains("Hello World"));
    assert!(all_text(&events).contains("\"two\""));
    env.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires scriptpad-host binary"]
async fn test_host_is_reused_between_runs() {
    let engine = TestEngine::out_of_process();
    let env = engine.open("reuse", "dump(&1);");
    let mut events = env.subscribe_events();

    for _ in 0..3 {
        assert!(env.run(RunOptions::default()).await.unwrap().is_success());
    }
    assert_eq!(host_starts(&mut events), 1);
    env.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires scriptpad-host binary"]
async fn test_restart_on_every_run() {
    let engine = TestEngine::with_config(|config| {
        config.host.kind = scriptpad_core::HostKind::OutOfProcess;
        config.host.restart_host_on_every_run = true;
    });
    let env = engine.open("fresh", "dump(&1);");
    let mut events = env.subscribe_events();

    for _ in 0..2 {
        assert!(env.run(RunOptions::default()).await.unwrap().is_success());
    }
    assert_eq!(host_starts(&mut events), 2);
    env.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires scriptpad-host binary"]
async fn test_script_requested_restart() {
    let engine = TestEngine::out_of_process();
    let env = engine.open("restart", "restart_host_on_next_run();");
    let mut events = env.subscribe_events();

    for _ in 0..2 {
        assert!(env.run(RunOptions::default()).await.unwrap().is_success());
    }
    assert_eq!(host_starts(&mut events), 2);
    env.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires scriptpad-host binary"]
async fn test_crash_is_reported_and_recovered() {
    let engine = TestEngine::out_of_process();
    let env = engine.open("crash", "std::process::abort();");
    let mut output = env.subscribe_output();

    let result = env.run(RunOptions::default()).await.unwrap();
    assert!(!result.is_run_attempt_successful);
    assert_eq!(env.status(), Status::Error);
    assert!(
        errors(&output.drain())
            .iter()
            .any(|m| m.contains("script host process stopped unexpectedly"))
    );

    env.update_script(|script| script.update_code("dump(&\"recovered\");"))
        .unwrap();
    let result = env.run(RunOptions::default()).await.unwrap();
    assert!(result.is_success());
    assert!(all_text(&output.drain()).contains("recovered"));
    env.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires scriptpad-host binary"]
async fn test_stdout_writes_do_not_corrupt_ipc() {
    let engine = TestEngine::out_of_process();
    let env = engine.open(
        "raw-stdout",
        "use std::io::Write;\nstd::io::stdout().write_all(b\"raw bytes\\n\")?;\ndump(&\"after\");",
    );
    let mut output = env.subscribe_output();

    let result = env.run(RunOptions::default()).await.unwrap();
    assert!(result.is_success(), "{:?}", result);
    assert!(all_text(&output.drain()).contains("after"));
    env.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires scriptpad-host binary"]
async fn test_ignored_cancel_kills_host() {
    let engine = TestEngine::with_config(|config| {
        config.host.kind = scriptpad_core::HostKind::OutOfProcess;
        config.host.cancel_grace_period_ms = 300;
    });
    let env = engine.open(
        "stubborn",
        "loop { std::thread::sleep(std::time::Duration::from_millis(10)); }",
    );
    let mut events = env.subscribe_events();

    let running = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.run(RunOptions::default()).await })
    };
    wait_for_status(&mut events, Status::Running, Duration::from_secs(60)).await;

    let cancelled_at = Instant::now();
    assert!(env.cancel());
    let result = running.await.unwrap().unwrap();

    assert!(result.is_run_cancelled);
    assert!(cancelled_at.elapsed() < Duration::from_secs(5));
    assert_eq!(env.status(), Status::Ready);

    let exits = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, EnvironmentEvent::HostLifetime { running: false, .. }))
        .count();
    assert_eq!(exits, 1);

    env.update_script(|script| script.update_code("dump(&1);")).unwrap();
    assert!(env.run(RunOptions::default()).await.unwrap().is_success());
    env.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires scriptpad-host binary"]
async fn test_user_input_crosses_process_boundary() {
    let engine = TestEngine::out_of_process();
    let env = engine.open(
        "ask",
        "let answer = console::prompt(\"answer? \");\ndump(&answer);",
    );
    let mut events = env.subscribe_events();
    let mut output = env.subscribe_output();

    let running = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.run(RunOptions::default()).await })
    };
    let prompt = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if let Ok(EnvironmentEvent::InputRequested { prompt, .. }) = events.recv().await {
                return prompt;
            }
        }
    })
    .await
    .expect("host never forwarded the input request");
    assert_eq!(prompt, "answer? ");

    assert!(env.provide_input("42").unwrap());
    let result = running.await.unwrap().unwrap();
    assert!(result.is_success(), "{:?}", result);
    assert!(all_text(&output.drain()).contains("\"42\""));
    env.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires scriptpad-host binary"]
async fn test_pooled_session() {
    let engine = TestEngine::with_config(|config| {
        config.host.kind = scriptpad_core::HostKind::OutOfProcess;
        config.host.pool_size = 2;
    });
    engine.session.warm_pool().await.unwrap();

    let first = engine.open("pooled-1", "dump(&1);");
    let second = engine.open("pooled-2", "dump(&2);");
    let (a, b) = tokio::join!(
        first.run(RunOptions::default()),
        second.run(RunOptions::default())
    );
    assert!(a.unwrap().is_success());
    assert!(b.unwrap().is_success());
    engine.session.close_all().await;
}
