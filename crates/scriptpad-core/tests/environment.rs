//! Integration tests for the script environment with the in-process host.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{TestEngine, all_text, drain_statuses, errors, wait_for_status};
use scriptpad_core::{
    Error, EnvironmentCommand, EnvironmentEvent, ModuleRegistry, OutputChannel, OutputPayload,
    RunOptions, ScriptConfig, ScriptKind, Status,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hello_world_emits_one_log_event() {
    let engine = TestEngine::new();
    let env = engine.open("hello", r#"println!("Hello World");"#);
    let mut output = env.subscribe_output();

    let result = env.run(RunOptions::default()).await.unwrap();

    assert!(result.is_run_attempt_successful);
    assert!(result.is_script_completed_successfully);
    assert!(!result.is_run_cancelled);
    assert_eq!(env.status(), Status::Ready);

    let events = output.drain();
    assert_eq!(events.len(), 1, "events: {:?}", events);
    assert_eq!(events[0].channel, OutputChannel::LOG);
    assert_eq!(events[0].sequence, 1);
    assert!(events[0].payload.body().contains("Hello World"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trailing_expression_without_semicolon() {
    let engine = TestEngine::new();
    let env = engine.open("hello", r#"println!("Hello World")"#);
    let mut output = env.subscribe_output();

    let result = env.run(RunOptions::default()).await.unwrap();

    assert!(result.is_success(), "{:?}", env.last_diagnostics());
    assert!(all_text(&output.drain()).contains("Hello World"));

    env.update_script(|script| script.update_code("let v = vec![1, 2, 3];\nv.dump()"))
        .unwrap();
    let result = env.run(RunOptions::default()).await.unwrap();
    assert!(result.is_success(), "{:?}", env.last_diagnostics());
    assert!(all_text(&output.drain()).contains('3'));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_program_with_inner_attribute() {
    let engine = TestEngine::new();
    let env = engine
        .session
        .open(
            scriptpad_core::Script::new(
                "attrs",
                "#![allow(dead_code)]\nfn main() {\n    println!(\"hi\");\n    let x: u32 = \"no\";\n}",
            )
            .with_config(ScriptConfig::default().with_kind(ScriptKind::Program)),
        )
        .unwrap();

    let result = env.run(RunOptions::default()).await.unwrap();
    assert!(!result.is_run_attempt_successful);
    let mismatch = env
        .last_diagnostics()
        .into_iter()
        .find(|d| d.code.as_deref() == Some("E0308"))
        .expect("type mismatch reported");
    assert_eq!(mismatch.location.unwrap().line, 4);

    env.update_script(|script| script.update_code("#![allow(dead_code)]\nfn main() { println!(\"hi\"); }"))
        .unwrap();
    let mut output = env.subscribe_output();
    let result = env.run(RunOptions::default()).await.unwrap();
    assert!(result.is_success(), "{:?}", env.last_diagnostics());
    assert!(all_text(&output.drain()).contains("hi"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compile_error_never_enters_running() {
    let engine = TestEngine::new();
    let env = engine.open("broken", "foobar");
    let mut output = env.subscribe_output();
    let mut events = env.subscribe_events();

    let result = env.run(RunOptions::default()).await.unwrap();

    assert!(!result.is_run_attempt_successful);
    assert_eq!(env.status(), Status::Error);

    let statuses = drain_statuses(&mut events);
    assert!(!statuses.contains(&Status::Running), "statuses: {:?}", statuses);
    assert_eq!(statuses.last(), Some(&Status::Error));

    let messages = errors(&output.drain());
    assert!(messages.iter().any(|m| m.contains("foobar")), "{:?}", messages);
    assert!(
        env.last_diagnostics()
            .iter()
            .any(|d| d.location.as_ref().is_some_and(|loc| loc.line == 1))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsupported_kind_fails_before_compile() {
    let engine = TestEngine::new();
    let env = engine.open("expr", "1 + 1");
    env.update_script(|script| {
        script.config = ScriptConfig::default().with_kind(ScriptKind::Expression);
    })
    .unwrap();
    let mut output = env.subscribe_output();

    let result = env.run(RunOptions::default()).await.unwrap();

    assert!(!result.is_run_attempt_successful);
    assert!(result.error.as_deref().unwrap_or("").contains("not supported"));
    assert_eq!(env.status(), Status::Error);
    assert_eq!(errors(&output.drain()).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panic_becomes_error_event_with_user_line() {
    let engine = TestEngine::new();
    let env = engine.open("panics", "let x = 41;\npanic!(\"boom {}\", x + 1);");
    let mut output = env.subscribe_output();

    let result = env.run(RunOptions::default()).await.unwrap();

    assert!(result.is_run_attempt_successful);
    assert!(!result.is_script_completed_successfully);
    assert_eq!(env.status(), Status::Error);

    let messages = errors(&output.drain());
    assert_eq!(messages.len(), 1, "{:?}", messages);
    assert!(messages[0].contains("boom 42"));
    assert!(messages[0].contains("script.rs:2:"), "{}", messages[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_error_via_question_mark() {
    let engine = TestEngine::new();
    let env = engine.open("parse", r#"let n: i32 = "nope".parse()?; dump(&n);"#);
    let mut output = env.subscribe_output();

    let result = env.run(RunOptions::default()).await.unwrap();

    assert!(result.is_run_attempt_successful);
    assert!(!result.is_script_completed_successfully);
    let messages = errors(&output.drain());
    assert!(messages[0].contains("InvalidDigit"), "{:?}", messages);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_results_are_ordered_per_channel() {
    let engine = TestEngine::new();
    let env = engine.open(
        "ordered",
        "for i in 1..=5 { dump(&i); println!(\"line {}\", i); }",
    );
    let mut output = env.subscribe_output();

    env.run(RunOptions::default()).await.unwrap();

    let events = output.drain();
    let results: Vec<_> = events
        .iter()
        .filter(|e| e.channel == OutputChannel::RESULTS)
        .collect();
    assert_eq!(results.len(), 5);
    for (i, event) in results.iter().enumerate() {
        assert_eq!(event.sequence, i as u64 + 1);
        match &event.payload {
            OutputPayload::Value {
                type_name, debug, ..
            } => {
                assert_eq!(type_name, "i32");
                assert_eq!(debug, &(i + 1).to_string());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    let log: Vec<u64> = events
        .iter()
        .filter(|e| e.channel == OutputChannel::LOG)
        .map(|e| e.sequence)
        .collect();
    assert_eq!(log, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_modules_do_not_accumulate() {
    let engine = TestEngine::new();
    let env = engine.open("repeat", "dump(&\"again\");");
    let script_id = env.script_id();
    let baseline = ModuleRegistry::global().resident(script_id);

    for _ in 0..5 {
        let result = env.run(RunOptions::default()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(ModuleRegistry::global().resident(script_id), baseline);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_run_is_rejected_while_in_flight() {
    let engine = TestEngine::new();
    let env = engine.open(
        "slow",
        "for _ in 0..200 { check_cancelled(); std::thread::sleep(std::time::Duration::from_millis(10)); }",
    );
    let mut events = env.subscribe_events();

    let running = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.run(RunOptions::default()).await })
    };
    wait_for_status(&mut events, Status::Running, Duration::from_secs(60)).await;

    assert!(env.is_running());
    assert!(matches!(
        env.run(RunOptions::default()).await,
        Err(Error::AlreadyRunning)
    ));

    env.cancel();
    let result = running.await.unwrap().unwrap();
    assert!(result.is_run_cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cooperative_cancel() {
    let engine = TestEngine::new();
    let env = engine.open(
        "spin",
        "loop { check_cancelled(); std::thread::sleep(std::time::Duration::from_millis(5)); }",
    );
    let mut events = env.subscribe_events();
    let mut output = env.subscribe_output();

    let running = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.run(RunOptions::default()).await })
    };
    wait_for_status(&mut events, Status::Running, Duration::from_secs(60)).await;

    assert!(env.cancel());
    assert!(!env.cancel(), "second cancel of the same run is a no-op");

    let result = running.await.unwrap().unwrap();
    assert!(result.is_run_cancelled);
    assert!(result.is_run_attempt_successful);
    assert_eq!(env.status(), Status::Ready);

    let statuses = drain_statuses(&mut events);
    assert!(statuses.contains(&Status::Stopping), "{:?}", statuses);

    let events = output.drain();
    assert!(errors(&events).is_empty());
    assert!(all_text(&events).contains("Script stopped at:"));
    assert_eq!(ModuleRegistry::global().resident(env.script_id()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ignored_cancel_ends_after_grace_period() {
    let engine = TestEngine::with_config(|config| config.host.cancel_grace_period_ms = 200);
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
    env.cancel();
    let result = running.await.unwrap().unwrap();

    assert!(result.is_run_cancelled);
    assert!(cancelled_at.elapsed() < Duration::from_secs(5));
    assert_eq!(env.status(), Status::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_never_leaves_finished_run_stopping() {
    let engine = TestEngine::new();
    let env = engine.open("quick", "let _x = 1;");
    assert!(env.run(RunOptions::default()).await.unwrap().is_success());

    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let canceller = {
        let env = Arc::clone(&env);
        let done = Arc::clone(&done);
        tokio::task::spawn_blocking(move || {
            while !done.load(std::sync::atomic::Ordering::Acquire) {
                if env.status() == Status::Running {
                    env.cancel();
                }
                std::thread::yield_now();
            }
        })
    };

    for i in 0..300 {
        env.run(RunOptions::default()).await.unwrap();
        let status = env.status();
        assert!(
            !(status == Status::Stopping && !env.is_running()),
            "run {} ended in {} with nothing in flight",
            i,
            status
        );
    }
    done.store(true, std::sync::atomic::Ordering::Release);
    canceller.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_reads_user_input() {
    let engine = TestEngine::new();
    let env = engine.open(
        "greet",
        r#"let name = console::prompt("name? ").unwrap_or_default();
println!("hello {}", name);"#,
    );
    let mut events = env.subscribe_events();
    let mut output = env.subscribe_output();
    assert!(!env.provide_input("nobody asked").unwrap());

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
    .expect("script never asked for input");
    assert_eq!(prompt, "name? ");
    assert!(env.is_waiting_for_input());

    env.handle_command(EnvironmentCommand::ProvideInput("Ada".to_string()))
        .await
        .unwrap();
    let result = running.await.unwrap().unwrap();

    assert!(result.is_success());
    assert!(!env.is_waiting_for_input());
    assert!(all_text(&output.drain()).contains("hello Ada"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_releases_pending_input() {
    let engine = TestEngine::new();
    let env = engine.open("wait", "let line = console::read_line();\ncheck_cancelled();\ndump(&line);");
    let mut events = env.subscribe_events();

    let running = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.run(RunOptions::default()).await })
    };
    wait_for_status(&mut events, Status::Running, Duration::from_secs(60)).await;
    tokio::time::timeout(Duration::from_secs(10), async {
        while !env.is_waiting_for_input() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("script never blocked on input");

    assert!(env.cancel());
    let result = running.await.unwrap().unwrap();
    assert!(result.is_run_cancelled);
    assert!(!env.is_waiting_for_input());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_uses_code_snapshot() {
    let engine = TestEngine::new();
    let env = engine.open(
        "snapshot",
        "std::thread::sleep(std::time::Duration::from_millis(300)); println!(\"original\");",
    );
    let mut events = env.subscribe_events();
    let mut output = env.subscribe_output();

    let running = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.run(RunOptions::default()).await })
    };
    wait_for_status(&mut events, Status::Running, Duration::from_secs(60)).await;
    env.update_script(|script| script.update_code("println!(\"edited\");"))
        .unwrap();

    running.await.unwrap().unwrap();
    let text = all_text(&output.drain());
    assert!(text.contains("original"));
    assert!(!text.contains("edited"));
    assert!(env.script().dirty);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_options_override_code() {
    let engine = TestEngine::new();
    let env = engine.open("selection", "println!(\"whole script\");");
    let mut output = env.subscribe_output();

    let options = RunOptions::default()
        .with_code("println!(\"{}\", helper());")
        .with_additional_code("fn helper() -> &'static str { \"selected\" }");
    let result = env.run(options).await.unwrap();

    assert!(result.is_success());
    let text = all_text(&output.drain());
    assert!(text.contains("selected"));
    assert!(!text.contains("whole script"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completion_events() {
    let engine = TestEngine::new();
    let env = engine.open("events", "dump(&1);");
    let mut events = env.subscribe_events();

    let result = env
        .handle_command(EnvironmentCommand::Run(RunOptions::default()))
        .await
        .unwrap()
        .unwrap();

    let mut saw_duration = false;
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            EnvironmentEvent::RunDurationChanged { duration_ms, .. } => {
                saw_duration = true;
                assert_eq!(duration_ms, result.duration_ms);
            }
            EnvironmentEvent::RunCompleted { result, run_id, .. } => {
                assert_eq!(Some(run_id), env.last_run_id());
                completed = Some(result);
            }
            _ => {}
        }
    }
    assert!(saw_duration);
    assert_eq!(completed, Some(result.clone()));
    assert_eq!(env.last_result(), Some(result));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_is_final() {
    let engine = TestEngine::new();
    let env = engine.open("dispose", "dump(&1);");
    let mut output = env.subscribe_output();

    env.dispose().await;
    env.dispose().await;

    assert!(env.is_disposed());
    assert!(matches!(env.run(RunOptions::default()).await, Err(Error::Disposed)));
    assert!(matches!(
        env.handle_command(EnvironmentCommand::Cancel).await,
        Err(Error::Disposed)
    ));
    assert!(output.recv().await.is_none());
}

/// Dispose must not return before the run in flight has finished and
/// announced its completion.
async fn assert_dispose_waits_for_run(wait_until_running: bool) {
    let engine = TestEngine::new();
    // Unique source so the compile is never served from the module cache.
    let code = format!(
        "// {}\nloop {{ check_cancelled(); std::thread::sleep(std::time::Duration::from_millis(5)); }}",
        scriptpad_core::RunId::new()
    );
    let env = engine.open("disposed-mid-run", &code);
    let script_id = env.script_id();
    let mut events = env.subscribe_events();
    let mut completions = env.subscribe_events();

    let running = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.run(RunOptions::default()).await })
    };
    if wait_until_running {
        wait_for_status(&mut events, Status::Running, Duration::from_secs(60)).await;
    } else {
        while !env.is_running() {
            tokio::task::yield_now().await;
        }
        assert_ne!(env.status(), Status::Running, "still compiling");
    }

    env.dispose().await;

    assert!(!env.is_running());
    assert_eq!(ModuleRegistry::global().resident(script_id), 0);
    let mut completed = None;
    while let Ok(event) = completions.try_recv() {
        if let EnvironmentEvent::RunCompleted { result, .. } = event {
            completed = Some(result);
        }
    }
    let completed = completed.expect("RunCompleted published before dispose returned");
    assert!(completed.is_run_cancelled);

    let result = running.await.unwrap().unwrap();
    assert_eq!(result, completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_waits_for_running_script() {
    assert_dispose_waits_for_run(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_waits_for_compiling_script() {
    assert_dispose_waits_for_run(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_environments_run_concurrently() {
    let engine = TestEngine::new();
    let first = engine.open("first", "std::thread::sleep(std::time::Duration::from_millis(200)); dump(&1);");
    let second = engine.open("second", "std::thread::sleep(std::time::Duration::from_millis(200)); dump(&2);");
    assert_eq!(engine.session.len(), 2);

    let (a, b) = tokio::join!(
        first.run(RunOptions::default()),
        second.run(RunOptions::default())
    );
    assert!(a.unwrap().is_success());
    assert!(b.unwrap().is_success());

    assert!(engine.session.close(first.script_id()).await);
    assert!(!engine.session.close(first.script_id()).await);
    engine.session.close_all().await;
    assert!(engine.session.is_empty());
    assert!(second.is_disposed());
}
