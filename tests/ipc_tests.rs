use std::path::{Path, PathBuf};
use std::time::Duration;

use myqueue::config::Config;
use myqueue::daemon::Daemon;
use myqueue::ipc::protocol::{read_frame, write_frame, Request, Response};
use myqueue::ipc::server;
use myqueue::ipc::IpcClient;
use myqueue::task::{SubmitRequest, TaskStatus};
use tempfile::TempDir;
use tokio::net::UnixListener;

fn test_config(dir: &Path) -> Config {
    Config {
        cpu_check_duration_ms: 10,
        cpu_check_interval_ms: 5,
        data_dir: dir.join("data"),
        socket_path: dir.join("mq.sock"),
        ..Config::default()
    }
}

fn write_script(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, "#!/bin/bash\ntrue\n").unwrap();
    path
}

fn submit_request(script: &Path, workdir: &Path) -> Request {
    Request::Submit(SubmitRequest {
        script_path: script.to_path_buf(),
        workdir: workdir.to_path_buf(),
        ncpu: 1,
        ngpu: 0,
        specific_cpus: Vec::new(),
        specific_gpus: Vec::new(),
        log_file: String::new(),
    })
}

/// Serve a daemon's handler on its socket without starting the
/// scheduler loops.
fn serve_daemon(daemon: &std::sync::Arc<Daemon>) {
    let listener = UnixListener::bind(daemon_socket(daemon)).unwrap();
    let handler_daemon = daemon.clone();
    let handler = move |request| {
        let daemon = handler_daemon.clone();
        async move { daemon.handle(request).await }
    };
    tokio::spawn(server::serve(listener, handler, daemon.shutdown_token()));
}

fn daemon_socket(daemon: &Daemon) -> PathBuf {
    daemon.config().socket_path.clone()
}

#[tokio::test]
async fn test_frames_round_trip() {
    let (mut a, mut b) = tokio::io::duplex(1024);

    let request = Request::Query {
        include_terminal: true,
    };
    write_frame(&mut a, &request).await.unwrap();
    let received: Request = read_frame(&mut b).await.unwrap();
    assert_eq!(received, request);

    let response = Response::Submitted { task_id: 9 };
    write_frame(&mut b, &response).await.unwrap();
    let received: Response = read_frame(&mut a).await.unwrap();
    assert_eq!(received, response);
}

#[tokio::test]
async fn test_oversized_frame_is_rejected() {
    let (mut a, mut b) = tokio::io::duplex(64);

    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        // A length header far beyond the frame cap.
        let _ = a.write_u32(u32::MAX).await;
    });

    let result: Result<Request, _> = read_frame(&mut b).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_submit_query_info_delete_over_the_socket() {
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::new(test_config(dir.path()));
    serve_daemon(&daemon);

    let script = write_script(dir.path(), "job.sh");
    let mut client = IpcClient::connect(&daemon_socket(&daemon)).await.unwrap();

    // Submit.
    let response = client
        .request(&submit_request(&script, dir.path()))
        .await
        .unwrap();
    let Response::Submitted { task_id } = response else {
        panic!("unexpected response: {response:?}");
    };
    assert_eq!(task_id, 1);

    // Query: one pending task, no running, no terminal block.
    let response = client
        .request(&Request::Query {
            include_terminal: false,
        })
        .await
        .unwrap();
    let Response::Queue(view) = response else {
        panic!("unexpected response: {response:?}");
    };
    assert!(view.running.is_empty());
    assert_eq!(view.pending.len(), 1);
    assert_eq!(view.pending[0].id, task_id);
    assert_eq!(view.pending[0].status, TaskStatus::Pending);

    // Info.
    let response = client.request(&Request::Info { task_id }).await.unwrap();
    let Response::TaskDetail(detail) = response else {
        panic!("unexpected response: {response:?}");
    };
    assert_eq!(detail.id, task_id);
    assert_eq!(detail.ncpu, 1);
    assert!(detail.start_time.is_none());

    // Delete the pending task plus a bogus id.
    let response = client
        .request(&Request::Delete {
            task_ids: vec![task_id, 999],
        })
        .await
        .unwrap();
    let Response::Deleted { results } = response else {
        panic!("unexpected response: {response:?}");
    };
    assert!(results[0].success);
    assert!(!results[1].success);

    assert!(daemon.store().get(task_id).is_none());
}

#[tokio::test]
async fn test_submit_rejects_missing_script_and_workdir() {
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::new(test_config(dir.path()));

    let response = daemon
        .handle(submit_request(&dir.path().join("nope.sh"), dir.path()))
        .await;
    assert!(matches!(response, Response::Error { .. }));

    let script = write_script(dir.path(), "job.sh");
    let response = daemon
        .handle(submit_request(&script, &dir.path().join("missing")))
        .await;
    assert!(matches!(response, Response::Error { .. }));

    // Nothing was admitted.
    assert!(daemon.store().is_empty());
}

#[tokio::test]
async fn test_query_all_includes_terminal_tasks() {
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::new(test_config(dir.path()));
    let script = write_script(dir.path(), "job.sh");

    let Response::Submitted { task_id } =
        daemon.handle(submit_request(&script, dir.path())).await
    else {
        panic!("submit failed");
    };
    daemon.store().set_running(task_id, 1234, &[0], &[]);
    daemon.store().set_completed(task_id, 0);

    let Response::Queue(view) = daemon
        .handle(Request::Query {
            include_terminal: false,
        })
        .await
    else {
        panic!("query failed");
    };
    assert!(view.terminal.is_empty());

    let Response::Queue(view) = daemon
        .handle(Request::Query {
            include_terminal: true,
        })
        .await
    else {
        panic!("query failed");
    };
    assert_eq!(view.terminal.len(), 1);
    assert_eq!(view.terminal[0].status, TaskStatus::Completed);
    assert_eq!(view.terminal[0].exit_code, Some(0));
}

#[tokio::test]
async fn test_delete_all_reports_counts_by_category() {
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::new(test_config(dir.path()));
    let script = write_script(dir.path(), "job.sh");

    for _ in 0..3 {
        daemon.handle(submit_request(&script, dir.path())).await;
    }
    daemon.store().set_running(1, 1234, &[0], &[]);
    daemon.store().set_completed(1, 0);

    let Response::DeletedAll(summary) = daemon.handle(Request::DeleteAll).await else {
        panic!("delete-all failed");
    };
    assert_eq!(summary.total, 3);
    assert_eq!(summary.pending_deleted, 2);
    assert_eq!(summary.terminal_deleted, 1);
    assert_eq!(summary.running_terminated, 0);
    assert!(daemon.store().is_empty());
}

#[tokio::test]
async fn test_log_request_returns_tail() {
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::new(test_config(dir.path()));
    let script = write_script(dir.path(), "job.sh");

    let Response::Submitted { task_id } = daemon
        .handle(Request::Submit(SubmitRequest {
            script_path: script.clone(),
            workdir: dir.path().to_path_buf(),
            ncpu: 1,
            ngpu: 0,
            specific_cpus: Vec::new(),
            specific_gpus: Vec::new(),
            log_file: "out.log".to_string(),
        }))
        .await
    else {
        panic!("submit failed");
    };

    std::fs::write(dir.path().join("out.log"), "one\ntwo\nthree\n").unwrap();

    let Response::TaskLog(log) = daemon
        .handle(Request::Log {
            task_id,
            tail_lines: 2,
        })
        .await
    else {
        panic!("log failed");
    };
    assert_eq!(log.content, "two\nthree\n");

    let Response::TaskLog(log) = daemon
        .handle(Request::Log {
            task_id,
            tail_lines: 0,
        })
        .await
    else {
        panic!("log failed");
    };
    assert_eq!(log.content, "one\ntwo\nthree\n");
}

#[tokio::test]
async fn test_shutdown_cancels_the_daemon_token() {
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::new(test_config(dir.path()));
    serve_daemon(&daemon);

    let mut client = IpcClient::connect(&daemon_socket(&daemon)).await.unwrap();
    let response = client.request(&Request::Shutdown).await.unwrap();
    assert_eq!(response, Response::ShuttingDown);

    tokio::time::timeout(Duration::from_secs(1), daemon.shutdown_token().cancelled())
        .await
        .expect("shutdown token was never cancelled");
}

#[tokio::test]
async fn test_malformed_frame_drops_connection_but_not_the_server() {
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::new(test_config(dir.path()));
    serve_daemon(&daemon);
    let socket = daemon_socket(&daemon);

    // First connection sends garbage and gets dropped.
    {
        use tokio::io::AsyncWriteExt;
        let mut stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
        stream.write_u32(12).await.unwrap();
        stream.write_all(b"not json :-(").await.unwrap();
        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        // Server closes without answering.
        let n = stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    // The server still answers a well-formed client.
    let mut client = IpcClient::connect(&socket).await.unwrap();
    let response = client
        .request(&Request::Query {
            include_terminal: false,
        })
        .await
        .unwrap();
    assert!(matches!(response, Response::Queue(_)));
}
