#![cfg(unix)]

// Integration tests for whisper server supervision
//
// Health probing and auto-start run against throwaway axum servers and
// /bin/sh stand-ins for the whisper-server binary; model and VAD
// resolution run against temporary cache directories.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use speech2text_service::server::{
    discover_vad_model, resolve_model_path, resolve_vad_model, HealthStatus, ServerError,
    ServerSettings, ServerSupervisor,
};
use tempfile::TempDir;

async fn spawn_backend(router: Router) -> Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    Ok(format!("http://{addr}"))
}

/// A loopback URL nothing listens on.
async fn refused_url() -> Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(format!("http://{addr}"))
}

fn health_router(status: StatusCode, body: Value) -> Router {
    Router::new().route(
        "/health",
        get(move || {
            let body = body.clone();
            async move { (status, Json(body)) }
        }),
    )
}

/// Settings with test-sized timeouts.
fn quick_settings(url: &str) -> ServerSettings {
    ServerSettings {
        base_url: url.to_string(),
        health_timeout_secs: 0.3,
        startup_wait_secs: 0.4,
        startup_poll_secs: 0.05,
        ..ServerSettings::default()
    }
}

/// Writes an executable stand-in for the whisper-server binary.
fn write_binary(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

#[test]
fn test_model_resolution() -> Result<()> {
    let cache = TempDir::new()?;
    std::fs::write(cache.path().join("ggml-base.en.bin"), b"model bytes")?;

    let found = resolve_model_path(cache.path(), "base.en")?;
    assert_eq!(found, cache.path().join("ggml-base.en.bin"));

    let err = resolve_model_path(cache.path(), "large-v3").unwrap_err();
    match &err {
        ServerError::ModelNotFound { model, path } => {
            assert_eq!(model, "large-v3");
            assert!(path.ends_with("ggml-large-v3.bin"));
        }
        other => panic!("expected ModelNotFound, got {other:?}"),
    }
    // The message tells the user how to get the model.
    assert!(err.to_string().contains("download"));
    Ok(())
}

#[test]
fn test_vad_resolution() -> Result<()> {
    let cache = TempDir::new()?;
    std::fs::write(cache.path().join("ggml-silero-v5.1.2.bin"), b"vad")?;

    assert_eq!(resolve_vad_model(cache.path(), "none")?, None);
    assert_eq!(resolve_vad_model(cache.path(), "")?, None);
    assert_eq!(resolve_vad_model(cache.path(), " None ")?, None);

    assert_eq!(
        resolve_vad_model(cache.path(), "silero-v5.1.2")?,
        Some(cache.path().join("ggml-silero-v5.1.2.bin"))
    );

    let err = resolve_vad_model(cache.path(), "silero-v9").unwrap_err();
    assert!(matches!(err, ServerError::VadModelNotFound { .. }));
    Ok(())
}

#[test]
fn test_vad_discovery_prefers_newest() -> Result<()> {
    let cache = TempDir::new()?;
    for name in [
        "ggml-silero-v5.1.0.bin",
        "ggml-silero-v5.1.2.bin",
        "ggml-base.en.bin",
        "ggml-silero-vx.bin",
        "notes.txt",
    ] {
        std::fs::write(cache.path().join(name), b"x")?;
    }

    assert_eq!(
        discover_vad_model(cache.path()),
        Some(cache.path().join("ggml-silero-v5.1.2.bin"))
    );
    assert_eq!(
        resolve_vad_model(cache.path(), "auto")?,
        Some(cache.path().join("ggml-silero-v5.1.2.bin"))
    );

    let empty = TempDir::new()?;
    assert_eq!(discover_vad_model(empty.path()), None);
    assert_eq!(resolve_vad_model(empty.path(), "auto")?, None);
    Ok(())
}

#[tokio::test]
async fn test_health_classification() -> Result<()> {
    let timeout = Duration::from_millis(500);

    let url = spawn_backend(health_router(StatusCode::OK, json!({"status": "ok"}))).await?;
    let supervisor = ServerSupervisor::new(quick_settings(&url));
    assert_eq!(supervisor.health_check(timeout).await, HealthStatus::Ok);

    let url = spawn_backend(health_router(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"error": "loading model"}),
    ))
    .await?;
    let supervisor = ServerSupervisor::new(quick_settings(&url));
    assert_eq!(supervisor.health_check(timeout).await, HealthStatus::Loading);

    let url = spawn_backend(health_router(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"status": "ok"}),
    ))
    .await?;
    let supervisor = ServerSupervisor::new(quick_settings(&url));
    match supervisor.health_check(timeout).await {
        HealthStatus::Error(detail) => assert!(detail.contains("500"), "detail was {detail:?}"),
        other => panic!("expected Error, got {other:?}"),
    }

    let url = spawn_backend(health_router(StatusCode::OK, json!({"status": "starting"}))).await?;
    let supervisor = ServerSupervisor::new(quick_settings(&url));
    match supervisor.health_check(timeout).await {
        HealthStatus::Error(detail) => {
            assert!(detail.contains("starting"), "detail was {detail:?}")
        }
        other => panic!("expected Error, got {other:?}"),
    }

    let url = refused_url().await?;
    let supervisor = ServerSupervisor::new(quick_settings(&url));
    assert!(matches!(
        supervisor.health_check(timeout).await,
        HealthStatus::Error(_)
    ));
    Ok(())
}

#[tokio::test]
async fn test_ensure_running_uses_healthy_server() -> Result<()> {
    let url = spawn_backend(health_router(StatusCode::OK, json!({"status": "ok"}))).await?;
    let cache = TempDir::new()?;

    // Neither the model nor the binary exists; a healthy server means
    // they are never looked at.
    let supervisor = ServerSupervisor::new(ServerSettings {
        model: "definitely-absent".to_string(),
        cache_dir: Some(cache.path().to_path_buf()),
        server_binary: Some(PathBuf::from("/no/such/whisper-server")),
        ..quick_settings(&url)
    });
    assert!(supervisor.ensure_running().await?);
    Ok(())
}

#[tokio::test]
async fn test_ensure_running_respects_auto_start_off() -> Result<()> {
    let url = refused_url().await?;
    let supervisor = ServerSupervisor::new(ServerSettings {
        auto_start: false,
        ..quick_settings(&url)
    });
    assert!(!supervisor.ensure_running().await?);
    Ok(())
}

#[tokio::test]
async fn test_ensure_running_never_spawns_for_remote() -> Result<()> {
    // Unroutable address: the health probe fails, and a remote URL
    // must never trigger a local spawn.
    let supervisor = ServerSupervisor::new(ServerSettings {
        health_timeout_secs: 0.1,
        ..quick_settings("http://10.255.255.1:9")
    });
    assert!(!supervisor.is_local());

    let started = Instant::now();
    assert!(!supervisor.ensure_running().await?);
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[tokio::test]
async fn test_ensure_running_requires_the_model() -> Result<()> {
    let url = refused_url().await?;
    let cache = TempDir::new()?;
    let supervisor = ServerSupervisor::new(ServerSettings {
        cache_dir: Some(cache.path().to_path_buf()),
        ..quick_settings(&url)
    });

    let err = supervisor.ensure_running().await.unwrap_err();
    assert!(matches!(err, ServerError::ModelNotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn test_ensure_running_requires_the_binary() -> Result<()> {
    let url = refused_url().await?;
    let cache = TempDir::new()?;
    std::fs::write(cache.path().join("ggml-base.en.bin"), b"model")?;

    let supervisor = ServerSupervisor::new(ServerSettings {
        cache_dir: Some(cache.path().to_path_buf()),
        server_binary: Some(PathBuf::from("/no/such/whisper-server")),
        ..quick_settings(&url)
    });

    let err = supervisor.ensure_running().await.unwrap_err();
    assert!(matches!(err, ServerError::BinaryNotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn test_early_exit_reports_output() -> Result<()> {
    let url = refused_url().await?;
    let cache = TempDir::new()?;
    std::fs::write(cache.path().join("ggml-base.en.bin"), b"model")?;
    let binary = write_binary(
        cache.path(),
        "whisper-server",
        "echo 'failed to bind socket' >&2\nexit 3",
    )?;

    let supervisor = ServerSupervisor::new(ServerSettings {
        cache_dir: Some(cache.path().to_path_buf()),
        server_binary: Some(binary),
        vad_model: "none".to_string(),
        ..quick_settings(&url)
    });

    let err = supervisor.ensure_running().await.unwrap_err();
    match &err {
        ServerError::ExitedEarly { status, output } => {
            assert!(status.contains('3'), "status was {status:?}");
            assert!(
                output.contains("failed to bind socket"),
                "output was {output:?}"
            );
        }
        other => panic!("expected ExitedEarly, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_slow_server_times_out_and_is_reaped() -> Result<()> {
    let url = refused_url().await?;
    let port = url.rsplit(':').next().unwrap().to_string();
    let cache = TempDir::new()?;
    std::fs::write(cache.path().join("ggml-base.en.bin"), b"model")?;
    std::fs::write(cache.path().join("ggml-silero-v5.1.2.bin"), b"vad")?;

    // Records its arguments, then loads forever.
    let args_file = cache.path().join("args.txt");
    let binary = write_binary(
        cache.path(),
        "whisper-server",
        &format!("printf '%s\\n' \"$@\" >> '{}'\nexec sleep 30", args_file.display()),
    )?;

    let supervisor = ServerSupervisor::new(ServerSettings {
        cache_dir: Some(cache.path().to_path_buf()),
        server_binary: Some(binary),
        ..quick_settings(&url)
    });

    // Never becomes healthy within the startup window.
    assert!(!supervisor.ensure_running().await?);

    let args: Vec<String> = std::fs::read_to_string(&args_file)?
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(
        args,
        vec![
            "-m".to_string(),
            cache.path().join("ggml-base.en.bin").display().to_string(),
            "-l".to_string(),
            "auto".to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            port,
            "--vad".to_string(),
            "-vm".to_string(),
            cache
                .path()
                .join("ggml-silero-v5.1.2.bin")
                .display()
                .to_string(),
        ]
    );

    // A second attempt waits on the same child instead of spawning
    // another one.
    assert!(!supervisor.ensure_running().await?);
    assert_eq!(std::fs::read_to_string(&args_file)?.lines().count(), 11);

    supervisor.shutdown().await;
    supervisor.shutdown().await;
    Ok(())
}
