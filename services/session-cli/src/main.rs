//! session-fetch
//!
//! Command-line front end for the authenticated client:
//! 1. `login <username> <password>` stores a credential pair
//! 2. `get <path>...` issues every path concurrently through one client,
//!    so an expired access credential is refreshed once for the whole batch
//! 3. `logout` revokes server-side and clears local credentials
//! 4. `status` shows what the store holds

mod config;

use anyhow::{Context, Result, bail};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session_auth::{AuthGateway, CredentialKind, CredentialStore};
use session_client::{AuthClient, RefreshPolicy};

use crate::config::Config;

const USAGE: &str = "usage: session-fetch [--config <path>] [--print-metrics] \
                     <login <username> <password> | get <path>... | logout | status>";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login { username: String, password: String },
    Get { paths: Vec<String> },
    Logout,
    Status,
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config_path: Option<String>,
    print_metrics: bool,
    command: Command,
}

/// Parse arguments (without the program name).
fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config_path = None;
    let mut print_metrics = false;
    let mut rest = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().context("--config requires a path")?;
                config_path = Some(path.clone());
            }
            "--print-metrics" => print_metrics = true,
            _ => rest.push(arg.clone()),
        }
    }

    let command = match rest.split_first() {
        Some((cmd, args)) if cmd == "login" => match args {
            [username, password] => Command::Login {
                username: username.clone(),
                password: password.clone(),
            },
            _ => bail!("login takes <username> <password>\n{USAGE}"),
        },
        Some((cmd, args)) if cmd == "get" => {
            if args.is_empty() {
                bail!("get takes at least one path\n{USAGE}");
            }
            Command::Get {
                paths: args.to_vec(),
            }
        }
        Some((cmd, [])) if cmd == "logout" => Command::Logout,
        Some((cmd, [])) if cmd == "status" => Command::Status,
        Some((cmd, _)) => bail!("unknown command: {cmd}\n{USAGE}"),
        None => bail!("{USAGE}"),
    };

    Ok(Cli {
        config_path,
        print_metrics,
        command,
    })
}

/// Join an API base URL and a request path.
fn api_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Build the client from config: credential store, gateway, HTTP client.
fn build_client(config: &Config) -> Result<AuthClient> {
    let store = match &config.session.credentials_file {
        Some(path) => CredentialStore::load(path.clone())
            .with_context(|| format!("failed to load credentials from {}", path.display()))?,
        None => CredentialStore::in_memory(),
    };

    if let Some(access) = &config.session.access_token {
        store.set(CredentialKind::Access, access.expose().as_str())?;
    }
    if let Some(refresh) = &config.session.refresh_token {
        store.set(CredentialKind::Refresh, refresh.expose().as_str())?;
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.api.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let gateway = AuthGateway::new(http.clone(), config.auth.base_url.clone());

    Ok(AuthClient::new(
        http,
        gateway,
        Arc::new(store),
        Arc::new(|| warn!("session ended; run `session-fetch login` to sign in again")),
        RefreshPolicy::new(config.session.max_refresh_attempts),
    ))
}

/// Run one command and return what should be printed.
async fn execute(client: &AuthClient, config: &Config, command: Command) -> Result<String> {
    match command {
        Command::Login { username, password } => {
            client
                .login(&username, &password)
                .await
                .context("login failed")?;
            info!("logged in");
            Ok("logged in".into())
        }
        Command::Get { paths } => {
            let requests = paths.iter().map(|path| {
                let url = api_url(&config.api.base_url, path);
                async move {
                    let outcome = match client.get(url).await {
                        Ok(response) => {
                            let status = response.status();
                            let body = response.text().await.unwrap_or_default();
                            Ok(format!("{status} {body}"))
                        }
                        Err(e) => Err(e),
                    };
                    (path.as_str(), outcome)
                }
            });

            let mut output = Vec::new();
            let mut failed = 0;
            for (path, outcome) in futures_util::future::join_all(requests).await {
                match outcome {
                    Ok(line) => output.push(format!("{path}: {line}")),
                    Err(e) => {
                        failed += 1;
                        output.push(format!("{path}: error: {e}"));
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} request(s) failed\n{}", output.join("\n"));
            }
            Ok(output.join("\n"))
        }
        Command::Logout => {
            client.logout().await.context("logout failed")?;
            Ok("logged out".into())
        }
        Command::Status => {
            let store = client.store();
            let present = |kind| {
                if store.get(kind).is_some() {
                    "present"
                } else {
                    "absent"
                }
            };
            Ok(format!(
                "access: {}\nrefresh: {}\nrefresh state: {}",
                present(CredentialKind::Access),
                present(CredentialKind::Refresh),
                client.coordinator().state().label()
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    let config_path = Config::resolve_path(cli.config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        auth_url = %config.auth.base_url,
        api_url = %config.api.base_url,
        max_refresh_attempts = config.session.max_refresh_attempts,
        persistent = config.session.credentials_file.is_some(),
        "configuration loaded"
    );

    let client = build_client(&config)?;
    let result = execute(&client, &config, cli.command).await;

    if cli.print_metrics {
        eprintln!("{}", prometheus.render());
    }

    println!("{}", result?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Form, Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio::sync::Notify;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_login() {
        let cli = parse_args(&args(&["login", "user@example.com", "hunter2"])).unwrap();
        assert_eq!(
            cli.command,
            Command::Login {
                username: "user@example.com".into(),
                password: "hunter2".into()
            }
        );
        assert_eq!(cli.config_path, None);
        assert!(!cli.print_metrics);
    }

    #[test]
    fn test_parse_flags_anywhere() {
        let cli = parse_args(&args(&[
            "get",
            "/me",
            "--config",
            "/etc/session.toml",
            "/tasks",
            "--print-metrics",
        ]))
        .unwrap();
        assert_eq!(cli.config_path.as_deref(), Some("/etc/session.toml"));
        assert!(cli.print_metrics);
        assert_eq!(
            cli.command,
            Command::Get {
                paths: vec!["/me".into(), "/tasks".into()]
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_args(&[]).is_err());
        assert!(parse_args(&args(&["get"])).is_err());
        assert!(parse_args(&args(&["login", "only-user"])).is_err());
        assert!(parse_args(&args(&["status", "extra"])).is_err());
        assert!(parse_args(&args(&["frobnicate"])).is_err());
        assert!(parse_args(&args(&["status", "--config"])).is_err());
    }

    #[test]
    fn test_api_url_joins_slashes() {
        assert_eq!(api_url("http://h/api/v1/", "/me"), "http://h/api/v1/me");
        assert_eq!(api_url("http://h/api/v1", "me"), "http://h/api/v1/me");
    }

    /// Auth server that issues one pair at login and rotates on refresh, and
    /// an API that only accepts the latest access credential.
    #[derive(Default)]
    struct Backend {
        access: Mutex<Option<String>>,
        refresh: Mutex<Option<String>>,
        refreshes: Mutex<u32>,
        /// Holds refresh exchanges until notified, when set.
        refresh_gate: Mutex<Option<Arc<Notify>>>,
    }

    async fn start_backend() -> (String, Arc<Backend>) {
        let backend = Arc::new(Backend::default());
        let app = axum::Router::new()
            .route(
                "/auth/login",
                post(
                    |State(b): State<Arc<Backend>>,
                     Form(_): Form<HashMap<String, String>>| async move {
                        *b.access.lock().unwrap() = Some("A1".into());
                        *b.refresh.lock().unwrap() = Some("R1".into());
                        axum::Json(serde_json::json!({
                            "access_token": "A1",
                            "refresh_token": "R1",
                            "token_type": "bearer"
                        }))
                    },
                ),
            )
            .route(
                "/auth/refresh",
                post(
                    |State(b): State<Arc<Backend>>,
                     axum::Json(body): axum::Json<HashMap<String, String>>| async move {
                        let gate = b.refresh_gate.lock().unwrap().clone();
                        if let Some(gate) = gate {
                            gate.notified().await;
                        }
                        let presented = body.get("refresh_token").cloned();
                        if presented.is_none() || presented != *b.refresh.lock().unwrap() {
                            return (StatusCode::UNAUTHORIZED, axum::Json(serde_json::json!({})));
                        }
                        *b.refreshes.lock().unwrap() += 1;
                        *b.access.lock().unwrap() = Some("A2".into());
                        *b.refresh.lock().unwrap() = Some("R2".into());
                        (
                            StatusCode::OK,
                            axum::Json(serde_json::json!({
                                "access_token": "A2",
                                "refresh_token": "R2"
                            })),
                        )
                    },
                ),
            )
            .route(
                "/auth/logout",
                post(|State(b): State<Arc<Backend>>| async move {
                    *b.refresh.lock().unwrap() = None;
                    StatusCode::OK
                }),
            )
            .route(
                "/api/{name}",
                get(
                    |State(b): State<Arc<Backend>>,
                     Path(name): Path<String>,
                     headers: HeaderMap| async move {
                        let expected = b.access.lock().unwrap().clone().map(|a| format!("Bearer {a}"));
                        let presented = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned);
                        if expected.is_none() || presented != expected {
                            return (StatusCode::UNAUTHORIZED, String::new());
                        }
                        (StatusCode::OK, format!("hello {name}"))
                    },
                ),
            )
            .with_state(backend.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), backend)
    }

    fn config_for(base: &str, credentials_file: &std::path::Path) -> Config {
        let toml = format!(
            r#"
[auth]
base_url = "{base}/auth"

[api]
base_url = "{base}/api"

[session]
credentials_file = "{}"
"#,
            credentials_file.display()
        );
        toml::from_str(&toml).unwrap()
    }

    #[tokio::test]
    async fn test_login_get_logout_roundtrip() {
        let (base, backend) = start_backend().await;
        let dir = tempfile::tempdir().unwrap();
        let creds = dir.path().join("credentials.json");
        let config = config_for(&base, &creds);

        let client = build_client(&config).unwrap();
        let out = execute(
            &client,
            &config,
            Command::Login {
                username: "user@example.com".into(),
                password: "hunter2".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(out, "logged in");

        // A second process picks the pair up from the file.
        let client = build_client(&config).unwrap();
        let status = execute(&client, &config, Command::Status).await.unwrap();
        assert!(status.contains("access: present"), "{status}");
        assert!(status.contains("refresh: present"), "{status}");

        let out = execute(
            &client,
            &config,
            Command::Get {
                paths: vec!["one".into(), "two".into()],
            },
        )
        .await
        .unwrap();
        assert_eq!(out, "one: 200 OK hello one\ntwo: 200 OK hello two");
        assert_eq!(*backend.refreshes.lock().unwrap(), 0);

        let out = execute(&client, &config, Command::Logout).await.unwrap();
        assert_eq!(out, "logged out");
        let status = execute(&client, &config, Command::Status).await.unwrap();
        assert!(status.contains("access: absent"), "{status}");
        assert!(status.contains("refresh: absent"), "{status}");
    }

    #[tokio::test]
    async fn test_get_recovers_from_expired_access() {
        let (base, backend) = start_backend().await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&base, &dir.path().join("credentials.json"));
        let client = build_client(&config).unwrap();
        execute(
            &client,
            &config,
            Command::Login {
                username: "user@example.com".into(),
                password: "hunter2".into(),
            },
        )
        .await
        .unwrap();

        // Expire A1 server-side; R1 is still valid.
        *backend.access.lock().unwrap() = Some("A2".into());
        let gate = Arc::new(Notify::new());
        *backend.refresh_gate.lock().unwrap() = Some(gate.clone());

        // All three 401s are parked behind the one exchange before it may finish.
        let (out, ()) = tokio::join!(
            execute(
                &client,
                &config,
                Command::Get {
                    paths: vec!["one".into(), "two".into(), "three".into()],
                },
            ),
            async {
                tokio::time::timeout(Duration::from_secs(5), async {
                    while client.coordinator().queued() < 3 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                })
                .await
                .expect("requests never queued behind the exchange");
                gate.notify_one();
            }
        );
        let out = out.unwrap();

        assert!(out.contains("one: 200 OK hello one"), "{out}");
        assert!(out.contains("two: 200 OK hello two"), "{out}");
        assert!(out.contains("three: 200 OK hello three"), "{out}");
        assert_eq!(*backend.refreshes.lock().unwrap(), 1);
        assert_eq!(
            client
                .store()
                .get(CredentialKind::Refresh)
                .unwrap()
                .expose(),
            "R2"
        );
    }

    #[tokio::test]
    async fn test_get_without_credentials_fails() {
        let (base, _backend) = start_backend().await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&base, &dir.path().join("credentials.json"));
        let client = build_client(&config).unwrap();

        let err = execute(
            &client,
            &config,
            Command::Get {
                paths: vec!["one".into()],
            },
        )
        .await
        .unwrap_err()
        .to_string();

        assert!(err.contains("1 request(s) failed"), "{err}");
        assert!(err.contains("no refresh credential"), "{err}");
    }
}
