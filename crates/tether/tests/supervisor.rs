use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tether::{
    Error, HostFactory, RunOutput, Supervisor, SupervisorConfig, Tool, ToolCallEvent, ToolError,
    ToolRegistry,
};
use tether_protocol::{
    CallId, CallIds, HostEndpoint, HostLink, HostMessage, SupervisorMessage, link,
};

const PATIENCE: Duration = Duration::from_secs(5);

/// How a scripted host behaves over its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Script {
    Normal,
    FailInit,
    /// Answers `Init`, then disappears without a word.
    DieAfterInit,
    /// Answers `Init`, then stops reading while keeping its reply channel open.
    DeafAfterInit,
}

/// Spawns in-process hosts that follow a [`Script`] and interpret each
/// program's text as a command:
///
/// - `crash`: exit with the run outstanding
/// - `hang`: never answer
/// - `slow <ms>`: echo, but only after `ms` milliseconds
/// - `tool <name> <json args>`: call a tool and return its reply
/// - anything else: echo the program text back as the value
#[derive(Default)]
struct FakeHosts {
    spawns: AtomicUsize,
    scripts: Mutex<VecDeque<Script>>,
    init_delay: Option<Duration>,
}

impl FakeHosts {
    fn scripted(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        })
    }

    fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl HostFactory for FakeHosts {
    fn spawn(&self) -> tether::Result<HostLink> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().pop_front().unwrap_or(Script::Normal);
        let (host, endpoint) = link();
        tokio::spawn(serve(endpoint, script, self.init_delay));
        Ok(host)
    }
}

async fn serve(mut endpoint: HostEndpoint, script: Script, init_delay: Option<Duration>) {
    let tool_ids = CallIds::new();
    let mut waiting: HashMap<CallId, CallId> = HashMap::new();

    while let Some(message) = endpoint.inbox.recv().await {
        match message {
            SupervisorMessage::Init(_) => {
                if let Some(delay) = init_delay {
                    tokio::time::sleep(delay).await;
                }
                match script {
                    Script::FailInit => {
                        let _ = endpoint.reply(HostMessage::init_result(Err("boom".into())));
                        return;
                    }
                    Script::DieAfterInit => {
                        let _ = endpoint.reply(HostMessage::init_result(Ok(())));
                        return;
                    }
                    Script::DeafAfterInit => {
                        let _ = endpoint.reply(HostMessage::init_result(Ok(())));
                        let HostEndpoint { inbox, outbox } = endpoint;
                        drop(inbox);
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        drop(outbox);
                        return;
                    }
                    Script::Normal => {
                        let _ = endpoint.reply(HostMessage::init_result(Ok(())));
                    }
                }
            }
            SupervisorMessage::Run { id, code, .. } => match code.as_str() {
                "crash" => return,
                "hang" => {}
                _ if code.starts_with("slow ") => {
                    let delay = code.trim_start_matches("slow ").parse().unwrap_or(0);
                    let outbox = endpoint.outbox.clone();
                    let value = Value::String(code.clone());
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        let _ = outbox.send(HostMessage::run_result(id, RunOutput::success(value)));
                    });
                }
                _ if code.starts_with("tool ") => {
                    let mut parts = code.splitn(3, ' ').skip(1);
                    let name = parts.next().unwrap_or_default().to_owned();
                    let args = parts.next().and_then(|raw| serde_json::from_str(raw).ok());
                    let call = tool_ids.next();
                    waiting.insert(call, id);
                    let _ = endpoint.reply(HostMessage::ToolCall {
                        id: call,
                        name,
                        args,
                    });
                }
                _ => {
                    let _ = endpoint.reply(HostMessage::run_result(
                        id,
                        RunOutput::success(Value::String(code.clone())),
                    ));
                }
            },
            SupervisorMessage::ToolResult {
                id,
                ok,
                value,
                error,
            } => {
                if let Some(run) = waiting.remove(&id) {
                    let _ = endpoint.reply(HostMessage::RunResult {
                        id: run,
                        ok,
                        value,
                        error,
                        hint: None,
                    });
                }
            }
            SupervisorMessage::Reset | SupervisorMessage::Shutdown => return,
        }
    }
}

async fn patiently<T>(future: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(PATIENCE, future)
        .await
        .context("supervisor call did not complete")
}

#[tokio::test]
async fn concurrent_inits_share_one_host() -> Result<()> {
    let hosts = Arc::new(FakeHosts {
        init_delay: Some(Duration::from_millis(20)),
        ..FakeHosts::default()
    });
    let supervisor = Supervisor::builder(Arc::clone(&hosts)).build();

    let inits = join_all((0..5).map(|_| supervisor.init())).await;
    assert!(inits.iter().all(Result::is_ok), "{inits:?}");
    assert_eq!(hosts.spawns(), 1);

    let output = patiently(supervisor.run("ping", None)).await??;
    assert_eq!(output.value, Some(json!("ping")));
    assert_eq!(hosts.spawns(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_init_is_retried_by_the_next_call() -> Result<()> {
    let hosts = FakeHosts::scripted([Script::FailInit]);
    let supervisor = Supervisor::builder(Arc::clone(&hosts)).build();

    let err = supervisor.init().await.unwrap_err();
    assert_eq!(err, Error::InitFailed("boom".into()));

    patiently(supervisor.init()).await??;
    assert_eq!(hosts.spawns(), 2);
    Ok(())
}

#[tokio::test]
async fn crash_fails_every_waiting_run() -> Result<()> {
    let hosts = FakeHosts::scripted([]);
    let supervisor = Supervisor::builder(Arc::clone(&hosts)).build();
    supervisor.init().await?;

    let runs = patiently(join_all((0..4).map(|_| supervisor.run("crash", None)))).await?;
    for run in runs {
        assert_eq!(run, Err(Error::TornDown));
    }

    let output = patiently(supervisor.run("after", None)).await??;
    assert_eq!(output.value, Some(json!("after")));
    assert_eq!(hosts.spawns(), 2);
    Ok(())
}

#[tokio::test]
async fn silent_death_is_recovered_once() -> Result<()> {
    let hosts = FakeHosts::scripted([Script::DieAfterInit]);
    let supervisor = Supervisor::builder(Arc::clone(&hosts)).build();
    supervisor.init().await?;

    let output = patiently(supervisor.run("still here", None)).await??;
    assert!(output.ok);
    assert_eq!(output.value, Some(json!("still here")));
    assert_eq!(hosts.spawns(), 2);
    Ok(())
}

#[tokio::test]
async fn undelivered_run_is_retried_on_a_new_host() -> Result<()> {
    let hosts = FakeHosts::scripted([Script::DeafAfterInit]);
    let supervisor = Supervisor::builder(Arc::clone(&hosts)).build();
    supervisor.init().await?;

    let output = patiently(supervisor.run("retried", None)).await??;
    assert_eq!(output.value, Some(json!("retried")));
    assert_eq!(hosts.spawns(), 2);
    Ok(())
}

#[tokio::test]
async fn timeout_recycles_the_host() -> Result<()> {
    let hosts = FakeHosts::scripted([]);
    let supervisor = Supervisor::builder(Arc::clone(&hosts))
        .config(SupervisorConfig {
            run_timeout: Some(Duration::from_millis(50)),
            ..SupervisorConfig::default()
        })
        .build();

    let err = patiently(supervisor.run("hang", None)).await?.unwrap_err();
    assert_eq!(err, Error::Timeout(Duration::from_millis(50)));

    let output = patiently(supervisor.run("next", None)).await??;
    assert_eq!(output.value, Some(json!("next")));
    assert_eq!(hosts.spawns(), 2);
    Ok(())
}

#[tokio::test]
async fn queued_timeout_spares_the_run_ahead() -> Result<()> {
    let hosts = FakeHosts::scripted([]);
    let supervisor = Supervisor::builder(Arc::clone(&hosts)).build();
    supervisor.init().await?;

    let first = supervisor.run("slow 300", None);
    let second = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor
            .run_with_timeout("second", None, Duration::from_millis(200))
            .await
    };
    let (first, second) = patiently(async { tokio::join!(first, second) }).await?;

    assert_eq!(second, Err(Error::Timeout(Duration::from_millis(200))));
    let first = first.context("run ahead of the expired one failed")?;
    assert_eq!(first.value, Some(json!("slow 300")));

    let output = patiently(supervisor.run("third", None)).await??;
    assert_eq!(output.value, Some(json!("third")));
    assert_eq!(hosts.spawns(), 1);
    Ok(())
}

#[tokio::test]
async fn reset_and_shutdown() -> Result<()> {
    let hosts = FakeHosts::scripted([]);
    let supervisor = Supervisor::builder(Arc::clone(&hosts)).build();

    patiently(supervisor.run("one", None)).await??;
    supervisor.reset()?;
    patiently(supervisor.run("two", None)).await??;
    assert_eq!(hosts.spawns(), 2);

    supervisor.shutdown();
    assert!(supervisor.is_closed());
    assert_eq!(supervisor.run("three", None).await, Err(Error::Closed));
    assert_eq!(supervisor.init().await, Err(Error::Closed));
    assert_eq!(supervisor.reset(), Err(Error::Closed));
    assert_eq!(hosts.spawns(), 2);
    Ok(())
}

struct Double;

#[derive(Deserialize)]
struct DoubleArgs {
    n: i64,
}

#[async_trait::async_trait]
impl Tool for Double {
    const NAME: &'static str = "double";
    type Args = DoubleArgs;

    async fn call(&self, args: DoubleArgs) -> Result<Value, ToolError> {
        Ok(json!(args.n * 2))
    }
}

fn tools() -> Result<ToolRegistry> {
    let mut tools = ToolRegistry::new();
    tools.register(Double)?;
    tools.register_fn("echo", |args: Value| async move { Ok(args) })?;
    tools.register_fn("fail", |_: Value| async { Err(ToolError::failed("upstream 503")) })?;
    tools.declare("lookup")?;
    Ok(tools)
}

#[tokio::test]
async fn tool_calls_are_routed_and_always_answered() -> Result<()> {
    let events = Arc::new(Mutex::new(Vec::<ToolCallEvent>::new()));
    let sink = Arc::clone(&events);
    let supervisor = Supervisor::builder(FakeHosts::scripted([]))
        .tools(tools()?)
        .observer(move |event: &ToolCallEvent| sink.lock().push(event.clone()))
        .build();

    let cases = [
        ("tool double {\"n\": 21}", Ok(json!(42))),
        ("tool echo {\"a\": [1, 2]}", Ok(json!({"a": [1, 2]}))),
        ("tool fail {}", Err("upstream 503".to_owned())),
        ("tool missing {}", Err("unknown tool 'missing'".to_owned())),
        ("tool lookup {}", Err("tool handler not configured".to_owned())),
        (
            "tool run {}",
            Err("tool 'run' executes code and cannot be called from a running program".to_owned()),
        ),
    ];
    for (code, expected) in cases {
        let output = patiently(supervisor.run(code, None)).await??;
        match expected {
            Ok(value) => {
                assert!(output.ok, "{code}: {:?}", output.error);
                assert_eq!(output.value, Some(value));
            }
            Err(error) => {
                assert!(!output.ok, "{code}");
                assert_eq!(output.error, Some(error));
            }
        }
    }

    let output = patiently(supervisor.run("tool double {\"n\": \"x\"}", None)).await??;
    assert!(
        output
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("invalid arguments for tool 'double'")),
        "{:?}",
        output.error
    );

    let events = events.lock();
    assert_eq!(events.len(), 7);
    assert_eq!(events[0].name, "double");
    assert!(events[0].ok);
    assert_eq!(events[0].args_byte_size, "{\"n\":21}".len());
    assert_eq!(events[2].error.as_deref(), Some("upstream 503"));
    assert!(!events[3].ok);
    Ok(())
}

#[tokio::test]
async fn tool_calls_without_a_registry_are_not_configured() -> Result<()> {
    let supervisor = Supervisor::builder(FakeHosts::scripted([])).build();
    let output = patiently(supervisor.run("tool unknown_tool", None)).await??;
    assert!(!output.ok);
    assert_eq!(output.error.as_deref(), Some("tool handler not configured"));
    Ok(())
}

#[tokio::test]
async fn panicking_tools_and_observers_still_answer() -> Result<()> {
    let mut tools = ToolRegistry::new();
    tools.register_fn("explode", |_: Value| async {
        if true {
            panic!("tool bug");
        }
        Ok(Value::Null)
    })?;
    let supervisor = Supervisor::builder(FakeHosts::scripted([]))
        .tools(tools)
        .observer(|event: &ToolCallEvent| assert!(event.ok, "observer bug"))
        .build();

    let output = patiently(supervisor.run("tool explode {}", None)).await??;
    assert!(!output.ok);
    assert_eq!(output.error.as_deref(), Some("tool 'explode' panicked"));

    let output = patiently(supervisor.run("fine", None)).await??;
    assert_eq!(output.value, Some(json!("fine")));
    Ok(())
}
