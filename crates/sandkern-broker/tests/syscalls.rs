// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end syscalls: task-hosted programs talking to a live broker

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandkern_broker::{
    kernel_channel, ClientError, KernelMessage, KernelPort, Program, ProgramContext,
    SyscallBroker, TaskHost,
};
use sandkern_core::{
    ContextSpec, Executable, ExecutionContext, HostAdapter, HostError, Kernel, KernelConfig,
    SpawnRequest,
};
use sandkern_proto::{
    process_init_envelope, AccessFlag, Attributes, ByteCount, EntryType, Envelope, OpenType,
    Operation, Outcome, Pid, ProcessLaunch, ResponsePacket, StatusFlag, SyscallError,
    SyscallName, SyscallRequest,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

struct FnProgram<F>(F);

#[async_trait]
impl<F, Fut> Program for FnProgram<F>
where
    F: Fn(ProgramContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, ctx: ProgramContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

struct Harness {
    kernel: Arc<Kernel>,
    host: Arc<TaskHost>,
    port: KernelPort,
    _shutdown: oneshot::Sender<()>,
}

fn start_harness() -> Harness {
    let (port, inbox) = kernel_channel();
    let host = Arc::new(TaskHost::new(port.clone()));
    let kernel = Arc::new(Kernel::new(KernelConfig::default(), host.clone()));

    let vfs = kernel.vfs();
    vfs.mkdir("/system/program", true, Some(Attributes::READ_EXECUTE)).unwrap();
    vfs.mkdir("/home", false, Some(Attributes::ALL)).unwrap();

    let broker = SyscallBroker::new(kernel.clone());
    let (shutdown, stop) = oneshot::channel();
    tokio::spawn(async move { broker.run(inbox, stop).await });

    Harness {
        kernel,
        host,
        port,
        _shutdown: shutdown,
    }
}

fn program<F, Fut>(f: F) -> Arc<dyn Program>
where
    F: Fn(ProgramContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnProgram(f))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn file_round_trip_through_syscalls() {
    let harness = start_harness();
    let (report, mut results) = mpsc::unbounded_channel();
    harness.host.register(
        "writer",
        program(move |ctx| {
            let report = report.clone();
            async move {
                let sys = &ctx.sys;
                let fd = sys
                    .open("/home/note", AccessFlag::WriteOnly, StatusFlag::Create, OpenType::Normal)
                    .await?;
                let written = sys.write(fd, b"abc", ByteCount::All, 0).await?;
                let closed = sys.close(fd).await?;

                let fd2 = sys
                    .open("/home/note", AccessFlag::ReadOnly, StatusFlag::Normal, OpenType::Normal)
                    .await?;
                let data = sys.read(fd2, ByteCount::All, 0).await?;
                let dir = sys.opendir("/home").await?;
                let listing = sys.readdir(dir).await?;
                sys.close(fd2).await?;
                let closed_twice = sys.close(fd2).await?;

                report.send((fd, written, closed, fd2, data, dir, listing, closed_twice))?;
                Ok(())
            }
        }),
    );

    harness
        .kernel
        .spawn(SpawnRequest::new("writer"))
        .unwrap();
    let (fd, written, closed, fd2, data, dir, listing, closed_twice) = results.recv().await.unwrap();

    assert_eq!(fd, 0);
    assert_eq!(written, 3);
    assert!(closed);
    assert_eq!(fd2, 0, "lowest free local fd is reused");
    assert_eq!(data, b"abc");
    assert_eq!(dir, 1);
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "note");
    assert_eq!(listing[0].kind, EntryType::File);
    assert!(!closed_twice);
}

#[tokio::test]
async fn kernel_errors_reach_the_caller_by_name() {
    let harness = start_harness();
    let (report, mut results) = mpsc::unbounded_channel();
    harness.host.register(
        "errant",
        program(move |ctx| {
            let report = report.clone();
            async move {
                let create = ctx
                    .sys
                    .open("/system/x", AccessFlag::ReadWrite, StatusFlag::Create, OpenType::Normal)
                    .await;
                let bad_fd = ctx.sys.read(9, ByteCount::All, 0).await;
                let missing = ctx.sys.opendir("/nowhere/at/all").await;
                report.send((create, bad_fd, missing)).ok();
                Ok(())
            }
        }),
    );

    harness.kernel.spawn(SpawnRequest::new("errant")).unwrap();
    let (create, bad_fd, missing) = results.recv().await.unwrap();
    assert!(matches!(
        create,
        Err(ClientError::Kernel(SyscallError::OperationInaccessible(Operation::Create)))
    ));
    assert!(matches!(bad_fd, Err(ClientError::Kernel(SyscallError::NoSuchFileHandle))));
    assert!(matches!(missing, Err(ClientError::Kernel(SyscallError::ParentDoesntExist))));
}

#[tokio::test]
async fn suspended_read_does_not_block_other_calls() {
    let harness = start_harness();
    let (report, mut results) = mpsc::unbounded_channel();
    harness.host.register(
        "pipe",
        program(move |ctx| {
            let report = report.clone();
            async move {
                let sys = &ctx.sys;
                let reader = sys
                    .open("/home/pipe", AccessFlag::ReadOnly, StatusFlag::Create, OpenType::Functional)
                    .await?;
                let writer = sys
                    .open("/home/pipe", AccessFlag::WriteOnly, StatusFlag::Normal, OpenType::Normal)
                    .await?;

                let read = sys.read(reader, ByteCount::All, 0);
                let write = async {
                    // writes with no reader yet are dropped, so retry until one lands
                    loop {
                        let n = sys.write(writer, b"ping", ByteCount::All, 0).await?;
                        if n > 0 {
                            return Ok::<_, ClientError>(n);
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                };
                let (data, written) = tokio::join!(read, write);
                report.send((data?, written?))?;
                Ok(())
            }
        }),
    );

    harness.kernel.spawn(SpawnRequest::new("pipe")).unwrap();
    let (data, written) = results.recv().await.unwrap();
    assert_eq!(data, b"ping");
    assert_eq!(written, 4);
}

#[tokio::test]
async fn exec_spawns_child_with_inherited_parent() {
    let harness = start_harness();
    let (report, mut results) = mpsc::unbounded_channel::<(Pid, Vec<String>)>();
    harness
        .kernel
        .install_executable("/system/program/child", &Executable::direct("child"))
        .await
        .unwrap();

    let child_report = report.clone();
    harness.host.register(
        "child",
        program(move |ctx| {
            let report = child_report.clone();
            async move {
                report.send((ctx.pid, ctx.args.clone()))?;
                Ok(())
            }
        }),
    );
    harness.host.register(
        "parent",
        program(move |ctx| {
            let report = report.clone();
            async move {
                let child = ctx
                    .sys
                    .exec("/system/program/child", vec!["--flag".into()], vec![])
                    .await?;
                report.send((ctx.pid, vec![child.to_string()]))?;
                Ok(())
            }
        }),
    );

    let parent = harness.kernel.spawn(SpawnRequest::new("parent")).unwrap();
    let mut seen = vec![results.recv().await.unwrap(), results.recv().await.unwrap()];
    seen.sort();

    let child = Pid(parent.0 + 1);
    assert_eq!(seen[0], (parent, vec![child.to_string()]));
    assert_eq!(seen[1], (child, vec!["--flag".to_string()]));
}

#[tokio::test]
async fn finished_programs_leave_the_process_table() {
    let harness = start_harness();
    harness.host.register("noop", program(|_ctx| async { Ok(()) }));
    harness.kernel.spawn(SpawnRequest::new("noop")).unwrap();
    harness.kernel.spawn(SpawnRequest::new("noop")).unwrap();

    let kernel = harness.kernel.clone();
    wait_until(move || kernel.processes().all_processes().is_empty()).await;
    assert_eq!(harness.host.running_contexts(), 0);
}

#[tokio::test]
async fn unknown_tokens_and_targets_are_rejected() {
    let harness = start_harness();
    let bogus = SyscallRequest::Opendir { path: "/".into() }
        .to_envelope("not-a-token", 0)
        .unwrap();
    assert!(harness.port.post(bogus));

    let spawn = harness.kernel.spawn(SpawnRequest::new("unregistered"));
    assert!(spawn.is_err());
    assert!(harness.kernel.processes().all_processes().is_empty());

    // the broker keeps serving after dropping the bogus request
    let (report, mut results) = mpsc::unbounded_channel();
    harness.host.register(
        "lister",
        program(move |ctx| {
            let report = report.clone();
            async move {
                let dir = ctx.sys.opendir("/").await?;
                report.send(ctx.sys.readdir(dir).await?)?;
                Ok(())
            }
        }),
    );
    harness.kernel.spawn(SpawnRequest::new("lister")).unwrap();
    let listing = results.recv().await.unwrap();
    let names: Vec<_> = listing.into_iter().map(|e| e.name).collect();
    assert_eq!(names, ["system", "home"]);
}

/// Host whose contexts are bare outboxes the test reads directly
#[derive(Default)]
struct OutboxHost {
    contexts: Mutex<HashMap<Pid, (String, mpsc::UnboundedReceiver<Envelope>)>>,
}

impl OutboxHost {
    fn take(&self, pid: Pid) -> (String, mpsc::UnboundedReceiver<Envelope>) {
        self.contexts.lock().unwrap().remove(&pid).unwrap()
    }
}

impl HostAdapter for OutboxHost {
    fn create_context(&self, spec: &ContextSpec) -> Result<ExecutionContext, HostError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.contexts
            .lock()
            .unwrap()
            .insert(spec.pid, (spec.token.clone(), rx));
        Ok(ExecutionContext::new(spec.pid.0 as u64, tx))
    }

    fn terminate_context(&self, _context: &ExecutionContext) {}
}

fn create_outbox_broker() -> (Arc<OutboxHost>, Arc<Kernel>, SyscallBroker) {
    let host = Arc::new(OutboxHost::default());
    let kernel = Arc::new(Kernel::new(KernelConfig::default(), host.clone()));
    kernel.vfs().mkdir("/home", false, Some(Attributes::ALL)).unwrap();
    let broker = SyscallBroker::new(kernel.clone());
    (host, kernel, broker)
}

#[tokio::test]
async fn malformed_arguments_are_answered_with_an_error() {
    let (host, kernel, broker) = create_outbox_broker();
    let pid = kernel.spawn(SpawnRequest::new("raw")).unwrap();
    let (token, mut outbox) = host.take(pid);

    broker.handle_message(KernelMessage::Envelope(process_init_envelope(&token, 0)));
    let launch = ResponsePacket::decode(&outbox.recv().await.unwrap()).unwrap();
    let launch: ProcessLaunch = launch.outcome().unwrap().into_result().unwrap();
    assert_eq!(launch.pid, pid);

    let malformed = Envelope::new(
        SyscallName::Read,
        vec![json!(token), json!(5), json!("not-an-fd"), json!(-1), json!(0)],
    );
    broker.handle_message(KernelMessage::Envelope(malformed));

    let reply = tokio::time::timeout(Duration::from_secs(5), outbox.recv())
        .await
        .expect("malformed syscall got no response")
        .unwrap();
    let reply = ResponsePacket::decode(&reply).unwrap();
    assert_eq!(reply.name, SyscallName::Read);
    assert_eq!(reply.correlation_id, 5);
    assert!(matches!(
        reply.outcome::<Vec<u8>>().unwrap(),
        Outcome::Err(SyscallError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn syscalls_before_the_handshake_are_dropped() {
    let (host, kernel, broker) = create_outbox_broker();
    let pid = kernel.spawn(SpawnRequest::new("raw")).unwrap();
    let (token, mut outbox) = host.take(pid);
    let fds = kernel.processes().fds(pid).unwrap();
    let handles = kernel.vfs().open_handles();

    let opendir = SyscallRequest::Opendir { path: "/home".into() }
        .to_envelope(&token, 1)
        .unwrap();
    broker.handle_message(KernelMessage::Envelope(opendir));

    let reply = tokio::time::timeout(Duration::from_millis(200), outbox.recv()).await;
    assert!(reply.is_err(), "pre-handshake syscall was answered: {reply:?}");
    assert_eq!(kernel.vfs().open_handles(), handles);
    assert_eq!(kernel.processes().fds(pid).unwrap(), fds);

    let stranger = SyscallRequest::Opendir { path: "/home".into() }
        .to_envelope("not-a-token", 2)
        .unwrap();
    broker.handle_message(KernelMessage::Envelope(stranger));
    tokio::task::yield_now().await;
    assert_eq!(kernel.vfs().open_handles(), handles);
}
