// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Programs shipped with the daemon
//!
//! They only talk to the kernel through their syscall client, like any other
//! program run by the task host.

use std::sync::Arc;

use async_trait::async_trait;
use sandkern_broker::{ClientError, Program, ProgramContext, TaskHost};
use sandkern_proto::{AccessFlag, ByteCount, EntryType, OpenType, StatusFlag, SyscallError, STDIN, STDOUT};
use tracing::debug;

pub const PROGRAM_DIR: &str = "/system/program";
pub const INIT_SCRIPT: &str = "/system/config/init";

/// Launch targets registered by [`register`], also installed under [`PROGRAM_DIR`]
pub const BUILTINS: [&str; 4] = ["init", "echo", "cat", "ls"];

pub fn register(host: &TaskHost) {
    host.register("init", Arc::new(Init));
    host.register("echo", Arc::new(Echo));
    host.register("cat", Arc::new(Cat));
    host.register("ls", Arc::new(Ls));
}

/// Absolute path of a command word; bare names live in [`PROGRAM_DIR`]
pub fn command_path(word: &str) -> String {
    if word.starts_with('/') {
        word.to_string()
    } else {
        format!("{PROGRAM_DIR}/{word}")
    }
}

async fn read_file(ctx: &ProgramContext, path: &str) -> Result<Vec<u8>, ClientError> {
    let fd = ctx
        .sys
        .open(path, AccessFlag::ReadOnly, StatusFlag::Normal, OpenType::Normal)
        .await?;
    let data = ctx.sys.read(fd, ByteCount::All, 0).await;
    ctx.sys.close(fd).await?;
    data
}

/// Copy stdin to stdout until stdin goes away
async fn echo_stdin(ctx: &ProgramContext) -> anyhow::Result<()> {
    loop {
        match ctx.sys.read(STDIN, ByteCount::All, 0).await {
            Ok(bytes) => {
                ctx.sys.write(STDOUT, &bytes, ByteCount::All, 0).await?;
            }
            Err(ClientError::Kernel(SyscallError::NoSuchFileHandle)) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Root process: runs each line of the init script, then echoes console input
pub struct Init;

#[async_trait]
impl Program for Init {
    async fn run(&self, ctx: ProgramContext) -> anyhow::Result<()> {
        ctx.print(&format!("sandkern init (pid {})\n", ctx.pid)).await?;

        let script_path = ctx.args.first().map(String::as_str).unwrap_or(INIT_SCRIPT);
        let script = match read_file(&ctx, script_path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(ClientError::Kernel(SyscallError::NoSuchEntry)) => String::new(),
            Err(err) => return Err(err.into()),
        };

        for line in script.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let Some(command) = words.next() else {
                continue;
            };
            let path = command_path(command);
            let args = words.map(str::to_string).collect();
            match ctx.sys.exec(&path, args, ctx.env.clone()).await {
                Ok(child) => debug!(%child, %path, "init started command"),
                Err(err) => {
                    ctx.eprint(&format!("init: {command}: {err}\n")).await?;
                }
            }
        }

        echo_stdin(&ctx).await
    }
}

pub struct Echo;

#[async_trait]
impl Program for Echo {
    async fn run(&self, ctx: ProgramContext) -> anyhow::Result<()> {
        ctx.print(&format!("{}\n", ctx.args.join(" "))).await?;
        Ok(())
    }
}

/// Print files, or copy stdin when given none
pub struct Cat;

#[async_trait]
impl Program for Cat {
    async fn run(&self, ctx: ProgramContext) -> anyhow::Result<()> {
        if ctx.args.is_empty() {
            return echo_stdin(&ctx).await;
        }
        for path in &ctx.args {
            match read_file(&ctx, path).await {
                Ok(bytes) => {
                    ctx.sys.write(STDOUT, &bytes, ByteCount::All, 0).await?;
                }
                Err(err) => {
                    ctx.eprint(&format!("cat: {path}: {err}\n")).await?;
                }
            }
        }
        Ok(())
    }
}

/// List directories, one entry per line, directories suffixed with `/`
pub struct Ls;

impl Ls {
    async fn list(ctx: &ProgramContext, path: &str) -> Result<String, ClientError> {
        let fd = ctx.sys.opendir(path).await?;
        let entries = ctx.sys.readdir(fd).await;
        ctx.sys.close(fd).await?;

        let mut listing = String::new();
        for entry in entries? {
            listing.push_str(&entry.name);
            if entry.kind == EntryType::Directory {
                listing.push('/');
            }
            listing.push('\n');
        }
        Ok(listing)
    }
}

#[async_trait]
impl Program for Ls {
    async fn run(&self, ctx: ProgramContext) -> anyhow::Result<()> {
        let paths = if ctx.args.is_empty() {
            vec!["/".to_string()]
        } else {
            ctx.args.clone()
        };
        for path in &paths {
            match Self::list(&ctx, path).await {
                Ok(listing) => {
                    ctx.print(&listing).await?;
                }
                Err(err) => {
                    ctx.eprint(&format!("ls: {path}: {err}\n")).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_commands_resolve_under_program_dir() {
        assert_eq!(command_path("ls"), "/system/program/ls");
        assert_eq!(command_path("/home/tool"), "/home/tool");
    }
}
