// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! TTY device files
//!
//! A TTY is a functional file under the TTY directory. The host renderer
//! keeps an `output` handle on it to collect what processes print, and an
//! `input` producer handle whose writes are redirected to the virtual stdin
//! of every root process.

use sandkern_proto::{AccessFlag, Attributes, OpenType, StatusFlag};
use serde::Serialize;
use tracing::info;

use crate::error::FsResult;
use crate::vfs::{HandleId, OpenOptions, Vfs};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TtyHandles {
    pub id: u32,
    pub path: String,
    pub output: HandleId,
    pub input: HandleId,
}

pub(crate) fn attach(vfs: &Vfs, directory: &str, id: u32) -> FsResult<TtyHandles> {
    vfs.mkdir(directory, true, Some(Attributes::READ_WRITE))?;
    let path = format!("{}/{}", directory.trim_end_matches('/'), id);

    let output = vfs.open(
        &path,
        &OpenOptions::new(AccessFlag::ReadOnly, StatusFlag::Create, OpenType::Functional).privileged(),
    )?;
    let input = match vfs.open(
        &path,
        &OpenOptions::new(AccessFlag::WriteOnly, StatusFlag::Normal, OpenType::Virtual),
    ) {
        Ok(handle) => handle,
        Err(err) => {
            vfs.close(output);
            return Err(err);
        }
    };

    info!(id, %path, %output, %input, "attached tty");
    Ok(TtyHandles {
        id,
        path,
        output,
        input,
    })
}
