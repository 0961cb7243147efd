// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Messages exchanged between the CLI and a running supervisor.
//!
//! Every message is a bincode encoded value preceded by its length as a big endian `u32`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::procs::RunnerState;
use crate::Error;

/// Frames larger than this are refused
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// A control command, `None` targets every service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Start(Option<String>),
    Stop(Option<String>),
    Restart(Option<String>),
    Status(Option<String>),
}

impl Request {
    pub fn target(&self) -> Option<&str> {
        match self {
            Request::Start(name)
            | Request::Stop(name)
            | Request::Restart(name)
            | Request::Status(name) => name.as_deref(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// States of the targeted services after the command was applied
    States(Vec<RunnerState>),
    Error(String),
}

pub async fn write_msg<W, T>(writer: &mut W, msg: &T) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(msg)?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| format!("message of {} bytes is too large", bytes.len()))?;

    writer.write_u32(len).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;

    Ok(())
}

pub async fn read_msg<R, T>(reader: &mut R) -> Result<T, Error>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(format!("message of {} bytes is too large", len).into());
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).await?;

    Ok(bincode::deserialize(&bytes)?)
}
