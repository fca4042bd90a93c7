//! Client protocol: framing, credential attribution, and dispatch.
//!
//! Requests and responses are length-delimited JSON over the control
//! socket: a little-endian `u32` frame length followed by the body.
//! Every connection is attributed once via `SO_PEERCRED`; the client's
//! own container (found through its freezer cgroup) scopes all names it
//! sends or receives.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use warden_common::error::{Result, WardenError};
use warden_common::types::{ContainerId, Cred};
use warden_runtime::container::Actions;
use warden_runtime::holder::Holder;

/// Frames larger than this are protocol errors.
const MAX_FRAME: u32 = 1024 * 1024;

/// One client request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Create { name: String },
    Destroy { name: String },
    Start { name: String },
    Stop { name: String },
    Pause { name: String },
    Resume { name: String },
    Kill { name: String, signal: i32 },
    SetProperty { name: String, property: String, value: String },
    GetProperty { name: String, property: String },
    GetData { name: String, data: String },
    List,
    Wait { pattern: String },
    Version,
}

/// Error body carried in a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    /// Machine-readable kind from the error taxonomy.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Underlying errno, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
}

/// One response; exactly one of `error`/`value`/`list` is populated,
/// except for acknowledgement-only replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<String>>,
    /// New state accompanying a `Wait` answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl Response {
    /// Success without a payload.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// Success carrying one string.
    #[must_use]
    pub fn value(value: String) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    /// Success carrying a name list.
    #[must_use]
    pub fn list(list: Vec<String>) -> Self {
        Self {
            list: Some(list),
            ..Self::default()
        }
    }

    /// Failure derived from a daemon error; clients never see the
    /// internal error object itself.
    #[must_use]
    pub fn from_error(error: &WardenError) -> Self {
        Self {
            error: Some(WireError {
                kind: error.kind().to_string(),
                message: error.to_string(),
                errno: error.raw_errno(),
            }),
            ..Self::default()
        }
    }
}

/// Reads one length-delimited frame.
///
/// # Errors
///
/// Returns an error on EOF, an oversized frame, or a read failure
/// (including the per-read timeout installed on the stream).
pub fn read_frame(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut header = [0_u8; 4];
    stream
        .read_exact(&mut header)
        .map_err(|e| WardenError::io("rpc frame header", e))?;
    let len = u32::from_le_bytes(header);
    if len == 0 || len > MAX_FRAME {
        return Err(WardenError::InvalidValue(format!(
            "bad frame length {len}"
        )));
    }
    let mut body = vec![0_u8; len as usize];
    stream
        .read_exact(&mut body)
        .map_err(|e| WardenError::io("rpc frame body", e))?;
    Ok(body)
}

/// Writes one length-delimited frame.
///
/// # Errors
///
/// Returns an error when the peer is gone or the write fails.
pub fn write_frame(stream: &mut UnixStream, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| WardenError::InvalidValue("frame too large".into()))?;
    stream
        .write_all(&len.to_le_bytes())
        .and_then(|()| stream.write_all(body))
        .and_then(|()| stream.flush())
        .map_err(|e| WardenError::io("rpc frame write", e))
}

/// Serializes and sends a response.
///
/// # Errors
///
/// As [`write_frame`].
pub fn send_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    let body = serde_json::to_vec(response)?;
    write_frame(stream, &body)
}

/// One attributed connection.
#[derive(Debug)]
pub struct Client {
    /// The connection itself.
    pub stream: UnixStream,
    /// Peer credentials from `SO_PEERCRED`.
    pub cred: Cred,
    /// Peer pid.
    pub pid: i32,
    /// The container the peer runs in, scoping its view of the tree.
    pub container: ContainerId,
    /// Outstanding wait token, when the client is blocked in `Wait`.
    pub waiting: Option<u64>,
}

impl Client {
    /// Attributes a fresh connection and installs the per-read timeout.
    ///
    /// # Errors
    ///
    /// Returns an error when `SO_PEERCRED` fails.
    pub fn accept(stream: UnixStream, holder: &Holder, read_timeout: Duration) -> Result<Self> {
        let creds =
            nix::sys::socket::getsockopt(&stream, nix::sys::socket::sockopt::PeerCredentials)
                .map_err(|e| WardenError::errno("SO_PEERCRED", e))?;
        let _ = stream.set_read_timeout(Some(read_timeout));
        let pid = creds.pid();
        let client = Self {
            cred: Cred::new(creds.uid(), creds.gid()),
            container: holder.container_of_pid(pid),
            pid,
            stream,
            waiting: None,
        };
        tracing::debug!(pid, cred = %client.cred, "client connected");
        Ok(client)
    }
}

/// Outcome of dispatching one request.
pub enum Dispatch {
    /// Reply immediately.
    Reply(Response),
    /// The client is parked in `Wait`; reply comes from a notification.
    Parked,
}

/// Routes one request to the holder, translating every name across the
/// client's namespace boundary.
pub fn dispatch(
    holder: &mut Holder,
    client: &mut Client,
    request: &Request,
    wait_token: u64,
    actions: &mut Actions,
) -> Dispatch {
    let reply = match request {
        Request::Create { name } => self_abs(holder, client, name, false)
            .and_then(|abs| holder.create(&abs, client.cred).map(|_| Response::ok())),
        Request::Destroy { name } => self_abs(holder, client, name, false).and_then(|abs| {
            holder.destroy(&abs, client.cred).map(|mut done| {
                merge(actions, &mut done);
                Response::ok()
            })
        }),
        Request::Start { name } => self_abs(holder, client, name, false).and_then(|abs| {
            holder.start(&abs, client.cred).map(|mut done| {
                merge(actions, &mut done);
                Response::ok()
            })
        }),
        Request::Stop { name } => self_abs(holder, client, name, false).and_then(|abs| {
            holder.stop(&abs, client.cred).map(|mut done| {
                merge(actions, &mut done);
                Response::ok()
            })
        }),
        Request::Pause { name } => self_abs(holder, client, name, false).and_then(|abs| {
            holder.pause(&abs, client.cred).map(|mut done| {
                merge(actions, &mut done);
                Response::ok()
            })
        }),
        Request::Resume { name } => self_abs(holder, client, name, false).and_then(|abs| {
            holder.resume(&abs, client.cred).map(|mut done| {
                merge(actions, &mut done);
                Response::ok()
            })
        }),
        Request::Kill { name, signal } => self_abs(holder, client, name, false)
            .and_then(|abs| {
                let signal = nix::sys::signal::Signal::try_from(*signal)
                    .map_err(|_| WardenError::InvalidValue(format!("bad signal {signal}")))?;
                holder.kill(&abs, signal, client.cred).map(|()| Response::ok())
            }),
        Request::SetProperty {
            name,
            property,
            value,
        } => self_abs(holder, client, name, false).and_then(|abs| {
            holder
                .set_property(&abs, property, value, client.cred)
                .map(|()| Response::ok())
        }),
        Request::GetProperty { name, property } => self_abs(holder, client, name, true)
            .and_then(|abs| holder.get_property(&abs, property).map(Response::value)),
        Request::GetData { name, data } => self_abs(holder, client, name, true)
            .and_then(|abs| holder.get_data(&abs, data).map(Response::value)),
        Request::List => {
            let mut visible = Vec::new();
            for name in holder.list() {
                if let Ok(relative) = holder.relative_name(client.container, &name) {
                    visible.push(relative);
                }
            }
            Ok(Response::list(visible))
        }
        Request::Wait { pattern } => {
            let ns = holder.namespace_of(client.container);
            let absolute = format!("{ns}{pattern}");
            // Parked either way; an already-settled container produces an
            // immediate notification that the loop answers this round.
            client.waiting = Some(wait_token);
            let mut done = holder.wait(&absolute, wait_token);
            merge(actions, &mut done);
            return Dispatch::Parked;
        }
        Request::Version => Ok(Response::value(env!("CARGO_PKG_VERSION").to_string())),
    };

    match reply {
        Ok(response) => Dispatch::Reply(response),
        Err(error) => {
            tracing::debug!(?request, error = %error, "request failed");
            Dispatch::Reply(Response::from_error(&error))
        }
    }
}

fn self_abs(
    holder: &Holder,
    client: &Client,
    name: &str,
    resolve_meta: bool,
) -> Result<String> {
    holder.absolute_name(client.container, name, resolve_meta)
}

fn merge(into: &mut Actions, from: &mut Actions) {
    into.notified.append(&mut from.notified);
    into.ack_pids.append(&mut from.ack_pids);
}
