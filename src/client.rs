//! Client lifecycle: connection management, session continuity and the
//! request/response engine.
//!
//! One [`Client`] owns at most one TCP connection at a time and walks a
//! simple lifecycle per attempt: pick the next endpoint, connect,
//! handshake, then serve batches until an I/O error drops the connection.
//! Reconnection is lazy: a dropped connection is only re-established when
//! the next request needs it, and the request is re-sent as-is, so a
//! mutating batch is exactly-once on success and at-least-once on the
//! wire. The session sequence reconciliation in the handshake is what
//! disambiguates a lost acknowledgment afterwards.
//!
//! A client is a single logical thread of control: every method takes
//! `&mut self` and all socket I/O is sequential. Wrap it in a mutex if it
//! must be shared.
//!
//! # Example
//!
//! ```ignore
//! use resql::Client;
//!
//! let mut client = Client::builder("my-cluster")
//!     .url("tcp://127.0.0.1:7600")
//!     .connect()
//!     .await?;
//!
//! client.put("INSERT INTO t VALUES (?, ?)")?;
//! client.bind_index(0, 1i64)?;
//! client.bind_index(1, "a")?;
//! let rs = client.execute(false).await?;
//! assert_eq!(rs.lines_changed(), 1);
//!
//! client.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::{timeout, Instant};

use crate::config::{ClientBuilder, Config, Endpoint};
use crate::error::{Error, Result};
use crate::protocol::buffer::FrameBuffer;
use crate::protocol::wire::{self, bind, flag, tag, ResponseCode};
use crate::result::ResultSet;
use crate::value::Value;

/// Socket send/receive buffer size, also the initial frame buffer size.
const SOCK_BUF_SIZE: usize = 32 * 1024;

/// Per-attempt budget for one connect + handshake, independent of the
/// overall call deadline.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to a statement prepared on the server.
///
/// The id is assigned by the server and only meaningful to the session
/// that prepared it; the SQL text is retained for the caller's benefit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    id: u64,
    sql: String,
}

impl PreparedStatement {
    /// Server-assigned statement id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The SQL text this statement was prepared from.
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Connected client for one resql cluster.
#[derive(Debug)]
pub struct Client {
    client_name: String,
    cluster_name: String,
    timeout: Duration,
    local_addr: Option<SocketAddr>,

    /// Session sequence number, incremented once per mutating batch.
    seq: u64,
    /// Whether any mutating batch was ever sent under this identity.
    /// Until then the server's seq is adopted verbatim on handshake.
    sent_mutation: bool,
    has_statement: bool,
    is_shutdown: bool,

    stream: Option<TcpStream>,
    endpoints: Vec<Endpoint>,
    endpoint_index: usize,
    /// Cluster configuration version of `endpoints`. Only a strictly
    /// greater term may replace the list.
    term: u64,
    /// Last response code seen in a handshake, kept for timeout
    /// diagnostics.
    last_rc: Option<ResponseCode>,

    req: FrameBuffer,
    resp: FrameBuffer,
}

impl Client {
    /// Create a builder for the named cluster.
    pub fn builder(cluster_name: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(cluster_name)
    }

    /// Connect with a validated configuration, rotating through the
    /// endpoint list until connected or the deadline expires.
    pub(crate) async fn connect(config: Config) -> Result<Client> {
        let mut client = Client {
            client_name: config.client_name,
            cluster_name: config.cluster_name,
            timeout: config.timeout,
            local_addr: config.local_addr,
            seq: 0,
            sent_mutation: false,
            has_statement: false,
            is_shutdown: false,
            stream: None,
            endpoints: config.endpoints,
            endpoint_index: 0,
            term: 0,
            last_rc: None,
            req: FrameBuffer::with_capacity(SOCK_BUF_SIZE),
            resp: FrameBuffer::with_capacity(SOCK_BUF_SIZE),
        };

        let deadline = Instant::now() + client.timeout;

        loop {
            match client.try_connect().await {
                Ok(()) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::debug!(error = %e, "connect attempt failed"),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    last_rc: client.last_rc,
                });
            }
        }

        client.clear();
        Ok(client)
    }

    /// The session identity this client connects under.
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// The cluster this client talks to.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Queue a literal SQL statement into the current batch.
    pub fn put(&mut self, sql: &str) -> Result<()> {
        self.ensure_live()?;
        self.finish_open_statement();
        self.has_statement = true;
        self.req.put_u8(flag::OP);
        self.req.put_u8(flag::STMT);
        self.req.put_str(Some(sql));
        Ok(())
    }

    /// Queue a previously prepared statement into the current batch.
    pub fn put_prepared(&mut self, statement: &PreparedStatement) -> Result<()> {
        self.ensure_live()?;
        self.finish_open_statement();
        self.has_statement = true;
        self.req.put_u8(flag::OP);
        self.req.put_u8(flag::STMT_ID);
        self.req.put_u64(statement.id);
        Ok(())
    }

    /// Bind a value to a positional parameter of the last queued
    /// statement.
    pub fn bind_index(&mut self, index: u32, value: impl Into<Value>) -> Result<()> {
        self.ensure_live()?;
        if !self.has_statement {
            return Err(Error::Misuse("bind requires a queued statement".into()));
        }
        self.req.put_u8(bind::INDEX);
        self.req.put_u32(index);
        wire::put_value(&mut self.req, &value.into());
        Ok(())
    }

    /// Bind a value to a named parameter (e.g. `:name`) of the last
    /// queued statement.
    pub fn bind_name(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.ensure_live()?;
        if !self.has_statement {
            return Err(Error::Misuse("bind requires a queued statement".into()));
        }
        self.req.put_u8(bind::NAME);
        self.req.put_str(Some(name));
        wire::put_value(&mut self.req, &value.into());
        Ok(())
    }

    /// Execute the queued batch as one framed request and return a cursor
    /// over its result sets, one per queued operation.
    ///
    /// `readonly` batches do not advance the session sequence number and
    /// may be answered by any node; mutating batches advance it and are
    /// applied exactly once even if the request is re-sent across a
    /// reconnect. The queued batch is always consumed, whether this
    /// succeeds or fails.
    pub async fn execute(&mut self, readonly: bool) -> Result<ResultSet<'_>> {
        self.ensure_live()?;
        if !self.has_statement {
            return Err(Error::Misuse("no statement queued; call put() first".into()));
        }

        self.req.put_u8(bind::END);
        self.req.put_u8(flag::OP_END);
        self.req.put_u8(flag::MSG_END);
        self.has_statement = false;

        if !readonly {
            self.seq += 1;
            self.sent_mutation = true;
        }
        wire::finish_client_req(&mut self.req, readonly, self.seq);

        let sent = self.send_request().await;
        self.clear();
        sent?;

        self.read_response_status()?;
        ResultSet::new(&mut self.resp)
    }

    /// Prepare a statement on the server, returning a reusable handle.
    /// Must be the only operation of its batch.
    pub async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        self.ensure_live()?;
        if self.has_statement {
            self.clear();
            return Err(Error::Misuse(
                "prepare must be the only operation in a batch".into(),
            ));
        }

        self.req.put_u8(flag::OP);
        self.req.put_u8(flag::STMT_PREPARE);
        self.req.put_str(Some(sql));
        self.req.put_u8(flag::OP_END);
        self.req.put_u8(flag::MSG_END);

        self.seq += 1;
        self.sent_mutation = true;
        wire::finish_client_req(&mut self.req, false, self.seq);

        let sent = self.send_request().await;
        self.clear();
        sent?;

        self.read_response_status()?;
        if self.resp.get_u8()? != flag::OP {
            return Err(Error::Corrupt("malformed prepare response".into()));
        }
        let _op_len = self.resp.get_u32()?;
        let id = self.resp.get_u64()?;
        if self.resp.get_u8()? != flag::OP_END {
            return Err(Error::Corrupt("malformed prepare response".into()));
        }

        Ok(PreparedStatement {
            id,
            sql: sql.to_owned(),
        })
    }

    /// Delete a prepared statement on the server. Must be the only
    /// operation of its batch.
    pub async fn delete(&mut self, statement: &PreparedStatement) -> Result<()> {
        self.ensure_live()?;
        if self.has_statement {
            self.clear();
            return Err(Error::Misuse(
                "delete prepared must be the only operation in a batch".into(),
            ));
        }

        self.req.put_u8(flag::OP);
        self.req.put_u8(flag::STMT_DEL_PREPARED);
        self.req.put_u64(statement.id);
        self.req.put_u8(flag::OP_END);
        self.req.put_u8(flag::MSG_END);

        self.seq += 1;
        self.sent_mutation = true;
        wire::finish_client_req(&mut self.req, false, self.seq);

        let sent = self.send_request().await;
        self.clear();
        sent?;

        self.read_response_status()?;
        if self.resp.get_u8()? != flag::OP {
            return Err(Error::Corrupt("malformed delete response".into()));
        }
        let _op_len = self.resp.get_u32()?;
        if self.resp.get_u8()? != flag::OP_END {
            return Err(Error::Corrupt("malformed delete response".into()));
        }

        Ok(())
    }

    /// Discard the queued batch without sending it.
    pub fn clear(&mut self) {
        self.req.clear();
        wire::reserve_client_req_header(&mut self.req);
        self.has_statement = false;
    }

    /// Send a best-effort disconnect frame and close the connection.
    /// Idempotent: a second call is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.is_shutdown {
            return Ok(());
        }
        self.is_shutdown = true;

        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        self.resp.clear();
        wire::encode_disconnect_req(&mut self.resp, ResponseCode::Ok.as_u8(), 0);
        let sent = stream.write_all(self.resp.readable()).await;
        drop(stream);

        sent.map_err(Error::Io)
    }

    /// Close the previous statement's bind section before queueing the
    /// next operation.
    fn finish_open_statement(&mut self) {
        if self.has_statement {
            self.req.put_u8(bind::END);
            self.req.put_u8(flag::OP_END);
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_shutdown {
            return Err(Error::Misuse("client is shut down".into()));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("connection dropped");
        }
    }

    /// Read the response tag and status flag, surfacing a server-side SQL
    /// error verbatim.
    fn read_response_status(&mut self) -> Result<()> {
        let _len = self.resp.get_u32()?;
        if self.resp.get_u8()? != tag::CLIENT_RESP {
            return Err(Error::Corrupt("unexpected response type".into()));
        }
        match self.resp.get_u8()? {
            flag::OK => Ok(()),
            flag::ERROR => Err(Error::Sql(self.resp.get_str()?.unwrap_or_default())),
            other => Err(Error::Corrupt(format!(
                "unexpected response status flag: {}",
                other
            ))),
        }
    }

    /// One connect + handshake attempt against the current endpoint.
    /// Advances the endpoint cursor first, so the next attempt targets
    /// the entry after the one that fails here.
    async fn try_connect(&mut self) -> Result<()> {
        let endpoint = self.endpoints[self.endpoint_index].clone();
        self.endpoint_index = (self.endpoint_index + 1) % self.endpoints.len();

        self.disconnect();
        tracing::debug!(endpoint = %endpoint, "connecting");

        let mut stream = timeout(ATTEMPT_TIMEOUT, self.open_socket(&endpoint))
            .await
            .map_err(|_| attempt_timed_out())??;

        // The handshake goes through the response buffer: the request
        // buffer may hold a batch waiting to be re-sent.
        self.resp.clear();
        wire::encode_connect_req(&mut self.resp, &self.cluster_name, &self.client_name);

        timeout(
            ATTEMPT_TIMEOUT,
            Self::exchange_handshake(&mut stream, &mut self.resp),
        )
        .await
        .map_err(|_| attempt_timed_out())??;

        self.resp.flip();
        let frame_len = self.resp.get_u32()?;
        if frame_len as usize != self.resp.limit() {
            return Err(Error::Corrupt("handshake length mismatch".into()));
        }
        if self.resp.get_u8()? != tag::CONNECT_RESP {
            return Err(Error::Corrupt("unexpected handshake response type".into()));
        }

        let rc = ResponseCode::from_u8(self.resp.get_u8()?);
        let server_seq = self.resp.get_u64()?;
        let term = self.resp.get_u64()?;
        let nodes = self.resp.get_str()?.unwrap_or_default();

        // A newer cluster configuration replaces the endpoint list even
        // if this handshake is subsequently rejected.
        if term > self.term {
            let latest: Vec<Endpoint> = nodes
                .split(' ')
                .filter_map(|s| Endpoint::parse(s).ok())
                .collect();
            if !latest.is_empty() {
                tracing::debug!(term, count = latest.len(), "adopting new endpoint list");
                self.endpoints = latest;
                self.term = term;
                self.endpoint_index = 0;
            }
        }

        self.last_rc = Some(rc);
        match rc {
            ResponseCode::Ok => {}
            ResponseCode::ClusterNameMismatch => return Err(Error::ClusterNameMismatch),
            other => {
                tracing::warn!(endpoint = %endpoint, rc = %other, "handshake rejected");
                return Err(Error::Handshake(other));
            }
        }

        // Session continuity. A fresh identity adopts the server's seq;
        // an established one accepts seq (last write applied and
        // acknowledged) or seq - 1 (acknowledgment lost). Anything else
        // means the server no longer holds this session's history.
        if !self.sent_mutation {
            self.seq = server_seq;
        } else if server_seq != self.seq && server_seq != self.seq - 1 {
            tracing::warn!(
                client_seq = self.seq,
                server_seq,
                "session sequence diverged"
            );
            return Err(Error::SessionLost);
        }

        self.stream = Some(stream);
        Ok(())
    }

    /// Open a TCP socket to the endpoint with the configured options.
    async fn open_socket(&self, endpoint: &Endpoint) -> Result<TcpStream> {
        let mut last_err: Option<std::io::Error> = None;

        for addr in lookup_host((endpoint.host.as_str(), endpoint.port)).await? {
            let socket = match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4(),
                SocketAddr::V6(_) => TcpSocket::new_v6(),
            }?;
            socket.set_send_buffer_size(SOCK_BUF_SIZE as u32)?;
            socket.set_recv_buffer_size(SOCK_BUF_SIZE as u32)?;
            if let Some(local) = self.local_addr {
                socket.bind(local)?;
            }

            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no address")
            })
            .into())
    }

    /// Write the encoded connect request and read exactly one response
    /// frame back into `resp`.
    async fn exchange_handshake(stream: &mut TcpStream, resp: &mut FrameBuffer) -> Result<()> {
        stream.write_all(resp.readable()).await?;

        resp.clear();
        loop {
            let n = stream.read(resp.unfilled()).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            resp.advance(n);
            if frame_complete(resp)? {
                return Ok(());
            }
        }
    }

    /// Send the finished request buffer and block until one complete
    /// response frame has been read, reconnecting and re-sending as
    /// needed until the overall deadline expires.
    async fn send_request(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        self.req.flip();

        loop {
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    last_rc: self.last_rc,
                });
            }

            if self.stream.is_none() {
                match self.try_connect().await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::debug!(error = %e, "reconnect attempt failed");
                        continue;
                    }
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                continue;
            };
            if let Err(e) = stream.write_all(self.req.readable()).await {
                tracing::warn!(error = %e, "request write failed");
                self.disconnect();
                continue;
            }

            // Keep the encoded request intact: it is re-sent verbatim if
            // the connection dies before a full response arrives.
            self.req.rewind();
            self.resp.clear();

            loop {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout {
                        last_rc: self.last_rc,
                    });
                }
                let Some(stream) = self.stream.as_mut() else {
                    break;
                };

                let read = timeout(deadline - now, stream.read(self.resp.unfilled())).await;
                let n = match read {
                    Err(_) => {
                        return Err(Error::Timeout {
                            last_rc: self.last_rc,
                        })
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "response read failed");
                        self.disconnect();
                        break;
                    }
                    // A clean close before a full frame is retryable,
                    // like any other broken connection.
                    Ok(Ok(0)) => {
                        self.disconnect();
                        break;
                    }
                    Ok(Ok(n)) => n,
                };

                self.resp.advance(n);
                match frame_complete(&mut self.resp) {
                    Ok(true) => {
                        tracing::trace!(len = self.resp.position(), "response frame complete");
                        self.resp.flip();
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "corrupt response frame");
                        self.disconnect();
                        break;
                    }
                }
            }
            // Fell out of the read loop: retry the whole request against
            // a (possibly different) endpoint.
        }
    }
}

/// Whether the buffer holds exactly one complete frame, growing it when
/// the declared length exceeds the current capacity.
fn frame_complete(buf: &mut FrameBuffer) -> Result<bool> {
    let filled = buf.written().len();
    match wire::declared_len(buf.written()) {
        None => Ok(false),
        Some(declared) if declared < wire::MSG_LEN_SIZE => {
            Err(Error::Corrupt(format!("invalid frame length: {}", declared)))
        }
        Some(declared) if declared == filled => Ok(true),
        Some(declared) if declared < filled => Err(Error::Corrupt(format!(
            "frame length {} shorter than received {}",
            declared, filled
        ))),
        Some(declared) => {
            buf.reserve(declared - filled);
            Ok(false)
        }
    }
}

fn attempt_timed_out() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "connect attempt timed out",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(bytes: &[u8]) -> FrameBuffer {
        let mut buf = FrameBuffer::with_capacity(8);
        for chunk in bytes.chunks(3) {
            let dst = buf.unfilled();
            dst[..chunk.len()].copy_from_slice(chunk);
            buf.advance(chunk.len());
        }
        buf
    }

    #[test]
    fn test_frame_complete_exact_match() {
        let mut buf = frame_of(&[8, 0, 0, 0, 1, 2, 3, 4]);
        assert!(frame_complete(&mut buf).unwrap());
    }

    #[test]
    fn test_frame_complete_partial() {
        let mut buf = frame_of(&[8, 0, 0, 0, 1]);
        assert!(!frame_complete(&mut buf).unwrap());

        let mut buf = frame_of(&[8, 0]);
        assert!(!frame_complete(&mut buf).unwrap());
    }

    #[test]
    fn test_frame_complete_grows_for_large_declared_length() {
        let mut buf = frame_of(&[0, 40, 0, 0]); // declares 10240 bytes
        assert!(!frame_complete(&mut buf).unwrap());
        assert!(buf.capacity() >= 10240);
    }

    #[test]
    fn test_frame_complete_rejects_bogus_lengths() {
        let mut buf = frame_of(&[2, 0, 0, 0]); // shorter than the field itself
        assert!(frame_complete(&mut buf).is_err());

        let mut buf = frame_of(&[5, 0, 0, 0, 1, 2]); // trailing bytes
        assert!(frame_complete(&mut buf).is_err());
    }
}
