//! Faktory work-server client over plain TCP.
//!
//! Commands are single lines (`VERB args\r\n`); replies use the RESP
//! encoding: `+OK`, `-ERR message`, `$<len>` bulk strings and `:<n>` integers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{JobServerClient, ServerJob};
use crate::{QueueError, QueueResult};

/// One decoded server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Bulk(Option<String>),
    Integer(i64),
    Error(String),
}

/// Read one reply from the server
pub async fn read_reply<R>(reader: &mut R) -> QueueResult<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(QueueError::Connection("job server closed the connection".to_string()));
    }

    let line = line.trim_end_matches(['\r', '\n']);
    let Some(kind) = line.chars().next() else {
        return Err(QueueError::Protocol("empty reply line".to_string()));
    };
    let rest = &line[kind.len_utf8()..];

    match kind {
        '+' => Ok(Reply::Simple(rest.to_string())),
        '-' => Ok(Reply::Error(rest.to_string())),
        ':' => rest
            .parse()
            .map(Reply::Integer)
            .map_err(|_| QueueError::Protocol(format!("bad integer reply `{}`", rest))),
        '$' => {
            let len: i64 = rest
                .parse()
                .map_err(|_| QueueError::Protocol(format!("bad bulk length `{}`", rest)))?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }

            let len = usize::try_from(len)
                .map_err(|_| QueueError::Protocol(format!("bad bulk length `{}`", rest)))?;
            let mut buf = vec![0; len + 2];
            reader.read_exact(&mut buf).await?;
            buf.truncate(len);

            String::from_utf8(buf)
                .map(|s| Reply::Bulk(Some(s)))
                .map_err(|e| QueueError::Protocol(format!("bulk reply is not utf-8: {}", e)))
        }
        other => Err(QueueError::Protocol(format!("unknown reply type `{}`", other))),
    }
}

#[derive(Debug, Deserialize)]
struct Hi {
    #[serde(default)]
    v: u32,
    /// Password salt; present only when the server requires authentication
    s: Option<String>,
}

#[derive(Debug, Serialize)]
struct Hello<'a> {
    hostname: &'a str,
    wid: &'a str,
    pid: u32,
    labels: [&'a str; 1],
    v: u32,
}

/// Faktory protocol client
///
/// One connection, used by one command at a time. An I/O failure drops the
/// connection; the next `connect` opens a fresh one.
pub struct FaktoryClient {
    address: String,
    hostname: String,
    wid: String,
    conn: Mutex<Option<BufStream<TcpStream>>>,
}

impl FaktoryClient {
    pub fn new(address: impl Into<String>, hostname: Option<String>) -> Self {
        Self {
            address: address.into(),
            hostname: hostname.unwrap_or_else(|| "relay-worker".to_string()),
            wid: Uuid::new_v4().simple().to_string(),
            conn: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn handshake(&self, stream: &mut BufStream<TcpStream>) -> QueueResult<()> {
        let greeting = match read_reply(stream).await? {
            Reply::Simple(greeting) => greeting,
            other => return Err(unexpected("HI", other)),
        };

        let hi: Hi = greeting
            .strip_prefix("HI ")
            .ok_or_else(|| QueueError::Protocol(format!("unexpected greeting `{}`", greeting)))
            .and_then(|body| serde_json::from_str(body).map_err(QueueError::from))?;

        if hi.s.is_some() {
            return Err(QueueError::Configuration(
                "job server requires password authentication, which this client does not support"
                    .to_string(),
            ));
        }
        debug!("Job server greeted with protocol version {}", hi.v);

        let hello = serde_json::to_string(&Hello {
            hostname: &self.hostname,
            wid: &self.wid,
            pid: std::process::id(),
            labels: ["rust"],
            v: 2,
        })?;

        match round_trip(stream, &format!("HELLO {}", hello)).await? {
            Reply::Simple(ok) if ok == "OK" => Ok(()),
            other => Err(unexpected("HELLO", other)),
        }
    }

    async fn command(&self, line: &str) -> QueueResult<Reply> {
        let mut conn = self.conn.lock().await;
        let stream = conn
            .as_mut()
            .ok_or_else(|| QueueError::Connection("job server client is not connected".to_string()))?;

        let result = round_trip(stream, line).await;
        if matches!(result, Err(QueueError::Connection(_))) {
            *conn = None;
        }
        result
    }

    async fn expect_ok(&self, verb: &str, line: &str) -> QueueResult<()> {
        match self.command(line).await? {
            Reply::Simple(ok) if ok == "OK" => Ok(()),
            other => Err(unexpected(verb, other)),
        }
    }

    /// ACK and FAIL errors mean the server no longer holds the reservation
    async fn acknowledge(&self, verb: &str, line: &str) -> QueueResult<()> {
        match self.command(line).await? {
            Reply::Simple(ok) if ok == "OK" => Ok(()),
            Reply::Error(message) => Err(QueueError::StaleClaim(message)),
            other => Err(unexpected(verb, other)),
        }
    }
}

async fn round_trip(stream: &mut BufStream<TcpStream>, line: &str) -> QueueResult<Reply> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    read_reply(stream).await
}

fn unexpected(verb: &str, reply: Reply) -> QueueError {
    match reply {
        Reply::Error(message) => QueueError::Protocol(format!("{} rejected: {}", verb, message)),
        other => QueueError::Protocol(format!("unexpected reply to {}: {:?}", verb, other)),
    }
}

#[async_trait]
impl JobServerClient for FaktoryClient {
    async fn connect(&self) -> QueueResult<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Ok(());
        }

        let tcp = TcpStream::connect(&self.address).await.map_err(|e| {
            QueueError::Connection(format!("cannot reach job server at {}: {}", self.address, e))
        })?;
        let mut stream = BufStream::new(tcp);
        self.handshake(&mut stream).await?;

        info!("Connected to job server at {}", self.address);
        *conn = Some(stream);
        Ok(())
    }

    async fn disconnect(&self) -> QueueResult<()> {
        let mut conn = self.conn.lock().await;
        if let Some(mut stream) = conn.take() {
            // The server may already be gone; closing is best effort.
            let _ = stream.write_all(b"END\r\n").await;
            let _ = stream.flush().await;
        }
        Ok(())
    }

    async fn push(&self, job: ServerJob) -> QueueResult<()> {
        let body = serde_json::to_string(&job)?;
        self.expect_ok("PUSH", &format!("PUSH {}", body)).await
    }

    async fn fetch(&self, queues: &[&str]) -> QueueResult<Option<ServerJob>> {
        match self.command(&format!("FETCH {}", queues.join(" "))).await? {
            Reply::Bulk(None) => Ok(None),
            Reply::Bulk(Some(body)) => Ok(Some(serde_json::from_str(&body)?)),
            other => Err(unexpected("FETCH", other)),
        }
    }

    async fn ack(&self, jid: &str) -> QueueResult<()> {
        let body = json!({ "jid": jid });
        self.acknowledge("ACK", &format!("ACK {}", body)).await
    }

    async fn fail(&self, jid: &str, errtype: &str, message: &str) -> QueueResult<()> {
        let body = json!({ "jid": jid, "errtype": errtype, "message": message });
        self.acknowledge("FAIL", &format!("FAIL {}", body)).await
    }

    async fn queue_size(&self, queue: &str) -> QueueResult<u64> {
        let info = match self.command("INFO").await? {
            Reply::Bulk(Some(body)) => serde_json::from_str::<Value>(&body)?,
            other => return Err(unexpected("INFO", other)),
        };

        Ok(info
            .pointer("/faktory/queues")
            .and_then(|queues| queues.get(queue))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn clear_queue(&self, queue: &str) -> QueueResult<()> {
        self.expect_ok("QUEUE REMOVE", &format!("QUEUE REMOVE {}", queue)).await
    }
}
