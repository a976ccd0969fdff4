use crate::error::{KvsError, Result};
use crate::protocol::{Entry, Reply, Request, decode_reply, encode_request, read_frame, write_frame};
use parking_lot::Mutex;
use skein::pmi::{Pmi, Pmix, local_hostname};
use skein::types::Rank;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// How long [`KvsClient::connect`] keeps retrying a refused connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Blocking client of a [`KvsServer`](crate::KvsServer).
///
/// Owns a `tokio::runtime::Runtime` and calls `block_on()` for each request,
/// so it can serve as the synchronous [`Pmi`] boundary of a transport.
pub struct KvsClient {
    rank: Rank,
    size: usize,
    hostname: Option<String>,
    stream: tokio::sync::Mutex<TcpStream>,
    staged: Mutex<Vec<Entry>>,
    rt: tokio::runtime::Runtime,
}

impl KvsClient {
    /// Join the job served at `addr` as `rank` of `size`.
    pub fn connect(addr: SocketAddr, rank: Rank, size: usize) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let mut stream = rt.block_on(connect_with_retry(addr))?;

        let hello = Request::Hello {
            rank,
            size: size as u32,
        };
        match rt.block_on(roundtrip(&mut stream, &hello))? {
            Reply::Ok => {}
            Reply::Error(msg) => return Err(KvsError::Rejected(msg)),
            other => return Err(KvsError::Protocol(format!("unexpected hello reply {other:?}"))),
        }
        tracing::debug!(%addr, rank, size, "joined kvs");

        Ok(Self {
            rank,
            size,
            hostname: None,
            stream: tokio::sync::Mutex::new(stream),
            staged: Mutex::new(Vec::new()),
            rt,
        })
    }

    /// Report `host` instead of this machine's name.
    pub fn with_hostname(mut self, host: impl Into<String>) -> Self {
        self.hostname = Some(host.into());
        self
    }

    fn call(&self, req: &Request) -> Result<Reply> {
        self.rt.block_on(async {
            let mut stream = self.stream.lock().await;
            roundtrip(&mut stream, req).await
        })
    }

    fn expect_ok(&self, req: &Request) -> Result<()> {
        match self.call(req)? {
            Reply::Ok => Ok(()),
            other => Err(unexpected(req, other)),
        }
    }

    fn expect_value(&self, req: &Request, key: &str) -> Result<Vec<u8>> {
        match self.call(req)? {
            Reply::Value(v) => Ok(v),
            Reply::NotFound => Err(KvsError::NotFound {
                key: key.to_string(),
            }),
            other => Err(unexpected(req, other)),
        }
    }

    fn sync(&self, req: &Request) -> Result<u64> {
        match self.call(req)? {
            Reply::Released(generation) => Ok(generation),
            other => Err(unexpected(req, other)),
        }
    }
}

fn unexpected(req: &Request, reply: Reply) -> KvsError {
    match reply {
        Reply::Error(msg) => KvsError::Rejected(msg),
        other => KvsError::Protocol(format!("unexpected reply {other:?} to {req:?}")),
    }
}

async fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::ConnectionRefused
                    && tokio::time::Instant::now() < deadline =>
            {
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn roundtrip(stream: &mut TcpStream, req: &Request) -> Result<Reply> {
    write_frame(stream, &encode_request(req)?).await?;
    let payload = read_frame(stream).await?.ok_or(KvsError::Closed)?;
    decode_reply(&payload)
}

impl Pmi for KvsClient {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> skein::Result<()> {
        self.sync(&Request::Barrier)?;
        Ok(())
    }

    fn kvs_put(&self, key: &str, value: &[u8]) -> skein::Result<()> {
        self.expect_ok(&Request::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })?;
        Ok(())
    }

    fn kvs_get(&self, key: &str) -> skein::Result<Vec<u8>> {
        let req = Request::Get {
            key: key.to_string(),
        };
        Ok(self.expect_value(&req, key)?)
    }

    fn hostname(&self) -> skein::Result<String> {
        match &self.hostname {
            Some(h) => Ok(h.clone()),
            None => local_hostname(),
        }
    }

    fn pmix(&self) -> Option<&dyn Pmix> {
        Some(self)
    }
}

impl Pmix for KvsClient {
    fn put(&self, key: &str, value: &[u8]) -> skein::Result<()> {
        self.staged.lock().push(Entry {
            key: key.to_string(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn commit(&self) -> skein::Result<()> {
        let entries = std::mem::take(&mut *self.staged.lock());
        let count = entries.len();
        self.expect_ok(&Request::Commit {
            rank: self.rank,
            entries,
        })?;
        tracing::trace!(rank = self.rank, count, "committed");
        Ok(())
    }

    fn fence(&self) -> skein::Result<()> {
        self.sync(&Request::Fence)?;
        Ok(())
    }

    fn get(&self, rank: Rank, key: &str) -> skein::Result<Vec<u8>> {
        let req = Request::GetCommitted {
            rank,
            key: key.to_string(),
        };
        Ok(self.expect_value(&req, key)?)
    }
}

impl std::fmt::Debug for KvsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvsClient")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("hostname", &self.hostname)
            .finish()
    }
}
